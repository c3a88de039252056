pub mod fake_decoder;

pub use fake_decoder::FakeDecoderFactory;
pub use test_helpers::{FlakySource, png_bytes, wait_for_event, wait_until, write_test_png};

pub mod test_helpers {
    use crate::engine::EngineEvent;
    use crate::image_source::ImageSource;
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::{self, Cursor, Read};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::Receiver;
    use std::thread;
    use std::time::{Duration, Instant};

    /// Pixels encode their own coordinates, so any crop can be checked exactly
    pub fn gradient_image(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, ((x / 256 + y / 256) % 256) as u8, 255])
        })
    }

    pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = Cursor::new(Vec::new());
        gradient_image(width, height)
            .write_to(&mut bytes, ImageFormat::Png)
            .unwrap();
        bytes.into_inner()
    }

    pub fn write_test_png(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
        let path = dir.join(name);
        gradient_image(width, height).save(&path).unwrap();
        path
    }

    /// In-memory source whose first `failures` opens fail
    #[derive(Debug)]
    pub struct FlakySource {
        key: String,
        bytes: Vec<u8>,
        failures: usize,
        opens: AtomicUsize,
    }

    impl FlakySource {
        pub fn new(key: &str, bytes: Vec<u8>, failures: usize) -> Self {
            Self {
                key: format!("flaky://{key}"),
                bytes,
                failures,
                opens: AtomicUsize::new(0),
            }
        }

        pub fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    impl ImageSource for FlakySource {
        fn key(&self) -> &str {
            &self.key
        }

        fn open_source(&self) -> io::Result<Box<dyn Read + Send>> {
            let attempt = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.failures {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} not reachable (attempt {attempt})", self.key),
                ));
            }
            Ok(Box::new(Cursor::new(self.bytes.clone())))
        }
    }

    /// First event matching `predicate`, skipping the others
    pub fn wait_for_event(
        events: &Receiver<EngineEvent>,
        timeout: Duration,
        predicate: impl Fn(&EngineEvent) -> bool,
    ) -> Option<EngineEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let event = events.recv_timeout(remaining).ok()?;
            if predicate(&event) {
                return Some(event);
            }
        }
    }

    /// Poll `condition` until it holds or `timeout` passes
    pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }
}
