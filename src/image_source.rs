use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Opens the bytes of one logical image.
///
/// The key identifies the image content. It is part of every tile cache key,
/// so two sources with the same key must produce the same pixels.
pub trait ImageSource: Send + Sync + fmt::Debug {
    fn key(&self) -> &str;

    fn open_source(&self) -> io::Result<Box<dyn Read + Send>>;

    /// Read the whole source into memory
    fn read_all(&self) -> io::Result<Vec<u8>> {
        let mut reader = self.open_source()?;
        let mut buffer = Vec::new();
        reader.read_to_end(&mut buffer)?;
        Ok(buffer)
    }
}

#[derive(Debug, Clone)]
pub struct FileImageSource {
    path: PathBuf,
    key: String,
}

impl FileImageSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let key = format!("file://{}", path.to_string_lossy());
        Self { path, key }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ImageSource for FileImageSource {
    fn key(&self) -> &str {
        &self.key
    }

    fn open_source(&self) -> io::Result<Box<dyn Read + Send>> {
        let file = File::open(&self.path)?;
        Ok(Box::new(BufReader::new(file)))
    }
}

/// In-memory image bytes, keyed by their md5 digest
#[derive(Clone)]
pub struct ByteArrayImageSource {
    bytes: Arc<[u8]>,
    key: String,
}

impl ByteArrayImageSource {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes = bytes.into();
        let key = format!("bytes://{:x}", md5::compute(&bytes[..]));
        Self { bytes, key }
    }
}

impl fmt::Debug for ByteArrayImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteArrayImageSource")
            .field("key", &self.key)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl ImageSource for ByteArrayImageSource {
    fn key(&self) -> &str {
        &self.key
    }

    fn open_source(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(ArcBytes(self.bytes.clone()))))
    }

    fn read_all(&self) -> io::Result<Vec<u8>> {
        Ok(self.bytes.to_vec())
    }
}

struct ArcBytes(Arc<[u8]>);

impl AsRef<[u8]> for ArcBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
