use std::{env, fs::File, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use log::{error, info};
use simplelog::{LevelFilter, WriteLogger};

use zoomimage::tiles::grid::{calculate_preferred_tile_size, tile_grid_size_map};
use zoomimage::tiles::{TileState, Viewport};
use zoomimage::{
    EngineEvent, FileImageSource, ImageSource, IntRect, IntSize, SubsamplingConfig,
    SubsamplingEngine, SubsamplingStatus,
};

const USAGE: &str = "Usage: zoomimage <image> [--config <file.json>] [--viewport WxH] \
                     [--scale S] [--visible l,t,r,b] [--timeout-ms N]";

#[derive(Debug, PartialEq)]
struct Options {
    image_path: String,
    config_path: Option<String>,
    container_size: IntSize,
    scale: f32,
    visible_rect: Option<IntRect>,
    timeout: Duration,
}

fn main() -> Result<()> {
    WriteLogger::init(
        LevelFilter::Debug,
        simplelog::ConfigBuilder::new()
            .set_max_level(LevelFilter::Debug)
            .build(),
        File::create("zoomimage.log")?,
    )?;
    human_panic::setup_panic!();

    let args: Vec<String> = env::args().skip(1).collect();
    let options = parse_args(&args)?;
    info!("Running tile report for {}", options.image_path);

    let result = run_report(&options);
    if let Err(err) = &result {
        error!("Tile report failed: {err:?}");
    }
    result
}

fn parse_args(args: &[String]) -> Result<Options> {
    let mut options = Options {
        image_path: String::new(),
        config_path: None,
        container_size: IntSize::new(1080, 1920),
        scale: 1.0,
        visible_rect: None,
        timeout: Duration::from_secs(30),
    };

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = |name: &str| iter.next().with_context(|| format!("{name} needs a value\n{USAGE}"));
        match arg.as_str() {
            "--config" => options.config_path = Some(value("--config")?.clone()),
            "--viewport" => options.container_size = parse_size(value("--viewport")?)?,
            "--scale" => {
                options.scale = value("--scale")?
                    .parse()
                    .context("--scale must be a number")?;
                if !(options.scale > 0.0) {
                    bail!("--scale must be positive");
                }
            }
            "--visible" => options.visible_rect = Some(parse_rect(value("--visible")?)?),
            "--timeout-ms" => {
                let millis: u64 = value("--timeout-ms")?
                    .parse()
                    .context("--timeout-ms must be an integer")?;
                options.timeout = Duration::from_millis(millis);
            }
            flag if flag.starts_with("--") => bail!("Unknown option {flag}\n{USAGE}"),
            path if options.image_path.is_empty() => options.image_path = path.to_string(),
            extra => bail!("Unexpected argument {extra}\n{USAGE}"),
        }
    }

    if options.image_path.is_empty() {
        bail!("{USAGE}");
    }
    Ok(options)
}

fn parse_size(text: &str) -> Result<IntSize> {
    let (width, height) = text
        .split_once('x')
        .with_context(|| format!("Size '{text}' is not WxH"))?;
    let size = IntSize::new(
        width.trim().parse().context("Invalid width")?,
        height.trim().parse().context("Invalid height")?,
    );
    if size.is_empty() {
        bail!("Size '{text}' is empty");
    }
    Ok(size)
}

fn parse_rect(text: &str) -> Result<IntRect> {
    let values = text
        .split(',')
        .map(|part| part.trim().parse::<i32>())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Rect '{text}' is not l,t,r,b"))?;
    let [left, top, right, bottom] = values[..] else {
        bail!("Rect '{text}' needs four values");
    };
    Ok(IntRect::new(left, top, right, bottom))
}

fn run_report(options: &Options) -> Result<()> {
    let config = match &options.config_path {
        Some(path) => SubsamplingConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {path}"))?,
        None => SubsamplingConfig::default(),
    };
    let engine = SubsamplingEngine::new(config.clone()).context("Failed to start engine")?;
    let events = engine.subscribe();

    let source: Arc<dyn ImageSource> = Arc::new(FileImageSource::new(&options.image_path));
    println!("Source: {}", source.key());
    engine.set_image_source(Some(source));

    let image_info = loop {
        match events.recv_timeout(options.timeout) {
            Ok(EngineEvent::Ready(image_info)) => break image_info,
            Ok(EngineEvent::Unavailable(err)) => {
                println!("Subsampling unavailable: {err}");
                return Ok(());
            }
            Ok(EngineEvent::TilesChanged { .. }) => {}
            Err(_) => bail!("Timed out reading image info"),
        }
    };
    println!("Image: {}", image_info.to_short_string());

    let mut viewport = Viewport::fit(options.container_size, image_info.size);
    viewport.scale = options.scale;
    if let Some(visible_rect) = options.visible_rect {
        viewport.visible_rect = visible_rect;
    }
    println!(
        "Viewport: container {} content {} scale {} visible {}",
        viewport.container_size, viewport.content_size, viewport.scale, viewport.visible_rect
    );

    let tile_size = calculate_preferred_tile_size(
        viewport.container_size,
        config.min_tile_size,
        config.max_tile_size,
    );
    println!("Tile size: {tile_size}");
    for (sample_size, grid) in tile_grid_size_map(image_info.size, tile_size) {
        println!("  sample {sample_size:>4}: {}x{} tiles", grid.columns, grid.rows);
    }

    engine.set_viewport(viewport);
    let settled = wait_for_settled(&engine, &events, options.timeout);

    match engine.status() {
        SubsamplingStatus::NotNeeded => {
            println!("Subsampling not needed at this viewport");
            return Ok(());
        }
        SubsamplingStatus::Unavailable(err) => {
            println!("Subsampling unavailable: {err}");
            return Ok(());
        }
        _ => {}
    }
    if !settled {
        println!("Warning: tiles still loading after {:?}", options.timeout);
    }

    let tiles = engine.current_tiles();
    println!(
        "Snapshot v{}: sample size {} load rect {}",
        tiles.version, tiles.sample_size, tiles.image_load_rect
    );
    for tile in &tiles.foreground {
        let pixels = tile
            .bitmap
            .as_ref()
            .map(|bitmap| format!("{}x{}", bitmap.width(), bitmap.height()))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {} {} {:?} {pixels}",
            tile.coordinate, tile.src_rect, tile.state
        );
    }
    println!(
        "Loaded {}/{} tiles, {} background",
        tiles.loaded_count(),
        tiles.foreground.len(),
        tiles.background.len()
    );
    let stats = engine.pool_stats();
    println!(
        "Bitmap pool: {} hits, {} misses, {} recycled, {} dropped",
        stats.hits, stats.misses, stats.recycled, stats.dropped
    );
    info!("Tile report finished for {}", options.image_path);
    Ok(())
}

/// Wait until no foreground tile is pending, or the image turns out not to need tiles.
fn wait_for_settled(
    engine: &SubsamplingEngine,
    events: &std::sync::mpsc::Receiver<EngineEvent>,
    timeout: Duration,
) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        match engine.status() {
            SubsamplingStatus::NotNeeded | SubsamplingStatus::Unavailable(_) => return true,
            _ => {}
        }
        let tiles = engine.current_tiles();
        let pending = tiles.count_in_state(TileState::Loading) + tiles.count_in_state(TileState::Initialized);
        if !tiles.foreground.is_empty() && pending == 0 {
            return true;
        }
        let Some(remaining) = deadline.checked_duration_since(std::time::Instant::now()) else {
            return false;
        };
        // Any event means something changed; re-check either way
        let _ = events.recv_timeout(remaining.min(Duration::from_millis(100)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args_defaults() {
        let options = parse_args(&args(&["photo.jpg"])).unwrap();
        assert_eq!(options.image_path, "photo.jpg");
        assert_eq!(options.container_size, IntSize::new(1080, 1920));
        assert_eq!(options.scale, 1.0);
        assert_eq!(options.visible_rect, None);
    }

    #[test]
    fn test_parse_args_all_options() {
        let options = parse_args(&args(&[
            "--viewport",
            "1000x1000",
            "big.png",
            "--scale",
            "4",
            "--visible",
            "3000,500,5000,1000",
            "--config",
            "zoom.json",
            "--timeout-ms",
            "500",
        ]))
        .unwrap();
        assert_eq!(options.image_path, "big.png");
        assert_eq!(options.container_size, IntSize::new(1000, 1000));
        assert_eq!(options.scale, 4.0);
        assert_eq!(options.visible_rect, Some(IntRect::new(3000, 500, 5000, 1000)));
        assert_eq!(options.config_path.as_deref(), Some("zoom.json"));
        assert_eq!(options.timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_parse_args_errors() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["a.jpg", "b.jpg"])).is_err());
        assert!(parse_args(&args(&["a.jpg", "--scale"])).is_err());
        assert!(parse_args(&args(&["a.jpg", "--scale", "-1"])).is_err());
        assert!(parse_args(&args(&["a.jpg", "--frobnicate"])).is_err());
        assert!(parse_rect("1,2,3").is_err());
        assert!(parse_size("100").is_err());
        assert!(parse_size("0x10").is_err());
    }
}
