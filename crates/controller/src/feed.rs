use anyhow::Context;
use bridge::{Bus, QosProfile, names};
use schema::{Header, Image, Time};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Replays image files onto the image topic, standing in for a camera driver.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub pattern: String,
    pub interval_ms: u64,
    pub frame_id: String,
    pub repeat: bool,
}

impl FeedConfig {
    pub fn from_env() -> Self {
        Self {
            pattern: env::var("IMAGE_GLOB").unwrap_or_else(|_| "images/*.jpg".to_string()),
            interval_ms: env::var("FEED_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(100),
            frame_id: env::var("FRAME_ID").unwrap_or_else(|_| "camera".to_string()),
            repeat: env::var("FEED_REPEAT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(false),
        }
    }
}

fn load_bgr(path: &Path, header: Header) -> anyhow::Result<Image> {
    let rgb = image::open(path)
        .with_context(|| format!("Failed to decode {}", path.display()))?
        .to_rgb8();
    let (width, height) = rgb.dimensions();
    let data = rgb
        .pixels()
        .flat_map(|image::Rgb([r, g, b])| [*b, *g, *r])
        .collect();
    Ok(Image::new(header, width, height, "bgr8", width * 3, data))
}

pub fn spawn(
    bus: &Bus,
    namespace: &str,
    config: FeedConfig,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<JoinHandle<()>> {
    let paths: Vec<PathBuf> = glob::glob(&config.pattern)
        .with_context(|| format!("Invalid image pattern '{}'", config.pattern))?
        .filter_map(Result::ok)
        .collect();
    if paths.is_empty() {
        tracing::warn!(pattern = %config.pattern, "No images matched, feed is idle");
    }

    let topic = names::resolve(namespace, names::IMAGE_TOPIC)?;
    let publisher = bus.publisher::<Image>(&topic, QosProfile::keep_last(1))?;
    let interval = Duration::from_millis(config.interval_ms);

    let handle = thread::Builder::new()
        .name("image-feed".to_string())
        .spawn(move || {
            tracing::info!(images = paths.len(), topic = %topic, "Image feed started");
            'feed: loop {
                for path in &paths {
                    if shutdown.load(Ordering::Relaxed) {
                        break 'feed;
                    }
                    let header = Header::new(config.frame_id.clone(), Time::now());
                    match load_bgr(path, header) {
                        Ok(image) => {
                            publisher.publish(image);
                        }
                        Err(e) => tracing::warn!(error = %e, "Skipping image"),
                    }
                    thread::sleep(interval);
                }
                if !config.repeat || paths.is_empty() {
                    break;
                }
            }
            tracing::info!("Image feed finished");
        })?;
    Ok(handle)
}
