mod feed;

use anyhow::Context;
use bridge::{Bus, QosProfile, names};
use common::{ServiceIdentity, TelemetryGuard, setup_logging};
use controller::{NodeConfig, YoloNode};
use inference::backend::ort::OrtLoader;
use schema::DetectionArray;
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    flag,
};
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

const SPIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Prints every detection batch as one JSON line on stdout.
fn spawn_printer(
    bus: &Bus,
    namespace: &str,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<thread::JoinHandle<()>> {
    let topic = names::resolve(namespace, names::DETECTIONS_TOPIC)?;
    let subscription = bus.subscribe::<DetectionArray>(&topic, QosProfile::default())?;

    Ok(thread::Builder::new()
        .name("detection-printer".to_string())
        .spawn(move || {
            let stdout = std::io::stdout();
            while !shutdown.load(Ordering::Relaxed) {
                let Some(batch) = subscription.recv_timeout(SPIN_TIMEOUT) else {
                    continue;
                };
                let line = serde_json::json!({
                    "received_at": chrono::Utc::now().to_rfc3339(),
                    "batch": batch,
                });
                if let Err(e) = writeln!(stdout.lock(), "{}", line) {
                    tracing::warn!(error = %e, "Failed to write detections");
                }
            }
        })?)
}

fn main() -> anyhow::Result<()> {
    let config = NodeConfig::from_env();

    // TelemetryGuard needs a Tokio runtime for the OTLP exporters and must
    // outlive it. It installs its own subscriber.
    let (_telemetry, _runtime) = if let Some(endpoint) = config.otel_endpoint.as_ref() {
        let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
        let identity = ServiceIdentity {
            name: "yolo-node",
            namespace: &config.namespace,
        };
        let guard = rt.block_on(async {
            TelemetryGuard::init(identity, endpoint, config.log_level, config.environment)
        })?;
        (Some(guard), Some(rt))
    } else {
        setup_logging(config.log_level, config.environment);
        (None, None)
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGTERM, Arc::clone(&shutdown))?;
    flag::register(SIGINT, Arc::clone(&shutdown))?;
    tracing::info!("Signal handlers registered (SIGTERM, SIGINT)");

    let bus = Bus::new();
    let namespace = config.namespace.clone();
    let printer = spawn_printer(&bus, &namespace, Arc::clone(&shutdown))?;

    let loader = OrtLoader::new(config.labels_path.clone());
    let auto_activate = config.auto_activate;
    let mut node = YoloNode::new(bus.clone(), loader, config);
    tracing::info!(parameters = ?node.parameters(), "Node starting");

    node.configure().context("Failed to configure node")?;
    if !auto_activate {
        tracing::info!("Auto-activation disabled, node stays inactive");
    }

    let feed = feed::spawn(
        &bus,
        &namespace,
        feed::FeedConfig::from_env(),
        Arc::clone(&shutdown),
    )?;

    while !shutdown.load(Ordering::Relaxed) {
        node.spin_once(SPIN_TIMEOUT);
    }

    tracing::info!("Shutdown requested");
    node.shutdown().context("Failed to shut down node")?;

    for (name, handle) in [("image-feed", feed), ("detection-printer", printer)] {
        if handle.join().is_err() {
            tracing::error!(thread = name, "Worker thread panicked");
        }
    }
    Ok(())
}
