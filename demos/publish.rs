//! Installs the InfluxDB publisher as the global recorder and records a few metrics until Ctrl+C.
//!
//! Point it at a server with `INFLUX_URI`, and `INFLUX_TOKEN`, `INFLUX_ORG` and `INFLUX_BUCKET` for
//! a 2.x server or `INFLUX_DB` for a 1.x one. The dialect is detected on the first publish.

use metrics_influx_publisher::{InfluxConfig, InfluxRegistry};
use std::time::Duration;

fn config() -> InfluxConfig {
    match InfluxConfig::from_env() {
        Ok(config) => config.step(Duration::from_secs(5)),
        Err(e) => {
            eprintln!("Ignoring invalid INFLUX_* settings: {e}");
            InfluxConfig::default().step(Duration::from_secs(5))
        }
    }
}

#[cfg(not(feature = "tokio"))]
fn main() {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread,
    };

    let publisher = InfluxRegistry::builder(config())
        .install()
        .expect("Failed to install InfluxDB publisher");

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    // Handle Ctrl+C to exit gracefully.
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl-C handler");

    println!("Publishing metrics every 5s. Press Ctrl+C to exit.");

    let mut tick = 0u32;
    while running.load(Ordering::SeqCst) {
        metrics::counter!("demo.ticks").increment(1);
        metrics::gauge!("demo.phase", "shape" => "sawtooth").set(f64::from(tick % 10));
        metrics::histogram!("demo.work.duration").record(f64::from(tick % 7) * 1.5);
        tick += 1;
        thread::sleep(Duration::from_millis(250));
    }

    println!("Flushing and shutting down.");
    publisher.stop();
}

#[cfg(feature = "tokio")]
#[tokio::main]
async fn main() {
    let publisher = InfluxRegistry::builder(config())
        .install()
        .expect("Failed to install InfluxDB publisher");

    let recording = tokio::spawn(async {
        let mut tick = 0u32;
        let mut interval = tokio::time::interval(Duration::from_millis(250));
        loop {
            interval.tick().await;
            metrics::counter!("demo.ticks").increment(1);
            metrics::gauge!("demo.phase", "shape" => "sawtooth").set(f64::from(tick % 10));
            tick += 1;
        }
    });

    println!("Publishing metrics every 5s. Press Ctrl+C to exit.");

    let (stop, stopped) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop.send(());
    })
    .expect("Error setting Ctrl-C handler");
    tokio::task::spawn_blocking(move || stopped.recv())
        .await
        .expect("Ctrl-C listener panicked")
        .expect("Ctrl-C handler dropped");

    recording.abort();
    println!("Flushing and shutting down.");
    publisher.stop().await;
}
