use crate::{
    error::InstallError,
    registry::{InfluxRegistry, InfluxRegistryBuilder},
};
use std::{sync::Arc, time::Duration};
#[cfg(not(feature = "tokio"))]
use std::{
    sync::mpsc::{self, RecvTimeoutError},
    thread::{self, JoinHandle},
};
#[cfg(feature = "tokio")]
use tokio::{
    sync::oneshot,
    task::{self, JoinHandle},
    time::{self, Instant},
};

const MIN_STEP: Duration = Duration::from_millis(1);

fn publish_logged(registry: &InfluxRegistry) {
    match registry.publish() {
        Ok(summary) => log::trace!("Publish cycle finished: {summary:?}"),
        Err(e) => log::warn!("Failed to publish metrics to InfluxDB: {e}"),
    }
}

/// Controls a running publisher. Dropping the handle stops it after one last publish.
#[derive(Debug)]
pub struct PublisherHandle {
    #[cfg(not(feature = "tokio"))]
    stop: mpsc::Sender<()>,
    #[cfg(feature = "tokio")]
    stop: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl PublisherHandle {
    /// Stops publishing, waiting for the final publish to finish.
    #[cfg(not(feature = "tokio"))]
    pub fn stop(mut self) {
        let _ = self.stop.send(());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("InfluxDB publisher thread panicked");
            }
        }
    }

    /// Stops publishing, waiting for the final publish to finish.
    #[cfg(feature = "tokio")]
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                log::error!("InfluxDB publisher task failed: {e}");
            }
        }
    }
}

impl InfluxRegistry {
    /// Publishes every `step` on a background thread until the handle is stopped or dropped,
    /// then publishes once more.
    ///
    /// # Example
    /// ```no_run
    /// use std::sync::Arc;
    /// use metrics_influx_publisher::{InfluxConfig, InfluxRecorder, InfluxRegistry};
    ///
    /// let recorder = InfluxRecorder::default();
    /// let registry = InfluxRegistry::builder(InfluxConfig::default().token("my-token"))
    ///     .build(recorder.clone())
    ///     .unwrap();
    /// let publisher = Arc::new(registry).start().unwrap();
    /// publisher.stop();
    /// ```
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned.
    #[cfg(not(feature = "tokio"))]
    pub fn start(self: Arc<Self>) -> Result<PublisherHandle, InstallError> {
        let step = self.config().step.max(MIN_STEP);
        let (stop, stopped) = mpsc::channel();

        let worker = thread::Builder::new()
            .name("influx-publisher".into())
            .spawn(move || {
                loop {
                    match stopped.recv_timeout(step) {
                        Err(RecvTimeoutError::Timeout) => publish_logged(&self),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                publish_logged(&self);
            })?;

        Ok(PublisherHandle {
            stop,
            worker: Some(worker),
        })
    }

    /// Publishes every `step` on a Tokio task until the handle is stopped or dropped,
    /// then publishes once more. Cycles run on the blocking pool.
    ///
    /// # Errors
    /// Never fails; the signature matches the threaded publisher.
    #[cfg(feature = "tokio")]
    pub fn start(self: Arc<Self>) -> Result<PublisherHandle, InstallError> {
        let step = self.config().step.max(MIN_STEP);
        let (stop, mut stopped) = oneshot::channel::<()>();

        let worker = task::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + step, step);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let registry = Arc::clone(&self);
                        if let Err(e) = task::spawn_blocking(move || publish_logged(&registry)).await {
                            log::error!("InfluxDB publish cycle failed: {e}");
                        }
                    }
                    _ = &mut stopped => break,
                }
            }
            // The blocking client must not be dropped on the runtime.
            let _ = task::spawn_blocking(move || publish_logged(&self)).await;
        });

        Ok(PublisherHandle {
            stop: Some(stop),
            worker: Some(worker),
        })
    }
}

/// Runs `f` on a plain thread. The blocking HTTP client must not be created or dropped
/// on a Tokio worker.
#[cfg(feature = "tokio")]
fn off_runtime<T: Send>(f: impl FnOnce() -> T + Send) -> T {
    std::thread::scope(|scope| scope.spawn(f).join())
        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
}

#[cfg(not(feature = "tokio"))]
fn off_runtime<T>(f: impl FnOnce() -> T) -> T {
    f()
}

impl InfluxRegistryBuilder {
    /// Installs an [`InfluxRecorder`](crate::InfluxRecorder) stepping on this builder's clock
    /// as the global recorder and starts publishing it.
    ///
    /// # Errors
    /// Returns an error if a global recorder is already set, the HTTP client cannot be
    /// created, or the publisher cannot be started.
    pub fn install(mut self) -> Result<PublisherHandle, InstallError> {
        let recorder = self.recorder();
        let source = recorder.clone();
        let registry = off_runtime(move || self.build(source))?;

        if let Err(e) = recorder.install() {
            off_runtime(move || drop(registry));
            return Err(e.into());
        }
        Arc::new(registry).start()
    }
}

#[cfg(all(test, not(feature = "tokio")))]
mod tests {
    use super::*;
    use crate::{
        InfluxConfig, clock::MockClock, http::HttpResponse, snapshot::MetricRecord,
        testing::RecordingSender,
    };
    use reqwest::Method;

    fn started(sender: &RecordingSender, step: Duration) -> PublisherHandle {
        let registry = InfluxRegistry::builder(
            InfluxConfig::default()
                .token("t")
                .compressed(false)
                .step(step),
        )
        .clock(MockClock::default())
        .http_client(sender.clone())
        .build(|ts: u64| vec![MetricRecord::new("up", ts).field("value", 1.0)])
        .unwrap();
        Arc::new(registry).start().unwrap()
    }

    #[test]
    fn stop_publishes_once_more() {
        let sender = RecordingSender::default()
            .stub("/ping", HttpResponse::new(204))
            .stub("/api/v2/write", HttpResponse::new(204));

        started(&sender, Duration::from_secs(3600)).stop();

        assert_eq!(sender.requests_with(&Method::POST).len(), 1);
    }

    #[test]
    fn publishes_every_step() {
        let sender = RecordingSender::default()
            .stub("/ping", HttpResponse::new(204))
            .stub("/api/v2/write", HttpResponse::new(204));

        let handle = started(&sender, Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(150));
        handle.stop();

        assert!(sender.requests_with(&Method::POST).len() >= 2);
        assert_eq!(sender.requests_with(&Method::HEAD).len(), 1);
    }

    #[test]
    fn dropping_the_handle_stops_the_thread() {
        let sender = RecordingSender::default()
            .stub("/ping", HttpResponse::new(204))
            .stub("/api/v2/write", HttpResponse::new(204));

        drop(started(&sender, Duration::from_secs(3600)));

        for _ in 0..100 {
            if !sender.requests_with(&Method::POST).is_empty() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("final publish never happened");
    }

    #[test]
    fn install_reports_an_existing_global_recorder() {
        let _ = metrics::set_global_recorder(crate::InfluxRecorder::default());

        let result = InfluxRegistry::builder(InfluxConfig::default().token("t")).install();
        assert!(matches!(result, Err(InstallError::Recorder(_))));
    }
}
