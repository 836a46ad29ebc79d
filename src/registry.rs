use crate::{
    clock::{Clock, SystemClock},
    config::InfluxConfig,
    dialect::{Dialect, DialectCache, ServerInfo},
    error::{PublishError, TransportError},
    http::{HttpSender, ReqwestSender},
    line_protocol,
    recorder::InfluxRecorder,
    snapshot::SnapshotSource,
    write::{self, WriterState},
};
use std::sync::Arc;

/// What a successful publish cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishSummary {
    /// The dialect the cycle wrote with, or `None` when the snapshot was empty and the
    /// server was never contacted.
    pub dialect: Option<Dialect>,
    /// Lines written.
    pub lines: usize,
    /// Write requests sent.
    pub requests: usize,
}

/// Publishes snapshots of a [`SnapshotSource`] to one InfluxDB server.
///
/// Each call to [`publish`](Self::publish) is one isolated cycle:
/// validate the config, take the snapshot, probe the server if its dialect is still unknown,
/// validate the dialect-specific settings, encode the snapshot and write it.
pub struct InfluxRegistry {
    config: InfluxConfig,
    source: Box<dyn SnapshotSource>,
    sender: Box<dyn HttpSender>,
    clock: Arc<dyn Clock>,
    dialect: DialectCache,
    writer_state: WriterState,
}

impl std::fmt::Debug for InfluxRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfluxRegistry")
            .field("config", &self.config)
            .field("dialect", &self.dialect)
            .finish_non_exhaustive()
    }
}

impl InfluxRegistry {
    #[must_use]
    pub fn builder(config: InfluxConfig) -> InfluxRegistryBuilder {
        InfluxRegistryBuilder::new(config)
    }

    #[must_use]
    pub const fn config(&self) -> &InfluxConfig {
        &self.config
    }

    /// The server's dialect and version, once detected.
    #[must_use]
    pub fn server(&self) -> Option<&ServerInfo> {
        self.dialect.get()
    }

    /// Runs one publish cycle.
    ///
    /// An empty snapshot sends nothing, not even `HEAD /ping`. Records are written in
    /// batches of `batch_size` lines; the cycle stops at the first batch that fails.
    ///
    /// # Errors
    /// - [`PublishError::Configuration`] when a required setting is missing or malformed;
    ///   no write is attempted.
    /// - [`PublishError::Encoding`] when a record cannot be expressed in line protocol.
    /// - [`PublishError::Transport`] or [`PublishError::Write`] when a write fails.
    pub fn publish(&self) -> Result<PublishSummary, PublishError> {
        self.config.validate()?;

        let records = self.source.snapshot(self.clock.wall_time_millis());
        if records.is_empty() {
            log::debug!("Nothing to publish to {}", self.config.uri);
            return Ok(PublishSummary {
                dialect: None,
                lines: 0,
                requests: 0,
            });
        }

        let dialect = self.dialect.resolve(&self.config, self.sender.as_ref());
        self.config.validate_for(dialect)?;

        let batch = line_protocol::encode(&records, dialect)?;
        let mut summary = PublishSummary {
            dialect: Some(dialect),
            lines: batch.len(),
            requests: 0,
        };
        if batch.is_empty() {
            log::debug!("No finite values to publish to {}", self.config.uri);
            return Ok(summary);
        }

        let writer = dialect.writer();
        writer.prepare(&self.config, self.sender.as_ref(), &self.writer_state);

        for body in batch.bodies(self.config.batch_size) {
            write::dispatch(writer, &self.config, self.sender.as_ref(), &body)?;
            summary.requests += 1;
        }

        log::debug!(
            "Published {} lines to {} in {} requests",
            summary.lines,
            self.config.uri,
            summary.requests
        );
        Ok(summary)
    }
}

/// Builds an [`InfluxRegistry`], defaulting to the system clock and a `reqwest` client.
pub struct InfluxRegistryBuilder {
    config: InfluxConfig,
    clock: Option<Arc<dyn Clock>>,
    sender: Option<Box<dyn HttpSender>>,
}

impl InfluxRegistryBuilder {
    #[must_use]
    pub fn new(config: InfluxConfig) -> Self {
        Self {
            config,
            clock: None,
            sender: None,
        }
    }

    /// Sets the clock records are stamped with.
    #[must_use]
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Sets the transport requests are sent with.
    #[must_use]
    pub fn http_client(mut self, sender: impl HttpSender + 'static) -> Self {
        self.sender = Some(Box::new(sender));
        self
    }

    /// A recorder stepping on this registry's clock and `step`.
    pub(crate) fn recorder(&mut self) -> InfluxRecorder {
        let clock = Arc::clone(self.clock.get_or_insert_with(|| Arc::new(SystemClock)));
        InfluxRecorder::with_clock(clock, self.config.step)
    }

    /// Builds a registry publishing snapshots of `source`.
    ///
    /// # Errors
    /// Returns an error if no transport was given and the default client cannot be created.
    pub fn build(self, source: impl SnapshotSource + 'static) -> Result<InfluxRegistry, TransportError> {
        let sender = match self.sender {
            Some(sender) => sender,
            None => Box::new(ReqwestSender::new(&self.config)?),
        };
        let dialect = self
            .config
            .api_version
            .map_or_else(DialectCache::default, DialectCache::pinned);

        Ok(InfluxRegistry {
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            config: self.config,
            source: Box::new(source),
            sender,
            dialect,
            writer_state: WriterState::default(),
        })
    }
}
