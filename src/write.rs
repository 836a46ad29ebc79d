use crate::{
    config::InfluxConfig,
    dialect::Dialect,
    error::{PublishError, TransportError},
    http::{HttpRequest, HttpSender},
};
use std::sync::atomic::{AtomicBool, Ordering};

/// Shapes write requests for one dialect.
pub trait DialectWriter: Send + Sync {
    /// The write endpoint with its query and authentication, without a body.
    ///
    /// # Errors
    /// Returns an error if the configured URI cannot carry a path.
    fn write_request(&self, config: &InfluxConfig) -> Result<HttpRequest, TransportError>;

    /// Runs before the first write of a cycle. Failures are logged, never returned.
    fn prepare(&self, _config: &InfluxConfig, _sender: &dyn HttpSender, _state: &WriterState) {}
}

/// State the writers keep across publish cycles.
#[derive(Debug, Default)]
pub struct WriterState {
    database_created: AtomicBool,
}

impl Dialect {
    /// The request strategy for this dialect.
    #[must_use]
    pub fn writer(self) -> &'static dyn DialectWriter {
        match self {
            Self::LegacySingleNode => &LegacyWriter,
            Self::MultiTenant => &MultiTenantWriter,
        }
    }
}

/// `POST /write` for 1.x servers.
#[derive(Debug, Clone, Copy)]
pub struct LegacyWriter;

impl LegacyWriter {
    fn authenticate(config: &InfluxConfig, mut request: HttpRequest) -> HttpRequest {
        if let (Some(user), Some(password)) = (&config.user_name, &config.password) {
            request = request.query("u", user).query("p", password);
        }
        if let Some(token) = &config.token {
            request = request.header("Authorization", &format!("Bearer {token}"));
        }
        request
    }

    /// `CREATE DATABASE "<db>"` with the configured retention clauses.
    #[must_use]
    pub fn create_database_query(config: &InfluxConfig) -> String {
        let mut query = format!("CREATE DATABASE \"{}\"", config.db);

        let mut clauses = Vec::new();
        if let Some(duration) = &config.retention_duration {
            clauses.push(format!("DURATION {duration}"));
        }
        if let Some(factor) = config.retention_replication_factor {
            clauses.push(format!("REPLICATION {factor}"));
        }
        if let Some(shard) = &config.retention_shard_duration {
            clauses.push(format!("SHARD DURATION {shard}"));
        }
        if let Some(policy) = &config.retention_policy {
            clauses.push(format!("NAME {policy}"));
        }
        if !clauses.is_empty() {
            query.push_str(" WITH ");
            query.push_str(&clauses.join(" "));
        }
        query
    }
}

impl DialectWriter for LegacyWriter {
    fn write_request(&self, config: &InfluxConfig) -> Result<HttpRequest, TransportError> {
        let mut request = HttpRequest::post(&config.uri, &["write"])?
            .query("consistency", config.consistency.as_str())
            .query("precision", "ms")
            .query("db", &config.db);
        if let Some(policy) = &config.retention_policy {
            request = request.query("rp", policy);
        }
        Ok(Self::authenticate(config, request))
    }

    fn prepare(&self, config: &InfluxConfig, sender: &dyn HttpSender, state: &WriterState) {
        if !config.auto_create_db || state.database_created.load(Ordering::Acquire) {
            return;
        }

        let query = Self::create_database_query(config);
        let request = match HttpRequest::post(&config.uri, &["query"]) {
            Ok(request) => Self::authenticate(config, request.query("q", &query)),
            Err(e) => {
                log::warn!("Unable to create database '{}': {e}", config.db);
                return;
            }
        };

        match sender.send(&request) {
            Ok(response) if response.is_success() => {
                state.database_created.store(true, Ordering::Release);
                log::debug!("Created or found database '{}'", config.db);
            }
            Ok(response) => log::warn!(
                "Unable to create database '{}': {} {}",
                config.db,
                response.status,
                response.body
            ),
            Err(e) => log::warn!("Unable to create database '{}': {e}", config.db),
        }
    }
}

/// `POST /api/v2/write` for 2.x servers.
#[derive(Debug, Clone, Copy)]
pub struct MultiTenantWriter;

impl DialectWriter for MultiTenantWriter {
    fn write_request(&self, config: &InfluxConfig) -> Result<HttpRequest, TransportError> {
        let mut request =
            HttpRequest::post(&config.uri, &["api", "v2", "write"])?.query("precision", "ms");
        if let Some(org) = config.org.as_deref().filter(|org| !org.trim().is_empty()) {
            request = request.query("org", org);
        }
        request = request.query("bucket", config.bucket_name());
        if let Some(token) = &config.token {
            request = request.header("Authorization", &format!("Token {token}"));
        }
        Ok(request)
    }
}

/// Sends one body to the write endpoint of `writer`. Exactly one attempt is made.
///
/// # Errors
/// Returns [`PublishError::Transport`] if no response arrived and [`PublishError::Write`]
/// for any non-2xx response.
pub fn dispatch(
    writer: &dyn DialectWriter,
    config: &InfluxConfig,
    sender: &dyn HttpSender,
    body: &str,
) -> Result<(), PublishError> {
    let transport = |source| PublishError::Transport {
        url: config.uri.clone(),
        source,
    };

    let request = writer
        .write_request(config)
        .and_then(|request| request.text_body(body, config.compressed))
        .map_err(transport)?;

    let response = sender.send(&request).map_err(|source| PublishError::Transport {
        url: request.redacted_url().to_string(),
        source,
    })?;

    if response.is_success() {
        Ok(())
    } else {
        Err(PublishError::Write {
            url: request.redacted_url().to_string(),
            status: response.status,
            body: response.body,
        })
    }
}
