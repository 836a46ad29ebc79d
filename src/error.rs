use crate::recorder::InfluxRecorder;
use std::fmt::Write;
use thiserror::Error;

/// A single setting that failed validation.
///
/// Renders as `influx.token was 'null' but it is required`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{property} was '{}' but {reason}", .value.as_deref().unwrap_or("null"))]
pub struct Invalid {
    pub property: String,
    pub value: Option<String>,
    pub reason: String,
}

impl Invalid {
    pub(crate) fn new(property: &str, value: Option<&str>, reason: impl Into<String>) -> Self {
        Self {
            property: format!("influx.{property}"),
            value: value.map(str::to_string),
            reason: reason.into(),
        }
    }
}

/// One or more settings of an [`InfluxConfig`](crate::InfluxConfig) are missing or malformed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", render(.failures))]
pub struct ValidationError {
    failures: Vec<Invalid>,
}

fn render(failures: &[Invalid]) -> String {
    match failures {
        [single] => single.to_string(),
        failures => failures.iter().fold(
            String::from("multiple validation failures:"),
            |mut rendered, failure| {
                let _ = write!(rendered, "\n  {failure}");
                rendered
            },
        ),
    }
}

impl ValidationError {
    pub(crate) const fn new(failures: Vec<Invalid>) -> Self {
        Self { failures }
    }

    /// Returns `Ok(())` when `failures` is empty.
    pub(crate) fn check(failures: Vec<Invalid>) -> Result<(), Self> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Self { failures })
        }
    }

    #[must_use]
    pub fn failures(&self) -> &[Invalid] {
        &self.failures
    }
}

/// The transport could not complete a request.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
    #[error("IO error writing request body: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("{0}")]
    Other(String),
}

/// A snapshot record that cannot be expressed in line protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("metric name cannot be empty")]
    EmptyName,
    #[error("'time' is an invalid {kind} key in line protocol (metric: {measurement})")]
    ReservedKey {
        measurement: String,
        kind: &'static str,
    },
}

/// Why a publish cycle was rejected or failed.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error(transparent)]
    Configuration(#[from] ValidationError),
    #[error("failed to encode metrics: {0}")]
    Encoding(#[from] EncodeError),
    #[error("failed to send metrics to {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: TransportError,
    },
    #[error("failed to send metrics to {url}: server responded {status} {body}")]
    Write {
        url: String,
        status: u16,
        body: String,
    },
}

/// Failure installing the global recorder and its publisher.
#[derive(Error, Debug)]
pub enum InstallError {
    #[error("failed to set InfluxRecorder: {0}")]
    Recorder(#[from] metrics::SetRecorderError<InfluxRecorder>),
    #[error("failed to create HTTP client: {0}")]
    Transport(#[from] TransportError),
    #[error("failed to spawn publisher thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_failure_renders_without_prefix() {
        let err = ValidationError::check(vec![Invalid::new("token", None, "it is required")])
            .unwrap_err();
        assert_eq!(err.to_string(), "influx.token was 'null' but it is required");
    }

    #[test]
    fn multiple_failures_are_listed() {
        let err = ValidationError::check(vec![
            Invalid::new("token", Some(""), "it cannot be blank"),
            Invalid::new("bucket", None, "it is required"),
        ])
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "multiple validation failures:\n  influx.token was '' but it cannot be blank\n  influx.bucket was 'null' but it is required"
        );
        assert_eq!(err.failures().len(), 2);
    }

    #[test]
    fn configuration_error_is_transparent() {
        let err: PublishError =
            ValidationError::check(vec![Invalid::new("uri", Some("nope"), "it must be an absolute URL")])
                .unwrap_err()
                .into();
        assert_eq!(err.to_string(), "influx.uri was 'nope' but it must be an absolute URL");
    }
}
