use crate::{
    config::InfluxConfig,
    http::{HttpRequest, HttpSender},
};
use serde::Deserialize;
use std::{fmt, str::FromStr, sync::OnceLock};

/// Header carrying the server version on `/ping` responses.
pub const VERSION_HEADER: &str = "x-influxdb-version";

/// The write API spoken by a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum Dialect {
    /// InfluxDB 1.x: `/write` with `db`, `consistency` and optional basic credentials.
    #[serde(rename = "v1")]
    LegacySingleNode,
    /// InfluxDB 2.x and later: `/api/v2/write` with `org`/`bucket` and a mandatory token.
    #[serde(rename = "v2")]
    MultiTenant,
}

impl Dialect {
    /// The dialect assumed when the server cannot tell us.
    pub const FALLBACK: Self = Self::MultiTenant;

    /// Maps a version such as `1.7.10`, `v2.0` or `2.7.1-rc` to a dialect.
    /// Returns `None` when no major version can be read.
    #[must_use]
    pub fn from_version(version: &str) -> Option<Self> {
        let version = version.trim();
        let version = version.strip_prefix(['v', 'V']).unwrap_or(version);
        let major = version
            .split(|c: char| !c.is_ascii_digit())
            .next()
            .filter(|major| !major.is_empty())?
            .parse::<u64>()
            .ok()?;

        match major {
            0 => None,
            1 => Some(Self::LegacySingleNode),
            _ => Some(Self::MultiTenant),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LegacySingleNode => f.write_str("v1"),
            Self::MultiTenant => f.write_str("v2"),
        }
    }
}

impl FromStr for Dialect {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v1" | "1" => Ok(Self::LegacySingleNode),
            "v2" | "2" => Ok(Self::MultiTenant),
            _ => Err(()),
        }
    }
}

/// What a server told us about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub dialect: Dialect,
    /// The raw version header, when the server sent one.
    pub version: Option<String>,
}

/// Result of one `/ping` probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The server answered; the answer holds for the lifetime of the registry.
    Detected(ServerInfo),
    /// The server could not be reached or answered with an error.
    /// The fallback dialect applies to this cycle only.
    Unreachable,
}

/// Sends `HEAD <uri>/ping` and reads the version header.
///
/// Never fails: transport errors and error statuses degrade to [`ProbeOutcome::Unreachable`].
pub fn probe(config: &InfluxConfig, sender: &dyn HttpSender) -> ProbeOutcome {
    let request = match HttpRequest::head(&config.uri, &["ping"]) {
        Ok(request) => request,
        Err(e) => {
            log::warn!("Cannot build version probe for {}: {e}", config.uri);
            return ProbeOutcome::Unreachable;
        }
    };

    let response = match sender.send(&request) {
        Ok(response) => response,
        Err(e) => {
            log::warn!(
                "Failed to probe InfluxDB version at {}, assuming {}: {e}",
                request.url,
                Dialect::FALLBACK
            );
            return ProbeOutcome::Unreachable;
        }
    };

    if !(200..400).contains(&response.status) {
        log::warn!(
            "InfluxDB version probe at {} returned {}, assuming {}",
            request.url,
            response.status,
            Dialect::FALLBACK
        );
        return ProbeOutcome::Unreachable;
    }

    let version = response.header(VERSION_HEADER).map(str::to_string);
    let dialect = match version.as_deref().and_then(Dialect::from_version) {
        Some(dialect) => dialect,
        None => {
            log::debug!(
                "InfluxDB at {} reported no usable version ({version:?}), assuming {}",
                request.url,
                Dialect::FALLBACK
            );
            Dialect::FALLBACK
        }
    };

    ProbeOutcome::Detected(ServerInfo { dialect, version })
}

/// Write-once cache of the detected dialect.
///
/// Starts unknown; the first successful detection wins and is never replaced.
#[derive(Debug, Default)]
pub struct DialectCache {
    detected: OnceLock<ServerInfo>,
}

impl DialectCache {
    /// A cache resolved up front, for configs that pin the dialect.
    #[must_use]
    pub fn pinned(dialect: Dialect) -> Self {
        let cache = Self::default();
        let _ = cache.detected.set(ServerInfo {
            dialect,
            version: None,
        });
        cache
    }

    #[must_use]
    pub fn get(&self) -> Option<&ServerInfo> {
        self.detected.get()
    }

    /// Returns the cached dialect or probes for it.
    ///
    /// Concurrent callers may probe twice; only the first detection is kept.
    pub fn resolve(&self, config: &InfluxConfig, sender: &dyn HttpSender) -> Dialect {
        if let Some(info) = self.detected.get() {
            return info.dialect;
        }

        match probe(config, sender) {
            ProbeOutcome::Detected(info) => {
                log::debug!(
                    "Detected InfluxDB {} ({}) at {}",
                    info.version.as_deref().unwrap_or("unknown version"),
                    info.dialect,
                    config.uri
                );
                self.detected.get_or_init(|| info).dialect
            }
            ProbeOutcome::Unreachable => Dialect::FALLBACK,
        }
    }
}
