use crate::{
    dialect::Dialect,
    error::{Invalid, ValidationError},
};
use figment::{
    Figment,
    error::{Actual, Kind},
    providers::Env,
};
use serde::{
    Deserialize, Deserializer,
    de::{self, Visitor},
};
use std::{fmt, str::FromStr, time::Duration};

/// Write consistency requested from a 1.x cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    Any,
    #[default]
    One,
    Quorum,
    All,
}

impl Consistency {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::One => "one",
            Self::Quorum => "quorum",
            Self::All => "all",
        }
    }
}

impl FromStr for Consistency {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" => Ok(Self::Any),
            "one" => Ok(Self::One),
            "quorum" => Ok(Self::Quorum),
            "all" => Ok(Self::All),
            _ => Err(()),
        }
    }
}

/// Where and how metrics are published.
///
/// Every setting has a default, so a config only needs to name what differs:
///
/// ```
/// use metrics_influx_publisher::InfluxConfig;
/// let config = InfluxConfig::default()
///     .uri("http://influx.internal:8086")
///     .token("my-token");
/// assert_eq!(config.bucket_name(), "mydb");
/// ```
///
/// Settings are validated lazily: [`InfluxConfig::validate`] checks what can be checked
/// before the server is known, [`InfluxConfig::validate_for`] adds the rules of a dialect.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InfluxConfig {
    /// Base URI of the server, e.g. `http://localhost:8086`.
    pub uri: String,
    /// Database written to by 1.x servers.
    #[serde(deserialize_with = "text")]
    pub db: String,
    /// Bucket written to by 2.x servers. Falls back to `db` when unset.
    #[serde(deserialize_with = "optional_text")]
    pub bucket: Option<String>,
    /// Organization of the bucket on 2.x servers.
    #[serde(deserialize_with = "optional_text")]
    pub org: Option<String>,
    /// Retention policy for 1.x writes and database creation.
    #[serde(alias = "retention_policy", deserialize_with = "optional_text")]
    pub retention_policy: Option<String>,
    /// `DURATION` clause used when auto-creating the database, e.g. `2w`.
    #[serde(alias = "retention_duration", deserialize_with = "optional_text")]
    pub retention_duration: Option<String>,
    /// `REPLICATION` clause used when auto-creating the database.
    #[serde(alias = "retention_replication_factor")]
    pub retention_replication_factor: Option<u32>,
    /// `SHARD DURATION` clause used when auto-creating the database.
    #[serde(alias = "retention_shard_duration", deserialize_with = "optional_text")]
    pub retention_shard_duration: Option<String>,
    pub consistency: Consistency,
    #[serde(alias = "user_name", deserialize_with = "optional_text")]
    pub user_name: Option<String>,
    #[serde(deserialize_with = "optional_text")]
    pub password: Option<String>,
    /// Authentication token. Required by 2.x servers, sent as a bearer token to 1.x servers.
    #[serde(deserialize_with = "optional_text")]
    pub token: Option<String>,
    /// Issue `CREATE DATABASE` once before the first write to a 1.x server.
    #[serde(alias = "auto_create_db")]
    pub auto_create_db: bool,
    /// Gzip request bodies.
    pub compressed: bool,
    /// Skip probing and always speak this dialect.
    #[serde(alias = "api_version")]
    pub api_version: Option<Dialect>,
    /// Maximum number of lines per write request.
    #[serde(alias = "batch_size")]
    pub batch_size: usize,
    #[serde(alias = "connect_timeout", deserialize_with = "millis")]
    pub connect_timeout: Duration,
    #[serde(alias = "read_timeout", deserialize_with = "millis")]
    pub read_timeout: Duration,
    /// Interval between scheduled publishes.
    #[serde(deserialize_with = "millis")]
    pub step: Duration,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            uri: "http://localhost:8086".into(),
            db: "mydb".into(),
            bucket: None,
            org: None,
            retention_policy: None,
            retention_duration: None,
            retention_replication_factor: None,
            retention_shard_duration: None,
            consistency: Consistency::One,
            user_name: None,
            password: None,
            token: None,
            auto_create_db: true,
            compressed: true,
            api_version: None,
            batch_size: 10_000,
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(10),
            step: Duration::from_secs(60),
        }
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// A string setting that also accepts values that look like numbers or booleans, as
/// environment variables do.
struct Text(String);

impl<'de> Deserialize<'de> for Text {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TextVisitor;

        impl Visitor<'_> for TextVisitor {
            type Value = Text;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Text, E> {
                Ok(Text(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Text, E> {
                Ok(Text(v))
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Text, E> {
                Ok(Text(v.to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Text, E> {
                Ok(Text(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Text, E> {
                Ok(Text(v.to_string()))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Text, E> {
                Ok(Text(v.to_string()))
            }
        }

        deserializer.deserialize_any(TextVisitor)
    }
}

fn text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Text::deserialize(deserializer).map(|Text(text)| text)
}

fn optional_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Option::<Text>::deserialize(deserializer).map(|text| text.map(|Text(text)| text))
}

impl InfluxConfig {
    /// Sets the base URI of the server.
    #[must_use]
    pub fn uri(mut self, uri: &str) -> Self {
        self.uri = uri.to_string();
        self
    }

    /// Sets the 1.x database name.
    #[must_use]
    pub fn db(mut self, db: &str) -> Self {
        self.db = db.to_string();
        self
    }

    /// Sets the 2.x bucket name.
    #[must_use]
    pub fn bucket(mut self, bucket: &str) -> Self {
        self.bucket = Some(bucket.to_string());
        self
    }

    /// Sets the 2.x organization.
    #[must_use]
    pub fn org(mut self, org: &str) -> Self {
        self.org = Some(org.to_string());
        self
    }

    #[must_use]
    pub fn retention_policy(mut self, retention_policy: &str) -> Self {
        self.retention_policy = Some(retention_policy.to_string());
        self
    }

    #[must_use]
    pub fn consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    /// Sets basic credentials, sent as `u`/`p` query parameters to 1.x servers.
    #[must_use]
    pub fn credentials(mut self, user_name: &str, password: &str) -> Self {
        self.user_name = Some(user_name.to_string());
        self.password = Some(password.to_string());
        self
    }

    #[must_use]
    pub fn token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    #[must_use]
    pub fn auto_create_db(mut self, auto_create_db: bool) -> Self {
        self.auto_create_db = auto_create_db;
        self
    }

    #[must_use]
    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    /// Pins the dialect, disabling the version probe.
    #[must_use]
    pub fn api_version(mut self, dialect: Dialect) -> Self {
        self.api_version = Some(dialect);
        self
    }

    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    /// The bucket 2.x writes go to.
    #[must_use]
    pub fn bucket_name(&self) -> &str {
        self.bucket.as_deref().unwrap_or(&self.db)
    }

    /// Reads settings from `influx.<name>` keys, e.g. `influx.uri` or `influx.autoCreateDb`.
    /// Absent keys keep their default.
    ///
    /// # Example
    /// ```
    /// use std::collections::HashMap;
    /// use metrics_influx_publisher::InfluxConfig;
    /// let props = HashMap::from([("influx.token", "my-token"), ("influx.batchSize", "500")]);
    /// let config = InfluxConfig::from_lookup(|key| props.get(key).map(|v| v.to_string())).unwrap();
    /// assert_eq!(config.batch_size, 500);
    /// ```
    ///
    /// # Errors
    /// Returns every setting whose value could not be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ValidationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("influx.{name}"));
        let mut failures = Vec::new();
        let mut config = Self::default();

        if let Some(uri) = get("uri") {
            config.uri = uri;
        }
        if let Some(db) = get("db") {
            config.db = db;
        }
        config.bucket = get("bucket");
        config.org = get("org");
        config.retention_policy = get("retentionPolicy");
        config.retention_duration = get("retentionDuration");
        config.retention_shard_duration = get("retentionShardDuration");
        config.user_name = get("userName");
        config.password = get("password");
        config.token = get("token");

        let mut parse = |name: &str, expected: &str, parsed: &mut dyn FnMut(&str) -> bool| {
            if let Some(raw) = get(name) {
                if !parsed(&raw) {
                    failures.push(Invalid::new(name, Some(&raw), format!("it must be {expected}")));
                }
            }
        };

        parse("retentionReplicationFactor", "a positive integer", &mut |raw| {
            raw.trim()
                .parse()
                .map(|factor| config.retention_replication_factor = Some(factor))
                .is_ok()
        });
        parse("consistency", "one of any, one, quorum, all", &mut |raw| {
            raw.parse().map(|c| config.consistency = c).is_ok()
        });
        parse("autoCreateDb", "a boolean", &mut |raw| {
            parse_bool(raw).map(|b| config.auto_create_db = b).is_some()
        });
        parse("compressed", "a boolean", &mut |raw| {
            parse_bool(raw).map(|b| config.compressed = b).is_some()
        });
        parse("apiVersion", "v1 or v2", &mut |raw| {
            raw.parse().map(|d| config.api_version = Some(d)).is_ok()
        });
        parse("batchSize", "a positive integer", &mut |raw| {
            raw.trim().parse().map(|size| config.batch_size = size).is_ok()
        });
        parse("connectTimeout", "a duration such as 500ms or 1s", &mut |raw| {
            parse_duration(raw).map(|d| config.connect_timeout = d).is_some()
        });
        parse("readTimeout", "a duration such as 500ms or 1s", &mut |raw| {
            parse_duration(raw).map(|d| config.read_timeout = d).is_some()
        });
        parse("step", "a duration such as 10s or 1m", &mut |raw| {
            parse_duration(raw).map(|d| config.step = d).is_some()
        });

        ValidationError::check(failures).map(|()| config)
    }

    /// Reads settings from `INFLUX_*` environment variables, e.g. `INFLUX_URI`,
    /// `INFLUX_BATCH_SIZE` or `INFLUX_READ_TIMEOUT` (milliseconds). Unset variables keep their
    /// default.
    ///
    /// # Errors
    /// Returns every setting whose value could not be parsed.
    pub fn from_env() -> Result<Self, ValidationError> {
        Self::from_figment(&Figment::from(Env::prefixed("INFLUX_")))
    }

    fn from_figment(figment: &Figment) -> Result<Self, ValidationError> {
        figment.extract().map_err(|errors| {
            ValidationError::new(errors.into_iter().map(invalid_setting).collect())
        })
    }

    /// Checks the settings that do not depend on the server's dialect.
    ///
    /// # Errors
    /// Returns every failing setting.
    pub fn validate(&self) -> Result<(), ValidationError> {
        ValidationError::check(self.common_failures())
    }

    /// Checks every setting required to write to a server speaking `dialect`.
    ///
    /// # Errors
    /// Returns every failing setting.
    pub fn validate_for(&self, dialect: Dialect) -> Result<(), ValidationError> {
        let mut failures = self.common_failures();

        match self.token.as_deref() {
            Some(token) if token.trim().is_empty() => {
                failures.push(Invalid::new("token", Some(token), "it cannot be blank"));
            }
            None if dialect == Dialect::MultiTenant => {
                failures.push(Invalid::new("token", None, "it is required"));
            }
            _ => {}
        }

        match dialect {
            Dialect::LegacySingleNode if self.db.trim().is_empty() => {
                failures.push(Invalid::new("db", Some(&self.db), "it cannot be blank"));
            }
            Dialect::MultiTenant if self.bucket_name().trim().is_empty() => {
                failures.push(Invalid::new(
                    "bucket",
                    Some(self.bucket_name()),
                    "it cannot be blank",
                ));
            }
            _ => {}
        }

        ValidationError::check(failures)
    }

    fn common_failures(&self) -> Vec<Invalid> {
        let mut failures = Vec::new();

        match reqwest::Url::parse(self.uri.trim()) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            _ => failures.push(Invalid::new(
                "uri",
                Some(&self.uri),
                "it must be an absolute http(s) URL",
            )),
        }

        if self.batch_size == 0 {
            failures.push(Invalid::new(
                "batchSize",
                Some(&self.batch_size.to_string()),
                "it must be positive",
            ));
        }

        if self.step.is_zero() {
            failures.push(Invalid::new("step", Some("0ms"), "it must be positive"));
        }

        failures
    }
}

/// Describes one extraction error in the `influx.<name> was '<value>' but ..` form.
fn invalid_setting(error: figment::Error) -> Invalid {
    let property = if error.path.is_empty() {
        "config".to_string()
    } else {
        error.path.join(".")
    };

    match &error.kind {
        Kind::InvalidType(actual, expected) | Kind::InvalidValue(actual, expected) => {
            let value = match actual {
                Actual::Str(value) => value.clone(),
                Actual::Bool(value) => value.to_string(),
                Actual::Unsigned(value) => value.to_string(),
                Actual::Signed(value) => value.to_string(),
                Actual::Float(value) => value.to_string(),
                other => other.to_string(),
            };
            Invalid::new(&property, Some(&value), format!("it must be {expected}"))
        }
        kind => Invalid::new(&property, None, kind.to_string()),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// Parses `250ms`, `10s`, `5m`, `1h`, or a bare number of milliseconds.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (amount, unit) = raw.split_at(split);
    let amount: u64 = amount.parse().ok()?;

    match unit.trim() {
        "" | "ms" => Some(Duration::from_millis(amount)),
        "s" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_secs(amount.checked_mul(60)?)),
        "h" => Some(Duration::from_secs(amount.checked_mul(3600)?)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid_before_detection() {
        assert!(InfluxConfig::default().validate().is_ok());
    }

    #[test]
    fn token_is_required_for_multi_tenant_only() {
        let config = InfluxConfig::default();
        assert!(config.validate_for(Dialect::LegacySingleNode).is_ok());

        let err = config.validate_for(Dialect::MultiTenant).unwrap_err();
        assert_eq!(err.to_string(), "influx.token was 'null' but it is required");
    }

    #[test]
    fn blank_token_is_rejected_for_every_dialect() {
        let config = InfluxConfig::default().token("  ");
        for dialect in [Dialect::LegacySingleNode, Dialect::MultiTenant] {
            let err = config.validate_for(dialect).unwrap_err();
            assert_eq!(err.to_string(), "influx.token was '  ' but it cannot be blank");
        }
    }

    #[test]
    fn blank_token_passes_relaxed_validation() {
        assert!(InfluxConfig::default().token("").validate().is_ok());
    }

    #[test]
    fn database_and_bucket_must_not_be_blank() {
        let config = InfluxConfig::default().db("").token("t");
        let err = config.validate_for(Dialect::LegacySingleNode).unwrap_err();
        assert_eq!(err.to_string(), "influx.db was '' but it cannot be blank");

        let err = config.validate_for(Dialect::MultiTenant).unwrap_err();
        assert_eq!(err.to_string(), "influx.bucket was '' but it cannot be blank");

        assert!(config.bucket("metrics").validate_for(Dialect::MultiTenant).is_ok());
    }

    #[test]
    fn uri_must_be_absolute_http() {
        for uri in ["", "localhost:8086", "ftp://example.com", "not a uri"] {
            let err = InfluxConfig::default().uri(uri).validate().unwrap_err();
            assert_eq!(err.failures()[0].property, "influx.uri");
        }
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = InfluxConfig::default().batch_size(0).validate().unwrap_err();
        assert_eq!(err.to_string(), "influx.batchSize was '0' but it must be positive");
    }

    #[test]
    fn lookup_overrides_defaults() {
        let props = HashMap::from([
            ("influx.uri", "https://influx.example.com"),
            ("influx.token", "abc"),
            ("influx.consistency", "QUORUM"),
            ("influx.autoCreateDb", "false"),
            ("influx.apiVersion", "v2"),
            ("influx.step", "10s"),
            ("influx.readTimeout", "250ms"),
        ]);
        let config = InfluxConfig::from_lookup(|key| props.get(key).map(|v| (*v).to_string()))
            .unwrap();

        assert_eq!(config.uri, "https://influx.example.com");
        assert_eq!(config.token.as_deref(), Some("abc"));
        assert_eq!(config.consistency, Consistency::Quorum);
        assert!(!config.auto_create_db);
        assert_eq!(config.api_version, Some(Dialect::MultiTenant));
        assert_eq!(config.step, Duration::from_secs(10));
        assert_eq!(config.read_timeout, Duration::from_millis(250));
        assert_eq!(config.db, "mydb");
    }

    #[test]
    fn lookup_reports_every_unparseable_value() {
        let props = HashMap::from([("influx.batchSize", "lots"), ("influx.compressed", "yes")]);
        let err = InfluxConfig::from_lookup(|key| props.get(key).map(|v| (*v).to_string()))
            .unwrap_err();

        let properties: Vec<_> = err.failures().iter().map(|f| f.property.as_str()).collect();
        assert_eq!(properties, ["influx.compressed", "influx.batchSize"]);
        assert_eq!(
            err.failures()[1].to_string(),
            "influx.batchSize was 'lots' but it must be a positive integer"
        );
    }

    #[test]
    fn deserializes_camel_case_with_defaults() {
        let config: InfluxConfig = serde_json::from_str(
            r#"{"uri": "http://db:8086", "bucket": "b", "org": "o", "readTimeout": 1500, "apiVersion": "v1"}"#,
        )
        .unwrap();

        assert_eq!(config.bucket_name(), "b");
        assert_eq!(config.org.as_deref(), Some("o"));
        assert_eq!(config.read_timeout, Duration::from_millis(1500));
        assert_eq!(config.api_version, Some(Dialect::LegacySingleNode));
        assert_eq!(config.batch_size, 10_000);
    }

    #[test]
    fn reads_prefixed_environment() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("INFLUX_URI", "http://influx.internal:8086");
            jail.set_env("INFLUX_TOKEN", "12345");
            jail.set_env("INFLUX_BUCKET", "telemetry");
            jail.set_env("INFLUX_BATCH_SIZE", "500");
            jail.set_env("INFLUX_AUTO_CREATE_DB", "false");
            jail.set_env("INFLUX_READ_TIMEOUT", "1500");
            jail.set_env("INFLUX_API_VERSION", "v1");
            jail.set_env("INFLUX_CONSISTENCY", "quorum");

            let config = InfluxConfig::from_env().unwrap();
            assert_eq!(config.uri, "http://influx.internal:8086");
            assert_eq!(config.token.as_deref(), Some("12345"));
            assert_eq!(config.bucket_name(), "telemetry");
            assert_eq!(config.batch_size, 500);
            assert!(!config.auto_create_db);
            assert_eq!(config.read_timeout, Duration::from_millis(1500));
            assert_eq!(config.api_version, Some(Dialect::LegacySingleNode));
            assert_eq!(config.consistency, Consistency::Quorum);
            assert_eq!(config.db, "mydb");
            assert_eq!(config.step, Duration::from_secs(60));
            Ok(())
        });
    }

    #[test]
    fn malformed_environment_is_reported() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("INFLUX_BATCH_SIZE", "lots");

            let err = InfluxConfig::from_env().unwrap_err();
            assert_eq!(err.failures().len(), 1);
            assert!(err.to_string().contains("lots"), "{err}");
            Ok(())
        });
    }

    #[test]
    fn durations_accept_units() {
        assert_eq!(parse_duration("1500"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("s"), None);
        assert_eq!(parse_duration("3 weeks"), None);
    }
}
