#![warn(clippy::pedantic, clippy::nursery, clippy::cargo, clippy::perf)]

//! # `metrics_influx_publisher`
//!
//! Publishes in-process metrics to InfluxDB as line protocol, speaking whichever write API the
//! server understands.
//!
//! The first publish probes `HEAD /ping` and reads the `X-Influxdb-Version` header:
//! 1.x servers get `POST /write?consistency=..&precision=ms&db=..`, 2.x servers (and servers
//! that do not say) get `POST /api/v2/write?precision=ms&bucket=..` with a
//! `Authorization: Token ..` header.
//!
//! ```no_run
//! use metrics_influx_publisher::{InfluxConfig, InfluxRegistry};
//!
//! let publisher = InfluxRegistry::builder(InfluxConfig::default().token("my-token"))
//!     .install()
//!     .expect("failed to install InfluxDB publisher");
//!
//! metrics::counter!("jobs.processed").increment(1);
//!
//! publisher.stop();
//! ```
//!
//! ## Async Support
//!
//! With the `tokio` feature the periodic publisher runs as a Tokio task and requires a Tokio
//! runtime. Publish cycles still run on the blocking pool.
//!
//! ```toml
//! [dependencies]
//! metrics_influx_publisher = { version = "...", features = ["tokio"] }
//! ```

mod clock;
mod config;
mod dialect;
mod error;
mod http;
pub mod line_protocol;
mod publisher;
mod recorder;
mod registry;
mod snapshot;
pub mod testing;
mod write;

pub use clock::{Clock, MockClock, SystemClock};
pub use config::{Consistency, InfluxConfig};
pub use dialect::{Dialect, DialectCache, ProbeOutcome, ServerInfo, VERSION_HEADER, probe};
pub use error::{EncodeError, InstallError, Invalid, PublishError, TransportError, ValidationError};
pub use http::{HttpRequest, HttpResponse, HttpSender, ReqwestSender};
pub use publisher::PublisherHandle;
pub use recorder::{InfluxRecorder, MetricKind};
pub use registry::{InfluxRegistry, InfluxRegistryBuilder, PublishSummary};
pub use snapshot::{FieldValue, MetricRecord, SnapshotSource};
pub use write::{DialectWriter, LegacyWriter, MultiTenantWriter, WriterState, dispatch};
