use crate::{
    clock::{Clock, SystemClock},
    snapshot::{MetricRecord, SnapshotSource},
};
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

const DEFAULT_STEP: Duration = Duration::from_secs(60);

/// The kind of metric being recorded, written as the `metric_type` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        }
    }
}

/// Maps wall time onto step positions.
struct Steps {
    clock: Arc<dyn Clock>,
    step_ms: u64,
}

impl fmt::Debug for Steps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Steps").field("step_ms", &self.step_ms).finish_non_exhaustive()
    }
}

impl Steps {
    fn position(&self) -> u64 {
        self.clock.wall_time_millis() / self.step_ms
    }
}

/// Counts of the step in progress and of the last completed one.
#[derive(Debug)]
struct CounterCell {
    steps: Arc<Steps>,
    position: AtomicU64,
    current: AtomicU64,
    previous: AtomicU64,
}

impl CounterCell {
    fn new(steps: &Arc<Steps>) -> Self {
        Self {
            position: AtomicU64::new(steps.position()),
            steps: Arc::clone(steps),
            current: AtomicU64::new(0),
            previous: AtomicU64::new(0),
        }
    }

    /// Moves the current count into `previous` once a step boundary has passed.
    /// A step without activity in between leaves `previous` at zero.
    fn roll(&self) {
        let now = self.steps.position();
        let last = self.position.load(Ordering::Acquire);
        if last < now
            && self
                .position
                .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            let count = self.current.swap(0, Ordering::AcqRel);
            let previous = if last + 1 == now { count } else { 0 };
            self.previous.store(previous, Ordering::Release);
        }
    }

    /// Counts of the last completed step.
    fn poll(&self) -> u64 {
        self.roll();
        self.previous.load(Ordering::Acquire)
    }
}

impl metrics::CounterFn for CounterCell {
    fn increment(&self, value: u64) {
        self.roll();
        self.current.fetch_add(value, Ordering::AcqRel);
    }

    /// Replaces the count of the step in progress.
    fn absolute(&self, value: u64) {
        self.roll();
        self.current.store(value, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct GaugeCell {
    bits: AtomicU64,
}

impl GaugeCell {
    fn update(&self, f: impl Fn(f64) -> f64) {
        let _ = self
            .bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some(f(f64::from_bits(bits)).to_bits())
            });
    }

    fn value(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

impl metrics::GaugeFn for GaugeCell {
    fn increment(&self, value: f64) {
        self.update(|current| current + value);
    }

    fn decrement(&self, value: f64) {
        self.update(|current| current - value);
    }

    fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct StepSummary {
    count: u64,
    sum: f64,
    max: f64,
}

impl StepSummary {
    fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        if self.count == 1 || value > self.max {
            self.max = value;
        }
    }
}

#[derive(Debug)]
struct HistogramSteps {
    position: u64,
    current: StepSummary,
    previous: StepSummary,
}

#[derive(Debug)]
struct HistogramCell {
    steps: Arc<Steps>,
    state: Mutex<HistogramSteps>,
}

impl HistogramCell {
    fn new(steps: &Arc<Steps>) -> Self {
        Self {
            state: Mutex::new(HistogramSteps {
                position: steps.position(),
                current: StepSummary::default(),
                previous: StepSummary::default(),
            }),
            steps: Arc::clone(steps),
        }
    }

    fn with_rolled<T>(&self, f: impl FnOnce(&mut HistogramSteps) -> T) -> T {
        let now = self.steps.position();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.position < now {
            let completed = std::mem::take(&mut state.current);
            state.previous = if state.position + 1 == now {
                completed
            } else {
                StepSummary::default()
            };
            state.position = now;
        }
        f(&mut state)
    }

    /// Observations of the last completed step.
    fn poll(&self) -> StepSummary {
        self.with_rolled(|state| state.previous)
    }
}

impl metrics::HistogramFn for HistogramCell {
    fn record(&self, value: f64) {
        self.with_rolled(|state| state.current.record(value));
    }
}

#[derive(Debug, Default)]
struct Instruments {
    counters: HashMap<metrics::Key, Arc<CounterCell>>,
    gauges: HashMap<metrics::Key, Arc<GaugeCell>>,
    histograms: HashMap<metrics::Key, Arc<HistogramCell>>,
}

/// A [`metrics::Recorder`] that aggregates in process and hands the publisher a snapshot
/// every step.
///
/// Steps are aligned to the clock: with a 60s step they start on the minute.
///
/// - counters publish `value`, the count of the last completed step
/// - gauges publish `value`, their current value
/// - histograms publish `sum`, `count`, `mean` and `upper` over the last completed step
///
/// Dots in names and label keys become underscores, and every record is tagged with its
/// `metric_type`.
///
/// # Example
/// ```
/// use std::time::Duration;
/// use metrics_influx_publisher::{InfluxRecorder, MockClock, SnapshotSource};
///
/// let clock = MockClock::default();
/// let recorder = InfluxRecorder::new(clock.clone(), Duration::from_secs(60));
/// metrics::with_local_recorder(&recorder, || {
///     metrics::counter!("http.requests", "method" => "GET").increment(3);
/// });
///
/// clock.add(Duration::from_secs(60));
/// let records = recorder.snapshot(60_001);
/// assert_eq!(records[0].name, "http_requests");
/// ```
#[derive(Debug, Clone)]
pub struct InfluxRecorder {
    instruments: Arc<Mutex<Instruments>>,
    steps: Arc<Steps>,
}

impl Default for InfluxRecorder {
    /// Steps every 60s on the system clock.
    fn default() -> Self {
        Self::new(SystemClock, DEFAULT_STEP)
    }
}

impl InfluxRecorder {
    /// A recorder whose counters and histograms roll over every `step` of `clock`.
    #[must_use]
    pub fn new(clock: impl Clock + 'static, step: Duration) -> Self {
        Self::with_clock(Arc::new(clock), step)
    }

    pub(crate) fn with_clock(clock: Arc<dyn Clock>, step: Duration) -> Self {
        let step_ms = u64::try_from(step.as_millis()).unwrap_or(u64::MAX).max(1);
        Self {
            instruments: Arc::default(),
            steps: Arc::new(Steps { clock, step_ms }),
        }
    }

    /// Sets this recorder as the global recorder.
    ///
    /// # Errors
    /// Returns an error if a global recorder is already installed.
    pub fn install(self) -> Result<(), metrics::SetRecorderError<Self>> {
        metrics::set_global_recorder(self)
    }

    fn with<T>(&self, f: impl FnOnce(&mut Instruments) -> T) -> T {
        let mut instruments = self
            .instruments
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut instruments)
    }
}

fn to_snake_case(name: &str) -> String {
    name.replace('.', "_")
}

fn record_for(key: &metrics::Key, kind: MetricKind, timestamp_ms: u64) -> MetricRecord {
    let mut record = MetricRecord::new(to_snake_case(key.name()), timestamp_ms);
    for label in key.labels() {
        let tag = to_snake_case(label.key());
        if tag == "time" || tag == "metric_type" {
            log::debug!("Dropping reserved label '{tag}' of {}", key.name());
            continue;
        }
        record.tags.insert(tag, label.value().to_owned());
    }
    record.tag("metric_type", kind.as_str())
}

impl SnapshotSource for InfluxRecorder {
    fn snapshot(&self, timestamp_ms: u64) -> Vec<MetricRecord> {
        let mut records = self.with(|instruments| {
            let counters = instruments.counters.iter().map(|(key, counter)| {
                #[allow(clippy::cast_precision_loss)]
                let value = counter.poll() as f64;
                record_for(key, MetricKind::Counter, timestamp_ms).field("value", value)
            });

            let gauges = instruments.gauges.iter().map(|(key, gauge)| {
                record_for(key, MetricKind::Gauge, timestamp_ms).field("value", gauge.value())
            });

            let histograms = instruments.histograms.iter().map(|(key, histogram)| {
                let step = histogram.poll();
                #[allow(clippy::cast_precision_loss)]
                let count = step.count as f64;
                let mean = if step.count == 0 { 0.0 } else { step.sum / count };
                record_for(key, MetricKind::Histogram, timestamp_ms)
                    .field("sum", step.sum)
                    .field("count", count)
                    .field("mean", mean)
                    .field("upper", step.max)
            });

            counters.chain(gauges).chain(histograms).collect::<Vec<_>>()
        });

        records.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.tags.cmp(&b.tags)));
        records
    }
}

impl metrics::Recorder for InfluxRecorder {
    fn describe_counter(
        &self,
        _key_name: metrics::KeyName,
        _unit: Option<metrics::Unit>,
        _description: metrics::SharedString,
    ) {
    }

    fn describe_gauge(
        &self,
        _key_name: metrics::KeyName,
        _unit: Option<metrics::Unit>,
        _description: metrics::SharedString,
    ) {
    }

    fn describe_histogram(
        &self,
        _key_name: metrics::KeyName,
        _unit: Option<metrics::Unit>,
        _description: metrics::SharedString,
    ) {
    }

    fn register_counter(
        &self,
        key: &metrics::Key,
        _meta: &metrics::Metadata<'_>,
    ) -> metrics::Counter {
        let cell = self.with(|i| {
            let cell = i.counters
                .entry(key.clone())
                .or_insert_with(|| Arc::new(CounterCell::new(&self.steps)));
            Arc::clone(cell)
        });
        metrics::Counter::from_arc(cell)
    }

    fn register_gauge(&self, key: &metrics::Key, _meta: &metrics::Metadata<'_>) -> metrics::Gauge {
        let cell = self.with(|i| Arc::clone(i.gauges.entry(key.clone()).or_default()));
        metrics::Gauge::from_arc(cell)
    }

    fn register_histogram(
        &self,
        key: &metrics::Key,
        _meta: &metrics::Metadata<'_>,
    ) -> metrics::Histogram {
        let cell = self.with(|i| {
            let cell = i.histograms
                .entry(key.clone())
                .or_insert_with(|| Arc::new(HistogramCell::new(&self.steps)));
            Arc::clone(cell)
        });
        metrics::Histogram::from_arc(cell)
    }
}
