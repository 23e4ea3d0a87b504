//! Metrics and event hooks shared by the vector index crates.
//!
//! Index code talks to a [`Meter`] and never to a concrete backend. Two
//! meters ship here: [`NoopMeter`], which drops everything, and
//! [`RecordingMeter`], which keeps totals and events in memory so callers
//! can assert on them.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub type Labels = &'static [(&'static str, &'static str)];

pub trait Counter: Send + Sync {
    fn inc(&self, v: u64);
}

pub trait Gauge: Send + Sync {
    fn set(&self, v: i64);
}

pub trait Histogram: Send + Sync {
    fn observe(&self, v: f64);
}

/// Hands out instruments by name and receives typed events.
pub trait Meter: Send + Sync + 'static {
    fn counter(&self, name: &'static str, labels: Labels) -> Box<dyn Counter>;
    fn gauge(&self, name: &'static str, labels: Labels) -> Box<dyn Gauge>;
    fn histo(&self, name: &'static str, buckets: &'static [f64], labels: Labels)
        -> Box<dyn Histogram>;
    fn emit(&self, evt: VizEvent);
}

/// Discards every measurement.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMeter;

impl Counter for NoopMeter {
    fn inc(&self, _v: u64) {}
}

impl Gauge for NoopMeter {
    fn set(&self, _v: i64) {}
}

impl Histogram for NoopMeter {
    fn observe(&self, _v: f64) {}
}

impl Meter for NoopMeter {
    fn counter(&self, _name: &'static str, _labels: Labels) -> Box<dyn Counter> {
        Box::new(NoopMeter)
    }

    fn gauge(&self, _name: &'static str, _labels: Labels) -> Box<dyn Gauge> {
        Box::new(NoopMeter)
    }

    fn histo(&self, _name: &'static str, _b: &'static [f64], _l: Labels) -> Box<dyn Histogram> {
        Box::new(NoopMeter)
    }

    fn emit(&self, _evt: VizEvent) {}
}

#[derive(Default)]
struct Recorded {
    counters: HashMap<&'static str, u64>,
    gauges: HashMap<&'static str, i64>,
    samples: HashMap<&'static str, Vec<f64>>,
    events: Vec<VizEvent>,
}

/// In-memory meter. Labels are ignored; values are keyed by metric name.
#[derive(Clone, Default)]
pub struct RecordingMeter {
    inner: Arc<Mutex<Recorded>>,
}

struct Instrument {
    name: &'static str,
    inner: Arc<Mutex<Recorded>>,
}

impl Counter for Instrument {
    fn inc(&self, v: u64) {
        *self.inner.lock().counters.entry(self.name).or_default() += v;
    }
}

impl Gauge for Instrument {
    fn set(&self, v: i64) {
        self.inner.lock().gauges.insert(self.name, v);
    }
}

impl Histogram for Instrument {
    fn observe(&self, v: f64) {
        self.inner.lock().samples.entry(self.name).or_default().push(v);
    }
}

impl RecordingMeter {
    pub fn new() -> Self {
        Self::default()
    }

    fn instrument(&self, name: &'static str) -> Box<Instrument> {
        Box::new(Instrument {
            name,
            inner: self.inner.clone(),
        })
    }

    /// Sum of all increments to `name`, zero if never touched.
    pub fn counter_value(&self, name: &str) -> u64 {
        self.inner.lock().counters.get(name).copied().unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str) -> Option<i64> {
        self.inner.lock().gauges.get(name).copied()
    }

    pub fn sample_count(&self, name: &str) -> usize {
        self.inner.lock().samples.get(name).map_or(0, Vec::len)
    }

    pub fn events(&self) -> Vec<VizEvent> {
        self.inner.lock().events.clone()
    }
}

impl Meter for RecordingMeter {
    fn counter(&self, name: &'static str, _labels: Labels) -> Box<dyn Counter> {
        self.instrument(name)
    }

    fn gauge(&self, name: &'static str, _labels: Labels) -> Box<dyn Gauge> {
        self.instrument(name)
    }

    fn histo(&self, name: &'static str, _b: &'static [f64], _l: Labels) -> Box<dyn Histogram> {
        self.instrument(name)
    }

    fn emit(&self, evt: VizEvent) {
        self.inner.lock().events.push(evt);
    }
}

/// Structured events for live views. Never carries vector payloads.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq)]
pub enum VizEvent {
    Hnsw(HnswEvt),
    Quant(QuantEvt),
}

#[derive(Clone, Debug, PartialEq)]
pub struct HnswEvt {
    /// Name the index was registered under.
    pub index: &'static str,
    pub kind: HnswKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum HnswKind {
    /// Entry point moved, by promotion on insert or re-election on delete.
    EntryPointChanged { node: u64, layer: u32 },
    /// Every node was tombstoned and the graph was emptied.
    Reset,
    CleanupStart { tombstones: usize },
    CleanupFinish { reclaimed: usize, relinked: usize },
    /// Query answered by scanning the allow-list.
    FlatSearch { candidates: usize },
}

#[derive(Clone, Debug, PartialEq)]
pub struct QuantEvt {
    pub index: &'static str,
    pub kind: QuantKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum QuantKind {
    TrainingStart { vectors: usize },
    /// `code_bytes` is the encoded length of one vector.
    Activated { code_bytes: usize },
}

#[macro_export]
macro_rules! obs_count {
    ($m:expr, $name:expr, $labels:expr, $v:expr) => {{
        $m.counter($name, $labels).inc($v as u64);
    }};
}

#[macro_export]
macro_rules! obs_gauge {
    ($m:expr, $name:expr, $labels:expr, $v:expr) => {{
        $m.gauge($name, $labels).set($v as i64);
    }};
}

#[macro_export]
macro_rules! obs_hist {
    ($m:expr, $name:expr, $labels:expr, $v:expr) => {{
        $m.histo($name, &[], $labels).observe($v as f64);
    }};
}

/// Runs `$body` and records its wall time in milliseconds.
#[macro_export]
macro_rules! obs_timed {
    ($m:expr, $name:expr, $labels:expr, $body:block) => {{
        let started = std::time::Instant::now();
        let out = { $body };
        $m.histo($name, &[], $labels)
            .observe(started.elapsed().as_secs_f64() * 1000.0);
        out
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_meter_accepts_everything() {
        let m = NoopMeter;
        obs_count!(m, "c", &[], 3);
        obs_gauge!(m, "g", &[("k", "v")], -1);
        obs_hist!(m, "h", &[], 0.5);
        let v = obs_timed!(m, "t", &[], { 40 + 2 });
        assert_eq!(v, 42);
        m.emit(VizEvent::Hnsw(HnswEvt {
            index: "test",
            kind: HnswKind::Reset,
        }));
    }

    #[test]
    fn test_recording_meter_accumulates() {
        let m = RecordingMeter::new();
        obs_count!(m, "inserts", &[], 2);
        obs_count!(m, "inserts", &[], 3);
        obs_gauge!(m, "nodes", &[], 10);
        obs_gauge!(m, "nodes", &[], 7);
        let _ = obs_timed!(m, "latency", &[], { 1 });

        assert_eq!(m.counter_value("inserts"), 5);
        assert_eq!(m.counter_value("missing"), 0);
        assert_eq!(m.gauge_value("nodes"), Some(7));
        assert_eq!(m.gauge_value("missing"), None);
        assert_eq!(m.sample_count("latency"), 1);
    }

    #[test]
    fn test_recording_meter_shares_state_across_clones() {
        let m = RecordingMeter::new();
        let handle = m.clone();
        m.emit(VizEvent::Quant(QuantEvt {
            index: "idx",
            kind: QuantKind::TrainingStart { vectors: 4 },
        }));
        assert_eq!(
            handle.events(),
            vec![VizEvent::Quant(QuantEvt {
                index: "idx",
                kind: QuantKind::TrainingStart { vectors: 4 },
            })]
        );
    }
}
