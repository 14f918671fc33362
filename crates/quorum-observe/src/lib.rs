//! quorum-observe: vendor-neutral observability ABI.
//!
//! The WAL and Raft crates report through these traits and typed events only;
//! exporters plug in by implementing [`Meter`].

pub trait Counter: Send + Sync {
    fn inc(&self, v: u64);
}
pub trait Gauge: Send + Sync {
    fn set(&self, v: i64);
}
pub trait Histogram: Send + Sync {
    fn observe(&self, v: f64);
}

pub trait Meter: Send + Sync + 'static {
    fn counter(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter>;
    fn gauge(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge>;
    fn histo(
        &self,
        name: &'static str,
        _buckets: &'static [f64],
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram>;
    fn emit(&self, evt: VizEvent);
}

/// A meter that drops everything. Default for tests and embedded use.
#[derive(Clone, Default)]
pub struct NoopMeter;
struct NoopC;
impl Counter for NoopC {
    fn inc(&self, _v: u64) {}
}
struct NoopG;
impl Gauge for NoopG {
    fn set(&self, _v: i64) {}
}
struct NoopH;
impl Histogram for NoopH {
    fn observe(&self, _v: f64) {}
}
impl Meter for NoopMeter {
    fn counter(
        &self,
        _n: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter> {
        Box::new(NoopC)
    }
    fn gauge(
        &self,
        _n: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge> {
        Box::new(NoopG)
    }
    fn histo(
        &self,
        _n: &'static str,
        _b: &'static [f64],
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram> {
        Box::new(NoopH)
    }
    fn emit(&self, _e: VizEvent) {}
}

/// Typed lifecycle events. Keys and values are never included.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq)]
pub enum VizEvent {
    Wal(WalEvt),
    Raft(RaftEvt),
    Snapshot(SnapEvt),
}

#[derive(Clone, Debug, PartialEq)]
pub struct WalEvt {
    pub node: u32,
    pub seg: u64,
    pub kind: WalKind,
}
#[derive(Clone, Debug, PartialEq)]
pub enum WalKind {
    SegmentRoll { bytes: u64 },
    Fsync { ms: u32 },
    CorruptionTruncated,
    SegmentGc,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RaftEvt {
    pub node: u32,
    pub term: u64,
    pub kind: RaftKind,
}
#[derive(Clone, Debug, PartialEq)]
pub enum RaftKind {
    VoteReq,
    VoteGranted { to: u32 },
    LeaderElected,
    StepDown,
    CommitAdvanced { index: u64 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct SnapEvt {
    pub node: u32,
    pub index: u64,
    pub kind: SnapKind,
}
#[derive(Clone, Debug, PartialEq)]
pub enum SnapKind {
    Start,
    Done { bytes: u64 },
    Installed { bytes: u64 },
}

/// Stable small numeric id for a string node id, for use in events.
pub fn node_tag(id: &str) -> u32 {
    // FNV-1a
    let mut h: u32 = 0x811c_9dc5;
    for b in id.as_bytes() {
        h ^= *b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    h
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
#[macro_export]
macro_rules! obs_timed {
    ($m:expr, $name:expr, $labels:expr, $body:block) => {{
        let __t = std::time::Instant::now();
        let __ret = { $body };
        let __ms = __t.elapsed().as_secs_f64() * 1000.0;
        $m.histo($name, &[], $labels).observe(__ms);
        __ret
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<VizEvent>>,
    }

    impl Meter for Arc<Recording> {
        fn counter(
            &self,
            _n: &'static str,
            _l: &'static [(&'static str, &'static str)],
        ) -> Box<dyn Counter> {
            Box::new(NoopC)
        }
        fn gauge(
            &self,
            _n: &'static str,
            _l: &'static [(&'static str, &'static str)],
        ) -> Box<dyn Gauge> {
            Box::new(NoopG)
        }
        fn histo(
            &self,
            _n: &'static str,
            _b: &'static [f64],
            _l: &'static [(&'static str, &'static str)],
        ) -> Box<dyn Histogram> {
            Box::new(NoopH)
        }
        fn emit(&self, e: VizEvent) {
            self.events.lock().unwrap().push(e);
        }
    }

    #[test]
    fn test_node_tag_is_stable() {
        assert_eq!(node_tag("n1"), node_tag("n1"));
        assert_ne!(node_tag("n1"), node_tag("n2"));
    }

    #[test]
    fn test_macros_with_noop() {
        let m = NoopMeter;
        obs_count!(m, "c", &[], 1);
        obs_gauge!(m, "g", &[], 2);
        obs_hist!(m, "h", &[], 3.0);
        let v = obs_timed!(m, "t", &[], { 40 + 2 });
        assert_eq!(v, 42);
    }

    #[test]
    fn test_custom_meter_receives_events() {
        let rec = Arc::new(Recording::default());
        rec.emit(VizEvent::Raft(RaftEvt {
            node: 1,
            term: 3,
            kind: RaftKind::LeaderElected,
        }));
        let events = rec.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            VizEvent::Raft(RaftEvt {
                kind: RaftKind::LeaderElected,
                ..
            })
        ));
    }
}
