//! Meter that forwards lifecycle events to `tracing`.
//!
//! Counters, gauges and histograms are dropped; there is no metrics exporter.

use quorum_observe::{Counter, Gauge, Histogram, Meter, VizEvent};

#[derive(Clone, Default)]
pub struct TracingMeter;

struct Discard;

impl Counter for Discard {
    fn inc(&self, _v: u64) {}
}

impl Gauge for Discard {
    fn set(&self, _v: i64) {}
}

impl Histogram for Discard {
    fn observe(&self, _v: f64) {}
}

impl Meter for TracingMeter {
    fn counter(
        &self,
        _name: &'static str,
        _labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter> {
        Box::new(Discard)
    }

    fn gauge(
        &self,
        _name: &'static str,
        _labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge> {
        Box::new(Discard)
    }

    fn histo(
        &self,
        _name: &'static str,
        _buckets: &'static [f64],
        _labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram> {
        Box::new(Discard)
    }

    fn emit(&self, evt: VizEvent) {
        tracing::debug!(target: "quorumkv::events", event = ?evt);
    }
}
