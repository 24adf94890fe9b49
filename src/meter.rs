//! Meter sink interface for reporting delivery gauges.

/// Narrow interface through which the delivery layer reports gauges.
///
/// Injected at construction; implementations typically forward to a metrics
/// registry. The core never holds a global meter reference.
pub trait MeterSink: Send + Sync {
    /// Report the current intake queue depth for a named binding.
    fn record_queue_depth(&self, name: &str, depth: usize);

    /// Report the number of messages currently being processed or awaiting
    /// settlement for a named binding.
    fn record_in_flight(&self, name: &str, count: usize);
}

/// Meter sink that discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullMeter;

impl MeterSink for NullMeter {
    fn record_queue_depth(&self, _name: &str, _depth: usize) {}

    fn record_in_flight(&self, _name: &str, _count: usize) {}
}
