/// Metrics sink: an external collaborator per spec.md §1.
///
/// The core reports raw numeric observations (active permits, queue depth,
/// rejection counts); aggregation, export, and storage are the sink's
/// problem, not the core's.
pub trait MetricsSink: Send + Sync {
    fn record_counter(&self, name: &'static str, value: u64, labels: &[(&'static str, &str)]);
    fn record_gauge(&self, name: &'static str, value: f64, labels: &[(&'static str, &str)]);
}

/// Default sink that discards every observation.
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn record_counter(&self, _name: &'static str, _value: u64, _labels: &[(&'static str, &str)]) {}
    fn record_gauge(&self, _name: &'static str, _value: f64, _labels: &[(&'static str, &str)]) {}
}
