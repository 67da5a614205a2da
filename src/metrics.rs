/// Observation points the relay and cipher layers call into. The default
/// implementation is a no-op so the core stays testable without a metrics
/// backend wired in; a real deployment can supply a histogram-backed
/// implementation without touching the relay code.
pub trait MetricsSink: Send + Sync {
    fn observe_cipher_latency(&self, _op: &'static str, _nanos: u64) {}
    fn observe_connection_opened(&self, _port: u16) {}
    fn observe_connection_closed(&self, _port: u16) {}
}

pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}
