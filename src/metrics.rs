use std::net::IpAddr;

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramTimer, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILED: &str = "failed";

const NAMESPACE: &str = "masquerade";

/// Process-wide metrics handle. Built once at startup and passed by `Arc`
/// into every component; the registry is owned here, not global.
pub struct Metrics {
    registry: Registry,

    total_requests: IntCounterVec,
    resolved_requests: IntCounterVec,
    switched_requests: IntCounterVec,
    limited_requests: IntCounter,
    request_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let total_requests = IntCounterVec::new(
            Opts::new(
                "dns_requests_processed_total",
                "Total number of processed DNS requests.",
            )
            .namespace(NAMESPACE),
            &["remote_ip"],
        )?;
        let resolved_requests = IntCounterVec::new(
            Opts::new(
                "dns_requests_resolved_total",
                "Total number of resolved DNS requests.",
            )
            .namespace(NAMESPACE),
            &["status"],
        )?;
        let switched_requests = IntCounterVec::new(
            Opts::new(
                "dns_requests_switched_total",
                "Total number of switched DNS requests.",
            )
            .namespace(NAMESPACE),
            &["remote_ip"],
        )?;
        let limited_requests = IntCounter::with_opts(
            Opts::new(
                "dns_requests_limited_total",
                "Total number of limited DNS requests.",
            )
            .namespace(NAMESPACE),
        )?;
        let request_duration = Histogram::with_opts(
            HistogramOpts::new("dns_requests_duration", "Histogram of DNS request durations.")
                .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(total_requests.clone()))?;
        registry.register(Box::new(resolved_requests.clone()))?;
        registry.register(Box::new(switched_requests.clone()))?;
        registry.register(Box::new(limited_requests.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            registry,
            total_requests,
            resolved_requests,
            switched_requests,
            limited_requests,
            request_duration,
        })
    }

    pub fn inc_total_requests(&self, addr: IpAddr) {
        self.total_requests
            .with_label_values(&[&addr.to_string()])
            .inc();
    }

    pub fn inc_resolved_requests(&self, status: &str) {
        self.resolved_requests.with_label_values(&[status]).inc();
    }

    pub fn inc_switched_requests(&self, addr: IpAddr) {
        self.switched_requests
            .with_label_values(&[&addr.to_string()])
            .inc();
    }

    pub fn inc_limited_requests(&self) {
        self.limited_requests.inc();
    }

    /// The timer observes into the duration histogram when dropped.
    pub fn start_request_timer(&self) -> HistogramTimer {
        self.request_duration.start_timer()
    }

    /// Text-format exposition of every registered metric.
    pub fn render(&self) -> Result<Vec<u8>, prometheus::Error> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }

    #[cfg(test)]
    pub(crate) fn total_requests_for(&self, remote_ip: &str) -> u64 {
        self.total_requests.with_label_values(&[remote_ip]).get()
    }

    #[cfg(test)]
    pub(crate) fn resolved_requests_for(&self, status: &str) -> u64 {
        self.resolved_requests.with_label_values(&[status]).get()
    }

    #[cfg(test)]
    pub(crate) fn switched_requests_for(&self, remote_ip: &str) -> u64 {
        self.switched_requests.with_label_values(&[remote_ip]).get()
    }

    #[cfg(test)]
    pub(crate) fn limited_requests_total(&self) -> u64 {
        self.limited_requests.get()
    }

    #[cfg(test)]
    pub(crate) fn request_duration_count(&self) -> u64 {
        self.request_duration.get_sample_count()
    }
}
