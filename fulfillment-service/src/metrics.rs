use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

/// Pipeline counters, constructed once in main and injected through AppState.
#[derive(Clone)]
pub struct PipelineMetrics {
    pub registry: Registry,
    pub fulfillments_total: IntCounterVec,
    pub fulfilled_units_total: IntCounterVec,
    pub duplicate_requests_total: IntCounter,
    pub oversell_total: IntCounter,
    pub notification_failures_total: IntCounter,
    pub webhook_rejections_total: IntCounterVec,
    pub http_errors_total: IntCounterVec,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let fulfillments_total = IntCounterVec::new(
            Opts::new("fulfillments_total", "Completed fulfillment transactions"),
            &["kind"],
        )
        .unwrap();
        let fulfilled_units_total = IntCounterVec::new(
            Opts::new("fulfilled_units_total", "Units issued by completed fulfillments"),
            &["kind"],
        )
        .unwrap();
        let duplicate_requests_total = IntCounter::new(
            "duplicate_fulfillment_requests_total",
            "Requests short-circuited by the idempotency guard",
        )
        .unwrap();
        let oversell_total = IntCounter::new(
            "oversell_total",
            "Paid fulfillments rejected because inventory ran out",
        )
        .unwrap();
        let notification_failures_total = IntCounter::new(
            "notification_failures_total",
            "Confirmation sends that failed after commit",
        )
        .unwrap();
        let webhook_rejections_total = IntCounterVec::new(
            Opts::new("webhook_rejections_total", "Inbound provider signals rejected"),
            &["provider", "code"],
        )
        .unwrap();
        let http_errors_total = IntCounterVec::new(
            Opts::new(
                "http_errors_total",
                "Count of HTTP error responses emitted (status >= 400)",
            ),
            &["service", "code", "status"],
        )
        .unwrap();
        let _ = registry.register(Box::new(fulfillments_total.clone()));
        let _ = registry.register(Box::new(fulfilled_units_total.clone()));
        let _ = registry.register(Box::new(duplicate_requests_total.clone()));
        let _ = registry.register(Box::new(oversell_total.clone()));
        let _ = registry.register(Box::new(notification_failures_total.clone()));
        let _ = registry.register(Box::new(webhook_rejections_total.clone()));
        let _ = registry.register(Box::new(http_errors_total.clone()));
        PipelineMetrics {
            registry,
            fulfillments_total,
            fulfilled_units_total,
            duplicate_requests_total,
            oversell_total,
            notification_failures_total,
            webhook_rejections_total,
            http_errors_total,
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
