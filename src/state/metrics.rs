use prometheus::{Encoder, IntGauge, Registry, TextEncoder};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Engine counters. Each is a gauge so active counts can go down again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stat {
    ActiveConnections,
    ActiveConnectRequests,
    ActiveUpgradedRequests,
    InterceptedRequests,
    InterceptedResponses,
    UpgradedRequests,
}

impl Stat {
    pub const ALL: [Stat; 6] = [
        Stat::ActiveConnections,
        Stat::ActiveConnectRequests,
        Stat::ActiveUpgradedRequests,
        Stat::InterceptedRequests,
        Stat::InterceptedResponses,
        Stat::UpgradedRequests,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stat::ActiveConnections => "active-connections",
            Stat::ActiveConnectRequests => "active-connect-requests",
            Stat::ActiveUpgradedRequests => "active-upgraded-requests",
            Stat::InterceptedRequests => "intercepted-requests",
            Stat::InterceptedResponses => "intercepted-responses",
            Stat::UpgradedRequests => "upgraded-requests",
        }
    }

    fn help(&self) -> &'static str {
        match self {
            Stat::ActiveConnections => "Number of open client connections",
            Stat::ActiveConnectRequests => "Number of CONNECT tunnels in progress",
            Stat::ActiveUpgradedRequests => "Number of upgraded connections being relayed",
            Stat::InterceptedRequests => "Total number of requests passed through hooks",
            Stat::InterceptedResponses => "Total number of responses passed through hooks",
            Stat::UpgradedRequests => "Total number of protocol upgrades",
        }
    }

    fn metric_name(&self) -> String {
        format!("mitm_proxy_{}", self.name().replace('-', "_"))
    }
}

pub struct Metrics {
    registry: Registry,
    pub active_connections: IntGauge,
    pub active_connect_requests: IntGauge,
    pub active_upgraded_requests: IntGauge,
    pub intercepted_requests: IntGauge,
    pub intercepted_responses: IntGauge,
    pub upgraded_requests: IntGauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let gauge = |stat: Stat| {
            let gauge =
                IntGauge::new(stat.metric_name(), stat.help()).expect("metric creation failed");
            registry
                .register(Box::new(gauge.clone()))
                .expect("metric registration failed");
            gauge
        };

        Self {
            active_connections: gauge(Stat::ActiveConnections),
            active_connect_requests: gauge(Stat::ActiveConnectRequests),
            active_upgraded_requests: gauge(Stat::ActiveUpgradedRequests),
            intercepted_requests: gauge(Stat::InterceptedRequests),
            intercepted_responses: gauge(Stat::InterceptedResponses),
            upgraded_requests: gauge(Stat::UpgradedRequests),
            registry,
        }
    }

    fn gauge(&self, stat: Stat) -> &IntGauge {
        match stat {
            Stat::ActiveConnections => &self.active_connections,
            Stat::ActiveConnectRequests => &self.active_connect_requests,
            Stat::ActiveUpgradedRequests => &self.active_upgraded_requests,
            Stat::InterceptedRequests => &self.intercepted_requests,
            Stat::InterceptedResponses => &self.intercepted_responses,
            Stat::UpgradedRequests => &self.upgraded_requests,
        }
    }

    pub fn increase(&self, stat: Stat) {
        self.gauge(stat).inc();
    }

    pub fn decrease(&self, stat: Stat) {
        self.gauge(stat).dec();
    }

    pub fn set(&self, stat: Stat, value: i64) {
        self.gauge(stat).set(value);
    }

    pub fn get(&self, stat: Stat) -> i64 {
        self.gauge(stat).get()
    }

    /// Current value of every counter, keyed by its dashed name.
    pub fn snapshot(&self) -> BTreeMap<&'static str, i64> {
        Stat::ALL
            .iter()
            .map(|stat| (stat.name(), self.get(*stat)))
            .collect()
    }

    pub fn reset(&self) {
        for stat in Stat::ALL {
            self.set(stat, 0);
        }
    }

    pub fn gather_metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Prometheus text exposition of all counters.
    pub fn encode_text(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.gather_metrics(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Holds a counter up for as long as it lives.
pub struct ActiveGuard {
    stat: Stat,
    metrics: Arc<Metrics>,
}

impl ActiveGuard {
    pub fn new(metrics: Arc<Metrics>, stat: Stat) -> Self {
        metrics.increase(stat);
        Self { stat, metrics }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.metrics.decrease(self.stat);
    }
}
