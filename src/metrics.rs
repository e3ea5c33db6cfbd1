//! Prometheus metrics for the gateway.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::inference::engine::Usage;

pub struct Metrics {
    registry: Registry,
    requests: IntCounterVec,
    tokens: IntCounterVec,
    backend_failures: IntCounter,
    active_streams: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("gateway_requests_total", "HTTP requests by endpoint and status"),
            &["endpoint", "status"],
        )?;
        let tokens = IntCounterVec::new(
            Opts::new("gateway_tokens_total", "Tokens accounted to callers"),
            &["kind"],
        )?;
        let backend_failures = IntCounter::new(
            "gateway_backend_failures_total",
            "Generations that ended with a backend or formatting failure",
        )?;
        let active_streams =
            IntGauge::new("gateway_active_streams", "Streaming responses currently open")?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(tokens.clone()))?;
        registry.register(Box::new(backend_failures.clone()))?;
        registry.register(Box::new(active_streams.clone()))?;

        Ok(Self {
            registry,
            requests,
            tokens,
            backend_failures,
            active_streams,
        })
    }

    pub fn record_request(&self, endpoint: &str, status: u16) {
        let status = status.to_string();
        self.requests
            .with_label_values(&[endpoint, status.as_str()])
            .inc();
    }

    pub fn record_tokens(&self, prompt: usize, completion: usize) {
        self.tokens
            .with_label_values(&["prompt"])
            .inc_by(prompt as u64);
        self.tokens
            .with_label_values(&["completion"])
            .inc_by(completion as u64);
    }

    pub fn record_usage(&self, usage: &Usage) {
        self.record_tokens(usage.prompt_tokens(), usage.completion_tokens());
    }

    pub fn record_backend_failure(&self) {
        self.backend_failures.inc();
    }

    pub fn stream_opened(&self) {
        self.active_streams.inc();
    }

    pub fn stream_closed(&self) {
        self.active_streams.dec();
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
