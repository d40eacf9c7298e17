//! Process metrics exposed in the Prometheus text format.
//!
//! One `MetricsSystem` per process, named after the role ("worker", "master").
//! The system must be started before its handler is mounted on a web endpoint;
//! a stopped system answers scrapes with `503`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::info;

pub struct MetricsSystem {
    instance: String,
    registry: Registry,
    started_at: Instant,
    running: AtomicBool,

    /// RPC calls received, by service name.
    pub rpc_requests: IntCounterVec,
    /// Bytes streamed by the data-transfer endpoint.
    pub data_bytes_served: IntCounter,
    /// Existence lookups answered "absent" from the absent-path cache.
    pub absent_cache_hits: IntCounter,
    /// Existence lookups that had to go to the underlying storage.
    pub ufs_existence_checks: IntCounter,
    /// Blocks held by the block store, as last sampled.
    pub blocks_cached: IntGauge,
    uptime_seconds: IntGauge,
}

impl MetricsSystem {
    pub fn new(instance: &str) -> prometheus::Result<Self> {
        let registry = Registry::new();
        let opts = |name: &str, help: &str| {
            Opts::new(name, help)
                .namespace("tiercache")
                .subsystem(instance)
        };

        let rpc_requests = IntCounterVec::new(
            opts("rpc_requests_total", "RPC calls received"),
            &["service"],
        )?;
        let data_bytes_served =
            IntCounter::with_opts(opts("data_bytes_served_total", "Block bytes streamed"))?;
        let absent_cache_hits =
            IntCounter::with_opts(opts("absent_cache_hits_total", "Lookups answered absent"))?;
        let ufs_existence_checks = IntCounter::with_opts(opts(
            "ufs_existence_checks_total",
            "Existence checks sent to the UFS",
        ))?;
        let blocks_cached =
            IntGauge::with_opts(opts("blocks_cached", "Blocks held in the block store"))?;
        let uptime_seconds =
            IntGauge::with_opts(opts("uptime_seconds", "Seconds since process start"))?;

        registry.register(Box::new(rpc_requests.clone()))?;
        registry.register(Box::new(data_bytes_served.clone()))?;
        registry.register(Box::new(absent_cache_hits.clone()))?;
        registry.register(Box::new(ufs_existence_checks.clone()))?;
        registry.register(Box::new(blocks_cached.clone()))?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        Ok(Self {
            instance: instance.to_string(),
            registry,
            started_at: Instant::now(),
            running: AtomicBool::new(false),
            rpc_requests,
            data_bytes_served,
            absent_cache_hits,
            ufs_existence_checks,
            blocks_cached,
            uptime_seconds,
        })
    }

    pub fn start(&self) {
        if !self.running.swap(true, Ordering::AcqRel) {
            info!(instance = %self.instance, "Metrics system started");
        }
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!(instance = %self.instance, "Metrics system stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Current metrics in the text exposition format, or `None` when stopped.
    pub fn render(&self) -> Option<String> {
        if !self.is_running() {
            return None;
        }
        self.uptime_seconds.set(self.started_at.elapsed().as_secs() as i64);

        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf).ok()?;
        String::from_utf8(buf).ok()
    }

    /// Router serving `GET /metrics`.
    pub fn handler(self: &Arc<Self>) -> Router {
        Router::new().route("/metrics", get(scrape)).with_state(self.clone())
    }
}

async fn scrape(State(metrics): State<Arc<MetricsSystem>>) -> Response {
    match metrics.render() {
        Some(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics system stopped").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_requires_start() {
        let metrics = MetricsSystem::new("worker").unwrap();
        assert!(metrics.render().is_none());

        metrics.start();
        metrics.rpc_requests.with_label_values(&["block"]).inc();
        let text = metrics.render().unwrap();
        assert!(text.contains("tiercache_worker_rpc_requests_total"));
        assert!(text.contains("service=\"block\""));

        metrics.stop();
        assert!(metrics.render().is_none());
    }
}
