//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedigroup_http_requests_total", "Total number of HTTP requests"),
        &["method", "endpoint", "status"]
    ).expect("metric can be created");

    // Inbox Metrics
    pub static ref INBOX_ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("fedigroup_inbox_activities_received_total", "Total number of activities received on an inbox"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref INBOX_OUTCOMES: IntCounterVec = IntCounterVec::new(
        Opts::new("fedigroup_inbox_outcomes_total", "Outcome of inbound activity processing"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref SIGNATURE_VERIFICATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("fedigroup_signature_verifications_total", "HTTP signature verification results"),
        &["result"]
    ).expect("metric can be created");

    // Federation Metrics
    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedigroup_deliveries_total", "Total number of outbound inbox deliveries"),
        &["result"]
    ).expect("metric can be created");
    pub static ref DELIVERY_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "fedigroup_delivery_duration_seconds",
            "Outbound inbox delivery duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["result"]
    ).expect("metric can be created");
    pub static ref REMOTE_FETCHES: IntCounterVec = IntCounterVec::new(
        Opts::new("fedigroup_remote_fetches_total", "Total number of remote documents fetched"),
        &["kind", "result"]
    ).expect("metric can be created");
    pub static ref BOOSTS_CREATED: IntCounter = IntCounter::new(
        "fedigroup_boosts_created_total",
        "Total number of notes boosted by a group"
    ).expect("metric can be created");

    // Cache Metrics
    pub static ref CACHE_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedigroup_cache_hits_total", "Total number of cache hits"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_MISSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedigroup_cache_misses_total", "Total number of cache misses"),
        &["cache_name"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedigroup_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .expect("HTTP_REQUESTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(INBOX_ACTIVITIES_RECEIVED.clone()))
        .expect("INBOX_ACTIVITIES_RECEIVED can be registered");
    REGISTRY
        .register(Box::new(INBOX_OUTCOMES.clone()))
        .expect("INBOX_OUTCOMES can be registered");
    REGISTRY
        .register(Box::new(SIGNATURE_VERIFICATIONS.clone()))
        .expect("SIGNATURE_VERIFICATIONS can be registered");
    REGISTRY
        .register(Box::new(DELIVERIES_TOTAL.clone()))
        .expect("DELIVERIES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_DURATION_SECONDS.clone()))
        .expect("DELIVERY_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(REMOTE_FETCHES.clone()))
        .expect("REMOTE_FETCHES can be registered");
    REGISTRY
        .register(Box::new(BOOSTS_CREATED.clone()))
        .expect("BOOSTS_CREATED can be registered");
    REGISTRY
        .register(Box::new(CACHE_HITS_TOTAL.clone()))
        .expect("CACHE_HITS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(CACHE_MISSES_TOTAL.clone()))
        .expect("CACHE_MISSES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}
