use once_cell::sync::Lazy;
use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
};

/// Counters recorded by the fetch layer. Instruments are created on first use,
/// after `logger::init_tracing` has installed the meter provider.
pub struct FetchMetrics {
    pub fetch_started: Counter<u64>,
    pub fetch_failed: Counter<u64>,
    pub cache_hits: Counter<u64>,
    pub coalesced_waits: Counter<u64>,
    pub fetch_latency_ms: Histogram<f64>,
}

static METRICS: Lazy<FetchMetrics> = Lazy::new(|| {
    let meter = global::meter("plugin-engine");
    FetchMetrics {
        fetch_started: meter
            .u64_counter("fetch_started")
            .with_description("Network fetches issued")
            .build(),
        fetch_failed: meter.u64_counter("fetch_failed").build(),
        cache_hits: meter
            .u64_counter("cache_hits")
            .with_description("Step responses served from cache")
            .build(),
        coalesced_waits: meter
            .u64_counter("coalesced_waits")
            .with_description("Callers that joined an in-flight fetch")
            .build(),
        fetch_latency_ms: meter
            .f64_histogram("fetch_latency_ms")
            .with_description("Latency per fetch in ms")
            .with_unit("ms")
            .build(),
    }
});

pub fn metrics() -> &'static FetchMetrics {
    &METRICS
}
