/// Prometheus instrumentation for the block pipeline.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder,
};

/// Block and mempool processing latency buckets (seconds).
const TIME_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0, 15.0, 20.0,
    30.0, 60.0,
];

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    /// Height of the last processed block.
    pub static ref BLOCK_COUNT: IntGauge =
        IntGauge::new("block_count", "Number of processed blocks").unwrap();

    /// Wall time spent applying a batch of blocks.
    pub static ref BLOCK_TIME: Histogram = Histogram::with_opts(
        HistogramOpts::new("block_time", "Block update times").buckets(TIME_BUCKETS.to_vec())
    )
    .unwrap();

    /// Chain reorganisations handled.
    pub static ref REORG_COUNT: IntCounter =
        IntCounter::new("reorg_count", "Number of reorgs").unwrap();

    /// Time to refresh the mempool and notify touched addresses.
    pub static ref PROCESSED_MEMPOOL: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "processed_mempool",
            "Time to process mempool and notify touched addresses"
        )
        .buckets(TIME_BUCKETS.to_vec())
    )
    .unwrap();
}

/// Register all collectors; call once at startup.
pub fn register_metrics() {
    let _ = REGISTRY.register(Box::new(BLOCK_COUNT.clone()));
    let _ = REGISTRY.register(Box::new(BLOCK_TIME.clone()));
    let _ = REGISTRY.register(Box::new(REORG_COUNT.clone()));
    let _ = REGISTRY.register(Box::new(PROCESSED_MEMPOOL.clone()));
}

/// Render the registry in the text exposition format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_render() {
        register_metrics();
        BLOCK_COUNT.set(42);
        BLOCK_TIME.observe(0.2);
        let text = gather();
        assert!(text.contains("block_count"));
        assert!(text.contains("block_time"));
    }
}
