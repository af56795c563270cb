/// claimdex: block-processing core for a naming-and-content chain indexer.
///
/// Consumes confirmed blocks from an upstream daemon, maintains the UTXO
/// and claim state in RocksDB with per-block undo records, resolves claim
/// activations and name takeovers, tracks the daemon mempool, and feeds an
/// external search index.

pub mod block;
pub mod coin;
pub mod daemon;
pub mod db;
pub mod error;
pub mod mempool;
pub mod metrics;
pub mod prefetch;
pub mod prefixes;
pub mod processor;
pub mod revertable;
pub mod script;
pub mod search;
pub mod settings;
pub mod staging;
pub mod telemetry;
pub mod types;
