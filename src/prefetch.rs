/// Block prefetcher.
///
/// Keeps a byte-budgeted cache of raw blocks ahead of the processor,
/// forward-only. Batch size follows a rolling average of recent block
/// sizes so the first fetch after startup is about ten blocks and steady
/// state stays near the cache budget. `reset_height` and the fetch loop
/// serialize on the state mutex, so a reorg reset never races a batch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::info;

use crate::coin;
use crate::daemon::Daemon;
use crate::error::Result;
use crate::types::Height;

pub const MAX_FETCH_COUNT: usize = 500;
pub const DEFAULT_MIN_CACHE_SIZE: usize = 10 * 1024 * 1024;
pub const DEFAULT_POLLING_DELAY: Duration = Duration::from_secs(5);

struct PrefetchState {
    blocks: Vec<Vec<u8>>,
    cache_size: usize,
    /// Next height to request from the daemon.
    next_height: Height,
    ave_size: usize,
}

pub struct Prefetcher<D> {
    daemon: Arc<D>,
    state: Mutex<PrefetchState>,
    /// Signalled when blocks are available for the processor.
    pub blocks_event: Arc<Notify>,
    /// Signalled when the cache has room again.
    refill_event: Notify,
    min_cache_size: usize,
    pub polling_delay: Duration,
    caught_up: AtomicBool,
}

impl<D: Daemon> Prefetcher<D> {
    pub fn new(daemon: Arc<D>, min_cache_size: usize, polling_delay: Duration) -> Prefetcher<D> {
        Prefetcher {
            daemon,
            state: Mutex::new(PrefetchState {
                blocks: Vec::new(),
                cache_size: 0,
                next_height: 0,
                // Seeds the first fetch at ten blocks.
                ave_size: min_cache_size / 10,
            }),
            blocks_event: Arc::new(Notify::new()),
            refill_event: Notify::new(),
            min_cache_size,
            polling_delay,
            caught_up: AtomicBool::new(false),
        }
    }

    /// Poll for blocks forever. Daemon errors are logged and retried.
    pub async fn main_loop(&self, start_height: Height) -> Result<()> {
        self.reset_height(start_height).await?;
        loop {
            match self.prefetch_blocks().await {
                Ok(true) => {
                    // Cache is at budget; wait for the processor to drain it.
                    self.refill_event.notified().await;
                }
                Ok(false) => tokio::time::sleep(self.polling_delay).await,
                Err(e) if e.is_transient() => {
                    info!("ignoring daemon error: {e}");
                    tokio::time::sleep(self.polling_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Atomically take everything fetched so far and free the cache.
    pub async fn take_prefetched(&self) -> Vec<Vec<u8>> {
        let mut state = self.state.lock().await;
        let blocks = std::mem::take(&mut state.blocks);
        state.cache_size = 0;
        self.refill_event.notify_one();
        blocks
    }

    /// Drop the cache and restart fetching at `height`. Used on reorg.
    pub async fn reset_height(&self, height: Height) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.blocks.clear();
            state.cache_size = 0;
            state.next_height = height;
            self.refill_event.notify_one();
        }
        let daemon_height = self.daemon.height().await?;
        let behind = (daemon_height as i64 + 1) - height as i64;
        if behind > 0 {
            info!("catching up to daemon height {daemon_height} ({behind} blocks behind)");
        } else {
            info!("caught up to daemon height {daemon_height}");
        }
        Ok(())
    }

    /// Fetch batches until the cache is at budget. Returns false when there
    /// is nothing left to fetch (caught up).
    async fn prefetch_blocks(&self) -> Result<bool> {
        let daemon_height = self.daemon.height().await?;
        let mut state = self.state.lock().await;
        while state.cache_size < self.min_cache_size {
            let cache_room = (self.min_cache_size / state.ave_size).max(1);
            let behind = (daemon_height as i64 + 1) - state.next_height as i64;
            let count = behind.clamp(0, cache_room.min(MAX_FETCH_COUNT) as i64) as usize;
            if count == 0 {
                self.caught_up.store(true, Ordering::Relaxed);
                return Ok(false);
            }

            let first = state.next_height;
            let hex_hashes = self.daemon.block_hex_hashes(first, count).await?;
            if self.caught_up.load(Ordering::Relaxed) {
                if let Some(last) = hex_hashes.last() {
                    info!(
                        "new block height {} hash {last}",
                        first + hex_hashes.len() as Height - 1
                    );
                }
            }
            let mut blocks = self.daemon.raw_blocks(&hex_hashes).await?;
            let count = blocks.len();
            if count == 0 {
                return Ok(false);
            }

            if first == 0 {
                blocks[0] = coin::genesis_block(std::mem::take(&mut blocks[0]))?;
                info!("verified genesis block with hash {}", hex_hashes[0]);
            }

            let size: usize = blocks.iter().map(Vec::len).sum();
            // Simple average over big batches, smoothed for small ones.
            if count >= 10 {
                state.ave_size = size / count;
            } else {
                state.ave_size = (size + (10 - count) * state.ave_size) / 10;
            }

            state.blocks.extend(blocks);
            state.cache_size += size;
            state.next_height += count as Height;
            self.blocks_event.notify_one();
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{serialize_tx, write_compact_size, Tx, TxInput, TxOutput};
    use crate::coin::HEADER_SIZE;
    use crate::daemon::testing::FakeDaemon;
    use crate::types::Hash32;

    fn raw_block(prev: Hash32, seed: u8) -> Vec<u8> {
        let mut header = vec![0u8; HEADER_SIZE];
        header[0] = seed;
        header[4..36].copy_from_slice(&prev.0);
        let tx = Tx {
            version: 1,
            inputs: vec![TxInput {
                prev_hash: Hash32([0u8; 32]),
                prev_idx: u32::MAX,
                script_sig: vec![seed],
                sequence: 0,
            }],
            outputs: vec![TxOutput {
                value: 50,
                pk_script: vec![0x51, seed],
            }],
            locktime: 0,
            raw: Vec::new(),
        };
        let mut raw = header;
        write_compact_size(&mut raw, 1);
        raw.extend(serialize_tx(&tx));
        raw
    }

    fn chain_of(len: usize) -> (Arc<FakeDaemon>, Vec<Vec<u8>>) {
        let daemon = FakeDaemon::new();
        let mut prev = Hash32([0u8; 32]);
        let mut blocks = Vec::new();
        for n in 0..len {
            let raw = raw_block(prev, n as u8 + 1);
            prev = crate::coin::header_hash(&raw[..HEADER_SIZE]);
            daemon.push_block(raw.clone());
            blocks.push(raw);
        }
        (daemon, blocks)
    }

    #[tokio::test]
    async fn fetches_chain_from_given_height() {
        let (daemon, blocks) = chain_of(5);
        let prefetcher = Prefetcher::new(daemon, DEFAULT_MIN_CACHE_SIZE, Duration::from_millis(1));
        prefetcher.reset_height(1).await.unwrap();
        prefetcher.prefetch_blocks().await.unwrap();
        let fetched = prefetcher.take_prefetched().await;
        assert_eq!(fetched, blocks[1..].to_vec());
    }

    #[tokio::test]
    async fn caught_up_when_nothing_to_fetch() {
        let (daemon, _) = chain_of(3);
        let prefetcher = Prefetcher::new(daemon, DEFAULT_MIN_CACHE_SIZE, Duration::from_millis(1));
        prefetcher.reset_height(3).await.unwrap();
        assert!(!prefetcher.prefetch_blocks().await.unwrap());
        assert!(prefetcher.take_prefetched().await.is_empty());
    }

    #[tokio::test]
    async fn reset_clears_cache() {
        let (daemon, blocks) = chain_of(4);
        let prefetcher = Prefetcher::new(daemon, DEFAULT_MIN_CACHE_SIZE, Duration::from_millis(1));
        prefetcher.reset_height(1).await.unwrap();
        prefetcher.prefetch_blocks().await.unwrap();
        prefetcher.reset_height(2).await.unwrap();
        prefetcher.prefetch_blocks().await.unwrap();
        let fetched = prefetcher.take_prefetched().await;
        assert_eq!(fetched, blocks[2..].to_vec());
    }
}
