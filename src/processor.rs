/// Block processor: applies confirmed blocks to the claim database.
///
/// `advance_block` is a deterministic, single-threaded procedure: it scans
/// the block's transactions (UTXO accounting plus claim/support staging),
/// expires claims, resolves delayed activations and name takeovers, rebuilds
/// the bid-ordered index, and stages everything through the reversible op
/// stack. `flush` commits one atomic batch per block, with an undo record
/// while the block is within the reorg window. `backup_block` unwinds one
/// block from the tip.
///
/// Heavy bodies run inside `block_in_place` sections guarded by the shared
/// state lock. A sync body cannot be cancelled at an await point, so a
/// commit that has started always completes before shutdown proceeds.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};

use crate::block::{Block, TxInput};
use crate::coin;
use crate::daemon::Daemon;
use crate::db::ClaimDb;
use crate::error::{IndexerError, Result};
use crate::mempool::MemPool;
use crate::metrics;
use crate::prefetch::Prefetcher;
use crate::prefixes::{self, TakeoverValue};
use crate::script::{self, ClaimOp, ClaimPayload, ClaimScript};
use crate::search::{ClaimIndexOp, SearchIndex};
use crate::staging::{BlockStaging, PendingActivation, StagedClaim, TrendingNotification};
use crate::types::{ClaimHash, Hash32, HashX, Height, TxNum};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Winner selection: maximum effective amount, ties broken by the greater
/// claim hash. Must stay stable; it is consensus-visible.
fn argmax_claim(amounts: &BTreeMap<ClaimHash, u64>) -> Option<ClaimHash> {
    amounts
        .iter()
        .max_by_key(|(hash, amount)| (**amount, **hash))
        .map(|(hash, _)| *hash)
}

/// Scratch state for one takeover resolution pass.
#[derive(Default)]
struct TakeoverContext {
    /// Controlling claims as of the previous block, cached per name.
    controlling: HashMap<String, Option<TakeoverValue>>,
    names_with_abandoned_or_updated: BTreeSet<String>,
    /// Activations applying at this height, pre-scheduled plus delay-zero.
    activated_at_height: BTreeMap<(ClaimHash, String), Vec<PendingActivation>>,
    /// This block's delayed activations, by name and claim.
    activate_in_future: BTreeMap<String, BTreeMap<ClaimHash, Vec<(PendingActivation, u64)>>>,
    /// Claims with any pending future activation, per name.
    future_activations: BTreeMap<String, BTreeSet<ClaimHash>>,
}

pub struct BlockProcessor<D: Daemon, S: SearchIndex> {
    pub db: ClaimDb,
    daemon: Arc<D>,
    search: S,
    pub mempool: Arc<MemPool<D>>,
    pub prefetcher: Arc<Prefetcher<D>>,
    state_lock: Arc<Mutex<()>>,
    shutdown: Arc<Notify>,

    pub height: Height,
    pub tip: Hash32,
    pub tx_count: u64,
    caught_up: bool,

    staging: BlockStaging,
    touched_hashxs: BTreeSet<HashX>,

    // Cumulative (across blocks until emitted) search-index accumulators.
    touched_claims_to_send_es: BTreeSet<ClaimHash>,
    removed_claims_to_send_es: BTreeSet<ClaimHash>,
    activation_info_to_send_es: BTreeMap<String, Vec<TrendingNotification>>,
}

impl<D: Daemon, S: SearchIndex> BlockProcessor<D, S> {
    pub fn new(
        db: ClaimDb,
        daemon: Arc<D>,
        search: S,
        mempool: Arc<MemPool<D>>,
        prefetcher: Arc<Prefetcher<D>>,
        state_lock: Arc<Mutex<()>>,
        shutdown: Arc<Notify>,
    ) -> BlockProcessor<D, S> {
        let height = db.state.db_height;
        let tip = db.state.db_tip;
        let tx_count = db.state.db_tx_count;
        BlockProcessor {
            db,
            daemon,
            search,
            mempool,
            prefetcher,
            state_lock,
            shutdown,
            height,
            tip,
            tx_count,
            caught_up: false,
            staging: BlockStaging::new(),
            touched_hashxs: BTreeSet::new(),
            touched_claims_to_send_es: BTreeSet::new(),
            removed_claims_to_send_es: BTreeSet::new(),
            activation_info_to_send_es: BTreeMap::new(),
        }
    }

    /// Height the next block must arrive at.
    pub fn next_height(&self) -> Height {
        if self.db.is_empty_chain() {
            0
        } else {
            self.height + 1
        }
    }

    // =======================================================================
    // control loop

    /// Fetch, process and index blocks until shutdown or a fatal error.
    pub async fn fetch_and_process_blocks(&mut self) -> Result<()> {
        self.search.start().await?;
        loop {
            if !self.caught_up && self.next_height() > self.daemon.cached_height() {
                self.first_caught_up().await?;
                self.caught_up = true;
            }
            self.prefetcher.blocks_event.notified().await;
            let blocks = self.prefetcher.take_prefetched().await;
            if let Err(e) = self.check_and_advance_blocks(blocks).await {
                error!("block processing failed: {e}");
                return Err(e);
            }
        }
    }

    /// Process a batch of raw blocks, detecting and handling reorgs.
    pub async fn check_and_advance_blocks(&mut self, raw_blocks: Vec<Vec<u8>>) -> Result<()> {
        if raw_blocks.is_empty() {
            return Ok(());
        }
        let first = self.next_height();
        let mut blocks = Vec::with_capacity(raw_blocks.len());
        for (n, raw) in raw_blocks.iter().enumerate() {
            blocks.push(Block::parse(raw, first + n as Height)?);
        }
        let hprevs: Vec<Hash32> = blocks
            .iter()
            .map(|b| coin::header_prev_hash(&b.header))
            .collect();
        let mut chain = vec![self.tip];
        chain.extend(
            blocks[..blocks.len() - 1]
                .iter()
                .map(|b| coin::header_hash(&b.header)),
        );

        if hprevs == chain {
            let total_start = Instant::now();
            for block in &blocks {
                let start = Instant::now();
                self.run_sync(|bp| bp.advance_block(block))?;
                self.flush().await?;
                info!(
                    "advanced to {} in {:.3}s",
                    self.height,
                    start.elapsed().as_secs_f64()
                );
                if self.height == coin::EXTENDED_CLAIM_EXPIRATION_FORK_HEIGHT {
                    warn!(
                        "applying extended claim expiration fork on claims accepted by {}",
                        self.height
                    );
                    let lock = self.state_lock.clone();
                    let _guard = lock.lock().await;
                    self.run_sync(|bp| bp.db.apply_expiration_extension_fork())?;
                }
                if self.db.state.first_sync {
                    self.search.clear_caches();
                    self.touched_claims_to_send_es.clear();
                    self.removed_claims_to_send_es.clear();
                    self.activation_info_to_send_es.clear();
                }
            }
            if !self.db.state.first_sync {
                self.emit_search().await?;
            }
            self.search.clear_caches();
            self.touched_claims_to_send_es.clear();
            self.removed_claims_to_send_es.clear();
            self.activation_info_to_send_es.clear();

            let elapsed = total_start.elapsed().as_secs_f64();
            metrics::BLOCK_COUNT.set(self.height as i64);
            metrics::BLOCK_TIME.observe(elapsed);
            if !self.db.state.first_sync {
                info!("processed {} block(s) in {:.1}s", blocks.len(), elapsed);
            }
            if self.caught_up {
                let touched = std::mem::take(&mut self.touched_hashxs);
                self.mempool.on_block(&touched, self.height).await;
            } else {
                self.touched_hashxs.clear();
            }
        } else if hprevs[0] != chain[0] {
            self.handle_reorg().await?;
        } else {
            // The daemon reorged while serving the batched hash requests.
            // Rare enough that resetting the prefetcher and retrying is the
            // simplest correct response.
            warn!("daemon blocks do not form a chain; resetting the prefetcher");
            self.prefetcher.reset_height(self.next_height()).await?;
        }
        Ok(())
    }

    async fn handle_reorg(&mut self) -> Result<()> {
        let reorg_limit = self.db.reorg_limit;
        let min_start_height = self.height.saturating_sub(reorg_limit);
        let daemon_hashes = self
            .daemon
            .block_hex_hashes(min_start_height, reorg_limit as usize)
            .await?;
        let heights: Vec<Height> =
            (min_start_height..min_start_height + daemon_hashes.len() as Height).collect();
        let mut count = 1usize;
        for (height, daemon_hash) in heights.iter().zip(daemon_hashes.iter()).rev() {
            let ours = self.db.block_hash_at(*height)?.map(|h| h.rpc_hex());
            if ours.as_deref() == Some(daemon_hash.as_str()) {
                break;
            }
            count += 1;
        }
        warn!(
            "blockchain reorg detected at {}, unwinding last {count} blocks",
            self.height
        );
        for _ in 0..count {
            self.backup_block().await?;
            info!("backed up to height {}", self.height);

            let touched: Vec<ClaimHash> = self.touched_claims_to_send_es.iter().copied().collect();
            for claim_hash in touched {
                if self.db.claim_txo(&claim_hash)?.is_none() {
                    self.removed_claims_to_send_es.insert(claim_hash);
                }
            }
            for removed in self.removed_claims_to_send_es.clone() {
                self.touched_claims_to_send_es.remove(&removed);
            }
            let ops = self.build_claim_ops()?;
            self.search.claim_consumer(ops).await?;
            self.search.clear_caches();
            self.touched_claims_to_send_es.clear();
            self.removed_claims_to_send_es.clear();
            self.activation_info_to_send_es.clear();
        }
        self.prefetcher.reset_height(self.next_height()).await?;
        metrics::REORG_COUNT.inc();
        Ok(())
    }

    /// Run a blocking mutation body off the async reactor. Sync bodies have
    /// no cancellation points, so a started commit always completes.
    fn run_sync<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        tokio::task::block_in_place(|| f(self))
    }

    /// Commit the staged block. An undo record is persisted iff the block is
    /// still within the reorg window.
    pub async fn flush(&mut self) -> Result<()> {
        let save_undo = (self.daemon.cached_height() as i64 - self.height as i64)
            <= self.db.reorg_limit as i64;
        let lock = self.state_lock.clone();
        let _guard = lock.lock().await;
        self.run_sync(|bp| bp.flush_sync(save_undo))
    }

    fn flush_sync(&mut self, save_undo: bool) -> Result<()> {
        let now = now_ms();
        if self.db.state.last_flush_ms > 0 {
            self.db.state.wall_time_ms += now.saturating_sub(self.db.state.last_flush_ms);
        }
        self.db.state.last_flush_ms = now;
        self.db.write_db_state()?;
        if save_undo {
            self.db.stack.commit(self.height)?;
        } else {
            self.db.stack.unsafe_commit()?;
        }
        self.staging.clear();
        self.mempool.clear_notified();
        self.db.assert_db_state()
    }

    async fn first_caught_up(&mut self) -> Result<()> {
        info!("caught up to height {}", self.height);
        let was_first_sync = self.db.state.first_sync;
        self.db.state.first_sync = false;
        let lock = self.state_lock.clone();
        let _guard = lock.lock().await;
        self.run_sync(|bp| {
            bp.db.write_db_state()?;
            bp.db.stack.unsafe_commit()?;
            bp.db.assert_db_state()
        })?;
        if was_first_sync {
            info!(
                "{} synced to height {}, halting here.",
                env!("CARGO_PKG_VERSION"),
                self.height
            );
            self.shutdown.notify_waiters();
        }
        Ok(())
    }

    fn build_claim_ops(&self) -> Result<Vec<ClaimIndexOp>> {
        let mut ops: Vec<ClaimIndexOp> = self
            .removed_claims_to_send_es
            .iter()
            .map(|hash| ClaimIndexOp::Delete(hash.hex()))
            .collect();
        let touched: Vec<ClaimHash> = self.touched_claims_to_send_es.iter().copied().collect();
        let projections =
            tokio::task::block_in_place(|| self.db.claims_producer(&touched))?;
        ops.extend(projections.into_iter().map(ClaimIndexOp::Update));
        Ok(ops)
    }

    async fn emit_search(&mut self) -> Result<()> {
        let ops = self.build_claim_ops()?;
        self.search.claim_consumer(ops).await?;
        self.search.apply_filters(&[], &[], &[], &[]).await?;
        self.search
            .update_trending_score(&self.activation_info_to_send_es)
            .await?;
        // Record how far the search index has been fed.
        let lock = self.state_lock.clone();
        let _guard = lock.lock().await;
        self.run_sync(|bp| {
            bp.db.state.es_sync_height = bp.height;
            bp.db.write_db_state()?;
            bp.db.stack.unsafe_commit()?;
            bp.db.assert_db_state()
        })?;
        Ok(())
    }

    // =======================================================================
    // advance

    pub fn advance_block(&mut self, block: &Block) -> Result<()> {
        let height = self.next_height();
        if block.height != height {
            return Err(IndexerError::chain(format!(
                "block height {} does not follow {}",
                block.height, height
            )));
        }
        let header_hash = coin::header_hash(&block.header);
        self.db.stack.stage_put(
            prefixes::block_hash_key(height),
            header_hash.0.to_vec(),
        )?;
        self.db
            .stack
            .stage_put(prefixes::header_key(height), block.header.to_vec())?;
        let tx_hashes: Vec<Hash32> = block.transactions.iter().map(|(_, h)| *h).collect();
        self.db.stack.stage_put(
            prefixes::block_txs_key(height),
            prefixes::block_txs_value(&tx_hashes),
        )?;

        let mut tx_count = self.tx_count;
        for (tx, tx_hash) in &block.transactions {
            let mut spent_claims: BTreeMap<ClaimHash, (TxNum, u32, String)> = BTreeMap::new();

            self.db
                .stack
                .stage_put(prefixes::tx_key(tx_hash), tx.raw.clone())?;
            self.db.stack.stage_put(
                prefixes::tx_num_key(tx_hash),
                prefixes::amount_value(tx_count),
            )?;
            self.db
                .stack
                .stage_put(prefixes::tx_hash_key(tx_count), tx_hash.0.to_vec())?;

            // Spend the inputs.
            for txin in &tx.inputs {
                if txin.is_generation() {
                    continue;
                }
                if let Some(hashx) = self.spend_utxo(&txin.prev_hash, txin.prev_idx)? {
                    let history = self.staging.hashxs_by_tx.entry(hashx).or_default();
                    if !history.contains(&tx_count) {
                        history.push(tx_count);
                    }
                }
                let txin_num = self.pending_tx_num(&txin.prev_hash)?;
                self.spend_claim_or_support_txo(height, txin_num, txin.prev_idx, &mut spent_claims)?;
            }

            // Add the new UTXOs and claim/support outputs.
            for (nout, txout) in tx.outputs.iter().enumerate() {
                let nout = nout as u32;
                if let Some(hashx) = self.add_utxo(tx_hash, tx_count, nout, txout.value, &txout.pk_script)? {
                    let history = self.staging.hashxs_by_tx.entry(hashx).or_default();
                    if !history.contains(&tx_count) {
                        history.push(tx_count);
                    }
                }
                self.add_claim_or_support(
                    height,
                    tx_hash,
                    tx_count,
                    nout,
                    txout.value,
                    &txout.pk_script,
                    tx.inputs.first(),
                    &mut spent_claims,
                )?;
            }

            // Whatever remains in spent_claims was abandoned. Channels go
            // last so signed claims abandoned in the same transaction see
            // the channel while it still exists.
            let mut abandoned_channels = Vec::new();
            for (claim_hash, (tx_num, nout, normalized_name)) in spent_claims {
                if coin::is_channel_name(&normalized_name) {
                    abandoned_channels.push((claim_hash, tx_num, nout, normalized_name));
                } else {
                    self.abandon_claim(claim_hash, tx_num, nout, &normalized_name)?;
                }
            }
            for (claim_hash, tx_num, nout, normalized_name) in abandoned_channels {
                self.abandon_claim(claim_hash, tx_num, nout, &normalized_name)?;
            }

            self.staging.pending_transactions.insert(tx_count, *tx_hash);
            self.staging
                .pending_transaction_num_mapping
                .insert(*tx_hash, tx_count);
            tx_count += 1;
        }

        self.expire_claims(height)?;
        self.takeover_ops(height)?;
        self.cumulative_update_ops(height)?;

        self.db.stack.stage_put(
            prefixes::tx_count_key(height),
            prefixes::amount_value(tx_count),
        )?;
        for (hashx, history) in std::mem::take(&mut self.staging.hashxs_by_tx) {
            if history.is_empty() {
                continue;
            }
            self.db.stack.stage_put(
                prefixes::hashx_history_key(&hashx, height),
                prefixes::hashx_history_value(&history),
            )?;
        }

        let touched: Vec<ClaimHash> = self.staging.touched_claim_hashes.iter().copied().collect();
        let removed: Vec<ClaimHash> = self.staging.removed_claim_hashes.iter().copied().collect();
        self.db.stack.stage_put(
            prefixes::touched_or_deleted_key(height),
            prefixes::touched_or_deleted_value(&touched, &removed),
        )?;

        self.tx_count = tx_count;
        self.db.tx_counts.push(tx_count);
        self.db.headers.push(block.header);
        self.height = height;
        self.tip = header_hash;

        // Drop undo and touched records beyond the reorg window.
        let min_keep = height.saturating_sub(self.db.reorg_limit);
        if min_keep > 0 {
            for (key, value) in self.db.prunable_below(prefixes::UNDO, min_keep - 1)? {
                self.db.stack.stage_delete(key, value)?;
            }
            for (key, value) in self
                .db
                .prunable_below(prefixes::TOUCHED_OR_DELETED, min_keep - 1)?
            {
                self.db.stack.stage_delete(key, value)?;
            }
        }

        self.db.state.db_height = height;
        self.db.state.db_tx_count = tx_count;
        self.db.state.db_tip = self.tip;
        self.db.state.hist_flush_count += 1;
        self.db.state.utxo_flush_count = self.db.state.hist_flush_count;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // utxo accounting

    fn pending_tx_num(&self, tx_hash: &Hash32) -> Result<TxNum> {
        if let Some(tx_num) = self.staging.pending_transaction_num_mapping.get(tx_hash) {
            return Ok(*tx_num);
        }
        self.db.tx_num(tx_hash)?.ok_or_else(|| {
            IndexerError::chain(format!("prevout references unknown transaction {tx_hash}"))
        })
    }

    fn add_utxo(
        &mut self,
        tx_hash: &Hash32,
        tx_num: TxNum,
        nout: u32,
        value: u64,
        pk_script: &[u8],
    ) -> Result<Option<HashX>> {
        let Some(hashx) = script::hashx_from_script(pk_script) else {
            return Ok(None);
        };
        self.touched_hashxs.insert(hashx);
        self.staging
            .utxo_cache
            .insert((*tx_hash, nout), (hashx, value));
        self.db.stack.stage_put(
            prefixes::utxo_key(&hashx, tx_num, nout),
            prefixes::amount_value(value),
        )?;
        self.db.stack.stage_put(
            prefixes::hashx_utxo_key(tx_hash, tx_num, nout),
            hashx.0.to_vec(),
        )?;
        Ok(Some(hashx))
    }

    fn spend_utxo(&mut self, tx_hash: &Hash32, nout: u32) -> Result<Option<HashX>> {
        if let Some((hashx, amount)) = self.staging.utxo_cache.remove(&(*tx_hash, nout)) {
            let txin_num = self.pending_tx_num(tx_hash)?;
            self.db.stack.stage_delete(
                prefixes::hashx_utxo_key(tx_hash, txin_num, nout),
                hashx.0.to_vec(),
            )?;
            self.db.stack.stage_delete(
                prefixes::utxo_key(&hashx, txin_num, nout),
                prefixes::amount_value(amount),
            )?;
            self.touched_hashxs.insert(hashx);
            return Ok(Some(hashx));
        }
        let txin_num = self.pending_tx_num(tx_hash)?;
        let Some(hashx) = self.db.hashx_for_utxo(tx_hash, txin_num, nout)? else {
            return Ok(None);
        };
        let Some(amount) = self.db.utxo_amount(&hashx, txin_num, nout)? else {
            warn!("{tx_hash}:{nout} is not found in UTXO db for {hashx:?}");
            return Err(IndexerError::chain(format!(
                "{tx_hash}:{nout} is not found in UTXO db"
            )));
        };
        self.touched_hashxs.insert(hashx);
        self.db.stack.stage_delete(
            prefixes::hashx_utxo_key(tx_hash, txin_num, nout),
            hashx.0.to_vec(),
        )?;
        self.db.stack.stage_delete(
            prefixes::utxo_key(&hashx, txin_num, nout),
            prefixes::amount_value(amount),
        )?;
        Ok(Some(hashx))
    }

    // -----------------------------------------------------------------------
    // claim and support staging

    fn spend_claim_or_support_txo(
        &mut self,
        height: Height,
        txin_num: TxNum,
        prev_idx: u32,
        spent_claims: &mut BTreeMap<ClaimHash, (TxNum, u32, String)>,
    ) -> Result<()> {
        if !self.spend_claim_txo(txin_num, prev_idx, spent_claims)? {
            self.spend_support_txo(height, txin_num, prev_idx)?;
        }
        Ok(())
    }

    fn spend_claim_txo(
        &mut self,
        txin_num: TxNum,
        prev_idx: u32,
        spent_claims: &mut BTreeMap<ClaimHash, (TxNum, u32, String)>,
    ) -> Result<bool> {
        let spent = if let Some(staged) = self.staging.txo_to_claim.get(&(txin_num, prev_idx)) {
            staged.clone()
        } else {
            let Some((claim_hash, _)) = self.db.claim_from_txo(txin_num, prev_idx)? else {
                return Ok(false);
            };
            self.make_pending_claim_txo(&claim_hash)?
        };
        if let Some(reposted) = spent.reposted_claim_hash {
            self.staging.pending_reposted.insert(reposted);
        }
        if let Some(signing_hash) = spent.signing_hash {
            if spent.channel_signature_is_valid
                && !self.staging.abandoned_claims.contains_key(&signing_hash)
            {
                *self
                    .staging
                    .pending_channel_counts
                    .entry(signing_hash)
                    .or_insert(0) -= 1;
            }
        }
        spent_claims.insert(
            spent.claim_hash,
            (spent.tx_num, spent.position, spent.normalized_name.clone()),
        );
        self.stage_remove_claim_rows(&spent)?;
        Ok(true)
    }

    fn spend_support_txo(&mut self, height: Height, txin_num: TxNum, prev_idx: u32) -> Result<()> {
        let txo = (txin_num, prev_idx);
        if let Some((spent_support, support_amount)) = self.staging.support_txo_to_claim.remove(&txo)
        {
            if let Some(txos) = self.staging.support_txos_by_claim.get_mut(&spent_support) {
                txos.retain(|t| *t != txo);
            }
            if let Some(name) = self.pending_claim_name(&spent_support)? {
                self.staging
                    .removed_support_txos_by_name_by_claim
                    .entry(name)
                    .or_default()
                    .entry(spent_support)
                    .or_default()
                    .push(txo);
            }
            self.db.stack.stage_delete(
                prefixes::claim_to_support_key(&spent_support, txin_num, prev_idx),
                prefixes::amount_value(support_amount),
            )?;
            self.db.stack.stage_delete(
                prefixes::support_to_claim_key(txin_num, prev_idx),
                prefixes::claim_hash_value(&spent_support),
            )?;
            *self
                .staging
                .pending_support_amount_change
                .entry(spent_support)
                .or_insert(0) -= support_amount as i64;
            return Ok(());
        }

        let Some((spent_support, support_amount)) =
            self.db.supported_claim_from_txo(txin_num, prev_idx)?
        else {
            return Ok(());
        };
        if let Some(name) = self.pending_claim_name(&spent_support)? {
            self.staging
                .removed_support_txos_by_name_by_claim
                .entry(name.clone())
                .or_default()
                .entry(spent_support)
                .or_default()
                .push(txo);
            if let Some(activation) =
                self.db
                    .activation(prefixes::SUPPORT_TXO_TYPE, txin_num, prev_idx)?
            {
                if activation.activation_height < height {
                    self.staging
                        .removed_active_support_amount_by_claim
                        .entry(spent_support)
                        .or_default()
                        .push(support_amount);
                }
                self.stage_remove_activate(
                    prefixes::SUPPORT_TXO_TYPE,
                    &spent_support,
                    txin_num,
                    prev_idx,
                    activation.activation_height,
                    &name,
                    support_amount,
                )?;
            }
        } else if let Some(activation) =
            self.db
                .activation(prefixes::SUPPORT_TXO_TYPE, txin_num, prev_idx)?
        {
            if activation.activation_height < height {
                self.staging
                    .removed_active_support_amount_by_claim
                    .entry(spent_support)
                    .or_default()
                    .push(support_amount);
            }
        }
        self.db.stack.stage_delete(
            prefixes::claim_to_support_key(&spent_support, txin_num, prev_idx),
            prefixes::amount_value(support_amount),
        )?;
        self.db.stack.stage_delete(
            prefixes::support_to_claim_key(txin_num, prev_idx),
            prefixes::claim_hash_value(&spent_support),
        )?;
        *self
            .staging
            .pending_support_amount_change
            .entry(spent_support)
            .or_insert(0) -= support_amount as i64;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn add_claim_or_support(
        &mut self,
        height: Height,
        tx_hash: &Hash32,
        tx_num: TxNum,
        nout: u32,
        value: u64,
        pk_script: &[u8],
        first_input: Option<&TxInput>,
        spent_claims: &mut BTreeMap<ClaimHash, (TxNum, u32, String)>,
    ) -> Result<()> {
        let Some(claim_script) = ClaimScript::parse(pk_script) else {
            return Ok(());
        };
        match claim_script.op {
            ClaimOp::Name | ClaimOp::Update => self.add_claim_or_update(
                height,
                &claim_script,
                tx_hash,
                tx_num,
                nout,
                value,
                first_input,
                spent_claims,
            ),
            ClaimOp::Support => self.add_support(&claim_script, tx_num, nout, value),
        }
    }

    fn add_support(
        &mut self,
        claim_script: &ClaimScript,
        tx_num: TxNum,
        nout: u32,
        amount: u64,
    ) -> Result<()> {
        let supported_claim_hash = claim_script
            .claim_hash
            .ok_or_else(|| IndexerError::chain("support script without claim hash"))?;
        self.staging
            .support_txos_by_claim
            .entry(supported_claim_hash)
            .or_default()
            .push((tx_num, nout));
        self.staging
            .support_txo_to_claim
            .insert((tx_num, nout), (supported_claim_hash, amount));
        self.db.stack.stage_put(
            prefixes::claim_to_support_key(&supported_claim_hash, tx_num, nout),
            prefixes::amount_value(amount),
        )?;
        self.db.stack.stage_put(
            prefixes::support_to_claim_key(tx_num, nout),
            prefixes::claim_hash_value(&supported_claim_hash),
        )?;
        *self
            .staging
            .pending_support_amount_change
            .entry(supported_claim_hash)
            .or_insert(0) += amount as i64;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn add_claim_or_update(
        &mut self,
        height: Height,
        claim_script: &ClaimScript,
        tx_hash: &Hash32,
        tx_num: TxNum,
        nout: u32,
        amount: u64,
        first_input: Option<&TxInput>,
        spent_claims: &mut BTreeMap<ClaimHash, (TxNum, u32, String)>,
    ) -> Result<()> {
        let claim_name = coin::name_string(&claim_script.name);
        let normalized_name = coin::normalize_name(&claim_script.name);
        let claim_hash = match claim_script.op {
            ClaimOp::Name => script::claim_hash_for_new(tx_hash, nout),
            _ => claim_script
                .claim_hash
                .ok_or_else(|| IndexerError::chain("update script without claim hash"))?,
        };
        let payload = ClaimPayload::parse(claim_script.payload.as_deref().unwrap_or(&[]));

        let reposted_claim_hash = payload.reposted_claim_hash;
        if let Some(reposted) = reposted_claim_hash {
            self.staging.pending_reposted.insert(reposted);
        }
        if payload.is_channel {
            if let Some(ref public_key) = payload.channel_public_key {
                self.staging
                    .pending_channels
                    .insert(claim_hash, public_key.clone());
            }
        }

        self.staging.doesnt_have_valid_signature.insert(claim_hash);
        let mut channel_signature_is_valid = false;
        let signing_channel_hash = payload.signing_channel_hash;
        if let (Some(signing_hash), Some(signature)) = (signing_channel_hash, payload.signature) {
            match self.channel_public_key(&signing_hash) {
                Ok(Some(public_key)) => {
                    if let Some(first_input) = first_input {
                        let digest = script::signature_digest(
                            first_input,
                            &signing_hash,
                            &claim_script.name,
                            &payload.signed_body(),
                        );
                        if script::is_signature_valid(&signature, &digest, &public_key) {
                            channel_signature_is_valid = true;
                            *self
                                .staging
                                .pending_channel_counts
                                .entry(signing_hash)
                                .or_insert(0) += 1;
                            self.staging.doesnt_have_valid_signature.remove(&claim_hash);
                            self.staging.claim_channels.insert(claim_hash, signing_hash);
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("error validating channel signature for {tx_hash}:{nout}: {e}");
                }
            }
        }

        let (root_tx_num, root_position) = if claim_script.op == ClaimOp::Name {
            (tx_num, nout)
        } else {
            let Some(&(prev_tx_num, prev_idx, ref spent_name)) = spent_claims.get(&claim_hash)
            else {
                warn!("{tx_hash} contains unlinked claim update {claim_hash}");
                return Ok(());
            };
            if *spent_name != normalized_name {
                warn!("{tx_hash} contains mismatched name for claim update {claim_hash}");
                return Ok(());
            }
            let spent_name = spent_name.clone();
            spent_claims.remove(&claim_hash);
            self.staging.updated_claims.insert(claim_hash);
            if let Some(previous_claim) = self.staging.txo_to_claim.remove(&(prev_tx_num, prev_idx))
            {
                self.staging.claim_hash_to_txo.remove(&claim_hash);
                (previous_claim.root_tx_num, previous_claim.root_position)
            } else {
                let previous_claim = self.make_pending_claim_txo(&claim_hash)?;
                if let Some(activation) =
                    self.db
                        .activation(prefixes::CLAIM_TXO_TYPE, prev_tx_num, prev_idx)?
                {
                    self.stage_remove_activate(
                        prefixes::CLAIM_TXO_TYPE,
                        &claim_hash,
                        prev_tx_num,
                        prev_idx,
                        activation.activation_height,
                        &spent_name,
                        previous_claim.amount,
                    )?;
                }
                (previous_claim.root_tx_num, previous_claim.root_position)
            }
        };

        let pending = StagedClaim {
            name: claim_name,
            normalized_name,
            claim_hash,
            amount,
            expiration_height: coin::expiration_height(height, height),
            tx_num,
            position: nout,
            root_tx_num,
            root_position,
            channel_signature_is_valid,
            signing_hash: signing_channel_hash,
            reposted_claim_hash,
        };
        self.staging
            .txo_to_claim
            .insert((tx_num, nout), pending.clone());
        self.staging
            .claim_hash_to_txo
            .insert(claim_hash, (tx_num, nout));
        self.stage_add_claim_rows(&pending)
    }

    /// Locate a signing channel's public key, from this block's pending
    /// channels or from the channel claim's stored transaction.
    fn channel_public_key(&self, signing_hash: &ClaimHash) -> Result<Option<Vec<u8>>> {
        if let Some(public_key) = self.staging.pending_channels.get(signing_hash) {
            return Ok(Some(public_key.clone()));
        }
        let Some(channel) = self.db.claim_txo(signing_hash)? else {
            return Ok(None);
        };
        let Some(channel_tx_hash) = self.db.tx_hash_for_num(channel.tx_num)? else {
            return Ok(None);
        };
        let Some(raw_tx) = self.db.raw_tx(&channel_tx_hash)? else {
            return Ok(None);
        };
        let tx = crate::block::parse_tx(&raw_tx)?;
        let Some(output) = tx.outputs.get(channel.position as usize) else {
            return Ok(None);
        };
        let Some(channel_script) = ClaimScript::parse(&output.pk_script) else {
            return Ok(None);
        };
        let payload = ClaimPayload::parse(channel_script.payload.as_deref().unwrap_or(&[]));
        Ok(payload.channel_public_key)
    }

    /// Reconstruct the staged form of a claim from the last committed
    /// block's rows. Committed reads on purpose: by the time this runs for
    /// an update or abandon, the claim's rows are already staged deleted.
    fn make_pending_claim_txo(&self, claim_hash: &ClaimHash) -> Result<StagedClaim> {
        let claim = self.db.claim_txo_committed(claim_hash)?.ok_or_else(|| {
            IndexerError::chain(format!("missing claim txo for {claim_hash}"))
        })?;
        let signing_hash = if self.staging.doesnt_have_valid_signature.contains(claim_hash) {
            None
        } else {
            self.db
                .channel_for_claim_committed(claim_hash, claim.tx_num, claim.position)?
        };
        let reposted_claim_hash = self.db.repost_committed(claim_hash)?;
        let accepted_height = self.db.height_for_tx_num(claim.tx_num);
        Ok(StagedClaim {
            name: claim.name.clone(),
            normalized_name: coin::normalize_name(claim.name.as_bytes()),
            claim_hash: *claim_hash,
            amount: claim.amount,
            expiration_height: coin::expiration_height(accepted_height, self.next_height()),
            tx_num: claim.tx_num,
            position: claim.position,
            root_tx_num: claim.root_tx_num,
            root_position: claim.root_position,
            channel_signature_is_valid: claim.channel_signature_is_valid,
            signing_hash,
            reposted_claim_hash,
        })
    }

    fn stage_add_claim_rows(&mut self, pending: &StagedClaim) -> Result<()> {
        self.stage_claim_rows(pending, true)
    }

    fn stage_remove_claim_rows(&mut self, pending: &StagedClaim) -> Result<()> {
        self.stage_claim_rows(pending, false)
    }

    fn stage_claim_rows(&mut self, pending: &StagedClaim, add: bool) -> Result<()> {
        let mut op = |stack: &mut crate::revertable::RevertableOpStack,
                      key: Vec<u8>,
                      value: Vec<u8>|
         -> Result<()> {
            if add {
                stack.stage_put(key, value)
            } else {
                stack.stage_delete_unless_deleted(key, value)
            }
        };
        let claim_value = prefixes::ClaimToTxoValue {
            tx_num: pending.tx_num,
            position: pending.position,
            root_tx_num: pending.root_tx_num,
            root_position: pending.root_position,
            amount: pending.amount,
            channel_signature_is_valid: pending.channel_signature_is_valid,
            name: pending.name.clone(),
        };
        op(
            &mut self.db.stack,
            prefixes::claim_to_txo_key(&pending.claim_hash),
            prefixes::claim_to_txo_value(&claim_value),
        )?;
        op(
            &mut self.db.stack,
            prefixes::txo_to_claim_key(pending.tx_num, pending.position),
            prefixes::claim_with_name_value(&pending.claim_hash, &pending.normalized_name),
        )?;
        op(
            &mut self.db.stack,
            prefixes::claim_expiration_key(
                pending.expiration_height,
                pending.tx_num,
                pending.position,
            ),
            prefixes::claim_with_name_value(&pending.claim_hash, &pending.normalized_name),
        )?;
        let claim_hex = pending.claim_hash.hex();
        for prefix_len in 1..=10usize {
            op(
                &mut self.db.stack,
                prefixes::claim_short_id_key(
                    &pending.normalized_name,
                    &claim_hex[..prefix_len],
                    pending.root_tx_num,
                    pending.root_position,
                ),
                prefixes::txo_value(pending.tx_num, pending.position),
            )?;
        }
        if let Some(signing_hash) = pending.signing_hash {
            if pending.channel_signature_is_valid {
                op(
                    &mut self.db.stack,
                    prefixes::claim_to_channel_key(
                        &pending.claim_hash,
                        pending.tx_num,
                        pending.position,
                    ),
                    prefixes::claim_hash_value(&signing_hash),
                )?;
                op(
                    &mut self.db.stack,
                    prefixes::channel_to_claim_key(
                        &signing_hash,
                        &pending.normalized_name,
                        pending.tx_num,
                        pending.position,
                    ),
                    prefixes::claim_hash_value(&pending.claim_hash),
                )?;
            }
        }
        if let Some(reposted) = pending.reposted_claim_hash {
            op(
                &mut self.db.stack,
                prefixes::repost_key(&pending.claim_hash),
                prefixes::claim_hash_value(&reposted),
            )?;
            op(
                &mut self.db.stack,
                prefixes::reposted_claim_key(&reposted, pending.tx_num, pending.position),
                prefixes::claim_hash_value(&pending.claim_hash),
            )?;
        }
        Ok(())
    }

    fn abandon_claim(
        &mut self,
        claim_hash: ClaimHash,
        tx_num: TxNum,
        nout: u32,
        normalized_name: &str,
    ) -> Result<()> {
        let staged = if let Some(pending) = self.staging.txo_to_claim.remove(&(tx_num, nout)) {
            self.staging.claim_hash_to_txo.remove(&claim_hash);
            pending
        } else {
            let claim = self.db.claim_txo_committed(&claim_hash)?.ok_or_else(|| {
                IndexerError::chain(format!("abandoned claim {claim_hash} has no txo"))
            })?;
            let signing_hash = self.db.channel_for_claim_committed(&claim_hash, tx_num, nout)?;
            let reposted_claim_hash = self.db.repost_committed(&claim_hash)?;
            let accepted_height = self.db.height_for_tx_num(tx_num);
            StagedClaim {
                name: claim.name.clone(),
                normalized_name: normalized_name.to_string(),
                claim_hash,
                amount: claim.amount,
                expiration_height: coin::expiration_height(accepted_height, self.next_height()),
                tx_num,
                position: nout,
                root_tx_num: claim.root_tx_num,
                root_position: claim.root_position,
                channel_signature_is_valid: claim.channel_signature_is_valid,
                signing_hash,
                reposted_claim_hash,
            }
        };
        self.staging.abandoned_claims.insert(claim_hash, staged);
        if let Some(support_txos) = self.staging.support_txos_by_claim.remove(&claim_hash) {
            for txo in support_txos {
                self.staging.support_txo_to_claim.remove(&txo);
            }
        }
        self.activation_info_to_send_es.remove(&claim_hash.hex());
        if coin::is_channel_name(normalized_name) {
            self.invalidate_channel_signatures(&claim_hash)?;
        }
        Ok(())
    }

    fn stage_invalidate_signature_ops(&mut self, pending: &StagedClaim) -> Result<()> {
        let Some(signing_hash) = pending.signing_hash else {
            return Ok(());
        };
        self.db.stack.stage_delete_unless_deleted(
            prefixes::claim_to_channel_key(&pending.claim_hash, pending.tx_num, pending.position),
            prefixes::claim_hash_value(&signing_hash),
        )?;
        if pending.channel_signature_is_valid {
            self.db.stack.stage_delete_unless_deleted(
                prefixes::channel_to_claim_key(
                    &signing_hash,
                    &pending.normalized_name,
                    pending.tx_num,
                    pending.position,
                ),
                prefixes::claim_hash_value(&pending.claim_hash),
            )?;
            let old_value = prefixes::ClaimToTxoValue {
                tx_num: pending.tx_num,
                position: pending.position,
                root_tx_num: pending.root_tx_num,
                root_position: pending.root_position,
                amount: pending.amount,
                channel_signature_is_valid: true,
                name: pending.name.clone(),
            };
            let mut new_value = old_value.clone();
            new_value.channel_signature_is_valid = false;
            self.db.stack.stage_delete(
                prefixes::claim_to_txo_key(&pending.claim_hash),
                prefixes::claim_to_txo_value(&old_value),
            )?;
            self.db.stack.stage_put(
                prefixes::claim_to_txo_key(&pending.claim_hash),
                prefixes::claim_to_txo_value(&new_value),
            )?;
        }
        Ok(())
    }

    /// An abandoned channel orphans every claim it signed: their signatures
    /// flip invalid and the channel relation rows are removed.
    fn invalidate_channel_signatures(&mut self, channel_hash: &ClaimHash) -> Result<()> {
        for (signed_claim_hash, _, _, _) in self.db.claims_in_channel(channel_hash)? {
            if self.staging.abandoned_claims.contains_key(&signed_claim_hash)
                || self.staging.expired_claim_hashes.contains(&signed_claim_hash)
            {
                continue;
            }
            if self
                .staging
                .doesnt_have_valid_signature
                .contains(&signed_claim_hash)
            {
                continue;
            }
            // Claims re-signed in this block are handled in the staged pass.
            if self.staging.claim_channels.contains_key(&signed_claim_hash) {
                continue;
            }
            let claim = if let Some(txo) = self.staging.claim_hash_to_txo.get(&signed_claim_hash) {
                let staged = self.staging.txo_to_claim.get(txo).cloned().ok_or_else(|| {
                    IndexerError::InvariantViolated("claim txo map out of sync".into())
                })?;
                if staged.signing_hash != Some(*channel_hash) {
                    continue;
                }
                self.staging
                    .txo_to_claim
                    .insert(*txo, staged.invalidate_signature());
                staged
            } else {
                self.make_pending_claim_txo(&signed_claim_hash)?
            };
            self.staging.signatures_changed.insert(signed_claim_hash);
            *self
                .staging
                .pending_channel_counts
                .entry(*channel_hash)
                .or_insert(0) -= 1;
            self.stage_invalidate_signature_ops(&claim)?;
        }

        for staged in self.staging.txo_to_claim.values().cloned().collect::<Vec<_>>() {
            let needs_invalidate = !self
                .staging
                .doesnt_have_valid_signature
                .contains(&staged.claim_hash);
            if staged.signing_hash == Some(*channel_hash) && needs_invalidate {
                self.stage_invalidate_signature_ops(&staged)?;
                if let Some(txo) = self.staging.claim_hash_to_txo.get(&staged.claim_hash).copied() {
                    self.staging
                        .txo_to_claim
                        .insert(txo, staged.invalidate_signature());
                }
                self.staging.signatures_changed.insert(staged.claim_hash);
                *self
                    .staging
                    .pending_channel_counts
                    .entry(*channel_hash)
                    .or_insert(0) -= 1;
            }
        }
        Ok(())
    }

    /// Abandon every claim whose lifetime ends at this height. Channels are
    /// abandoned after their signed claims, and each claim exactly once.
    fn expire_claims(&mut self, height: Height) -> Result<()> {
        let expired = self.db.expired_by_height(height)?;
        for (_, _, claim_hash, _) in &expired {
            self.staging.expired_claim_hashes.insert(*claim_hash);
        }
        let mut spent_claims: BTreeMap<ClaimHash, (TxNum, u32, String)> = BTreeMap::new();
        for (tx_num, position, _, _) in &expired {
            if !self.staging.txo_to_claim.contains_key(&(*tx_num, *position)) {
                self.spend_claim_txo(*tx_num, *position, &mut spent_claims)?;
            }
        }
        if expired.is_empty() {
            return Ok(());
        }
        let mut expired_channels = Vec::new();
        for (claim_hash, (tx_num, nout, normalized_name)) in spent_claims {
            if coin::is_channel_name(&normalized_name) {
                expired_channels.push((claim_hash, tx_num, nout, normalized_name));
            } else {
                self.abandon_claim(claim_hash, tx_num, nout, &normalized_name)?;
            }
        }
        for (claim_hash, tx_num, nout, normalized_name) in expired_channels {
            self.abandon_claim(claim_hash, tx_num, nout, &normalized_name)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // pending amounts

    fn cached_active_amount(
        &mut self,
        claim_hash: &ClaimHash,
        txo_type: u8,
        height: Height,
    ) -> Result<u64> {
        if let Some(amount) = self.staging.amount_cache.get(&(*claim_hash, txo_type, height)) {
            return Ok(*amount);
        }
        let amount = if txo_type == prefixes::CLAIM_TXO_TYPE {
            if let Some(txo) = self.staging.claim_hash_to_txo.get(claim_hash) {
                self.staging
                    .txo_to_claim
                    .get(txo)
                    .map(|c| c.amount)
                    .unwrap_or(0)
            } else {
                self.db.active_claim_amount_as_of(claim_hash, height)?
            }
        } else {
            self.db.active_amount_as_of(claim_hash, txo_type, height)?
        };
        self.staging
            .amount_cache
            .insert((*claim_hash, txo_type, height), amount);
        Ok(amount)
    }

    fn pending_claim_amount(
        &mut self,
        name: &str,
        claim_hash: &ClaimHash,
        height: Height,
    ) -> Result<u64> {
        let key = (name.to_string(), *claim_hash);
        if self
            .staging
            .activated_claim_amount_by_name_and_hash
            .contains_key(&key)
        {
            if let Some(txo) = self.staging.claim_hash_to_txo.get(claim_hash) {
                if let Some(staged) = self.staging.txo_to_claim.get(txo) {
                    return Ok(staged.amount);
                }
            }
            return Ok(self.staging.activated_claim_amount_by_name_and_hash[&key]);
        }
        if let Some(amount) = self
            .staging
            .possible_future_claim_amount_by_name_and_hash
            .get(&key)
        {
            return Ok(*amount);
        }
        self.cached_active_amount(claim_hash, prefixes::CLAIM_TXO_TYPE, height)
    }

    fn pending_supported_amount(&mut self, claim_hash: &ClaimHash, height: Height) -> Result<u64> {
        let mut amount =
            self.cached_active_amount(claim_hash, prefixes::SUPPORT_TXO_TYPE, height)? as i64;
        if let Some(activated) = self.staging.activated_support_amount_by_claim.get(claim_hash) {
            amount += activated.iter().sum::<u64>() as i64;
        }
        if let Some(future) = self
            .staging
            .possible_future_support_amounts_by_claim_hash
            .get(claim_hash)
        {
            amount += future.iter().sum::<u64>() as i64;
        }
        if let Some(removed) = self
            .staging
            .removed_active_support_amount_by_claim
            .get(claim_hash)
        {
            amount -= removed.iter().sum::<u64>() as i64;
        }
        Ok(amount.max(0) as u64)
    }

    fn pending_effective_amount(
        &mut self,
        name: &str,
        claim_hash: &ClaimHash,
        height: Height,
    ) -> Result<u64> {
        let claim_amount = self.pending_claim_amount(name, claim_hash, height)?;
        let support_amount = self.pending_supported_amount(claim_hash, height)?;
        Ok(claim_amount + support_amount)
    }

    fn pending_claim_name(&self, claim_hash: &ClaimHash) -> Result<Option<String>> {
        if let Some(txo) = self.staging.claim_hash_to_txo.get(claim_hash) {
            return Ok(self
                .staging
                .txo_to_claim
                .get(txo)
                .map(|c| c.normalized_name.clone()));
        }
        Ok(self
            .db
            .claim_txo(claim_hash)?
            .map(|c| coin::normalize_name(c.name.as_bytes())))
    }

    // -----------------------------------------------------------------------
    // activation staging

    #[allow(clippy::too_many_arguments)]
    fn stage_activate(
        &mut self,
        txo_type: u8,
        claim_hash: &ClaimHash,
        tx_num: TxNum,
        position: u32,
        activation_height: Height,
        name: &str,
        amount: u64,
    ) -> Result<()> {
        self.db.stack.stage_put(
            prefixes::activated_key(txo_type, tx_num, position),
            prefixes::activated_value(&prefixes::ActivationValue {
                activation_height,
                claim_hash: *claim_hash,
                normalized_name: name.to_string(),
            }),
        )?;
        self.db.stack.stage_put(
            prefixes::pending_activation_key(activation_height, txo_type, tx_num, position),
            prefixes::claim_with_name_value(claim_hash, name),
        )?;
        self.db.stack.stage_put(
            prefixes::active_amount_key(claim_hash, txo_type, activation_height, tx_num, position),
            prefixes::amount_value(amount),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn stage_remove_activate(
        &mut self,
        txo_type: u8,
        claim_hash: &ClaimHash,
        tx_num: TxNum,
        position: u32,
        activation_height: Height,
        name: &str,
        amount: u64,
    ) -> Result<()> {
        self.db.stack.stage_delete(
            prefixes::activated_key(txo_type, tx_num, position),
            prefixes::activated_value(&prefixes::ActivationValue {
                activation_height,
                claim_hash: *claim_hash,
                normalized_name: name.to_string(),
            }),
        )?;
        self.db.stack.stage_delete(
            prefixes::pending_activation_key(activation_height, txo_type, tx_num, position),
            prefixes::claim_with_name_value(claim_hash, name),
        )?;
        self.db.stack.stage_delete(
            prefixes::active_amount_key(claim_hash, txo_type, activation_height, tx_num, position),
            prefixes::amount_value(amount),
        )
    }

    // -----------------------------------------------------------------------
    // takeover resolution

    /// Remove a name's takeover row. A name can lose its controlling claim
    /// twice in one block (candidates emptied, then a fresh claim wins);
    /// the second delete would double-stage, so skip it.
    fn stage_takeover_delete(&mut self, name: &str, controlling: &TakeoverValue) -> Result<()> {
        let key = prefixes::claim_takeover_key(name);
        if matches!(
            self.db.stack.get_staged(&key),
            Some(crate::revertable::Staged::Deleted)
        ) {
            return Ok(());
        }
        self.db
            .stack
            .stage_delete(key, prefixes::claim_takeover_value(controlling))
    }

    fn controlling_cached(
        &self,
        ctx: &mut TakeoverContext,
        name: &str,
    ) -> Result<Option<TakeoverValue>> {
        if let Some(cached) = ctx.controlling.get(name) {
            return Ok(cached.clone());
        }
        let controlling = self.db.controlling_claim(name)?;
        ctx.controlling.insert(name.to_string(), controlling.clone());
        Ok(controlling)
    }

    /// Schedule (or immediately apply) the activation for a freshly staged
    /// claim or support, per the delay rules.
    #[allow(clippy::too_many_arguments)]
    fn delayed_activate_ops(
        &mut self,
        ctx: &mut TakeoverContext,
        height: Height,
        name: &str,
        claim_hash: ClaimHash,
        is_new_claim: bool,
        tx_num: TxNum,
        nout: u32,
        amount: u64,
        is_support: bool,
    ) -> Result<()> {
        let controlling = self.controlling_cached(ctx, name)?;
        let delay = match controlling {
            // Unclaimed names, updates to the winner, and names whose winner
            // left this block all activate immediately.
            None => 0,
            Some(ref c)
                if c.claim_hash == claim_hash
                    || ctx.names_with_abandoned_or_updated.contains(name) =>
            {
                0
            }
            Some(ref c) if is_new_claim => coin::delay_for_name(height.saturating_sub(c.height)),
            Some(ref c) => {
                // An update only waits if it could flip the name.
                let controlling_effective =
                    self.pending_effective_amount(name, &c.claim_hash, height)?;
                let staged_effective = self.pending_effective_amount(name, &claim_hash, height)?;
                if staged_effective > controlling_effective {
                    coin::delay_for_name(height.saturating_sub(c.height))
                } else {
                    0
                }
            }
        };

        let txo_type = if is_support {
            prefixes::SUPPORT_TXO_TYPE
        } else {
            prefixes::CLAIM_TXO_TYPE
        };
        if delay == 0 {
            // Considered for takeover in this very block.
            ctx.activated_at_height
                .entry((claim_hash, name.to_string()))
                .or_default()
                .push(PendingActivation {
                    height,
                    txo_type,
                    tx_num,
                    position: nout,
                });
        } else {
            ctx.activate_in_future
                .entry(name.to_string())
                .or_default()
                .entry(claim_hash)
                .or_default()
                .push((
                    PendingActivation {
                        height: height + delay,
                        txo_type,
                        tx_num,
                        position: nout,
                    },
                    amount,
                ));
            if is_support {
                self.staging
                    .possible_future_support_txos_by_claim_hash
                    .entry(claim_hash)
                    .or_default()
                    .push((tx_num, nout));
            }
        }
        self.stage_activate(
            txo_type,
            &claim_hash,
            tx_num,
            nout,
            height + delay,
            name,
            amount,
        )
    }

    fn takeover_ops(&mut self, height: Height) -> Result<()> {
        let mut ctx = TakeoverContext::default();

        // Previously scheduled activations landing at this block.
        for ((claim_hash, name), (txo_type, tx_num, position)) in
            self.db.activated_at_height(height)?
        {
            ctx.activated_at_height
                .entry((claim_hash, name))
                .or_default()
                .push(PendingActivation {
                    height,
                    txo_type,
                    tx_num,
                    position,
                });
        }

        // Names losing their controlling claim this block; deactivate the
        // abandoned claims.
        for (claim_hash, staged) in self.staging.abandoned_claims.clone() {
            let controlling = self.controlling_cached(&mut ctx, &staged.normalized_name)?;
            if controlling
                .as_ref()
                .map(|c| c.claim_hash == claim_hash)
                .unwrap_or(false)
            {
                ctx.names_with_abandoned_or_updated
                    .insert(staged.normalized_name.clone());
            }
            if let Some(activation) =
                self.db
                    .activation(prefixes::CLAIM_TXO_TYPE, staged.tx_num, staged.position)?
            {
                self.stage_remove_activate(
                    prefixes::CLAIM_TXO_TYPE,
                    &staged.claim_hash,
                    staged.tx_num,
                    staged.position,
                    activation.activation_height,
                    &staged.normalized_name,
                    staged.amount,
                )?;
            }
        }

        // Removed active supports against controlling claims can trigger
        // takeovers even with no new activity on the name.
        let mut abandoned_support_check_need_takeover: BTreeSet<(String, ClaimHash)> =
            BTreeSet::new();
        for (claim_hash, _) in self.staging.removed_active_support_amount_by_claim.clone() {
            let Some(name) = self.pending_claim_name(&claim_hash)? else {
                continue;
            };
            let controlling = self.controlling_cached(&mut ctx, &name)?;
            if controlling
                .as_ref()
                .map(|c| c.claim_hash == claim_hash)
                .unwrap_or(false)
                && !ctx.names_with_abandoned_or_updated.contains(&name)
            {
                abandoned_support_check_need_takeover.insert((name, claim_hash));
            }
        }

        // Updates to the controlling claim re-open the name.
        for claim_hash in self.staging.updated_claims.clone() {
            if self.staging.abandoned_claims.contains_key(&claim_hash) {
                continue;
            }
            let Some(name) = self.pending_claim_name(&claim_hash)? else {
                continue;
            };
            let controlling = self.controlling_cached(&mut ctx, &name)?;
            if controlling
                .as_ref()
                .map(|c| c.claim_hash == claim_hash)
                .unwrap_or(false)
            {
                ctx.names_with_abandoned_or_updated.insert(name);
            }
        }

        // Activation (or delayed activation) for the claims staged this block.
        for ((tx_num, nout), staged) in self.staging.txo_to_claim.clone() {
            let mut is_delayed = !staged.is_update();
            if let Some(prev_txo) = self.db.claim_txo_committed(&staged.claim_hash)? {
                match self.db.activation_committed(
                    prefixes::CLAIM_TXO_TYPE,
                    prev_txo.tx_num,
                    prev_txo.position,
                )? {
                    Some(activation) if height >= activation.activation_height => {}
                    _ => is_delayed = true,
                }
            }
            self.delayed_activate_ops(
                &mut ctx,
                height,
                &staged.normalized_name,
                staged.claim_hash,
                is_delayed,
                tx_num,
                nout,
                staged.amount,
                false,
            )?;
        }

        // And the supports.
        for ((tx_num, nout), (claim_hash, amount)) in self.staging.support_txo_to_claim.clone() {
            if self.staging.abandoned_claims.contains_key(&claim_hash) {
                continue;
            }
            let (name, staged_is_new_claim) =
                if let Some(txo) = self.staging.claim_hash_to_txo.get(&claim_hash) {
                    let staged = self.staging.txo_to_claim.get(txo).cloned().ok_or_else(|| {
                        IndexerError::InvariantViolated("claim txo map out of sync".into())
                    })?;
                    (staged.normalized_name.clone(), !staged.is_update())
                } else {
                    match self.db.claim_txo(&claim_hash)? {
                        // Supports for nonexistent claims sit dormant.
                        None => continue,
                        Some(v) => (
                            coin::normalize_name(v.name.as_bytes()),
                            (v.root_tx_num, v.root_position) == (v.tx_num, v.position),
                        ),
                    }
                };
            self.delayed_activate_ops(
                &mut ctx,
                height,
                &name,
                claim_hash,
                staged_is_new_claim,
                tx_num,
                nout,
                amount,
                true,
            )?;
        }

        // Apply the activations landing at this block.
        for ((claim_hash, name), activated_txos) in ctx.activated_at_height.clone() {
            if self.staging.abandoned_claims.contains_key(&claim_hash) {
                continue;
            }
            let _ = self.controlling_cached(&mut ctx, &name)?;
            for activated_txo in activated_txos {
                let txo = (activated_txo.tx_num, activated_txo.position);
                if activated_txo.is_support()
                    && self
                        .staging
                        .removed_support_txos_by_name_by_claim
                        .get(&name)
                        .and_then(|by_claim| by_claim.get(&claim_hash))
                        .map(|txos| txos.contains(&txo))
                        .unwrap_or(false)
                {
                    continue;
                }
                let amount = if activated_txo.is_claim() {
                    let amount = if let Some(staged) = self.staging.txo_to_claim.get(&txo) {
                        Some(staged.amount)
                    } else {
                        self.db.claim_txo(&claim_hash)?.map(|v| v.amount)
                    };
                    let Some(amount) = amount else {
                        continue;
                    };
                    self.staging
                        .activated_claim_amount_by_name_and_hash
                        .insert((name.clone(), claim_hash), amount);
                    amount
                } else {
                    let amount = if let Some((_, amount)) =
                        self.staging.support_txo_to_claim.get(&txo)
                    {
                        Some(*amount)
                    } else {
                        self.db
                            .support_txo_amount(&claim_hash, activated_txo.tx_num, activated_txo.position)?
                    };
                    let Some(amount) = amount else {
                        continue;
                    };
                    self.staging
                        .activated_support_amount_by_claim
                        .entry(claim_hash)
                        .or_default()
                        .push(amount);
                    amount
                };
                self.staging
                    .activation_by_claim_by_name
                    .entry(name.clone())
                    .or_default()
                    .entry(claim_hash)
                    .or_default()
                    .push((activated_txo, amount));
            }
        }

        // Names whose controlling claim went away: queue the surviving
        // committed claims as takeover candidates, or clear the name.
        let mut need_reactivate_if_takes_over: BTreeMap<(String, ClaimHash), PendingActivation> =
            BTreeMap::new();
        for name in ctx.names_with_abandoned_or_updated.clone() {
            let existing = self.db.claims_for_name(&name)?;
            let mut has_candidate = false;
            for (candidate_claim_hash, (tx_num, nout)) in existing {
                if self
                    .staging
                    .abandoned_claims
                    .contains_key(&candidate_claim_hash)
                {
                    continue;
                }
                has_candidate = true;
                let existing_activation = self
                    .db
                    .activation_committed(prefixes::CLAIM_TXO_TYPE, tx_num, nout)?
                    .map(|a| a.activation_height)
                    .unwrap_or(0);
                let activate_key = PendingActivation {
                    height: existing_activation,
                    txo_type: prefixes::CLAIM_TXO_TYPE,
                    tx_num,
                    position: nout,
                };
                let amount = self
                    .db
                    .claim_txo_committed(&candidate_claim_hash)?
                    .map(|v| v.amount)
                    .unwrap_or(0);
                self.staging
                    .activation_by_claim_by_name
                    .entry(name.clone())
                    .or_default()
                    .entry(candidate_claim_hash)
                    .or_default()
                    .push((activate_key, amount));
                need_reactivate_if_takes_over
                    .insert((name.clone(), candidate_claim_hash), activate_key);
            }
            if !has_candidate {
                if let Some(controlling) = self.controlling_cached(&mut ctx, &name)? {
                    self.stage_takeover_delete(&name, &controlling)?;
                }
            }
        }

        // Collect pending future activations: a claim already scheduled to
        // activate soon may deserve to jump the queue when a takeover fires.
        let mut claim_exists: HashMap<ClaimHash, bool> = HashMap::new();
        for ((claim_hash, name), _) in self
            .db
            .future_activated_in_window(height, coin::MAX_TAKEOVER_DELAY)?
        {
            let exists = *claim_exists.entry(claim_hash).or_insert(
                self.staging.claim_hash_to_txo.contains_key(&claim_hash)
                    || self.db.claim_txo(&claim_hash)?.is_some(),
            );
            if exists && !self.staging.abandoned_claims.contains_key(&claim_hash) {
                ctx.future_activations
                    .entry(name)
                    .or_default()
                    .insert(claim_hash);
            }
        }
        for (name, future_activated) in ctx.activate_in_future.clone() {
            for (claim_hash, activated) in future_activated {
                let exists = *claim_exists.entry(claim_hash).or_insert(
                    self.staging.claim_hash_to_txo.contains_key(&claim_hash)
                        || self.db.claim_txo(&claim_hash)?.is_some(),
                );
                if !exists || self.staging.abandoned_claims.contains_key(&claim_hash) {
                    continue;
                }
                for (txo, amount) in activated {
                    ctx.future_activations
                        .entry(name.clone())
                        .or_default()
                        .insert(claim_hash);
                    if txo.is_claim() {
                        self.staging
                            .possible_future_claim_amount_by_name_and_hash
                            .insert((name.clone(), claim_hash), amount);
                    } else {
                        self.staging
                            .possible_future_support_amounts_by_claim_hash
                            .entry(claim_hash)
                            .or_default()
                            .push(amount);
                    }
                }
            }
        }

        // Resolve takeovers out of the accumulated activations.
        let mut checked_names: BTreeSet<String> = BTreeSet::new();
        for (name, activated) in self.staging.activation_by_claim_by_name.clone() {
            checked_names.insert(name.clone());
            let controlling = self.controlling_cached(&mut ctx, &name)?;
            let mut amounts: BTreeMap<ClaimHash, u64> = BTreeMap::new();
            for claim_hash in activated.keys() {
                if self.staging.abandoned_claims.contains_key(claim_hash) {
                    continue;
                }
                let amount = self.pending_effective_amount(&name, claim_hash, height)?;
                amounts.insert(*claim_hash, amount);
            }
            if let Some(ref controlling) = controlling {
                if !self
                    .staging
                    .abandoned_claims
                    .contains_key(&controlling.claim_hash)
                {
                    let amount =
                        self.pending_effective_amount(&name, &controlling.claim_hash, height)?;
                    amounts.insert(controlling.claim_hash, amount);
                }
            }
            let Some(winning_claim_hash) = argmax_claim(&amounts) else {
                continue;
            };

            let takeover_wanted = match controlling {
                None => true,
                Some(ref c) => {
                    winning_claim_hash != c.claim_hash
                        && (ctx.names_with_abandoned_or_updated.contains(&name)
                            || amounts[&winning_claim_hash]
                                > amounts.get(&c.claim_hash).copied().unwrap_or(0))
                }
            };
            if !takeover_wanted {
                continue;
            }

            // Early-takeover probe: would a claim scheduled to activate in
            // the near future beat today's winner? If so it activates now.
            let mut amounts_with_future = amounts.clone();
            if let Some(future) = ctx.future_activations.get(&name) {
                for claim_hash in future.clone() {
                    let amount = self.pending_effective_amount(
                        &name,
                        &claim_hash,
                        height + 1 + coin::MAX_TAKEOVER_DELAY,
                    )?;
                    amounts_with_future.insert(claim_hash, amount);
                }
            }
            let Some(winning_including_future) = argmax_claim(&amounts_with_future) else {
                continue;
            };
            let future_winning_amount = amounts_with_future[&winning_including_future];

            if winning_including_future != winning_claim_hash
                && future_winning_amount > amounts[&winning_claim_hash]
            {
                let (tx_num, position, amount, activation) = if let Some(txo) = self
                    .staging
                    .claim_hash_to_txo
                    .get(&winning_including_future)
                    .copied()
                {
                    let staged = self.staging.txo_to_claim.get(&txo).cloned().ok_or_else(|| {
                        IndexerError::InvariantViolated("claim txo map out of sync".into())
                    })?;
                    let mut activation = None;
                    if let Some(future_list) = ctx
                        .activate_in_future
                        .get(&name)
                        .and_then(|m| m.get(&winning_including_future))
                    {
                        for (k, _) in future_list {
                            if (k.tx_num, k.position) == txo {
                                activation = Some(k.height);
                                break;
                            }
                        }
                    }
                    if activation.is_none() {
                        if let Some(pending) = ctx
                            .activated_at_height
                            .get(&(winning_including_future, name.clone()))
                        {
                            for k in pending {
                                if (k.tx_num, k.position) == txo {
                                    activation = Some(k.height);
                                    break;
                                }
                            }
                        }
                    }
                    let activation = activation.ok_or_else(|| {
                        IndexerError::chain(format!(
                            "no scheduled activation for early takeover of {winning_including_future}"
                        ))
                    })?;
                    (txo.0, txo.1, staged.amount, activation)
                } else {
                    let claim = self.db.claim_txo(&winning_including_future)?.ok_or_else(|| {
                        IndexerError::chain("early takeover winner has no claim txo".to_string())
                    })?;
                    let activation = self
                        .db
                        .activation(prefixes::CLAIM_TXO_TYPE, claim.tx_num, claim.position)?
                        .map(|a| a.activation_height)
                        .ok_or_else(|| {
                            IndexerError::chain(
                                "early takeover winner has no pending activation".to_string(),
                            )
                        })?;
                    (claim.tx_num, claim.position, claim.amount, activation)
                };

                self.stage_remove_activate(
                    prefixes::CLAIM_TXO_TYPE,
                    &winning_including_future,
                    tx_num,
                    position,
                    activation,
                    &name,
                    amount,
                )?;
                self.stage_activate(
                    prefixes::CLAIM_TXO_TYPE,
                    &winning_including_future,
                    tx_num,
                    position,
                    height,
                    &name,
                    amount,
                )?;

                // Supports already queued behind the early winner follow it.
                if let Some(future_list) = ctx
                    .activate_in_future
                    .get(&name)
                    .and_then(|m| m.get(&winning_including_future))
                    .cloned()
                {
                    for (k, support_amount) in future_list {
                        let txo = (k.tx_num, k.position);
                        let is_queued_support = self
                            .staging
                            .possible_future_support_txos_by_claim_hash
                            .get(&winning_including_future)
                            .map(|txos| txos.contains(&txo))
                            .unwrap_or(false);
                        if is_queued_support {
                            self.stage_remove_activate(
                                prefixes::SUPPORT_TXO_TYPE,
                                &winning_including_future,
                                k.tx_num,
                                k.position,
                                k.height,
                                &name,
                                support_amount,
                            )?;
                            self.stage_activate(
                                prefixes::SUPPORT_TXO_TYPE,
                                &winning_including_future,
                                k.tx_num,
                                k.position,
                                height,
                                &name,
                                support_amount,
                            )?;
                        }
                    }
                }

                self.staging.taken_over_names.insert(name.clone());
                if let Some(ref controlling) = controlling {
                    self.stage_takeover_delete(&name, controlling)?;
                    if !self
                        .staging
                        .abandoned_claims
                        .contains_key(&controlling.claim_hash)
                    {
                        self.staging
                            .touched_claim_hashes
                            .insert(controlling.claim_hash);
                    }
                }
                self.db.stack.stage_put(
                    prefixes::claim_takeover_key(&name),
                    prefixes::claim_takeover_value(&TakeoverValue {
                        claim_hash: winning_including_future,
                        height,
                    }),
                )?;
                self.staging
                    .touched_claim_hashes
                    .insert(winning_including_future);
            } else {
                // Plain takeover by today's winner.
                if let Some(previous_pending) =
                    need_reactivate_if_takes_over.get(&(name.clone(), winning_claim_hash))
                {
                    let previous_pending = *previous_pending;
                    let (tx_num, position, amount) = if let Some(txo) = self
                        .staging
                        .claim_hash_to_txo
                        .get(&winning_claim_hash)
                        .copied()
                    {
                        let staged =
                            self.staging.txo_to_claim.get(&txo).cloned().ok_or_else(|| {
                                IndexerError::InvariantViolated("claim txo map out of sync".into())
                            })?;
                        (txo.0, txo.1, staged.amount)
                    } else {
                        let amount = self
                            .db
                            .claim_txo_committed(&winning_claim_hash)?
                            .map(|v| v.amount)
                            .unwrap_or(0);
                        (previous_pending.tx_num, previous_pending.position, amount)
                    };
                    if previous_pending.height > height {
                        // The winner had a future activation; move it to now.
                        if tx_num < self.tx_count {
                            self.stage_remove_activate(
                                prefixes::CLAIM_TXO_TYPE,
                                &winning_claim_hash,
                                tx_num,
                                position,
                                previous_pending.height,
                                &name,
                                amount,
                            )?;
                        }
                        self.stage_activate(
                            prefixes::CLAIM_TXO_TYPE,
                            &winning_claim_hash,
                            tx_num,
                            position,
                            height,
                            &name,
                            amount,
                        )?;
                    }
                }
                self.staging.taken_over_names.insert(name.clone());
                if let Some(ref controlling) = controlling {
                    self.stage_takeover_delete(&name, controlling)?;
                    if !self
                        .staging
                        .abandoned_claims
                        .contains_key(&controlling.claim_hash)
                    {
                        self.staging
                            .touched_claim_hashes
                            .insert(controlling.claim_hash);
                    }
                }
                self.db.stack.stage_put(
                    prefixes::claim_takeover_key(&name),
                    prefixes::claim_takeover_value(&TakeoverValue {
                        claim_hash: winning_claim_hash,
                        height,
                    }),
                )?;
                self.staging.touched_claim_hashes.insert(winning_claim_hash);
            }
        }

        // Support-only takeovers: the controlling claim lost active support
        // with no other activity on the name.
        for (name, _claim_hash) in abandoned_support_check_need_takeover {
            if checked_names.contains(&name) {
                continue;
            }
            checked_names.insert(name.clone());
            let controlling = self.controlling_cached(&mut ctx, &name)?;
            let mut amounts: BTreeMap<ClaimHash, u64> = BTreeMap::new();
            for claim_hash in self.db.claims_for_name(&name)?.keys() {
                if self.staging.abandoned_claims.contains_key(claim_hash) {
                    continue;
                }
                let amount = self.pending_effective_amount(&name, claim_hash, height)?;
                amounts.insert(*claim_hash, amount);
            }
            if let Some(ref controlling) = controlling {
                if !self
                    .staging
                    .abandoned_claims
                    .contains_key(&controlling.claim_hash)
                {
                    let amount =
                        self.pending_effective_amount(&name, &controlling.claim_hash, height)?;
                    amounts.insert(controlling.claim_hash, amount);
                }
            }
            let Some(winning) = argmax_claim(&amounts) else {
                continue;
            };
            let changed = match controlling {
                Some(ref c) => winning != c.claim_hash,
                None => true,
            };
            if changed {
                self.staging.taken_over_names.insert(name.clone());
                if let Some(ref controlling) = controlling {
                    self.stage_takeover_delete(&name, controlling)?;
                    self.staging
                        .touched_claim_hashes
                        .insert(controlling.claim_hash);
                }
                self.db.stack.stage_put(
                    prefixes::claim_takeover_key(&name),
                    prefixes::claim_takeover_value(&TakeoverValue {
                        claim_hash: winning,
                        height,
                    }),
                )?;
                self.staging.touched_claim_hashes.insert(winning);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // cumulative index updates

    fn cumulative_update_ops(&mut self, height: Height) -> Result<()> {
        // Every sibling of a taken-over name re-renders in the search index.
        for name in self.staging.taken_over_names.clone() {
            for claim_hash in self.db.claims_for_name(&name)?.keys() {
                if !self.staging.abandoned_claims.contains_key(claim_hash) {
                    self.staging.touched_claim_hashes.insert(*claim_hash);
                }
            }
        }

        for claim_hash in self.staging.abandoned_claims.keys() {
            self.staging.removed_claim_hashes.insert(*claim_hash);
        }
        for removed in self.staging.removed_claim_hashes.clone() {
            self.staging.touched_claim_hashes.remove(&removed);
        }
        let mut touched_additions: BTreeSet<ClaimHash> = BTreeSet::new();
        touched_additions.extend(
            self.staging
                .activated_claim_amount_by_name_and_hash
                .keys()
                .map(|(_, hash)| *hash),
        );
        touched_additions.extend(self.staging.claim_hash_to_txo.keys().copied());
        touched_additions.extend(
            self.staging
                .removed_active_support_amount_by_claim
                .keys()
                .copied(),
        );
        touched_additions.extend(self.staging.signatures_changed.iter().copied());
        touched_additions.extend(
            self.staging
                .activated_support_amount_by_claim
                .keys()
                .copied(),
        );
        touched_additions.extend(self.staging.pending_support_amount_change.keys().copied());
        for hash in touched_additions {
            if !self.staging.removed_claim_hashes.contains(&hash) {
                self.staging.touched_claim_hashes.insert(hash);
            }
        }

        // Support amount totals.
        for (supported_claim, delta) in self.staging.pending_support_amount_change.clone() {
            let existing = self.db.support_amount_total(&supported_claim)?;
            let mut total = delta;
            if let Some(existing) = existing {
                total += existing as i64;
                self.db.stack.stage_delete(
                    prefixes::support_amount_key(&supported_claim),
                    prefixes::amount_value(existing),
                )?;
            }
            self.db.stack.stage_put(
                prefixes::support_amount_key(&supported_claim),
                prefixes::amount_value(total.max(0) as u64),
            )?;
        }

        // Bid-ordered resolution index.
        for removed in self.staging.removed_claim_hashes.clone() {
            let Some(removed_claim) = self.db.claim_txo_committed(&removed)? else {
                continue;
            };
            let normalized_name = coin::normalize_name(removed_claim.name.as_bytes());
            if let Some(entry) = self.db.effective_amount_entry(&normalized_name, &removed)? {
                self.db.stack.stage_delete(
                    prefixes::effective_amount_key(
                        &normalized_name,
                        entry.effective_amount,
                        entry.tx_num,
                        entry.position,
                    ),
                    prefixes::claim_hash_value(&removed),
                )?;
            }
        }
        for touched in self.staging.touched_claim_hashes.clone() {
            let mut prev_effective_amount = 0u64;
            let (name, tx_num, position) = if let Some(txo) =
                self.staging.claim_hash_to_txo.get(&touched).copied()
            {
                let pending = self.staging.txo_to_claim.get(&txo).cloned().ok_or_else(|| {
                    IndexerError::InvariantViolated("claim txo map out of sync".into())
                })?;
                (pending.normalized_name, pending.tx_num, pending.position)
            } else {
                match self.db.claim_txo(&touched)? {
                    Some(v) => {
                        let name = coin::normalize_name(v.name.as_bytes());
                        (name, v.tx_num, v.position)
                    }
                    None => continue,
                }
            };
            if let Some(entry) = self.db.effective_amount_entry(&name, &touched)? {
                prev_effective_amount = entry.effective_amount;
                self.db.stack.stage_delete(
                    prefixes::effective_amount_key(
                        &name,
                        entry.effective_amount,
                        entry.tx_num,
                        entry.position,
                    ),
                    prefixes::claim_hash_value(&touched),
                )?;
            }
            let new_effective_amount = self.pending_effective_amount(&name, &touched, height)?;
            self.db.stack.stage_put(
                prefixes::effective_amount_key(&name, new_effective_amount, tx_num, position),
                prefixes::claim_hash_value(&touched),
            )?;
            // Trending fires only for claims added, spent or supported this
            // block, not for claims that merely activated.
            if self.staging.claim_hash_to_txo.contains_key(&touched)
                || self
                    .staging
                    .pending_support_amount_change
                    .contains_key(&touched)
            {
                self.activation_info_to_send_es
                    .entry(touched.hex())
                    .or_default()
                    .push(TrendingNotification {
                        height,
                        prev_amount: prev_effective_amount,
                        new_amount: new_effective_amount,
                    });
            }
        }

        // Channel content counts.
        for (channel_hash, delta) in self.staging.pending_channel_counts.clone() {
            if delta == 0 {
                continue;
            }
            let existing = self.db.channel_count(&channel_hash)?;
            let base = existing.unwrap_or(0) as i64;
            if let Some(existing) = existing {
                self.db.stack.stage_delete(
                    prefixes::channel_count_key(&channel_hash),
                    prefixes::count_value(existing),
                )?;
            }
            self.db.stack.stage_put(
                prefixes::channel_count_key(&channel_hash),
                prefixes::count_value((base + delta).max(0) as u32),
            )?;
        }

        for reposted in self.staging.pending_reposted.clone() {
            if !self.staging.removed_claim_hashes.contains(&reposted) {
                self.staging.touched_claim_hashes.insert(reposted);
            }
        }
        for (channel_hash, delta) in self.staging.pending_channel_counts.clone() {
            if delta != 0 && !self.staging.removed_claim_hashes.contains(&channel_hash) {
                self.staging.touched_claim_hashes.insert(channel_hash);
            }
        }
        self.touched_claims_to_send_es
            .extend(self.staging.touched_claim_hashes.iter().copied());
        for removed in &self.staging.removed_claim_hashes {
            self.touched_claims_to_send_es.remove(removed);
            self.removed_claims_to_send_es.insert(*removed);
        }
        Ok(())
    }

    // =======================================================================
    // backup

    /// Unwind the tip block using its undo record.
    pub async fn backup_block(&mut self) -> Result<()> {
        let lock = self.state_lock.clone();
        let _guard = lock.lock().await;
        self.run_sync(|bp| bp.backup_block_sync())
    }

    fn backup_block_sync(&mut self) -> Result<()> {
        if !self.db.stack.is_empty() {
            return Err(IndexerError::InvariantViolated(
                "backup with staged ops pending".into(),
            ));
        }
        let height = self.height;
        let (touched, deleted) = self.db.touched_or_deleted_at(height)?.ok_or_else(|| {
            IndexerError::Corrupt(format!("missing touched_or_deleted record for {height}"))
        })?;
        self.touched_claims_to_send_es.extend(touched.iter().copied());
        for claim_hash in &touched {
            self.removed_claims_to_send_es.remove(claim_hash);
        }
        self.removed_claims_to_send_es.extend(deleted);

        info!("backup block {height}");
        self.db.headers.pop();
        self.db.tx_counts.pop();
        self.tip = self
            .db
            .headers
            .last()
            .map(|h| coin::header_hash(h))
            .unwrap_or_default();
        self.tx_count = self.db.tx_counts.last().copied().unwrap_or(0);
        self.height = height.saturating_sub(1);

        let start = Instant::now();
        self.db.state.db_height = self.height;
        self.db.state.db_tx_count = self.tx_count;
        self.db.state.db_tip = self.tip;
        self.db.state.hist_flush_count += 1;
        self.db.state.utxo_flush_count = self.db.state.hist_flush_count;
        self.db.state.es_sync_height = self.height;
        let now = now_ms();
        if self.db.state.last_flush_ms > 0 {
            self.db.state.wall_time_ms += now.saturating_sub(self.db.state.last_flush_ms);
        }
        self.db.state.last_flush_ms = now;

        self.db.stack.stage_rollback(height)?;
        self.db.write_db_state()?;
        self.db.stack.unsafe_commit()?;
        self.staging.clear();
        self.db.assert_db_state()?;
        warn!(
            "backup flush #{} took {:.1}s. Height {} txs: {}",
            self.db.state.hist_flush_count,
            start.elapsed().as_secs_f64(),
            self.height,
            self.tx_count
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tempfile::TempDir;

    use crate::block::{serialize_tx, write_compact_size, Tx, TxOutput};
    use crate::coin::HEADER_SIZE;
    use crate::daemon::testing::FakeDaemon;
    use crate::script::build;
    use crate::search::NullSearchIndex;

    struct Harness {
        bp: BlockProcessor<FakeDaemon, NullSearchIndex>,
        daemon: Arc<FakeDaemon>,
        _dir: TempDir,
        /// Plain spendable outputs for funding test transactions.
        wallet: Vec<(Hash32, u32)>,
        coinbase_seq: u16,
    }

    fn tx_hash_of(tx: &Tx) -> Hash32 {
        Hash32(coin::double_sha256(&serialize_tx(tx)))
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let db = crate::db::ClaimDb::open(dir.path(), 200).unwrap();
        let daemon = FakeDaemon::new();
        let state_lock = Arc::new(Mutex::new(()));
        let mempool = MemPool::new(daemon.clone(), db.raw_handle(), state_lock.clone(), 1.0);
        let prefetcher = Arc::new(Prefetcher::new(
            daemon.clone(),
            1024 * 1024,
            Duration::from_millis(10),
        ));
        let shutdown = Arc::new(Notify::new());
        let bp = BlockProcessor::new(
            db,
            daemon.clone(),
            NullSearchIndex,
            mempool,
            prefetcher,
            state_lock,
            shutdown,
        );
        Harness {
            bp,
            daemon,
            _dir: dir,
            wallet: Vec::new(),
            coinbase_seq: 0,
        }
    }

    impl Harness {
        fn coinbase_tx(&mut self) -> Tx {
            self.coinbase_seq += 1;
            Tx {
                version: 1,
                inputs: vec![TxInput {
                    prev_hash: Hash32([0u8; 32]),
                    prev_idx: u32::MAX,
                    script_sig: self.coinbase_seq.to_le_bytes().to_vec(),
                    sequence: 0,
                }],
                outputs: vec![TxOutput {
                    value: 1_000_000,
                    pk_script: build::pay_script((self.coinbase_seq % 250) as u8),
                }],
                locktime: 0,
                raw: Vec::new(),
            }
        }

        fn fund_input(&mut self) -> TxInput {
            let (prev_hash, prev_idx) = self.wallet.remove(0);
            TxInput {
                prev_hash,
                prev_idx,
                script_sig: Vec::new(),
                sequence: 0xffff_ffff,
            }
        }

        fn outpoint_input(&self, outpoint: (Hash32, u32)) -> TxInput {
            TxInput {
                prev_hash: outpoint.0,
                prev_idx: outpoint.1,
                script_sig: Vec::new(),
                sequence: 0xffff_ffff,
            }
        }

        fn claim_tx(&mut self, name: &[u8], amount: u64, payload: &[u8]) -> (Tx, ClaimHash) {
            let input = self.fund_input();
            let tx = Tx {
                version: 1,
                inputs: vec![input],
                outputs: vec![TxOutput {
                    value: amount,
                    pk_script: build::claim_name_script(name, payload, &build::pay_script(0xaa)),
                }],
                locktime: 0,
                raw: Vec::new(),
            };
            let claim_hash = script::claim_hash_for_new(&tx_hash_of(&tx), 0);
            (tx, claim_hash)
        }

        fn support_tx(&mut self, name: &[u8], claim_hash: &ClaimHash, amount: u64) -> Tx {
            let input = self.fund_input();
            Tx {
                version: 1,
                inputs: vec![input],
                outputs: vec![TxOutput {
                    value: amount,
                    pk_script: build::support_script(name, claim_hash, &build::pay_script(0xbb)),
                }],
                locktime: 0,
                raw: Vec::new(),
            }
        }

        fn spend_tx(&self, outpoint: (Hash32, u32)) -> Tx {
            Tx {
                version: 1,
                inputs: vec![self.outpoint_input(outpoint)],
                outputs: vec![TxOutput {
                    value: 1,
                    pk_script: build::pay_script(0xcc),
                }],
                locktime: 0,
                raw: Vec::new(),
            }
        }

        /// Build the next block (coinbase + txs), feed it to the fake daemon
        /// and advance the processor through the normal path.
        async fn apply(&mut self, txs: Vec<Tx>) {
            let height = self.bp.next_height();
            let coinbase = self.coinbase_tx();
            let coinbase_hash = tx_hash_of(&coinbase);
            let mut all = vec![coinbase];
            all.extend(txs);

            let mut header = [0u8; HEADER_SIZE];
            header[0..4].copy_from_slice(&height.to_le_bytes());
            header[4..36].copy_from_slice(&self.bp.tip.0);
            let mut raw = header.to_vec();
            write_compact_size(&mut raw, all.len() as u64);
            for tx in &all {
                raw.extend(serialize_tx(tx));
            }
            self.daemon.push_block(raw.clone());
            self.bp.check_and_advance_blocks(vec![raw]).await.unwrap();
            assert_eq!(self.bp.height, height);
            self.wallet.push((coinbase_hash, 0));
        }

        async fn apply_empty_until(&mut self, next_height: Height) {
            while self.bp.next_height() < next_height {
                self.apply(Vec::new()).await;
            }
        }

        fn snapshot(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
            let handle = self.bp.db.raw_handle();
            handle
                .iterator(rocksdb::IteratorMode::Start)
                .map(|item| {
                    let (k, v) = item.unwrap();
                    (k.to_vec(), v.to_vec())
                })
                .filter(|(k, _)| k.as_slice() != [prefixes::DB_STATE])
                .collect()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn simple_claim_becomes_controlling() {
        let mut h = harness();
        h.apply(Vec::new()).await; // genesis
        let (tx, c1) = h.claim_tx(b"hello", 100, &[0]);
        h.apply(vec![tx]).await; // height 1

        let takeover = h.bp.db.controlling_claim("hello").unwrap().unwrap();
        assert_eq!(takeover.claim_hash, c1);
        assert_eq!(takeover.height, 1);
        let entry = h.bp.db.effective_amount_entry("hello", &c1).unwrap().unwrap();
        assert_eq!(entry.effective_amount, 100);
        let claim = h.bp.db.claim_txo(&c1).unwrap().unwrap();
        assert_eq!(claim.amount, 100);
        assert!(!claim.channel_signature_is_valid);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn support_lifts_challenger_after_delay() {
        let mut h = harness();
        h.apply_empty_until(10).await;
        let (tx_a, a) = h.claim_tx(b"x", 100, &[0]);
        h.apply(vec![tx_a]).await; // height 10: A takes the name
        assert_eq!(
            h.bp.db.controlling_claim("x").unwrap().unwrap().claim_hash,
            a
        );

        h.apply_empty_until(74).await;
        // Height 74: challenger B (50) plus a 100 support. The name has
        // been held for 64 blocks, so the takeover delay is 2.
        let (tx_b, b) = h.claim_tx(b"x", 50, &[0]);
        let sup = h.support_tx(b"x", &b, 100);
        h.apply(vec![tx_b, sup]).await;
        assert_eq!(
            h.bp.db.controlling_claim("x").unwrap().unwrap().claim_hash,
            a
        );

        h.apply(Vec::new()).await; // height 75: still pending
        assert_eq!(
            h.bp.db.controlling_claim("x").unwrap().unwrap().claim_hash,
            a
        );

        h.apply(Vec::new()).await; // height 76: B activates with 150 > 100
        let takeover = h.bp.db.controlling_claim("x").unwrap().unwrap();
        assert_eq!(takeover.claim_hash, b);
        assert_eq!(takeover.height, 76);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn early_takeover_activates_bigger_future_claim() {
        let mut h = harness();
        h.apply_empty_until(10).await;
        let (tx_a, _a) = h.claim_tx(b"x", 100, &[0]);
        h.apply(vec![tx_a]).await; // height 10

        h.apply_empty_until(74).await;
        let (tx_b, b) = h.claim_tx(b"x", 150, &[0]);
        h.apply(vec![tx_b]).await; // height 74, activates at 76

        let (tx_c, c) = h.claim_tx(b"x", 300, &[0]);
        h.apply(vec![tx_c]).await; // height 75, scheduled for 77

        h.apply(Vec::new()).await; // height 76: B's activation triggers the
                                   // probe; C jumps its delay and wins now.
        let takeover = h.bp.db.controlling_claim("x").unwrap().unwrap();
        assert_eq!(takeover.claim_hash, c);
        assert_eq!(takeover.height, 76);
        assert_ne!(takeover.claim_hash, b);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn abandon_clears_takeover_and_bid_index() {
        let mut h = harness();
        h.apply(Vec::new()).await;
        let (tx_a, a) = h.claim_tx(b"y", 10, &[0]);
        let claim_outpoint = (tx_hash_of(&tx_a), 0);
        h.apply(vec![tx_a]).await; // height 1
        assert!(h.bp.db.controlling_claim("y").unwrap().is_some());

        let spend = h.spend_tx(claim_outpoint);
        h.apply(vec![spend]).await; // height 2: abandon

        assert!(h.bp.db.controlling_claim("y").unwrap().is_none());
        assert!(h.bp.db.claim_txo(&a).unwrap().is_none());
        let prefix = prefixes::effective_amount_prefix("y");
        assert!(h.bp.db.iterate_prefix(&prefix).unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn backup_restores_prior_state() {
        let mut h = harness();
        h.apply_empty_until(3).await; // heights 0..=2 baseline
        let baseline = h.snapshot();
        let baseline_height = h.bp.height;
        let baseline_tx_count = h.bp.tx_count;
        let baseline_tip = h.bp.tip;

        let (tx_a, a) = h.claim_tx(b"alpha", 40, &[0]);
        h.apply(vec![tx_a]).await; // 3
        let sup = h.support_tx(b"alpha", &a, 25);
        let (tx_b, _b) = h.claim_tx(b"beta", 90, &[0]);
        h.apply(vec![sup, tx_b]).await; // 4
        h.apply(Vec::new()).await; // 5
        assert_ne!(h.snapshot(), baseline);

        for _ in 0..3 {
            h.bp.backup_block().await.unwrap();
        }
        assert_eq!(h.snapshot(), baseline);
        assert_eq!(h.bp.height, baseline_height);
        assert_eq!(h.bp.tx_count, baseline_tx_count);
        assert_eq!(h.bp.tip, baseline_tip);
        assert!(h.bp.db.controlling_claim("alpha").unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn channel_abandon_invalidates_signatures() {
        let mut h = harness();
        h.apply(Vec::new()).await;

        // Height 1: the channel.
        let (secret, public_key) = build::channel_keypair(7);
        let channel_payload = crate::script::ClaimPayload {
            is_channel: true,
            channel_public_key: Some(public_key),
            ..Default::default()
        };
        let (channel_tx, channel_hash) = h.claim_tx(b"@ch", 30, &channel_payload.encode());
        let channel_outpoint = (tx_hash_of(&channel_tx), 0);
        h.apply(vec![channel_tx]).await;

        // Height 2: a stream signed by the channel.
        let input = h.fund_input();
        let mut payload = crate::script::ClaimPayload::default();
        build::sign_payload(&mut payload, &input, b"stream", channel_hash, &secret);
        let stream_tx = Tx {
            version: 1,
            inputs: vec![input],
            outputs: vec![TxOutput {
                value: 44,
                pk_script: build::claim_name_script(
                    b"stream",
                    &payload.encode(),
                    &build::pay_script(0xdd),
                ),
            }],
            locktime: 0,
            raw: Vec::new(),
        };
        let stream_hash = script::claim_hash_for_new(&tx_hash_of(&stream_tx), 0);
        h.apply(vec![stream_tx]).await;

        let stream = h.bp.db.claim_txo(&stream_hash).unwrap().unwrap();
        assert!(stream.channel_signature_is_valid);
        assert_eq!(h.bp.db.claims_in_channel(&channel_hash).unwrap().len(), 1);
        assert_eq!(
            h.bp.db
                .channel_for_claim(&stream_hash, stream.tx_num, stream.position)
                .unwrap(),
            Some(channel_hash)
        );
        assert_eq!(h.bp.db.channel_count(&channel_hash).unwrap(), Some(1));

        // Height 3: the channel is abandoned.
        let spend = h.spend_tx(channel_outpoint);
        h.apply(vec![spend]).await;

        let stream = h.bp.db.claim_txo(&stream_hash).unwrap().unwrap();
        assert!(!stream.channel_signature_is_valid);
        assert!(h.bp.db.claims_in_channel(&channel_hash).unwrap().is_empty());
        assert_eq!(
            h.bp.db
                .channel_for_claim(&stream_hash, stream.tx_num, stream.position)
                .unwrap(),
            None
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn claim_update_keeps_root_and_identity() {
        let mut h = harness();
        h.apply(Vec::new()).await;
        let (tx_a, a) = h.claim_tx(b"name", 100, &[0]);
        let outpoint = (tx_hash_of(&tx_a), 0);
        h.apply(vec![tx_a]).await; // height 1
        let original = h.bp.db.claim_txo(&a).unwrap().unwrap();

        // Height 2: update the claim, raising the amount.
        let update_tx = Tx {
            version: 1,
            inputs: vec![h.outpoint_input(outpoint)],
            outputs: vec![TxOutput {
                value: 250,
                pk_script: build::claim_update_script(
                    b"name",
                    &a,
                    &[0],
                    &build::pay_script(0xee),
                ),
            }],
            locktime: 0,
            raw: Vec::new(),
        };
        h.apply(vec![update_tx]).await;

        let updated = h.bp.db.claim_txo(&a).unwrap().unwrap();
        assert_eq!(updated.amount, 250);
        assert_eq!(updated.root_tx_num, original.root_tx_num);
        assert_eq!(updated.root_position, original.root_position);
        assert_ne!(
            (updated.tx_num, updated.position),
            (original.tx_num, original.position)
        );
        // The winner updated itself; it stays controlling with the takeover
        // height untouched.
        let takeover = h.bp.db.controlling_claim("name").unwrap().unwrap();
        assert_eq!(takeover.claim_hash, a);
        assert_eq!(takeover.height, 1);
        let entry = h.bp.db.effective_amount_entry("name", &a).unwrap().unwrap();
        assert_eq!(entry.effective_amount, 250);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tx_counts_track_block_sizes() {
        let mut h = harness();
        h.apply(Vec::new()).await; // 1 tx
        let (tx, _) = h.claim_tx(b"n", 5, &[0]);
        h.apply(vec![tx]).await; // 2 txs
        assert_eq!(h.bp.db.tx_counts, vec![1, 3]);
        assert_eq!(h.bp.tx_count, 3);
        let raw = h.bp.db.get(&prefixes::tx_count_key(1)).unwrap().unwrap();
        assert_eq!(prefixes::decode_amount(&raw).unwrap(), 3);
    }
}
