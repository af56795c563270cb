/// Mempool tracking.
///
/// Polls the daemon for its unconfirmed transaction set, resolves prevouts
/// against confirmed UTXOs or other mempool transactions, and maintains the
/// hashX -> tx map used to notify address subscribers promptly. Block and
/// mempool touch-sets are merged per height before notification so clients
/// never hear about a height twice or out of order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use rocksdb::DB;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{info, warn};

use crate::block::parse_tx;
use crate::daemon::Daemon;
use crate::error::Result;
use crate::metrics;
use crate::prefixes;
use crate::script::hashx_from_script;
use crate::types::{Hash32, HashX, Height};

pub const DEFAULT_REFRESH_SECS: f64 = 1.0;
const FETCH_BATCH: usize = 200;

#[derive(Debug, Clone)]
pub struct MemPoolTx {
    pub prevouts: Vec<(Hash32, u32)>,
    pub in_pairs: Vec<(Option<HashX>, u64)>,
    pub out_pairs: Vec<(Option<HashX>, u64)>,
    pub fee: u64,
    pub size: usize,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct MemPoolTxSummary {
    pub hash: Hash32,
    pub fee: u64,
    pub has_unconfirmed_inputs: bool,
}

/// Session-facing notification: touched hashXs for a height.
#[derive(Debug, Clone)]
pub struct TouchedNotification {
    pub height: Height,
    pub touched: HashSet<HashX>,
    pub new_touched: HashSet<HashX>,
}

#[derive(Default)]
struct MemPoolInner {
    txs: HashMap<Hash32, MemPoolTx>,
    hashxs: HashMap<HashX, HashSet<Hash32>>,
    notified_mempool_txs: HashSet<Hash32>,
    touched_mp: BTreeMap<Height, HashSet<HashX>>,
    touched_bp: BTreeMap<Height, HashSet<HashX>>,
    highest_block: Option<Height>,
    sessions: Option<mpsc::UnboundedSender<TouchedNotification>>,
}

pub struct MemPool<D> {
    daemon: Arc<D>,
    db: Arc<DB>,
    /// Shared with the block processor; bulk mutations synchronize here.
    state_lock: Arc<Mutex<()>>,
    inner: StdMutex<MemPoolInner>,
    pub refresh_secs: f64,
    /// Broadcast hook: shortens poll latency when a tx is submitted locally.
    pub wakeup: Notify,
}

impl<D: Daemon> MemPool<D> {
    pub fn new(
        daemon: Arc<D>,
        db: Arc<DB>,
        state_lock: Arc<Mutex<()>>,
        refresh_secs: f64,
    ) -> Arc<MemPool<D>> {
        Arc::new(MemPool {
            daemon,
            db,
            state_lock,
            inner: StdMutex::new(MemPoolInner::default()),
            refresh_secs,
            wakeup: Notify::new(),
        })
    }

    /// Begin notifying sessions, seeded at the current height.
    pub fn start(&self, height: Height, sessions: mpsc::UnboundedSender<TouchedNotification>) {
        let mut inner = self.inner.lock().unwrap();
        inner.highest_block = Some(height);
        let _ = sessions.send(TouchedNotification {
            height,
            touched: HashSet::new(),
            new_touched: HashSet::new(),
        });
        inner.sessions = Some(sessions);
    }

    /// Forget which transactions sessions were already told about; called
    /// after each committed block so confirmed txs re-notify as history.
    pub fn clear_notified(&self) {
        self.inner.lock().unwrap().notified_mempool_txs.clear();
    }

    /// Keep the mempool synchronized with the daemon, forever.
    pub async fn keep_synchronized(&self) -> Result<()> {
        info!("beginning processing of daemon mempool. This can take some time...");
        loop {
            let start = Instant::now();
            match self.refresh_once().await {
                Ok(()) => {
                    metrics::PROCESSED_MEMPOOL.observe(start.elapsed().as_secs_f64());
                }
                Err(e) if e.is_transient() => warn!("mempool refresh failed: {e}"),
                Err(e) => return Err(e),
            }
            let _ = tokio::time::timeout(
                Duration::from_secs_f64(self.refresh_secs),
                self.wakeup.notified(),
            )
            .await;
        }
    }

    async fn refresh_once(&self) -> Result<()> {
        let height = self.daemon.cached_height();
        let hex_hashes = self.daemon.mempool_hashes().await?;
        if height != self.daemon.height().await? {
            // A block landed mid-poll; pick it up next round.
            return Ok(());
        }
        let hashes: HashSet<Hash32> = hex_hashes
            .iter()
            .filter_map(|h| Hash32::from_rpc_hex(h))
            .collect();

        let (touched, new_touched) = {
            let _guard = self.state_lock.lock().await;
            let new_hashes: HashSet<Hash32> = {
                let inner = self.inner.lock().unwrap();
                hashes
                    .difference(&inner.notified_mempool_txs)
                    .copied()
                    .collect()
            };
            let touched = self.process_mempool(&hashes).await?;
            let mut inner = self.inner.lock().unwrap();
            inner.notified_mempool_txs.extend(new_hashes.iter().copied());
            let new_touched = inner
                .hashxs
                .iter()
                .filter(|(_, txs)| txs.iter().any(|tx| new_hashes.contains(tx)))
                .map(|(hashx, _)| *hashx)
                .collect();
            (touched, new_touched)
        };
        self.on_mempool(touched, new_touched, height).await;
        Ok(())
    }

    /// Re-sync our view with the daemon's hash set. Returns touched hashXs.
    async fn process_mempool(&self, all_hashes: &HashSet<Hash32>) -> Result<HashSet<HashX>> {
        let mut touched: HashSet<HashX> = HashSet::new();

        // Drop transactions that confirmed or were evicted.
        let disappeared: Vec<Hash32> = {
            let inner = self.inner.lock().unwrap();
            inner
                .txs
                .keys()
                .filter(|hash| !all_hashes.contains(hash))
                .copied()
                .collect()
        };
        {
            let mut inner = self.inner.lock().unwrap();
            for tx_hash in disappeared {
                let Some(tx) = inner.txs.remove(&tx_hash) else {
                    continue;
                };
                let mut tx_hashxs: HashSet<HashX> = HashSet::new();
                for (hashx, _) in tx.in_pairs.iter().chain(tx.out_pairs.iter()) {
                    if let Some(hashx) = hashx {
                        tx_hashxs.insert(*hashx);
                    }
                }
                for hashx in &tx_hashxs {
                    if let Some(txs) = inner.hashxs.get_mut(hashx) {
                        txs.remove(&tx_hash);
                        if txs.is_empty() {
                            inner.hashxs.remove(hashx);
                        }
                    }
                }
                touched.extend(tx_hashxs);
            }
        }

        // Fetch and accept the new arrivals.
        let new_hashes: Vec<Hash32> = {
            let inner = self.inner.lock().unwrap();
            all_hashes
                .iter()
                .filter(|hash| !inner.txs.contains_key(hash))
                .copied()
                .collect()
        };
        if new_hashes.is_empty() {
            return Ok(touched);
        }

        let mut tx_map: HashMap<Hash32, MemPoolTx> = HashMap::new();
        for chunk in new_hashes.chunks(FETCH_BATCH) {
            let hex: Vec<String> = chunk.iter().map(Hash32::rpc_hex).collect();
            let raw_txs = self.daemon.get_raw_transactions(&hex).await?;
            for (hash, raw) in chunk.iter().zip(raw_txs) {
                // The daemon may have evicted it or mined it already.
                let Some(raw) = raw else { continue };
                let Ok(tx) = parse_tx(&raw) else {
                    warn!("undecodable mempool transaction {hash}");
                    continue;
                };
                let prevouts: Vec<(Hash32, u32)> = tx
                    .inputs
                    .iter()
                    .filter(|txin| !txin.is_generation())
                    .map(|txin| (txin.prev_hash, txin.prev_idx))
                    .collect();
                let out_pairs: Vec<(Option<HashX>, u64)> = tx
                    .outputs
                    .iter()
                    .map(|txout| (hashx_from_script(&txout.pk_script), txout.value))
                    .collect();
                tx_map.insert(
                    *hash,
                    MemPoolTx {
                        prevouts,
                        in_pairs: Vec::new(),
                        out_pairs,
                        fee: 0,
                        size: raw.len(),
                        raw,
                    },
                );
            }
        }

        // Prevouts not provided by the mempool resolve against the DB.
        let db_prevouts: Vec<(Hash32, u32)> = tx_map
            .values()
            .flat_map(|tx| tx.prevouts.iter())
            .filter(|(hash, _)| !all_hashes.contains(hash))
            .copied()
            .collect();
        let resolved = lookup_confirmed_utxos(&self.db, &db_prevouts)?;
        let mut utxo_map: HashMap<(Hash32, u32), (Option<HashX>, u64)> = HashMap::new();
        for (prevout, utxo) in db_prevouts.into_iter().zip(resolved) {
            if let Some((hashx, value)) = utxo {
                utxo_map.insert(prevout, (Some(hashx), value));
            }
        }

        // Accept iteratively: each pass admits transactions whose inputs all
        // resolve from the DB or already-accepted mempool transactions.
        let mut prior_count = usize::MAX;
        while !tx_map.is_empty() && tx_map.len() != prior_count {
            prior_count = tx_map.len();
            tx_map = self.accept_transactions(tx_map, &mut utxo_map, &mut touched);
        }
        if !tx_map.is_empty() {
            info!("{} txs dropped", tx_map.len());
        }

        Ok(touched)
    }

    fn accept_transactions(
        &self,
        tx_map: HashMap<Hash32, MemPoolTx>,
        utxo_map: &mut HashMap<(Hash32, u32), (Option<HashX>, u64)>,
        touched: &mut HashSet<HashX>,
    ) -> HashMap<Hash32, MemPoolTx> {
        let mut deferred = HashMap::new();
        let mut inner = self.inner.lock().unwrap();
        for (hash, mut tx) in tx_map {
            let mut in_pairs = Vec::with_capacity(tx.prevouts.len());
            let mut resolvable = true;
            for prevout in &tx.prevouts {
                if let Some(utxo) = utxo_map.get(prevout) {
                    in_pairs.push(*utxo);
                } else if let Some(prev_tx) = inner.txs.get(&prevout.0) {
                    match prev_tx.out_pairs.get(prevout.1 as usize) {
                        Some(pair) => in_pairs.push(*pair),
                        None => {
                            resolvable = false;
                            break;
                        }
                    }
                } else {
                    resolvable = false;
                    break;
                }
            }
            if !resolvable {
                deferred.insert(hash, tx);
                continue;
            }
            for prevout in &tx.prevouts {
                utxo_map.remove(prevout);
            }
            let input_total: u64 = in_pairs.iter().map(|(_, value)| value).sum();
            let output_total: u64 = tx.out_pairs.iter().map(|(_, value)| value).sum();
            tx.fee = input_total.saturating_sub(output_total);
            tx.in_pairs = in_pairs;
            for (hashx, _) in tx.in_pairs.iter().chain(tx.out_pairs.iter()) {
                if let Some(hashx) = hashx {
                    touched.insert(*hashx);
                    inner.hashxs.entry(*hashx).or_default().insert(hash);
                }
            }
            inner.txs.insert(hash, tx);
        }
        deferred
    }

    // -----------------------------------------------------------------------
    // notification alignment

    /// Emit a combined notification once both the block and mempool touch
    /// sets for a height are known.
    async fn maybe_notify(&self, new_touched: HashSet<HashX>) {
        let notification = {
            let mut inner = self.inner.lock().unwrap();
            let common: Vec<Height> = inner
                .touched_mp
                .keys()
                .filter(|height| inner.touched_bp.contains_key(height))
                .copied()
                .collect();
            let height = if let Some(max_common) = common.last() {
                *max_common
            } else if let (Some(max_mp), Some(highest)) =
                (inner.touched_mp.keys().next_back().copied(), inner.highest_block)
            {
                if max_mp != highest {
                    // Either a block is being processed or the mempool has
                    // not yet caught up to the new height.
                    return;
                }
                highest
            } else {
                return;
            };
            let mut touched = inner.touched_mp.remove(&height).unwrap_or_default();
            let stale_mp: Vec<Height> = inner
                .touched_mp
                .keys()
                .filter(|h| **h <= height)
                .copied()
                .collect();
            for h in stale_mp {
                inner.touched_mp.remove(&h);
            }
            let stale_bp: Vec<Height> = inner
                .touched_bp
                .keys()
                .filter(|h| **h <= height)
                .copied()
                .collect();
            for h in stale_bp {
                if let Some(set) = inner.touched_bp.remove(&h) {
                    touched.extend(set);
                }
            }
            inner.sessions.as_ref().map(|sessions| {
                (
                    sessions.clone(),
                    TouchedNotification {
                        height,
                        touched,
                        new_touched,
                    },
                )
            })
        };
        if let Some((sessions, notification)) = notification {
            let _ = sessions.send(notification);
        }
    }

    pub async fn on_mempool(
        &self,
        touched: HashSet<HashX>,
        new_touched: HashSet<HashX>,
        height: Height,
    ) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.touched_mp.insert(height, touched);
        }
        self.maybe_notify(new_touched).await;
    }

    /// Called by the block processor after each committed block.
    pub async fn on_block(&self, touched: &std::collections::BTreeSet<HashX>, height: Height) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner
                .touched_bp
                .insert(height, touched.iter().copied().collect());
            inner.highest_block = Some(height);
        }
        self.maybe_notify(HashSet::new()).await;
    }

    // -----------------------------------------------------------------------
    // read API

    /// Net unconfirmed amount for a hashX; can be negative.
    pub fn balance_delta(&self, hashx: &HashX) -> i64 {
        let inner = self.inner.lock().unwrap();
        let mut value = 0i64;
        if let Some(tx_hashes) = inner.hashxs.get(hashx) {
            for tx_hash in tx_hashes {
                let Some(tx) = inner.txs.get(tx_hash) else {
                    continue;
                };
                for (h, v) in &tx.in_pairs {
                    if h.as_ref() == Some(hashx) {
                        value -= *v as i64;
                    }
                }
                for (h, v) in &tx.out_pairs {
                    if h.as_ref() == Some(hashx) {
                        value += *v as i64;
                    }
                }
            }
        }
        value
    }

    pub fn transaction_summaries(&self, hashx: &HashX) -> Vec<MemPoolTxSummary> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        if let Some(tx_hashes) = inner.hashxs.get(hashx) {
            for tx_hash in tx_hashes {
                let Some(tx) = inner.txs.get(tx_hash) else {
                    continue;
                };
                let has_unconfirmed_inputs = tx
                    .prevouts
                    .iter()
                    .any(|(prev_hash, _)| inner.txs.contains_key(prev_hash));
                out.push(MemPoolTxSummary {
                    hash: *tx_hash,
                    fee: tx.fee,
                    has_unconfirmed_inputs,
                });
            }
        }
        out
    }

    /// Unconfirmed outputs paying to a hashX: (tx_hash, pos, value).
    pub fn unordered_utxos(&self, hashx: &HashX) -> Vec<(Hash32, u32, u64)> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        if let Some(tx_hashes) = inner.hashxs.get(hashx) {
            for tx_hash in tx_hashes {
                let Some(tx) = inner.txs.get(tx_hash) else {
                    continue;
                };
                for (pos, (h, value)) in tx.out_pairs.iter().enumerate() {
                    if h.as_ref() == Some(hashx) {
                        out.push((*tx_hash, pos as u32, *value));
                    }
                }
            }
        }
        out
    }

    /// Prevouts spent by mempool transactions touching a hashX.
    pub fn potential_spends(&self, hashx: &HashX) -> HashSet<(Hash32, u32)> {
        let inner = self.inner.lock().unwrap();
        let mut out = HashSet::new();
        if let Some(tx_hashes) = inner.hashxs.get(hashx) {
            for tx_hash in tx_hashes {
                if let Some(tx) = inner.txs.get(tx_hash) {
                    out.extend(tx.prevouts.iter().copied());
                }
            }
        }
        out
    }

    /// -2: unknown, -1: unconfirmed inputs, 0: all inputs confirmed.
    pub fn mempool_height(&self, tx_hash: &Hash32) -> i32 {
        let inner = self.inner.lock().unwrap();
        let Some(tx) = inner.txs.get(tx_hash) else {
            return -2;
        };
        let unconfirmed = tx
            .prevouts
            .iter()
            .any(|(prev_hash, _)| inner.txs.contains_key(prev_hash));
        if unconfirmed {
            -1
        } else {
            0
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolve prevouts against confirmed state only. Failed lookups return
/// None; concurrent block commits make those expected, and the caller
/// defers or drops the transaction.
pub fn lookup_confirmed_utxos(
    db: &DB,
    prevouts: &[(Hash32, u32)],
) -> Result<Vec<Option<(HashX, u64)>>> {
    let mut out = Vec::with_capacity(prevouts.len());
    for (tx_hash, nout) in prevouts {
        let tx_num = match db.get(prefixes::tx_num_key(tx_hash))? {
            Some(raw) => prefixes::decode_amount(&raw)?,
            None => {
                out.push(None);
                continue;
            }
        };
        let hashx = match db.get(prefixes::hashx_utxo_key(tx_hash, tx_num, *nout))? {
            Some(raw) => match HashX::from_slice(&raw) {
                Some(hashx) => hashx,
                None => {
                    out.push(None);
                    continue;
                }
            },
            None => {
                out.push(None);
                continue;
            }
        };
        let amount = match db.get(prefixes::utxo_key(&hashx, tx_num, *nout))? {
            Some(raw) => prefixes::decode_amount(&raw)?,
            None => {
                out.push(None);
                continue;
            }
        };
        out.push(Some((hashx, amount)));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::block::{serialize_tx, Tx, TxInput, TxOutput};
    use crate::coin::double_sha256;
    use crate::daemon::testing::FakeDaemon;
    use crate::script::build;

    fn open_db() -> (Arc<DB>, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        (Arc::new(DB::open(&opts, dir.path()).unwrap()), dir)
    }

    fn tx_hash_of(tx: &Tx) -> Hash32 {
        Hash32(double_sha256(&serialize_tx(tx)))
    }

    /// Store the rows a confirmed funding output needs for prevout lookups.
    fn store_confirmed_utxo(db: &DB, tx_hash: &Hash32, tx_num: u64, nout: u32, value: u64) -> HashX {
        let pay = build::pay_script(9);
        let hashx = hashx_from_script(&pay).unwrap();
        db.put(prefixes::tx_num_key(tx_hash), prefixes::amount_value(tx_num))
            .unwrap();
        db.put(
            prefixes::hashx_utxo_key(tx_hash, tx_num, nout),
            hashx.0.to_vec(),
        )
        .unwrap();
        db.put(
            prefixes::utxo_key(&hashx, tx_num, nout),
            prefixes::amount_value(value),
        )
        .unwrap();
        hashx
    }

    fn spend(prev_hash: Hash32, prev_idx: u32, value: u64, pay_seed: u8) -> Tx {
        Tx {
            version: 1,
            inputs: vec![TxInput {
                prev_hash,
                prev_idx,
                script_sig: Vec::new(),
                sequence: 0xffff_ffff,
            }],
            outputs: vec![TxOutput {
                value,
                pk_script: build::pay_script(pay_seed),
            }],
            locktime: 0,
            raw: Vec::new(),
        }
    }

    fn mempool_with(
        daemon: Arc<FakeDaemon>,
        db: Arc<DB>,
    ) -> Arc<MemPool<FakeDaemon>> {
        MemPool::new(daemon, db, Arc::new(Mutex::new(())), 1.0)
    }

    #[tokio::test]
    async fn accepts_chained_unconfirmed_transactions() {
        let (db, _dir) = open_db();
        let daemon = FakeDaemon::new();

        let funding_hash = Hash32([3u8; 32]);
        store_confirmed_utxo(&db, &funding_hash, 1, 0, 500);

        let tx1 = spend(funding_hash, 0, 450, 1);
        let tx1_hash = tx_hash_of(&tx1);
        let tx2 = spend(tx1_hash, 0, 400, 2);
        let tx2_hash = tx_hash_of(&tx2);

        daemon.add_raw_tx(tx1_hash, serialize_tx(&tx1));
        daemon.add_raw_tx(tx2_hash, serialize_tx(&tx2));
        daemon.set_mempool(vec![tx1_hash.rpc_hex(), tx2_hash.rpc_hex()]);

        let mempool = mempool_with(daemon, db);
        mempool.refresh_once().await.unwrap();

        assert_eq!(mempool.len(), 2);
        assert_eq!(mempool.mempool_height(&tx1_hash), 0);
        assert_eq!(mempool.mempool_height(&tx2_hash), -1);
        assert_eq!(mempool.mempool_height(&Hash32([9u8; 32])), -2);

        let out_hashx = hashx_from_script(&build::pay_script(2)).unwrap();
        let summaries = mempool.transaction_summaries(&out_hashx);
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].fee, 50);
        assert!(summaries[0].has_unconfirmed_inputs);
        let utxos = mempool.unordered_utxos(&out_hashx);
        assert_eq!(utxos, vec![(tx2_hash, 0, 400)]);
        assert_eq!(mempool.balance_delta(&out_hashx), 400);
    }

    #[tokio::test]
    async fn drops_unresolvable_and_disappeared_transactions() {
        let (db, _dir) = open_db();
        let daemon = FakeDaemon::new();

        let orphan = spend(Hash32([8u8; 32]), 0, 10, 3);
        let orphan_hash = tx_hash_of(&orphan);
        daemon.add_raw_tx(orphan_hash, serialize_tx(&orphan));
        daemon.set_mempool(vec![orphan_hash.rpc_hex()]);

        let mempool = mempool_with(daemon.clone(), db);
        mempool.refresh_once().await.unwrap();
        assert!(mempool.is_empty());

        // A resolvable tx that later disappears.
        let funding_hash = Hash32([4u8; 32]);
        store_confirmed_utxo(&mempool.db, &funding_hash, 2, 0, 100);
        let tx = spend(funding_hash, 0, 90, 5);
        let tx_hash = tx_hash_of(&tx);
        daemon.add_raw_tx(tx_hash, serialize_tx(&tx));
        daemon.set_mempool(vec![tx_hash.rpc_hex()]);
        mempool.refresh_once().await.unwrap();
        assert_eq!(mempool.len(), 1);

        daemon.set_mempool(Vec::new());
        mempool.refresh_once().await.unwrap();
        assert!(mempool.is_empty());
    }

    #[tokio::test]
    async fn notifications_wait_for_matching_heights() {
        let (db, _dir) = open_db();
        let daemon = FakeDaemon::new();
        let mempool = mempool_with(daemon, db);

        let (sender, mut receiver) = mpsc::unbounded_channel();
        mempool.start(0, sender);
        // Seed notification at startup.
        assert_eq!(receiver.try_recv().unwrap().height, 0);

        let hashx = HashX([1u8; HASHX_LEN_TEST]);
        let mut touched = HashSet::new();
        touched.insert(hashx);
        mempool.on_mempool(touched.clone(), HashSet::new(), 0).await;
        let note = receiver.try_recv().unwrap();
        assert_eq!(note.height, 0);
        assert!(note.touched.contains(&hashx));

        // A block lands; nothing fires until the mempool view catches up.
        let block_hashx = HashX([2u8; HASHX_LEN_TEST]);
        let mut block_touched = std::collections::BTreeSet::new();
        block_touched.insert(block_hashx);
        mempool.on_block(&block_touched, 1).await;
        assert!(receiver.try_recv().is_err());

        mempool.on_mempool(touched, HashSet::new(), 1).await;
        let note = receiver.try_recv().unwrap();
        assert_eq!(note.height, 1);
        assert!(note.touched.contains(&hashx));
        assert!(note.touched.contains(&block_hashx));
    }

    const HASHX_LEN_TEST: usize = crate::types::HASHX_LEN;
}
