/// Typed access to the claim database.
///
/// `ClaimDb` owns the RocksDB handle, the reversible op stack and the
/// in-memory chain cursors (headers, cumulative tx counts, db state). All
/// reads see committed state with the current block's staged mutations
/// applied on top, so mid-block logic observes its own writes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rocksdb::{Direction, IteratorMode, Options, DB};

use crate::coin::HEADER_SIZE;
use crate::error::{IndexerError, Result};
use crate::prefixes::{self, ActivationValue, ClaimToTxoValue, DbState, TakeoverValue};
use crate::revertable::{upper_bound, RevertableOpStack, Staged};
use crate::types::{ClaimHash, Hash32, HashX, Height, TxNum};

/// Search-index projection of one claim, produced after each block for the
/// external full-text sink.
#[derive(Debug, Clone)]
pub struct ClaimProjection {
    pub claim_id: String,
    pub name: String,
    pub normalized_name: String,
    pub amount: u64,
    pub effective_amount: u64,
    pub tx_num: TxNum,
    pub position: u32,
    pub is_controlling: bool,
    pub channel_id: Option<String>,
    pub reposted_claim_id: Option<String>,
}

pub struct ClaimDb {
    db: Arc<DB>,
    pub stack: RevertableOpStack,
    pub state: DbState,
    /// Copy of the persisted state row, staged as the delete pre-image on
    /// each rewrite so rollback restores it exactly.
    written_state: Option<DbState>,
    /// headers[h] is the header at height h.
    pub headers: Vec<[u8; HEADER_SIZE]>,
    /// tx_counts[h] is the cumulative transaction count through height h.
    pub tx_counts: Vec<u64>,
    pub reorg_limit: u32,
}

impl ClaimDb {
    pub fn open(path: &Path, reorg_limit: u32) -> Result<ClaimDb> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.increase_parallelism(4);
        let db = Arc::new(DB::open(&opts, path)?);
        let stack = RevertableOpStack::new(db.clone());
        let mut claim_db = ClaimDb {
            db,
            stack,
            state: DbState::default(),
            written_state: None,
            headers: Vec::new(),
            tx_counts: Vec::new(),
            reorg_limit,
        };
        claim_db.load_state()?;
        Ok(claim_db)
    }

    /// True until the first block (genesis, height 0) has been applied.
    pub fn is_empty_chain(&self) -> bool {
        self.headers.is_empty()
    }

    fn load_state(&mut self) -> Result<()> {
        if let Some(raw) = self.db.get(prefixes::db_state_key())? {
            let state = prefixes::decode_db_state(&raw)?;
            self.written_state = Some(state.clone());
            self.state = state;
        } else {
            return Ok(());
        }
        if self.state.db_tip == Hash32::default() {
            // State row exists but the chain was fully unwound.
            return Ok(());
        }
        for height in 0..=self.state.db_height {
            let header = self
                .db
                .get(prefixes::header_key(height))?
                .ok_or_else(|| IndexerError::Corrupt(format!("missing header {height}")))?;
            let header: [u8; HEADER_SIZE] = header
                .try_into()
                .map_err(|_| IndexerError::Corrupt(format!("bad header width at {height}")))?;
            self.headers.push(header);
            let count = self
                .db
                .get(prefixes::tx_count_key(height))?
                .ok_or_else(|| IndexerError::Corrupt(format!("missing tx_count {height}")))?;
            self.tx_counts.push(prefixes::decode_amount(&count)?);
        }
        Ok(())
    }

    /// Stage the db-state row (delete pre-image first so undo restores it).
    pub fn write_db_state(&mut self) -> Result<()> {
        if let Some(old) = self.written_state.take() {
            self.stack
                .stage_delete(prefixes::db_state_key(), prefixes::db_state_value(&old))?;
        }
        self.stack
            .stage_put(prefixes::db_state_key(), prefixes::db_state_value(&self.state))?;
        self.written_state = Some(self.state.clone());
        Ok(())
    }

    /// Sanity check after a commit: the persisted row matches our cursors.
    pub fn assert_db_state(&self) -> Result<()> {
        let raw = self
            .db
            .get(prefixes::db_state_key())?
            .ok_or_else(|| IndexerError::Corrupt("db state row missing".into()))?;
        let persisted = prefixes::decode_db_state(&raw)?;
        if persisted != self.state {
            return Err(IndexerError::InvariantViolated(format!(
                "db state divergence: persisted height {} vs cursor {}",
                persisted.db_height, self.state.db_height
            )));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // overlay-aware reads

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.stack.get_staged(key) {
            Some(Staged::Put(value)) => Ok(Some(value.clone())),
            Some(Staged::Deleted) => Ok(None),
            None => Ok(self.db.get(key)?),
        }
    }

    /// Entries with `start <= key < stop`, committed plus staged overlay,
    /// ascending key order.
    pub fn iterate_range(&self, start: &[u8], stop: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: std::collections::BTreeMap<Vec<u8>, Vec<u8>> =
            std::collections::BTreeMap::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.as_ref() >= stop {
                break;
            }
            merged.insert(key.to_vec(), value.to_vec());
        }
        for (key, staged) in self.stack.staged_in_range(start, stop) {
            match staged {
                Staged::Put(value) => {
                    merged.insert(key, value);
                }
                Staged::Deleted => {
                    merged.remove(&key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    pub fn iterate_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        match upper_bound(prefix) {
            Some(stop) => self.iterate_range(prefix, &stop),
            None => self.iterate_range(prefix, &[0xffu8; 64]),
        }
    }

    /// Committed-only prefix scan, no overlay.
    pub fn iterate_prefix_committed(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let stop = upper_bound(prefix).unwrap_or_else(|| vec![0xffu8; 64]);
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.as_ref() >= stop.as_slice() {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    /// Committed state only, ignoring the staged overlay. The takeover pass
    /// uses these where it must see the previous block's view of a row that
    /// this block has already re-staged.
    pub fn committed_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    pub fn claim_txo_committed(&self, claim_hash: &ClaimHash) -> Result<Option<ClaimToTxoValue>> {
        match self.committed_get(&prefixes::claim_to_txo_key(claim_hash))? {
            Some(raw) => Ok(Some(prefixes::decode_claim_to_txo(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn activation_committed(
        &self,
        txo_type: u8,
        tx_num: TxNum,
        position: u32,
    ) -> Result<Option<ActivationValue>> {
        match self.committed_get(&prefixes::activated_key(txo_type, tx_num, position))? {
            Some(raw) => Ok(Some(prefixes::decode_activated(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn channel_for_claim_committed(
        &self,
        claim_hash: &ClaimHash,
        tx_num: TxNum,
        position: u32,
    ) -> Result<Option<ClaimHash>> {
        match self.committed_get(&prefixes::claim_to_channel_key(claim_hash, tx_num, position))? {
            Some(raw) => Ok(Some(prefixes::decode_claim_hash(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn repost_committed(&self, claim_hash: &ClaimHash) -> Result<Option<ClaimHash>> {
        match self.committed_get(&prefixes::repost_key(claim_hash))? {
            Some(raw) => Ok(Some(prefixes::decode_claim_hash(&raw)?)),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // transaction lookups

    pub fn tx_num(&self, tx_hash: &Hash32) -> Result<Option<TxNum>> {
        match self.get(&prefixes::tx_num_key(tx_hash))? {
            Some(raw) => Ok(Some(prefixes::decode_amount(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn tx_hash_for_num(&self, tx_num: TxNum) -> Result<Option<Hash32>> {
        Ok(self
            .get(&prefixes::tx_hash_key(tx_num))?
            .and_then(|raw| Hash32::from_slice(&raw)))
    }

    pub fn raw_tx(&self, tx_hash: &Hash32) -> Result<Option<Vec<u8>>> {
        self.get(&prefixes::tx_key(tx_hash))
    }

    pub fn block_hash_at(&self, height: Height) -> Result<Option<Hash32>> {
        Ok(self
            .get(&prefixes::block_hash_key(height))?
            .and_then(|raw| Hash32::from_slice(&raw)))
    }

    /// Height of the block containing `tx_num`: the first height whose
    /// cumulative count exceeds it.
    pub fn height_for_tx_num(&self, tx_num: TxNum) -> Height {
        self.tx_counts.partition_point(|count| *count <= tx_num) as Height
    }

    // -----------------------------------------------------------------------
    // utxo lookups

    pub fn utxo_amount(&self, hashx: &HashX, tx_num: TxNum, nout: u32) -> Result<Option<u64>> {
        match self.get(&prefixes::utxo_key(hashx, tx_num, nout))? {
            Some(raw) => Ok(Some(prefixes::decode_amount(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn hashx_for_utxo(&self, tx_hash: &Hash32, tx_num: TxNum, nout: u32) -> Result<Option<HashX>> {
        Ok(self
            .get(&prefixes::hashx_utxo_key(tx_hash, tx_num, nout))?
            .and_then(|raw| HashX::from_slice(&raw)))
    }

    /// Resolve mempool prevouts against confirmed UTXOs. Failed lookups
    /// yield None; the mempool defers those transactions.
    pub fn lookup_utxos(
        &self,
        prevouts: &[(Hash32, u32)],
    ) -> Result<Vec<Option<(HashX, u64)>>> {
        let mut out = Vec::with_capacity(prevouts.len());
        for (tx_hash, nout) in prevouts {
            let resolved = match self.tx_num(tx_hash)? {
                Some(tx_num) => match self.hashx_for_utxo(tx_hash, tx_num, *nout)? {
                    Some(hashx) => self
                        .utxo_amount(&hashx, tx_num, *nout)?
                        .map(|amount| (hashx, amount)),
                    None => None,
                },
                None => None,
            };
            out.push(resolved);
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // claim lookups

    pub fn claim_txo(&self, claim_hash: &ClaimHash) -> Result<Option<ClaimToTxoValue>> {
        match self.get(&prefixes::claim_to_txo_key(claim_hash))? {
            Some(raw) => Ok(Some(prefixes::decode_claim_to_txo(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn claim_from_txo(&self, tx_num: TxNum, position: u32) -> Result<Option<(ClaimHash, String)>> {
        match self.get(&prefixes::txo_to_claim_key(tx_num, position))? {
            Some(raw) => Ok(Some(prefixes::decode_claim_with_name(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn supported_claim_from_txo(
        &self,
        tx_num: TxNum,
        position: u32,
    ) -> Result<Option<(ClaimHash, u64)>> {
        let Some(raw) = self.get(&prefixes::support_to_claim_key(tx_num, position))? else {
            return Ok(None);
        };
        let claim_hash = prefixes::decode_claim_hash(&raw)?;
        let amount = self
            .get(&prefixes::claim_to_support_key(&claim_hash, tx_num, position))?
            .map(|raw| prefixes::decode_amount(&raw))
            .transpose()?
            .ok_or_else(|| {
                IndexerError::Corrupt(format!(
                    "support_to_claim without claim_to_support at {tx_num}:{position}"
                ))
            })?;
        Ok(Some((claim_hash, amount)))
    }

    pub fn channel_for_claim(
        &self,
        claim_hash: &ClaimHash,
        tx_num: TxNum,
        position: u32,
    ) -> Result<Option<ClaimHash>> {
        match self.get(&prefixes::claim_to_channel_key(claim_hash, tx_num, position))? {
            Some(raw) => Ok(Some(prefixes::decode_claim_hash(&raw)?)),
            None => Ok(None),
        }
    }

    /// Claims signed by a channel: (claim_hash, normalized_name, tx_num, pos).
    pub fn claims_in_channel(
        &self,
        channel_hash: &ClaimHash,
    ) -> Result<Vec<(ClaimHash, String, TxNum, u32)>> {
        let prefix = prefixes::channel_to_claim_prefix(channel_hash);
        let mut out = Vec::new();
        for (key, value) in self.iterate_prefix(&prefix)? {
            let claim_hash = prefixes::decode_claim_hash(&value)?;
            // key: tag + channel(20) + u16 name len + name + tx_num(8) + pos(4)
            let fixed = 1 + 20;
            let corrupt = || IndexerError::Corrupt("bad channel_to_claim key".into());
            let name_len =
                u16::from_be_bytes(key.get(fixed..fixed + 2).ok_or_else(corrupt)?.try_into().unwrap())
                    as usize;
            let name_start = fixed + 2;
            let name = String::from_utf8(
                key.get(name_start..name_start + name_len)
                    .ok_or_else(corrupt)?
                    .to_vec(),
            )
            .map_err(|_| corrupt())?;
            let rest = name_start + name_len;
            let tx_num = u64::from_be_bytes(
                key.get(rest..rest + 8).ok_or_else(corrupt)?.try_into().unwrap(),
            );
            let position = u32::from_be_bytes(
                key.get(rest + 8..rest + 12).ok_or_else(corrupt)?.try_into().unwrap(),
            );
            out.push((claim_hash, name, tx_num, position));
        }
        Ok(out)
    }

    pub fn repost(&self, claim_hash: &ClaimHash) -> Result<Option<ClaimHash>> {
        match self.get(&prefixes::repost_key(claim_hash))? {
            Some(raw) => Ok(Some(prefixes::decode_claim_hash(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn support_amount_total(&self, claim_hash: &ClaimHash) -> Result<Option<u64>> {
        match self.get(&prefixes::support_amount_key(claim_hash))? {
            Some(raw) => Ok(Some(prefixes::decode_amount(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn channel_count(&self, channel_hash: &ClaimHash) -> Result<Option<u32>> {
        match self.get(&prefixes::channel_count_key(channel_hash))? {
            Some(raw) => Ok(Some(prefixes::decode_count(&raw)?)),
            None => Ok(None),
        }
    }

    /// Live claims competing for a name as of the last committed block, via
    /// the length-1 short-id rows (exactly one per claim). Committed-only:
    /// claims staged in the current block are tracked separately by the
    /// processor's staging maps.
    pub fn claims_for_name(&self, normalized_name: &str) -> Result<HashMap<ClaimHash, (TxNum, u32)>> {
        let mut prefix = vec![prefixes::CLAIM_SHORT_ID];
        prefix.extend_from_slice(&(normalized_name.len() as u16).to_be_bytes());
        prefix.extend_from_slice(normalized_name.as_bytes());
        let mut out = HashMap::new();
        for (key, value) in self.iterate_prefix_committed(&prefix)? {
            let plen_pos = prefix.len();
            let partial_len = *key
                .get(plen_pos)
                .ok_or_else(|| IndexerError::Corrupt("bad claim_short_id key".into()))?;
            if partial_len != 1 {
                continue;
            }
            let (tx_num, position) = prefixes::decode_txo(&value)?;
            let Some(raw) = self.committed_get(&prefixes::txo_to_claim_key(tx_num, position))?
            else {
                continue;
            };
            let (claim_hash, _) = prefixes::decode_claim_with_name(&raw)?;
            out.insert(claim_hash, (tx_num, position));
        }
        Ok(out)
    }

    /// Amount of the claim txo activation in force at `height`, if any.
    pub fn active_claim_amount_as_of(&self, claim_hash: &ClaimHash, height: Height) -> Result<u64> {
        let start = prefixes::active_amount_prefix(claim_hash, prefixes::CLAIM_TXO_TYPE);
        let stop =
            prefixes::active_amount_height_bound(claim_hash, prefixes::CLAIM_TXO_TYPE, height + 1);
        let entries = self.iterate_range(&start, &stop)?;
        match entries.last() {
            Some((_, value)) => prefixes::decode_amount(value),
            None => Ok(0),
        }
    }

    pub fn support_txo_amount(
        &self,
        claim_hash: &ClaimHash,
        tx_num: TxNum,
        position: u32,
    ) -> Result<Option<u64>> {
        match self.get(&prefixes::claim_to_support_key(claim_hash, tx_num, position))? {
            Some(raw) => Ok(Some(prefixes::decode_amount(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn controlling_claim(&self, normalized_name: &str) -> Result<Option<TakeoverValue>> {
        match self.get(&prefixes::claim_takeover_key(normalized_name))? {
            Some(raw) => Ok(Some(prefixes::decode_claim_takeover(&raw)?)),
            None => Ok(None),
        }
    }

    /// The claim's current entry in the bid-ordered index, if any.
    pub fn effective_amount_entry(
        &self,
        normalized_name: &str,
        claim_hash: &ClaimHash,
    ) -> Result<Option<prefixes::EffectiveAmountKey>> {
        let prefix = prefixes::effective_amount_prefix(normalized_name);
        for (key, value) in self.iterate_prefix(&prefix)? {
            if prefixes::decode_claim_hash(&value)? == *claim_hash {
                return Ok(Some(prefixes::decode_effective_amount_key(
                    &key,
                    normalized_name.len(),
                )?));
            }
        }
        Ok(None)
    }

    // -----------------------------------------------------------------------
    // activation lookups

    pub fn activation(&self, txo_type: u8, tx_num: TxNum, position: u32) -> Result<Option<ActivationValue>> {
        match self.get(&prefixes::activated_key(txo_type, tx_num, position))? {
            Some(raw) => Ok(Some(prefixes::decode_activated(&raw)?)),
            None => Ok(None),
        }
    }

    /// Sum of support amounts whose activation height is strictly below
    /// `height`. Activations landing exactly at the block being processed
    /// are accounted separately by the staging maps.
    pub fn active_amount_as_of(
        &self,
        claim_hash: &ClaimHash,
        txo_type: u8,
        height: Height,
    ) -> Result<u64> {
        let start = prefixes::active_amount_prefix(claim_hash, txo_type);
        let stop = prefixes::active_amount_height_bound(claim_hash, txo_type, height);
        let mut total = 0u64;
        for (_, value) in self.iterate_range(&start, &stop)? {
            total += prefixes::decode_amount(&value)?;
        }
        Ok(total)
    }

    /// Claims and supports scheduled to activate exactly at `height`:
    /// ((claim_hash, name), (txo_type, tx_num, position)).
    pub fn activated_at_height(
        &self,
        height: Height,
    ) -> Result<Vec<((ClaimHash, String), (u8, TxNum, u32))>> {
        let prefix = prefixes::pending_activation_prefix(height);
        let mut out = Vec::new();
        for (key, value) in self.iterate_prefix(&prefix)? {
            let (_, txo_type, tx_num, position) = prefixes::decode_pending_activation_key(&key)?;
            let (claim_hash, name) = prefixes::decode_claim_with_name(&value)?;
            out.push(((claim_hash, name), (txo_type, tx_num, position)));
        }
        Ok(out)
    }

    /// Pending activations in `[height+1, height+1+max_delay]`, keeping the
    /// latest scheduled entry per claim.
    pub fn future_activated_in_window(
        &self,
        height: Height,
        max_delay: u32,
    ) -> Result<HashMap<(ClaimHash, String), (Height, u8, TxNum, u32)>> {
        let start = prefixes::pending_activation_prefix(height + 1);
        let stop = prefixes::pending_activation_prefix(height + 2 + max_delay);
        let mut out = HashMap::new();
        for (key, value) in self.iterate_range(&start, &stop)?.into_iter().rev() {
            let (act_height, txo_type, tx_num, position) =
                prefixes::decode_pending_activation_key(&key)?;
            let (claim_hash, name) = prefixes::decode_claim_with_name(&value)?;
            out.entry((claim_hash, name))
                .or_insert((act_height, txo_type, tx_num, position));
        }
        Ok(out)
    }

    /// Claims whose expiration height is exactly `height`:
    /// (tx_num, position, claim_hash, normalized_name).
    pub fn expired_by_height(&self, height: Height) -> Result<Vec<(TxNum, u32, ClaimHash, String)>> {
        let prefix = prefixes::claim_expiration_prefix(height);
        let mut out = Vec::new();
        for (key, value) in self.iterate_prefix(&prefix)? {
            let (_, tx_num, position) = prefixes::decode_claim_expiration_key(&key)?;
            let (claim_hash, name) = prefixes::decode_claim_with_name(&value)?;
            out.push((tx_num, position, claim_hash, name));
        }
        Ok(out)
    }

    pub fn touched_or_deleted_at(
        &self,
        height: Height,
    ) -> Result<Option<(Vec<ClaimHash>, Vec<ClaimHash>)>> {
        match self.get(&prefixes::touched_or_deleted_key(height))? {
            Some(raw) => Ok(Some(prefixes::decode_touched_or_deleted(&raw)?)),
            None => Ok(None),
        }
    }

    /// Heights at or below `max_height` that still hold undo records or
    /// touched_or_deleted rows; used to prune beyond the reorg window.
    pub fn prunable_below(&self, tag: u8, max_height: Height) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let start = vec![tag, 0, 0, 0, 0];
        let mut stop = vec![tag];
        stop.extend_from_slice(&(max_height + 1).to_be_bytes());
        self.iterate_range(&start, &stop)
    }

    // -----------------------------------------------------------------------
    // search projections

    pub fn claims_producer(&self, touched: &[ClaimHash]) -> Result<Vec<ClaimProjection>> {
        let mut out = Vec::with_capacity(touched.len());
        for claim_hash in touched {
            let Some(claim) = self.claim_txo(claim_hash)? else {
                continue;
            };
            let normalized_name = crate::coin::normalize_name(claim.name.as_bytes());
            let effective_amount = self
                .effective_amount_entry(&normalized_name, claim_hash)?
                .map(|entry| entry.effective_amount)
                .unwrap_or(claim.amount);
            let is_controlling = self
                .controlling_claim(&normalized_name)?
                .map(|takeover| takeover.claim_hash == *claim_hash)
                .unwrap_or(false);
            let channel_id = self
                .channel_for_claim(claim_hash, claim.tx_num, claim.position)?
                .map(|hash| hash.hex());
            let reposted_claim_id = self.repost(claim_hash)?.map(|hash| hash.hex());
            out.push(ClaimProjection {
                claim_id: claim_hash.hex(),
                name: claim.name.clone(),
                normalized_name,
                amount: claim.amount,
                effective_amount,
                tx_num: claim.tx_num,
                position: claim.position,
                is_controlling,
                channel_id,
                reposted_claim_id,
            });
        }
        Ok(out)
    }

    /// Rewrite every claim expiration row from the original schedule to the
    /// extended one. Runs once, at the fork height, so expiration keys stay
    /// consistent with what `expiration_height` computes afterwards.
    pub fn apply_expiration_extension_fork(&mut self) -> Result<()> {
        let rows = self.iterate_prefix_committed(&[prefixes::CLAIM_EXPIRATION])?;
        for (key, value) in rows {
            let (expiration, tx_num, position) = prefixes::decode_claim_expiration_key(&key)?;
            let extended = expiration - crate::coin::ORIGINAL_CLAIM_EXPIRATION_TIME
                + crate::coin::EXTENDED_CLAIM_EXPIRATION_TIME;
            self.stack.stage_delete(key, value.clone())?;
            self.stack
                .stage_put(prefixes::claim_expiration_key(extended, tx_num, position), value)?;
        }
        self.stack.unsafe_commit()
    }

    /// Raw handle for read-only collaborators (mempool prevout lookups).
    pub fn raw_handle(&self) -> Arc<DB> {
        self.db.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open() -> (ClaimDb, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = ClaimDb::open(dir.path(), 200).unwrap();
        (db, dir)
    }

    #[test]
    fn fresh_db_has_empty_chain() {
        let (db, _dir) = open();
        assert!(db.is_empty_chain());
        assert_eq!(db.state, DbState::default());
    }

    #[test]
    fn overlay_reads_take_precedence() {
        let (mut db, _dir) = open();
        let claim = ClaimHash([4u8; 20]);
        let value = ClaimToTxoValue {
            tx_num: 1,
            position: 0,
            root_tx_num: 1,
            root_position: 0,
            amount: 50,
            channel_signature_is_valid: false,
            name: "n".into(),
        };
        db.stack
            .stage_put(
                prefixes::claim_to_txo_key(&claim),
                prefixes::claim_to_txo_value(&value),
            )
            .unwrap();
        assert_eq!(db.claim_txo(&claim).unwrap(), Some(value.clone()));
        db.stack.unsafe_commit().unwrap();
        db.stack
            .stage_delete(
                prefixes::claim_to_txo_key(&claim),
                prefixes::claim_to_txo_value(&value),
            )
            .unwrap();
        assert_eq!(db.claim_txo(&claim).unwrap(), None);
    }

    #[test]
    fn active_amount_respects_height_bound() {
        let (mut db, _dir) = open();
        let claim = ClaimHash([1u8; 20]);
        for (height, amount) in [(5u32, 10u64), (10, 20), (15, 40)] {
            db.stack
                .stage_put(
                    prefixes::active_amount_key(&claim, prefixes::SUPPORT_TXO_TYPE, height, 1, height),
                    prefixes::amount_value(amount),
                )
                .unwrap();
        }
        db.stack.unsafe_commit().unwrap();
        assert_eq!(
            db.active_amount_as_of(&claim, prefixes::SUPPORT_TXO_TYPE, 4).unwrap(),
            0
        );
        // Exclusive bound: the activation landing at the queried height is
        // not yet counted.
        assert_eq!(
            db.active_amount_as_of(&claim, prefixes::SUPPORT_TXO_TYPE, 10).unwrap(),
            10
        );
        assert_eq!(
            db.active_amount_as_of(&claim, prefixes::SUPPORT_TXO_TYPE, 11).unwrap(),
            30
        );
        assert_eq!(
            db.active_amount_as_of(&claim, prefixes::SUPPORT_TXO_TYPE, 100).unwrap(),
            70
        );
    }

    #[test]
    fn db_state_rewrite_is_revertable() {
        let (mut db, _dir) = open();
        db.state.db_height = 1;
        db.state.db_tx_count = 3;
        db.write_db_state().unwrap();
        db.stack.commit(1).unwrap();
        db.assert_db_state().unwrap();

        db.state.db_height = 2;
        db.state.db_tx_count = 9;
        db.write_db_state().unwrap();
        db.stack.commit(2).unwrap();
        db.assert_db_state().unwrap();

        db.stack.stage_rollback(2).unwrap();
        db.stack.unsafe_commit().unwrap();
        let raw = db.get(&prefixes::db_state_key()).unwrap().unwrap();
        let restored = prefixes::decode_db_state(&raw).unwrap();
        assert_eq!(restored.db_height, 1);
        assert_eq!(restored.db_tx_count, 3);
    }
}
