/// Reversible write staging for the key-value store.
///
/// Every mutation staged for a block records enough to invert it: a put
/// remembers it was a put, a delete carries its full pre-image value. On
/// commit the forward ops and the serialized undo record land in one atomic
/// WriteBatch, so readers never observe partial application and any block
/// within the reorg window can be unwound bit-for-bit.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use rocksdb::{WriteBatch, DB};
use serde::{Deserialize, Serialize};

use crate::error::{IndexerError, Result};
use crate::prefixes;
use crate::types::Height;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevertableOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    /// `value` is the pre-image being deleted; the stack does not read.
    Delete { key: Vec<u8>, value: Vec<u8> },
}

impl RevertableOp {
    pub fn key(&self) -> &[u8] {
        match self {
            RevertableOp::Put { key, .. } | RevertableOp::Delete { key, .. } => key,
        }
    }

    pub fn invert(self) -> RevertableOp {
        match self {
            RevertableOp::Put { key, value } => RevertableOp::Delete { key, value },
            RevertableOp::Delete { key, value } => RevertableOp::Put { key, value },
        }
    }
}

/// Smallest key strictly greater than every key with the given prefix, or
/// None when the prefix is all 0xff.
pub fn upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    loop {
        match upper.pop() {
            None => return None,
            Some(0xff) => continue,
            Some(b) => {
                upper.push(b + 1);
                return Some(upper);
            }
        }
    }
}

/// What the overlay currently says about a staged key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staged {
    Put(Vec<u8>),
    Deleted,
}

/// Ordered log of staged operations plus a key overlay for read-through.
pub struct RevertableOpStack {
    db: Arc<DB>,
    ops: Vec<RevertableOp>,
    overlay: BTreeMap<Vec<u8>, Staged>,
}

impl RevertableOpStack {
    pub fn new(db: Arc<DB>) -> Self {
        RevertableOpStack {
            db,
            ops: Vec::new(),
            overlay: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn stage_put(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        if let Some(Staged::Put(_)) = self.overlay.get(&key) {
            return Err(IndexerError::InvariantViolated(format!(
                "staged put over staged put for key {}",
                hex::encode(&key)
            )));
        }
        self.overlay.insert(key.clone(), Staged::Put(value.clone()));
        self.ops.push(RevertableOp::Put { key, value });
        Ok(())
    }

    /// Stage a delete unless this block already deleted the key. Row removal
    /// for a claim can overlap signature invalidation in the same block; the
    /// second delete is redundant by construction.
    pub fn stage_delete_unless_deleted(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        if let Some(Staged::Deleted) = self.overlay.get(&key) {
            return Ok(());
        }
        self.stage_delete(key, value)
    }

    pub fn stage_delete(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        if let Some(Staged::Deleted) = self.overlay.get(&key) {
            return Err(IndexerError::InvariantViolated(format!(
                "staged delete over staged delete for key {}",
                hex::encode(&key)
            )));
        }
        self.overlay.insert(key.clone(), Staged::Deleted);
        self.ops.push(RevertableOp::Delete { key, value });
        Ok(())
    }

    /// Staged view of a key, if this block touched it.
    pub fn get_staged(&self, key: &[u8]) -> Option<&Staged> {
        self.overlay.get(key)
    }

    /// Staged entries within a key prefix, for overlay-aware iteration.
    pub fn staged_in_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Staged)> {
        let end = match upper_bound(prefix) {
            Some(bound) => Bound::Excluded(bound),
            None => Bound::Unbounded,
        };
        self.overlay
            .range((Bound::Included(prefix.to_vec()), end))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Staged entries with `start <= key < stop`.
    pub fn staged_in_range(&self, start: &[u8], stop: &[u8]) -> Vec<(Vec<u8>, Staged)> {
        self.overlay
            .range((
                Bound::Included(start.to_vec()),
                Bound::Excluded(stop.to_vec()),
            ))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Write all forward ops plus the undo record for `height` as one atomic
    /// batch, then reset.
    pub fn commit(&mut self, height: Height) -> Result<()> {
        let undo = bincode::serialize(&self.ops)
            .map_err(|e| IndexerError::Corrupt(format!("undo serialization: {e}")))?;
        let mut batch = WriteBatch::default();
        self.apply_ops_to_batch(&mut batch);
        batch.put(prefixes::undo_key(height), undo);
        self.db.write(batch)?;
        self.clear();
        Ok(())
    }

    /// Forward write without an undo record. Only for blocks already beyond
    /// the reorg horizon or replay-safe metadata.
    pub fn unsafe_commit(&mut self) -> Result<()> {
        let mut batch = WriteBatch::default();
        self.apply_ops_to_batch(&mut batch);
        self.db.write(batch)?;
        self.clear();
        Ok(())
    }

    /// Stage the inverse of block `height` plus the deletion of its undo
    /// record. The caller follows up with `unsafe_commit` (after staging any
    /// state rewrites) so the whole unwind lands in one atomic batch.
    pub fn stage_rollback(&mut self, height: Height) -> Result<()> {
        if !self.is_empty() {
            return Err(IndexerError::InvariantViolated(
                "rollback with staged ops pending".into(),
            ));
        }
        let undo_key = prefixes::undo_key(height);
        let raw = self.db.get(&undo_key)?.ok_or_else(|| {
            IndexerError::Corrupt(format!("missing undo record for height {height}"))
        })?;
        let ops: Vec<RevertableOp> = bincode::deserialize(&raw)
            .map_err(|e| IndexerError::Corrupt(format!("undo record for {height}: {e}")))?;
        for op in ops.into_iter().rev() {
            match op.invert() {
                RevertableOp::Put { key, value } => self.stage_put(key, value)?,
                RevertableOp::Delete { key, value } => self.stage_delete(key, value)?,
            }
        }
        self.stage_delete(undo_key, raw)?;
        Ok(())
    }

    /// Discard everything staged without writing.
    pub fn clear(&mut self) {
        self.ops.clear();
        self.overlay.clear();
    }

    fn apply_ops_to_batch(&self, batch: &mut WriteBatch) {
        for op in &self.ops {
            match op {
                RevertableOp::Put { key, value } => batch.put(key, value),
                RevertableOp::Delete { key, .. } => batch.delete(key),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocksdb::Options;
    use tempfile::TempDir;

    fn open_db() -> (Arc<DB>, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        (Arc::new(DB::open(&opts, dir.path()).unwrap()), dir)
    }

    fn snapshot(db: &DB) -> Vec<(Vec<u8>, Vec<u8>)> {
        db.iterator(rocksdb::IteratorMode::Start)
            .map(|item| {
                let (k, v) = item.unwrap();
                (k.to_vec(), v.to_vec())
            })
            .collect()
    }

    #[test]
    fn commit_then_rollback_restores_state() {
        let (db, _dir) = open_db();
        db.put(b"existing", b"old").unwrap();
        let before = snapshot(&db);

        let mut stack = RevertableOpStack::new(db.clone());
        stack.stage_put(b"fresh".to_vec(), b"v1".to_vec()).unwrap();
        stack
            .stage_delete(b"existing".to_vec(), b"old".to_vec())
            .unwrap();
        stack.commit(7).unwrap();

        assert_eq!(db.get(b"fresh").unwrap().unwrap(), b"v1");
        assert!(db.get(b"existing").unwrap().is_none());
        assert!(db.get(prefixes::undo_key(7)).unwrap().is_some());

        stack.stage_rollback(7).unwrap();
        stack.unsafe_commit().unwrap();
        assert_eq!(snapshot(&db), before);
    }

    #[test]
    fn rollback_applies_inverses_in_reverse_order() {
        let (db, _dir) = open_db();
        let mut stack = RevertableOpStack::new(db.clone());
        // Delete-then-put of the same key within one block must unwind to
        // the original absence.
        stack.stage_put(b"k".to_vec(), b"a".to_vec()).unwrap();
        stack.stage_delete(b"k".to_vec(), b"a".to_vec()).unwrap();
        stack.stage_put(b"k".to_vec(), b"b".to_vec()).unwrap();
        stack.commit(1).unwrap();
        assert_eq!(db.get(b"k").unwrap().unwrap(), b"b");
        stack.stage_rollback(1).unwrap();
        stack.unsafe_commit().unwrap();
        assert!(db.get(b"k").unwrap().is_none());
        assert!(db.get(prefixes::undo_key(1)).unwrap().is_none());
    }

    #[test]
    fn conflicting_stage_is_invariant_violation() {
        let (db, _dir) = open_db();
        let mut stack = RevertableOpStack::new(db);
        stack.stage_put(b"k".to_vec(), b"a".to_vec()).unwrap();
        let err = stack.stage_put(b"k".to_vec(), b"b".to_vec()).unwrap_err();
        assert!(matches!(err, IndexerError::InvariantViolated(_)));
    }

    #[test]
    fn missing_undo_record_is_corrupt() {
        let (db, _dir) = open_db();
        let mut stack = RevertableOpStack::new(db);
        let err = stack.stage_rollback(42).unwrap_err();
        assert!(matches!(err, IndexerError::Corrupt(_)));
    }

    #[test]
    fn unsafe_commit_leaves_no_undo() {
        let (db, _dir) = open_db();
        let mut stack = RevertableOpStack::new(db.clone());
        stack.stage_put(b"k".to_vec(), b"v".to_vec()).unwrap();
        stack.unsafe_commit().unwrap();
        assert!(db.get(prefixes::undo_key(0)).unwrap().is_none());
        assert_eq!(db.get(b"k").unwrap().unwrap(), b"v");
    }

    #[test]
    fn overlay_reads_through_staged_ops() {
        let (db, _dir) = open_db();
        let mut stack = RevertableOpStack::new(db);
        stack.stage_put(b"ak".to_vec(), b"v".to_vec()).unwrap();
        stack.stage_delete(b"ax".to_vec(), b"w".to_vec()).unwrap();
        assert_eq!(
            stack.get_staged(b"ak"),
            Some(&Staged::Put(b"v".to_vec()))
        );
        assert_eq!(stack.get_staged(b"ax"), Some(&Staged::Deleted));
        let in_prefix = stack.staged_in_prefix(b"a");
        assert_eq!(in_prefix.len(), 2);
        assert!(stack.staged_in_prefix(b"b").is_empty());
    }
}
