/// Per-block claimtrie staging state.
///
/// Everything accumulated while applying one block lives here, owned by the
/// block processor between the start of `advance_block` and the commit (or
/// discard on rollback). `clear` resets the value to its empty state; no
/// field survives across blocks.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::types::{ClaimHash, Hash32, HashX, Height, TxNum, TxoRef};

/// A claim or support activation, scheduled or applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingActivation {
    pub height: Height,
    pub txo_type: u8,
    pub tx_num: TxNum,
    pub position: u32,
}

impl PendingActivation {
    pub fn is_claim(&self) -> bool {
        self.txo_type == crate::prefixes::CLAIM_TXO_TYPE
    }

    pub fn is_support(&self) -> bool {
        self.txo_type == crate::prefixes::SUPPORT_TXO_TYPE
    }
}

/// Trending datapoint forwarded to the search index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrendingNotification {
    pub height: Height,
    pub prev_amount: u64,
    pub new_amount: u64,
}

/// One claim output staged within the current block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedClaim {
    pub name: String,
    pub normalized_name: String,
    pub claim_hash: ClaimHash,
    pub amount: u64,
    pub expiration_height: Height,
    pub tx_num: TxNum,
    pub position: u32,
    pub root_tx_num: TxNum,
    pub root_position: u32,
    pub channel_signature_is_valid: bool,
    pub signing_hash: Option<ClaimHash>,
    pub reposted_claim_hash: Option<ClaimHash>,
}

impl StagedClaim {
    /// Updates keep their original root pointers; fresh claims are their own
    /// root.
    pub fn is_update(&self) -> bool {
        (self.tx_num, self.position) != (self.root_tx_num, self.root_position)
    }

    pub fn invalidate_signature(&self) -> StagedClaim {
        StagedClaim {
            channel_signature_is_valid: false,
            signing_hash: None,
            ..self.clone()
        }
    }
}

#[derive(Default)]
pub struct BlockStaging {
    /// Names whose controlling claim changed this block.
    pub taken_over_names: BTreeSet<String>,
    /// txo -> pending claim staged this block.
    pub txo_to_claim: BTreeMap<TxoRef, StagedClaim>,
    /// claim hash -> its staged txo.
    pub claim_hash_to_txo: HashMap<ClaimHash, TxoRef>,
    /// claim hash -> support txos staged this block.
    pub support_txos_by_claim: HashMap<ClaimHash, Vec<TxoRef>>,
    /// support txo -> (supported claim, amount).
    pub support_txo_to_claim: BTreeMap<TxoRef, (ClaimHash, u64)>,
    /// name -> claim -> support txos removed this block.
    pub removed_support_txos_by_name_by_claim:
        HashMap<String, HashMap<ClaimHash, Vec<TxoRef>>>,
    pub abandoned_claims: BTreeMap<ClaimHash, StagedClaim>,
    pub updated_claims: BTreeSet<ClaimHash>,
    /// Activated support amounts removed this block, by supported claim.
    pub removed_active_support_amount_by_claim: BTreeMap<ClaimHash, Vec<u64>>,
    pub activated_support_amount_by_claim: HashMap<ClaimHash, Vec<u64>>,
    pub activated_claim_amount_by_name_and_hash: HashMap<(String, ClaimHash), u64>,
    /// Activations (pre-scheduled and delay-zero) applied at this height.
    pub activation_by_claim_by_name:
        BTreeMap<String, BTreeMap<ClaimHash, Vec<(PendingActivation, u64)>>>,
    /// Future-activation bookkeeping for the early-takeover probe.
    pub possible_future_claim_amount_by_name_and_hash: HashMap<(String, ClaimHash), u64>,
    pub possible_future_support_amounts_by_claim_hash: HashMap<ClaimHash, Vec<u64>>,
    pub possible_future_support_txos_by_claim_hash: HashMap<ClaimHash, Vec<TxoRef>>,
    /// Per-block touched/removed claim sets, persisted for reorg replay.
    pub removed_claim_hashes: BTreeSet<ClaimHash>,
    pub touched_claim_hashes: BTreeSet<ClaimHash>,
    pub signatures_changed: BTreeSet<ClaimHash>,
    pub pending_reposted: BTreeSet<ClaimHash>,
    pub pending_channel_counts: BTreeMap<ClaimHash, i64>,
    pub pending_support_amount_change: BTreeMap<ClaimHash, i64>,
    /// Channels created this block: claim hash -> public key bytes.
    pub pending_channels: HashMap<ClaimHash, Vec<u8>>,
    pub amount_cache: HashMap<(ClaimHash, u8, Height), u64>,
    pub expired_claim_hashes: HashSet<ClaimHash>,
    pub doesnt_have_valid_signature: HashSet<ClaimHash>,
    /// Claims that gained a valid channel signature this block.
    pub claim_channels: HashMap<ClaimHash, ClaimHash>,
    /// Address history accumulated this block: hashX -> tx nums, in order.
    pub hashxs_by_tx: BTreeMap<HashX, Vec<TxNum>>,
    pub pending_transaction_num_mapping: HashMap<Hash32, TxNum>,
    pub pending_transactions: BTreeMap<TxNum, Hash32>,
    /// Outputs created this block, consumed by same-block spends.
    pub utxo_cache: HashMap<(Hash32, u32), (HashX, u64)>,
}

impl BlockStaging {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
