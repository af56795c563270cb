/// Column tags and key/value codecs.
///
/// The store is a single ordered keyspace; every key leads with a 1-byte
/// column tag. Composite keys serialize fixed-width big-endian so that
/// lexicographic iteration matches the natural ordering of the fields.
/// Names inside composite keys are u16-length-prefixed.
///
/// The `effective_amount` key stores the complement of the amount so that
/// ascending iteration under a name prefix yields amounts descending; the
/// first entry for a name is its best bid.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{IndexerError, Result};
use crate::types::{ClaimHash, Hash32, HashX, Height, TxNum};

pub const TX: u8 = b'T';
pub const TX_NUM: u8 = b'N';
pub const TX_HASH: u8 = b'X';
pub const TX_COUNT: u8 = b'C';
pub const HEADER: u8 = b'H';
pub const BLOCK_HASH: u8 = b'B';
pub const BLOCK_TXS: u8 = b'b';
pub const UTXO: u8 = b'u';
pub const HASHX_UTXO: u8 = b'h';
pub const HASHX_HISTORY: u8 = b'x';
pub const CLAIM_TO_TXO: u8 = b'E';
pub const TXO_TO_CLAIM: u8 = b'G';
pub const CLAIM_EXPIRATION: u8 = b'O';
pub const CLAIM_SHORT_ID: u8 = b'F';
pub const CLAIM_TO_CHANNEL: u8 = b'I';
pub const CHANNEL_TO_CLAIM: u8 = b'J';
pub const REPOST: u8 = b'V';
pub const REPOSTED_CLAIM: u8 = b'W';
pub const SUPPORT_TO_CLAIM: u8 = b'L';
pub const CLAIM_TO_SUPPORT: u8 = b'K';
pub const ACTIVATED: u8 = b'R';
pub const PENDING_ACTIVATION: u8 = b'P';
pub const ACTIVE_AMOUNT: u8 = b'S';
pub const SUPPORT_AMOUNT: u8 = b'a';
pub const EFFECTIVE_AMOUNT: u8 = b'D';
pub const CLAIM_TAKEOVER: u8 = b'A';
pub const CHANNEL_COUNT: u8 = b'Z';
pub const TOUCHED_OR_DELETED: u8 = b't';
pub const UNDO: u8 = b'U';
pub const DB_STATE: u8 = b's';

/// Activation txo kinds, part of activation keys.
pub const CLAIM_TXO_TYPE: u8 = 1;
pub const SUPPORT_TXO_TYPE: u8 = 2;

struct KeyWriter(Vec<u8>);

impl KeyWriter {
    fn new(tag: u8) -> Self {
        KeyWriter(vec![tag])
    }

    fn bytes(mut self, data: &[u8]) -> Self {
        self.0.extend_from_slice(data);
        self
    }

    fn u8(mut self, v: u8) -> Self {
        self.0.push(v);
        self
    }

    fn u32(mut self, v: u32) -> Self {
        self.0.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn u64(mut self, v: u64) -> Self {
        self.0.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn name(mut self, name: &str) -> Self {
        self.0.extend_from_slice(&(name.len() as u16).to_be_bytes());
        self.0.extend_from_slice(name.as_bytes());
        self
    }

    fn build(self) -> Vec<u8> {
        self.0
    }
}

fn read_name(data: &[u8], pos: &mut usize) -> Result<String> {
    let corrupt = || IndexerError::Corrupt("truncated name field".into());
    let len_bytes = data.get(*pos..*pos + 2).ok_or_else(corrupt)?;
    let len = BigEndian::read_u16(len_bytes) as usize;
    *pos += 2;
    let raw = data.get(*pos..*pos + len).ok_or_else(corrupt)?;
    *pos += len;
    String::from_utf8(raw.to_vec()).map_err(|_| IndexerError::Corrupt("non-utf8 name".into()))
}

fn read_claim_hash(data: &[u8], pos: &mut usize) -> Result<ClaimHash> {
    let hash = ClaimHash::from_slice(
        data.get(*pos..*pos + 20)
            .ok_or_else(|| IndexerError::Corrupt("truncated claim hash".into()))?,
    )
    .unwrap();
    *pos += 20;
    Ok(hash)
}

// ---------------------------------------------------------------------------
// transaction columns

pub fn tx_key(tx_hash: &Hash32) -> Vec<u8> {
    KeyWriter::new(TX).bytes(&tx_hash.0).build()
}

pub fn tx_num_key(tx_hash: &Hash32) -> Vec<u8> {
    KeyWriter::new(TX_NUM).bytes(&tx_hash.0).build()
}

pub fn tx_hash_key(tx_num: TxNum) -> Vec<u8> {
    KeyWriter::new(TX_HASH).u64(tx_num).build()
}

pub fn tx_count_key(height: Height) -> Vec<u8> {
    KeyWriter::new(TX_COUNT).u32(height).build()
}

pub fn header_key(height: Height) -> Vec<u8> {
    KeyWriter::new(HEADER).u32(height).build()
}

pub fn block_hash_key(height: Height) -> Vec<u8> {
    KeyWriter::new(BLOCK_HASH).u32(height).build()
}

pub fn block_txs_key(height: Height) -> Vec<u8> {
    KeyWriter::new(BLOCK_TXS).u32(height).build()
}

pub fn block_txs_value(hashes: &[Hash32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(hashes.len() * 32);
    for h in hashes {
        out.extend_from_slice(&h.0);
    }
    out
}

// ---------------------------------------------------------------------------
// utxo columns

pub fn utxo_key(hashx: &HashX, tx_num: TxNum, nout: u32) -> Vec<u8> {
    KeyWriter::new(UTXO)
        .bytes(&hashx.0)
        .u64(tx_num)
        .u32(nout)
        .build()
}

pub fn amount_value(amount: u64) -> Vec<u8> {
    amount.to_be_bytes().to_vec()
}

pub fn decode_amount(data: &[u8]) -> Result<u64> {
    if data.len() != 8 {
        return Err(IndexerError::Corrupt("bad amount width".into()));
    }
    Ok(BigEndian::read_u64(data))
}

pub fn hashx_utxo_key(tx_hash: &Hash32, tx_num: TxNum, nout: u32) -> Vec<u8> {
    KeyWriter::new(HASHX_UTXO)
        .bytes(&tx_hash.0[..4])
        .u64(tx_num)
        .u32(nout)
        .build()
}

pub fn hashx_history_key(hashx: &HashX, height: Height) -> Vec<u8> {
    KeyWriter::new(HASHX_HISTORY)
        .bytes(&hashx.0)
        .u32(height)
        .build()
}

pub fn hashx_history_value(tx_nums: &[TxNum]) -> Vec<u8> {
    let mut out = Vec::with_capacity(tx_nums.len() * 8);
    for n in tx_nums {
        out.extend_from_slice(&n.to_be_bytes());
    }
    out
}

// ---------------------------------------------------------------------------
// claim columns

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimToTxoValue {
    pub tx_num: TxNum,
    pub position: u32,
    pub root_tx_num: TxNum,
    pub root_position: u32,
    pub amount: u64,
    pub channel_signature_is_valid: bool,
    pub name: String,
}

pub fn claim_to_txo_key(claim_hash: &ClaimHash) -> Vec<u8> {
    KeyWriter::new(CLAIM_TO_TXO).bytes(&claim_hash.0).build()
}

pub fn claim_to_txo_value(v: &ClaimToTxoValue) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&v.tx_num.to_be_bytes());
    out.extend_from_slice(&v.position.to_be_bytes());
    out.extend_from_slice(&v.root_tx_num.to_be_bytes());
    out.extend_from_slice(&v.root_position.to_be_bytes());
    out.extend_from_slice(&v.amount.to_be_bytes());
    out.push(v.channel_signature_is_valid as u8);
    out.extend_from_slice(&(v.name.len() as u16).to_be_bytes());
    out.extend_from_slice(v.name.as_bytes());
    out
}

pub fn decode_claim_to_txo(data: &[u8]) -> Result<ClaimToTxoValue> {
    if data.len() < 33 {
        return Err(IndexerError::Corrupt("short claim_to_txo value".into()));
    }
    let mut pos = 33usize;
    let name = read_name(data, &mut pos)?;
    Ok(ClaimToTxoValue {
        tx_num: BigEndian::read_u64(&data[0..8]),
        position: BigEndian::read_u32(&data[8..12]),
        root_tx_num: BigEndian::read_u64(&data[12..20]),
        root_position: BigEndian::read_u32(&data[20..24]),
        amount: BigEndian::read_u64(&data[24..32]),
        channel_signature_is_valid: data[32] != 0,
        name,
    })
}

pub fn txo_to_claim_key(tx_num: TxNum, position: u32) -> Vec<u8> {
    KeyWriter::new(TXO_TO_CLAIM).u64(tx_num).u32(position).build()
}

pub fn claim_with_name_value(claim_hash: &ClaimHash, normalized_name: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&claim_hash.0);
    out.extend_from_slice(&(normalized_name.len() as u16).to_be_bytes());
    out.extend_from_slice(normalized_name.as_bytes());
    out
}

pub fn decode_claim_with_name(data: &[u8]) -> Result<(ClaimHash, String)> {
    let mut pos = 0usize;
    let claim_hash = read_claim_hash(data, &mut pos)?;
    let name = read_name(data, &mut pos)?;
    Ok((claim_hash, name))
}

pub fn claim_expiration_key(expiration: Height, tx_num: TxNum, position: u32) -> Vec<u8> {
    KeyWriter::new(CLAIM_EXPIRATION)
        .u32(expiration)
        .u64(tx_num)
        .u32(position)
        .build()
}

pub fn claim_expiration_prefix(expiration: Height) -> Vec<u8> {
    KeyWriter::new(CLAIM_EXPIRATION).u32(expiration).build()
}

pub fn decode_claim_expiration_key(key: &[u8]) -> Result<(Height, TxNum, u32)> {
    if key.len() != 1 + 4 + 8 + 4 {
        return Err(IndexerError::Corrupt("bad claim_expiration key".into()));
    }
    Ok((
        BigEndian::read_u32(&key[1..5]),
        BigEndian::read_u64(&key[5..13]),
        BigEndian::read_u32(&key[13..17]),
    ))
}

pub fn claim_short_id_key(
    normalized_name: &str,
    partial_claim_hex: &str,
    root_tx_num: TxNum,
    root_position: u32,
) -> Vec<u8> {
    let mut w = KeyWriter::new(CLAIM_SHORT_ID).name(normalized_name);
    w = w.u8(partial_claim_hex.len() as u8).bytes(partial_claim_hex.as_bytes());
    w.u64(root_tx_num).u32(root_position).build()
}

pub fn txo_value(tx_num: TxNum, position: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&tx_num.to_be_bytes());
    out.extend_from_slice(&position.to_be_bytes());
    out
}

pub fn decode_txo(data: &[u8]) -> Result<(TxNum, u32)> {
    if data.len() != 12 {
        return Err(IndexerError::Corrupt("bad txo value".into()));
    }
    Ok((BigEndian::read_u64(&data[0..8]), BigEndian::read_u32(&data[8..12])))
}

pub fn claim_to_channel_key(claim_hash: &ClaimHash, tx_num: TxNum, position: u32) -> Vec<u8> {
    KeyWriter::new(CLAIM_TO_CHANNEL)
        .bytes(&claim_hash.0)
        .u64(tx_num)
        .u32(position)
        .build()
}

pub fn channel_to_claim_key(
    channel_hash: &ClaimHash,
    normalized_name: &str,
    tx_num: TxNum,
    position: u32,
) -> Vec<u8> {
    KeyWriter::new(CHANNEL_TO_CLAIM)
        .bytes(&channel_hash.0)
        .name(normalized_name)
        .u64(tx_num)
        .u32(position)
        .build()
}

pub fn channel_to_claim_prefix(channel_hash: &ClaimHash) -> Vec<u8> {
    KeyWriter::new(CHANNEL_TO_CLAIM).bytes(&channel_hash.0).build()
}

pub fn claim_hash_value(claim_hash: &ClaimHash) -> Vec<u8> {
    claim_hash.0.to_vec()
}

pub fn decode_claim_hash(data: &[u8]) -> Result<ClaimHash> {
    ClaimHash::from_slice(data).ok_or_else(|| IndexerError::Corrupt("bad claim hash width".into()))
}

pub fn repost_key(claim_hash: &ClaimHash) -> Vec<u8> {
    KeyWriter::new(REPOST).bytes(&claim_hash.0).build()
}

pub fn reposted_claim_key(reposted: &ClaimHash, tx_num: TxNum, position: u32) -> Vec<u8> {
    KeyWriter::new(REPOSTED_CLAIM)
        .bytes(&reposted.0)
        .u64(tx_num)
        .u32(position)
        .build()
}

// ---------------------------------------------------------------------------
// support columns

pub fn support_to_claim_key(tx_num: TxNum, position: u32) -> Vec<u8> {
    KeyWriter::new(SUPPORT_TO_CLAIM).u64(tx_num).u32(position).build()
}

pub fn claim_to_support_key(claim_hash: &ClaimHash, tx_num: TxNum, position: u32) -> Vec<u8> {
    KeyWriter::new(CLAIM_TO_SUPPORT)
        .bytes(&claim_hash.0)
        .u64(tx_num)
        .u32(position)
        .build()
}

pub fn support_amount_key(claim_hash: &ClaimHash) -> Vec<u8> {
    KeyWriter::new(SUPPORT_AMOUNT).bytes(&claim_hash.0).build()
}

// ---------------------------------------------------------------------------
// activation columns

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationValue {
    pub activation_height: Height,
    pub claim_hash: ClaimHash,
    pub normalized_name: String,
}

pub fn activated_key(txo_type: u8, tx_num: TxNum, position: u32) -> Vec<u8> {
    KeyWriter::new(ACTIVATED).u8(txo_type).u64(tx_num).u32(position).build()
}

pub fn activated_value(v: &ActivationValue) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&v.activation_height.to_be_bytes());
    out.extend_from_slice(&v.claim_hash.0);
    out.extend_from_slice(&(v.normalized_name.len() as u16).to_be_bytes());
    out.extend_from_slice(v.normalized_name.as_bytes());
    out
}

pub fn decode_activated(data: &[u8]) -> Result<ActivationValue> {
    if data.len() < 26 {
        return Err(IndexerError::Corrupt("short activated value".into()));
    }
    let mut pos = 4usize;
    let claim_hash = read_claim_hash(data, &mut pos)?;
    let normalized_name = read_name(data, &mut pos)?;
    Ok(ActivationValue {
        activation_height: BigEndian::read_u32(&data[0..4]),
        claim_hash,
        normalized_name,
    })
}

pub fn pending_activation_key(
    height: Height,
    txo_type: u8,
    tx_num: TxNum,
    position: u32,
) -> Vec<u8> {
    KeyWriter::new(PENDING_ACTIVATION)
        .u32(height)
        .u8(txo_type)
        .u64(tx_num)
        .u32(position)
        .build()
}

pub fn pending_activation_prefix(height: Height) -> Vec<u8> {
    KeyWriter::new(PENDING_ACTIVATION).u32(height).build()
}

pub fn decode_pending_activation_key(key: &[u8]) -> Result<(Height, u8, TxNum, u32)> {
    if key.len() != 1 + 4 + 1 + 8 + 4 {
        return Err(IndexerError::Corrupt("bad pending_activation key".into()));
    }
    Ok((
        BigEndian::read_u32(&key[1..5]),
        key[5],
        BigEndian::read_u64(&key[6..14]),
        BigEndian::read_u32(&key[14..18]),
    ))
}

pub fn active_amount_key(
    claim_hash: &ClaimHash,
    txo_type: u8,
    activation_height: Height,
    tx_num: TxNum,
    position: u32,
) -> Vec<u8> {
    KeyWriter::new(ACTIVE_AMOUNT)
        .bytes(&claim_hash.0)
        .u8(txo_type)
        .u32(activation_height)
        .u64(tx_num)
        .u32(position)
        .build()
}

/// Prefix covering all activations of one kind for a claim; entries sort by
/// activation height, so a bounded scan gives "active as of height h".
pub fn active_amount_prefix(claim_hash: &ClaimHash, txo_type: u8) -> Vec<u8> {
    KeyWriter::new(ACTIVE_AMOUNT).bytes(&claim_hash.0).u8(txo_type).build()
}

pub fn active_amount_height_bound(claim_hash: &ClaimHash, txo_type: u8, height: Height) -> Vec<u8> {
    KeyWriter::new(ACTIVE_AMOUNT)
        .bytes(&claim_hash.0)
        .u8(txo_type)
        .u32(height)
        .build()
}

// ---------------------------------------------------------------------------
// resolution columns

pub fn effective_amount_key(
    normalized_name: &str,
    effective_amount: u64,
    tx_num: TxNum,
    position: u32,
) -> Vec<u8> {
    KeyWriter::new(EFFECTIVE_AMOUNT)
        .name(normalized_name)
        .u64(u64::MAX - effective_amount)
        .u64(tx_num)
        .u32(position)
        .build()
}

pub fn effective_amount_prefix(normalized_name: &str) -> Vec<u8> {
    KeyWriter::new(EFFECTIVE_AMOUNT).name(normalized_name).build()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveAmountKey {
    pub effective_amount: u64,
    pub tx_num: TxNum,
    pub position: u32,
}

pub fn decode_effective_amount_key(key: &[u8], name_len: usize) -> Result<EffectiveAmountKey> {
    let fixed = 1 + 2 + name_len;
    if key.len() != fixed + 8 + 8 + 4 {
        return Err(IndexerError::Corrupt("bad effective_amount key".into()));
    }
    Ok(EffectiveAmountKey {
        effective_amount: u64::MAX - BigEndian::read_u64(&key[fixed..fixed + 8]),
        tx_num: BigEndian::read_u64(&key[fixed + 8..fixed + 16]),
        position: BigEndian::read_u32(&key[fixed + 16..fixed + 20]),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TakeoverValue {
    pub claim_hash: ClaimHash,
    pub height: Height,
}

pub fn claim_takeover_key(normalized_name: &str) -> Vec<u8> {
    KeyWriter::new(CLAIM_TAKEOVER).bytes(normalized_name.as_bytes()).build()
}

pub fn claim_takeover_value(v: &TakeoverValue) -> Vec<u8> {
    let mut out = Vec::with_capacity(24);
    out.extend_from_slice(&v.claim_hash.0);
    out.extend_from_slice(&v.height.to_be_bytes());
    out
}

pub fn decode_claim_takeover(data: &[u8]) -> Result<TakeoverValue> {
    if data.len() != 24 {
        return Err(IndexerError::Corrupt("bad claim_takeover value".into()));
    }
    Ok(TakeoverValue {
        claim_hash: ClaimHash::from_slice(&data[0..20]).unwrap(),
        height: BigEndian::read_u32(&data[20..24]),
    })
}

pub fn channel_count_key(channel_hash: &ClaimHash) -> Vec<u8> {
    KeyWriter::new(CHANNEL_COUNT).bytes(&channel_hash.0).build()
}

pub fn count_value(count: u32) -> Vec<u8> {
    count.to_be_bytes().to_vec()
}

pub fn decode_count(data: &[u8]) -> Result<u32> {
    if data.len() != 4 {
        return Err(IndexerError::Corrupt("bad count width".into()));
    }
    Ok(BigEndian::read_u32(data))
}

// ---------------------------------------------------------------------------
// per-block bookkeeping

pub fn touched_or_deleted_key(height: Height) -> Vec<u8> {
    KeyWriter::new(TOUCHED_OR_DELETED).u32(height).build()
}

pub fn touched_or_deleted_value(touched: &[ClaimHash], deleted: &[ClaimHash]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + (touched.len() + deleted.len()) * 20);
    out.extend_from_slice(&(touched.len() as u32).to_be_bytes());
    for h in touched {
        out.extend_from_slice(&h.0);
    }
    out.extend_from_slice(&(deleted.len() as u32).to_be_bytes());
    for h in deleted {
        out.extend_from_slice(&h.0);
    }
    out
}

pub fn decode_touched_or_deleted(data: &[u8]) -> Result<(Vec<ClaimHash>, Vec<ClaimHash>)> {
    let corrupt = || IndexerError::Corrupt("bad touched_or_deleted value".into());
    let mut pos = 0usize;
    let mut read_set = |pos: &mut usize| -> Result<Vec<ClaimHash>> {
        let count_bytes = data.get(*pos..*pos + 4).ok_or_else(corrupt)?;
        let count = BigEndian::read_u32(count_bytes) as usize;
        *pos += 4;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(read_claim_hash(data, pos)?);
        }
        Ok(out)
    };
    let touched = read_set(&mut pos)?;
    let deleted = read_set(&mut pos)?;
    Ok((touched, deleted))
}

pub fn undo_key(height: Height) -> Vec<u8> {
    KeyWriter::new(UNDO).u32(height).build()
}

pub fn decode_height_suffix(key: &[u8]) -> Result<Height> {
    if key.len() != 5 {
        return Err(IndexerError::Corrupt("bad height key".into()));
    }
    Ok(BigEndian::read_u32(&key[1..5]))
}

// ---------------------------------------------------------------------------
// db state

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbState {
    pub db_height: Height,
    pub db_tx_count: u64,
    pub db_tip: Hash32,
    pub first_sync: bool,
    pub wall_time_ms: u64,
    pub last_flush_ms: u64,
    pub hist_flush_count: u32,
    pub utxo_flush_count: u32,
    pub es_sync_height: Height,
}

impl Default for DbState {
    fn default() -> Self {
        DbState {
            db_height: 0,
            db_tx_count: 0,
            db_tip: Hash32::default(),
            first_sync: true,
            wall_time_ms: 0,
            last_flush_ms: 0,
            hist_flush_count: 0,
            utxo_flush_count: 0,
            es_sync_height: 0,
        }
    }
}

pub fn db_state_key() -> Vec<u8> {
    vec![DB_STATE]
}

pub fn db_state_value(s: &DbState) -> Vec<u8> {
    let mut out = Vec::with_capacity(69);
    out.extend_from_slice(&s.db_height.to_be_bytes());
    out.extend_from_slice(&s.db_tx_count.to_be_bytes());
    out.extend_from_slice(&s.db_tip.0);
    out.push(s.first_sync as u8);
    out.extend_from_slice(&s.wall_time_ms.to_be_bytes());
    out.extend_from_slice(&s.last_flush_ms.to_be_bytes());
    out.extend_from_slice(&s.hist_flush_count.to_be_bytes());
    out.extend_from_slice(&s.utxo_flush_count.to_be_bytes());
    out.extend_from_slice(&s.es_sync_height.to_be_bytes());
    out
}

pub fn decode_db_state(data: &[u8]) -> Result<DbState> {
    if data.len() != 73 {
        return Err(IndexerError::Corrupt("bad db_state width".into()));
    }
    Ok(DbState {
        db_height: BigEndian::read_u32(&data[0..4]),
        db_tx_count: BigEndian::read_u64(&data[4..12]),
        db_tip: Hash32::from_slice(&data[12..44]).unwrap(),
        first_sync: data[44] != 0,
        wall_time_ms: BigEndian::read_u64(&data[45..53]),
        last_flush_ms: BigEndian::read_u64(&data[53..61]),
        hist_flush_count: BigEndian::read_u32(&data[61..65]),
        utxo_flush_count: BigEndian::read_u32(&data[65..69]),
        es_sync_height: BigEndian::read_u32(&data[69..73]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_amount_orders_descending() {
        let low = effective_amount_key("name", 100, 1, 0);
        let high = effective_amount_key("name", 500, 1, 0);
        assert!(high < low, "larger amounts must sort first");
        let key = effective_amount_key("name", 12345, 7, 2);
        let decoded = decode_effective_amount_key(&key, "name".len()).unwrap();
        assert_eq!(decoded.effective_amount, 12345);
        assert_eq!(decoded.tx_num, 7);
        assert_eq!(decoded.position, 2);
    }

    #[test]
    fn claim_to_txo_round_trip() {
        let v = ClaimToTxoValue {
            tx_num: 42,
            position: 1,
            root_tx_num: 40,
            root_position: 0,
            amount: 1_000_000,
            channel_signature_is_valid: true,
            name: "Example".to_string(),
        };
        assert_eq!(decode_claim_to_txo(&claim_to_txo_value(&v)).unwrap(), v);
    }

    #[test]
    fn activation_values_round_trip() {
        let v = ActivationValue {
            activation_height: 77,
            claim_hash: ClaimHash([5u8; 20]),
            normalized_name: "x".into(),
        };
        assert_eq!(decode_activated(&activated_value(&v)).unwrap(), v);

        let key = pending_activation_key(77, CLAIM_TXO_TYPE, 9, 3);
        assert_eq!(
            decode_pending_activation_key(&key).unwrap(),
            (77, CLAIM_TXO_TYPE, 9, 3)
        );
        assert!(key.starts_with(&pending_activation_prefix(77)));
    }

    #[test]
    fn active_amount_keys_sort_by_activation_height() {
        let claim = ClaimHash([1u8; 20]);
        let early = active_amount_key(&claim, CLAIM_TXO_TYPE, 5, 1, 0);
        let late = active_amount_key(&claim, CLAIM_TXO_TYPE, 50, 1, 0);
        let bound = active_amount_height_bound(&claim, CLAIM_TXO_TYPE, 10);
        assert!(early < bound && bound < late);
    }

    #[test]
    fn touched_or_deleted_round_trip() {
        let touched = vec![ClaimHash([1u8; 20]), ClaimHash([2u8; 20])];
        let deleted = vec![ClaimHash([3u8; 20])];
        let encoded = touched_or_deleted_value(&touched, &deleted);
        let (t, d) = decode_touched_or_deleted(&encoded).unwrap();
        assert_eq!(t, touched);
        assert_eq!(d, deleted);
    }

    #[test]
    fn db_state_round_trip() {
        let state = DbState {
            db_height: 9,
            db_tx_count: 100,
            db_tip: Hash32([6u8; 32]),
            first_sync: false,
            wall_time_ms: 5,
            last_flush_ms: 6,
            hist_flush_count: 7,
            utxo_flush_count: 8,
            es_sync_height: 9,
        };
        assert_eq!(decode_db_state(&db_state_value(&state)).unwrap(), state);
    }

    #[test]
    fn takeover_round_trip() {
        let v = TakeoverValue {
            claim_hash: ClaimHash([9u8; 20]),
            height: 123,
        };
        assert_eq!(decode_claim_takeover(&claim_takeover_value(&v)).unwrap(), v);
    }
}
