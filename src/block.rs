/// Raw block and transaction deserialization.
///
/// Blocks arrive from the daemon as raw bytes: a 112-byte header followed by
/// a compact-size transaction count and the serialized transactions. The
/// processor needs each transaction's canonical hash and its raw bytes, so
/// the parser records per-transaction byte ranges.

use crate::coin::{double_sha256, HEADER_SIZE};
use crate::error::{IndexerError, Result};
use crate::types::Hash32;

#[derive(Debug, Clone)]
pub struct TxInput {
    pub prev_hash: Hash32,
    pub prev_idx: u32,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxInput {
    /// Coinbase-generation inputs spend nothing.
    pub fn is_generation(&self) -> bool {
        self.prev_idx == u32::MAX && self.prev_hash.0 == [0u8; 32]
    }
}

#[derive(Debug, Clone)]
pub struct TxOutput {
    pub value: u64,
    pub pk_script: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Tx {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub locktime: u32,
    pub raw: Vec<u8>,
}

/// A parsed block ready for `advance_block`.
#[derive(Debug, Clone)]
pub struct Block {
    pub height: u32,
    pub header: [u8; HEADER_SIZE],
    /// Transactions paired with their canonical (double-sha256) hashes.
    pub transactions: Vec<(Tx, Hash32)>,
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(IndexerError::chain("truncated block data"));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16_le(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32_le(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64_le(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn compact_size(&mut self) -> Result<u64> {
        match self.u8()? {
            0xfd => Ok(self.u16_le()? as u64),
            0xfe => Ok(self.u32_le()? as u64),
            0xff => self.u64_le(),
            n => Ok(n as u64),
        }
    }

    fn var_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.compact_size()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

fn read_tx(r: &mut Reader<'_>) -> Result<Tx> {
    let start = r.pos;
    let version = r.u32_le()?;
    let n_in = r.compact_size()?;
    let mut inputs = Vec::with_capacity(n_in as usize);
    for _ in 0..n_in {
        let prev_hash = Hash32::from_slice(r.take(32)?)
            .ok_or_else(|| IndexerError::chain("bad prevout hash"))?;
        let prev_idx = r.u32_le()?;
        let script_sig = r.var_bytes()?;
        let sequence = r.u32_le()?;
        inputs.push(TxInput {
            prev_hash,
            prev_idx,
            script_sig,
            sequence,
        });
    }
    let n_out = r.compact_size()?;
    let mut outputs = Vec::with_capacity(n_out as usize);
    for _ in 0..n_out {
        let value = r.u64_le()?;
        let pk_script = r.var_bytes()?;
        outputs.push(TxOutput { value, pk_script });
    }
    let locktime = r.u32_le()?;
    let raw = r.data[start..r.pos].to_vec();
    Ok(Tx {
        version,
        inputs,
        outputs,
        locktime,
        raw,
    })
}

impl Block {
    pub fn parse(raw: &[u8], height: u32) -> Result<Block> {
        let mut r = Reader::new(raw);
        let header: [u8; HEADER_SIZE] = r
            .take(HEADER_SIZE)?
            .try_into()
            .map_err(|_| IndexerError::chain("short header"))?;
        let tx_count = r.compact_size()?;
        let mut transactions = Vec::with_capacity(tx_count as usize);
        for _ in 0..tx_count {
            let tx = read_tx(&mut r)?;
            let hash = Hash32(double_sha256(&tx.raw));
            transactions.push((tx, hash));
        }
        if r.pos != raw.len() {
            return Err(IndexerError::chain(format!(
                "trailing bytes after block at height {height}"
            )));
        }
        Ok(Block {
            height,
            header,
            transactions,
        })
    }
}

/// Parse a standalone raw transaction (mempool path).
pub fn parse_tx(raw: &[u8]) -> Result<Tx> {
    let mut r = Reader::new(raw);
    let tx = read_tx(&mut r)?;
    if r.pos != raw.len() {
        return Err(IndexerError::chain("trailing bytes after transaction"));
    }
    Ok(tx)
}

/// Serialize a transaction; the inverse of `read_tx`.
pub fn serialize_tx(tx: &Tx) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&tx.version.to_le_bytes());
    write_compact_size(&mut out, tx.inputs.len() as u64);
    for txin in &tx.inputs {
        out.extend_from_slice(&txin.prev_hash.0);
        out.extend_from_slice(&txin.prev_idx.to_le_bytes());
        write_compact_size(&mut out, txin.script_sig.len() as u64);
        out.extend_from_slice(&txin.script_sig);
        out.extend_from_slice(&txin.sequence.to_le_bytes());
    }
    write_compact_size(&mut out, tx.outputs.len() as u64);
    for txout in &tx.outputs {
        out.extend_from_slice(&txout.value.to_le_bytes());
        write_compact_size(&mut out, txout.pk_script.len() as u64);
        out.extend_from_slice(&txout.pk_script);
    }
    out.extend_from_slice(&tx.locktime.to_le_bytes());
    out
}

pub fn write_compact_size(out: &mut Vec<u8>, n: u64) {
    if n < 0xfd {
        out.push(n as u8);
    } else if n <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&n.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Tx {
        Tx {
            version: 1,
            inputs: vec![TxInput {
                prev_hash: Hash32([7u8; 32]),
                prev_idx: 2,
                script_sig: vec![0x51],
                sequence: 0xffff_ffff,
            }],
            outputs: vec![TxOutput {
                value: 5000,
                pk_script: vec![0x76, 0xa9, 0x14],
            }],
            locktime: 0,
            raw: Vec::new(),
        }
    }

    #[test]
    fn tx_serialization_round_trips() {
        let tx = sample_tx();
        let raw = serialize_tx(&tx);
        let mut r = Reader::new(&raw);
        let parsed = read_tx(&mut r).unwrap();
        assert_eq!(parsed.version, tx.version);
        assert_eq!(parsed.inputs.len(), 1);
        assert_eq!(parsed.inputs[0].prev_idx, 2);
        assert_eq!(parsed.outputs[0].value, 5000);
        assert_eq!(parsed.raw, raw);
    }

    #[test]
    fn block_parse_rejects_trailing_garbage() {
        let tx = sample_tx();
        let mut raw = vec![0u8; HEADER_SIZE];
        raw.push(1);
        raw.extend_from_slice(&serialize_tx(&tx));
        assert!(Block::parse(&raw, 1).is_ok());
        raw.push(0);
        assert!(Block::parse(&raw, 1).is_err());
    }

    #[test]
    fn generation_input_detected() {
        let coinbase = TxInput {
            prev_hash: Hash32([0u8; 32]),
            prev_idx: u32::MAX,
            script_sig: vec![],
            sequence: 0,
        };
        assert!(coinbase.is_generation());
        assert!(!sample_tx().inputs[0].is_generation());
    }

    #[test]
    fn compact_size_boundaries() {
        for n in [0u64, 0xfc, 0xfd, 0xffff, 0x10000, u32::MAX as u64 + 1] {
            let mut buf = Vec::new();
            write_compact_size(&mut buf, n);
            let mut r = Reader::new(&buf);
            assert_eq!(r.compact_size().unwrap(), n);
        }
    }
}
