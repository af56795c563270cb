/// Claim script classification and signature checks.
///
/// Claim operations ride in front of an ordinary payment script:
///
///   OP_CLAIM_NAME    <name> <payload>                OP_2DROP OP_DROP  <pay>
///   OP_UPDATE_CLAIM  <name> <claim_hash> <payload>   OP_2DROP OP_2DROP <pay>
///   OP_SUPPORT_CLAIM <name> <claim_hash>             OP_2DROP OP_DROP  <pay>
///   OP_SUPPORT_CLAIM <name> <claim_hash> <payload>   OP_2DROP OP_2DROP <pay>
///
/// The address identity of an output (its hashX) is derived from the pay
/// portion only, so claim outputs share history with their paying address.

use ripemd160::Ripemd160;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1};
use sha2::{Digest, Sha256};

use crate::block::TxInput;
use crate::types::{ClaimHash, Hash32, HashX, HASHX_LEN};

pub const OP_CLAIM_NAME: u8 = 0xb5;
pub const OP_SUPPORT_CLAIM: u8 = 0xb6;
pub const OP_UPDATE_CLAIM: u8 = 0xb7;
const OP_2DROP: u8 = 0x6d;
const OP_DROP: u8 = 0x75;
const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOp {
    Name,
    Update,
    Support,
}

/// A parsed claim prefix, with the offset of the trailing pay script.
#[derive(Debug, Clone)]
pub struct ClaimScript {
    pub op: ClaimOp,
    pub name: Vec<u8>,
    pub claim_hash: Option<ClaimHash>,
    pub payload: Option<Vec<u8>>,
    address_offset: usize,
}

fn read_push(script: &[u8], pos: &mut usize) -> Option<Vec<u8>> {
    let opcode = *script.get(*pos)?;
    *pos += 1;
    let len = match opcode {
        1..=75 => opcode as usize,
        OP_PUSHDATA1 => {
            let n = *script.get(*pos)? as usize;
            *pos += 1;
            n
        }
        OP_PUSHDATA2 => {
            let bytes: [u8; 2] = script.get(*pos..*pos + 2)?.try_into().ok()?;
            *pos += 2;
            u16::from_le_bytes(bytes) as usize
        }
        OP_PUSHDATA4 => {
            let bytes: [u8; 4] = script.get(*pos..*pos + 4)?.try_into().ok()?;
            *pos += 4;
            u32::from_le_bytes(bytes) as usize
        }
        _ => return None,
    };
    let data = script.get(*pos..*pos + len)?.to_vec();
    *pos += len;
    Some(data)
}

fn expect_op(script: &[u8], pos: &mut usize, op: u8) -> Option<()> {
    if *script.get(*pos)? == op {
        *pos += 1;
        Some(())
    } else {
        None
    }
}

impl ClaimScript {
    /// Classify an output script. Returns None for plain pay scripts and for
    /// anything that does not parse as a well-formed claim prefix.
    pub fn parse(script: &[u8]) -> Option<ClaimScript> {
        let mut pos = 0usize;
        let op = match *script.first()? {
            OP_CLAIM_NAME => ClaimOp::Name,
            OP_UPDATE_CLAIM => ClaimOp::Update,
            OP_SUPPORT_CLAIM => ClaimOp::Support,
            _ => return None,
        };
        pos += 1;
        let name = read_push(script, &mut pos)?;
        if name.is_empty() {
            return None;
        }
        match op {
            ClaimOp::Name => {
                let payload = read_push(script, &mut pos)?;
                expect_op(script, &mut pos, OP_2DROP)?;
                expect_op(script, &mut pos, OP_DROP)?;
                Some(ClaimScript {
                    op,
                    name,
                    claim_hash: None,
                    payload: Some(payload),
                    address_offset: pos,
                })
            }
            ClaimOp::Update => {
                let claim_hash = ClaimHash::from_slice(&read_push(script, &mut pos)?)?;
                let payload = read_push(script, &mut pos)?;
                expect_op(script, &mut pos, OP_2DROP)?;
                expect_op(script, &mut pos, OP_2DROP)?;
                Some(ClaimScript {
                    op,
                    name,
                    claim_hash: Some(claim_hash),
                    payload: Some(payload),
                    address_offset: pos,
                })
            }
            ClaimOp::Support => {
                let claim_hash = ClaimHash::from_slice(&read_push(script, &mut pos)?)?;
                // Support may carry an optional data push.
                let mut probe = pos;
                if expect_op(script, &mut probe, OP_2DROP).is_some()
                    && expect_op(script, &mut probe, OP_DROP).is_some()
                {
                    return Some(ClaimScript {
                        op,
                        name,
                        claim_hash: Some(claim_hash),
                        payload: None,
                        address_offset: probe,
                    });
                }
                let payload = read_push(script, &mut pos)?;
                expect_op(script, &mut pos, OP_2DROP)?;
                expect_op(script, &mut pos, OP_2DROP)?;
                Some(ClaimScript {
                    op,
                    name,
                    claim_hash: Some(claim_hash),
                    payload: Some(payload),
                    address_offset: pos,
                })
            }
        }
    }

    /// The pay portion of the script the claim prefix rides on.
    pub fn address_script<'a>(&self, script: &'a [u8]) -> &'a [u8] {
        &script[self.address_offset..]
    }
}

/// Claim payload envelope.
///
/// flags byte: bit0 = channel (33-byte public key follows, length-prefixed),
/// bit1 = repost (20-byte reposted claim hash), bit2 = signed (20-byte
/// signing channel hash + 64-byte compact signature).
#[derive(Debug, Clone, Default)]
pub struct ClaimPayload {
    pub is_channel: bool,
    pub channel_public_key: Option<Vec<u8>>,
    pub is_repost: bool,
    pub reposted_claim_hash: Option<ClaimHash>,
    pub signing_channel_hash: Option<ClaimHash>,
    pub signature: Option<[u8; 64]>,
}

const FLAG_CHANNEL: u8 = 0x01;
const FLAG_REPOST: u8 = 0x02;
const FLAG_SIGNED: u8 = 0x04;

impl ClaimPayload {
    /// Decode a payload. Malformed payloads decode to the empty payload, the
    /// same way the upstream indexer treats undecodable claim metadata.
    pub fn parse(raw: &[u8]) -> ClaimPayload {
        Self::try_parse(raw).unwrap_or_default()
    }

    fn try_parse(raw: &[u8]) -> Option<ClaimPayload> {
        let mut payload = ClaimPayload::default();
        let flags = *raw.first()?;
        let mut pos = 1usize;
        if flags & FLAG_CHANNEL != 0 {
            let len = *raw.get(pos)? as usize;
            pos += 1;
            payload.channel_public_key = Some(raw.get(pos..pos + len)?.to_vec());
            pos += len;
            payload.is_channel = true;
        }
        if flags & FLAG_REPOST != 0 {
            payload.reposted_claim_hash = ClaimHash::from_slice(raw.get(pos..pos + 20)?);
            pos += 20;
            payload.is_repost = true;
        }
        if flags & FLAG_SIGNED != 0 {
            payload.signing_channel_hash = ClaimHash::from_slice(raw.get(pos..pos + 20)?);
            pos += 20;
            let sig: [u8; 64] = raw.get(pos..pos + 64)?.try_into().ok()?;
            pos += 64;
            payload.signature = Some(sig);
        }
        if pos != raw.len() {
            return None;
        }
        Some(payload)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8];
        if let Some(ref pk) = self.channel_public_key {
            out[0] |= FLAG_CHANNEL;
            out.push(pk.len() as u8);
            out.extend_from_slice(pk);
        }
        if let Some(ref reposted) = self.reposted_claim_hash {
            out[0] |= FLAG_REPOST;
            out.extend_from_slice(&reposted.0);
        }
        if let (Some(ref channel), Some(ref sig)) = (&self.signing_channel_hash, &self.signature) {
            out[0] |= FLAG_SIGNED;
            out.extend_from_slice(&channel.0);
            out.extend_from_slice(sig);
        }
        out
    }

    /// The payload bytes covered by the channel signature: everything except
    /// the signature itself.
    pub fn signed_body(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        unsigned.signing_channel_hash = None;
        unsigned.encode()
    }
}

/// hashX of an output script: sha256 over the address portion, truncated.
pub fn hashx_from_script(pk_script: &[u8]) -> Option<HashX> {
    if pk_script.first() == Some(&0x6a) {
        // OP_RETURN outputs are unspendable and carry no address history.
        return None;
    }
    let address = match ClaimScript::parse(pk_script) {
        Some(claim) => claim.address_script(pk_script),
        None => pk_script,
    };
    let digest = Sha256::digest(address);
    HashX::from_slice(&digest[..HASHX_LEN])
}

/// hash160: ripemd160 over sha256.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let ripe = Ripemd160::digest(&sha);
    ripe.into()
}

/// ClaimHash for a fresh name claim: hash160 of the funding outpoint,
/// reversed.
pub fn claim_hash_for_new(tx_hash: &Hash32, nout: u32) -> ClaimHash {
    let mut preimage = Vec::with_capacity(36);
    preimage.extend_from_slice(&tx_hash.0);
    preimage.extend_from_slice(&nout.to_be_bytes());
    let mut digest = hash160(&preimage);
    digest.reverse();
    ClaimHash(digest)
}

/// Digest a signed claim commits to. Built from the spending transaction's
/// first input outpoint (known before the signature is embedded), the
/// signing channel, the claim name and the unsigned payload body.
pub fn signature_digest(
    first_input: &TxInput,
    signing_channel_hash: &ClaimHash,
    name: &[u8],
    signed_body: &[u8],
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(first_input.prev_hash.0);
    hasher.update(first_input.prev_idx.to_be_bytes());
    hasher.update(signing_channel_hash.0);
    hasher.update(name);
    hasher.update(signed_body);
    hasher.finalize().into()
}

/// Verify a compact ECDSA channel signature over a digest.
pub fn is_signature_valid(signature: &[u8; 64], digest: &[u8; 32], public_key: &[u8]) -> bool {
    let secp = Secp256k1::verification_only();
    let (Ok(msg), Ok(sig), Ok(pk)) = (
        Message::from_slice(digest),
        Signature::from_compact(signature),
        PublicKey::from_slice(public_key),
    ) else {
        return false;
    };
    secp.verify_ecdsa(&msg, &sig, &pk).is_ok()
}

/// Script builders used by tests throughout the crate.
#[cfg(test)]
pub mod build {
    use super::*;
    use secp256k1::SecretKey;

    pub fn push(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        match data.len() {
            0..=75 => out.push(data.len() as u8),
            76..=255 => {
                out.push(OP_PUSHDATA1);
                out.push(data.len() as u8);
            }
            _ => {
                out.push(OP_PUSHDATA2);
                out.extend_from_slice(&(data.len() as u16).to_le_bytes());
            }
        }
        out.extend_from_slice(data);
        out
    }

    pub fn pay_script(seed: u8) -> Vec<u8> {
        // A dummy p2pkh-shaped pay script; only its bytes matter for hashX.
        let mut script = vec![0x76, 0xa9, 20];
        script.extend_from_slice(&[seed; 20]);
        script.extend_from_slice(&[0x88, 0xac]);
        script
    }

    pub fn claim_name_script(name: &[u8], payload: &[u8], pay: &[u8]) -> Vec<u8> {
        let mut script = vec![OP_CLAIM_NAME];
        script.extend(push(name));
        script.extend(push(payload));
        script.push(OP_2DROP);
        script.push(OP_DROP);
        script.extend_from_slice(pay);
        script
    }

    pub fn claim_update_script(
        name: &[u8],
        claim_hash: &ClaimHash,
        payload: &[u8],
        pay: &[u8],
    ) -> Vec<u8> {
        let mut script = vec![OP_UPDATE_CLAIM];
        script.extend(push(name));
        script.extend(push(&claim_hash.0));
        script.extend(push(payload));
        script.push(OP_2DROP);
        script.push(OP_2DROP);
        script.extend_from_slice(pay);
        script
    }

    pub fn support_script(name: &[u8], claim_hash: &ClaimHash, pay: &[u8]) -> Vec<u8> {
        let mut script = vec![OP_SUPPORT_CLAIM];
        script.extend(push(name));
        script.extend(push(&claim_hash.0));
        script.push(OP_2DROP);
        script.push(OP_DROP);
        script.extend_from_slice(pay);
        script
    }

    pub fn channel_keypair(seed: u8) -> (SecretKey, Vec<u8>) {
        let secp = Secp256k1::new();
        let mut sk_bytes = [seed; 32];
        sk_bytes[31] = 1;
        let sk = SecretKey::from_slice(&sk_bytes).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk);
        (sk, pk.serialize().to_vec())
    }

    pub fn sign_payload(
        payload: &mut ClaimPayload,
        first_input: &TxInput,
        name: &[u8],
        signing_channel_hash: ClaimHash,
        secret: &SecretKey,
    ) {
        let secp = Secp256k1::new();
        let digest = signature_digest(
            first_input,
            &signing_channel_hash,
            name,
            &payload.signed_body(),
        );
        let msg = Message::from_slice(&digest).unwrap();
        let sig = secp.sign_ecdsa(&msg, secret).serialize_compact();
        payload.signing_channel_hash = Some(signing_channel_hash);
        payload.signature = Some(sig);
    }
}

#[cfg(test)]
mod tests {
    use super::build::*;
    use super::*;

    #[test]
    fn plain_pay_script_is_not_a_claim() {
        assert!(ClaimScript::parse(&pay_script(1)).is_none());
    }

    #[test]
    fn claim_name_script_parses() {
        let pay = pay_script(3);
        let script = claim_name_script(b"hello", &[0u8], &pay);
        let claim = ClaimScript::parse(&script).unwrap();
        assert_eq!(claim.op, ClaimOp::Name);
        assert_eq!(claim.name, b"hello");
        assert!(claim.claim_hash.is_none());
        assert_eq!(claim.address_script(&script), pay.as_slice());
    }

    #[test]
    fn update_and_support_scripts_parse() {
        let hash = ClaimHash([9u8; 20]);
        let pay = pay_script(4);
        let update = claim_update_script(b"x", &hash, &[0u8], &pay);
        let parsed = ClaimScript::parse(&update).unwrap();
        assert_eq!(parsed.op, ClaimOp::Update);
        assert_eq!(parsed.claim_hash, Some(hash));

        let support = support_script(b"x", &hash, &pay);
        let parsed = ClaimScript::parse(&support).unwrap();
        assert_eq!(parsed.op, ClaimOp::Support);
        assert!(parsed.payload.is_none());
        assert_eq!(parsed.address_script(&support), pay.as_slice());
    }

    #[test]
    fn hashx_ignores_claim_prefix() {
        let pay = pay_script(7);
        let script = claim_name_script(b"name", &[0u8], &pay);
        assert_eq!(hashx_from_script(&script), hashx_from_script(&pay));
        assert!(hashx_from_script(&[0x6a, 1, 0]).is_none());
    }

    #[test]
    fn payload_round_trip_and_garbage_tolerance() {
        let (_, pk) = channel_keypair(5);
        let payload = ClaimPayload {
            is_channel: true,
            channel_public_key: Some(pk),
            ..Default::default()
        };
        let parsed = ClaimPayload::parse(&payload.encode());
        assert!(parsed.is_channel);
        assert!(parsed.channel_public_key.is_some());

        let garbage = ClaimPayload::parse(&[0xff, 1, 2]);
        assert!(!garbage.is_channel && !garbage.is_repost);
        assert!(garbage.signature.is_none());
    }

    #[test]
    fn signature_verifies_and_rejects_tampering() {
        let (sk, pk) = channel_keypair(2);
        let channel = ClaimHash([1u8; 20]);
        let first_input = TxInput {
            prev_hash: Hash32([8u8; 32]),
            prev_idx: 0,
            script_sig: vec![],
            sequence: 0,
        };
        let mut payload = ClaimPayload::default();
        sign_payload(&mut payload, &first_input, b"stream", channel, &sk);
        let digest = signature_digest(&first_input, &channel, b"stream", &payload.signed_body());
        assert!(is_signature_valid(
            payload.signature.as_ref().unwrap(),
            &digest,
            &pk
        ));
        let wrong = signature_digest(&first_input, &channel, b"other", &payload.signed_body());
        assert!(!is_signature_valid(
            payload.signature.as_ref().unwrap(),
            &wrong,
            &pk
        ));
    }

    #[test]
    fn new_claim_hash_depends_on_outpoint() {
        let tx_hash = Hash32([3u8; 32]);
        assert_ne!(
            claim_hash_for_new(&tx_hash, 0),
            claim_hash_for_new(&tx_hash, 1)
        );
    }
}
