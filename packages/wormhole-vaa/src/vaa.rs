use nom::bytes::complete::take;
use nom::combinator::{map_res, rest};
use nom::multi::count;
use nom::number::complete::{be_u16, be_u32, be_u64, be_u8};
use nom::sequence::tuple;
use nom::IResult;
use sha3::{Digest, Keccak256};

use crate::{Address, Chain, Error};

pub const SIGNATURE_LEN: usize = 65;

const SUPPORTED_VERSION: u8 = 1;

/// Guardian signature prefixed with the guardian's position in the guardian set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub index: u8,
    pub signature: [u8; SIGNATURE_LEN],
}

/// A signed VAA. `hash` is the keccak256 digest of the body (everything after the
/// signatures), which is what destination bridges use to track completed transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vaa {
    pub version: u8,
    pub guardian_set_index: u32,
    pub signatures: Vec<Signature>,
    pub timestamp: u32,
    pub nonce: u32,
    pub emitter_chain: Chain,
    pub emitter_address: Address,
    pub sequence: u64,
    pub consistency_level: u8,
    pub payload: Vec<u8>,
    pub hash: [u8; 32],
}

pub(crate) fn fixed<const N: usize>(input: &[u8]) -> IResult<&[u8], [u8; N]> {
    map_res(take(N), <[u8; N]>::try_from)(input)
}

pub(crate) fn chain(input: &[u8]) -> IResult<&[u8], Chain> {
    let (input, id) = be_u16(input)?;
    Ok((input, Chain::from(id)))
}

pub(crate) fn address(input: &[u8]) -> IResult<&[u8], Address> {
    let (input, bytes) = fixed::<32>(input)?;
    Ok((input, Address(bytes)))
}

fn signature(input: &[u8]) -> IResult<&[u8], Signature> {
    let (input, (index, signature)) = tuple((be_u8, fixed::<SIGNATURE_LEN>))(input)?;
    Ok((input, Signature { index, signature }))
}

struct Header {
    version: u8,
    guardian_set_index: u32,
    signatures: Vec<Signature>,
}

fn header(input: &[u8]) -> IResult<&[u8], Header> {
    let (input, (version, guardian_set_index, sig_count)) =
        tuple((be_u8, be_u32, be_u8))(input)?;
    let (input, signatures) = count(signature, usize::from(sig_count))(input)?;

    Ok((
        input,
        Header {
            version,
            guardian_set_index,
            signatures,
        },
    ))
}

struct Body<'a> {
    timestamp: u32,
    nonce: u32,
    emitter_chain: Chain,
    emitter_address: Address,
    sequence: u64,
    consistency_level: u8,
    payload: &'a [u8],
}

fn body(input: &[u8]) -> IResult<&[u8], Body<'_>> {
    let (input, (timestamp, nonce, emitter_chain, emitter_address)) =
        tuple((be_u32, be_u32, chain, address))(input)?;
    let (input, (sequence, consistency_level, payload)) = tuple((be_u64, be_u8, rest))(input)?;

    Ok((
        input,
        Body {
            timestamp,
            nonce,
            emitter_chain,
            emitter_address,
            sequence,
            consistency_level,
            payload,
        },
    ))
}

impl Vaa {
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let (body_bytes, header) = header(bytes)
            .map_err(|_| Error::MalformedEnvelope("truncated header or signatures".into()))?;

        if header.version != SUPPORTED_VERSION {
            return Err(Error::MalformedEnvelope(format!(
                "unsupported version {}",
                header.version
            )));
        }

        if header.signatures.is_empty() {
            return Err(Error::MalformedEnvelope("no guardian signatures".into()));
        }

        let (_, fields) =
            body(body_bytes).map_err(|_| Error::MalformedEnvelope("truncated body".into()))?;

        Ok(Vaa {
            version: header.version,
            guardian_set_index: header.guardian_set_index,
            signatures: header.signatures,
            timestamp: fields.timestamp,
            nonce: fields.nonce,
            emitter_chain: fields.emitter_chain,
            emitter_address: fields.emitter_address,
            sequence: fields.sequence,
            consistency_level: fields.consistency_level,
            payload: fields.payload.to_vec(),
            hash: Keccak256::digest(body_bytes).into(),
        })
    }

    /// Re-encodes the envelope in wire format.
    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(
            self.signatures
                .len()
                .saturating_mul(SIGNATURE_LEN.saturating_add(1))
                .saturating_add(self.payload.len())
                .saturating_add(57),
        );
        bytes.push(self.version);
        bytes.extend_from_slice(&self.guardian_set_index.to_be_bytes());
        bytes.push(u8::try_from(self.signatures.len()).unwrap_or(u8::MAX));
        for sig in self.signatures.iter().take(usize::from(u8::MAX)) {
            bytes.push(sig.index);
            bytes.extend_from_slice(&sig.signature);
        }
        bytes.extend_from_slice(&self.body());

        bytes
    }

    pub fn body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.payload.len().saturating_add(51));
        body.extend_from_slice(&self.timestamp.to_be_bytes());
        body.extend_from_slice(&self.nonce.to_be_bytes());
        body.extend_from_slice(&self.emitter_chain.id().to_be_bytes());
        body.extend_from_slice(self.emitter_address.as_bytes());
        body.extend_from_slice(&self.sequence.to_be_bytes());
        body.push(self.consistency_level);
        body.extend_from_slice(&self.payload);

        body
    }

    pub fn hash_hex(&self) -> String {
        format!("0x{}", hex::encode(self.hash))
    }

    /// keccak256 of `hash`. EVM token bridges record completed transfers under this digest.
    pub fn digest(&self) -> [u8; 32] {
        Keccak256::digest(self.hash).into()
    }
}
