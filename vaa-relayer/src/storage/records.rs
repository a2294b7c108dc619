use std::fmt::{self, Display, Formatter};

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use wormhole_vaa::{Address, Chain, Payload, Vaa, U256};

/// Business identity of an attestation. Unique per emitter, independent of the signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VaaKey {
    pub sequence: u64,
    pub emitter_chain: Chain,
    pub emitter_address: Address,
}

impl Display for VaaKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.emitter_chain.id(),
            self.emitter_address,
            self.sequence
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianSignature {
    pub index: u8,
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
}

/// Persisted projection of an observed VAA. The original envelope is kept as `hex_string`
/// so the record can be replayed to a destination chain.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaaRecord {
    pub version: u8,
    pub timestamp: u32,
    pub nonce: u32,
    pub emitter_chain_id: Chain,
    pub emitter_address: Address,
    #[serde_as(as = "DisplayFromStr")]
    pub sequence: u64,
    pub consistency_level: u8,
    #[serde(with = "hex::serde")]
    pub payload: Vec<u8>,
    pub guardian_set_index: u32,
    pub signatures: Vec<GuardianSignature>,
    pub hash: String,
    pub to_chain: Option<Chain>,
    pub to: Option<Address>,
    pub hex_string: String,
    /// unix seconds of the first successful redemption by this relayer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redeemed_at: Option<u64>,
}

impl VaaRecord {
    pub fn from_signed_vaa(bytes: &[u8]) -> Result<Self, wormhole_vaa::Error> {
        let vaa = Vaa::parse(bytes)?;
        let payload = Payload::decode(&vaa.payload);

        Ok(VaaRecord {
            version: vaa.version,
            timestamp: vaa.timestamp,
            nonce: vaa.nonce,
            emitter_chain_id: vaa.emitter_chain,
            emitter_address: vaa.emitter_address,
            sequence: vaa.sequence,
            consistency_level: vaa.consistency_level,
            hash: vaa.hash_hex(),
            guardian_set_index: vaa.guardian_set_index,
            signatures: vaa
                .signatures
                .iter()
                .map(|sig| GuardianSignature {
                    index: sig.index,
                    signature: sig.signature.to_vec(),
                })
                .collect(),
            to_chain: payload.to_chain(),
            to: payload.to(),
            payload: vaa.payload,
            hex_string: hex::encode(bytes),
            redeemed_at: None,
        })
    }

    pub fn key(&self) -> VaaKey {
        VaaKey {
            sequence: self.sequence,
            emitter_chain: self.emitter_chain_id,
            emitter_address: self.emitter_address,
        }
    }

    pub fn signed_vaa(&self) -> Result<Vec<u8>, hex::FromHexError> {
        hex::decode(self.hex_string.trim_start_matches("0x"))
    }
}

/// Gas observation for one redemption on a destination chain. Estimates come from the
/// omniswap payload, actual values from the transaction receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DstGasRecord {
    pub chain_id: Chain,
    pub vaa_length: u64,
    pub dst_swap_length: u64,
    pub estimate_gas: U256,
    pub estimate_gas_price: U256,
    pub actual_gas: U256,
    pub actual_gas_price: U256,
}

impl DstGasRecord {
    pub fn has_estimates(&self) -> bool {
        !self.estimate_gas.is_zero() && !self.estimate_gas_price.is_zero()
    }
}

/// Mean of every gas observation for a `(chain, dst_swap_length)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasStats {
    pub count: usize,
    pub avg_vaa_length: BigUint,
    pub avg_estimate_gas: BigUint,
    pub avg_estimate_gas_price: BigUint,
    pub avg_actual_gas: BigUint,
    pub avg_actual_gas_price: BigUint,
}

fn to_biguint(value: U256) -> BigUint {
    let mut bytes = [0u8; 32];
    value.to_big_endian(&mut bytes);
    BigUint::from_bytes_be(&bytes)
}

impl GasStats {
    /// Sums in arbitrary precision before dividing, so neither the totals nor the averages can
    /// overflow. Returns `None` for an empty slice.
    pub fn from_records(records: &[DstGasRecord]) -> Option<Self> {
        if records.is_empty() {
            return None;
        }

        let count = BigUint::from(records.len());
        let mean = |field: fn(&DstGasRecord) -> BigUint| -> BigUint {
            records.iter().map(field).sum::<BigUint>() / &count
        };

        Some(GasStats {
            count: records.len(),
            avg_vaa_length: mean(|record| BigUint::from(record.vaa_length)),
            avg_estimate_gas: mean(|record| to_biguint(record.estimate_gas)),
            avg_estimate_gas_price: mean(|record| to_biguint(record.estimate_gas_price)),
            avg_actual_gas: mean(|record| to_biguint(record.actual_gas)),
            avg_actual_gas_price: mean(|record| to_biguint(record.actual_gas_price)),
        })
    }
}
