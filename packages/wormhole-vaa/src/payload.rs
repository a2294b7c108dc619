use nom::combinator::{all_consuming, rest, verify};
use nom::number::complete::be_u8;
use nom::sequence::tuple;
use nom::IResult;

use crate::vaa::{address, chain, fixed};
use crate::{Address, Chain, U256};

pub const TRANSFER_PAYLOAD_ID: u8 = 1;
pub const TRANSFER_WITH_PAYLOAD_ID: u8 = 3;

/// A token lock-up (or burn) on the source chain, redeemable on `to_chain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub amount: U256,
    pub token_address: Address,
    pub token_chain: Chain,
    pub to: Address,
    pub to_chain: Chain,
    /// Relayer fee, never larger than `amount`.
    pub fee: U256,
}

/// Same as [Transfer] but carries an arbitrary payload for the recipient contract
/// instead of a relayer fee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferWithPayload {
    pub amount: U256,
    pub token_address: Address,
    pub token_chain: Chain,
    pub to: Address,
    pub to_chain: Chain,
    pub from_address: Address,
    pub payload: Vec<u8>,
}

/// The possible interpretations of a VAA payload. Not every VAA moves tokens,
/// so `Unrecognized` is a regular outcome and not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Transfer(Transfer),
    TransferWithPayload(TransferWithPayload),
    Unrecognized,
}

fn u256(input: &[u8]) -> IResult<&[u8], U256> {
    let (input, bytes) = fixed::<32>(input)?;
    Ok((input, U256::from_big_endian(&bytes)))
}

fn payload_id(id: u8) -> impl Fn(&[u8]) -> IResult<&[u8], u8> {
    move |input| verify(be_u8, |parsed: &u8| *parsed == id)(input)
}

impl Transfer {
    pub fn parse(input: &[u8]) -> Option<Self> {
        let (_, (_, amount, token_address, token_chain, to, to_chain, fee)) =
            all_consuming(tuple((
                payload_id(TRANSFER_PAYLOAD_ID),
                u256,
                address,
                chain,
                address,
                chain,
                u256,
            )))(input)
            .ok()?;

        (fee <= amount).then_some(Transfer {
            amount,
            token_address,
            token_chain,
            to,
            to_chain,
            fee,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = vec![TRANSFER_PAYLOAD_ID];
        bytes.extend_from_slice(&u256_bytes(self.amount));
        bytes.extend_from_slice(self.token_address.as_bytes());
        bytes.extend_from_slice(&self.token_chain.id().to_be_bytes());
        bytes.extend_from_slice(self.to.as_bytes());
        bytes.extend_from_slice(&self.to_chain.id().to_be_bytes());
        bytes.extend_from_slice(&u256_bytes(self.fee));
        bytes
    }
}

impl TransferWithPayload {
    pub fn parse(input: &[u8]) -> Option<Self> {
        let (_, (_, amount, token_address, token_chain, to, to_chain, from_address, payload)) =
            tuple((
                payload_id(TRANSFER_WITH_PAYLOAD_ID),
                u256,
                address,
                chain,
                address,
                chain,
                address,
                rest,
            ))(input)
            .ok()?;

        Some(TransferWithPayload {
            amount,
            token_address,
            token_chain,
            to,
            to_chain,
            from_address,
            payload: payload.to_vec(),
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = vec![TRANSFER_WITH_PAYLOAD_ID];
        bytes.extend_from_slice(&u256_bytes(self.amount));
        bytes.extend_from_slice(self.token_address.as_bytes());
        bytes.extend_from_slice(&self.token_chain.id().to_be_bytes());
        bytes.extend_from_slice(self.to.as_bytes());
        bytes.extend_from_slice(&self.to_chain.id().to_be_bytes());
        bytes.extend_from_slice(self.from_address.as_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

fn u256_bytes(value: U256) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    value.to_big_endian(&mut bytes);
    bytes
}

impl Payload {
    /// Transfer-with-payload takes precedence, the plain transfer layout is the fallback.
    pub fn decode(bytes: &[u8]) -> Self {
        if let Some(transfer) = TransferWithPayload::parse(bytes) {
            return Payload::TransferWithPayload(transfer);
        }

        Transfer::parse(bytes)
            .map(Payload::Transfer)
            .unwrap_or(Payload::Unrecognized)
    }

    pub fn to_chain(&self) -> Option<Chain> {
        match self {
            Payload::Transfer(transfer) => Some(transfer.to_chain),
            Payload::TransferWithPayload(transfer) => Some(transfer.to_chain),
            Payload::Unrecognized => None,
        }
    }

    pub fn to(&self) -> Option<Address> {
        match self {
            Payload::Transfer(transfer) => Some(transfer.to),
            Payload::TransferWithPayload(transfer) => Some(transfer.to),
            Payload::Unrecognized => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSFER_PAYLOAD: &str = "0100000000000000000000000000000000000000000000000000005af3107a40000000000000000000000000003b10cb8830a10e41a00d41c34bed8c58d5a1de780002000000000000000000000000b6b12ada59a8ac44ded72e03693dd1461422434900060000000000000000000000000000000000000000000000000000000000000000";

    fn transfer_with_payload() -> TransferWithPayload {
        TransferWithPayload {
            amount: U256::from(1_000_000u64),
            token_address: Address::from([0x11; 20]),
            token_chain: Chain::Bsc,
            to: Address::from([0x22; 20]),
            to_chain: Chain::Avalanche,
            from_address: Address::from([0x33; 20]),
            payload: vec![0xde, 0xad, 0xbe, 0xef],
        }
    }

    #[test]
    fn plain_transfer_decodes_after_payload_variant_fails() {
        let bytes = hex::decode(TRANSFER_PAYLOAD).unwrap();
        assert!(TransferWithPayload::parse(&bytes).is_none());

        let Payload::Transfer(transfer) = Payload::decode(&bytes) else {
            panic!("expected a plain transfer");
        };

        assert_eq!(transfer.amount, U256::from(100_000_000_000_000u64));
        assert_eq!(transfer.token_chain, Chain::Ethereum);
        assert_eq!(transfer.to_chain, Chain::Avalanche);
        assert_eq!(
            transfer.to.to_string(),
            "0x000000000000000000000000b6b12ada59a8ac44ded72e03693dd14614224349"
        );
        assert_eq!(transfer.fee, U256::zero());
        assert_eq!(transfer.serialize(), bytes);
    }

    #[test]
    fn transfer_with_payload_takes_precedence() {
        let expected = transfer_with_payload();
        let decoded = Payload::decode(&expected.serialize());

        assert_eq!(decoded, Payload::TransferWithPayload(expected));
        assert_eq!(decoded.to_chain(), Some(Chain::Avalanche));
        assert_eq!(decoded.to(), Some(Address::from([0x22; 20])));
    }

    #[test]
    fn transfer_with_empty_payload_is_still_payload_variant() {
        let transfer = TransferWithPayload {
            payload: vec![],
            ..transfer_with_payload()
        };

        assert!(matches!(
            Payload::decode(&transfer.serialize()),
            Payload::TransferWithPayload(decoded) if decoded.payload.is_empty()
        ));
    }

    #[test]
    fn unrecognized_payloads() {
        // attestation of asset metadata
        assert_eq!(Payload::decode(&[2u8; 100]), Payload::Unrecognized);
        assert_eq!(Payload::decode(&[]), Payload::Unrecognized);

        // transfer with trailing garbage
        let mut bytes = hex::decode(TRANSFER_PAYLOAD).unwrap();
        bytes.push(0);
        assert_eq!(Payload::decode(&bytes), Payload::Unrecognized);

        // transfer with a fee above the amount
        let transfer = Transfer {
            amount: U256::from(10u64),
            token_address: Address::default(),
            token_chain: Chain::Ethereum,
            to: Address::default(),
            to_chain: Chain::Bsc,
            fee: U256::from(11u64),
        };
        assert_eq!(Payload::decode(&transfer.serialize()), Payload::Unrecognized);
        assert_eq!(Payload::Unrecognized.to_chain(), None);
    }
}
