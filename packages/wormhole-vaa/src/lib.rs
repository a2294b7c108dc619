//! Decoding of Wormhole VAAs (Verified Action Approvals) and the token bridge payloads they carry.
//!
//! Signature verification is out of scope: everything here assumes the guardian quorum was
//! already checked upstream and only deals with the byte layout.

mod address;
mod chain;
mod error;
mod omniswap;
mod payload;
mod vaa;

pub use address::{left_pad_address, Address};
pub use chain::Chain;
pub use error::Error;
pub use omniswap::{NormalizedSoData, NormalizedSwapData, WormholePayload};
pub use payload::{
    Payload, Transfer, TransferWithPayload, TRANSFER_PAYLOAD_ID, TRANSFER_WITH_PAYLOAD_ID,
};
pub use vaa::{Signature, Vaa, SIGNATURE_LEN};

/// Big-endian 256-bit unsigned integer used for amounts, fees and gas values.
pub use ethers_core::types::U256;
