use ethers_core::abi::{self, ParamType, Token};

use crate::{Error, U256};

/// Source-side swap description as it is relayed inside an omniswap payload.
/// Addresses stay as raw bytes since they may belong to non-EVM chains.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NormalizedSoData {
    pub transaction_id: Vec<u8>,
    pub receiver: Vec<u8>,
    pub source_chain_id: u16,
    pub sending_asset_id: Vec<u8>,
    pub destination_chain_id: u16,
    pub receiving_asset_id: Vec<u8>,
    pub amount: U256,
}

/// One destination-side swap step.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NormalizedSwapData {
    pub call_to: Vec<u8>,
    pub approve_to: Vec<u8>,
    pub sending_asset_id: Vec<u8>,
    pub receiving_asset_id: Vec<u8>,
    pub from_amount: U256,
    pub call_data: Vec<u8>,
}

/// Payload attached to a transfer-with-payload by the omniswap source contract. It tells the
/// relayer how much gas the user prepaid for the destination leg.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WormholePayload {
    pub dst_max_gas: U256,
    pub dst_max_gas_price: U256,
    pub so_data: NormalizedSoData,
    pub dst_swap_data: Vec<NormalizedSwapData>,
}

fn so_data_type() -> ParamType {
    ParamType::Tuple(vec![
        ParamType::Bytes,
        ParamType::Bytes,
        ParamType::Uint(16),
        ParamType::Bytes,
        ParamType::Uint(16),
        ParamType::Bytes,
        ParamType::Uint(256),
    ])
}

fn swap_data_type() -> ParamType {
    ParamType::Tuple(vec![
        ParamType::Bytes,
        ParamType::Bytes,
        ParamType::Bytes,
        ParamType::Bytes,
        ParamType::Uint(256),
        ParamType::Bytes,
    ])
}

fn layout() -> [ParamType; 4] {
    [
        ParamType::Uint(256),
        ParamType::Uint(256),
        so_data_type(),
        ParamType::Array(Box::new(swap_data_type())),
    ]
}

struct Tokens(std::vec::IntoIter<Token>);

impl Tokens {
    fn uint(&mut self) -> Result<U256, Error> {
        self.0
            .next()
            .and_then(Token::into_uint)
            .ok_or(Error::NotOmniswap)
    }

    fn u16(&mut self) -> Result<u16, Error> {
        let value = self.uint()?;
        if value > U256::from(u16::MAX) {
            return Err(Error::NotOmniswap);
        }

        u16::try_from(value.low_u32()).map_err(|_| Error::NotOmniswap)
    }

    fn bytes(&mut self) -> Result<Vec<u8>, Error> {
        self.0
            .next()
            .and_then(Token::into_bytes)
            .ok_or(Error::NotOmniswap)
    }

    fn tuple(&mut self) -> Result<Tokens, Error> {
        self.0
            .next()
            .and_then(Token::into_tuple)
            .map(|tokens| Tokens(tokens.into_iter()))
            .ok_or(Error::NotOmniswap)
    }

    fn array(&mut self) -> Result<Vec<Token>, Error> {
        self.0
            .next()
            .and_then(Token::into_array)
            .ok_or(Error::NotOmniswap)
    }
}

impl NormalizedSoData {
    fn from_tokens(mut tokens: Tokens) -> Result<Self, Error> {
        Ok(NormalizedSoData {
            transaction_id: tokens.bytes()?,
            receiver: tokens.bytes()?,
            source_chain_id: tokens.u16()?,
            sending_asset_id: tokens.bytes()?,
            destination_chain_id: tokens.u16()?,
            receiving_asset_id: tokens.bytes()?,
            amount: tokens.uint()?,
        })
    }

    fn into_token(self) -> Token {
        Token::Tuple(vec![
            Token::Bytes(self.transaction_id),
            Token::Bytes(self.receiver),
            Token::Uint(self.source_chain_id.into()),
            Token::Bytes(self.sending_asset_id),
            Token::Uint(self.destination_chain_id.into()),
            Token::Bytes(self.receiving_asset_id),
            Token::Uint(self.amount),
        ])
    }
}

impl NormalizedSwapData {
    fn from_token(token: Token) -> Result<Self, Error> {
        let mut tokens = Tokens(token.into_tuple().ok_or(Error::NotOmniswap)?.into_iter());

        Ok(NormalizedSwapData {
            call_to: tokens.bytes()?,
            approve_to: tokens.bytes()?,
            sending_asset_id: tokens.bytes()?,
            receiving_asset_id: tokens.bytes()?,
            from_amount: tokens.uint()?,
            call_data: tokens.bytes()?,
        })
    }

    fn into_token(self) -> Token {
        Token::Tuple(vec![
            Token::Bytes(self.call_to),
            Token::Bytes(self.approve_to),
            Token::Bytes(self.sending_asset_id),
            Token::Bytes(self.receiving_asset_id),
            Token::Uint(self.from_amount),
            Token::Bytes(self.call_data),
        ])
    }
}

impl WormholePayload {
    /// Decodes the ABI-encoded payload carried by a transfer-with-payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut tokens = Tokens(
            abi::decode(&layout(), bytes)
                .map_err(|_| Error::NotOmniswap)?
                .into_iter(),
        );

        let dst_max_gas = tokens.uint()?;
        let dst_max_gas_price = tokens.uint()?;
        let so_data = NormalizedSoData::from_tokens(tokens.tuple()?)?;
        let dst_swap_data = tokens
            .array()?
            .into_iter()
            .map(NormalizedSwapData::from_token)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(WormholePayload {
            dst_max_gas,
            dst_max_gas_price,
            so_data,
            dst_swap_data,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        abi::encode(&[
            Token::Uint(self.dst_max_gas),
            Token::Uint(self.dst_max_gas_price),
            self.so_data.clone().into_token(),
            Token::Array(
                self.dst_swap_data
                    .iter()
                    .cloned()
                    .map(NormalizedSwapData::into_token)
                    .collect(),
            ),
        ])
    }
}
