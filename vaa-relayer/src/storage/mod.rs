//! Deduplicating persistence for observed VAAs and destination gas observations.
//!
//! [Storage] is the raw, fallible backend. [DedupStore] wraps it with the relayer's failure
//! policy: persistence errors are logged where they happen and callers only ever see an empty
//! result, so a flaky database can never take the ingestion loop down.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use error_stack::Result;
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};
use wormhole_vaa::{Address, Chain};

mod records;
mod sqlite;

#[cfg(test)]
pub(crate) use records::test_utils;
pub use records::{DstGasRecord, GasStats, GuardianSignature, VaaKey, VaaRecord};
pub use sqlite::SqliteStorage;

/// Page size for destination lookups when the caller doesn't ask for one.
pub const DEFAULT_PAGE_SIZE: usize = 10;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to connect to the database")]
    Connection,
    #[error("failed to migrate the database schema")]
    Migration,
    #[error("database query failed")]
    Query,
    #[error("failed to decode stored record")]
    Decode,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub path: PathBuf,
    pub pool_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from("~/.vaa-relayer/vaa.sqlite"),
            pool_size: 8,
        }
    }
}

#[automock]
#[async_trait]
pub trait Storage {
    /// Atomic insert-or-replace keyed by `(sequence, emitter_chain, emitter_address)`.
    async fn upsert_vaa(&self, record: VaaRecord) -> Result<(), Error>;

    /// First record (in insertion order) matching the sequence and whichever of the
    /// optional key parts are given.
    async fn find_vaa(
        &self,
        sequence: u64,
        emitter_chain: Option<Chain>,
        emitter_address: Option<Address>,
    ) -> Result<Option<VaaRecord>, Error>;

    /// Newest first by VAA timestamp.
    async fn find_by_destination(
        &self,
        to_chain: Chain,
        to: Option<Address>,
        limit: usize,
    ) -> Result<Vec<VaaRecord>, Error>;

    /// Returns false if no record exists for the key.
    async fn mark_redeemed(&self, key: VaaKey, redeemed_at: u64) -> Result<bool, Error>;

    async fn insert_dst_gas(&self, record: DstGasRecord) -> Result<(), Error>;

    async fn dst_gas_records(
        &self,
        chain: Chain,
        dst_swap_length: u64,
    ) -> Result<Vec<DstGasRecord>, Error>;
}

/// Shared handle to the store. Cheap to clone, every component gets its own copy.
#[derive(Clone)]
pub struct DedupStore {
    storage: Arc<dyn Storage + Send + Sync>,
}

impl DedupStore {
    pub fn new(storage: impl Storage + Send + Sync + 'static) -> Self {
        Self {
            storage: Arc::new(storage),
        }
    }

    /// Returns whether the record was persisted.
    pub async fn upsert_vaa(&self, record: VaaRecord) -> bool {
        let key = record.key();

        match self.storage.upsert_vaa(record).await {
            Ok(()) => {
                debug!(
                    sequence = key.sequence,
                    emitter_chain = key.emitter_chain.id(),
                    emitter_address = %key.emitter_address,
                    "stored vaa"
                );
                true
            }
            Err(err) => {
                error!(key = %key, err = ?err, "failed to store vaa");
                false
            }
        }
    }

    pub async fn find_vaa(
        &self,
        sequence: u64,
        emitter_chain: Option<Chain>,
        emitter_address: Option<Address>,
    ) -> Option<VaaRecord> {
        self.storage
            .find_vaa(sequence, emitter_chain, emitter_address)
            .await
            .unwrap_or_else(|err| {
                error!(sequence, err = ?err, "failed to look up vaa");
                None
            })
    }

    pub async fn find_by_destination(
        &self,
        to_chain: Chain,
        to: Option<Address>,
        limit: usize,
    ) -> Vec<VaaRecord> {
        self.storage
            .find_by_destination(to_chain, to, limit)
            .await
            .unwrap_or_else(|err| {
                error!(
                    to_chain = to_chain.id(),
                    err = ?err,
                    "failed to look up vaas by destination"
                );
                vec![]
            })
    }

    pub async fn mark_redeemed(&self, key: &VaaKey) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();

        match self.storage.mark_redeemed(*key, now).await {
            Ok(found) => {
                if !found {
                    warn!(key = %key, "no stored vaa to mark as redeemed");
                }
                found
            }
            Err(err) => {
                error!(key = %key, err = ?err, "failed to mark vaa as redeemed");
                false
            }
        }
    }

    /// Observations without a gas estimate are discarded, they would drag the averages used
    /// for fee quoting towards zero.
    pub async fn record_gas(&self, record: DstGasRecord) -> bool {
        if !record.has_estimates() {
            warn!(
                chain_id = record.chain_id.id(),
                estimate_gas = %record.estimate_gas,
                estimate_gas_price = %record.estimate_gas_price,
                "discarding gas record without estimates"
            );
            return false;
        }

        let chain_id = record.chain_id;
        match self.storage.insert_dst_gas(record).await {
            Ok(()) => true,
            Err(err) => {
                error!(chain_id = chain_id.id(), err = ?err, "failed to store gas record");
                false
            }
        }
    }

    pub async fn query_gas_stats(&self, chain: Chain, dst_swap_length: u64) -> Option<GasStats> {
        let records = self
            .storage
            .dst_gas_records(chain, dst_swap_length)
            .await
            .unwrap_or_else(|err| {
                error!(
                    chain_id = chain.id(),
                    dst_swap_length,
                    err = ?err,
                    "failed to load gas records"
                );
                vec![]
            });

        GasStats::from_records(&records)
    }
}
