use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::{Report, Result, ResultExt};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::task;
use wormhole_vaa::{Address, Chain, U256};

use super::{DstGasRecord, Error, Storage, VaaKey, VaaRecord};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const MIGRATIONS: &str = r#"
    CREATE TABLE IF NOT EXISTS vaas (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        sequence TEXT NOT NULL,
        emitter_chain_id INTEGER NOT NULL,
        emitter_address TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        to_chain INTEGER,
        to_address TEXT,
        record TEXT NOT NULL,
        redeemed_at INTEGER,
        UNIQUE (sequence, emitter_chain_id, emitter_address)
    );

    CREATE INDEX IF NOT EXISTS idx_vaas_destination ON vaas(to_chain, to_address, timestamp);

    CREATE TABLE IF NOT EXISTS dst_gas (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        chain_id INTEGER NOT NULL,
        vaa_length INTEGER NOT NULL,
        dst_swap_length INTEGER NOT NULL,
        estimate_gas TEXT NOT NULL,
        estimate_gas_price TEXT NOT NULL,
        actual_gas TEXT NOT NULL,
        actual_gas_price TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_dst_gas_chain ON dst_gas(chain_id, dst_swap_length);
"#;

/// SQLite backed [Storage]. All statements run on the blocking thread pool.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>, pool_size: u32) -> Result<Self, Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .change_context(Error::Connection)
                .attach_printable_lazy(|| parent.display().to_string())?;
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            conn.busy_timeout(BUSY_TIMEOUT)
        });

        Self::with_manager(manager, pool_size)
    }

    /// Every pooled connection to `:memory:` would see its own database, so the pool is
    /// limited to a single connection.
    pub fn in_memory() -> Result<Self, Error> {
        Self::with_manager(SqliteConnectionManager::memory(), 1)
    }

    fn with_manager(manager: SqliteConnectionManager, pool_size: u32) -> Result<Self, Error> {
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .change_context(Error::Connection)?;

        pool.get()
            .change_context(Error::Connection)?
            .execute_batch(MIGRATIONS)
            .change_context(Error::Migration)?;

        Ok(Self { pool })
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&Connection) -> Result<T, Error> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();

        task::spawn_blocking(move || {
            let conn = pool.get().change_context(Error::Connection)?;
            f(&conn)
        })
        .await
        .change_context(Error::Query)?
    }
}

fn to_sql_int(value: u64) -> Result<i64, Error> {
    i64::try_from(value)
        .change_context(Error::Query)
        .attach_printable_lazy(|| format!("{value} does not fit into an sqlite integer"))
}

fn from_sql_int(value: i64) -> Result<u64, Error> {
    u64::try_from(value).change_context(Error::Decode)
}

fn parse_u256(value: &str) -> Result<U256, Error> {
    U256::from_dec_str(value)
        .change_context(Error::Decode)
        .attach_printable_lazy(|| value.to_string())
}

fn row_to_record(row: &Row) -> rusqlite::Result<(String, Option<i64>)> {
    Ok((row.get("record")?, row.get("redeemed_at")?))
}

fn decode_record((record, redeemed_at): (String, Option<i64>)) -> Result<VaaRecord, Error> {
    let mut record: VaaRecord = serde_json::from_str(&record).change_context(Error::Decode)?;
    record.redeemed_at = redeemed_at.map(from_sql_int).transpose()?;

    Ok(record)
}

struct GasRow {
    chain_id: u16,
    vaa_length: i64,
    dst_swap_length: i64,
    estimate_gas: String,
    estimate_gas_price: String,
    actual_gas: String,
    actual_gas_price: String,
}

fn row_to_gas(row: &Row) -> rusqlite::Result<GasRow> {
    Ok(GasRow {
        chain_id: row.get("chain_id")?,
        vaa_length: row.get("vaa_length")?,
        dst_swap_length: row.get("dst_swap_length")?,
        estimate_gas: row.get("estimate_gas")?,
        estimate_gas_price: row.get("estimate_gas_price")?,
        actual_gas: row.get("actual_gas")?,
        actual_gas_price: row.get("actual_gas_price")?,
    })
}

impl TryFrom<GasRow> for DstGasRecord {
    type Error = Report<Error>;

    fn try_from(row: GasRow) -> std::result::Result<Self, Self::Error> {
        Ok(DstGasRecord {
            chain_id: Chain::from(row.chain_id),
            vaa_length: from_sql_int(row.vaa_length)?,
            dst_swap_length: from_sql_int(row.dst_swap_length)?,
            estimate_gas: parse_u256(&row.estimate_gas)?,
            estimate_gas_price: parse_u256(&row.estimate_gas_price)?,
            actual_gas: parse_u256(&row.actual_gas)?,
            actual_gas_price: parse_u256(&row.actual_gas_price)?,
        })
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn upsert_vaa(&self, record: VaaRecord) -> Result<(), Error> {
        let json = serde_json::to_string(&record).change_context(Error::Query)?;

        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO vaas (
                    sequence, emitter_chain_id, emitter_address, timestamp,
                    to_chain, to_address, record
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT (sequence, emitter_chain_id, emitter_address) DO UPDATE SET
                    timestamp = excluded.timestamp,
                    to_chain = excluded.to_chain,
                    to_address = excluded.to_address,
                    record = excluded.record
                "#,
                params![
                    record.sequence.to_string(),
                    record.emitter_chain_id.id(),
                    record.emitter_address.to_string(),
                    record.timestamp,
                    record.to_chain.map(Chain::id),
                    record.to.map(|to| to.to_string()),
                    json,
                ],
            )
            .change_context(Error::Query)
            .attach_printable_lazy(|| record.key().to_string())?;

            Ok(())
        })
        .await
    }

    async fn find_vaa(
        &self,
        sequence: u64,
        emitter_chain: Option<Chain>,
        emitter_address: Option<Address>,
    ) -> Result<Option<VaaRecord>, Error> {
        let row = self
            .with_conn(move |conn| {
                conn.query_row(
                    r#"
                    SELECT record, redeemed_at FROM vaas
                    WHERE sequence = ?1
                        AND (?2 IS NULL OR emitter_chain_id = ?2)
                        AND (?3 IS NULL OR emitter_address = ?3)
                    ORDER BY id ASC
                    LIMIT 1
                    "#,
                    params![
                        sequence.to_string(),
                        emitter_chain.map(Chain::id),
                        emitter_address.map(|address| address.to_string()),
                    ],
                    row_to_record,
                )
                .optional()
                .change_context(Error::Query)
            })
            .await?;

        row.map(decode_record).transpose()
    }

    async fn find_by_destination(
        &self,
        to_chain: Chain,
        to: Option<Address>,
        limit: usize,
    ) -> Result<Vec<VaaRecord>, Error> {
        let limit = to_sql_int(u64::try_from(limit).unwrap_or(u64::MAX)).unwrap_or(i64::MAX);

        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare(
                        r#"
                        SELECT record, redeemed_at FROM vaas
                        WHERE to_chain = ?1 AND (?2 IS NULL OR to_address = ?2)
                        ORDER BY timestamp DESC, id DESC
                        LIMIT ?3
                        "#,
                    )
                    .change_context(Error::Query)?;

                let rows = stmt
                    .query_map(
                        params![to_chain.id(), to.map(|to| to.to_string()), limit],
                        row_to_record,
                    )
                    .change_context(Error::Query)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .change_context(Error::Query)?;

                Ok(rows)
            })
            .await?;

        rows.into_iter().map(decode_record).collect()
    }

    async fn mark_redeemed(&self, key: VaaKey, redeemed_at: u64) -> Result<bool, Error> {
        let redeemed_at = to_sql_int(redeemed_at)?;

        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    r#"
                    UPDATE vaas SET redeemed_at = COALESCE(redeemed_at, ?4)
                    WHERE sequence = ?1 AND emitter_chain_id = ?2 AND emitter_address = ?3
                    "#,
                    params![
                        key.sequence.to_string(),
                        key.emitter_chain.id(),
                        key.emitter_address.to_string(),
                        redeemed_at,
                    ],
                )
                .change_context(Error::Query)
                .attach_printable_lazy(|| key.to_string())?;

            Ok(updated > 0)
        })
        .await
    }

    async fn insert_dst_gas(&self, record: DstGasRecord) -> Result<(), Error> {
        let vaa_length = to_sql_int(record.vaa_length)?;
        let dst_swap_length = to_sql_int(record.dst_swap_length)?;

        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO dst_gas (
                    chain_id, vaa_length, dst_swap_length, estimate_gas,
                    estimate_gas_price, actual_gas, actual_gas_price
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    record.chain_id.id(),
                    vaa_length,
                    dst_swap_length,
                    record.estimate_gas.to_string(),
                    record.estimate_gas_price.to_string(),
                    record.actual_gas.to_string(),
                    record.actual_gas_price.to_string(),
                ],
            )
            .change_context(Error::Query)?;

            Ok(())
        })
        .await
    }

    async fn dst_gas_records(
        &self,
        chain: Chain,
        dst_swap_length: u64,
    ) -> Result<Vec<DstGasRecord>, Error> {
        let dst_swap_length = to_sql_int(dst_swap_length)?;

        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare(
                        r#"
                        SELECT * FROM dst_gas
                        WHERE chain_id = ?1 AND dst_swap_length = ?2
                        ORDER BY id ASC
                        "#,
                    )
                    .change_context(Error::Query)?;

                let rows = stmt
                    .query_map(params![chain.id(), dst_swap_length], row_to_gas)
                    .change_context(Error::Query)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .change_context(Error::Query)?;

                Ok(rows)
            })
            .await?;

        rows.into_iter().map(DstGasRecord::try_from).collect()
    }
}
