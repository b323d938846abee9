//! Sync Store (C4): the single persistence boundary for raw chain data,
//! synced-interval bookkeeping, materialized events, and the RPC result cache.
//! One Postgres backend (`sqlx`), grounded directly on the teacher's `Db`
//! wrapper and its `QueryBuilder` bulk-upsert idiom.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    ConnectOptions, PgPool, Postgres, QueryBuilder,
};

use crate::filter::{AddressConstraint, Filter, TopicConstraint};
use crate::interval::{self, BlockRange};

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let opts = PgConnectOptions::from_str(database_url)
            .context("parse DATABASE_URL")?
            .log_statements(tracing::log::LevelFilter::Trace)
            .log_slow_statements(tracing::log::LevelFilter::Warn, Duration::from_millis(200));

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await
            .context("connect to database")?;

        Ok(Self { pool })
    }
}

pub async fn ensure_schema_version(db: &Db, min_version: i64) -> Result<i64> {
    let version: i64 =
        sqlx::query_scalar::<Postgres, i64>("select coalesce(max(version), 0) from _sqlx_migrations")
            .fetch_one(&db.pool)
            .await
            .context("read _sqlx_migrations version")?;

    if version < min_version {
        anyhow::bail!(
            "database schema version is {version}, but chainsync expects >= {min_version} \
             (run migrations against the same DATABASE_URL)"
        );
    }

    Ok(version)
}

fn to_i64(chain_id: u64) -> Result<i64> {
    i64::try_from(chain_id).context("chain_id out of range for bigint")
}

// ---------------------------------------------------------------------------
// Raw table rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BlockRow {
    pub chain_id: u64,
    pub hash: String,
    pub number: u64,
    pub timestamp: u64,
    pub parent_hash: String,
    pub body: serde_json::Value,
}

pub async fn insert_blocks(db: &Db, rows: &[BlockRow]) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let mut qb = QueryBuilder::new(
        "insert into sync.block (chain_id, hash, number, timestamp, parent_hash, body) ",
    );
    qb.push_values(rows, |mut b, row| {
        b.push_bind(to_i64(row.chain_id).unwrap_or_default())
            .push_bind(&row.hash)
            .push_bind(row.number as i64)
            .push_bind(row.timestamp as i64)
            .push_bind(&row.parent_hash)
            .push_bind(sqlx::types::Json(&row.body));
    });
    qb.push(" on conflict (chain_id, hash) do nothing");
    qb.build().execute(&db.pool).await.context("insert sync.block")?;
    Ok(())
}

pub async fn get_block_by_number(db: &Db, chain_id: u64, number: u64) -> Result<Option<BlockRow>> {
    let row: Option<(String, i64, String, serde_json::Value)> = sqlx::query_as(
        "select hash, timestamp, parent_hash, body from sync.block where chain_id = $1 and number = $2",
    )
    .bind(to_i64(chain_id)?)
    .bind(number as i64)
    .fetch_optional(&db.pool)
    .await
    .context("read sync.block by number")?;
    Ok(row.map(|(hash, timestamp, parent_hash, body)| BlockRow {
        chain_id,
        hash,
        number,
        timestamp: timestamp as u64,
        parent_hash,
        body,
    }))
}

pub async fn has_block(db: &Db, chain_id: u64, hash: &str) -> Result<bool> {
    let exists: Option<i32> = sqlx::query_scalar(
        "select 1 from sync.block where chain_id = $1 and hash = $2",
    )
    .bind(to_i64(chain_id)?)
    .bind(hash)
    .fetch_optional(&db.pool)
    .await
    .context("check sync.block existence")?;
    Ok(exists.is_some())
}

#[derive(Debug, Clone)]
pub struct TransactionRow {
    pub chain_id: u64,
    pub hash: String,
    pub block_hash: String,
    pub block_number: u64,
    pub transaction_index: u64,
    pub body: serde_json::Value,
}

pub async fn insert_transactions(db: &Db, rows: &[TransactionRow]) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let mut qb = QueryBuilder::new(
        "insert into sync.transaction (chain_id, hash, block_hash, block_number, transaction_index, body) ",
    );
    qb.push_values(rows, |mut b, row| {
        b.push_bind(to_i64(row.chain_id).unwrap_or_default())
            .push_bind(&row.hash)
            .push_bind(&row.block_hash)
            .push_bind(row.block_number as i64)
            .push_bind(row.transaction_index as i64)
            .push_bind(sqlx::types::Json(&row.body));
    });
    qb.push(" on conflict (chain_id, hash) do nothing");
    qb.build().execute(&db.pool).await.context("insert sync.transaction")?;
    Ok(())
}

pub async fn has_transaction(db: &Db, chain_id: u64, hash: &str) -> Result<bool> {
    let exists: Option<i32> = sqlx::query_scalar(
        "select 1 from sync.transaction where chain_id = $1 and hash = $2",
    )
    .bind(to_i64(chain_id)?)
    .bind(hash)
    .fetch_optional(&db.pool)
    .await
    .context("check sync.transaction existence")?;
    Ok(exists.is_some())
}

#[derive(Debug, Clone)]
pub struct TransactionReceiptRow {
    pub chain_id: u64,
    pub hash: String,
    pub block_hash: String,
    pub block_number: u64,
    pub body: serde_json::Value,
}

pub async fn insert_transaction_receipts(db: &Db, rows: &[TransactionReceiptRow]) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let mut qb = QueryBuilder::new(
        "insert into sync.transaction_receipt (chain_id, hash, block_hash, block_number, body) ",
    );
    qb.push_values(rows, |mut b, row| {
        b.push_bind(to_i64(row.chain_id).unwrap_or_default())
            .push_bind(&row.hash)
            .push_bind(&row.block_hash)
            .push_bind(row.block_number as i64)
            .push_bind(sqlx::types::Json(&row.body));
    });
    qb.push(" on conflict (chain_id, hash) do nothing");
    qb.build().execute(&db.pool).await.context("insert sync.transaction_receipt")?;
    Ok(())
}

pub async fn has_transaction_receipt(db: &Db, chain_id: u64, hash: &str) -> Result<bool> {
    let exists: Option<i32> = sqlx::query_scalar(
        "select 1 from sync.transaction_receipt where chain_id = $1 and hash = $2",
    )
    .bind(to_i64(chain_id)?)
    .bind(hash)
    .fetch_optional(&db.pool)
    .await
    .context("check sync.transaction_receipt existence")?;
    Ok(exists.is_some())
}

#[derive(Debug, Clone)]
pub struct LogRow {
    pub chain_id: u64,
    pub block_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    pub transaction_hash: String,
    pub transaction_index: u64,
    pub address: String,
    pub topics: [Option<String>; 4],
    pub data: String,
    pub body: serde_json::Value,
}

pub async fn insert_logs(db: &Db, rows: &[LogRow]) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let mut qb = QueryBuilder::new(
        "insert into sync.log (chain_id, block_hash, log_index, block_number, transaction_hash, \
         transaction_index, address, topic0, topic1, topic2, topic3, data, body) ",
    );
    qb.push_values(rows, |mut b, row| {
        b.push_bind(to_i64(row.chain_id).unwrap_or_default())
            .push_bind(&row.block_hash)
            .push_bind(row.log_index as i64)
            .push_bind(row.block_number as i64)
            .push_bind(&row.transaction_hash)
            .push_bind(row.transaction_index as i64)
            .push_bind(row.address.to_lowercase())
            .push_bind(row.topics[0].clone())
            .push_bind(row.topics[1].clone())
            .push_bind(row.topics[2].clone())
            .push_bind(row.topics[3].clone())
            .push_bind(&row.data)
            .push_bind(sqlx::types::Json(&row.body));
    });
    qb.push(" on conflict (chain_id, block_hash, log_index) do nothing");
    qb.build().execute(&db.pool).await.context("insert sync.log")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Child-address discovery
// ---------------------------------------------------------------------------

pub async fn insert_addresses(
    db: &Db,
    chain_id: u64,
    filter_id: &str,
    addresses: &[(String, u64)],
) -> Result<()> {
    if addresses.is_empty() {
        return Ok(());
    }
    let mut qb = QueryBuilder::new("insert into sync.address (chain_id, filter_id, address, block_number) ");
    qb.push_values(addresses, |mut b, (address, block_number)| {
        b.push_bind(to_i64(chain_id).unwrap_or_default())
            .push_bind(filter_id)
            .push_bind(address.to_lowercase())
            .push_bind(*block_number as i64);
    });
    qb.push(" on conflict (chain_id, filter_id, address) do nothing");
    qb.build().execute(&db.pool).await.context("insert sync.address")?;
    Ok(())
}

pub async fn get_addresses(db: &Db, chain_id: u64, filter_id: &str) -> Result<Vec<String>> {
    let rows: Vec<String> = sqlx::query_scalar(
        "select address from sync.address where chain_id = $1 and filter_id = $2",
    )
    .bind(to_i64(chain_id)?)
    .bind(filter_id)
    .fetch_all(&db.pool)
    .await
    .context("read sync.address")?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Interval bookkeeping
// ---------------------------------------------------------------------------

pub async fn insert_interval(
    db: &Db,
    kind: &str,
    chain_id: u64,
    filter_id: &str,
    range: BlockRange,
) -> Result<()> {
    sqlx::query(
        "insert into sync.interval (kind, chain_id, filter_id, from_block, to_block) values ($1, $2, $3, $4, $5)",
    )
    .bind(kind)
    .bind(to_i64(chain_id)?)
    .bind(filter_id)
    .bind(range.0 as i64)
    .bind(range.1 as i64)
    .execute(&db.pool)
    .await
    .context("insert sync.interval")?;
    Ok(())
}

/// Reads all interval rows for `(kind, chain_id, filter_id)`, unions them,
/// replaces the stored rows with the merged set, and returns it — one
/// transaction, so concurrent readers never see a partially-merged state.
pub async fn get_intervals(
    db: &Db,
    kind: &str,
    chain_id: u64,
    filter_id: &str,
) -> Result<Vec<BlockRange>> {
    let mut tx = db.pool.begin().await.context("begin sync.interval merge transaction")?;

    let rows: Vec<(i64, i64)> = sqlx::query_as(
        "select from_block, to_block from sync.interval where kind = $1 and chain_id = $2 and filter_id = $3 for update",
    )
    .bind(kind)
    .bind(to_i64(chain_id)?)
    .bind(filter_id)
    .fetch_all(&mut *tx)
    .await
    .context("read sync.interval rows")?;

    let raw: Vec<BlockRange> = rows.into_iter().map(|(lo, hi)| (lo as u64, hi as u64)).collect();
    let merged = interval::union(&raw);

    sqlx::query("delete from sync.interval where kind = $1 and chain_id = $2 and filter_id = $3")
        .bind(kind)
        .bind(to_i64(chain_id)?)
        .bind(filter_id)
        .execute(&mut *tx)
        .await
        .context("delete sync.interval rows")?;

    if !merged.is_empty() {
        let mut qb = QueryBuilder::new(
            "insert into sync.interval (kind, chain_id, filter_id, from_block, to_block) ",
        );
        qb.push_values(&merged, |mut b, (lo, hi)| {
            b.push_bind(kind)
                .push_bind(to_i64(chain_id).unwrap_or_default())
                .push_bind(filter_id)
                .push_bind(*lo as i64)
                .push_bind(*hi as i64);
        });
        qb.build().execute(&mut *tx).await.context("rewrite merged sync.interval rows")?;
    }

    tx.commit().await.context("commit sync.interval merge transaction")?;
    Ok(merged)
}

/// Reorg cleanup: deletes raw blocks/logs and every materialized event for
/// `chain_id` strictly above `ancestor_number`, across all filters.
pub async fn prune_above(db: &Db, chain_id: u64, ancestor_number: u64) -> Result<()> {
    let cid = to_i64(chain_id)?;
    let above = ancestor_number as i64;
    let mut tx = db.pool.begin().await.context("begin reorg prune transaction")?;

    sqlx::query("delete from sync.event where chain_id = $1 and block_number > $2")
        .bind(cid)
        .bind(above)
        .execute(&mut *tx)
        .await
        .context("prune sync.event")?;
    sqlx::query("delete from sync.log where chain_id = $1 and block_number > $2")
        .bind(cid)
        .bind(above)
        .execute(&mut *tx)
        .await
        .context("prune sync.log")?;
    sqlx::query("delete from sync.block where chain_id = $1 and number > $2")
        .bind(cid)
        .bind(above)
        .execute(&mut *tx)
        .await
        .context("prune sync.block")?;

    tx.commit().await.context("commit reorg prune transaction")?;
    Ok(())
}

/// Clamps every `(kind, chain_id, filter_id)` interval row's upper bound to
/// `min(hi, ancestor_number)`, dropping rows that start above it entirely.
pub async fn truncate_intervals(db: &Db, kind: &str, chain_id: u64, filter_id: &str, ancestor_number: u64) -> Result<()> {
    let existing = get_intervals(db, kind, chain_id, filter_id).await?;
    let truncated: Vec<BlockRange> = existing
        .into_iter()
        .filter_map(|(lo, hi)| if lo > ancestor_number { None } else { Some((lo, hi.min(ancestor_number))) })
        .collect();

    let cid = to_i64(chain_id)?;
    let mut tx = db.pool.begin().await.context("begin interval truncate transaction")?;
    sqlx::query("delete from sync.interval where kind = $1 and chain_id = $2 and filter_id = $3")
        .bind(kind)
        .bind(cid)
        .bind(filter_id)
        .execute(&mut *tx)
        .await
        .context("delete sync.interval rows for truncate")?;
    if !truncated.is_empty() {
        let mut qb = QueryBuilder::new(
            "insert into sync.interval (kind, chain_id, filter_id, from_block, to_block) ",
        );
        qb.push_values(&truncated, |mut b, (lo, hi)| {
            b.push_bind(kind).push_bind(cid).push_bind(filter_id).push_bind(*lo as i64).push_bind(*hi as i64);
        });
        qb.build().execute(&mut *tx).await.context("rewrite truncated sync.interval rows")?;
    }
    tx.commit().await.context("commit interval truncate transaction")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Event materialization
// ---------------------------------------------------------------------------

/// Builds the checkpoint-computing SQL expression from column references, per
/// the fixed-width encoding in `checkpoint.rs` (must stay in sync with it).
fn checkpoint_expr(
    timestamp: &str,
    chain_id: &str,
    block_number: &str,
    tx_index: &str,
    event_type_digit: u8,
    event_index: &str,
) -> String {
    format!(
        "lpad({timestamp}::text, 10, '0') || lpad({chain_id}::text, 16, '0') || \
         lpad({block_number}::text, 16, '0') || lpad(coalesce({tx_index}, 0)::text, 16, '0') || \
         '{event_type_digit}' || lpad(coalesce({event_index}, 0)::text, 16, '0')"
    )
}

fn push_address_predicate(qb: &mut QueryBuilder<'_, Postgres>, chain_id: u64, address: &AddressConstraint) {
    match address {
        AddressConstraint::Single(a) => {
            qb.push(" and l.address = ");
            qb.push_bind(a.to_lowercase());
        }
        AddressConstraint::Set(addrs) => {
            let lowered: Vec<String> = addrs.iter().map(|a| a.to_lowercase()).collect();
            qb.push(" and l.address = any(");
            qb.push_bind(lowered);
            qb.push(")");
        }
        AddressConstraint::Child(child) => {
            qb.push(" and l.address in (select address from sync.address where chain_id = ");
            qb.push_bind(to_i64(chain_id).unwrap_or_default());
            qb.push(" and filter_id = ");
            qb.push_bind(crate::filter::filter_id(
                crate::filter::FilterKind::Address,
                &child.discovery_filter(0, None),
            ));
            qb.push(")");
        }
    }
}

fn push_topic_predicate(qb: &mut QueryBuilder<'_, Postgres>, column: &str, constraint: &TopicConstraint) {
    match constraint {
        TopicConstraint::Single(t) => {
            qb.push(format!(" and l.{column} = "));
            qb.push_bind(t.to_lowercase());
        }
        TopicConstraint::Set(ts) => {
            let lowered: Vec<String> = ts.iter().map(|t| t.to_lowercase()).collect();
            qb.push(format!(" and l.{column} = any("));
            qb.push_bind(lowered);
            qb.push(")");
        }
    }
}

/// Materializes every log/block matching `filter` in `[range.0, range.1]` into
/// `sync.event`, idempotently (`ON CONFLICT DO NOTHING` on the checkpoint PK).
/// Returns the number of newly inserted rows.
pub async fn populate_events(
    db: &Db,
    filter_id: &str,
    filter: &Filter,
    range: BlockRange,
) -> Result<u64> {
    let chain_id = filter.chain_id();
    let lo = range.0.max(filter.from_block());
    let hi = filter.to_block().map(|t| range.1.min(t)).unwrap_or(range.1);
    if lo > hi {
        return Ok(0);
    }

    let inserted = match filter {
        Filter::Log(f) => {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "insert into sync.event (filter_id, checkpoint, chain_id, block_number, block_hash, log_index, transaction_hash, data) \
                 select ",
            );
            qb.push_bind(filter_id);
            qb.push(format!(", {}", checkpoint_expr("b.timestamp", "l.chain_id", "l.block_number", "l.transaction_index", 0, "l.log_index")));
            qb.push(
                ", l.chain_id, l.block_number, l.block_hash, l.log_index, l.transaction_hash, l.body \
                 from sync.log l \
                 join sync.block b on b.chain_id = l.chain_id and b.hash = l.block_hash \
                 where l.chain_id = ",
            );
            qb.push_bind(to_i64(chain_id)?);
            qb.push(" and l.block_number between ");
            qb.push_bind(lo as i64);
            qb.push(" and ");
            qb.push_bind(hi as i64);

            if let Some(address) = &f.address {
                push_address_predicate(&mut qb, chain_id, address);
            }
            let topic_columns = ["topic0", "topic1", "topic2", "topic3"];
            for (i, col) in topic_columns.iter().enumerate() {
                if let Some(constraint) = &f.topics[i] {
                    push_topic_predicate(&mut qb, col, constraint);
                }
            }
            qb.push(" on conflict (filter_id, checkpoint) do nothing");
            qb.build().execute(&db.pool).await.context("populate log events")?.rows_affected()
        }
        Filter::Block(f) => {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "insert into sync.event (filter_id, checkpoint, chain_id, block_number, block_hash, log_index, transaction_hash, data) \
                 select ",
            );
            qb.push_bind(filter_id);
            qb.push(format!(
                ", lpad(b.timestamp::text, 10, '0') || lpad(b.chain_id::text, 16, '0') || \
                   lpad(b.number::text, 16, '0') || lpad('9999999999999999', 16, '0') || '1' || lpad('0', 16, '0')"
            ));
            qb.push(
                ", b.chain_id, b.number, b.hash, null, null, b.body \
                 from sync.block b \
                 where b.chain_id = ",
            );
            qb.push_bind(to_i64(chain_id)?);
            qb.push(" and b.number between ");
            qb.push_bind(lo as i64);
            qb.push(" and ");
            qb.push_bind(hi as i64);
            qb.push(" and mod(b.number - ");
            qb.push_bind(f.offset as i64);
            qb.push(", ");
            qb.push_bind(f.interval.max(1) as i64);
            qb.push(") = 0");
            qb.push(" on conflict (filter_id, checkpoint) do nothing");
            qb.build().execute(&db.pool).await.context("populate block events")?.rows_affected()
        }
    };

    Ok(inserted)
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    pub filter_id: String,
    pub checkpoint: String,
    pub chain_id: i64,
    pub block_number: i64,
    pub block_hash: String,
    pub log_index: Option<i64>,
    pub transaction_hash: Option<String>,
    pub data: serde_json::Value,
}

pub async fn get_events(
    db: &Db,
    filter_ids: &[String],
    from_checkpoint: &str,
    to_checkpoint: &str,
    limit: i64,
) -> Result<Vec<EventRow>> {
    let rows = sqlx::query_as::<Postgres, EventRow>(
        "select filter_id, checkpoint, chain_id, block_number, block_hash, log_index, transaction_hash, data \
         from sync.event \
         where filter_id = any($1) and checkpoint > $2 and checkpoint <= $3 \
         order by checkpoint asc, filter_id asc limit $4",
    )
    .bind(filter_ids)
    .bind(from_checkpoint)
    .bind(to_checkpoint)
    .bind(limit)
    .fetch_all(&db.pool)
    .await
    .context("read sync.event")?;
    Ok(rows)
}

/// Advisory count, not guaranteed exact under concurrent writes.
pub async fn get_event_count(db: &Db, filter_ids: &[String]) -> Result<u64> {
    let count: i64 = sqlx::query_scalar("select count(*) from sync.event where filter_id = any($1)")
        .bind(filter_ids)
        .fetch_one(&db.pool)
        .await
        .context("count sync.event")?;
    Ok(count as u64)
}

// ---------------------------------------------------------------------------
// RPC result cache
// ---------------------------------------------------------------------------

pub async fn insert_rpc_request_result(
    db: &Db,
    chain_id: u64,
    request: &str,
    block_number: Option<u64>,
    result: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        "insert into sync.rpc_request_results (chain_id, request, block_number, result) values ($1, $2, $3, $4) \
         on conflict (chain_id, request) do nothing",
    )
    .bind(to_i64(chain_id)?)
    .bind(request)
    .bind(block_number.map(|b| b as i64))
    .bind(sqlx::types::Json(result))
    .execute(&db.pool)
    .await
    .context("insert sync.rpc_request_results")?;
    Ok(())
}

pub async fn get_rpc_request_result(
    db: &Db,
    chain_id: u64,
    request: &str,
) -> Result<Option<serde_json::Value>> {
    let row: Option<sqlx::types::Json<serde_json::Value>> = sqlx::query_scalar(
        "select result from sync.rpc_request_results where chain_id = $1 and request = $2",
    )
    .bind(to_i64(chain_id)?)
    .bind(request)
    .fetch_optional(&db.pool)
    .await
    .context("read sync.rpc_request_results")?;
    Ok(row.map(|sqlx::types::Json(v)| v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_expr_embeds_event_type_digit() {
        let e = checkpoint_expr("b.timestamp", "l.chain_id", "l.block_number", "tx.transaction_index", 0, "l.log_index");
        assert!(e.contains("'0'"));
        let e = checkpoint_expr("b.timestamp", "l.chain_id", "l.block_number", "tx.transaction_index", 5, "l.log_index");
        assert!(e.contains("'5'"));
    }
}
