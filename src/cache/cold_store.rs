// =============================================================================
// Cold Store — durable keyed OHLCV storage (SQLite)
// =============================================================================
//
// The bottom tier of the bar cache.  Bars are keyed on
// (symbol, timeframe, ts_event) with per-series metadata maintained inside
// the same transaction as every batch write.  WAL mode keeps reads from
// blocking writes.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{debug, info};

use crate::market_data::{aggregate_bars, timeframe_minutes, Bar};

/// Schema. `ts_event` is integer milliseconds since the UNIX epoch.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS bars (
    symbol     TEXT NOT NULL,
    timeframe  TEXT NOT NULL,
    ts_event   INTEGER NOT NULL,
    open       REAL NOT NULL,
    high       REAL NOT NULL,
    low        REAL NOT NULL,
    close      REAL NOT NULL,
    volume     INTEGER NOT NULL,
    PRIMARY KEY (symbol, timeframe, ts_event)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_bars_series_desc
    ON bars(symbol, timeframe, ts_event DESC);

CREATE TABLE IF NOT EXISTS bar_metadata (
    symbol       TEXT NOT NULL,
    timeframe    TEXT NOT NULL,
    last_updated INTEGER NOT NULL,
    bar_count    INTEGER NOT NULL,
    oldest_ts    INTEGER,
    newest_ts    INTEGER,
    PRIMARY KEY (symbol, timeframe)
) WITHOUT ROWID;
"#;

/// Per-series stats from the metadata table.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesStats {
    pub symbol: String,
    pub timeframe: String,
    pub bar_count: i64,
    pub oldest_ts: Option<i64>,
    pub newest_ts: Option<i64>,
    pub last_updated: i64,
}

/// Store-wide summary for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct StoreSummary {
    pub total_series: usize,
    pub total_bars: i64,
    pub db_size_bytes: i64,
    pub series: Vec<SeriesStats>,
}

/// Durable bar storage. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct ColdStore {
    conn: Arc<Mutex<Connection>>,
}

impl ColdStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open cold store at {path}"))?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory cold store")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply cold store schema")?;
        info!("cold store ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Upsert a batch of bars in a single transaction and refresh the
    /// series metadata. Returns the number of bars written.
    ///
    /// On error nothing is committed; the caller still owns `bars` and
    /// decides whether to retry.
    pub fn store(&self, symbol: &str, timeframe: &str, bars: &[Bar], now_ms: i64) -> Result<usize> {
        if bars.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("failed to begin bar write")?;

        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO bars (symbol, timeframe, ts_event, open, high, low, close, volume)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(symbol, timeframe, ts_event) DO UPDATE SET
                         open = excluded.open, high = excluded.high,
                         low = excluded.low, close = excluded.close,
                         volume = excluded.volume",
                )
                .context("failed to prepare bar insert")?;

            for bar in bars {
                stmt.execute(params![
                    symbol,
                    timeframe,
                    bar.ts_event,
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume as i64,
                ])
                .context("failed to insert bar")?;
            }
        }

        tx.execute(
            "INSERT INTO bar_metadata (symbol, timeframe, last_updated, bar_count, oldest_ts, newest_ts)
             SELECT ?1, ?2, ?3,
                    COUNT(*), MIN(ts_event), MAX(ts_event)
             FROM bars WHERE symbol = ?1 AND timeframe = ?2
             ON CONFLICT(symbol, timeframe) DO UPDATE SET
                 last_updated = excluded.last_updated,
                 bar_count = excluded.bar_count,
                 oldest_ts = excluded.oldest_ts,
                 newest_ts = excluded.newest_ts",
            params![symbol, timeframe, now_ms],
        )
        .context("failed to refresh bar metadata")?;

        tx.commit().context("failed to commit bar batch")?;

        debug!(symbol, timeframe, count = bars.len(), "bar batch stored");
        Ok(bars.len())
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Bars for a series ordered ascending by `ts_event`, optionally bounded
    /// by `[start_ts, end_ts]` and `limit`.
    pub fn get(
        &self,
        symbol: &str,
        timeframe: &str,
        start_ts: Option<i64>,
        end_ts: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<Bar>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT ts_event, open, high, low, close, volume FROM bars
                 WHERE symbol = ?1 AND timeframe = ?2
                   AND ts_event >= ?3 AND ts_event <= ?4
                 ORDER BY ts_event ASC
                 LIMIT ?5",
            )
            .context("failed to prepare bar select")?;

        let rows = stmt
            .query_map(
                params![
                    symbol,
                    timeframe,
                    start_ts.unwrap_or(i64::MIN),
                    end_ts.unwrap_or(i64::MAX),
                    limit.map(|l| l as i64).unwrap_or(i64::MAX),
                ],
                |row| {
                    Ok(Bar {
                        ts_event: row.get(0)?,
                        open: row.get(1)?,
                        high: row.get(2)?,
                        low: row.get(3)?,
                        close: row.get(4)?,
                        volume: row.get::<_, i64>(5)?.max(0) as u64,
                    })
                },
            )
            .context("failed to query bars")?;

        let mut bars = Vec::new();
        for row in rows {
            bars.push(row.context("failed to read bar row")?);
        }
        Ok(bars)
    }

    /// Newest stored bar timestamp for a series, if any.
    pub fn newest_ts(&self, symbol: &str, timeframe: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let ts: Option<i64> = conn
            .query_row(
                "SELECT newest_ts FROM bar_metadata WHERE symbol = ?1 AND timeframe = ?2",
                params![symbol, timeframe],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("failed to read series metadata")?
            .flatten();
        Ok(ts)
    }

    // -------------------------------------------------------------------------
    // Aggregation
    // -------------------------------------------------------------------------

    /// Build `dst_timeframe` bars from `src_timeframe` via the chunked OHLCV
    /// reduce, persist them under the destination series, and return them.
    /// Only complete chunks are emitted, so re-running over the same source
    /// range produces identical rows.
    pub fn aggregate(
        &self,
        symbol: &str,
        src_timeframe: &str,
        dst_timeframe: &str,
        multiplier: usize,
        now_ms: i64,
    ) -> Result<Vec<Bar>> {
        let src_minutes = timeframe_minutes(src_timeframe)
            .with_context(|| format!("unknown source timeframe {src_timeframe}"))?;

        let source = self.get(symbol, src_timeframe, None, None, None)?;
        let aggregated = aggregate_bars(&source, src_minutes * 60_000, multiplier);

        if !aggregated.is_empty() {
            self.store(symbol, dst_timeframe, &aggregated, now_ms)?;
        }

        info!(
            symbol,
            src = src_timeframe,
            dst = dst_timeframe,
            source_bars = source.len(),
            aggregated_bars = aggregated.len(),
            "timeframe aggregation complete"
        );
        Ok(aggregated)
    }

    // -------------------------------------------------------------------------
    // Summary
    // -------------------------------------------------------------------------

    /// Store-wide totals plus per-series stats.
    pub fn summary(&self) -> Result<StoreSummary> {
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare_cached(
                "SELECT symbol, timeframe, bar_count, oldest_ts, newest_ts, last_updated
                 FROM bar_metadata ORDER BY symbol, timeframe",
            )
            .context("failed to prepare metadata select")?;

        let rows = stmt
            .query_map([], |row| {
                Ok(SeriesStats {
                    symbol: row.get(0)?,
                    timeframe: row.get(1)?,
                    bar_count: row.get(2)?,
                    oldest_ts: row.get(3)?,
                    newest_ts: row.get(4)?,
                    last_updated: row.get(5)?,
                })
            })
            .context("failed to query metadata")?;

        let mut series = Vec::new();
        for row in rows {
            series.push(row.context("failed to read metadata row")?);
        }

        let total_bars: i64 = series.iter().map(|s| s.bar_count).sum();

        let page_count: i64 = conn
            .query_row("PRAGMA page_count", [], |row| row.get(0))
            .unwrap_or(0);
        let page_size: i64 = conn
            .query_row("PRAGMA page_size", [], |row| row.get(0))
            .unwrap_or(0);

        Ok(StoreSummary {
            total_series: series.len(),
            total_bars,
            db_size_bytes: page_count * page_size,
            series,
        })
    }
}
