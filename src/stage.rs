//! Matrix stage writer
//!
//! Buffers one tick's cells in `matrices_staging`. Staging is an UPSERT on
//! (tick_ts, matrix_type, base, quote, session_key):
//! - `value` / `meta` are overwritten (last write for the tick wins)
//! - stamp booleans are OR-combined
//! - stamp timestamps keep the existing value, else take the new one
//!
//! Re-staging the same tick with the same inputs leaves identical rows.

use crate::error::{MatrixError, MatrixResult};
use crate::types::{MatrixGrid, MatrixType, SessionKey, StampFlags};
use rusqlite::{params, Connection};

const STAGE_SQL: &str = r#"
    INSERT INTO matrices_staging (
        tick_ts, matrix_type, base, quote, session_key, value, meta,
        opening_stamp, opening_ts, snapshot_stamp, snapshot_ts, trade_stamp, trade_ts
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
    ON CONFLICT(tick_ts, matrix_type, base, quote, session_key) DO UPDATE SET
        value = excluded.value,
        meta = excluded.meta,
        opening_stamp = MAX(matrices_staging.opening_stamp, excluded.opening_stamp),
        opening_ts = COALESCE(matrices_staging.opening_ts, excluded.opening_ts),
        snapshot_stamp = MAX(matrices_staging.snapshot_stamp, excluded.snapshot_stamp),
        snapshot_ts = COALESCE(matrices_staging.snapshot_ts, excluded.snapshot_ts),
        trade_stamp = MAX(matrices_staging.trade_stamp, excluded.trade_stamp),
        trade_ts = COALESCE(matrices_staging.trade_ts, excluded.trade_ts)
"#;

/// Stage every finite off-diagonal cell of `grid`
///
/// Missing and non-finite cells are skipped silently. Returns the number of
/// staged cells; 0 means nothing was written, which is not an error.
///
/// Runs on whatever connection it is given, so callers that pass a
/// `Transaction` get the writes inside that transaction.
#[allow(clippy::too_many_arguments)]
pub fn stage_matrix(
    conn: &Connection,
    session: &SessionKey,
    matrix_type: MatrixType,
    tick_ts: i64,
    coins: &[String],
    grid: &MatrixGrid,
    meta: Option<&str>,
    stamps: StampFlags,
) -> MatrixResult<usize> {
    if grid.size() != coins.len() {
        return Err(MatrixError::InvalidSnapshot(format!(
            "{} grid is {}x{} but universe has {} coins",
            matrix_type,
            grid.size(),
            grid.size(),
            coins.len()
        )));
    }

    if grid.filled() == 0 {
        log::debug!("Nothing to stage for {} @ {} ({})", matrix_type, tick_ts, session);
        return Ok(0);
    }

    let mut stmt = conn.prepare_cached(STAGE_SQL)?;
    let mut staged = 0;

    for (i, base) in coins.iter().enumerate() {
        for (j, quote) in coins.iter().enumerate() {
            let Some(value) = grid.get(i, j) else {
                continue;
            };

            stmt.execute(params![
                tick_ts,
                matrix_type,
                base,
                quote,
                session,
                value,
                meta,
                stamps.opening.is_some(),
                stamps.opening,
                stamps.snapshot.is_some(),
                stamps.snapshot,
                stamps.trade.is_some(),
                stamps.trade,
            ])?;
            staged += 1;
        }
    }

    log::debug!("Staged {} {} cells @ {} ({})", staged, matrix_type, tick_ts, session);
    Ok(staged)
}
