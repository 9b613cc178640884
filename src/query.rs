//! Read helpers over the durable `matrices` relation
//!
//! Every function takes the session explicitly and filters on it; there is
//! no unscoped read in this crate.

use crate::error::MatrixResult;
use crate::types::{MatrixGrid, MatrixType, SessionKey};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;

/// Which stamp column locates an anchor tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorStamp {
    Opening,
    Snapshot,
    Trade,
}

impl AnchorStamp {
    // Opening takes the earliest stamped tick (a replica race may leave two),
    // snapshot and trade take the most recent one.
    fn locate_sql(&self) -> &'static str {
        match self {
            AnchorStamp::Opening => {
                "SELECT tick_ts, opening_ts FROM matrices
                 WHERE session_key = ?1 AND matrix_type = 'benchmark'
                   AND opening_stamp = 1 AND tick_ts <= ?2
                 ORDER BY tick_ts ASC LIMIT 1"
            }
            AnchorStamp::Snapshot => {
                "SELECT tick_ts, snapshot_ts FROM matrices
                 WHERE session_key = ?1 AND matrix_type = 'benchmark'
                   AND snapshot_stamp = 1 AND tick_ts <= ?2
                 ORDER BY tick_ts DESC LIMIT 1"
            }
            AnchorStamp::Trade => {
                "SELECT tick_ts, trade_ts FROM matrices
                 WHERE session_key = ?1 AND matrix_type = 'benchmark'
                   AND trade_stamp = 1 AND tick_ts <= ?2
                 ORDER BY tick_ts DESC LIMIT 1"
            }
        }
    }
}

/// Stamped benchmark tick and the stamp's own timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorTick {
    pub tick_ts: i64,
    pub stamp_ts: i64,
}

pub fn anchor_tick(
    conn: &Connection,
    session: &SessionKey,
    stamp: AnchorStamp,
    now_ts: i64,
) -> MatrixResult<Option<AnchorTick>> {
    let found = conn
        .prepare_cached(stamp.locate_sql())?
        .query_row(params![session, now_ts], |row| {
            let tick_ts: i64 = row.get(0)?;
            let stamp_ts: Option<i64> = row.get(1)?;
            Ok(AnchorTick {
                tick_ts,
                stamp_ts: stamp_ts.unwrap_or(tick_ts),
            })
        })
        .optional()?;
    Ok(found)
}

/// Latest tick of `matrix_type` for the session, optionally at-or-before `at_or_before`
pub fn latest_tick_ts(
    conn: &Connection,
    session: &SessionKey,
    matrix_type: MatrixType,
    at_or_before: Option<i64>,
) -> MatrixResult<Option<i64>> {
    let ts = conn
        .prepare_cached(
            "SELECT MAX(tick_ts) FROM matrices
             WHERE session_key = ?1 AND matrix_type = ?2 AND tick_ts <= ?3",
        )?
        .query_row(
            params![session, matrix_type, at_or_before.unwrap_or(i64::MAX)],
            |row| row.get::<_, Option<i64>>(0),
        )?;
    Ok(ts)
}

/// Grid of `matrix_type` at exactly `tick_ts`, aligned with `coins`
///
/// Rows for coins outside `coins` are ignored.
pub fn grid_at(
    conn: &Connection,
    session: &SessionKey,
    matrix_type: MatrixType,
    tick_ts: i64,
    coins: &[String],
) -> MatrixResult<MatrixGrid> {
    let index = coin_index(coins);
    let mut grid = MatrixGrid::empty(coins.len());

    let mut stmt = conn.prepare_cached(
        "SELECT base, quote, value FROM matrices
         WHERE session_key = ?1 AND matrix_type = ?2 AND tick_ts = ?3",
    )?;
    let mut rows = stmt.query(params![session, matrix_type, tick_ts])?;
    while let Some(row) = rows.next()? {
        let base: String = row.get(0)?;
        let quote: String = row.get(1)?;
        if let (Some(&i), Some(&j)) = (index.get(base.as_str()), index.get(quote.as_str())) {
            grid.set(i, j, row.get(2)?);
        }
    }

    Ok(grid)
}

/// Per-pair latest value strictly before `before_ts`
pub fn latest_values_before(
    conn: &Connection,
    session: &SessionKey,
    matrix_type: MatrixType,
    before_ts: i64,
    coins: &[String],
) -> MatrixResult<MatrixGrid> {
    let index = coin_index(coins);
    let mut grid = MatrixGrid::empty(coins.len());

    let mut stmt = conn.prepare_cached(
        r#"
        SELECT m.base, m.quote, m.value
        FROM matrices m
        JOIN (
            SELECT base, quote, MAX(tick_ts) AS last_ts
            FROM matrices
            WHERE session_key = ?1 AND matrix_type = ?2 AND tick_ts < ?3
            GROUP BY base, quote
        ) latest
          ON m.base = latest.base AND m.quote = latest.quote AND m.tick_ts = latest.last_ts
        WHERE m.session_key = ?1 AND m.matrix_type = ?2
        "#,
    )?;
    let mut rows = stmt.query(params![session, matrix_type, before_ts])?;
    while let Some(row) = rows.next()? {
        let base: String = row.get(0)?;
        let quote: String = row.get(1)?;
        if let (Some(&i), Some(&j)) = (index.get(base.as_str()), index.get(quote.as_str())) {
            grid.set(i, j, row.get(2)?);
        }
    }

    Ok(grid)
}

/// Single-pair latest value strictly before `before_ts`
pub fn latest_value_before(
    conn: &Connection,
    session: &SessionKey,
    matrix_type: MatrixType,
    base: &str,
    quote: &str,
    before_ts: i64,
) -> MatrixResult<Option<f64>> {
    let value = conn
        .prepare_cached(
            "SELECT value FROM matrices
             WHERE session_key = ?1 AND matrix_type = ?2 AND base = ?3 AND quote = ?4
               AND tick_ts < ?5
             ORDER BY tick_ts DESC LIMIT 1",
        )?
        .query_row(params![session, matrix_type, base, quote, before_ts], |row| {
            row.get::<_, f64>(0)
        })
        .optional()?;
    Ok(value)
}

/// Most recent `limit` (tick_ts, value) points for one cell, oldest first
pub fn cell_history(
    conn: &Connection,
    session: &SessionKey,
    matrix_type: MatrixType,
    base: &str,
    quote: &str,
    limit: usize,
) -> MatrixResult<Vec<(i64, f64)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT tick_ts, value FROM matrices
         WHERE session_key = ?1 AND matrix_type = ?2 AND base = ?3 AND quote = ?4
         ORDER BY tick_ts DESC LIMIT ?5",
    )?;
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut points = stmt
        .query_map(params![session, matrix_type, base, quote, limit], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?
        .collect::<Result<Vec<(i64, f64)>, _>>()?;
    points.reverse();
    Ok(points)
}

/// Number of distinct benchmark ticks carrying an opening stamp
pub fn opening_stamp_count(conn: &Connection, session: &SessionKey) -> MatrixResult<i64> {
    let count = conn
        .prepare_cached(
            "SELECT COUNT(DISTINCT tick_ts) FROM matrices
             WHERE session_key = ?1 AND matrix_type = 'benchmark' AND opening_stamp = 1",
        )?
        .query_row(params![session], |row| row.get(0))?;
    Ok(count)
}

fn coin_index(coins: &[String]) -> HashMap<&str, usize> {
    coins
        .iter()
        .enumerate()
        .map(|(i, c)| (c.as_str(), i))
        .collect()
}
