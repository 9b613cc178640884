//! Matrix commit publisher
//!
//! Moves staged rows for one (tick_ts, matrix_type, session) into the
//! durable `matrices` relation with the same merge rules as staging, then
//! clears them from staging. Completeness is reported, never enforced:
//! whatever is staged gets published.

use crate::error::MatrixResult;
use crate::types::{MatrixType, SessionKey};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};

const PUBLISH_SQL: &str = r#"
    INSERT INTO matrices (
        tick_ts, matrix_type, base, quote, session_key, value, meta,
        opening_stamp, opening_ts, snapshot_stamp, snapshot_ts, trade_stamp, trade_ts
    )
    SELECT
        tick_ts, matrix_type, base, quote, session_key, value, meta,
        opening_stamp, opening_ts, snapshot_stamp, snapshot_ts, trade_stamp, trade_ts
    FROM matrices_staging
    WHERE tick_ts = ?1 AND matrix_type = ?2 AND session_key = ?3
    ON CONFLICT(tick_ts, matrix_type, base, quote, session_key) DO UPDATE SET
        value = excluded.value,
        meta = excluded.meta,
        opening_stamp = MAX(matrices.opening_stamp, excluded.opening_stamp),
        opening_ts = COALESCE(matrices.opening_ts, excluded.opening_ts),
        snapshot_stamp = MAX(matrices.snapshot_stamp, excluded.snapshot_stamp),
        snapshot_ts = COALESCE(matrices.snapshot_ts, excluded.snapshot_ts),
        trade_stamp = MAX(matrices.trade_stamp, excluded.trade_stamp),
        trade_ts = COALESCE(matrices.trade_ts, excluded.trade_ts)
"#;

/// Completeness diagnostic for one committed matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitReport {
    pub expected_cells: usize,
    pub staged_cells: usize,
    pub missing_count: usize,
    pub complete: bool,
}

/// Commit inside a transaction the caller already owns
///
/// `conn` is typically a `rusqlite::Transaction`; nothing here begins or
/// ends a transaction. `eligible_coins` defaults to every base/quote seen in
/// the staged rows.
pub fn commit_in(
    conn: &Connection,
    session: &SessionKey,
    matrix_type: MatrixType,
    tick_ts: i64,
    eligible_coins: Option<&[String]>,
) -> MatrixResult<CommitReport> {
    let staged: HashSet<(String, String)> = {
        let mut stmt = conn.prepare_cached(
            "SELECT base, quote FROM matrices_staging
             WHERE tick_ts = ?1 AND matrix_type = ?2 AND session_key = ?3",
        )?;
        let rows = stmt.query_map(params![tick_ts, matrix_type, session], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        rows.collect::<Result<_, _>>()?
    };

    let eligible: BTreeSet<String> = match eligible_coins {
        Some(coins) => coins.iter().cloned().collect(),
        None => staged
            .iter()
            .flat_map(|(base, quote)| [base.clone(), quote.clone()])
            .collect(),
    };

    let report = completeness(&eligible, &staged);

    let published = conn
        .prepare_cached(PUBLISH_SQL)?
        .execute(params![tick_ts, matrix_type, session])?;

    conn.prepare_cached(
        "DELETE FROM matrices_staging
         WHERE tick_ts = ?1 AND matrix_type = ?2 AND session_key = ?3",
    )?
    .execute(params![tick_ts, matrix_type, session])?;

    if report.complete {
        log::debug!(
            "Committed {} {} cells @ {} ({})",
            published,
            matrix_type,
            tick_ts,
            session
        );
    } else {
        log::warn!(
            "⚠️  Incomplete {} commit @ {} ({}): staged {}/{} expected, {} missing",
            matrix_type,
            tick_ts,
            session,
            report.staged_cells,
            report.expected_cells,
            report.missing_count
        );
    }

    Ok(report)
}

/// Commit in a transaction of its own; any error rolls everything back
pub fn commit_matrix(
    conn: &mut Connection,
    session: &SessionKey,
    matrix_type: MatrixType,
    tick_ts: i64,
    eligible_coins: Option<&[String]>,
) -> MatrixResult<CommitReport> {
    let tx = conn.transaction()?;
    let report = commit_in(&tx, session, matrix_type, tick_ts, eligible_coins)?;
    tx.commit()?;
    Ok(report)
}

fn completeness(eligible: &BTreeSet<String>, staged: &HashSet<(String, String)>) -> CommitReport {
    let n = eligible.len();
    let expected_cells = n * n.saturating_sub(1);

    let mut missing_count = 0;
    for base in eligible {
        for quote in eligible {
            if base != quote && !staged.contains(&(base.clone(), quote.clone())) {
                missing_count += 1;
            }
        }
    }

    let staged_cells = staged.len();
    CommitReport {
        expected_cells,
        staged_cells,
        missing_count,
        complete: missing_count == 0 && staged_cells == expected_cells,
    }
}
