//! Stamp coordinator: opening / snapshot / trade anchors per session
//!
//! The opening stamp is a memoized DB check. The memo lives behind the
//! `StampCache` trait so it can be process-local or shared. Without a
//! distributed lock two replicas can both stamp "opening" for one session;
//! the only effect is a slightly different `ref` anchor.

use crate::error::MatrixResult;
use crate::types::{MatrixType, SessionKey, StampFlags};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Remembers which sessions already have an opening stamp
pub trait StampCache: Send + Sync {
    fn is_stamped(&self, session: &SessionKey) -> bool;
    fn mark_stamped(&self, session: &SessionKey);
}

/// In-process `StampCache`
#[derive(Debug, Default)]
pub struct LocalStampCache {
    sessions: Mutex<HashSet<SessionKey>>,
}

impl LocalStampCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StampCache for LocalStampCache {
    fn is_stamped(&self, session: &SessionKey) -> bool {
        // A poisoned set is still a valid set of strings
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.contains(session)
    }

    fn mark_stamped(&self, session: &SessionKey) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.insert(session.clone());
    }
}

/// Anchors that can be stamped after the fact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorKind {
    Snapshot,
    Trade,
}

impl AnchorKind {
    fn update_sql(&self) -> &'static str {
        match self {
            AnchorKind::Snapshot => {
                "UPDATE matrices
                 SET snapshot_stamp = 1, snapshot_ts = COALESCE(snapshot_ts, ?3)
                 WHERE session_key = ?1 AND matrix_type = 'benchmark' AND tick_ts = ?2"
            }
            AnchorKind::Trade => {
                "UPDATE matrices
                 SET trade_stamp = 1, trade_ts = COALESCE(trade_ts, ?3)
                 WHERE session_key = ?1 AND matrix_type = 'benchmark' AND tick_ts = ?2"
            }
        }
    }

    fn label(&self) -> &'static str {
        match self {
            AnchorKind::Snapshot => "snapshot",
            AnchorKind::Trade => "trade",
        }
    }
}

/// Outcome of a snapshot/trade stamp request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StampResult {
    pub ok: bool,
    pub stamped_count: usize,
    pub tick_ts: Option<i64>,
}

pub struct StampCoordinator {
    cache: Arc<dyn StampCache>,
}

impl StampCoordinator {
    pub fn new(cache: Arc<dyn StampCache>) -> Self {
        Self { cache }
    }

    /// Stamp flags for the benchmark stage of `tick_ts`
    ///
    /// Returns an opening stamp only when neither the memo nor durable state
    /// knows one for this session. The memo is not updated here; call
    /// `confirm_opening` once the tick's transaction has committed, so a
    /// rolled-back tick does not burn the opening.
    pub fn benchmark_stamps(
        &self,
        conn: &Connection,
        session: &SessionKey,
        tick_ts: i64,
    ) -> MatrixResult<StampFlags> {
        if self.cache.is_stamped(session) {
            return Ok(StampFlags::none());
        }

        if has_opening_stamp(conn, session)? {
            log::debug!("Opening stamp already present for {}", session);
            self.cache.mark_stamped(session);
            return Ok(StampFlags::none());
        }

        log::info!("📌 Opening stamp for {} @ {}", session, tick_ts);
        Ok(StampFlags::opening(tick_ts))
    }

    pub fn confirm_opening(&self, session: &SessionKey) {
        self.cache.mark_stamped(session);
    }

    pub fn stamp_snapshot(
        &self,
        conn: &Connection,
        session: &SessionKey,
        target_ts: i64,
    ) -> MatrixResult<StampResult> {
        stamp_anchor(conn, session, AnchorKind::Snapshot, target_ts)
    }

    pub fn stamp_trade(
        &self,
        conn: &Connection,
        session: &SessionKey,
        trade_ts: i64,
    ) -> MatrixResult<StampResult> {
        stamp_anchor(conn, session, AnchorKind::Trade, trade_ts)
    }
}

fn has_opening_stamp(conn: &Connection, session: &SessionKey) -> MatrixResult<bool> {
    let mut stmt = conn.prepare_cached(
        "SELECT 1 FROM matrices
         WHERE session_key = ?1 AND matrix_type = ?2 AND opening_stamp = 1
         LIMIT 1",
    )?;
    Ok(stmt.exists(params![session, MatrixType::Benchmark])?)
}

/// Mark the latest benchmark tick at-or-before `target_ts`
///
/// Rows already stamped keep their first timestamp.
fn stamp_anchor(
    conn: &Connection,
    session: &SessionKey,
    kind: AnchorKind,
    target_ts: i64,
) -> MatrixResult<StampResult> {
    let tick_ts: Option<i64> = conn
        .query_row(
            "SELECT MAX(tick_ts) FROM matrices
             WHERE session_key = ?1 AND matrix_type = ?2 AND tick_ts <= ?3",
            params![session, MatrixType::Benchmark, target_ts],
            |row| row.get::<_, Option<i64>>(0),
        )
        .optional()?
        .flatten();

    let Some(tick_ts) = tick_ts else {
        log::warn!(
            "⚠️  No benchmark tick at or before {} for {} stamp ({})",
            target_ts,
            kind.label(),
            session
        );
        return Ok(StampResult {
            ok: false,
            stamped_count: 0,
            tick_ts: None,
        });
    };

    let stamped_count = conn
        .prepare_cached(kind.update_sql())?
        .execute(params![session, tick_ts, target_ts])?;

    log::info!(
        "📌 {} stamp for {}: {} cells @ tick {}",
        kind.label(),
        session,
        stamped_count,
        tick_ts
    );

    Ok(StampResult {
        ok: true,
        stamped_count,
        tick_ts: Some(tick_ts),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::commit_matrix;
    use crate::db::apply_embedded_schema;
    use crate::stage::stage_matrix;
    use crate::types::MatrixGrid;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        apply_embedded_schema(&conn).unwrap();
        conn
    }

    fn write_benchmark(
        conn: &mut Connection,
        session: &SessionKey,
        tick_ts: i64,
        stamps: StampFlags,
    ) {
        let coins = vec!["USDT".to_string(), "BTC".to_string()];
        let rows = vec![vec![None, Some(0.5)], vec![Some(2.0), None]];
        let grid = MatrixGrid::from_rows(rows).unwrap();
        stage_matrix(conn, session, MatrixType::Benchmark, tick_ts, &coins, &grid, None, stamps)
            .unwrap();
        commit_matrix(conn, session, MatrixType::Benchmark, tick_ts, None).unwrap();
    }

    #[test]
    fn test_opening_stamp_only_once_per_session() {
        let mut conn = setup();
        let coordinator = StampCoordinator::new(Arc::new(LocalStampCache::new()));
        let session = SessionKey::new("s1");

        let first = coordinator.benchmark_stamps(&conn, &session, 100).unwrap();
        assert_eq!(first, StampFlags::opening(100));
        write_benchmark(&mut conn, &session, 100, first);
        coordinator.confirm_opening(&session);

        let second = coordinator.benchmark_stamps(&conn, &session, 200).unwrap();
        assert_eq!(second, StampFlags::none());
    }

    #[test]
    fn test_existing_durable_stamp_is_respected_by_fresh_process() {
        let mut conn = setup();
        let session = SessionKey::new("s1");
        write_benchmark(&mut conn, &session, 100, StampFlags::opening(100));

        // New coordinator, empty memo: the DB check must find the stamp
        let cache = Arc::new(LocalStampCache::new());
        let coordinator = StampCoordinator::new(cache.clone());
        let flags = coordinator.benchmark_stamps(&conn, &session, 200).unwrap();

        assert_eq!(flags, StampFlags::none());
        assert!(cache.is_stamped(&session));

        // Other sessions are unaffected
        let other = coordinator.benchmark_stamps(&conn, &SessionKey::new("s2"), 200).unwrap();
        assert_eq!(other, StampFlags::opening(200));
    }

    #[test]
    fn test_snapshot_stamp_targets_latest_tick_at_or_before() {
        let mut conn = setup();
        let coordinator = StampCoordinator::new(Arc::new(LocalStampCache::new()));
        let session = SessionKey::new("s1");
        write_benchmark(&mut conn, &session, 100, StampFlags::none());
        write_benchmark(&mut conn, &session, 200, StampFlags::none());
        write_benchmark(&mut conn, &session, 300, StampFlags::none());

        let result = coordinator.stamp_snapshot(&conn, &session, 250).unwrap();
        assert_eq!(
            result,
            StampResult {
                ok: true,
                stamped_count: 2,
                tick_ts: Some(200)
            }
        );

        // Second stamp on the same tick keeps the first timestamp
        coordinator.stamp_snapshot(&conn, &session, 299).unwrap();
        let ts: i64 = conn
            .query_row(
                "SELECT DISTINCT snapshot_ts FROM matrices WHERE tick_ts = 200",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(ts, 250);
    }

    #[test]
    fn test_trade_stamp_independent_of_snapshot() {
        let mut conn = setup();
        let coordinator = StampCoordinator::new(Arc::new(LocalStampCache::new()));
        let session = SessionKey::new("s1");
        write_benchmark(&mut conn, &session, 100, StampFlags::none());

        coordinator.stamp_trade(&conn, &session, 150).unwrap();

        let (snap, trade, trade_ts): (bool, bool, Option<i64>) = conn
            .query_row(
                "SELECT MAX(snapshot_stamp), MAX(trade_stamp), MAX(trade_ts) FROM matrices",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert!(!snap);
        assert!(trade);
        assert_eq!(trade_ts, Some(150));
    }

    #[test]
    fn test_stamp_without_benchmark_is_not_ok() {
        let conn = setup();
        let coordinator = StampCoordinator::new(Arc::new(LocalStampCache::new()));
        let result = coordinator.stamp_snapshot(&conn, &SessionKey::new("nobody"), 1_000).unwrap();
        assert!(!result.ok);
        assert_eq!(result.stamped_count, 0);
        assert_eq!(result.tick_ts, None);
    }
}
