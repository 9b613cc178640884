//! Durable matrix store
//!
//! Owns the SQLite connection and runs the per-tick persistence protocol:
//!
//! ```text
//! BEGIN
//!   stage(benchmark, +opening stamp if first) → commit(benchmark)
//!   stage(pct24h)                             → commit(pct24h)
//!   derived engine reads committed history (strictly before tick)
//!   stage(derived...)                         → commit(derived...)
//! COMMIT   (any error → ROLLBACK, previous tick stays the latest)
//! ```
//!
//! Every statement is filtered on `session_key`.

use crate::commit::{commit_in, commit_matrix, CommitReport};
use crate::db::{self, Relation};
use crate::derived::DerivedEngine;
use crate::error::{MatrixError, MatrixResult};
use crate::provider::SqliteBenchmarkProvider;
use crate::query::{self, AnchorStamp};
use crate::stage::stage_matrix;
use crate::stamps::{LocalStampCache, StampCache, StampCoordinator, StampResult};
use crate::types::{LiveSnapshot, MatrixGrid, MatrixType, SessionKey, StampFlags};
use crate::view::{MatrixSnapshotView, MatrixView, ViewMeta};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Per-tick persistence summary (audit/observability)
///
/// `commits` only lists types that staged at least one cell; an empty grid
/// (no anchor yet, no previous tick) publishes nothing and keeps the type's
/// previous tick as its latest.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub tick_ts: i64,
    pub session: SessionKey,
    pub opening_stamped: bool,
    pub staged: BTreeMap<MatrixType, usize>,
    pub commits: BTreeMap<MatrixType, CommitReport>,
    /// Per-cell `get_prev` lookups the derived engine needed
    pub prefetch_misses: usize,
}

impl TickReport {
    pub fn is_complete(&self) -> bool {
        self.commits.values().all(|c| c.complete)
    }

    pub fn total_staged(&self) -> usize {
        self.staged.values().sum()
    }
}

pub struct MatrixStore {
    conn: Arc<Mutex<Connection>>,
    stamps: StampCoordinator,
    engine: DerivedEngine,
}

impl MatrixStore {
    /// Open an existing database file; schema must already be migrated
    pub fn open(db_path: impl AsRef<Path>, cache: Arc<dyn StampCache>) -> MatrixResult<Self> {
        let conn = db::open_connection(db_path)?;
        Ok(Self::from_connection(conn, cache))
    }

    /// In-memory store with the embedded schema applied
    pub fn open_in_memory() -> MatrixResult<Self> {
        let conn = Connection::open_in_memory()?;
        db::apply_embedded_schema(&conn)?;
        Ok(Self::from_connection(conn, Arc::new(LocalStampCache::new())))
    }

    pub fn from_connection(conn: Connection, cache: Arc<dyn StampCache>) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            stamps: StampCoordinator::new(cache),
            engine: DerivedEngine::new(),
        }
    }

    pub fn with_engine(mut self, engine: DerivedEngine) -> Self {
        self.engine = engine;
        self
    }

    fn lock(&self) -> MatrixResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| MatrixError::LockPoisoned)
    }

    /// Persist one tick: passthrough grids, then every derived grid, all
    /// under `snapshot.tick_ts` and in a single transaction.
    pub async fn persist_tick(
        &self,
        session: &SessionKey,
        snapshot: &LiveSnapshot,
    ) -> MatrixResult<TickReport> {
        snapshot.validate()?;
        let tick_ts = snapshot.tick_ts;
        let coins: &[String] = &snapshot.coins;

        let mut conn = self.lock()?;
        db::ensure_relations(&conn)?;

        let tx = conn.transaction()?;
        let mut staged = BTreeMap::new();
        let mut commits = BTreeMap::new();

        let live_meta = json!({ "source": "live", "coins": coins.len() }).to_string();
        let bm_stamps = self.stamps.benchmark_stamps(&tx, session, tick_ts)?;

        let passthrough = [
            (MatrixType::Benchmark, &snapshot.benchmark, bm_stamps),
            (MatrixType::Pct24h, &snapshot.pct24h, StampFlags::none()),
        ];
        for (matrix_type, grid, stamps) in passthrough {
            let meta = Some(live_meta.as_str());
            let count =
                stage_matrix(&tx, session, matrix_type, tick_ts, coins, grid, meta, stamps)?;
            staged.insert(matrix_type, count);
            if count > 0 {
                let report = commit_in(&tx, session, matrix_type, tick_ts, Some(coins))?;
                commits.insert(matrix_type, report);
            }
        }

        // Benchmark is committed (inside tx) before history is read
        let provider = SqliteBenchmarkProvider::new(&tx, session);
        let derived = self.engine.compute(&provider, coins, &snapshot.benchmark, tick_ts)?;

        let derived_meta = json!({
            "source": "derived",
            "openingTs": derived.opening_ts,
            "snapshotTs": derived.snapshot_ts,
            "tradeTs": derived.trade_ts,
        })
        .to_string();
        let prefetch_misses = derived.prefetch_misses;

        for (matrix_type, grid) in derived.iter() {
            let count = stage_matrix(
                &tx,
                session,
                matrix_type,
                tick_ts,
                coins,
                grid,
                Some(&derived_meta),
                StampFlags::none(),
            )?;
            staged.insert(matrix_type, count);
            if count > 0 {
                let report = commit_in(&tx, session, matrix_type, tick_ts, Some(coins))?;
                commits.insert(matrix_type, report);
            }
        }

        tx.commit()?;
        drop(conn);

        // An empty benchmark grid carries no stamped row; the opening stays open
        let opening_stamped = bm_stamps.opening.is_some()
            && staged.get(&MatrixType::Benchmark).copied().unwrap_or(0) > 0;
        if opening_stamped {
            self.stamps.confirm_opening(session);
        }

        let report = TickReport {
            tick_ts,
            session: session.clone(),
            opening_stamped,
            staged,
            commits,
            prefetch_misses,
        };

        log::info!(
            "📊 Tick committed: {} @ {} | {} coins | {} cells | complete: {}",
            session,
            tick_ts,
            coins.len(),
            report.total_staged(),
            report.is_complete()
        );

        Ok(report)
    }

    /// Stage one matrix outside the tick protocol
    #[allow(clippy::too_many_arguments)]
    pub async fn stage(
        &self,
        session: &SessionKey,
        matrix_type: MatrixType,
        tick_ts: i64,
        coins: &[String],
        grid: &MatrixGrid,
        meta: Option<&str>,
        stamps: StampFlags,
    ) -> MatrixResult<usize> {
        let conn = self.lock()?;
        stage_matrix(&conn, session, matrix_type, tick_ts, coins, grid, meta, stamps)
    }

    /// Commit one staged matrix in its own transaction
    pub async fn commit(
        &self,
        session: &SessionKey,
        matrix_type: MatrixType,
        tick_ts: i64,
        eligible_coins: Option<&[String]>,
    ) -> MatrixResult<CommitReport> {
        let mut conn = self.lock()?;
        commit_matrix(&mut conn, session, matrix_type, tick_ts, eligible_coins)
    }

    pub async fn stamp_snapshot(
        &self,
        session: &SessionKey,
        target_ts: i64,
    ) -> MatrixResult<StampResult> {
        let conn = self.lock()?;
        self.stamps.stamp_snapshot(&conn, session, target_ts)
    }

    pub async fn stamp_trade(
        &self,
        session: &SessionKey,
        trade_ts: i64,
    ) -> MatrixResult<StampResult> {
        let conn = self.lock()?;
        self.stamps.stamp_trade(&conn, session, trade_ts)
    }

    /// Latest tick of each exposed matrix for `session`, restricted to `coins`
    ///
    /// A missing `matrices` relation degrades to an all-null payload.
    pub async fn read_latest(
        &self,
        session: &SessionKey,
        coins: &[String],
    ) -> MatrixResult<MatrixSnapshotView> {
        let conn = self.lock()?;

        if !db::relation_exists(&conn, Relation::Matrices)? {
            log::warn!(
                "⚠️  Relation '{}' missing, serving empty matrices for {}",
                Relation::Matrices.as_str(),
                session
            );
            return Ok(MatrixSnapshotView::empty(
                coins,
                Some("matrices relation unavailable".to_string()),
            ));
        }

        let mut matrices = BTreeMap::new();
        for matrix_type in MatrixType::EXPOSED {
            let view = match query::latest_tick_ts(&conn, session, matrix_type, None)? {
                Some(ts) => {
                    let grid = query::grid_at(&conn, session, matrix_type, ts, coins)?;
                    MatrixView::from_grid(coins, &grid, Some(ts))
                }
                None => MatrixView::empty(coins),
            };
            matrices.insert(matrix_type.as_str().to_string(), view);
        }

        let anchor_ts = |stamp: AnchorStamp| -> MatrixResult<Option<i64>> {
            Ok(query::anchor_tick(&conn, session, stamp, i64::MAX)?.map(|a| a.stamp_ts))
        };

        let meta = ViewMeta {
            opening_ts: anchor_ts(AnchorStamp::Opening)?,
            snapshot_ts: anchor_ts(AnchorStamp::Snapshot)?,
            trade_ts: anchor_ts(AnchorStamp::Trade)?,
            universe: coins.to_vec(),
            note: None,
        };

        Ok(MatrixSnapshotView {
            ok: true,
            coins: coins.to_vec(),
            matrices,
            meta,
        })
    }

    pub async fn cell_history(
        &self,
        session: &SessionKey,
        matrix_type: MatrixType,
        base: &str,
        quote: &str,
        limit: usize,
    ) -> MatrixResult<Vec<(i64, f64)>> {
        let conn = self.lock()?;
        query::cell_history(&conn, session, matrix_type, base, quote, limit)
    }

    pub async fn opening_stamp_count(&self, session: &SessionKey) -> MatrixResult<i64> {
        let conn = self.lock()?;
        query::opening_stamp_count(&conn, session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coins() -> Vec<String> {
        vec!["USDT".to_string(), "A".to_string(), "B".to_string()]
    }

    fn snapshot(tick_ts: i64, scale: f64) -> LiveSnapshot {
        let prices = [1.0, 2.0 * scale, 4.0];
        let mut benchmark = MatrixGrid::empty(3);
        let mut pct24h = MatrixGrid::empty(3);
        for i in 0..3 {
            for j in 0..3 {
                benchmark.set(i, j, Some(prices[i] / prices[j]));
                pct24h.set(i, j, Some(0.01));
            }
        }
        LiveSnapshot {
            tick_ts,
            coins: coins(),
            benchmark,
            pct24h,
        }
    }

    #[tokio::test]
    async fn test_persist_tick_commits_every_type_under_one_ts() {
        let store = MatrixStore::open_in_memory().unwrap();
        let session = SessionKey::new("s1");

        let report = store.persist_tick(&session, &snapshot(1_000, 1.0)).await.unwrap();

        assert!(report.opening_stamped);
        assert_eq!(report.staged[&MatrixType::Benchmark], 6);
        assert_eq!(report.staged[&MatrixType::Pct24h], 6);
        // First tick: ref is the tick itself, no prev for id_pct
        assert_eq!(report.staged[&MatrixType::Ref], 6);
        assert_eq!(report.staged[&MatrixType::IdPct], 0);
        assert_eq!(report.commits.len(), 4);
        assert!(!report.commits.contains_key(&MatrixType::IdPct));
        assert!(report.is_complete());
        // No history yet: the bulk prefetch already proves there is no prev
        assert_eq!(report.prefetch_misses, 0);

        let view = store.read_latest(&session, &coins()).await.unwrap();
        let published = [
            MatrixType::Benchmark,
            MatrixType::Pct24h,
            MatrixType::Ref,
            MatrixType::PctRef,
        ];
        for matrix_type in published {
            assert_eq!(view.matrix(matrix_type).unwrap().ts, Some(1_000));
        }
        assert_eq!(view.value(MatrixType::PctRef, "A", "USDT"), Some(0.0));
        assert_eq!(view.meta.opening_ts, Some(1_000));
        assert_eq!(view.matrix(MatrixType::IdPct).unwrap().ts, None);
    }

    #[tokio::test]
    async fn test_second_tick_derives_from_first() {
        let store = MatrixStore::open_in_memory().unwrap();
        let session = SessionKey::new("s1");

        store.persist_tick(&session, &snapshot(1_000, 1.0)).await.unwrap();
        let report = store.persist_tick(&session, &snapshot(2_000, 1.5)).await.unwrap();
        assert!(!report.opening_stamped);
        assert!(report.is_complete());

        let view = store.read_latest(&session, &coins()).await.unwrap();
        // A/USDT: 2.0 → 3.0
        let id_pct = view.value(MatrixType::IdPct, "A", "USDT").unwrap();
        assert!((id_pct - 0.5).abs() < 1e-12);
        let delta = view.value(MatrixType::Delta, "A", "USDT").unwrap();
        assert!((delta - 1.0).abs() < 1e-12);
        // ref anchored at the opening tick
        assert_eq!(view.value(MatrixType::Ref, "A", "USDT"), Some(2.0));
        assert_eq!(store.opening_stamp_count(&session).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_and_trade_anchors_feed_next_tick() {
        let store = MatrixStore::open_in_memory().unwrap();
        let session = SessionKey::new("s1");

        store.persist_tick(&session, &snapshot(1_000, 1.0)).await.unwrap();
        store.stamp_snapshot(&session, 1_500).await.unwrap();
        store.stamp_trade(&session, 1_600).await.unwrap();
        store.persist_tick(&session, &snapshot(2_000, 2.0)).await.unwrap();

        let view = store.read_latest(&session, &coins()).await.unwrap();
        assert_eq!(view.value(MatrixType::Snap, "A", "USDT"), Some(2.0));
        assert_eq!(view.value(MatrixType::PctSnap, "A", "USDT"), Some(1.0));
        assert_eq!(view.value(MatrixType::Traded, "A", "USDT"), Some(2.0));
        assert_eq!(view.value(MatrixType::PctTraded, "A", "USDT"), Some(1.0));
        assert_eq!(view.meta.snapshot_ts, Some(1_500));
        assert_eq!(view.meta.trade_ts, Some(1_600));
    }

    #[tokio::test]
    async fn test_failed_tick_rolls_back_everything() {
        let store = MatrixStore::open_in_memory().unwrap();
        let session = SessionKey::new("s1");
        store.persist_tick(&session, &snapshot(1_000, 1.0)).await.unwrap();

        // Abort a derived commit after benchmark is already written in-tx
        {
            let conn = store.lock().unwrap();
            conn.execute_batch(
                "CREATE TRIGGER fail_pct_ref BEFORE INSERT ON matrices
                 WHEN NEW.matrix_type = 'pct_ref'
                 BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
            )
            .unwrap();
        }
        let result = store.persist_tick(&session, &snapshot(2_000, 2.0)).await;
        assert!(matches!(result, Err(MatrixError::Database(_))));

        let view = store.read_latest(&session, &coins()).await.unwrap();
        assert_eq!(view.matrix(MatrixType::Benchmark).unwrap().ts, Some(1_000));
        assert_eq!(view.matrix(MatrixType::Pct24h).unwrap().ts, Some(1_000));
        assert_eq!(view.value(MatrixType::Benchmark, "A", "USDT"), Some(2.0));
    }

    #[tokio::test]
    async fn test_empty_first_tick_keeps_opening_available() {
        let store = MatrixStore::open_in_memory().unwrap();
        let session = SessionKey::new("s1");
        let empty = LiveSnapshot {
            tick_ts: 1_000,
            coins: coins(),
            benchmark: MatrixGrid::empty(3),
            pct24h: MatrixGrid::empty(3),
        };

        let report = store.persist_tick(&session, &empty).await.unwrap();
        assert!(!report.opening_stamped);
        assert_eq!(report.staged[&MatrixType::Benchmark], 0);
        assert_eq!(store.opening_stamp_count(&session).await.unwrap(), 0);

        let report = store.persist_tick(&session, &snapshot(2_000, 1.0)).await.unwrap();
        assert!(report.opening_stamped);
        assert_eq!(store.opening_stamp_count(&session).await.unwrap(), 1);

        let view = store.read_latest(&session, &coins()).await.unwrap();
        assert_eq!(view.meta.opening_ts, Some(2_000));
        assert_eq!(view.value(MatrixType::Ref, "A", "USDT"), Some(2.0));
    }

    #[tokio::test]
    async fn test_rolled_back_first_tick_keeps_opening_available() {
        let store = MatrixStore::open_in_memory().unwrap();
        let session = SessionKey::new("s1");
        {
            let conn = store.lock().unwrap();
            conn.execute_batch(
                "CREATE TRIGGER fail_ref BEFORE INSERT ON matrices
                 WHEN NEW.matrix_type = 'ref'
                 BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
            )
            .unwrap();
        }
        assert!(store.persist_tick(&session, &snapshot(1_000, 1.0)).await.is_err());
        assert_eq!(store.opening_stamp_count(&session).await.unwrap(), 0);

        store.lock().unwrap().execute_batch("DROP TRIGGER fail_ref").unwrap();
        let report = store.persist_tick(&session, &snapshot(2_000, 1.0)).await.unwrap();
        assert!(report.opening_stamped);
        assert_eq!(store.opening_stamp_count(&session).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_staging_relation_fails_fast() {
        let store = MatrixStore::open_in_memory().unwrap();
        store.lock().unwrap().execute_batch("DROP TABLE matrices_staging").unwrap();

        let result = store.persist_tick(&SessionKey::global(), &snapshot(1_000, 1.0)).await;
        assert!(matches!(result, Err(MatrixError::ProviderUnavailable(_))));
    }

    #[tokio::test]
    async fn test_read_without_schema_degrades_to_empty() {
        let store = MatrixStore::from_connection(
            Connection::open_in_memory().unwrap(),
            Arc::new(LocalStampCache::new()),
        );
        let view = store.read_latest(&SessionKey::global(), &coins()).await.unwrap();
        assert!(view.ok);
        assert!(view.meta.note.is_some());
        assert_eq!(view.value(MatrixType::Benchmark, "A", "B"), None);
    }

    #[tokio::test]
    async fn test_store_level_stage_and_commit() {
        let store = MatrixStore::open_in_memory().unwrap();
        let session = SessionKey::new("s1");
        let mut grid = MatrixGrid::empty(3);
        grid.set(0, 1, Some(1.0));

        let stamps = StampFlags::none();
        let staged = store
            .stage(&session, MatrixType::BenchmarkTrade, 10, &coins(), &grid, None, stamps)
            .await
            .unwrap();
        assert_eq!(staged, 1);

        let universe = coins();
        let report = store
            .commit(&session, MatrixType::BenchmarkTrade, 10, Some(universe.as_slice()))
            .await
            .unwrap();
        assert_eq!(report.missing_count, 5);
        assert!(!report.complete);

        let history = store
            .cell_history(&session, MatrixType::BenchmarkTrade, "USDT", "A", 10)
            .await
            .unwrap();
        assert_eq!(history, vec![(10, 1.0)]);
    }
}
