//! Tick orchestration
//!
//! resolve universe → fetch live snapshot (bounded) → persist tick → read back.
//! A snapshot timeout, an unreachable or malformed snapshot source, or a
//! missing relation degrades to an explicit empty payload instead of an error.

use crate::error::{MatrixError, MatrixResult};
use crate::snapshot::{fetch_with_timeout, LiveSnapshotProvider};
use crate::store::{MatrixStore, TickReport};
use crate::types::{SessionContext, SessionKey};
use crate::universe::{CoinUniverse, CoinUniverseResolver};
use crate::view::MatrixSnapshotView;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;

pub struct MatrixPipeline {
    store: Arc<MatrixStore>,
    resolver: Arc<dyn CoinUniverseResolver>,
    snapshots: Arc<dyn LiveSnapshotProvider>,
    snapshot_timeout: Duration,
}

impl MatrixPipeline {
    pub fn new(
        store: Arc<MatrixStore>,
        resolver: Arc<dyn CoinUniverseResolver>,
        snapshots: Arc<dyn LiveSnapshotProvider>,
        snapshot_timeout: Duration,
    ) -> Self {
        Self {
            store,
            resolver,
            snapshots,
            snapshot_timeout,
        }
    }

    pub fn store(&self) -> &Arc<MatrixStore> {
        &self.store
    }

    async fn persist_for(
        &self,
        session: &SessionKey,
        universe: &CoinUniverse,
    ) -> MatrixResult<TickReport> {
        let snapshot =
            fetch_with_timeout(self.snapshots.as_ref(), universe, self.snapshot_timeout).await?;
        self.store.persist_tick(session, &snapshot).await
    }

    /// Fetch and persist one tick for `session`
    pub async fn tick(&self, session: &SessionKey) -> MatrixResult<TickReport> {
        let universe = self.resolver.resolve(session).await?;
        self.persist_for(session, &universe).await
    }

    /// Tick, then serve the latest matrices for the caller's session
    pub async fn refresh(&self, ctx: &SessionContext) -> MatrixResult<MatrixSnapshotView> {
        let session = SessionKey::resolve(ctx);
        let universe = self.resolver.resolve(&session).await?;

        match self.persist_for(&session, &universe).await {
            Ok(_) => {}
            Err(MatrixError::ProviderTimeout(budget)) => {
                log::warn!(
                    "⚠️  Snapshot timed out after {:?} for {}, serving empty matrices",
                    budget,
                    session
                );
                return Ok(MatrixSnapshotView::empty(
                    universe.coins(),
                    Some(format!("live snapshot timed out after {}ms", budget.as_millis())),
                ));
            }
            Err(MatrixError::ProviderUnavailable(reason)) => {
                log::warn!("⚠️  Provider unavailable for {}: {}", session, reason);
                return Ok(MatrixSnapshotView::empty(universe.coins(), Some(reason)));
            }
            Err(e @ (MatrixError::Http(_) | MatrixError::InvalidSnapshot(_))) => {
                log::warn!("⚠️  Live snapshot failed for {}: {}", session, e);
                return Ok(MatrixSnapshotView::empty(universe.coins(), Some(e.to_string())));
            }
            Err(e) => return Err(e),
        }

        self.store.read_latest(&session, universe.coins()).await
    }

    /// Serve the latest stored matrices without ticking
    pub async fn read(&self, ctx: &SessionContext) -> MatrixResult<MatrixSnapshotView> {
        let session = SessionKey::resolve(ctx);
        let universe = self.resolver.resolve(&session).await?;
        self.store.read_latest(&session, universe.coins()).await
    }

    /// Tick `session` every `interval_ms` until `shutdown` flips to true
    pub async fn run_tick_loop(
        self: Arc<Self>,
        session: SessionKey,
        interval_ms: u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        log::info!("🚀 Starting matrix tick loop for {}", session);
        log::info!("   ├─ Tick interval: {}ms", interval_ms);
        log::info!("   └─ Snapshot timeout: {}ms", self.snapshot_timeout.as_millis());

        let mut timer = interval(Duration::from_millis(interval_ms));
        let mut committed: u64 = 0;
        let mut skipped: u64 = 0;
        let mut failed: u64 = 0;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    match self.tick(&session).await {
                        Ok(report) => {
                            committed += 1;
                            if !report.is_complete() {
                                log::warn!(
                                    "⚠️  Tick {} committed with incomplete matrices",
                                    report.tick_ts
                                );
                            }
                        }
                        Err(MatrixError::ProviderTimeout(budget)) => {
                            skipped += 1;
                            log::warn!(
                                "⚠️  Tick skipped: snapshot timed out after {:?}",
                                budget
                            );
                        }
                        Err(e) => {
                            failed += 1;
                            log::error!("❌ Tick failed for {}: {}", session, e);
                        }
                    }
                }

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        log::info!(
            "✅ Tick loop stopped: {} committed, {} skipped, {} failed",
            committed,
            skipped,
            failed
        );
    }
}
