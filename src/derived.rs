//! Derived metric engine
//!
//! Computes the derived matrices of one tick from the live benchmark grid
//! plus previously committed values. All history comes through the
//! `BenchmarkProvider` handed to `DerivedEngine::compute`; the engine holds
//! no provider state between calls.
//!
//! ```text
//! id_pct / pct_drv = (bm_now - bm_prev) / bm_prev
//! delta            = bm_now - bm_prev
//! ref / snap / traded          = anchor grid value
//! pct_ref / pct_snap / pct_traded = (bm_now - anchor) / anchor
//! ```
//!
//! Any division by a value with |x| < epsilon yields `None`, never NaN/inf.

use crate::error::MatrixResult;
use crate::types::{MatrixGrid, MatrixType};
use std::collections::BTreeMap;

/// Guard for every percent-change denominator
pub const DIVISION_EPSILON: f64 = 1e-12;

/// Grid anchored at a stamped tick
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorGrid {
    pub ts: i64,
    pub grid: MatrixGrid,
}

/// History lookups the engine needs, injected per invocation
///
/// Every grid returned must be aligned with `coins`. Implementations must
/// scope all lookups to one session.
pub trait BenchmarkProvider {
    /// Latest committed value strictly before `before_ts`
    fn get_prev(
        &self,
        matrix_type: MatrixType,
        base: &str,
        quote: &str,
        before_ts: i64,
    ) -> MatrixResult<Option<f64>>;

    /// Bulk form of `get_prev` for every pair of `coins`
    fn prefetch_prev(
        &self,
        matrix_type: MatrixType,
        coins: &[String],
        before_ts: i64,
    ) -> MatrixResult<MatrixGrid>;

    /// `true` when an empty prefetch cell already means "no history"
    ///
    /// Such providers never get a per-cell `get_prev` fallback.
    fn prefetch_is_exhaustive(&self) -> bool {
        false
    }

    fn fetch_opening_grid(&self, coins: &[String], now_ts: i64)
        -> MatrixResult<Option<AnchorGrid>>;

    fn fetch_snapshot_grid(&self, coins: &[String], now_ts: i64)
        -> MatrixResult<Option<AnchorGrid>>;

    fn fetch_trade_grid(&self, coins: &[String], now_ts: i64) -> MatrixResult<Option<AnchorGrid>>;
}

/// Output of one engine run
#[derive(Debug, Clone)]
pub struct DerivedMatrices {
    grids: BTreeMap<MatrixType, MatrixGrid>,
    pub opening_ts: Option<i64>,
    pub snapshot_ts: Option<i64>,
    pub trade_ts: Option<i64>,
    /// Pairs that needed a per-cell `get_prev` after the bulk prefetch
    pub prefetch_misses: usize,
}

impl DerivedMatrices {
    pub fn get(&self, matrix_type: MatrixType) -> Option<&MatrixGrid> {
        self.grids.get(&matrix_type)
    }

    /// Grids in `MatrixType::DERIVED` order
    pub fn iter(&self) -> impl Iterator<Item = (MatrixType, &MatrixGrid)> {
        MatrixType::DERIVED
            .into_iter()
            .filter_map(move |t| self.grids.get(&t).map(|g| (t, g)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DerivedEngine {
    epsilon: f64,
}

impl Default for DerivedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DerivedEngine {
    pub fn new() -> Self {
        Self {
            epsilon: DIVISION_EPSILON,
        }
    }

    pub fn with_epsilon(epsilon: f64) -> Self {
        Self { epsilon }
    }

    pub fn compute<P: BenchmarkProvider + ?Sized>(
        &self,
        provider: &P,
        coins: &[String],
        benchmark: &MatrixGrid,
        tick_ts: i64,
    ) -> MatrixResult<DerivedMatrices> {
        let n = coins.len();

        // One bulk round-trip for prev, one per anchor
        let mut prev = provider.prefetch_prev(MatrixType::Benchmark, coins, tick_ts)?;
        let mut exhaustive = provider.prefetch_is_exhaustive();
        if prev.size() != n {
            exhaustive = false;
            log::warn!(
                "⚠️  Prefetch returned {}x{} grid for {} coins, using per-cell lookups",
                prev.size(),
                prev.size(),
                n
            );
            prev = MatrixGrid::empty(n);
        }
        let opening = aligned(provider.fetch_opening_grid(coins, tick_ts)?, n);
        let snapshot = aligned(provider.fetch_snapshot_grid(coins, tick_ts)?, n);
        let trade = aligned(provider.fetch_trade_grid(coins, tick_ts)?, n);

        let mut out: BTreeMap<MatrixType, MatrixGrid> = MatrixType::DERIVED
            .into_iter()
            .map(|t| (t, MatrixGrid::empty(n)))
            .collect();
        let mut prefetch_misses = 0;

        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }
                let now = benchmark.get(i, j);

                let bm_prev = match (now, prev.get(i, j)) {
                    (_, Some(p)) => Some(p),
                    (Some(_), None) if !exhaustive => {
                        prefetch_misses += 1;
                        provider.get_prev(MatrixType::Benchmark, &coins[i], &coins[j], tick_ts)?
                    }
                    _ => None,
                };

                let ref_value = opening.as_ref().and_then(|a| a.grid.get(i, j));
                let snap_value = snapshot.as_ref().and_then(|a| a.grid.get(i, j));
                let traded_value = trade.as_ref().and_then(|a| a.grid.get(i, j));

                let id_pct = now.and_then(|bm| self.pct_change(bm, bm_prev));
                let cells = [
                    (MatrixType::IdPct, id_pct),
                    (MatrixType::PctDrv, now.and_then(|bm| self.pct_change(bm, bm_prev))),
                    (MatrixType::Ref, ref_value),
                    (MatrixType::PctRef, now.and_then(|bm| self.pct_change(bm, ref_value))),
                    (MatrixType::Delta, now.zip(bm_prev).map(|(bm, p)| bm - p)),
                    (MatrixType::Snap, snap_value),
                    (MatrixType::PctSnap, now.and_then(|bm| self.pct_change(bm, snap_value))),
                    (MatrixType::Traded, traded_value),
                    (MatrixType::PctTraded, now.and_then(|bm| self.pct_change(bm, traded_value))),
                ];

                for (matrix_type, value) in cells {
                    if let Some(grid) = out.get_mut(&matrix_type) {
                        grid.set(i, j, value);
                    }
                }
            }
        }

        if prefetch_misses > 0 {
            log::debug!("Derived engine: {} prefetch misses @ {}", prefetch_misses, tick_ts);
        }

        Ok(DerivedMatrices {
            grids: out,
            opening_ts: opening.map(|a| a.ts),
            snapshot_ts: snapshot.map(|a| a.ts),
            trade_ts: trade.map(|a| a.ts),
            prefetch_misses,
        })
    }

    /// (now - base) / base, guarded against tiny or missing denominators
    pub fn pct_change(&self, now: f64, base: Option<f64>) -> Option<f64> {
        let base = base?;
        if !base.is_finite() || base.abs() < self.epsilon {
            return None;
        }
        let pct = (now - base) / base;
        pct.is_finite().then_some(pct)
    }
}

fn aligned(anchor: Option<AnchorGrid>, n: usize) -> Option<AnchorGrid> {
    match anchor {
        Some(a) if a.grid.size() == n => Some(a),
        Some(a) => {
            log::warn!(
                "⚠️  Ignoring anchor @ {}: {}x{} grid for {} coins",
                a.ts,
                a.grid.size(),
                a.grid.size(),
                n
            );
            None
        }
        None => None,
    }
}
