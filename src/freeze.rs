//! Freeze/streak detection for presentation layers
//!
//! Tracks how many consecutive ticks a cell kept the same value. Read-only
//! with respect to the store.

use crate::types::{MatrixGrid, MatrixType};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Tolerance for "unchanged"
pub const FREEZE_EPSILON: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FreezeBucket {
    Recent,
    Mid,
    Long,
}

impl FreezeBucket {
    /// 1 → recent, 2-3 → mid, 4+ → long; 0 is not frozen
    pub fn from_streak(streak: u32) -> Option<Self> {
        match streak {
            0 => None,
            1 => Some(FreezeBucket::Recent),
            2..=3 => Some(FreezeBucket::Mid),
            _ => Some(FreezeBucket::Long),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FreezeBucket::Recent => "recent",
            FreezeBucket::Mid => "mid",
            FreezeBucket::Long => "long",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrozenCell {
    pub matrix_type: MatrixType,
    pub base: String,
    pub quote: String,
    pub streak: u32,
    pub bucket: FreezeBucket,
}

type CellKey = (MatrixType, String, String);

#[derive(Debug, Clone, Copy, Default)]
struct CellState {
    last: Option<f64>,
    streak: u32,
}

#[derive(Debug, Clone)]
pub struct FreezeTracker {
    epsilon: f64,
    cells: HashMap<CellKey, CellState>,
}

impl Default for FreezeTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl FreezeTracker {
    pub fn new() -> Self {
        Self::with_epsilon(FREEZE_EPSILON)
    }

    pub fn with_epsilon(epsilon: f64) -> Self {
        Self {
            epsilon,
            cells: HashMap::new(),
        }
    }

    /// Feed the next tick's value for one cell and return its streak
    ///
    /// The streak counts unchanged *transitions*, not ticks: the first
    /// observation is 0, a second equal value is 1, so five equal ticks in a
    /// row give 4 (`long`) and four equal ticks give 3 (`mid`).
    pub fn observe(
        &mut self,
        matrix_type: MatrixType,
        base: &str,
        quote: &str,
        value: Option<f64>,
    ) -> u32 {
        let key = (matrix_type, base.to_string(), quote.to_string());
        let state = self.cells.entry(key).or_default();
        let value = value.filter(|v| v.is_finite());

        state.streak = match (state.last, value) {
            (Some(prev), Some(now)) if (now - prev).abs() <= self.epsilon => {
                state.streak.saturating_add(1)
            }
            _ => 0,
        };
        state.last = value;
        state.streak
    }

    /// Observe every off-diagonal cell of `grid`; returns how many are frozen
    pub fn observe_grid(
        &mut self,
        matrix_type: MatrixType,
        coins: &[String],
        grid: &MatrixGrid,
    ) -> usize {
        let mut frozen = 0;
        for (i, base) in coins.iter().enumerate() {
            for (j, quote) in coins.iter().enumerate() {
                if i == j {
                    continue;
                }
                if self.observe(matrix_type, base, quote, grid.get(i, j)) > 0 {
                    frozen += 1;
                }
            }
        }
        frozen
    }

    /// Rebuild one cell's streak from oldest-first history
    pub fn replay(
        &mut self,
        matrix_type: MatrixType,
        base: &str,
        quote: &str,
        history: &[(i64, f64)],
    ) -> u32 {
        self.cells.remove(&(matrix_type, base.to_string(), quote.to_string()));
        let mut streak = 0;
        for (_, value) in history {
            streak = self.observe(matrix_type, base, quote, Some(*value));
        }
        streak
    }

    /// Drop every cell whose base or quote left the universe
    pub fn retain_universe(&mut self, coins: &[String]) {
        let active: HashSet<&str> = coins.iter().map(String::as_str).collect();
        self.cells.retain(|(_, base, quote), _| {
            active.contains(base.as_str()) && active.contains(quote.as_str())
        });
    }

    pub fn streak(&self, matrix_type: MatrixType, base: &str, quote: &str) -> u32 {
        self.cells
            .get(&(matrix_type, base.to_string(), quote.to_string()))
            .map(|s| s.streak)
            .unwrap_or(0)
    }

    pub fn bucket(&self, matrix_type: MatrixType, base: &str, quote: &str) -> Option<FreezeBucket> {
        FreezeBucket::from_streak(self.streak(matrix_type, base, quote))
    }

    /// Currently frozen cells of one matrix, longest streak first
    pub fn frozen_cells(&self, matrix_type: MatrixType) -> Vec<FrozenCell> {
        let mut out: Vec<FrozenCell> = self
            .cells
            .iter()
            .filter(|((t, _, _), _)| *t == matrix_type)
            .filter_map(|((t, base, quote), state)| {
                FreezeBucket::from_streak(state.streak).map(|bucket| FrozenCell {
                    matrix_type: *t,
                    base: base.clone(),
                    quote: quote.clone(),
                    streak: state.streak,
                    bucket,
                })
            })
            .collect();
        out.sort_by(|a, b| {
            b.streak
                .cmp(&a.streak)
                .then_with(|| a.base.cmp(&b.base))
                .then_with(|| a.quote.cmp(&b.quote))
        });
        out
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_four_unchanged_transitions_is_long() {
        let mut tracker = FreezeTracker::new();
        let mut streak = 0;
        for _ in 0..5 {
            streak = tracker.observe(MatrixType::Benchmark, "BTC", "USDT", Some(50_000.0));
        }
        assert_eq!(streak, 4);
        assert_eq!(
            tracker.bucket(MatrixType::Benchmark, "BTC", "USDT"),
            Some(FreezeBucket::Long)
        );

        let reset = tracker.observe(MatrixType::Benchmark, "BTC", "USDT", Some(50_001.0));
        assert_eq!(reset, 0);
        assert_eq!(tracker.bucket(MatrixType::Benchmark, "BTC", "USDT"), None);
    }

    #[test]
    fn test_epsilon_and_null_transitions() {
        let mut tracker = FreezeTracker::new();
        tracker.observe(MatrixType::IdPct, "A", "B", Some(0.1));
        assert_eq!(tracker.observe(MatrixType::IdPct, "A", "B", Some(0.1 + 1e-11)), 1);
        assert_eq!(tracker.observe(MatrixType::IdPct, "A", "B", None), 0);
        assert_eq!(tracker.observe(MatrixType::IdPct, "A", "B", Some(0.1)), 0);
        assert_eq!(tracker.observe(MatrixType::IdPct, "A", "B", Some(0.1)), 1);
    }

    #[test]
    fn test_bucket_boundaries() {
        assert_eq!(FreezeBucket::from_streak(0), None);
        assert_eq!(FreezeBucket::from_streak(1), Some(FreezeBucket::Recent));
        assert_eq!(FreezeBucket::from_streak(2), Some(FreezeBucket::Mid));
        assert_eq!(FreezeBucket::from_streak(3), Some(FreezeBucket::Mid));
        assert_eq!(FreezeBucket::from_streak(4), Some(FreezeBucket::Long));
        assert_eq!(FreezeBucket::Long.as_str(), "long");
    }

    #[test]
    fn test_keys_are_independent_per_metric() {
        let mut tracker = FreezeTracker::new();
        tracker.observe(MatrixType::Benchmark, "A", "B", Some(1.0));
        tracker.observe(MatrixType::Benchmark, "A", "B", Some(1.0));
        tracker.observe(MatrixType::Delta, "A", "B", Some(1.0));
        assert_eq!(tracker.streak(MatrixType::Benchmark, "A", "B"), 1);
        assert_eq!(tracker.streak(MatrixType::Delta, "A", "B"), 0);
    }

    #[test]
    fn test_observe_grid_and_retain_universe() {
        let coins: Vec<String> = vec!["USDT".into(), "BTC".into(), "ETH".into()];
        let mut grid = MatrixGrid::empty(3);
        grid.set(1, 0, Some(50_000.0));
        grid.set(2, 0, Some(3_000.0));

        let mut tracker = FreezeTracker::new();
        assert_eq!(tracker.observe_grid(MatrixType::Benchmark, &coins, &grid), 0);
        grid.set(2, 0, Some(3_001.0));
        assert_eq!(tracker.observe_grid(MatrixType::Benchmark, &coins, &grid), 1);

        let frozen = tracker.frozen_cells(MatrixType::Benchmark);
        assert_eq!(frozen.len(), 1);
        assert_eq!(frozen[0].base, "BTC");
        assert_eq!(frozen[0].bucket, FreezeBucket::Recent);

        tracker.retain_universe(&["USDT".to_string(), "BTC".to_string()]);
        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.streak(MatrixType::Benchmark, "ETH", "USDT"), 0);
    }

    #[test]
    fn test_replay_from_history() {
        let mut tracker = FreezeTracker::new();
        tracker.observe(MatrixType::Ref, "A", "B", Some(9.0));
        tracker.observe(MatrixType::Ref, "A", "B", Some(9.0));

        let history = vec![(1, 2.0), (2, 3.0), (3, 3.0), (4, 3.0)];
        assert_eq!(tracker.replay(MatrixType::Ref, "A", "B", &history), 2);
        assert_eq!(tracker.bucket(MatrixType::Ref, "A", "B"), Some(FreezeBucket::Mid));
    }
}
