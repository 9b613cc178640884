//! Read-side payload handed to the API layer
//!
//! Shape: `matrices.<type>.values[base][quote] = number | null`, each matrix
//! with its own effective `ts`, plus anchor timestamps in `meta`.

use crate::types::{MatrixGrid, MatrixType};
use serde::Serialize;
use std::collections::BTreeMap;

pub type CellMap = BTreeMap<String, BTreeMap<String, Option<f64>>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatrixView {
    /// Tick the values come from; `None` when nothing is stored yet
    pub ts: Option<i64>,
    pub values: CellMap,
}

impl MatrixView {
    pub fn empty(coins: &[String]) -> Self {
        Self::from_grid(coins, &MatrixGrid::empty(coins.len()), None)
    }

    pub fn from_grid(coins: &[String], grid: &MatrixGrid, ts: Option<i64>) -> Self {
        let mut values = CellMap::new();
        for (i, base) in coins.iter().enumerate() {
            let row = values.entry(base.clone()).or_default();
            for (j, quote) in coins.iter().enumerate() {
                if i != j {
                    row.insert(quote.clone(), grid.get(i, j));
                }
            }
        }
        Self { ts, values }
    }

    pub fn value(&self, base: &str, quote: &str) -> Option<f64> {
        self.values.get(base).and_then(|row| row.get(quote)).copied().flatten()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewMeta {
    pub opening_ts: Option<i64>,
    pub snapshot_ts: Option<i64>,
    pub trade_ts: Option<i64>,
    pub universe: Vec<String>,
    /// Set when the payload was degraded (timeout, missing relation)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatrixSnapshotView {
    pub ok: bool,
    pub coins: Vec<String>,
    pub matrices: BTreeMap<String, MatrixView>,
    pub meta: ViewMeta,
}

impl MatrixSnapshotView {
    /// `ok = true` payload with every exposed matrix present and all-null
    pub fn empty(coins: &[String], note: Option<String>) -> Self {
        let matrices = MatrixType::EXPOSED
            .into_iter()
            .map(|t| (t.as_str().to_string(), MatrixView::empty(coins)))
            .collect();

        Self {
            ok: true,
            coins: coins.to_vec(),
            matrices,
            meta: ViewMeta {
                opening_ts: None,
                snapshot_ts: None,
                trade_ts: None,
                universe: coins.to_vec(),
                note,
            },
        }
    }

    pub fn matrix(&self, matrix_type: MatrixType) -> Option<&MatrixView> {
        self.matrices.get(matrix_type.as_str())
    }

    pub fn value(&self, matrix_type: MatrixType, base: &str, quote: &str) -> Option<f64> {
        self.matrix(matrix_type).and_then(|m| m.value(base, quote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coins() -> Vec<String> {
        vec!["USDT".to_string(), "BTC".to_string(), "ETH".to_string()]
    }

    #[test]
    fn test_empty_view_has_all_exposed_matrices() {
        let view = MatrixSnapshotView::empty(&coins(), Some("timeout".to_string()));
        assert!(view.ok);
        assert_eq!(view.matrices.len(), 11);
        assert!(view.matrix(MatrixType::BenchmarkTrade).is_none());

        let bm = view.matrix(MatrixType::Benchmark).unwrap();
        assert_eq!(bm.ts, None);
        assert_eq!(bm.values["BTC"].len(), 2);
        assert!(!bm.values["BTC"].contains_key("BTC"));
        assert_eq!(bm.value("BTC", "ETH"), None);
    }

    #[test]
    fn test_serialized_shape() {
        let mut grid = MatrixGrid::empty(3);
        grid.set(1, 2, Some(14.5));
        let mut view = MatrixSnapshotView::empty(&coins(), None);
        view.matrices.insert(
            MatrixType::Benchmark.as_str().to_string(),
            MatrixView::from_grid(&coins(), &grid, Some(1_000)),
        );

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["matrices"]["benchmark"]["ts"], 1_000);
        assert_eq!(json["matrices"]["benchmark"]["values"]["BTC"]["ETH"], 14.5);
        assert!(json["matrices"]["benchmark"]["values"]["ETH"]["BTC"].is_null());
        assert!(json["meta"]["openingTs"].is_null());
        assert!(json["meta"].get("note").is_none());
        assert_eq!(json["meta"]["universe"][0], "USDT");
    }
}
