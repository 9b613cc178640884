//! Core data structures shared by the stage/commit pipeline
//!
//! All types match the SQL schema in `/sql/`:
//! - `matrices` / `matrices_staging` rows → `MatrixType`, `SessionKey`, `StampFlags`
//! - in-memory NxN grids → `MatrixGrid`

use crate::error::{MatrixError, MatrixResult};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Sentinel session used when no session could be resolved
pub const GLOBAL_SESSION: &str = "global";

/// Closed set of matrix kinds accepted by the store (mirrors the SQL CHECK)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatrixType {
    Benchmark,
    BenchmarkTrade,
    Delta,
    Pct24h,
    IdPct,
    PctDrv,
    Ref,
    PctRef,
    PctSnap,
    Snap,
    PctTraded,
    Traded,
}

impl MatrixType {
    pub const ALL: [MatrixType; 12] = [
        MatrixType::Benchmark,
        MatrixType::BenchmarkTrade,
        MatrixType::Delta,
        MatrixType::Pct24h,
        MatrixType::IdPct,
        MatrixType::PctDrv,
        MatrixType::Ref,
        MatrixType::PctRef,
        MatrixType::PctSnap,
        MatrixType::Snap,
        MatrixType::PctTraded,
        MatrixType::Traded,
    ];

    /// Types computed by the derived engine, in commit order
    pub const DERIVED: [MatrixType; 9] = [
        MatrixType::IdPct,
        MatrixType::PctDrv,
        MatrixType::Ref,
        MatrixType::PctRef,
        MatrixType::Delta,
        MatrixType::Snap,
        MatrixType::PctSnap,
        MatrixType::Traded,
        MatrixType::PctTraded,
    ];

    /// Types returned by the latest-tick read. `benchmark_trade` is
    /// accepted by the store but never exposed.
    pub const EXPOSED: [MatrixType; 11] = [
        MatrixType::Benchmark,
        MatrixType::Pct24h,
        MatrixType::IdPct,
        MatrixType::PctDrv,
        MatrixType::Ref,
        MatrixType::PctRef,
        MatrixType::Delta,
        MatrixType::Snap,
        MatrixType::PctSnap,
        MatrixType::Traded,
        MatrixType::PctTraded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MatrixType::Benchmark => "benchmark",
            MatrixType::BenchmarkTrade => "benchmark_trade",
            MatrixType::Delta => "delta",
            MatrixType::Pct24h => "pct24h",
            MatrixType::IdPct => "id_pct",
            MatrixType::PctDrv => "pct_drv",
            MatrixType::Ref => "ref",
            MatrixType::PctRef => "pct_ref",
            MatrixType::PctSnap => "pct_snap",
            MatrixType::Snap => "snap",
            MatrixType::PctTraded => "pct_traded",
            MatrixType::Traded => "traded",
        }
    }
}

impl fmt::Display for MatrixType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatrixType {
    type Err = MatrixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MatrixType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| MatrixError::UnknownMatrixType(s.to_string()))
    }
}

impl ToSql for MatrixType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for MatrixType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        s.parse().map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// Opaque per-user scope for every matrix row
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    /// Blank keys collapse to the global sentinel
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        let trimmed = key.trim();
        if trimmed.is_empty() {
            Self::global()
        } else {
            Self(trimmed.to_string())
        }
    }

    pub fn global() -> Self {
        Self(GLOBAL_SESSION.to_string())
    }

    pub fn resolve(ctx: &SessionContext) -> Self {
        match ctx.session_key.as_deref() {
            Some(key) => Self::new(key),
            None => Self::global(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_global(&self) -> bool {
        self.0 == GLOBAL_SESSION
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl ToSql for SessionKey {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.as_str()))
    }
}

/// Session context handed in by the auth layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub session_key: Option<String>,
    pub user_id: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
}

/// Stamp flags attached to a staged write
///
/// Each `Some(ts)` marks the row stamped with that timestamp, so a stamp
/// boolean can never be written without its paired timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StampFlags {
    pub opening: Option<i64>,
    pub snapshot: Option<i64>,
    pub trade: Option<i64>,
}

impl StampFlags {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn opening(ts: i64) -> Self {
        Self {
            opening: Some(ts),
            ..Self::default()
        }
    }
}

/// NxN grid over a coin ordering, diagonal ignored
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixGrid {
    size: usize,
    cells: Vec<Option<f64>>,
}

impl MatrixGrid {
    pub fn empty(size: usize) -> Self {
        Self {
            size,
            cells: vec![None; size * size],
        }
    }

    /// Build from row-major nested rows; every row must have `rows.len()` columns
    pub fn from_rows(rows: Vec<Vec<Option<f64>>>) -> MatrixResult<Self> {
        let size = rows.len();
        let mut grid = Self::empty(size);
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != size {
                return Err(MatrixError::InvalidSnapshot(format!(
                    "row {} has {} columns, expected {}",
                    i,
                    row.len(),
                    size
                )));
            }
            for (j, value) in row.into_iter().enumerate() {
                grid.set(i, j, value);
            }
        }
        Ok(grid)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Finite off-diagonal value, `None` otherwise
    pub fn get(&self, i: usize, j: usize) -> Option<f64> {
        if i == j || i >= self.size || j >= self.size {
            return None;
        }
        self.cells[i * self.size + j].filter(|v| v.is_finite())
    }

    pub fn set(&mut self, i: usize, j: usize, value: Option<f64>) {
        if i == j || i >= self.size || j >= self.size {
            return;
        }
        self.cells[i * self.size + j] = value.filter(|v| v.is_finite());
    }

    /// Number of finite off-diagonal cells
    pub fn filled(&self) -> usize {
        let mut count = 0;
        for i in 0..self.size {
            for j in 0..self.size {
                if self.get(i, j).is_some() {
                    count += 1;
                }
            }
        }
        count
    }

    pub fn rows(&self) -> Vec<Vec<Option<f64>>> {
        (0..self.size)
            .map(|i| (0..self.size).map(|j| self.get(i, j)).collect())
            .collect()
    }
}

/// One tick's live market data as delivered by the snapshot provider
#[derive(Debug, Clone)]
pub struct LiveSnapshot {
    pub tick_ts: i64,
    pub coins: Vec<String>,
    pub benchmark: MatrixGrid,
    pub pct24h: MatrixGrid,
}

impl LiveSnapshot {
    pub fn validate(&self) -> MatrixResult<()> {
        let n = self.coins.len();
        if self.benchmark.size() != n || self.pct24h.size() != n {
            return Err(MatrixError::InvalidSnapshot(format!(
                "grid sizes {}/{} do not match {} coins",
                self.benchmark.size(),
                self.pct24h.size(),
                n
            )));
        }
        Ok(())
    }
}

/// Current Unix timestamp in milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
