//! Live snapshot source
//!
//! The live tick (benchmark + pct24h grids) comes from an upstream HTTP
//! service. Requests are bounded by a timeout budget; callers decide how to
//! degrade when the budget is exceeded.
//!
//! ## Wire format
//!
//! ```json
//! { "tick": 1700000000000,
//!   "coins": ["USDT", "BTC", "ETH"],
//!   "benchmarkGrid": [[null, 0.00002, ...], ...],
//!   "pct24hGrid": [[null, 0.013, ...], ...] }
//! ```
//!
//! `pct24hGrid` is optional. Grids are re-indexed onto the requested
//! universe; coins the upstream did not return become null cells.

use crate::error::{MatrixError, MatrixResult};
use crate::types::{now_ms, LiveSnapshot, MatrixGrid};
use crate::universe::CoinUniverse;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

#[async_trait]
pub trait LiveSnapshotProvider: Send + Sync {
    async fn fetch(&self, universe: &CoinUniverse) -> MatrixResult<LiveSnapshot>;
}

/// Raw upstream response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPayload {
    /// Upstream tick; local clock when omitted
    #[serde(default)]
    pub tick: Option<i64>,
    pub coins: Vec<String>,
    pub benchmark_grid: Vec<Vec<Option<f64>>>,
    #[serde(default)]
    pub pct24h_grid: Option<Vec<Vec<Option<f64>>>>,
}

impl SnapshotPayload {
    /// Convert into a snapshot aligned with `universe`
    pub fn into_snapshot(self, universe: &CoinUniverse) -> MatrixResult<LiveSnapshot> {
        let tick_ts = self.tick.unwrap_or_else(|| {
            let now = now_ms();
            log::debug!("Snapshot without tick, stamping local time {}", now);
            now
        });

        let upstream: HashMap<String, usize> = self
            .coins
            .iter()
            .enumerate()
            .map(|(i, c)| (c.trim().to_uppercase(), i))
            .collect();

        let benchmark = MatrixGrid::from_rows(self.benchmark_grid)?;
        if benchmark.size() != self.coins.len() {
            return Err(MatrixError::InvalidSnapshot(format!(
                "benchmarkGrid is {}x{} for {} coins",
                benchmark.size(),
                benchmark.size(),
                self.coins.len()
            )));
        }

        let pct24h = match self.pct24h_grid {
            Some(rows) => MatrixGrid::from_rows(rows)?,
            None => {
                log::warn!(
                    "⚠️  Snapshot @ {} has no pct24hGrid, storing nothing for pct24h",
                    tick_ts
                );
                MatrixGrid::empty(self.coins.len())
            }
        };

        let coins = universe.coins().to_vec();
        let positions: Vec<Option<usize>> =
            coins.iter().map(|c| upstream.get(c).copied()).collect();

        Ok(LiveSnapshot {
            tick_ts,
            benchmark: reindex(&benchmark, &positions),
            pct24h: reindex(&pct24h, &positions),
            coins,
        })
    }
}

fn reindex(grid: &MatrixGrid, positions: &[Option<usize>]) -> MatrixGrid {
    let mut out = MatrixGrid::empty(positions.len());
    for (i, src_i) in positions.iter().enumerate() {
        for (j, src_j) in positions.iter().enumerate() {
            if let (Some(a), Some(b)) = (src_i, src_j) {
                out.set(i, j, grid.get(*a, *b));
            }
        }
    }
    out
}

/// Snapshot provider backed by an HTTP endpoint
///
/// Transport failures are classified so callers can degrade: a stalled
/// request is `ProviderTimeout`, an unreachable endpoint is
/// `ProviderUnavailable`, an undecodable body is `InvalidSnapshot`.
pub struct HttpSnapshotProvider {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpSnapshotProvider {
    pub fn new(url: impl Into<String>, timeout: Duration) -> MatrixResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            timeout,
        })
    }

    fn classify(&self, err: reqwest::Error) -> MatrixError {
        if err.is_timeout() {
            MatrixError::ProviderTimeout(self.timeout)
        } else if err.is_connect() {
            MatrixError::ProviderUnavailable(format!("snapshot endpoint unreachable: {}", err))
        } else if err.is_decode() {
            MatrixError::InvalidSnapshot(format!("undecodable snapshot body: {}", err))
        } else {
            MatrixError::Http(err)
        }
    }
}

#[async_trait]
impl LiveSnapshotProvider for HttpSnapshotProvider {
    async fn fetch(&self, universe: &CoinUniverse) -> MatrixResult<LiveSnapshot> {
        let query = [
            ("coins", universe.coins().join(",")),
            ("quote", universe.quote().to_string()),
        ];
        let response = self
            .client
            .get(&self.url)
            .query(&query)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        if !response.status().is_success() {
            return Err(MatrixError::ProviderUnavailable(format!(
                "snapshot endpoint returned {}",
                response.status()
            )));
        }

        let payload: SnapshotPayload = response.json().await.map_err(|e| self.classify(e))?;
        payload.into_snapshot(universe)
    }
}

/// Fetch with a hard budget; an overrun is `ProviderTimeout`
pub async fn fetch_with_timeout(
    provider: &dyn LiveSnapshotProvider,
    universe: &CoinUniverse,
    budget: Duration,
) -> MatrixResult<LiveSnapshot> {
    match tokio::time::timeout(budget, provider.fetch(universe)).await {
        Ok(result) => result,
        Err(_) => Err(MatrixError::ProviderTimeout(budget)),
    }
}
