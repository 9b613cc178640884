//! SQLite-backed `BenchmarkProvider`
//!
//! Borrows the connection (usually the open tick transaction) and a session,
//! so the derived engine sees exactly what the tick has committed so far and
//! nothing from other sessions.

use crate::derived::{AnchorGrid, BenchmarkProvider};
use crate::error::MatrixResult;
use crate::query::{self, AnchorStamp};
use crate::types::{MatrixGrid, MatrixType, SessionKey};
use rusqlite::Connection;

pub struct SqliteBenchmarkProvider<'c> {
    conn: &'c Connection,
    session: &'c SessionKey,
}

impl<'c> SqliteBenchmarkProvider<'c> {
    pub fn new(conn: &'c Connection, session: &'c SessionKey) -> Self {
        Self { conn, session }
    }

    fn anchor(
        &self,
        stamp: AnchorStamp,
        coins: &[String],
        now_ts: i64,
    ) -> MatrixResult<Option<AnchorGrid>> {
        let Some(anchor) = query::anchor_tick(self.conn, self.session, stamp, now_ts)? else {
            return Ok(None);
        };

        let grid = query::grid_at(
            self.conn,
            self.session,
            MatrixType::Benchmark,
            anchor.tick_ts,
            coins,
        )?;

        Ok(Some(AnchorGrid {
            ts: anchor.stamp_ts,
            grid,
        }))
    }
}

impl BenchmarkProvider for SqliteBenchmarkProvider<'_> {
    fn get_prev(
        &self,
        matrix_type: MatrixType,
        base: &str,
        quote: &str,
        before_ts: i64,
    ) -> MatrixResult<Option<f64>> {
        query::latest_value_before(self.conn, self.session, matrix_type, base, quote, before_ts)
    }

    fn prefetch_prev(
        &self,
        matrix_type: MatrixType,
        coins: &[String],
        before_ts: i64,
    ) -> MatrixResult<MatrixGrid> {
        query::latest_values_before(self.conn, self.session, matrix_type, before_ts, coins)
    }

    // Prefetch covers every pair of the universe in one query
    fn prefetch_is_exhaustive(&self) -> bool {
        true
    }

    fn fetch_opening_grid(
        &self,
        coins: &[String],
        now_ts: i64,
    ) -> MatrixResult<Option<AnchorGrid>> {
        self.anchor(AnchorStamp::Opening, coins, now_ts)
    }

    fn fetch_snapshot_grid(
        &self,
        coins: &[String],
        now_ts: i64,
    ) -> MatrixResult<Option<AnchorGrid>> {
        self.anchor(AnchorStamp::Snapshot, coins, now_ts)
    }

    fn fetch_trade_grid(&self, coins: &[String], now_ts: i64) -> MatrixResult<Option<AnchorGrid>> {
        self.anchor(AnchorStamp::Trade, coins, now_ts)
    }
}
