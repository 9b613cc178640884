//! Coin universe resolution
//!
//! The resolver is an external collaborator; the core only relies on the
//! universe being ordered, deduplicated, and containing the quote asset.

use crate::error::MatrixResult;
use crate::types::SessionKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Ordered, deduplicated coin list with the quote asset first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinUniverse {
    quote: String,
    coins: Vec<String>,
}

impl CoinUniverse {
    /// Symbols are trimmed and upper-cased; blanks and repeats are dropped
    pub fn new(quote: &str, coins: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        let quote = normalize_symbol(quote);
        let mut seen = HashSet::new();
        let mut ordered = Vec::new();

        if !quote.is_empty() {
            seen.insert(quote.clone());
            ordered.push(quote.clone());
        }

        for coin in coins {
            let symbol = normalize_symbol(coin.as_ref());
            if symbol.is_empty() || !seen.insert(symbol.clone()) {
                continue;
            }
            ordered.push(symbol);
        }

        Self {
            quote,
            coins: ordered,
        }
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }

    pub fn coins(&self) -> &[String] {
        &self.coins
    }

    pub fn len(&self) -> usize {
        self.coins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coins.is_empty()
    }

    pub fn index_of(&self, symbol: &str) -> Option<usize> {
        self.coins.iter().position(|c| c == symbol)
    }
}

fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

/// Supplies the coin universe for a session
#[async_trait]
pub trait CoinUniverseResolver: Send + Sync {
    async fn resolve(&self, session: &SessionKey) -> MatrixResult<CoinUniverse>;
}

/// Resolver returning the same configured universe for every session
pub struct StaticUniverseResolver {
    universe: CoinUniverse,
}

impl StaticUniverseResolver {
    pub fn new(universe: CoinUniverse) -> Self {
        Self { universe }
    }
}

#[async_trait]
impl CoinUniverseResolver for StaticUniverseResolver {
    async fn resolve(&self, _session: &SessionKey) -> MatrixResult<CoinUniverse> {
        Ok(self.universe.clone())
    }
}
