//! Runtime configuration from environment variables

use crate::types::SessionKey;
use crate::universe::CoinUniverse;
use std::env;
use std::time::Duration;

/// Configuration for the matrix runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct MatrixConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Directory holding `*.sql` migrations
    pub schema_dir: String,

    /// Live snapshot endpoint
    pub snapshot_url: String,

    /// Budget for one live snapshot fetch in milliseconds
    pub snapshot_timeout_ms: u64,

    /// Tick interval in milliseconds
    pub tick_interval_ms: u64,

    pub quote: String,

    pub coins: Vec<String>,

    /// Session the runtime ticks for (`None` → global)
    pub session: Option<String>,

    /// Master enable flag for the runtime
    pub enabled: bool,
}

impl MatrixConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `MATRIX_DB_PATH` (default: matrixflow.db)
    /// - `MATRIX_SCHEMA_DIR` (default: sql)
    /// - `MATRIX_SNAPSHOT_URL` (default: http://127.0.0.1:8080/snapshot)
    /// - `MATRIX_SNAPSHOT_TIMEOUT_MS` (default: 4000)
    /// - `MATRIX_TICK_INTERVAL_MS` (default: 40000)
    /// - `MATRIX_QUOTE` (default: USDT)
    /// - `MATRIX_COINS` (default: BTC,ETH; comma-separated)
    /// - `MATRIX_SESSION` (default: unset)
    /// - `ENABLE_MATRIX_RUNTIME` (default: false)
    pub fn from_env() -> Self {
        Self {
            db_path: env::var("MATRIX_DB_PATH").unwrap_or_else(|_| "matrixflow.db".to_string()),

            schema_dir: env::var("MATRIX_SCHEMA_DIR").unwrap_or_else(|_| "sql".to_string()),

            snapshot_url: env::var("MATRIX_SNAPSHOT_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8080/snapshot".to_string()),

            snapshot_timeout_ms: env::var("MATRIX_SNAPSHOT_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(4_000),

            tick_interval_ms: env::var("MATRIX_TICK_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(40_000),

            quote: env::var("MATRIX_QUOTE").unwrap_or_else(|_| "USDT".to_string()),

            coins: env::var("MATRIX_COINS")
                .map(|s| {
                    s.split(',')
                        .map(|c| c.trim().to_string())
                        .filter(|c| !c.is_empty())
                        .collect()
                })
                .unwrap_or_else(|_| vec!["BTC".to_string(), "ETH".to_string()]),

            session: env::var("MATRIX_SESSION").ok().filter(|s| !s.trim().is_empty()),

            enabled: env::var("ENABLE_MATRIX_RUNTIME")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(false),
        }
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }

    pub fn universe(&self) -> CoinUniverse {
        CoinUniverse::new(&self.quote, &self.coins)
    }

    pub fn session_key(&self) -> SessionKey {
        self.session.as_deref().map(SessionKey::new).unwrap_or_else(SessionKey::global)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env vars are process-wide; serialize the tests touching them
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const VARS: [&str; 9] = [
        "MATRIX_DB_PATH",
        "MATRIX_SCHEMA_DIR",
        "MATRIX_SNAPSHOT_URL",
        "MATRIX_SNAPSHOT_TIMEOUT_MS",
        "MATRIX_TICK_INTERVAL_MS",
        "MATRIX_QUOTE",
        "MATRIX_COINS",
        "MATRIX_SESSION",
        "ENABLE_MATRIX_RUNTIME",
    ];

    fn clear() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear();

        let config = MatrixConfig::from_env();

        assert_eq!(config.db_path, "matrixflow.db");
        assert_eq!(config.schema_dir, "sql");
        assert_eq!(config.snapshot_timeout(), Duration::from_millis(4_000));
        assert_eq!(config.tick_interval_ms, 40_000);
        assert_eq!(config.universe().coins(), ["USDT", "BTC", "ETH"]);
        assert!(config.session_key().is_global());
        assert!(!config.enabled);
    }

    #[test]
    fn test_custom_config() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear();
        env::set_var("MATRIX_DB_PATH", "/tmp/test.db");
        env::set_var("MATRIX_SNAPSHOT_TIMEOUT_MS", "250");
        env::set_var("MATRIX_QUOTE", "btc");
        env::set_var("MATRIX_COINS", "eth, sol,,ETH");
        env::set_var("MATRIX_SESSION", "desk-7");
        env::set_var("ENABLE_MATRIX_RUNTIME", "true");

        let config = MatrixConfig::from_env();

        assert_eq!(config.db_path, "/tmp/test.db");
        assert_eq!(config.snapshot_timeout_ms, 250);
        assert_eq!(config.universe().coins(), ["BTC", "ETH", "SOL"]);
        assert_eq!(config.session_key().as_str(), "desk-7");
        assert!(config.enabled);

        clear();
    }
}
