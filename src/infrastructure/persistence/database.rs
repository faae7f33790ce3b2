use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

/// Pool-backed database wrapper.
///
/// Long-running session drivers never pin a connection: every operation
/// acquires from the pool, so each phase of a session (init, loop body,
/// finalize) works on fresh connections.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        // Ensure the directory exists if it's a file path
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent()
                && !parent.exists()
            {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create database directory")?;
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal); // Better for concurrency

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        info!("Connected to database: {}", db_url);

        let db = Self { pool };
        db.init().await?;

        Ok(db)
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                mode TEXT NOT NULL,
                model TEXT NOT NULL,
                strategy_prompt TEXT NOT NULL,
                indicators TEXT NOT NULL,
                custom_indicators TEXT,
                api_key_id TEXT,
                created_at INTEGER DEFAULT (strftime('%s', 'now'))
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create agents table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                encrypted_key TEXT NOT NULL,
                key_prefix TEXT NOT NULL,
                created_at INTEGER DEFAULT (strftime('%s', 'now'))
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create api_keys table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS test_sessions (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                session_type TEXT NOT NULL,
                status TEXT NOT NULL,
                asset TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                starting_capital REAL NOT NULL,
                current_equity REAL,
                current_pnl_pct REAL,
                max_drawdown_pct REAL,
                elapsed_seconds INTEGER,
                current_candle INTEGER,
                total_candles INTEGER,
                open_position TEXT,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                paused_at INTEGER,
                completed_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_status
            ON test_sessions (status);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create test_sessions table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                trade_number INTEGER NOT NULL,
                side TEXT NOT NULL,
                entry_price REAL NOT NULL,
                exit_price REAL NOT NULL,
                size REAL NOT NULL,
                pnl REAL NOT NULL,
                pnl_pct REAL NOT NULL,
                entry_time INTEGER NOT NULL,
                exit_time INTEGER NOT NULL,
                reason TEXT NOT NULL,
                leverage INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_session
            ON trades (session_id, trade_number);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create trades table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ai_thoughts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                candle_number INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                candle TEXT NOT NULL,
                indicators TEXT NOT NULL,
                reasoning TEXT NOT NULL,
                decision TEXT NOT NULL,
                order_data TEXT,
                council TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_thoughts_session
            ON ai_thoughts (session_id, candle_number);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create ai_thoughts table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS test_results (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                final_equity REAL NOT NULL,
                total_pnl REAL NOT NULL,
                total_pnl_pct REAL NOT NULL,
                total_trades INTEGER NOT NULL,
                winning_trades INTEGER NOT NULL,
                losing_trades INTEGER NOT NULL,
                win_rate REAL NOT NULL,
                profit_factor REAL NOT NULL,
                largest_win REAL NOT NULL,
                largest_loss REAL NOT NULL,
                max_drawdown_pct REAL NOT NULL,
                equity_curve TEXT,
                forced_stop INTEGER NOT NULL DEFAULT 0,
                auto_stop INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_results_session
            ON test_results (session_id, created_at);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create test_results table")?;

        info!("Database schema initialized.");
        Ok(())
    }
}
