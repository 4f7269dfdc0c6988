//! Connections behind the SQLite suspension store.
//!
//! `peek` and `list_due` read through `reader`. Saving, deleting and the
//! compare-and-consume of a suspension go through `writer`, which holds a
//! single connection so two resumes of one execution cannot interleave.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

/// Reader and writer pools over one suspension database file in WAL mode.
#[derive(Clone)]
pub struct DatabasePool {
    /// Up to 8 read-only connections.
    pub reader: SqlitePool,
    /// Exactly one connection; every consume is serialized through it.
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open (creating if needed) the database at `database_url` and bring
    /// the `suspensions` table up to date before any reader connects.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let base_opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .create_if_missing(true);

        let read_opts = base_opts.clone().read_only(true);
        let write_opts = base_opts;

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(write_opts)
            .await?;

        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(read_opts)
            .await?;

        tracing::debug!(database_url, "suspension database ready");
        Ok(Self { reader, writer })
    }
}

/// Default database URL: `STEPCHAIN_DATA_DIR` if set, otherwise
/// `stepchain/` under the platform data directory (`~/.stepchain` as a last
/// resort).
pub fn default_database_url() -> String {
    let data_dir = std::env::var("STEPCHAIN_DATA_DIR").unwrap_or_else(|_| {
        dirs::data_dir()
            .map(|dir| dir.join("stepchain").display().to_string())
            .unwrap_or_else(|| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                format!("{home}/.stepchain")
            })
    });
    format!("sqlite://{data_dir}/stepchain.db")
}
