use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePoolOptions, Row, Sqlite, SqlitePool};
use std::path::Path;

// Logical keys the chat engine persists under.
pub const SETTINGS_KEY: &str = "settings";
pub const TOOLS_KEY: &str = "tools";
pub const HISTORY_KEY: &str = "history_default";
pub const SYSTEM_PROMPT_KEY: &str = "system_prompt";

/// Key-value persistence contract. Values are JSON; a missing key loads
/// as `None` and callers substitute their defaults. Each save is
/// last-writer-wins, there is no optimistic concurrency.
#[async_trait]
pub trait Store: Send + Sync {
    async fn save(&self, key: &str, value: &serde_json::Value) -> Result<(), anyhow::Error>;
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>, anyhow::Error>;
    async fn remove(&self, key: &str) -> Result<(), anyhow::Error>;
}

/// Serializes `value` and saves it under `key`.
pub async fn save_value<T: Serialize + ?Sized>(
    store: &dyn Store,
    key: &str,
    value: &T,
) -> Result<(), anyhow::Error> {
    let value = serde_json::to_value(value).context("Failed to serialize value for storage")?;
    store.save(key, &value).await
}

/// Loads and deserializes the value under `key`, `None` when absent.
pub async fn load_value<T: DeserializeOwned>(
    store: &dyn Store,
    key: &str,
) -> Result<Option<T>, anyhow::Error> {
    match store.load(key).await? {
        Some(value) => {
            let parsed = serde_json::from_value(value)
                .with_context(|| format!("Failed to deserialize stored value for '{key}'"))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

// Define the database schema using CREATE TABLE IF NOT EXISTS statements
const MIGRATIONS_SQL: &str = "
-- Key-Value Table
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
";

/// SQLite-backed store. All state lives in a single key-value table.
#[derive(Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if necessary) the database file and runs migrations.
    pub async fn new(db_path: &Path) -> Result<Self, anyhow::Error> {
        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.to_string_lossy());
        log::info!("Connecting to database: {}", db_url);

        // Create the database file if it doesn't exist
        if !Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            log::info!("Database file not found, creating...");
            Sqlite::create_database(&db_url)
                .await
                .context("Failed to create database")?;
        }

        let pool = SqlitePoolOptions::new()
            .connect(&db_url)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// An in-memory database, handy for tests.
    pub async fn in_memory() -> Result<Self, anyhow::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory SQLite database")?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), anyhow::Error> {
        log::info!("Running database migrations...");
        sqlx::query(MIGRATIONS_SQL)
            .execute(pool)
            .await
            .context("Failed to run database migrations")?;
        log::info!("Database migrations completed.");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn save(&self, key: &str, value: &serde_json::Value) -> Result<(), anyhow::Error> {
        log::debug!("Saving value under key: {}", key);
        let text = serde_json::to_string(value).context("Failed to encode value as JSON")?;
        sqlx::query(
            "INSERT INTO kv_store (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(text)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save value under '{key}'"))?;
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>, anyhow::Error> {
        log::debug!("Loading value under key: {}", key);
        let row = sqlx::query("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to load value under '{key}'"))?;

        match row {
            Some(row) => {
                let text: String = row
                    .try_get("value")
                    .context("Failed to read stored value column")?;
                let value = serde_json::from_str(&text)
                    .with_context(|| format!("Stored value under '{key}' is not valid JSON"))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn remove(&self, key: &str) -> Result<(), anyhow::Error> {
        log::debug!("Removing value under key: {}", key);
        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to remove value under '{key}'"))?;
        Ok(())
    }
}

/// Volatile store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, serde_json::Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save(&self, key: &str, value: &serde_json::Value) -> Result<(), anyhow::Error> {
        self.entries.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>, anyhow::Error> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn remove(&self, key: &str) -> Result<(), anyhow::Error> {
        self.entries.remove(key);
        Ok(())
    }
}
