use anyhow::{Context, Result};
use diesel::{Connection, pg::PgConnection};
use diesel_async::{
    AsyncPgConnection,
    pooled_connection::{AsyncDieselConnectionManager, bb8::Pool},
};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};

pub type DbPool = Pool<AsyncPgConnection>;

/// Embedded so the binaries carry their schema with them.
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub async fn connect(url: &str) -> Result<DbPool> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(url);
    Pool::builder()
        .build(manager)
        .await
        .context("Failed to build a DB connection pool")
}

/// Runs pending migrations on a blocking thread, returning how many were applied.
pub async fn run_migrations_blocking(migrations: EmbeddedMigrations, url: &str) -> Result<usize> {
    let url = url.to_string();
    tokio::task::spawn_blocking(move || {
        let mut conn =
            PgConnection::establish(&url).context("Failed to connect for migrations")?;
        let applied = conn
            .run_pending_migrations(migrations)
            .map_err(|err| anyhow::anyhow!("Failed to run migrations: {err}"))?;
        Ok(applied.len())
    })
    .await
    .context("Migration task panicked")?
}
