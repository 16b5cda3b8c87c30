use crate::error::WalletError;
use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::time::Duration;

pub mod pending_invoice;
mod schema;
pub mod sub_account;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;

/// Every pooled connection runs in WAL mode with foreign keys on, so the
/// ledger survives abrupt termination with committed transactions intact.
#[derive(Debug, Clone, Copy)]
struct WalConnectionCustomizer;

impl diesel::r2d2::CustomizeConnection<SqliteConnection, diesel::r2d2::Error>
    for WalConnectionCustomizer
{
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(
            "PRAGMA journal_mode = WAL; \
             PRAGMA synchronous = NORMAL; \
             PRAGMA foreign_keys = ON; \
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Open the ledger database, build the connection pool, and run migrations.
pub fn connect(db_path: &str) -> anyhow::Result<DbPool> {
    let manager = ConnectionManager::<SqliteConnection>::new(db_path);
    let pool = Pool::builder()
        .max_size(16)
        .test_on_check_out(true)
        .connection_customizer(Box::new(WalConnectionCustomizer))
        .build(manager)?;

    let mut conn = pool.get()?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("migrations could not run: {e}"))?;
    drop(conn);

    Ok(pool)
}

pub(crate) fn now() -> chrono::NaiveDateTime {
    chrono::Utc::now().naive_utc()
}

/// Re-run a ledger transaction on transient serialization failures only,
/// up to three retries with exponential backoff.
pub(crate) fn with_serialization_retry<T, F>(mut op: F) -> Result<T, WalletError>
where
    F: FnMut() -> Result<T, WalletError>,
{
    let mut delay = Duration::from_millis(50);
    let mut attempt = 0;
    loop {
        match op() {
            Err(e) if e.is_transient() && attempt < 3 => {
                attempt += 1;
                log::warn!("ledger transaction aborted ({e}), retry {attempt}/3");
                std::thread::sleep(delay);
                delay *= 2;
            }
            other => return other,
        }
    }
}
