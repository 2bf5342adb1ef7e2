use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use time::{Duration, OffsetDateTime};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// One persisted usage bucket: totals for a (day, machine) pair.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DayBucket {
    pub day: String, // YYYY-MM-DD
    pub machine: i64,
    pub starts: i64,
    pub runtime_ms: i64,
}

/// Render accumulated runtime the way the dashboard shows it:
/// "2h 15m", or "45m" under an hour, "0m" for nothing.
pub fn format_runtime(ms: i64) -> String {
    let mins = ms.max(0) / 60_000;
    let (h, m) = (mins / 60, mins % 60);
    if h > 0 {
        format!("{h}h {m}m")
    } else {
        format!("{m}m")
    }
}

impl Db {
    /// db_url examples:
    /// - "sqlite:laundry.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // Single connection: every write goes through the engine task, and
        // a second pooled connection to ":memory:" would be a different db.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            // No background reaper: a single long-lived connection never needs
            // idle/lifetime eviction, and the reaper's periodic timer would
            // otherwise be the only non-test timer in the system.
            .max_lifetime(None)
            .idle_timeout(None)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations. A missing or empty database
    /// file comes out of this as "no history yet", never an error.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Day keys
    // ----------------------------

    pub fn today_utc() -> String {
        Self::day_key(OffsetDateTime::now_utc())
    }

    /// First day (inclusive) of a trailing window ending today.
    /// `days_back = 1` means "today only".
    pub fn window_start(days_back: i64) -> String {
        let days_back = days_back.max(1);
        Self::day_key(OffsetDateTime::now_utc() - Duration::days(days_back - 1))
    }

    fn day_key(t: OffsetDateTime) -> String {
        format!("{:04}-{:02}-{:02}", t.year(), t.month() as u8, t.day())
    }

    // ----------------------------
    // Usage counters
    // ----------------------------

    /// Increment the start counter for a (day, machine) bucket, creating
    /// the bucket if absent.
    pub async fn record_start(&self, machine: i64, day: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_days (day, machine, starts, runtime_ms)
            VALUES (?, ?, 1, 0)
            ON CONFLICT(day, machine) DO UPDATE SET starts = starts + 1
            "#,
        )
        .bind(day)
        .bind(machine)
        .execute(&self.pool)
        .await
        .context("record_start failed")?;
        Ok(())
    }

    /// Add to the runtime accumulator for a (day, machine) bucket,
    /// creating the bucket if absent.
    pub async fn add_runtime(&self, machine: i64, day: &str, delta_ms: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_days (day, machine, starts, runtime_ms)
            VALUES (?, ?, 0, ?)
            ON CONFLICT(day, machine) DO UPDATE SET
              runtime_ms = runtime_ms + excluded.runtime_ms
            "#,
        )
        .bind(day)
        .bind(machine)
        .bind(delta_ms.max(0))
        .execute(&self.pool)
        .await
        .context("add_runtime failed")?;
        Ok(())
    }

    /// All buckets from `start_day` (inclusive) onward, newest day first.
    /// ISO day keys compare correctly as strings.
    pub async fn usage_since(&self, start_day: &str) -> Result<Vec<DayBucket>> {
        sqlx::query_as::<_, DayBucket>(
            r#"
            SELECT day, machine, starts, runtime_ms
            FROM usage_days
            WHERE day >= ?
            ORDER BY day DESC, machine ASC
            "#,
        )
        .bind(start_day)
        .fetch_all(&self.pool)
        .await
        .context("usage_since failed")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
