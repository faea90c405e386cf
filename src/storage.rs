use std::path::PathBuf;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{Pool, Row, Sqlite, sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous}};
use tokio::sync::watch;

use crate::models::{NewTrip, NewUser, Trip, TripCategory, User};

#[async_trait]
pub trait TripRepository: Send + Sync {
    async fn list_trips(&self) -> anyhow::Result<Vec<Trip>>;
    async fn get_trip_by_id(&self, id: i64) -> anyhow::Result<Option<Trip>>;
    async fn insert_trip(&self, trip: NewTrip) -> anyhow::Result<Trip>;
    async fn update_trip(&self, trip: &Trip) -> anyhow::Result<bool>;
    async fn delete_trip(&self, id: i64) -> anyhow::Result<bool>;

    async fn insert_user(&self, user: NewUser) -> anyhow::Result<User>;
    async fn find_user_by_email(&self, email: &str) -> anyhow::Result<Option<User>>;
    async fn list_users(&self) -> anyhow::Result<Vec<User>>;

    /// Revision counter bumped on every trip mutation; observers re-list
    /// when the value changes.
    fn watch_changes(&self) -> watch::Receiver<u64>;
}

#[derive(Clone)]
pub struct SqliteTripRepository {
    pool: Pool<Sqlite>,
    changes: watch::Sender<u64>,
}

impl SqliteTripRepository {
    pub async fn initialize(database_url: Option<String>) -> anyhow::Result<Self> {
        let url = match database_url {
            Some(u) => u,
            None => resolve_default_db_url()?,
        };
        let options = url.parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = Pool::<Sqlite>::connect_with(options).await?;
        sqlx::query("PRAGMA busy_timeout = 5000;").execute(&pool).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        let (changes, _) = watch::channel(0u64);
        Ok(Self { pool, changes })
    }

    fn bump_revision(&self) {
        self.changes.send_modify(|rev| *rev += 1);
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> { &self.pool }
}

fn resolve_default_db_url() -> anyhow::Result<String> {
    let base = std::env::var("XDG_DATA_HOME").ok().map(PathBuf::from).unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".local").join("share")
    });
    let dir = base.join("tripbook");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("tripbook.db");
    Ok(format!("sqlite://{}", path.to_string_lossy()))
}

fn trip_from_row(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Trip> {
    let category: String = row.get("category");
    let start: String = row.get("start_date");
    let end: String = row.get("end_date");
    Ok(Trip {
        id: row.get("id"),
        destination: row.get("destination"),
        category: category.parse::<TripCategory>().map_err(anyhow::Error::msg)?,
        start_date: NaiveDate::parse_from_str(&start, "%Y-%m-%d")?,
        end_date: NaiveDate::parse_from_str(&end, "%Y-%m-%d")?,
        budget: row.get("budget"),
    })
}

fn user_from_row(row: &sqlx::sqlite::SqliteRow) -> User {
    User {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        password: row.get("password"),
    }
}

#[async_trait]
impl TripRepository for SqliteTripRepository {
    async fn list_trips(&self) -> anyhow::Result<Vec<Trip>> {
        let rows = sqlx::query(
            "SELECT id, destination, category, start_date, end_date, budget FROM trips ORDER BY start_date DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(trip_from_row).collect()
    }

    async fn get_trip_by_id(&self, id: i64) -> anyhow::Result<Option<Trip>> {
        let row = sqlx::query(
            "SELECT id, destination, category, start_date, end_date, budget FROM trips WHERE id = ?1 LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(trip_from_row).transpose()
    }

    async fn insert_trip(&self, trip: NewTrip) -> anyhow::Result<Trip> {
        let res = sqlx::query(
            "INSERT INTO trips (destination, category, start_date, end_date, budget) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&trip.destination)
        .bind(trip.category.as_str())
        .bind(trip.start_date.format("%Y-%m-%d").to_string())
        .bind(trip.end_date.format("%Y-%m-%d").to_string())
        .bind(trip.budget)
        .execute(&self.pool)
        .await?;
        self.bump_revision();
        Ok(Trip {
            id: res.last_insert_rowid(),
            destination: trip.destination,
            category: trip.category,
            start_date: trip.start_date,
            end_date: trip.end_date,
            budget: trip.budget,
        })
    }

    async fn update_trip(&self, trip: &Trip) -> anyhow::Result<bool> {
        let res = sqlx::query(
            "UPDATE trips SET destination = ?1, category = ?2, start_date = ?3, end_date = ?4, budget = ?5 WHERE id = ?6",
        )
        .bind(&trip.destination)
        .bind(trip.category.as_str())
        .bind(trip.start_date.format("%Y-%m-%d").to_string())
        .bind(trip.end_date.format("%Y-%m-%d").to_string())
        .bind(trip.budget)
        .bind(trip.id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() > 0 {
            self.bump_revision();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn delete_trip(&self, id: i64) -> anyhow::Result<bool> {
        let res = sqlx::query("DELETE FROM trips WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() > 0 {
            self.bump_revision();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn insert_user(&self, user: NewUser) -> anyhow::Result<User> {
        let res = sqlx::query("INSERT INTO users (name, email, password) VALUES (?1, ?2, ?3)")
            .bind(&user.name)
            .bind(&user.email)
            .bind(&user.password)
            .execute(&self.pool)
            .await?;
        Ok(User {
            id: res.last_insert_rowid(),
            name: user.name,
            email: user.email,
            password: user.password,
        })
    }

    async fn find_user_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        let row = sqlx::query("SELECT id, name, email, password FROM users WHERE email = ?1 LIMIT 1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn list_users(&self) -> anyhow::Result<Vec<User>> {
        let rows = sqlx::query("SELECT id, name, email, password FROM users ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(user_from_row).collect())
    }

    fn watch_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}
