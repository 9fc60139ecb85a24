//! SQLite persistence for service lifecycle bookkeeping

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, FromRow, SqlitePool};

use crate::domain::service::{HealthStatus, ServiceState, ServiceStatus};
use crate::error::{Error, Result};

/// Database row for a service state
#[derive(Debug, FromRow)]
struct ServiceStateRow {
    id: String,
    status: String,
    health: String,
    restart_count: i64,
    auto_restarts: i64,
    last_error: Option<String>,
    container_id: Option<String>,
    started_at: Option<String>,
    last_health_check: Option<String>,
    updated_at: String,
}

/// Persisted bookkeeping of one service
#[derive(Debug, Clone)]
pub struct PersistedState {
    pub id: String,
    pub state: ServiceState,
}

fn parse_time(field: &str, value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", field, e)))?
        .with_timezone(&Utc))
}

fn parse_optional_time(field: &str, value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_time(field, v)).transpose()
}

impl TryFrom<ServiceStateRow> for PersistedState {
    type Error = Error;

    fn try_from(row: ServiceStateRow) -> Result<Self> {
        let status = ServiceStatus::from_str(&row.status)
            .ok_or_else(|| Error::Internal(format!("Invalid service status: {}", row.status)))?;

        Ok(PersistedState {
            id: row.id,
            state: ServiceState {
                status,
                health: HealthStatus::from_str(&row.health),
                restart_count: row.restart_count.max(0) as u32,
                auto_restarts: row.auto_restarts.max(0) as u32,
                container_id: row.container_id,
                started_at: parse_optional_time("started_at", row.started_at.as_deref())?,
                last_health_check: parse_optional_time(
                    "last_health_check",
                    row.last_health_check.as_deref(),
                )?,
                last_error: row.last_error,
                last_known_status: Some(status),
                updated_at: parse_time("updated_at", &row.updated_at)?,
            },
        })
    }
}

/// Service state repository for database operations
pub struct ServiceStateRepository {
    pool: SqlitePool,
}

impl ServiceStateRepository {
    /// Create a new repository with the given pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database connection pool
    pub async fn init(database_url: &str) -> Result<SqlitePool> {
        // Ensure parent directory exists
        if let Some(path) = database_url.strip_prefix("sqlite:") {
            if let Some(path) = path.split('?').next() {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        // Enable WAL mode for better concurrent performance
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(pool)
    }

    /// Insert or replace the state of a service
    pub async fn upsert(&self, id: &str, state: &ServiceState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO service_states
                (id, status, health, restart_count, auto_restarts, last_error, container_id, started_at, last_health_check, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                health = excluded.health,
                restart_count = excluded.restart_count,
                auto_restarts = excluded.auto_restarts,
                last_error = excluded.last_error,
                container_id = excluded.container_id,
                started_at = excluded.started_at,
                last_health_check = excluded.last_health_check,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(id)
        .bind(state.status.as_str())
        .bind(state.health.as_str())
        .bind(state.restart_count as i64)
        .bind(state.auto_restarts as i64)
        .bind(&state.last_error)
        .bind(&state.container_id)
        .bind(state.started_at.map(|t| t.to_rfc3339()))
        .bind(state.last_health_check.map(|t| t.to_rfc3339()))
        .bind(state.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get the persisted state of a service
    pub async fn get(&self, id: &str) -> Result<Option<PersistedState>> {
        let row: Option<ServiceStateRow> = sqlx::query_as(
            r#"
            SELECT id, status, health, restart_count, auto_restarts, last_error, container_id, started_at, last_health_check, updated_at
            FROM service_states
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PersistedState::try_from).transpose()
    }

    /// List every persisted service state
    pub async fn list(&self) -> Result<Vec<PersistedState>> {
        let rows: Vec<ServiceStateRow> = sqlx::query_as(
            r#"
            SELECT id, status, health, restart_count, auto_restarts, last_error, container_id, started_at, last_health_check, updated_at
            FROM service_states
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Delete the persisted state of a service
    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM service_states WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::ServiceNotFound(id.to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) async fn create_test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test pool");

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("Failed to run migrations");

        pool
    }

    #[tokio::test]
    async fn test_upsert_and_get_state() {
        let repo = ServiceStateRepository::new(create_test_pool().await);

        let mut state = ServiceState::default();
        state.transition_to(ServiceStatus::Starting);
        state.transition_to(ServiceStatus::Running);
        state.started_at = Some(Utc::now());
        state.container_id = Some("abc123".to_string());

        repo.upsert("ollama", &state).await.expect("Failed to upsert");

        let fetched = repo
            .get("ollama")
            .await
            .expect("Failed to get")
            .expect("State missing");
        assert_eq!(fetched.state.status, ServiceStatus::Running);
        assert_eq!(fetched.state.last_known_status, Some(ServiceStatus::Running));
        assert_eq!(fetched.state.container_id.as_deref(), Some("abc123"));
        assert!(fetched.state.started_at.is_some());
    }

    #[tokio::test]
    async fn test_upsert_overwrites_previous_row() {
        let repo = ServiceStateRepository::new(create_test_pool().await);

        let mut state = ServiceState::default();
        repo.upsert("db", &state).await.expect("Failed to upsert");

        state.restart_count = 2;
        state.last_error = Some("health check failed".to_string());
        state.transition_to(ServiceStatus::Starting);
        state.transition_to(ServiceStatus::Error);
        repo.upsert("db", &state).await.expect("Failed to upsert");

        let all = repo.list().await.expect("Failed to list");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].state.restart_count, 2);
        assert_eq!(all[0].state.status, ServiceStatus::Error);
        assert_eq!(
            all[0].state.last_error.as_deref(),
            Some("health check failed")
        );
    }

    #[tokio::test]
    async fn test_get_missing_and_delete() {
        let repo = ServiceStateRepository::new(create_test_pool().await);
        assert!(repo.get("nope").await.expect("Failed to get").is_none());

        repo.upsert("tmp", &ServiceState::default())
            .await
            .expect("Failed to upsert");
        repo.delete("tmp").await.expect("Failed to delete");
        assert!(matches!(
            repo.delete("tmp").await,
            Err(Error::ServiceNotFound(_))
        ));
    }
}
