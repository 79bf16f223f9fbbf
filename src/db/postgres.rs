use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

use super::enums::{IntervalUnit, ServiceStatus};
use super::models::{EventRecord, IntervalSpec, ServiceDescriptor, StatusCounts};
use super::{MonitorRepository, RepositoryError};

const SERVICE_COLUMNS: &str = "
    SELECT hs.id,
           hs.host_id,
           hs.service_id,
           hs.active,
           hs.scheduler_number,
           hs.scheduler_unit,
           hs.last_check,
           hs.status,
           hs.last_message,
           s.service_name,
           s.icon,
           h.host_name,
           h.url
    FROM host_services hs
    LEFT JOIN hosts h ON hs.host_id = h.id
    LEFT JOIN services s ON hs.service_id = s.id";

/// Repository backed by the monitoring Postgres schema
/// (`hosts`, `services`, `host_services`, `events`).
///
/// Timestamps are stored as UTC `timestamp` columns; the zero time written by
/// older rows for "never checked" is read back as `None`.
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, RepositoryError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }
}

fn row_to_descriptor(row: &PgRow) -> Result<ServiceDescriptor, RepositoryError> {
    let status: String = row.try_get("status")?;
    let unit: String = row.try_get("scheduler_unit")?;
    let number: i32 = row.try_get("scheduler_number")?;
    let active: i32 = row.try_get("active")?;

    let number = u32::try_from(number)
        .map_err(|_| RepositoryError::InvalidData(format!("scheduler_number {number}")))?;
    let unit: IntervalUnit = unit
        .parse()
        .map_err(|e| RepositoryError::InvalidData(format!("{e}")))?;
    let status: ServiceStatus = status
        .parse()
        .map_err(|e| RepositoryError::InvalidData(format!("{e}")))?;

    Ok(ServiceDescriptor {
        id: row.try_get("id")?,
        host_id: row.try_get("host_id")?,
        host_name: row
            .try_get::<Option<String>, _>("host_name")?
            .unwrap_or_default(),
        host_url: row.try_get::<Option<String>, _>("url")?.unwrap_or_default(),
        service_type_id: row.try_get("service_id")?,
        service_name: row
            .try_get::<Option<String>, _>("service_name")?
            .unwrap_or_default(),
        icon: row.try_get::<Option<String>, _>("icon")?.unwrap_or_default(),
        active: active == 1,
        schedule: IntervalSpec::new(number, unit),
        status,
        last_message: row
            .try_get::<Option<String>, _>("last_message")?
            .unwrap_or_default(),
        last_check: row
            .try_get::<Option<NaiveDateTime>, _>("last_check")?
            .filter(|t| t.year() > 1)
            .map(|t| t.and_utc()),
    })
}

#[async_trait]
impl MonitorRepository for PgRepository {
    async fn get_services_to_monitor(&self) -> Result<Vec<ServiceDescriptor>, RepositoryError> {
        let sql = format!(
            "{SERVICE_COLUMNS} WHERE hs.active = 1 AND h.active = 1 ORDER BY h.host_name, s.service_name"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_descriptor).collect()
    }

    async fn get_service_by_id(&self, id: i32) -> Result<ServiceDescriptor, RepositoryError> {
        let sql = format!("{SERVICE_COLUMNS} WHERE hs.id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RepositoryError::NotFound(id))?;
        row_to_descriptor(&row)
    }

    async fn update_service_status(
        &self,
        id: i32,
        status: ServiceStatus,
        message: &str,
        checked_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE host_services SET status = $1, last_message = $2, last_check = $3, updated_at = $4 WHERE id = $5",
        )
        .bind(status.as_str())
        .bind(message)
        .bind(checked_at.naive_utc())
        .bind(Utc::now().naive_utc())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(id));
        }
        Ok(())
    }

    async fn get_status_counts(&self) -> Result<StatusCounts, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                (SELECT COUNT(id) FROM host_services WHERE active = 1 AND status = 'pending') AS pending,
                (SELECT COUNT(id) FROM host_services WHERE active = 1 AND status = 'healthy') AS healthy,
                (SELECT COUNT(id) FROM host_services WHERE active = 1 AND status = 'warning') AS warning,
                (SELECT COUNT(id) FROM host_services WHERE active = 1 AND status = 'problem') AS problem",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StatusCounts {
            pending: row.try_get("pending")?,
            healthy: row.try_get("healthy")?,
            warning: row.try_get("warning")?,
            problem: row.try_get("problem")?,
        })
    }

    async fn insert_event(&self, event: &EventRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO events (host_service_id, event_type, host_id, service_name, host_name, message, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7)",
        )
        .bind(event.service_id)
        .bind(event.event_type.as_str())
        .bind(event.host_id)
        .bind(&event.service_name)
        .bind(&event.host_name)
        .bind(&event.message)
        .bind(event.created_at.naive_utc())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
