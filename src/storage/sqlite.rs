//! SQLite storage backend implementation
//!
//! ## Layout
//!
//! - static tables come from the sqlx migrations in `migrations/`
//! - per metric tables (`metric_<name>_current`, `metric_<name>_30m_current`,
//!   `metric_<name>_history`) are created at start-up from `metric_tables`
//!
//! Timestamps are stored as Unix milliseconds.
//!
//! ## Sessions
//!
//! Connection-scoped settings are applied again every time a connection is
//! taken for a unit of work (see [`SESSION_PRAGMAS`]). A failed statement may
//! leave a pooled connection in any state, so nothing relies on what a
//! previous user of the connection configured.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::backend::{CheckDefinition, HealthStatus, IngestedRow, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::schema::{
    AggregateLevel, Check, CollectorState, CollectorStatus, InstanceIdentity, MetricRow,
    MetricTableConfig, NotificationTarget, Recipient, StateChange, TableReport,
};
use crate::agent::{AgentEndpoint, Discovery};
use crate::config::{InstanceConfig, RoleConfig};

/// Settings applied at the start of every unit of work
const SESSION_PRAGMAS: &[&str] = &["PRAGMA foreign_keys = ON", "PRAGMA busy_timeout = 30000"];

/// Audit tables covered by the retention policy
const AUDIT_TABLES: &[&str] = &["check_changes", "state_changes"];

/// SQLite storage backend
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Open (or create) the database and bring its schema up to date
    ///
    /// ```no_run
    /// # use fleetwatch::storage::sqlite::SqliteBackend;
    /// # async fn example() -> anyhow::Result<()> {
    /// let backend = SqliteBackend::new("./fleetwatch.db").await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::MigrationFailed(e.to_string()))?;

        let backend = Self {
            pool,
            db_path: db_path_str,
        };
        backend.ensure_metric_tables().await?;

        info!("SQLite backend ready");
        Ok(backend)
    }

    /// Open the database, retrying with a growing delay
    ///
    /// The last error is returned once every attempt failed.
    pub async fn connect_with_retry(
        db_path: impl AsRef<Path>,
        attempts: u32,
    ) -> StorageResult<Self> {
        let mut attempt = 0;
        loop {
            match Self::new(db_path.as_ref()).await {
                Ok(backend) => return Ok(backend),
                Err(e) if attempt + 1 < attempts => {
                    warn!("failed to open database: {e}");
                    info!("retrying in {attempt}s");
                    tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn ensure_metric_tables(&self) -> StorageResult<()> {
        for config in self.metric_tables_config().await? {
            let current = checked_table_name(&config.current_table())?;
            let history = checked_table_name(&config.history_table())?;

            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {current} (
                    instance_id INTEGER NOT NULL
                        REFERENCES monitored_instances(instance_id) ON DELETE CASCADE,
                    datetime INTEGER NOT NULL,
                    key TEXT NOT NULL DEFAULT '',
                    record TEXT NOT NULL CHECK (json_valid(record)),
                    PRIMARY KEY (instance_id, datetime, key)
                )
                "#
            ))
            .execute(&self.pool)
            .await?;

            // `samples` rows are averaged in `record`, the newest one at `last_datetime`
            for level in AggregateLevel::ALL {
                let aggregate = checked_table_name(&config.aggregate_table(level))?;
                sqlx::query(&format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {aggregate} (
                        instance_id INTEGER NOT NULL
                            REFERENCES monitored_instances(instance_id) ON DELETE CASCADE,
                        datetime INTEGER NOT NULL,
                        key TEXT NOT NULL DEFAULT '',
                        record TEXT NOT NULL CHECK (json_valid(record)),
                        samples INTEGER NOT NULL CHECK (samples > 0),
                        last_datetime INTEGER NOT NULL,
                        PRIMARY KEY (instance_id, datetime, key)
                    )
                    "#
                ))
                .execute(&self.pool)
                .await?;
            }

            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {history} (
                    instance_id INTEGER NOT NULL
                        REFERENCES monitored_instances(instance_id) ON DELETE CASCADE,
                    key TEXT NOT NULL DEFAULT '',
                    history_start INTEGER NOT NULL,
                    history_end INTEGER NOT NULL,
                    records TEXT NOT NULL CHECK (json_valid(records))
                )
                "#
            ))
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    /// Take a connection with the session settings applied
    async fn session(&self) -> StorageResult<PoolConnection<Sqlite>> {
        let mut conn = self.pool.acquire().await?;
        for pragma in SESSION_PRAGMAS {
            sqlx::query(pragma).execute(&mut *conn).await?;
        }
        Ok(conn)
    }

    /// Number of rows in a table, used by tests and stats
    pub async fn count_rows(&self, table: &str) -> StorageResult<i64> {
        let table = checked_table_name(table)?;
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    fn timestamp_to_millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn millis_to_timestamp(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
    }
}

/// Table names are interpolated into SQL, so only plain identifiers pass
fn checked_table_name(name: &str) -> StorageResult<String> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if valid {
        Ok(name.to_string())
    } else {
        Err(StorageError::InvalidConfig(format!(
            "invalid table name {name:?}"
        )))
    }
}

fn port_from_db(port: i64) -> StorageResult<u16> {
    u16::try_from(port)
        .map_err(|_| StorageError::SerializationError(format!("invalid port {port}")))
}

type Record = serde_json::Map<String, serde_json::Value>;

/// Fold new records into the average of a bucket.
///
/// `previous` is the stored average and the number of rows it covers. Numeric
/// fields are averaged over all rows, non-numeric fields keep the value of the
/// last record. Returns the new average and its row count.
fn average_records(previous: Option<(Record, i64)>, records: &[Record]) -> (Record, i64) {
    let mut sums: BTreeMap<String, (f64, f64)> = BTreeMap::new();
    let mut merged = Record::new();
    let mut samples = 0;

    if let Some((average, count)) = previous {
        for (field, value) in average {
            match value.as_f64() {
                Some(number) => {
                    sums.insert(field, (number * count as f64, count as f64));
                }
                None => {
                    merged.insert(field, value);
                }
            }
        }
        samples = count;
    }

    for record in records {
        for (field, value) in record {
            match value.as_f64() {
                Some(number) => {
                    let entry = sums.entry(field.clone()).or_insert((0.0, 0.0));
                    entry.0 += number;
                    entry.1 += 1.0;
                }
                None => {
                    merged.insert(field.clone(), value.clone());
                }
            }
        }
    }

    for (field, (sum, weight)) in sums {
        merged.insert(field, serde_json::Value::from(sum / weight));
    }

    (merged, samples + records.len() as i64)
}

fn parse_record(record: &str) -> StorageResult<Record> {
    serde_json::from_str(record).map_err(|e| StorageError::SerializationError(e.to_string()))
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    #[instrument(skip_all, fields(instances = instances.len(), roles = roles.len()))]
    async fn sync_inventory(
        &self,
        instances: &[InstanceConfig],
        roles: &[RoleConfig],
    ) -> StorageResult<()> {
        let mut conn = self.session().await?;
        let mut tx = sqlx::Connection::begin(&mut *conn).await?;

        for role in roles {
            sqlx::query(
                r#"
                INSERT INTO roles (role_name, role_email, role_phone)
                VALUES (?, ?, ?)
                ON CONFLICT (role_name) DO UPDATE SET
                    role_email = excluded.role_email,
                    role_phone = excluded.role_phone
                "#,
            )
            .bind(&role.name)
            .bind(&role.email)
            .bind(&role.phone)
            .execute(&mut *tx)
            .await?;
        }

        for instance in instances {
            sqlx::query(
                r#"
                INSERT INTO instances (agent_address, agent_port, agent_key, notify)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (agent_address, agent_port) DO UPDATE SET
                    agent_key = excluded.agent_key,
                    notify = excluded.notify
                "#,
            )
            .bind(&instance.address)
            .bind(instance.port as i64)
            .bind(&instance.key)
            .bind(instance.notify)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "DELETE FROM instance_subscriptions WHERE agent_address = ? AND agent_port = ?",
            )
            .bind(&instance.address)
            .bind(instance.port as i64)
            .execute(&mut *tx)
            .await?;

            for role_name in &instance.subscribers {
                sqlx::query(
                    r#"
                    INSERT INTO instance_subscriptions (agent_address, agent_port, role_name)
                    VALUES (?, ?, ?)
                    "#,
                )
                .bind(&instance.address)
                .bind(instance.port as i64)
                .bind(role_name)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        debug!("inventory synchronized");
        Ok(())
    }

    async fn list_agents(&self) -> StorageResult<Vec<AgentEndpoint>> {
        let rows: Vec<(String, i64, Option<String>)> = sqlx::query_as(
            "SELECT agent_address, agent_port, agent_key FROM instances ORDER BY 1, 2",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(address, port, key)| Ok(AgentEndpoint::new(address, port_from_db(port)?, key)))
            .collect()
    }

    async fn record_discovery(
        &self,
        agent: &AgentEndpoint,
        discovery: &Discovery,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"
            UPDATE instances SET hostname = ?, pg_port = ?
            WHERE agent_address = ? AND agent_port = ?
            "#,
        )
        .bind(&discovery.hostname)
        .bind(discovery.pg_port as i64)
        .bind(&agent.address)
        .bind(agent.port as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_instance(
        &self,
        hostname: &str,
        port: u16,
    ) -> StorageResult<Option<InstanceIdentity>> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT h.host_id, mi.instance_id
            FROM hosts h
            JOIN monitored_instances mi ON mi.host_id = h.host_id
            WHERE h.hostname = ? AND mi.port = ?
            "#,
        )
        .bind(hostname)
        .bind(port as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(host_id, instance_id)| InstanceIdentity {
            host_id,
            instance_id,
        }))
    }

    async fn collector_status(&self, instance_id: i64) -> StorageResult<Option<CollectorStatus>> {
        let row: Option<(String, i64, Option<i64>)> = sqlx::query_as(
            "SELECT status, last_pull, last_insert FROM collector_status WHERE instance_id = ?",
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(status, last_pull, last_insert)| {
            Ok(CollectorStatus {
                instance_id,
                status: status.parse()?,
                last_pull: Self::millis_to_timestamp(last_pull),
                last_insert: last_insert.map(Self::millis_to_timestamp),
            })
        })
        .transpose()
    }

    #[instrument(skip(self))]
    async fn update_collector_status(
        &self,
        instance_id: i64,
        status: CollectorState,
        last_pull: DateTime<Utc>,
        last_insert: Option<DateTime<Utc>>,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO collector_status (instance_id, status, last_pull, last_insert)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (instance_id) DO UPDATE SET
                status = excluded.status,
                last_pull = excluded.last_pull,
                last_insert = CASE
                    WHEN excluded.last_insert IS NULL THEN collector_status.last_insert
                    WHEN collector_status.last_insert IS NULL THEN excluded.last_insert
                    ELSE MAX(collector_status.last_insert, excluded.last_insert)
                END
            "#,
        )
        .bind(instance_id)
        .bind(status.as_str())
        .bind(Self::timestamp_to_millis(&last_pull))
        .bind(last_insert.as_ref().map(Self::timestamp_to_millis))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip_all, fields(hostname = %row.hostinfo.hostname, datetime = %row.datetime))]
    async fn ingest_row(
        &self,
        row: &MetricRow,
        checks: &[CheckDefinition],
    ) -> StorageResult<IngestedRow> {
        let datetime = Self::timestamp_to_millis(&row.datetime);
        let configs = self.metric_tables_config().await?;
        row.validate_records(&configs)?;

        let memory_size = match row.hostinfo.memory_size {
            Some(size) => Some(i64::try_from(size).map_err(|_| {
                StorageError::InvalidData(format!("memory_size {size} is out of range"))
            })?),
            None => None,
        };

        let mut conn = self.session().await?;
        // dropping the transaction on any error below rolls the whole row back
        let mut tx = sqlx::Connection::begin(&mut *conn).await?;

        let host_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO hosts (hostname, os, os_version, cpu_count, cpu_arch, memory_size)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (hostname) DO UPDATE SET
                os = excluded.os,
                os_version = excluded.os_version,
                cpu_count = excluded.cpu_count,
                cpu_arch = excluded.cpu_arch,
                memory_size = excluded.memory_size
            RETURNING host_id
            "#,
        )
        .bind(&row.hostinfo.hostname)
        .bind(&row.hostinfo.os)
        .bind(&row.hostinfo.os_version)
        .bind(row.hostinfo.cpu_count.map(i64::from))
        .bind(&row.hostinfo.cpu_arch)
        .bind(memory_size)
        .fetch_one(&mut *tx)
        .await?;

        let instance_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO monitored_instances (host_id, port, version, data_directory)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (host_id, port) DO UPDATE SET
                version = excluded.version,
                data_directory = excluded.data_directory
            RETURNING instance_id
            "#,
        )
        .bind(host_id)
        .bind(row.instance.port as i64)
        .bind(&row.instance.version)
        .bind(&row.instance.data_directory)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO instance_availability (instance_id, datetime, available)
            VALUES (?, ?, ?)
            ON CONFLICT (instance_id, datetime) DO UPDATE SET available = excluded.available
            "#,
        )
        .bind(instance_id)
        .bind(datetime)
        .bind(row.instance.available)
        .execute(&mut *tx)
        .await?;

        let mut records = 0;
        for config in &configs {
            let table = checked_table_name(&config.current_table())?;
            for record in row.records(&config.name) {
                let payload = serde_json::to_string(record)
                    .map_err(|e| StorageError::SerializationError(e.to_string()))?;

                sqlx::query(&format!(
                    r#"
                    INSERT INTO {table} (instance_id, datetime, key, record)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT (instance_id, datetime, key) DO UPDATE SET record = excluded.record
                    "#
                ))
                .bind(instance_id)
                .bind(datetime)
                .bind(config.record_key(record))
                .bind(payload)
                .execute(&mut *tx)
                .await?;

                records += 1;
            }
        }

        for check in checks {
            let created: Option<i64> = sqlx::query_scalar(
                r#"
                INSERT INTO checks (instance_id, name, enabled, warning, critical, description, state)
                VALUES (?, ?, 1, ?, ?, ?, 'OK')
                ON CONFLICT (instance_id, name) DO NOTHING
                RETURNING check_id
                "#,
            )
            .bind(instance_id)
            .bind(&check.name)
            .bind(check.warning)
            .bind(check.critical)
            .bind(&check.description)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(check_id) = created {
                sqlx::query(
                    r#"
                    INSERT INTO check_changes (check_id, datetime, enabled, warning, critical, description)
                    VALUES (?, ?, 1, ?, ?, ?)
                    "#,
                )
                .bind(check_id)
                .bind(Self::timestamp_to_millis(&Utc::now()))
                .bind(check.warning)
                .bind(check.critical)
                .bind(&check.description)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;

        debug!("row committed with {records} records");
        Ok(IngestedRow {
            identity: InstanceIdentity {
                host_id,
                instance_id,
            },
            records,
        })
    }

    async fn instance_checks(&self, instance_id: i64) -> StorageResult<Vec<Check>> {
        let rows: Vec<(i64, String, bool, f64, f64, String, String)> = sqlx::query_as(
            r#"
            SELECT check_id, name, enabled, warning, critical, description, state
            FROM checks
            WHERE instance_id = ?
            ORDER BY name
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(
                |(check_id, name, enabled, warning, critical, description, state)| {
                    Ok(Check {
                        check_id,
                        instance_id,
                        name,
                        enabled,
                        warning,
                        critical,
                        description,
                        state: state.parse()?,
                    })
                },
            )
            .collect()
    }

    #[instrument(skip(self), fields(check_id = change.check_id))]
    async fn record_transition(&self, change: &StateChange) -> StorageResult<()> {
        let mut conn = self.session().await?;
        let mut tx = sqlx::Connection::begin(&mut *conn).await?;

        sqlx::query("UPDATE checks SET state = ? WHERE check_id = ?")
            .bind(change.new_state.as_str())
            .bind(change.check_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO state_changes (check_id, datetime, old_state, new_state, key, value)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(change.check_id)
        .bind(Self::timestamp_to_millis(&change.at))
        .bind(change.old_state.as_str())
        .bind(change.new_state.as_str())
        .bind(&change.key)
        .bind(change.value)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn notification_target(
        &self,
        instance_id: i64,
    ) -> StorageResult<Option<NotificationTarget>> {
        let row: Option<(String, i64, Option<String>, Option<i64>, Option<bool>)> =
            sqlx::query_as(
                r#"
                SELECT h.hostname, mi.port, i.agent_address, i.agent_port, i.notify
                FROM monitored_instances mi
                JOIN hosts h ON h.host_id = mi.host_id
                LEFT JOIN instances i ON i.hostname = h.hostname AND i.pg_port = mi.port
                WHERE mi.instance_id = ?
                "#,
            )
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some((hostname, port, agent_address, agent_port, notify)) = row else {
            return Ok(None);
        };

        let recipients = match (&agent_address, agent_port) {
            (Some(address), Some(agent_port)) => {
                let rows: Vec<(String, Option<String>, Option<String>)> = sqlx::query_as(
                    r#"
                    SELECT r.role_name, r.role_email, r.role_phone
                    FROM roles r
                    JOIN instance_subscriptions s ON s.role_name = r.role_name
                    WHERE s.agent_address = ? AND s.agent_port = ?
                    ORDER BY r.role_name
                    "#,
                )
                .bind(address)
                .bind(agent_port)
                .fetch_all(&self.pool)
                .await?;

                rows.into_iter()
                    .map(|(role_name, email, phone)| Recipient {
                        role_name,
                        email,
                        phone,
                    })
                    .collect()
            }
            _ => Vec::new(),
        };

        Ok(Some(NotificationTarget {
            hostname,
            port: port_from_db(port)?,
            agent_address,
            agent_port: agent_port.map(port_from_db).transpose()?,
            // instances unknown to the application inventory are never notified
            notify: notify.unwrap_or(false),
            recipients,
        }))
    }

    async fn metric_tables_config(&self) -> StorageResult<Vec<MetricTableConfig>> {
        let rows: Vec<(String, String, Option<String>)> =
            sqlx::query_as("SELECT name, record_type, key_field FROM metric_tables ORDER BY name")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(name, record_type, key_field)| MetricTableConfig {
                name,
                record_type,
                key_field,
            })
            .collect())
    }

    #[instrument(skip_all, fields(metric = %config.name, bucket = level.suffix()))]
    async fn aggregate_data_single(
        &self,
        config: &MetricTableConfig,
        level: AggregateLevel,
    ) -> StorageResult<TableReport> {
        let current = checked_table_name(&config.current_table())?;
        let aggregate = checked_table_name(&config.aggregate_table(level))?;
        let width = level.bucket_millis();

        let mut conn = self.session().await?;
        let mut tx = sqlx::Connection::begin(&mut *conn).await?;

        // every series resumes after the newest row it already folded in
        let rows: Vec<(i64, i64, String, String)> = sqlx::query_as(&format!(
            r#"
            SELECT c.instance_id, c.datetime, c.key, c.record FROM {current} c
            WHERE c.datetime > COALESCE(
                (SELECT MAX(a.last_datetime) FROM {aggregate} a
                 WHERE a.instance_id = c.instance_id AND a.key = c.key),
                c.datetime - 1
            )
            ORDER BY c.instance_id, c.key, c.datetime
            "#
        ))
        .fetch_all(&mut *tx)
        .await?;

        let mut buckets: BTreeMap<(i64, String, i64), (i64, Vec<Record>)> = BTreeMap::new();
        for (instance_id, datetime, key, record) in rows {
            let bucket = datetime - datetime.rem_euclid(width);
            let entry = buckets
                .entry((instance_id, key, bucket))
                .or_insert((datetime, Vec::new()));
            entry.0 = entry.0.max(datetime);
            entry.1.push(parse_record(&record)?);
        }

        let mut written = 0;
        for ((instance_id, key, bucket), (last_datetime, records)) in &buckets {
            let previous: Option<(String, i64)> = sqlx::query_as(&format!(
                r#"
                SELECT record, samples FROM {aggregate}
                WHERE instance_id = ? AND datetime = ? AND key = ?
                "#
            ))
            .bind(instance_id)
            .bind(bucket)
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;
            let previous = match previous {
                Some((record, samples)) => Some((parse_record(&record)?, samples)),
                None => None,
            };

            let (average, samples) = average_records(previous, records);
            sqlx::query(&format!(
                r#"
                INSERT INTO {aggregate} (instance_id, datetime, key, record, samples, last_datetime)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT (instance_id, datetime, key) DO UPDATE SET
                    record = excluded.record,
                    samples = excluded.samples,
                    last_datetime = excluded.last_datetime
                "#
            ))
            .bind(instance_id)
            .bind(bucket)
            .bind(key)
            .bind(serde_json::Value::Object(average).to_string())
            .bind(samples)
            .bind(last_datetime)
            .execute(&mut *tx)
            .await?;
            written += 1;
        }

        tx.commit().await?;

        Ok(TableReport {
            table: aggregate,
            rows: written,
        })
    }

    #[instrument(skip_all, fields(metric = %config.name))]
    async fn archive_current_metrics(
        &self,
        config: &MetricTableConfig,
    ) -> StorageResult<TableReport> {
        let current = checked_table_name(&config.current_table())?;
        let history = checked_table_name(&config.history_table())?;

        let mut conn = self.session().await?;
        let mut tx = sqlx::Connection::begin(&mut *conn).await?;

        let rows: Vec<(i64, i64, String, String)> = sqlx::query_as(&format!(
            "SELECT instance_id, datetime, key, record FROM {current} ORDER BY instance_id, key, datetime"
        ))
        .fetch_all(&mut *tx)
        .await?;

        let mut series: BTreeMap<(i64, String), (i64, i64, Vec<serde_json::Value>)> =
            BTreeMap::new();
        for (instance_id, datetime, key, record) in rows {
            let mut record: serde_json::Value = serde_json::from_str(&record)
                .map_err(|e| StorageError::SerializationError(e.to_string()))?;
            if let Some(fields) = record.as_object_mut() {
                fields.insert(
                    "datetime".to_string(),
                    serde_json::Value::from(Self::millis_to_timestamp(datetime).to_rfc3339()),
                );
            }

            let entry = series
                .entry((instance_id, key))
                .or_insert((datetime, datetime, Vec::new()));
            entry.0 = entry.0.min(datetime);
            entry.1 = entry.1.max(datetime);
            entry.2.push(record);
        }

        let mut written = 0;
        for ((instance_id, key), (start, end, records)) in &series {
            sqlx::query(&format!(
                r#"
                INSERT INTO {history} (instance_id, key, history_start, history_end, records)
                VALUES (?, ?, ?, ?, ?)
                "#
            ))
            .bind(instance_id)
            .bind(key)
            .bind(start)
            .bind(end)
            .bind(serde_json::Value::Array(records.clone()).to_string())
            .execute(&mut *tx)
            .await?;
            written += 1;
        }

        sqlx::query(&format!("DELETE FROM {current}"))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(TableReport {
            table: history,
            rows: written,
        })
    }

    async fn purge_tables(&self) -> StorageResult<Vec<String>> {
        let mut candidates: Vec<String> = self
            .metric_tables_config()
            .await?
            .iter()
            .flat_map(|config| {
                [
                    config.aggregate_table(AggregateLevel::HalfHour),
                    config.aggregate_table(AggregateLevel::SixHours),
                    config.current_table(),
                    config.history_table(),
                ]
            })
            .collect();
        candidates.sort();

        let existing: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table'")
                .fetch_all(&self.pool)
                .await?;

        let mut tables: Vec<String> = candidates
            .into_iter()
            .filter(|candidate| existing.iter().any(|(name,)| name == candidate))
            .collect();
        tables.extend(AUDIT_TABLES.iter().map(|table| table.to_string()));

        Ok(tables)
    }

    #[instrument(skip(self))]
    async fn purge_table(&self, table: &str, before: DateTime<Utc>) -> StorageResult<TableReport> {
        let table = checked_table_name(table)?;
        let column = if table.ends_with("_history") {
            "history_end"
        } else {
            "datetime"
        };

        let mut conn = self.session().await?;
        let mut tx = sqlx::Connection::begin(&mut *conn).await?;

        let result = sqlx::query(&format!("DELETE FROM {table} WHERE {column} < ?"))
            .bind(Self::timestamp_to_millis(&before))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(TableReport {
            table,
            rows: result.rows_affected(),
        })
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => Ok(HealthStatus {
                healthy: true,
                message: format!("SQLite backend operational ({})", self.db_path),
            }),
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {}", e),
                })
            }
        }
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }
}
