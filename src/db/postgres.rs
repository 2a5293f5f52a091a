//! PostgreSQL backend.
//!
//! Uses deadpool for pooling and refinery for embedded migrations.
//! Sequence assignment, barrier mutation and continuation creation run in
//! transactions under `pg_advisory_xact_lock(course_id)`; queue claims use
//! `FOR UPDATE SKIP LOCKED`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

use crate::db::{
    BarrierRelease, CourseTotals, Database, EnqueueOutcome, FailOutcome, NewCommisJob,
};
use crate::error::DatabaseError;
use crate::models::{
    CommisBarrier, CommisJob, CommisStatus, Course, CourseEvent, CourseStatus, CourseTrigger,
    DeviceToken, Fiche, FicheStatus, NewFiche, NewThreadMessage, QueueEntry, QueueStatus, Runner,
    RunnerJob, RunnerJobStatus, RunnerStatus, Thread, ThreadKind, ThreadMessage, TriggerKind,
    TriggerRow, User, UserRole, Workflow, WorkflowNode,
};

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Build a connection pool for the given PostgreSQL URL.
pub fn connect_pool(database_url: &str) -> Result<Pool, DatabaseError> {
    let pg_config: tokio_postgres::Config = database_url
        .parse()
        .map_err(|e: tokio_postgres::Error| DatabaseError::Connection(e.to_string()))?;

    let manager = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );

    Pool::builder(manager)
        .max_size(16)
        .build()
        .map_err(|e| DatabaseError::Connection(e.to_string()))
}

/// Apply embedded migrations over a dedicated connection.
pub async fn run_migrations(database_url: &str) -> Result<(), DatabaseError> {
    let (mut client, connection) = tokio_postgres::connect(database_url, NoTls)
        .await
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;

    let handle = tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("migration connection error: {}", e);
        }
    });

    embedded::migrations::runner()
        .run_async(&mut client)
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?;

    drop(client);
    let _ = handle.await;
    Ok(())
}

/// The production datastore.
pub struct PostgresDatabase {
    pool: Pool,
}

impl PostgresDatabase {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn client(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        self.pool
            .get()
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))
    }
}

fn parse_wire<T>(text: &str) -> Result<T, DatabaseError>
where
    T: std::str::FromStr<Err = String>,
{
    text.parse().map_err(DatabaseError::Query)
}

fn json_vec<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<Vec<T>, DatabaseError> {
    serde_json::from_value(value).map_err(|e| DatabaseError::Query(e.to_string()))
}

fn user_from_row(row: &Row) -> Result<User, DatabaseError> {
    Ok(User {
        id: row.get("id"),
        email: row.get("email"),
        role: parse_wire(row.get("role"))?,
        provider: row.get("provider"),
        created_at: row.get("created_at"),
    })
}

fn fiche_from_row(row: &Row) -> Result<Fiche, DatabaseError> {
    Ok(Fiche {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        name: row.get("name"),
        system_instructions: row.get("system_instructions"),
        task_instructions: row.get("task_instructions"),
        model: row.get("model"),
        reasoning_effort: row.get("reasoning_effort"),
        allowed_tools: json_vec(row.get("allowed_tools"))?,
        config: row.get("config"),
        schedule: row.get("schedule"),
        status: parse_wire(row.get("status"))?,
        is_concierge: row.get("is_concierge"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn thread_from_row(row: &Row) -> Result<Thread, DatabaseError> {
    Ok(Thread {
        id: row.get("id"),
        fiche_id: row.get("fiche_id"),
        owner_id: row.get("owner_id"),
        title: row.get("title"),
        kind: parse_wire(row.get("kind"))?,
        fiche_state: row.get("fiche_state"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn message_from_row(row: &Row) -> Result<ThreadMessage, DatabaseError> {
    Ok(ThreadMessage {
        id: row.get("id"),
        thread_id: row.get("thread_id"),
        role: parse_wire(row.get("role"))?,
        content: row.get("content"),
        message_uuid: row.get("message_uuid"),
        tool_calls: json_vec(row.get("tool_calls"))?,
        tool_call_id: row.get("tool_call_id"),
        processed: row.get("processed"),
        created_at: row.get("created_at"),
    })
}

fn course_from_row(row: &Row) -> Result<Course, DatabaseError> {
    Ok(Course {
        id: row.get("id"),
        fiche_id: row.get("fiche_id"),
        thread_id: row.get("thread_id"),
        status: parse_wire(row.get("status"))?,
        trigger: parse_wire(row.get("trigger"))?,
        trace_id: row.get("trace_id"),
        continuation_of_course_id: row.get("continuation_of_course_id"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        duration_ms: row.get("duration_ms"),
        total_tokens: row.get("total_tokens"),
        total_cost_usd: row.get("total_cost_usd"),
        summary: row.get("summary"),
        error: row.get("error"),
        created_at: row.get("created_at"),
    })
}

fn course_event_from_row(row: &Row) -> CourseEvent {
    CourseEvent {
        id: row.get("id"),
        course_id: row.get("course_id"),
        seq: row.get("seq"),
        event_type: row.get("event_type"),
        payload: row.get("payload"),
        created_at: row.get("created_at"),
    }
}

fn commis_from_row(row: &Row) -> Result<CommisJob, DatabaseError> {
    Ok(CommisJob {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        concierge_course_id: row.get("concierge_course_id"),
        task: row.get("task"),
        model: row.get("model"),
        status: parse_wire(row.get("status"))?,
        commis_id: row.get("commis_id"),
        trace_id: row.get("trace_id"),
        execution_mode: row.get("execution_mode"),
        git_repo: row.get("git_repo"),
        result_summary: row.get("result_summary"),
        artifacts_path: row.get("artifacts_path"),
        created_at: row.get("created_at"),
        finished_at: row.get("finished_at"),
    })
}

fn barrier_from_row(row: &Row) -> Result<CommisBarrier, DatabaseError> {
    Ok(CommisBarrier {
        course_id: row.get("course_id"),
        job_ids: json_vec(row.get("job_ids"))?,
        created_at: row.get("created_at"),
    })
}

fn runner_from_row(row: &Row) -> Result<Runner, DatabaseError> {
    Ok(Runner {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        name: row.get("name"),
        auth_secret_hash: row.get("auth_secret_hash"),
        status: parse_wire(row.get("status"))?,
        last_heartbeat: row.get("last_heartbeat"),
        created_at: row.get("created_at"),
    })
}

fn runner_job_from_row(row: &Row) -> Result<RunnerJob, DatabaseError> {
    Ok(RunnerJob {
        id: row.get("id"),
        runner_id: row.get("runner_id"),
        owner_id: row.get("owner_id"),
        command: row.get("command"),
        timeout_secs: row.get("timeout_secs"),
        status: parse_wire(row.get("status"))?,
        stdout_tail: row.get("stdout_tail"),
        stderr_tail: row.get("stderr_tail"),
        exit_code: row.get("exit_code"),
        worker_id: row.get("worker_id"),
        course_id: row.get("course_id"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    })
}

fn queue_entry_from_row(row: &Row) -> Result<QueueEntry, DatabaseError> {
    Ok(QueueEntry {
        id: row.get("id"),
        job_id: row.get("job_id"),
        payload: row.get("payload"),
        scheduled_for: row.get("scheduled_for"),
        dedupe_key: row.get("dedupe_key"),
        status: parse_wire(row.get("status"))?,
        attempts: row.get("attempts"),
        max_attempts: row.get("max_attempts"),
        lease_owner: row.get("lease_owner"),
        lease_expires_at: row.get("lease_expires_at"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        finished_at: row.get("finished_at"),
    })
}

fn trigger_from_row(row: &Row) -> Result<TriggerRow, DatabaseError> {
    Ok(TriggerRow {
        id: row.get("id"),
        fiche_id: row.get("fiche_id"),
        kind: parse_wire(row.get("kind"))?,
        secret_hash: row.get("secret_hash"),
        created_at: row.get("created_at"),
    })
}

fn workflow_from_row(row: &Row) -> Result<Workflow, DatabaseError> {
    Ok(Workflow {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        name: row.get("name"),
        nodes: json_vec(row.get("nodes"))?,
        created_at: row.get("created_at"),
    })
}

const COURSE_COLS: &str = "id, fiche_id, thread_id, status, trigger, trace_id, \
     continuation_of_course_id, started_at, finished_at, duration_ms, total_tokens, \
     total_cost_usd, summary, error, created_at";

const QUEUE_COLS: &str = "id, job_id, payload, scheduled_for, dedupe_key, status, attempts, \
     max_attempts, lease_owner, lease_expires_at, last_error, created_at, finished_at";

async fn insert_message_with(
    executor: &impl tokio_postgres::GenericClient,
    message: &NewThreadMessage,
) -> Result<ThreadMessage, DatabaseError> {
    let tool_calls = serde_json::to_value(&message.tool_calls)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    let row = executor
        .query_one(
            "INSERT INTO thread_messages \
                 (thread_id, role, content, message_uuid, tool_calls, tool_call_id, processed) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING *",
            &[
                &message.thread_id,
                &message.role.to_string(),
                &message.content,
                &message.message_uuid,
                &tool_calls,
                &message.tool_call_id,
                &message.processed,
            ],
        )
        .await
        .map_err(DatabaseError::from_pg)?;
    message_from_row(&row)
}

#[async_trait]
impl Database for PostgresDatabase {
    // --- Users ---

    async fn create_user(
        &self,
        email: &str,
        provider: Option<&str>,
        role: UserRole,
    ) -> Result<User, DatabaseError> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "INSERT INTO users (email, provider, role) VALUES ($1, $2, $3) RETURNING *",
                &[&email, &provider, &role.to_string()],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        user_from_row(&row)
    }

    async fn get_user(&self, id: i64) -> Result<Option<User>, DatabaseError> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT * FROM users WHERE id = $1", &[&id])
            .await
            .map_err(DatabaseError::from_pg)?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, DatabaseError> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT * FROM users WHERE email = $1", &[&email])
            .await
            .map_err(DatabaseError::from_pg)?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn count_users(&self) -> Result<i64, DatabaseError> {
        let client = self.client().await?;
        let row = client
            .query_one("SELECT COUNT(*) FROM users", &[])
            .await
            .map_err(DatabaseError::from_pg)?;
        Ok(row.get(0))
    }

    // --- Fiches ---

    async fn create_fiche(&self, fiche: &NewFiche) -> Result<Fiche, DatabaseError> {
        let client = self.client().await?;
        let allowed = serde_json::to_value(&fiche.allowed_tools)
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        let row = client
            .query_one(
                "INSERT INTO fiches \
                     (owner_id, name, system_instructions, task_instructions, model, \
                      reasoning_effort, allowed_tools, config, schedule, is_concierge) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                 RETURNING *",
                &[
                    &fiche.owner_id,
                    &fiche.name,
                    &fiche.system_instructions,
                    &fiche.task_instructions,
                    &fiche.model,
                    &fiche.reasoning_effort,
                    &allowed,
                    &fiche.config,
                    &fiche.schedule,
                    &fiche.is_concierge,
                ],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        fiche_from_row(&row)
    }

    async fn get_fiche(&self, id: i64) -> Result<Option<Fiche>, DatabaseError> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT * FROM fiches WHERE id = $1", &[&id])
            .await
            .map_err(DatabaseError::from_pg)?;
        row.as_ref().map(fiche_from_row).transpose()
    }

    async fn list_fiches(&self, owner_id: Option<i64>) -> Result<Vec<Fiche>, DatabaseError> {
        let client = self.client().await?;
        let rows = match owner_id {
            Some(owner) => {
                client
                    .query(
                        "SELECT * FROM fiches WHERE owner_id = $1 ORDER BY id",
                        &[&owner],
                    )
                    .await
            }
            None => client.query("SELECT * FROM fiches ORDER BY id", &[]).await,
        }
        .map_err(DatabaseError::from_pg)?;
        rows.iter().map(fiche_from_row).collect()
    }

    async fn update_fiche(&self, fiche: &Fiche) -> Result<(), DatabaseError> {
        let client = self.client().await?;
        let allowed = serde_json::to_value(&fiche.allowed_tools)
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        client
            .execute(
                "UPDATE fiches SET name = $2, system_instructions = $3, task_instructions = $4, \
                     model = $5, reasoning_effort = $6, allowed_tools = $7, config = $8, \
                     schedule = $9, updated_at = now() \
                 WHERE id = $1",
                &[
                    &fiche.id,
                    &fiche.name,
                    &fiche.system_instructions,
                    &fiche.task_instructions,
                    &fiche.model,
                    &fiche.reasoning_effort,
                    &allowed,
                    &fiche.config,
                    &fiche.schedule,
                ],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        Ok(())
    }

    async fn delete_fiche(&self, id: i64) -> Result<bool, DatabaseError> {
        let client = self.client().await?;
        let n = client
            .execute("DELETE FROM fiches WHERE id = $1", &[&id])
            .await
            .map_err(DatabaseError::from_pg)?;
        Ok(n > 0)
    }

    async fn set_fiche_status(&self, id: i64, status: FicheStatus) -> Result<(), DatabaseError> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE fiches SET status = $2, updated_at = now() WHERE id = $1",
                &[&id, &status.to_string()],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        Ok(())
    }

    async fn find_concierge_fiche(&self, owner_id: i64) -> Result<Option<Fiche>, DatabaseError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT * FROM fiches WHERE owner_id = $1 AND is_concierge ORDER BY id LIMIT 1",
                &[&owner_id],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        row.as_ref().map(fiche_from_row).transpose()
    }

    async fn list_scheduled_fiches(&self) -> Result<Vec<Fiche>, DatabaseError> {
        let client = self.client().await?;
        let rows = client
            .query("SELECT * FROM fiches WHERE schedule IS NOT NULL ORDER BY id", &[])
            .await
            .map_err(DatabaseError::from_pg)?;
        rows.iter().map(fiche_from_row).collect()
    }

    // --- Threads ---

    async fn create_thread(
        &self,
        fiche_id: i64,
        owner_id: i64,
        title: &str,
        kind: ThreadKind,
    ) -> Result<Thread, DatabaseError> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "INSERT INTO threads (fiche_id, owner_id, title, kind) \
                 VALUES ($1, $2, $3, $4) RETURNING *",
                &[&fiche_id, &owner_id, &title, &kind.to_string()],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        thread_from_row(&row)
    }

    async fn get_thread(&self, id: i64) -> Result<Option<Thread>, DatabaseError> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT * FROM threads WHERE id = $1", &[&id])
            .await
            .map_err(DatabaseError::from_pg)?;
        row.as_ref().map(thread_from_row).transpose()
    }

    async fn list_threads(&self, owner_id: Option<i64>) -> Result<Vec<Thread>, DatabaseError> {
        let client = self.client().await?;
        let rows = match owner_id {
            Some(owner) => {
                client
                    .query(
                        "SELECT * FROM threads WHERE owner_id = $1 ORDER BY id",
                        &[&owner],
                    )
                    .await
            }
            None => client.query("SELECT * FROM threads ORDER BY id", &[]).await,
        }
        .map_err(DatabaseError::from_pg)?;
        rows.iter().map(thread_from_row).collect()
    }

    async fn update_thread_title(&self, id: i64, title: &str) -> Result<(), DatabaseError> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE threads SET title = $2, updated_at = now() WHERE id = $1",
                &[&id, &title],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        Ok(())
    }

    async fn delete_thread(&self, id: i64) -> Result<bool, DatabaseError> {
        let client = self.client().await?;
        let n = client
            .execute("DELETE FROM threads WHERE id = $1", &[&id])
            .await
            .map_err(DatabaseError::from_pg)?;
        Ok(n > 0)
    }

    async fn find_thread_by_kind(
        &self,
        fiche_id: i64,
        kind: ThreadKind,
    ) -> Result<Option<Thread>, DatabaseError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT * FROM threads WHERE fiche_id = $1 AND kind = $2 ORDER BY id LIMIT 1",
                &[&fiche_id, &kind.to_string()],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        row.as_ref().map(thread_from_row).transpose()
    }

    async fn get_thread_state(
        &self,
        thread_id: i64,
    ) -> Result<Option<serde_json::Value>, DatabaseError> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT fiche_state FROM threads WHERE id = $1", &[&thread_id])
            .await
            .map_err(DatabaseError::from_pg)?;
        Ok(row.and_then(|r| r.get("fiche_state")))
    }

    async fn set_thread_state(
        &self,
        thread_id: i64,
        state: Option<&serde_json::Value>,
    ) -> Result<(), DatabaseError> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE threads SET fiche_state = $2, updated_at = now() WHERE id = $1",
                &[&thread_id, &state],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        Ok(())
    }

    // --- Thread messages ---

    async fn append_message(
        &self,
        message: &NewThreadMessage,
    ) -> Result<ThreadMessage, DatabaseError> {
        let client = self.client().await?;
        insert_message_with(&**client, message).await
    }

    async fn list_messages(&self, thread_id: i64) -> Result<Vec<ThreadMessage>, DatabaseError> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT * FROM thread_messages WHERE thread_id = $1 ORDER BY id",
                &[&thread_id],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        rows.iter().map(message_from_row).collect()
    }

    async fn list_unprocessed_messages(
        &self,
        thread_id: i64,
    ) -> Result<Vec<ThreadMessage>, DatabaseError> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT * FROM thread_messages \
                 WHERE thread_id = $1 AND NOT processed ORDER BY id",
                &[&thread_id],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        rows.iter().map(message_from_row).collect()
    }

    async fn mark_messages_processed(&self, ids: &[i64]) -> Result<(), DatabaseError> {
        if ids.is_empty() {
            return Ok(());
        }
        let client = self.client().await?;
        client
            .execute(
                "UPDATE thread_messages SET processed = TRUE WHERE id = ANY($1)",
                &[&ids],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        Ok(())
    }

    // --- Courses ---

    async fn create_course(
        &self,
        fiche_id: i64,
        thread_id: i64,
        trigger: CourseTrigger,
        status: CourseStatus,
        trace_id: Uuid,
    ) -> Result<Course, DatabaseError> {
        let client = self.client().await?;
        let row = client
            .query_one(
                &*format!(
                    "INSERT INTO courses (fiche_id, thread_id, trigger, status, trace_id) \
                     VALUES ($1, $2, $3, $4, $5) RETURNING {COURSE_COLS}"
                ),
                &[
                    &fiche_id,
                    &thread_id,
                    &trigger.to_string(),
                    &status.to_string(),
                    &trace_id,
                ],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        course_from_row(&row)
    }

    async fn get_course(&self, id: i64) -> Result<Option<Course>, DatabaseError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                &*format!("SELECT {COURSE_COLS} FROM courses WHERE id = $1"),
                &[&id],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        row.as_ref().map(course_from_row).transpose()
    }

    async fn list_courses(
        &self,
        fiche_id: i64,
        owner_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Course>, DatabaseError> {
        let client = self.client().await?;
        let limit = limit as i64;
        let rows = match owner_id {
            Some(owner) => {
                client
                    .query(
                        &*format!(
                            "SELECT c.* FROM (SELECT {COURSE_COLS} FROM courses) c \
                             JOIN fiches f ON f.id = c.fiche_id \
                             WHERE c.fiche_id = $1 AND f.owner_id = $2 \
                             ORDER BY c.id DESC LIMIT $3"
                        ),
                        &[&fiche_id, &owner, &limit],
                    )
                    .await
            }
            None => {
                client
                    .query(
                        &*format!(
                            "SELECT {COURSE_COLS} FROM courses WHERE fiche_id = $1 \
                             ORDER BY id DESC LIMIT $2"
                        ),
                        &[&fiche_id, &limit],
                    )
                    .await
            }
        }
        .map_err(DatabaseError::from_pg)?;
        rows.iter().map(course_from_row).collect()
    }

    async fn mark_course_running(&self, id: i64) -> Result<(), DatabaseError> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE courses SET status = 'running', \
                     started_at = COALESCE(started_at, now()) WHERE id = $1",
                &[&id],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        Ok(())
    }

    async fn mark_course_deferred(&self, id: i64) -> Result<(), DatabaseError> {
        let client = self.client().await?;
        client
            .execute("UPDATE courses SET status = 'deferred' WHERE id = $1", &[&id])
            .await
            .map_err(DatabaseError::from_pg)?;
        Ok(())
    }

    async fn mark_course_finished(
        &self,
        id: i64,
        totals: &CourseTotals,
    ) -> Result<(), DatabaseError> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE courses SET status = 'success', finished_at = now(), \
                     duration_ms = (EXTRACT(EPOCH FROM (now() - started_at)) * 1000)::BIGINT, \
                     total_tokens = $2, total_cost_usd = $3, summary = $4 \
                 WHERE id = $1",
                &[&id, &totals.total_tokens, &totals.total_cost_usd, &totals.summary],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        Ok(())
    }

    async fn mark_course_failed(&self, id: i64, error: &str) -> Result<(), DatabaseError> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE courses SET status = 'failed', finished_at = now(), \
                     duration_ms = (EXTRACT(EPOCH FROM (now() - started_at)) * 1000)::BIGINT, \
                     error = $2 \
                 WHERE id = $1",
                &[&id, &error],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        Ok(())
    }

    async fn find_continuation(&self, parent_id: i64) -> Result<Option<Course>, DatabaseError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                &*format!(
                    "SELECT {COURSE_COLS} FROM courses WHERE continuation_of_course_id = $1"
                ),
                &[&parent_id],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        row.as_ref().map(course_from_row).transpose()
    }

    async fn create_continuation(
        &self,
        parent_id: i64,
        fiche_id: i64,
        thread_id: i64,
        trace_id: Uuid,
        tool_messages: &[NewThreadMessage],
    ) -> Result<(Course, bool), DatabaseError> {
        let mut client = self.client().await?;
        let tx = client
            .transaction()
            .await
            .map_err(DatabaseError::from_pg)?;

        // Serializes concurrent barrier releases for the same parent.
        tx.execute("SELECT pg_advisory_xact_lock($1)", &[&parent_id])
            .await
            .map_err(DatabaseError::from_pg)?;

        if let Some(row) = tx
            .query_opt(
                &*format!(
                    "SELECT {COURSE_COLS} FROM courses WHERE continuation_of_course_id = $1"
                ),
                &[&parent_id],
            )
            .await
            .map_err(DatabaseError::from_pg)?
        {
            tx.commit().await.map_err(DatabaseError::from_pg)?;
            return Ok((course_from_row(&row)?, false));
        }

        let insert = tx
            .query_one(
                &*format!(
                    "INSERT INTO courses \
                         (fiche_id, thread_id, trigger, status, trace_id, continuation_of_course_id) \
                     VALUES ($1, $2, 'continuation', 'queued', $3, $4) \
                     RETURNING {COURSE_COLS}"
                ),
                &[&fiche_id, &thread_id, &trace_id, &parent_id],
            )
            .await;

        let row = match insert {
            Ok(row) => row,
            Err(e) => {
                // The unique index is the ultimate idempotency guard; a
                // conflicting writer already holds the continuation.
                let err = DatabaseError::from_pg(e);
                if matches!(err, DatabaseError::UniqueViolation(_)) {
                    drop(tx);
                    let course = self
                        .find_continuation(parent_id)
                        .await?
                        .ok_or_else(|| DatabaseError::NotFound("continuation".to_string()))?;
                    return Ok((course, false));
                }
                return Err(err);
            }
        };

        for message in tool_messages {
            insert_message_with(&*tx, message).await?;
        }

        tx.commit().await.map_err(DatabaseError::from_pg)?;
        Ok((course_from_row(&row)?, true))
    }

    async fn list_running_courses(&self) -> Result<Vec<Course>, DatabaseError> {
        let client = self.client().await?;
        let rows = client
            .query(
                &*format!("SELECT {COURSE_COLS} FROM courses WHERE status = 'running'"),
                &[],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        rows.iter().map(course_from_row).collect()
    }

    // --- Course events ---

    async fn append_course_event(
        &self,
        course_id: i64,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<CourseEvent, DatabaseError> {
        let mut client = self.client().await?;
        let tx = client
            .transaction()
            .await
            .map_err(DatabaseError::from_pg)?;

        tx.execute("SELECT pg_advisory_xact_lock($1)", &[&course_id])
            .await
            .map_err(DatabaseError::from_pg)?;

        let row = tx
            .query_one(
                "INSERT INTO course_events (course_id, seq, event_type, payload) \
                 SELECT $1, COALESCE(MAX(seq), 0) + 1, $2, $3 \
                     FROM course_events WHERE course_id = $1 \
                 RETURNING *",
                &[&course_id, &event_type, &payload],
            )
            .await
            .map_err(DatabaseError::from_pg)?;

        tx.commit().await.map_err(DatabaseError::from_pg)?;
        Ok(course_event_from_row(&row))
    }

    async fn list_course_events_after(
        &self,
        course_id: i64,
        after_seq: i64,
    ) -> Result<Vec<CourseEvent>, DatabaseError> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT * FROM course_events \
                 WHERE course_id = $1 AND seq > $2 ORDER BY seq",
                &[&course_id, &after_seq],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        Ok(rows.iter().map(course_event_from_row).collect())
    }

    // --- Commis jobs & barriers ---

    async fn create_commis_job(&self, job: &NewCommisJob) -> Result<CommisJob, DatabaseError> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "INSERT INTO commis_jobs \
                     (owner_id, concierge_course_id, task, model, commis_id, trace_id, \
                      execution_mode, git_repo) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING *",
                &[
                    &job.owner_id,
                    &job.concierge_course_id,
                    &job.task,
                    &job.model,
                    &job.commis_id,
                    &job.trace_id,
                    &job.execution_mode,
                    &job.git_repo,
                ],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        commis_from_row(&row)
    }

    async fn get_commis_job(&self, id: i64) -> Result<Option<CommisJob>, DatabaseError> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT * FROM commis_jobs WHERE id = $1", &[&id])
            .await
            .map_err(DatabaseError::from_pg)?;
        row.as_ref().map(commis_from_row).transpose()
    }

    async fn list_commis_jobs(
        &self,
        owner_id: Option<i64>,
    ) -> Result<Vec<CommisJob>, DatabaseError> {
        let client = self.client().await?;
        let rows = match owner_id {
            Some(owner) => {
                client
                    .query(
                        "SELECT * FROM commis_jobs WHERE owner_id = $1 ORDER BY id",
                        &[&owner],
                    )
                    .await
            }
            None => client.query("SELECT * FROM commis_jobs ORDER BY id", &[]).await,
        }
        .map_err(DatabaseError::from_pg)?;
        rows.iter().map(commis_from_row).collect()
    }

    async fn update_commis_status(
        &self,
        id: i64,
        status: CommisStatus,
        result_summary: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let client = self.client().await?;
        let terminal = matches!(
            status,
            CommisStatus::Success | CommisStatus::Failed | CommisStatus::Cancelled
        );
        client
            .execute(
                "UPDATE commis_jobs SET status = $2, \
                     result_summary = COALESCE($3, result_summary), \
                     finished_at = CASE WHEN $4 THEN now() ELSE finished_at END \
                 WHERE id = $1",
                &[&id, &status.to_string(), &result_summary, &terminal],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        Ok(())
    }

    async fn commit_spawn(&self, course_id: i64, job_ids: &[i64]) -> Result<(), DatabaseError> {
        let mut client = self.client().await?;
        let tx = client
            .transaction()
            .await
            .map_err(DatabaseError::from_pg)?;

        tx.execute("SELECT pg_advisory_xact_lock($1)", &[&course_id])
            .await
            .map_err(DatabaseError::from_pg)?;

        let ids_json = serde_json::to_value(job_ids)
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        tx.execute(
            "INSERT INTO commis_barriers (course_id, job_ids) VALUES ($1, $2)",
            &[&course_id, &ids_json],
        )
        .await
        .map_err(DatabaseError::from_pg)?;

        let owned_ids: Vec<i64> = job_ids.to_vec();
        tx.execute(
            "UPDATE commis_jobs SET status = 'queued' \
             WHERE id = ANY($1) AND status = 'created'",
            &[&owned_ids],
        )
        .await
        .map_err(DatabaseError::from_pg)?;

        tx.execute("UPDATE courses SET status = 'deferred' WHERE id = $1", &[&course_id])
            .await
            .map_err(DatabaseError::from_pg)?;

        tx.commit().await.map_err(DatabaseError::from_pg)?;
        Ok(())
    }

    async fn get_barrier(&self, course_id: i64) -> Result<Option<CommisBarrier>, DatabaseError> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT * FROM commis_barriers WHERE course_id = $1", &[&course_id])
            .await
            .map_err(DatabaseError::from_pg)?;
        row.as_ref().map(barrier_from_row).transpose()
    }

    async fn barrier_remove_job(
        &self,
        course_id: i64,
        job_id: i64,
    ) -> Result<BarrierRelease, DatabaseError> {
        let mut client = self.client().await?;
        let tx = client
            .transaction()
            .await
            .map_err(DatabaseError::from_pg)?;

        tx.execute("SELECT pg_advisory_xact_lock($1)", &[&course_id])
            .await
            .map_err(DatabaseError::from_pg)?;

        let row = tx
            .query_opt(
                "SELECT job_ids FROM commis_barriers WHERE course_id = $1 FOR UPDATE",
                &[&course_id],
            )
            .await
            .map_err(DatabaseError::from_pg)?;

        let Some(row) = row else {
            tx.commit().await.map_err(DatabaseError::from_pg)?;
            return Ok(BarrierRelease {
                remaining: 0,
                removed: false,
            });
        };

        let mut job_ids: Vec<i64> = json_vec(row.get("job_ids"))?;
        let before = job_ids.len();
        job_ids.retain(|id| *id != job_id);
        let removed = job_ids.len() < before;

        if job_ids.is_empty() {
            tx.execute("DELETE FROM commis_barriers WHERE course_id = $1", &[&course_id])
                .await
                .map_err(DatabaseError::from_pg)?;
        } else {
            let ids_json = serde_json::to_value(&job_ids)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            tx.execute(
                "UPDATE commis_barriers SET job_ids = $2 WHERE course_id = $1",
                &[&course_id, &ids_json],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        }

        tx.commit().await.map_err(DatabaseError::from_pg)?;
        Ok(BarrierRelease {
            remaining: job_ids.len(),
            removed,
        })
    }

    async fn delete_barrier(&self, course_id: i64) -> Result<(), DatabaseError> {
        let client = self.client().await?;
        client
            .execute("DELETE FROM commis_barriers WHERE course_id = $1", &[&course_id])
            .await
            .map_err(DatabaseError::from_pg)?;
        Ok(())
    }

    async fn list_barriers(&self) -> Result<Vec<CommisBarrier>, DatabaseError> {
        let client = self.client().await?;
        let rows = client
            .query("SELECT * FROM commis_barriers ORDER BY course_id", &[])
            .await
            .map_err(DatabaseError::from_pg)?;
        rows.iter().map(barrier_from_row).collect()
    }

    // --- Runners & runner jobs ---

    async fn create_runner(
        &self,
        owner_id: i64,
        name: &str,
        auth_secret_hash: &str,
    ) -> Result<Runner, DatabaseError> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "INSERT INTO runners (owner_id, name, auth_secret_hash) \
                 VALUES ($1, $2, $3) RETURNING *",
                &[&owner_id, &name, &auth_secret_hash],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        runner_from_row(&row)
    }

    async fn get_runner(&self, id: i64) -> Result<Option<Runner>, DatabaseError> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT * FROM runners WHERE id = $1", &[&id])
            .await
            .map_err(DatabaseError::from_pg)?;
        row.as_ref().map(runner_from_row).transpose()
    }

    async fn list_runners(&self, owner_id: Option<i64>) -> Result<Vec<Runner>, DatabaseError> {
        let client = self.client().await?;
        let rows = match owner_id {
            Some(owner) => {
                client
                    .query(
                        "SELECT * FROM runners WHERE owner_id = $1 ORDER BY id",
                        &[&owner],
                    )
                    .await
            }
            None => client.query("SELECT * FROM runners ORDER BY id", &[]).await,
        }
        .map_err(DatabaseError::from_pg)?;
        rows.iter().map(runner_from_row).collect()
    }

    async fn set_runner_status(
        &self,
        id: i64,
        status: RunnerStatus,
        heartbeat: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE runners SET status = $2, \
                     last_heartbeat = COALESCE($3, last_heartbeat) WHERE id = $1",
                &[&id, &status.to_string(), &heartbeat],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        Ok(())
    }

    async fn mark_all_runners_offline(&self) -> Result<u64, DatabaseError> {
        let client = self.client().await?;
        client
            .execute("UPDATE runners SET status = 'offline' WHERE status = 'online'", &[])
            .await
            .map_err(DatabaseError::from_pg)
    }

    async fn create_runner_job(&self, job: &RunnerJob) -> Result<(), DatabaseError> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO runner_jobs \
                     (id, runner_id, owner_id, command, timeout_secs, status, stdout_tail, \
                      stderr_tail, exit_code, worker_id, course_id, started_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
                &[
                    &job.id,
                    &job.runner_id,
                    &job.owner_id,
                    &job.command,
                    &job.timeout_secs,
                    &job.status.to_string(),
                    &job.stdout_tail,
                    &job.stderr_tail,
                    &job.exit_code,
                    &job.worker_id,
                    &job.course_id,
                    &job.started_at,
                ],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        Ok(())
    }

    async fn get_runner_job(&self, id: Uuid) -> Result<Option<RunnerJob>, DatabaseError> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT * FROM runner_jobs WHERE id = $1", &[&id])
            .await
            .map_err(DatabaseError::from_pg)?;
        row.as_ref().map(runner_job_from_row).transpose()
    }

    async fn update_runner_job_status(
        &self,
        id: Uuid,
        status: RunnerJobStatus,
        exit_code: Option<i32>,
    ) -> Result<(), DatabaseError> {
        let client = self.client().await?;
        let terminal = matches!(
            status,
            RunnerJobStatus::Success | RunnerJobStatus::Failed | RunnerJobStatus::Timeout
        );
        client
            .execute(
                "UPDATE runner_jobs SET status = $2, exit_code = COALESCE($3, exit_code), \
                     started_at = CASE WHEN $2 = 'running' THEN now() ELSE started_at END, \
                     finished_at = CASE WHEN $4 THEN now() ELSE finished_at END \
                 WHERE id = $1",
                &[&id, &status.to_string(), &exit_code, &terminal],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        Ok(())
    }

    async fn append_runner_job_output(
        &self,
        id: Uuid,
        stream: &str,
        data: &str,
    ) -> Result<(), DatabaseError> {
        let client = self.client().await?;
        let column = if stream == "stderr" { "stderr_tail" } else { "stdout_tail" };
        // Keep only the last 50 KiB of each stream.
        client
            .execute(
                &*format!(
                    "UPDATE runner_jobs SET {column} = RIGHT({column} || $2, 51200) WHERE id = $1"
                ),
                &[&id, &data],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        Ok(())
    }

    // --- Job queue ---

    async fn enqueue(
        &self,
        job_id: &str,
        payload: &serde_json::Value,
        scheduled_for: DateTime<Utc>,
        dedupe_key: &str,
        max_attempts: i32,
    ) -> Result<EnqueueOutcome, DatabaseError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "INSERT INTO job_queue (job_id, payload, scheduled_for, dedupe_key, max_attempts) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (job_id, dedupe_key) DO NOTHING \
                 RETURNING id",
                &[&job_id, &payload, &scheduled_for, &dedupe_key, &max_attempts],
            )
            .await
            .map_err(DatabaseError::from_pg)?;

        match row {
            Some(row) => Ok(EnqueueOutcome {
                entry_id: row.get("id"),
                newly_queued: true,
            }),
            None => {
                let existing = client
                    .query_one(
                        "SELECT id FROM job_queue WHERE job_id = $1 AND dedupe_key = $2",
                        &[&job_id, &dedupe_key],
                    )
                    .await
                    .map_err(DatabaseError::from_pg)?;
                Ok(EnqueueOutcome {
                    entry_id: existing.get("id"),
                    newly_queued: false,
                })
            }
        }
    }

    async fn claim_queue_entry(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<Option<QueueEntry>, DatabaseError> {
        let mut client = self.client().await?;
        let tx = client
            .transaction()
            .await
            .map_err(DatabaseError::from_pg)?;

        let row = tx
            .query_opt(
                &*format!(
                    "SELECT {QUEUE_COLS} FROM job_queue \
                     WHERE status = 'pending' AND scheduled_for <= $1 \
                     ORDER BY scheduled_for, id \
                     FOR UPDATE SKIP LOCKED \
                     LIMIT 1"
                ),
                &[&now],
            )
            .await
            .map_err(DatabaseError::from_pg)?;

        let Some(row) = row else {
            tx.commit().await.map_err(DatabaseError::from_pg)?;
            return Ok(None);
        };

        let entry_id: i64 = row.get("id");
        let lease_until = now + lease;
        let claimed = tx
            .query_one(
                &*format!(
                    "UPDATE job_queue \
                     SET status = 'running', lease_owner = $2, lease_expires_at = $3 \
                     WHERE id = $1 RETURNING {QUEUE_COLS}"
                ),
                &[&entry_id, &worker_id, &lease_until],
            )
            .await
            .map_err(DatabaseError::from_pg)?;

        tx.commit().await.map_err(DatabaseError::from_pg)?;
        Ok(Some(queue_entry_from_row(&claimed)?))
    }

    async fn extend_lease(
        &self,
        entry_id: i64,
        worker_id: &str,
        until: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let client = self.client().await?;
        let n = client
            .execute(
                "UPDATE job_queue SET lease_expires_at = $3 \
                 WHERE id = $1 AND lease_owner = $2 AND status = 'running'",
                &[&entry_id, &worker_id, &until],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        Ok(n > 0)
    }

    async fn complete_queue_entry(&self, entry_id: i64) -> Result<(), DatabaseError> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE job_queue SET status = 'success', finished_at = now(), \
                     lease_owner = NULL, lease_expires_at = NULL \
                 WHERE id = $1",
                &[&entry_id],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        Ok(())
    }

    async fn fail_queue_entry(
        &self,
        entry_id: i64,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<FailOutcome, DatabaseError> {
        let mut client = self.client().await?;
        let tx = client
            .transaction()
            .await
            .map_err(DatabaseError::from_pg)?;

        let row = tx
            .query_one(
                "SELECT attempts, max_attempts FROM job_queue WHERE id = $1 FOR UPDATE",
                &[&entry_id],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        let attempts: i32 = row.get::<_, i32>("attempts") + 1;
        let max_attempts: i32 = row.get("max_attempts");

        let outcome = if attempts < max_attempts {
            tx.execute(
                "UPDATE job_queue SET status = 'pending', attempts = $2, scheduled_for = $3, \
                     lease_owner = NULL, lease_expires_at = NULL, last_error = $4 \
                 WHERE id = $1",
                &[&entry_id, &attempts, &retry_at, &error],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
            FailOutcome::Retrying { attempts }
        } else {
            tx.execute(
                "UPDATE job_queue SET status = 'dead', attempts = $2, finished_at = now(), \
                     lease_owner = NULL, lease_expires_at = NULL, last_error = $3 \
                 WHERE id = $1",
                &[&entry_id, &attempts, &error],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
            FailOutcome::Dead { attempts }
        };

        tx.commit().await.map_err(DatabaseError::from_pg)?;
        Ok(outcome)
    }

    async fn dead_letter_queue_entry(
        &self,
        entry_id: i64,
        error: &str,
    ) -> Result<(), DatabaseError> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE job_queue SET status = 'dead', finished_at = now(), \
                     lease_owner = NULL, lease_expires_at = NULL, last_error = $2 \
                 WHERE id = $1",
                &[&entry_id, &error],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        Ok(())
    }

    async fn reset_zombie_entries(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let client = self.client().await?;
        // The lost lease counts as one failed attempt.
        client
            .execute(
                "UPDATE job_queue SET \
                     attempts = attempts + 1, \
                     status = CASE WHEN attempts + 1 < max_attempts \
                         THEN 'pending' ELSE 'dead' END, \
                     last_error = CASE WHEN attempts + 1 < max_attempts \
                         THEN last_error ELSE 'lease expired' END, \
                     finished_at = CASE WHEN attempts + 1 < max_attempts \
                         THEN finished_at ELSE now() END, \
                     lease_owner = NULL, lease_expires_at = NULL \
                 WHERE status = 'running' AND lease_expires_at < $1",
                &[&now],
            )
            .await
            .map_err(DatabaseError::from_pg)
    }

    async fn get_queue_entry(&self, entry_id: i64) -> Result<Option<QueueEntry>, DatabaseError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                &*format!("SELECT {QUEUE_COLS} FROM job_queue WHERE id = $1"),
                &[&entry_id],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        row.as_ref().map(queue_entry_from_row).transpose()
    }

    async fn list_queue_entries(
        &self,
        job_id: Option<&str>,
        status: Option<QueueStatus>,
    ) -> Result<Vec<QueueEntry>, DatabaseError> {
        let client = self.client().await?;
        let status_text = status.map(|s| s.to_string());

        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        if let Some(ref job) = job_id {
            params.push(job);
            clauses.push(format!("job_id = ${}", params.len()));
        }
        if let Some(ref text) = status_text {
            params.push(text);
            clauses.push(format!("status = ${}", params.len()));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let rows = client
            .query(
                &*format!("SELECT {QUEUE_COLS} FROM job_queue {where_clause} ORDER BY id"),
                &params,
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        rows.iter().map(queue_entry_from_row).collect()
    }

    async fn latest_scheduled_for(
        &self,
        job_id: &str,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "SELECT MAX(scheduled_for) AS latest FROM job_queue WHERE job_id = $1",
                &[&job_id],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        Ok(row.get("latest"))
    }

    // --- Triggers ---

    async fn create_trigger(
        &self,
        fiche_id: i64,
        kind: TriggerKind,
        secret_hash: &str,
    ) -> Result<TriggerRow, DatabaseError> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "INSERT INTO triggers (fiche_id, kind, secret_hash) \
                 VALUES ($1, $2, $3) RETURNING *",
                &[&fiche_id, &kind.to_string(), &secret_hash],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        trigger_from_row(&row)
    }

    async fn get_trigger(&self, id: i64) -> Result<Option<TriggerRow>, DatabaseError> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT * FROM triggers WHERE id = $1", &[&id])
            .await
            .map_err(DatabaseError::from_pg)?;
        row.as_ref().map(trigger_from_row).transpose()
    }

    async fn delete_trigger(&self, id: i64) -> Result<bool, DatabaseError> {
        let client = self.client().await?;
        let n = client
            .execute("DELETE FROM triggers WHERE id = $1", &[&id])
            .await
            .map_err(DatabaseError::from_pg)?;
        Ok(n > 0)
    }

    // --- Device tokens ---

    async fn upsert_device_token(
        &self,
        owner_id: i64,
        device_id: &str,
        token_hash: &str,
    ) -> Result<DeviceToken, DatabaseError> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "INSERT INTO device_tokens (owner_id, device_id, token_hash) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (device_id) DO UPDATE \
                     SET token_hash = EXCLUDED.token_hash, owner_id = EXCLUDED.owner_id \
                 RETURNING *",
                &[&owner_id, &device_id, &token_hash],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        Ok(DeviceToken {
            id: row.get("id"),
            owner_id: row.get("owner_id"),
            device_id: row.get("device_id"),
            token_hash: row.get("token_hash"),
            created_at: row.get("created_at"),
        })
    }

    async fn find_device_token(
        &self,
        device_id: &str,
    ) -> Result<Option<DeviceToken>, DatabaseError> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT * FROM device_tokens WHERE device_id = $1", &[&device_id])
            .await
            .map_err(DatabaseError::from_pg)?;
        Ok(row.map(|row| DeviceToken {
            id: row.get("id"),
            owner_id: row.get("owner_id"),
            device_id: row.get("device_id"),
            token_hash: row.get("token_hash"),
            created_at: row.get("created_at"),
        }))
    }

    // --- Workflows ---

    async fn create_workflow(
        &self,
        owner_id: i64,
        name: &str,
        nodes: &[WorkflowNode],
    ) -> Result<Workflow, DatabaseError> {
        let client = self.client().await?;
        let nodes_json = serde_json::to_value(nodes)
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        let row = client
            .query_one(
                "INSERT INTO workflows (owner_id, name, nodes) \
                 VALUES ($1, $2, $3) RETURNING *",
                &[&owner_id, &name, &nodes_json],
            )
            .await
            .map_err(DatabaseError::from_pg)?;
        workflow_from_row(&row)
    }

    async fn get_workflow(&self, id: i64) -> Result<Option<Workflow>, DatabaseError> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT * FROM workflows WHERE id = $1", &[&id])
            .await
            .map_err(DatabaseError::from_pg)?;
        row.as_ref().map(workflow_from_row).transpose()
    }

    async fn list_workflows(&self, owner_id: Option<i64>) -> Result<Vec<Workflow>, DatabaseError> {
        let client = self.client().await?;
        let rows = match owner_id {
            Some(owner) => {
                client
                    .query(
                        "SELECT * FROM workflows WHERE owner_id = $1 ORDER BY id",
                        &[&owner],
                    )
                    .await
            }
            None => client.query("SELECT * FROM workflows ORDER BY id", &[]).await,
        }
        .map_err(DatabaseError::from_pg)?;
        rows.iter().map(workflow_from_row).collect()
    }
}
