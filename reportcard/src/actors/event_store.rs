//! Routine journal - append-only history of polls, agent turns and pipelines.
//!
//! Rows live in one sqlite `events` table keyed by a global sequence number.
//! Routines write with `AppendAsync` so journalling never blocks a decision;
//! readers page through one routine's history with `RoutineHistory`.
//!
//! ```rust,ignore
//! let (journal, _) = Actor::spawn(None, EventStoreActor, EventStoreArguments::InMemory).await?;
//! journal.send_message(EventStoreMsg::AppendAsync {
//!     event: AppendEvent::new(EVENT_POLL_CREATED, json!({ "config": config }), poll_id)?,
//! })?;
//! let history = call!(journal, |reply| EventStoreMsg::RoutineHistory {
//!     routine_id: poll_id.to_string(),
//!     after_seq: 0,
//!     reply,
//! })??;
//! ```

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

#[derive(Debug, Default)]
pub struct EventStoreActor;

/// Where the journal keeps its rows.
#[derive(Debug, Clone)]
pub enum EventStoreArguments {
    /// Sqlite file, created along with its directory if missing
    File(String),
    /// Private in-memory database, gone when the actor stops
    InMemory,
}

pub struct EventStoreState {
    pool: SqlitePool,
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug)]
pub enum EventStoreMsg {
    /// Append a new event and reply with the stored row
    Append {
        event: AppendEvent,
        reply: RpcReplyPort<JournalResult<shared_types::Event>>,
    },
    /// Append without waiting; failures are logged
    AppendAsync { event: AppendEvent },
    /// One routine's entries with `seq > after_seq`, in order
    RoutineHistory {
        routine_id: String,
        after_seq: i64,
        reply: RpcReplyPort<JournalResult<Vec<shared_types::Event>>>,
    },
    /// The newest `limit` matching entries, oldest first
    Recent {
        after_seq: i64,
        limit: i64,
        event_type_prefix: Option<String>,
        routine_id: Option<String>,
        reply: RpcReplyPort<JournalResult<Vec<shared_types::Event>>>,
    },
}

impl EventStoreActor {
    async fn open(args: &EventStoreArguments) -> Result<SqlitePool, sqlx::Error> {
        let pool = match args {
            EventStoreArguments::File(path) => {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    std::fs::create_dir_all(parent).ok();
                }
                SqlitePoolOptions::new()
                    .max_connections(4)
                    .connect_with(
                        SqliteConnectOptions::new()
                            .filename(path)
                            .create_if_missing(true),
                    )
                    .await?
            }
            // Every in-memory connection is its own database, so pin the pool to one.
            EventStoreArguments::InMemory => {
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
                    .await?
            }
        };

        Self::run_migrations(&pool).await?;
        Ok(pool)
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT UNIQUE NOT NULL,
                timestamp TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                actor_id TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_actor_id ON events(actor_id)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_event_type ON events(event_type)")
            .execute(pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl Actor for EventStoreActor {
    type Msg = EventStoreMsg;
    type State = EventStoreState;
    type Arguments = EventStoreArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let pool = Self::open(&args)
            .await
            .map_err(|e| ActorProcessingErr::from(format!("failed to open journal: {e}")))?;
        tracing::info!(actor_id = %myself.get_id(), storage = ?args, "Journal ready");
        Ok(EventStoreState { pool })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            EventStoreMsg::Append { event, reply } => {
                let _ = reply.send(append(&state.pool, event).await);
            }
            EventStoreMsg::AppendAsync { event } => {
                let event_type = event.event_type.clone();
                let routine_id = event.actor_id.clone();
                if let Err(e) = append(&state.pool, event).await {
                    tracing::warn!(event_type = %event_type, routine_id = %routine_id, error = %e, "Journal append failed");
                }
            }
            EventStoreMsg::RoutineHistory {
                routine_id,
                after_seq,
                reply,
            } => {
                let _ = reply.send(routine_history(&state.pool, &routine_id, after_seq).await);
            }
            EventStoreMsg::Recent {
                after_seq,
                limit,
                event_type_prefix,
                routine_id,
                reply,
            } => {
                let filter = RecentFilter {
                    after_seq,
                    limit,
                    event_type_prefix,
                    routine_id,
                };
                let _ = reply.send(recent(&state.pool, filter).await);
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.pool.close().await;
        tracing::info!(actor_id = %myself.get_id(), "Journal closed");
        Ok(())
    }
}

// ============================================================================
// Entries
// ============================================================================

/// An entry before it has a sequence number. `actor_id` names the routine.
#[derive(Debug, Clone)]
pub struct AppendEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub actor_id: String,
}

impl AppendEvent {
    pub fn new(
        event_type: impl Into<String>,
        payload: impl serde::Serialize,
        actor_id: impl Into<String>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_type: event_type.into(),
            payload: serde_json::to_value(payload)?,
            actor_id: actor_id.into(),
        })
    }
}

#[derive(Debug, thiserror::Error, Clone)]
pub enum EventStoreError {
    #[error("journal database error: {0}")]
    Database(String),

    #[error("journal payload error: {0}")]
    Serialization(String),
}

pub type JournalResult<T> = Result<T, EventStoreError>;

impl From<sqlx::Error> for EventStoreError {
    fn from(e: sqlx::Error) -> Self {
        EventStoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for EventStoreError {
    fn from(e: serde_json::Error) -> Self {
        EventStoreError::Serialization(e.to_string())
    }
}

// ============================================================================
// Queries
// ============================================================================

const SELECT_COLUMNS: &str = "SELECT seq, event_id, timestamp, event_type, payload, actor_id FROM events";

struct RecentFilter {
    after_seq: i64,
    limit: i64,
    event_type_prefix: Option<String>,
    routine_id: Option<String>,
}

fn event_from_row(row: &SqliteRow) -> JournalResult<shared_types::Event> {
    let payload: String = row.try_get("payload")?;
    let timestamp: DateTime<Utc> = row.try_get("timestamp")?;
    Ok(shared_types::Event {
        seq: row.try_get("seq")?,
        event_id: row.try_get("event_id")?,
        timestamp,
        actor_id: row.try_get("actor_id")?,
        event_type: row.try_get("event_type")?,
        payload: serde_json::from_str(&payload)?,
    })
}

async fn append(pool: &SqlitePool, entry: AppendEvent) -> JournalResult<shared_types::Event> {
    let payload = serde_json::to_string(&entry.payload)?;
    let row = sqlx::query(
        r#"
        INSERT INTO events (event_id, timestamp, event_type, payload, actor_id)
        VALUES (?1, ?2, ?3, ?4, ?5)
        RETURNING seq, event_id, timestamp, event_type, payload, actor_id
        "#,
    )
    .bind(ulid::Ulid::new().to_string())
    .bind(Utc::now())
    .bind(&entry.event_type)
    .bind(&payload)
    .bind(&entry.actor_id)
    .fetch_one(pool)
    .await?;

    event_from_row(&row)
}

async fn routine_history(
    pool: &SqlitePool,
    routine_id: &str,
    after_seq: i64,
) -> JournalResult<Vec<shared_types::Event>> {
    let sql = format!("{SELECT_COLUMNS} WHERE actor_id = ?1 AND seq > ?2 ORDER BY seq ASC");
    let rows = sqlx::query(&sql)
        .bind(routine_id)
        .bind(after_seq)
        .fetch_all(pool)
        .await?;
    rows.iter().map(event_from_row).collect()
}

async fn recent(pool: &SqlitePool, filter: RecentFilter) -> JournalResult<Vec<shared_types::Event>> {
    let prefix_pattern = filter.event_type_prefix.map(|p| format!("{p}%"));
    let sql = format!(
        "SELECT * FROM ({SELECT_COLUMNS}
            WHERE seq > ?1
              AND (?2 IS NULL OR event_type LIKE ?2)
              AND (?3 IS NULL OR actor_id = ?3)
            ORDER BY seq DESC
            LIMIT ?4)
         ORDER BY seq ASC"
    );
    let rows = sqlx::query(&sql)
        .bind(filter.after_seq)
        .bind(prefix_pattern)
        .bind(filter.routine_id)
        .bind(filter.limit.clamp(1, 1000))
        .fetch_all(pool)
        .await?;
    rows.iter().map(event_from_row).collect()
}
