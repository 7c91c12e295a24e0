use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDateTime;
use snafu::{OptionExt, ResultExt, ensure};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, FromRow, SqliteConnection, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, InvariantViolationSnafu, NotFoundSnafu, SqliteConnectOptionsSnafu,
    SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu,
    SqliteRuntimeInitSnafu, SqliteThreadSpawnSnafu, StorageResult,
};
use super::ids::{MessageId, SessionId, SystemPromptId};
use super::timestamp;
use super::types::{
    DEFAULT_SYSTEM_PROMPTS, MessageRecord, MessageRole, NewMessage, NewSession, NewSystemPrompt,
    SessionRecord, SystemPromptRecord, TurnCommit, TurnSession,
};
use super::{MessageStore, SessionStore, SystemPromptStore};

#[cfg(test)]
mod tests;

pub const DEFAULT_DATABASE_FILE_NAME: &str = "chat_history.db";

/// SQLite-backed store. Every trait call runs on its own short-lived connection,
/// so the store assumes a single writer per process.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure!(
            !is_in_memory_location(database_location),
            InvariantViolationSnafu {
                stage: "sqlite-open-reject-memory",
                details: "per-call connections need a file-backed database".to_string(),
            }
        );
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        let seeded = seed_default_system_prompts(&pool).await?;
        // Later calls open their own connections; the setup pool is only needed here.
        pool.close().await;
        tracing::info!(
            database_url = %database_url,
            seeded_system_prompts = seeded,
            "opened sqlite chat history store"
        );

        Ok(Self { database_url })
    }

    fn run_db_call<T, F>(&self, stage: &'static str, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: Future<Output = StorageResult<T>> + Send + 'static,
    {
        // Store traits are sync, so each call executes on a dedicated worker thread
        // with its own current-thread runtime to avoid nested-runtime blocking panics.
        let worker = std::thread::Builder::new()
            .name(format!("sqlite-store-{stage}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context(SqliteRuntimeInitSnafu {
                        stage: "sqlite-store-runtime-build",
                    })?;
                runtime.block_on(op)
            })
            .context(SqliteThreadSpawnSnafu {
                stage: "sqlite-store-spawn-worker",
            })?;

        match worker.join() {
            Ok(result) => result,
            Err(_) => InvariantViolationSnafu {
                stage,
                details: "sqlite storage worker thread panicked".to_string(),
            }
            .fail(),
        }
    }
}

impl SessionStore for SqliteStorage {
    fn create_session(&self, input: NewSession) -> StorageResult<SessionRecord> {
        let database_url = self.database_url.clone();
        self.run_db_call("session-create", async move {
            let mut connection =
                connect_store_connection(&database_url, "session-create-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "session-create-begin",
            })?;

            let created = insert_session(&mut tx, input.title, timestamp::now()).await?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "session-create-commit",
            })?;

            tracing::debug!(session_id = %created.id, "created session");
            Ok(created)
        })
    }

    fn list_sessions(&self) -> StorageResult<Vec<SessionRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("session-list", async move {
            let mut connection =
                connect_store_connection(&database_url, "session-list-connect").await?;
            // Revision increases on every write, so the order survives wall-clock steps
            // backwards and ties within one second.
            let rows = sqlx::query_as::<_, SessionRow>(
                "SELECT Id, Title, CreatedAt, UpdatedAt FROM Sessions ORDER BY Revision DESC, Id DESC",
            )
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "session-list-query",
            })?;

            rows.into_iter().map(session_row_to_record).collect()
        })
    }

    fn get_session(&self, session_id: SessionId) -> StorageResult<Option<SessionRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("session-get", async move {
            let mut connection =
                connect_store_connection(&database_url, "session-get-connect").await?;
            load_session(&mut connection, session_id, "session-get-query").await
        })
    }

    fn delete_session(&self, session_id: SessionId) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        self.run_db_call("session-delete", async move {
            let mut connection =
                connect_store_connection(&database_url, "session-delete-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "session-delete-begin",
            })?;

            // Explicit message delete keeps the cascade independent of the foreign_keys pragma.
            let removed_messages = sqlx::query("DELETE FROM Messages WHERE SessionId = ?")
                .bind(session_id.get())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "session-delete-messages",
                })?
                .rows_affected();

            let removed_sessions = sqlx::query("DELETE FROM Sessions WHERE Id = ?")
                .bind(session_id.get())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "session-delete-session",
                })?
                .rows_affected();

            if removed_sessions == 0 {
                return NotFoundSnafu {
                    stage: "session-delete-missing",
                    entity: "session",
                    id: session_id.to_string(),
                }
                .fail();
            }

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "session-delete-commit",
            })?;

            tracing::debug!(session_id = %session_id, removed_messages, "deleted session");
            Ok(())
        })
    }
}

impl MessageStore for SqliteStorage {
    fn append_message(
        &self,
        session_id: SessionId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-append", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-append-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "message-append-begin",
            })?;

            ensure_session_exists(&mut tx, session_id, "message-append-missing-session").await?;

            let now = timestamp::now();
            let message = insert_message(&mut tx, session_id, input, now).await?;
            touch_session(&mut tx, session_id, now).await?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-append-commit",
            })?;

            Ok(message)
        })
    }

    fn list_messages(&self, session_id: SessionId) -> StorageResult<Vec<MessageRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-list", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-list-connect").await?;
            let rows = sqlx::query_as::<_, MessageRow>(
                "SELECT Id, SessionId, Content, Role, CreatedAt FROM Messages WHERE SessionId = ? ORDER BY CreatedAt ASC, Id ASC",
            )
            .bind(session_id.get())
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-list-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }

    fn commit_turn(
        &self,
        session: TurnSession,
        messages: Vec<NewMessage>,
    ) -> StorageResult<TurnCommit> {
        // A turn without messages would leave an empty session behind.
        ensure!(
            !messages.is_empty(),
            InvariantViolationSnafu {
                stage: "turn-commit-empty",
                details: "a turn must persist at least one message".to_string(),
            }
        );

        let database_url = self.database_url.clone();
        self.run_db_call("turn-commit", async move {
            let mut connection =
                connect_store_connection(&database_url, "turn-commit-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "turn-commit-begin",
            })?;

            let now = timestamp::now();
            let (mut session, created_session) = match session {
                TurnSession::Existing(session_id) => {
                    let existing = load_session(&mut tx, session_id, "turn-commit-load-session")
                        .await?
                        .context(NotFoundSnafu {
                            stage: "turn-commit-missing-session",
                            entity: "session",
                            id: session_id.to_string(),
                        })?;
                    (existing, false)
                }
                TurnSession::Create(input) => (insert_session(&mut tx, input.title, now).await?, true),
            };

            let mut persisted = Vec::with_capacity(messages.len());
            for message in messages {
                persisted.push(insert_message(&mut tx, session.id, message, now).await?);
            }
            touch_session(&mut tx, session.id, now).await?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "turn-commit-commit",
            })?;

            session.updated_at = now;
            tracing::debug!(
                session_id = %session.id,
                created_session,
                message_count = persisted.len(),
                "committed conversation turn"
            );

            Ok(TurnCommit {
                session,
                created_session,
                messages: persisted,
            })
        })
    }
}

impl SystemPromptStore for SqliteStorage {
    fn list_system_prompts(&self) -> StorageResult<Vec<SystemPromptRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("system-prompt-list", async move {
            let mut connection =
                connect_store_connection(&database_url, "system-prompt-list-connect").await?;
            let rows = sqlx::query_as::<_, SystemPromptRow>(
                "SELECT Id, Name, Content, IsActive, CreatedAt, UpdatedAt FROM SystemPrompts ORDER BY CreatedAt DESC, Id DESC",
            )
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "system-prompt-list-query",
            })?;

            rows.into_iter().map(system_prompt_row_to_record).collect()
        })
    }

    fn add_system_prompt(&self, input: NewSystemPrompt) -> StorageResult<SystemPromptRecord> {
        let database_url = self.database_url.clone();
        self.run_db_call("system-prompt-add", async move {
            let mut connection =
                connect_store_connection(&database_url, "system-prompt-add-connect").await?;
            let now = timestamp::now();
            let created_at = timestamp::format(&now);
            let result = sqlx::query(
                "INSERT INTO SystemPrompts (Name, Content, IsActive, CreatedAt, UpdatedAt) VALUES (?, ?, 0, ?, ?)",
            )
            .bind(input.name.clone())
            .bind(input.content.clone())
            .bind(created_at.clone())
            .bind(created_at)
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "system-prompt-add-insert",
            })?;

            Ok(SystemPromptRecord {
                id: SystemPromptId::new(result.last_insert_rowid()),
                name: input.name,
                content: input.content,
                is_active: false,
                created_at: now,
                updated_at: now,
            })
        })
    }

    fn active_system_prompt(&self) -> StorageResult<Option<SystemPromptRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("system-prompt-active", async move {
            let mut connection =
                connect_store_connection(&database_url, "system-prompt-active-connect").await?;
            let row = sqlx::query_as::<_, SystemPromptRow>(
                "SELECT Id, Name, Content, IsActive, CreatedAt, UpdatedAt FROM SystemPrompts WHERE IsActive = 1 ORDER BY UpdatedAt DESC, Id DESC LIMIT 1",
            )
            .fetch_optional(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "system-prompt-active-query",
            })?;

            row.map(system_prompt_row_to_record).transpose()
        })
    }

    fn set_active_system_prompt(&self, prompt_id: SystemPromptId) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        self.run_db_call("system-prompt-activate", async move {
            let mut connection =
                connect_store_connection(&database_url, "system-prompt-activate-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "system-prompt-activate-begin",
            })?;

            sqlx::query("UPDATE SystemPrompts SET IsActive = 0 WHERE IsActive = 1")
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "system-prompt-activate-clear",
                })?;

            let updated = sqlx::query(
                "UPDATE SystemPrompts SET IsActive = 1, UpdatedAt = ? WHERE Id = ?",
            )
            .bind(timestamp::format(&timestamp::now()))
            .bind(prompt_id.get())
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "system-prompt-activate-set",
            })?
            .rows_affected();

            // Dropping the transaction rolls back the cleared flags.
            if updated == 0 {
                return NotFoundSnafu {
                    stage: "system-prompt-activate-missing",
                    entity: "system_prompt",
                    id: prompt_id.to_string(),
                }
                .fail();
            }

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "system-prompt-activate-commit",
            })?;

            Ok(())
        })
    }
}

#[derive(Debug, FromRow)]
#[sqlx(rename_all = "PascalCase")]
struct SessionRow {
    id: i64,
    title: String,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, FromRow)]
#[sqlx(rename_all = "PascalCase")]
struct MessageRow {
    id: i64,
    session_id: i64,
    content: String,
    role: String,
    created_at: String,
}

#[derive(Debug, FromRow)]
#[sqlx(rename_all = "PascalCase")]
struct SystemPromptRow {
    id: i64,
    name: String,
    content: String,
    is_active: i64,
    created_at: String,
    updated_at: String,
}

fn session_row_to_record(row: SessionRow) -> StorageResult<SessionRecord> {
    Ok(SessionRecord {
        id: SessionId::new(row.id),
        title: row.title,
        created_at: timestamp::parse(&row.created_at, "session-row-created-at")?,
        updated_at: timestamp::parse(&row.updated_at, "session-row-updated-at")?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::new(row.id),
        session_id: SessionId::new(row.session_id),
        role: role_from_sql(&row.role)?,
        content: row.content,
        created_at: timestamp::parse(&row.created_at, "message-row-created-at")?,
    })
}

fn system_prompt_row_to_record(row: SystemPromptRow) -> StorageResult<SystemPromptRecord> {
    Ok(SystemPromptRecord {
        id: SystemPromptId::new(row.id),
        name: row.name,
        content: row.content,
        is_active: row.is_active == 1,
        created_at: timestamp::parse(&row.created_at, "system-prompt-row-created-at")?,
        updated_at: timestamp::parse(&row.updated_at, "system-prompt-row-updated-at")?,
    })
}

async fn connect_store_connection(
    database_url: &str,
    stage: &'static str,
) -> StorageResult<SqliteConnection> {
    let mut connection =
        SqliteConnection::connect(database_url)
            .await
            .context(SqliteConnectSnafu {
                stage,
                database_url: database_url.to_string(),
            })?;

    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-foreign-keys",
            pragma: "foreign_keys",
        })?;
    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-busy-timeout",
            pragma: "busy_timeout",
        })?;

    Ok(connection)
}

async fn load_session(
    connection: &mut SqliteConnection,
    session_id: SessionId,
    stage: &'static str,
) -> StorageResult<Option<SessionRecord>> {
    let row = sqlx::query_as::<_, SessionRow>(
        "SELECT Id, Title, CreatedAt, UpdatedAt FROM Sessions WHERE Id = ?",
    )
    .bind(session_id.get())
    .fetch_optional(&mut *connection)
    .await
    .context(SqliteQuerySnafu { stage })?;

    row.map(session_row_to_record).transpose()
}

async fn ensure_session_exists(
    connection: &mut SqliteConnection,
    session_id: SessionId,
    stage: &'static str,
) -> StorageResult<()> {
    let existing = sqlx::query_scalar::<_, i64>("SELECT 1 FROM Sessions WHERE Id = ? LIMIT 1")
        .bind(session_id.get())
        .fetch_optional(&mut *connection)
        .await
        .context(SqliteQuerySnafu {
            stage: "session-exists-query",
        })?;

    if existing.is_none() {
        return NotFoundSnafu {
            stage,
            entity: "session",
            id: session_id.to_string(),
        }
        .fail();
    }

    Ok(())
}

async fn next_revision(connection: &mut SqliteConnection) -> StorageResult<i64> {
    sqlx::query_scalar::<_, i64>("SELECT COALESCE(MAX(Revision), 0) + 1 FROM Sessions")
        .fetch_one(&mut *connection)
        .await
        .context(SqliteQuerySnafu {
            stage: "session-next-revision",
        })
}

async fn insert_session(
    connection: &mut SqliteConnection,
    title: String,
    now: NaiveDateTime,
) -> StorageResult<SessionRecord> {
    let revision = next_revision(connection).await?;
    let now_text = timestamp::format(&now);
    let result = sqlx::query(
        "INSERT INTO Sessions (Title, CreatedAt, UpdatedAt, Revision) VALUES (?, ?, ?, ?)",
    )
    .bind(title.clone())
    .bind(now_text.clone())
    .bind(now_text)
    .bind(revision)
    .execute(&mut *connection)
    .await
    .context(SqliteQuerySnafu {
        stage: "session-insert",
    })?;

    Ok(SessionRecord {
        id: SessionId::new(result.last_insert_rowid()),
        title,
        created_at: now,
        updated_at: now,
    })
}

async fn insert_message(
    connection: &mut SqliteConnection,
    session_id: SessionId,
    input: NewMessage,
    now: NaiveDateTime,
) -> StorageResult<MessageRecord> {
    let result = sqlx::query(
        "INSERT INTO Messages (SessionId, Content, Role, CreatedAt) VALUES (?, ?, ?, ?)",
    )
    .bind(session_id.get())
    .bind(input.content.clone())
    .bind(input.role.as_str())
    .bind(timestamp::format(&now))
    .execute(&mut *connection)
    .await
    .context(SqliteQuerySnafu {
        stage: "message-insert",
    })?;

    Ok(MessageRecord {
        id: MessageId::new(result.last_insert_rowid()),
        session_id,
        role: input.role,
        content: input.content,
        created_at: now,
    })
}

async fn touch_session(
    connection: &mut SqliteConnection,
    session_id: SessionId,
    now: NaiveDateTime,
) -> StorageResult<()> {
    let revision = next_revision(connection).await?;
    let updated = sqlx::query("UPDATE Sessions SET UpdatedAt = ?, Revision = ? WHERE Id = ?")
        .bind(timestamp::format(&now))
        .bind(revision)
        .bind(session_id.get())
        .execute(&mut *connection)
        .await
        .context(SqliteQuerySnafu {
            stage: "session-touch",
        })?
        .rows_affected();

    if updated == 0 {
        return NotFoundSnafu {
            stage: "session-touch-missing",
            entity: "session",
            id: session_id.to_string(),
        }
        .fail();
    }

    Ok(())
}

async fn seed_default_system_prompts(pool: &SqlitePool) -> StorageResult<usize> {
    let existing = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM SystemPrompts")
        .fetch_one(pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "system-prompt-seed-count",
        })?;
    if existing > 0 {
        return Ok(0);
    }

    let mut tx = pool.begin().await.context(SqliteQuerySnafu {
        stage: "system-prompt-seed-begin",
    })?;
    let now = timestamp::format(&timestamp::now());

    for (index, (name, content)) in DEFAULT_SYSTEM_PROMPTS.iter().enumerate() {
        sqlx::query(
            "INSERT INTO SystemPrompts (Name, Content, IsActive, CreatedAt, UpdatedAt) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(*name)
        .bind(*content)
        .bind(i64::from(index == 0))
        .bind(now.clone())
        .bind(now.clone())
        .execute(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "system-prompt-seed-insert",
        })?;
    }

    tx.commit().await.context(SqliteQuerySnafu {
        stage: "system-prompt-seed-commit",
    })?;

    Ok(DEFAULT_SYSTEM_PROMPTS.len())
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => InvariantViolationSnafu {
            stage: "message-role-from-sql",
            details: format!("unknown message role '{raw}'"),
        }
        .fail(),
    }
}

fn is_in_memory_location(database_location: &str) -> bool {
    database_location == ":memory:" || database_location.contains(":memory:")
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    format!("sqlite://{database_location}")
}
