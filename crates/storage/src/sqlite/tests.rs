use tempfile::TempDir;

use super::*;
use crate::StorageError;

/// Returns the store together with its `TempDir` so the database file outlives the test body.
async fn open_test_storage() -> (SqliteStorage, TempDir) {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    let path = dir.path().join("history").join(DEFAULT_DATABASE_FILE_NAME);
    let storage = SqliteStorage::open(path.to_str().expect("utf-8 temp path"))
        .await
        .expect("failed to open sqlite storage");
    (storage, dir)
}

fn session_titles(storage: &SqliteStorage) -> Vec<String> {
    storage
        .list_sessions()
        .expect("list sessions")
        .into_iter()
        .map(|session| session.title)
        .collect()
}

#[tokio::test]
async fn open_runs_migrations_and_seeds_one_active_prompt() {
    let (storage, _dir) = open_test_storage().await;

    let prompts = storage.list_system_prompts().expect("list prompts");
    assert_eq!(prompts.len(), DEFAULT_SYSTEM_PROMPTS.len());
    assert_eq!(prompts.iter().filter(|prompt| prompt.is_active).count(), 1);

    let active = storage
        .active_system_prompt()
        .expect("active prompt query")
        .expect("seeded active prompt");
    assert_eq!(active.name, DEFAULT_SYSTEM_PROMPTS[0].0);
    assert!(storage.list_sessions().expect("list sessions").is_empty());
}

#[tokio::test]
async fn reopening_keeps_history_and_does_not_reseed() {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    let path = dir.path().join(DEFAULT_DATABASE_FILE_NAME);
    let location = path.to_str().expect("utf-8 temp path").to_string();

    let first = SqliteStorage::open(&location).await.expect("first open");
    let session = first
        .create_session(NewSession::new("kept"))
        .expect("create session");
    first
        .append_message(session.id, NewMessage::user("hello"))
        .expect("append message");
    drop(first);

    let second = SqliteStorage::open(&location).await.expect("second open");
    assert_eq!(session_titles(&second), vec!["kept".to_string()]);
    assert_eq!(second.list_messages(session.id).expect("messages").len(), 1);
    assert_eq!(
        second.list_system_prompts().expect("prompts").len(),
        DEFAULT_SYSTEM_PROMPTS.len()
    );
}

#[tokio::test]
async fn open_rejects_in_memory_locations() {
    let error = SqliteStorage::open(":memory:")
        .await
        .expect_err("in-memory store must be rejected");
    assert!(matches!(error, StorageError::InvariantViolation { .. }));
}

#[tokio::test]
async fn list_sessions_orders_by_last_update_and_append_moves_to_front() {
    let (storage, _dir) = open_test_storage().await;

    let first = storage
        .create_session(NewSession::new("first"))
        .expect("create first");
    storage
        .create_session(NewSession::new("second"))
        .expect("create second");
    storage
        .create_session(NewSession::new("third"))
        .expect("create third");

    assert_eq!(session_titles(&storage), vec!["third", "second", "first"]);

    storage
        .append_message(first.id, NewMessage::user("bump"))
        .expect("append to first");
    assert_eq!(session_titles(&storage), vec!["first", "third", "second"]);

    let reloaded = storage
        .get_session(first.id)
        .expect("get session")
        .expect("session exists");
    assert!(reloaded.updated_at >= first.updated_at);
    assert_eq!(reloaded.created_at, first.created_at);
}

#[tokio::test]
async fn append_moves_session_to_front_when_clock_steps_back() {
    let (storage, _dir) = open_test_storage().await;
    let a = storage.create_session(NewSession::new("a")).expect("create a");
    let b = storage.create_session(NewSession::new("b")).expect("create b");

    storage
        .append_message(a.id, NewMessage::user("before fall-back"))
        .expect("append to a");

    // a was written during the repeated hour, so its wall-clock stamp is ahead of b's.
    let skewed = timestamp::format(&(timestamp::now() + chrono::Duration::hours(1)));
    let database_url = storage.database_url.clone();
    storage
        .run_db_call("test-skew-updated-at", async move {
            let mut connection =
                connect_store_connection(&database_url, "test-skew-connect").await?;
            sqlx::query("UPDATE Sessions SET UpdatedAt = ? WHERE Id = ?")
                .bind(skewed)
                .bind(a.id.get())
                .execute(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "test-skew-update",
                })?;
            Ok(())
        })
        .expect("skew a");

    storage
        .append_message(b.id, NewMessage::user("after fall-back"))
        .expect("append to b");
    assert_eq!(session_titles(&storage), vec!["b", "a"]);
}

#[tokio::test]
async fn list_messages_returns_creation_order() {
    let (storage, _dir) = open_test_storage().await;
    let session = storage
        .create_session(NewSession::new("ordered"))
        .expect("create session");

    let contents = ["q1", "a1", "q2", "a2"];
    for (index, content) in contents.iter().enumerate() {
        let message = if index % 2 == 0 {
            NewMessage::user(*content)
        } else {
            NewMessage::assistant(*content)
        };
        storage
            .append_message(session.id, message)
            .expect("append message");
    }

    let messages = storage.list_messages(session.id).expect("list messages");
    let listed = messages
        .iter()
        .map(|message| message.content.as_str())
        .collect::<Vec<_>>();
    assert_eq!(listed, contents);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[1].role, MessageRole::Assistant);
    assert!(messages.iter().all(|message| message.session_id == session.id));
}

#[tokio::test]
async fn delete_session_removes_messages_and_list_entry() {
    let (storage, _dir) = open_test_storage().await;
    let doomed = storage
        .create_session(NewSession::new("doomed"))
        .expect("create doomed");
    let kept = storage
        .create_session(NewSession::new("kept"))
        .expect("create kept");
    storage
        .append_message(doomed.id, NewMessage::user("bye"))
        .expect("append doomed");
    storage
        .append_message(kept.id, NewMessage::user("hi"))
        .expect("append kept");

    storage.delete_session(doomed.id).expect("delete session");

    assert!(storage.list_messages(doomed.id).expect("messages").is_empty());
    assert_eq!(session_titles(&storage), vec!["kept"]);
    assert_eq!(storage.list_messages(kept.id).expect("messages").len(), 1);
    assert!(storage.get_session(doomed.id).expect("get").is_none());

    let error = storage
        .delete_session(doomed.id)
        .expect_err("second delete must fail");
    assert!(error.is_not_found());
}

#[tokio::test]
async fn append_to_missing_session_fails_without_writing() {
    let (storage, _dir) = open_test_storage().await;
    let missing = SessionId::new(404);

    let error = storage
        .append_message(missing, NewMessage::user("orphan"))
        .expect_err("append must fail");
    assert!(error.is_not_found());
    assert!(storage.list_messages(missing).expect("messages").is_empty());
}

#[tokio::test]
async fn commit_turn_creates_session_and_messages_together() {
    let (storage, _dir) = open_test_storage().await;

    let commit = storage
        .commit_turn(
            TurnSession::Create(NewSession::new("Hello, how are you?")),
            vec![NewMessage::user("Hello, how are you?"), NewMessage::assistant("Fine.")],
        )
        .expect("commit turn");

    assert!(commit.created_session);
    assert_eq!(commit.messages.len(), 2);
    assert_eq!(commit.session.title, "Hello, how are you?");

    let follow_up = storage
        .commit_turn(
            TurnSession::Existing(commit.session.id),
            vec![NewMessage::user("again")],
        )
        .expect("commit follow-up");
    assert!(!follow_up.created_session);
    assert_eq!(follow_up.session.id, commit.session.id);

    let stored = storage
        .list_messages(commit.session.id)
        .expect("list messages")
        .into_iter()
        .map(|message| (message.role, message.content))
        .collect::<Vec<_>>();
    assert_eq!(
        stored,
        vec![
            (MessageRole::User, "Hello, how are you?".to_string()),
            (MessageRole::Assistant, "Fine.".to_string()),
            (MessageRole::User, "again".to_string()),
        ]
    );
}

#[tokio::test]
async fn commit_turn_never_leaves_an_empty_or_orphaned_session() {
    let (storage, _dir) = open_test_storage().await;

    let empty = storage
        .commit_turn(TurnSession::Create(NewSession::new("empty")), Vec::new())
        .expect_err("empty turn must be rejected");
    assert!(matches!(empty, StorageError::InvariantViolation { .. }));

    let missing = storage
        .commit_turn(
            TurnSession::Existing(SessionId::new(77)),
            vec![NewMessage::user("lost")],
        )
        .expect_err("missing session must be rejected");
    assert!(missing.is_not_found());

    assert!(storage.list_sessions().expect("list sessions").is_empty());
    assert!(
        storage
            .list_messages(SessionId::new(77))
            .expect("list messages")
            .is_empty()
    );
}

#[tokio::test]
async fn set_active_system_prompt_switches_the_single_active_flag() {
    let (storage, _dir) = open_test_storage().await;
    let added = storage
        .add_system_prompt(NewSystemPrompt {
            name: "Reviewer".to_string(),
            content: "Review code strictly.".to_string(),
        })
        .expect("add prompt");
    assert!(!added.is_active);

    storage
        .set_active_system_prompt(added.id)
        .expect("activate prompt");
    let active = storage
        .active_system_prompt()
        .expect("active query")
        .expect("active prompt");
    assert_eq!(active.id, added.id);

    let prompts = storage.list_system_prompts().expect("list prompts");
    assert_eq!(prompts.iter().filter(|prompt| prompt.is_active).count(), 1);

    let error = storage
        .set_active_system_prompt(SystemPromptId::new(9_999))
        .expect_err("unknown prompt must fail");
    assert!(error.is_not_found());
    let still_active = storage
        .active_system_prompt()
        .expect("active query")
        .expect("active prompt survives failed switch");
    assert_eq!(still_active.id, added.id);
}
