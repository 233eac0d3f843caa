use chrono::Utc;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use tether::JsonFileStore;
use tether_types::{Layout, Panel, Session, SessionStore, TerminalRecord, TetherError};

fn record(id: &str, session_id: &str) -> TerminalRecord {
    TerminalRecord {
        id: id.to_string(),
        session_id: session_id.to_string(),
        owner_user_id: "alice".to_string(),
        panel_id: Some("p1".to_string()),
        multiplexer_name: format!("tether_{}_{}", session_id, id),
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_sessions_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let session = Session::new("alice", "work");
    {
        let store = JsonFileStore::open(temp_dir.path()).await.unwrap();
        store.create_session(&session).await.unwrap();
        let layout = Layout {
            panels: vec![Panel {
                panel_id: "p1".into(),
                terminal_id: Some("t1".into()),
                display_name: "Shell".into(),
            }],
            focused_panel_id: Some("p1".into()),
        };
        store.update_layout(&session.id, &layout).await.unwrap();
    }

    let store = JsonFileStore::open(temp_dir.path()).await.unwrap();
    let loaded = store.find_session(&session.id).await.unwrap().unwrap();
    assert_eq!(loaded.name, "work");
    assert_eq!(loaded.layout.terminal_ids(), vec!["t1".to_string()]);
    assert!(temp_dir
        .path()
        .join("sessions")
        .join(format!("{}.json", session.id))
        .exists());
}

#[tokio::test]
async fn test_list_filters_by_owner_and_skips_garbage() {
    let temp_dir = TempDir::new().unwrap();
    let store = JsonFileStore::open(temp_dir.path()).await.unwrap();
    store.create_session(&Session::new("alice", "a")).await.unwrap();
    store.create_session(&Session::new("alice", "b")).await.unwrap();
    store.create_session(&Session::new("bob", "c")).await.unwrap();
    std::fs::write(temp_dir.path().join("sessions/broken.json"), "{ nope").unwrap();
    std::fs::write(temp_dir.path().join("sessions/notes.txt"), "ignored").unwrap();

    let mut names: Vec<String> = store
        .list_sessions_for_user("alice")
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn test_rename_touch_and_delete() {
    let temp_dir = TempDir::new().unwrap();
    let store = JsonFileStore::open(temp_dir.path()).await.unwrap();
    let session = Session::new("alice", "old");
    store.create_session(&session).await.unwrap();

    assert!(store.rename_session(&session.id, "new").await.unwrap());
    assert!(!store.rename_session("missing", "x").await.unwrap());

    store.touch_session(&session.id).await.unwrap();
    let loaded = store.find_session(&session.id).await.unwrap().unwrap();
    assert_eq!(loaded.name, "new");
    assert!(loaded.last_accessed >= session.last_accessed);

    store.delete_session(&session.id).await.unwrap();
    store.delete_session(&session.id).await.unwrap();
    assert!(store.find_session(&session.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_update_layout_of_missing_session_is_not_found() {
    let temp_dir = TempDir::new().unwrap();
    let store = JsonFileStore::open(temp_dir.path()).await.unwrap();
    let err = store
        .update_layout("missing", &Layout::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_terminal_records_upsert_and_list() {
    let temp_dir = TempDir::new().unwrap();
    let store = JsonFileStore::open(temp_dir.path()).await.unwrap();

    store.create_terminal_record(&record("t1", "s1")).await.unwrap();
    store.create_terminal_record(&record("t2", "s1")).await.unwrap();
    store.create_terminal_record(&record("t3", "s2")).await.unwrap();

    let mut updated = record("t1", "s1");
    updated.panel_id = None;
    store.create_terminal_record(&updated).await.unwrap();

    let found = store.find_terminal_record("t1").await.unwrap().unwrap();
    assert_eq!(found.panel_id, None);
    assert_eq!(store.list_terminal_records("s1").await.unwrap().len(), 2);

    store.delete_terminal_record("t1").await.unwrap();
    assert!(store.find_terminal_record("t1").await.unwrap().is_none());
    assert_eq!(store.list_terminal_records("s1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_path_like_ids_are_refused() {
    let temp_dir = TempDir::new().unwrap();
    let store = JsonFileStore::open(temp_dir.path()).await.unwrap();

    let err = store
        .create_terminal_record(&record("../escape", "s1"))
        .await
        .unwrap_err();
    assert!(matches!(err, TetherError::InvalidRequest(_)));
    assert!(store.find_terminal_record("../escape").await.unwrap().is_none());
    assert!(store.find_session("../../etc/passwd").await.unwrap().is_none());
}
