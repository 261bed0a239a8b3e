//! Integration tests for NoteRepository
//!
//! Tests cover:
//! - Save/load round trips through a real libsql database
//! - Delete ordering (no resurrection through concurrent saves or loads)
//! - Folder deletion detaching member notes durably
//! - Query sorting and filtering over loaded notes
//! - Background flushing of the dirty set
//! - JSON export/import and settings persistence

use anyhow::Result;
use notekeep_core::config::FlushConfig;
use notekeep_core::db::{Collection, EntityStore, LibsqlStore, MemoryStore};
use notekeep_core::models::{NewFolder, NewNote, MAX_TAGS};
use notekeep_core::services::{
    flush_channel, ExportFormat, FlushProcessor, LoadOutcome, NoteQuery, NoteRepository,
    QuickFilter, SaveOutcome, SortKey,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Test helper: Create a repository over a fresh database
async fn create_test_env() -> Result<(Arc<LibsqlStore>, NoteRepository, TempDir)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("notes.db");
    let store = Arc::new(LibsqlStore::open(&db_path).await?);
    let repository = NoteRepository::new(store.clone());
    repository.load().await?;

    Ok((store, repository, temp_dir))
}

/// Test helper: A second repository over the same store, freshly loaded
async fn reload(store: &Arc<LibsqlStore>) -> Result<NoteRepository> {
    let repository = NoteRepository::new(store.clone());
    repository.load().await?;
    Ok(repository)
}

// =========================================================================
// Round Trip
// =========================================================================

#[tokio::test]
async fn test_save_then_load_round_trip() -> Result<()> {
    let (store, repo, _temp_dir) = create_test_env().await?;

    let work = repo.create_folder(NewFolder::named("Work")).await?;
    repo.create_folder(NewFolder::named("Q3").under(&work.id)).await?;
    repo.create(
        NewNote::titled("Plan")
            .with_content("<p>Ship it, see <a href=\"https://example.com\">docs</a></p>")
            .with_tags(["work", "q3"])
            .in_folder(&work.id)
            .favorite(),
    )
    .await?;
    repo.create(NewNote::titled("Groceries").shared()).await?;

    let outcome = tokio_test::assert_ok!(repo.save().await);
    assert_eq!(outcome, SaveOutcome::Saved { notes: 2, folders: 2 });

    let fresh = reload(&store).await?;
    assert_eq!(fresh.notes().await, repo.notes().await);
    assert_eq!(fresh.folders().await, repo.folders().await);
    Ok(())
}

#[tokio::test]
async fn test_load_skips_invalid_records() -> Result<()> {
    let (store, _repo, _temp_dir) = create_test_env().await?;
    store
        .save_many(
            &[json!({"id": "good", "title": "ok", "folderId": "missing"})],
            &[json!({"id": "f1", "name": "  "}), json!({"id": "f2", "name": "Kept"})],
        )
        .await?;

    let repo = NoteRepository::new(store.clone());
    let outcome = repo.load().await?;
    assert_eq!(
        outcome,
        LoadOutcome::Loaded {
            notes: 1,
            folders: 1,
            skipped: 1
        }
    );

    let note = repo.get_note("good").await.expect("valid note loaded");
    assert_eq!(note.folder_id, None, "dangling folder reference is cleared");
    Ok(())
}

#[tokio::test]
async fn test_tag_cap_survives_persistence() -> Result<()> {
    let (store, repo, _temp_dir) = create_test_env().await?;
    let tags: Vec<String> = (0..25).map(|i| format!("tag-{i}")).collect();

    let note = repo.create(NewNote::titled("many tags").with_tags(tags.clone())).await?;
    assert_eq!(note.tags.len(), MAX_TAGS);
    repo.save().await?;

    let fresh = reload(&store).await?;
    let loaded = fresh.get_note(&note.id).await.expect("note persisted");
    assert_eq!(loaded.tags, tags[..MAX_TAGS].to_vec());
    Ok(())
}

// =========================================================================
// Deletion
// =========================================================================

#[tokio::test]
async fn test_deleted_note_does_not_come_back() -> Result<()> {
    let (store, repo, _temp_dir) = create_test_env().await?;
    let doomed = repo.create(NewNote::titled("doomed")).await?;
    let kept = repo.create(NewNote::titled("kept")).await?;
    repo.save().await?;

    repo.delete(&doomed.id).await?;
    repo.create(NewNote::titled("unrelated")).await?;
    repo.save().await?;

    let fresh = reload(&store).await?;
    assert!(fresh.get_note(&doomed.id).await.is_none());
    assert!(fresh.get_note(&kept.id).await.is_some());
    assert_eq!(fresh.notes().await.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_delete_during_slow_save_does_not_resurrect() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let repo = NoteRepository::new(store.clone());
    let doomed = repo.create(NewNote::titled("doomed")).await?;
    repo.save().await?;

    store.set_latency(Duration::from_millis(40));
    let (saved, deleted) = tokio::join!(repo.save(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        repo.delete(&doomed.id).await
    });
    saved?;
    deleted?;
    store.set_latency(Duration::ZERO);

    assert!(store.get(Collection::Notes, &doomed.id).await?.is_none());
    let fresh = NoteRepository::new(store.clone());
    fresh.load().await?;
    assert!(fresh.notes().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_delete_during_slow_load_does_not_resurrect() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let repo = NoteRepository::new(store.clone());
    let doomed = repo.create(NewNote::titled("doomed")).await?;
    let kept = repo.create(NewNote::titled("kept")).await?;
    repo.save().await?;

    // The load reads the store before the delete removes the row
    store.set_latency(Duration::from_millis(40));
    let (loaded, deleted) = tokio::join!(repo.load(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        repo.delete(&doomed.id).await
    });
    loaded?;
    deleted?;
    store.set_latency(Duration::ZERO);

    assert!(repo.get_note(&doomed.id).await.is_none());
    assert!(repo.get_note(&kept.id).await.is_some());
    assert!(store.get(Collection::Notes, &doomed.id).await?.is_none());

    repo.save().await?;
    let fresh = NoteRepository::new(store.clone());
    fresh.load().await?;
    assert!(fresh.get_note(&doomed.id).await.is_none());
    assert_eq!(fresh.notes().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_folder_delete_during_slow_load_does_not_resurrect() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let repo = NoteRepository::new(store.clone());
    let folder = repo.create_folder(NewFolder::named("Doomed")).await?;
    let member = repo.create(NewNote::titled("member").in_folder(&folder.id)).await?;
    repo.save().await?;

    store.set_latency(Duration::from_millis(40));
    let (loaded, deleted) = tokio::join!(repo.load(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        repo.delete_folder(&folder.id).await
    });
    loaded?;
    assert_eq!(deleted?.detached_notes, 1);
    store.set_latency(Duration::ZERO);

    assert!(repo.get_folder(&folder.id).await.is_none());
    assert_eq!(repo.get_note(&member.id).await.and_then(|n| n.folder_id), None);
    assert!(store.get(Collection::Folders, &folder.id).await?.is_none());

    repo.save().await?;
    let fresh = NoteRepository::new(store.clone());
    fresh.load().await?;
    assert!(fresh.folders().await.is_empty());
    let note = fresh.get_note(&member.id).await.expect("member kept");
    assert_eq!(note.folder_id, None);
    Ok(())
}

#[tokio::test]
async fn test_folder_delete_detaches_notes_durably() -> Result<()> {
    let (store, repo, _temp_dir) = create_test_env().await?;
    let folder = repo.create_folder(NewFolder::named("F")).await?;
    let a = repo.create(NewNote::titled("A").in_folder(&folder.id)).await?;
    let b = repo.create(NewNote::titled("B").in_folder(&folder.id)).await?;
    repo.save().await?;

    let deletion = repo.delete_folder(&folder.id).await?;
    assert_eq!(deletion.detached_notes, 2);

    let fresh = reload(&store).await?;
    assert!(fresh.get_folder(&folder.id).await.is_none());
    for id in [&a.id, &b.id] {
        let note = fresh.get_note(id).await.expect("note kept");
        assert_eq!(note.folder_id, None);
        assert!(!note.synced);
    }
    Ok(())
}

// =========================================================================
// Queries
// =========================================================================

#[tokio::test]
async fn test_title_sort_is_stable_after_reload() -> Result<()> {
    let (store, repo, _temp_dir) = create_test_env().await?;
    let first = repo.create(NewNote::titled("Same")).await?;
    repo.create(NewNote::titled("alpha")).await?;
    let second = repo.create(NewNote::titled("same")).await?;
    repo.save().await?;

    let fresh = reload(&store).await?;
    let sorted = fresh
        .query(&NoteQuery::new().sorted_by(SortKey::Title))
        .await;
    let ids: Vec<&str> = sorted.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids[1..], [first.id.as_str(), second.id.as_str()]);
    Ok(())
}

#[tokio::test]
async fn test_query_filters_compose() -> Result<()> {
    let (_store, repo, _temp_dir) = create_test_env().await?;
    let folder = repo.create_folder(NewFolder::named("Work")).await?;
    repo.create(
        NewNote::titled("Budget review")
            .in_folder(&folder.id)
            .with_tags(["finance"])
            .favorite(),
    )
    .await?;
    repo.create(NewNote::titled("Budget draft").in_folder(&folder.id)).await?;
    repo.create(NewNote::titled("Budget at home").favorite()).await?;

    let hits = repo
        .query(
            &NoteQuery::new()
                .quick(QuickFilter::Favorites)
                .in_folder(&folder.id)
                .containing("BUDGET"),
        )
        .await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].title, "Budget review");

    let tagged = repo.query(&NoteQuery::new().tagged("finance")).await;
    assert_eq!(tagged.len(), 1);
    Ok(())
}

// =========================================================================
// Background Flushing
// =========================================================================

#[tokio::test]
async fn test_flusher_persists_created_notes() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let store = Arc::new(LibsqlStore::open(temp_dir.path().join("notes.db")).await?);
    let (waker, signal) = flush_channel();
    let repo = Arc::new(NoteRepository::new(store.clone()).with_flush_waker(waker));
    let flusher = FlushProcessor::start(repo.clone(), signal, FlushConfig::default());

    let note = repo.create(NewNote::titled("flushed")).await?;
    assert!(FlushProcessor::wait_idle(&repo, Duration::from_secs(5)).await);
    flusher.shutdown().await;

    assert!(store.get(Collection::Notes, &note.id).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn test_flusher_retries_after_failure() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let (waker, signal) = flush_channel();
    let repo = Arc::new(NoteRepository::new(store.clone()).with_flush_waker(waker));
    let flusher = FlushProcessor::start(repo.clone(), signal, FlushConfig { retry_delay_ms: 20 });

    store.set_fail_writes(true);
    let note = repo.create(NewNote::titled("eventually")).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(repo.pending_writes().await, 1);

    store.set_fail_writes(false);
    assert!(FlushProcessor::wait_idle(&repo, Duration::from_secs(2)).await);
    flusher.shutdown().await;

    assert!(store.get(Collection::Notes, &note.id).await?.is_some());
    Ok(())
}

// =========================================================================
// Import, Export and Settings
// =========================================================================

#[tokio::test]
async fn test_backup_and_import_into_fresh_database() -> Result<()> {
    let (_store, repo, _temp_dir) = create_test_env().await?;
    let folder = repo.create_folder(NewFolder::named("Trips")).await?;
    repo.create(NewNote::titled("Lisbon").in_folder(&folder.id)).await?;
    repo.create(NewNote::titled("Porto")).await?;

    let backup = repo.backup_json().await?;
    assert!(repo.settings().last_backup().await?.is_some());

    let (_other_store, other, _other_dir) = create_test_env().await?;
    let summary = other.import_json(&backup).await?;
    assert_eq!((summary.notes, summary.folders, summary.renamed), (2, 1, 0));

    let lisbon = other
        .query(&NoteQuery::new().containing("lisbon"))
        .await
        .pop()
        .expect("imported note");
    assert_eq!(lisbon.folder_id.as_deref(), Some(folder.id.as_str()));

    // Importing again collides on every id
    let again = other.import_json(&backup).await?;
    assert_eq!(again.renamed, 3);
    let summaries = other.folders_with_counts().await;
    assert_eq!(summaries.len(), 2);
    assert!(summaries.iter().all(|s| s.note_count == 1));
    Ok(())
}

#[tokio::test]
async fn test_export_formats() -> Result<()> {
    let (_store, repo, _temp_dir) = create_test_env().await?;
    repo.create(NewNote::titled("A <b>bold</b> title").with_content("<p>body</p>"))
        .await?;

    let html = repo.export(ExportFormat::Html).await?;
    assert!(html.contains("A &lt;b&gt;bold&lt;/b&gt; title"));
    let text = repo.export(ExportFormat::PlainText).await?;
    assert!(text.contains("body"));
    let markdown = repo.export(ExportFormat::Markdown).await?;
    assert!(markdown.starts_with("# A <b>bold</b> title"));
    Ok(())
}

#[tokio::test]
async fn test_settings_survive_reopen() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("notes.db");
    {
        let store = Arc::new(LibsqlStore::open(&db_path).await?);
        let repo = NoteRepository::new(store.clone());
        repo.settings().set_theme("dark").await?;
        store.close().await?;
    }

    let store = Arc::new(LibsqlStore::open(&db_path).await?);
    let repo = NoteRepository::new(store);
    assert_eq!(repo.settings().theme().await?.as_deref(), Some("dark"));
    Ok(())
}

#[tokio::test]
async fn test_stats() -> Result<()> {
    let (_store, repo, _temp_dir) = create_test_env().await?;
    repo.create(NewNote::titled("a").with_content("one two").favorite()).await?;
    repo.create(NewNote::titled("b").with_content("three").shared()).await?;

    let stats = repo.stats().await;
    assert_eq!(stats.notes, 2);
    assert_eq!(stats.favorites, 1);
    assert_eq!(stats.shared, 1);
    assert_eq!(stats.unsynced, 2);
    assert_eq!(stats.words, 3);
    Ok(())
}
