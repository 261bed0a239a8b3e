//! Integration tests for SearchEngine
//!
//! Tests cover:
//! - Term exclusion and quoted phrases over repository notes
//! - Structural filters combined with text terms
//! - History bounds, ordering and de-duplication
//! - Persistence of filters and history across engine instances
//! - Cleanup of externally written history on restore

use anyhow::Result;
use notekeep_core::db::LibsqlStore;
use notekeep_core::models::{NewFolder, NewNote};
use notekeep_core::services::{NoteRepository, SearchEngine, SearchFilters, HISTORY_LIMIT};
use notekeep_core::settings::SEARCH_HISTORY;
use std::sync::Arc;
use tempfile::TempDir;

/// Test helper: Create a loaded repository over a fresh database
async fn create_test_env() -> Result<(Arc<NoteRepository>, TempDir)> {
    let temp_dir = TempDir::new()?;
    let store = Arc::new(LibsqlStore::open(temp_dir.path().join("search.db")).await?);
    let repository = Arc::new(NoteRepository::new(store));
    repository.load().await?;
    Ok((repository, temp_dir))
}

#[tokio::test]
async fn test_exclusion_term() -> Result<()> {
    let (repo, _temp_dir) = create_test_env().await?;
    repo.create(NewNote::titled("project draft")).await?;
    let plan = repo.create(NewNote::titled("project plan")).await?;

    let mut engine = SearchEngine::new(repo.clone());
    let results = engine.search("project -draft").await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, plan.id);
    Ok(())
}

#[tokio::test]
async fn test_quoted_phrase() -> Result<()> {
    let (repo, _temp_dir) = create_test_env().await?;
    let exact = repo
        .create(NewNote::titled("Q3").with_content("<p>Read the <i>release notes</i> first</p>"))
        .await?;
    repo.create(NewNote::titled("Q4").with_content("<p>notes for release</p>"))
        .await?;

    let mut engine = SearchEngine::new(repo.clone());
    let results = engine.search("\"release notes\"").await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, exact.id);
    Ok(())
}

#[tokio::test]
async fn test_filters_intersect_with_terms() -> Result<()> {
    let (repo, _temp_dir) = create_test_env().await?;
    let work = repo.create_folder(NewFolder::named("Work")).await?;
    let in_work = repo
        .create(NewNote::titled("meeting notes").in_folder(&work.id))
        .await?;
    repo.create(NewNote::titled("meeting at home")).await?;
    repo.create(NewNote::titled("unrelated").in_folder(&work.id)).await?;

    let mut engine = SearchEngine::new(repo.clone());
    engine
        .set_filters(SearchFilters {
            folders: vec![work.id.clone()],
            ..Default::default()
        })
        .await;

    let results = engine.search("meeting").await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, in_work.id);
    Ok(())
}

#[tokio::test]
async fn test_history_is_bounded_and_deduplicated() -> Result<()> {
    let (repo, _temp_dir) = create_test_env().await?;
    let mut engine = SearchEngine::new(repo.clone());

    for i in 0..12 {
        engine.search(&format!("query {i}")).await;
    }
    engine.search("query 5").await;
    engine.search("   ").await;

    let history = engine.history();
    assert_eq!(history.len(), HISTORY_LIMIT);
    assert_eq!(history[0], "query 5");
    assert_eq!(history[1], "query 11");
    assert_eq!(history.iter().filter(|q| *q == "query 5").count(), 1);
    assert!(!history.contains(&"query 0".to_string()));
    Ok(())
}

#[tokio::test]
async fn test_filters_and_history_restored() -> Result<()> {
    let (repo, _temp_dir) = create_test_env().await?;
    {
        let mut engine = SearchEngine::new(repo.clone());
        let mut filters = SearchFilters::default();
        filters.fields.content = false;
        filters.tags = vec!["work".to_string()];
        engine.set_filters(filters).await;
        engine.search("first").await;
        engine.search("second").await;
    }

    let restored = SearchEngine::restore(repo.clone()).await;
    assert!(!restored.filters().fields.content);
    assert_eq!(restored.filters().tags, vec!["work"]);
    assert_eq!(restored.history(), vec!["second", "first"]);

    let mut engine = restored;
    engine.clear_history().await;
    let restored = SearchEngine::restore(repo).await;
    assert!(restored.history().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_restored_history_is_deduplicated() -> Result<()> {
    let (repo, _temp_dir) = create_test_env().await?;
    let mut written: Vec<String> = ["alpha", " alpha ", "", "beta", "alpha"]
        .into_iter()
        .map(String::from)
        .collect();
    written.extend((0..12).map(|i| format!("q{i}")));
    repo.settings().set(SEARCH_HISTORY, &written).await?;

    let restored = SearchEngine::restore(repo).await;
    let history = restored.history();
    assert_eq!(history.len(), HISTORY_LIMIT);
    assert_eq!(history[..3], ["alpha", "beta", "q0"]);
    Ok(())
}
