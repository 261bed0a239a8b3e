//! Note/Folder Repository
//!
//! The in-memory authoritative cache of every note and folder, and the only
//! component that writes entities to the persistent store.
//!
//! # Durability model
//!
//! - `create` and `create_folder` return immediately. The new entity goes into
//!   the dirty set and the [`FlushProcessor`](super::FlushProcessor) is woken
//!   to persist it.
//! - `update`, `delete` and the folder equivalents persist before returning,
//!   and surface store failures to the caller.
//! - `save` writes a full snapshot in one transaction and clears only the
//!   dirty-set generations it actually wrote, so changes made while a save is
//!   in flight stay dirty for the next one.
//!
//! # Mutual exclusion
//!
//! `load` and `save` each drop re-entrant calls (a second call while one is
//! running returns `Skipped`). Both also take the write gate, a mutex shared
//! with the durable phase of `update` and `delete`, so a load never
//! interleaves with a write and a delete's store removal always happens
//! after any save that captured the deleted entity.
//!
//! A delete leaves a tombstone from its in-memory phase until the store row
//! is gone. `load` skips tombstoned records, so a load that read the store
//! before the removal cannot bring the entity back. A tombstone whose store
//! removal failed is retried by the next save.

use crate::db::{Collection, EntityStore};
use crate::models::{Folder, FolderSummary, NewFolder, NewNote, Note};
use crate::services::error::RepositoryError;
use crate::services::export::{self, ExportFormat, ImportRecords};
use crate::services::flusher::FlushWaker;
use crate::services::query::{self, NoteQuery};
use crate::services::sync_queue::SyncObserver;
use crate::settings::Settings;
use crate::utils::{extract_links, word_count};
use crate::validation::{sanitize_folder, sanitize_note, validate_folder, validate_note, Strictness, ValidationError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Result of a `load` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded {
        notes: usize,
        folders: usize,
        /// Records rejected by the validator
        skipped: usize,
    },
    /// Another load was already running
    Skipped,
}

/// Result of a `save` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved { notes: usize, folders: usize },
    /// Another save was already running; the request was dropped
    Skipped,
}

/// Result of a folder deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FolderDeletion {
    /// Notes moved to unfiled
    pub detached_notes: usize,
    /// Child folders moved to the top level
    pub detached_folders: usize,
}

/// Counts reported by an import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub notes: usize,
    pub folders: usize,
    /// Imported entities that received a fresh id because theirs was taken
    pub renamed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepositoryStats {
    pub notes: usize,
    pub folders: usize,
    pub favorites: usize,
    pub shared: usize,
    pub unsynced: usize,
    pub words: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum EntityKey {
    Note(String),
    Folder(String),
}

impl EntityKey {
    fn location(&self) -> (Collection, &str) {
        match self {
            EntityKey::Note(id) => (Collection::Notes, id.as_str()),
            EntityKey::Folder(id) => (Collection::Folders, id.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
struct Cached<T> {
    /// Insertion sequence, used for stable ordering
    seq: u64,
    value: T,
}

#[derive(Debug, Default)]
struct RepositoryState {
    notes: HashMap<String, Cached<Note>>,
    folders: HashMap<String, Cached<Folder>>,
    next_seq: u64,
    /// Entities changed in memory but not yet saved, with the generation of
    /// their latest change
    dirty: HashMap<EntityKey, u64>,
    /// Deleted in memory, store row not yet confirmed gone
    tombstones: HashSet<EntityKey>,
    generation: u64,
    loaded: bool,
}

impl RepositoryState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn mark_dirty(&mut self, key: EntityKey) -> u64 {
        self.generation += 1;
        self.dirty.insert(key, self.generation);
        self.generation
    }

    /// Clear `key` unless it was changed again after `generation`
    fn clear_dirty(&mut self, key: &EntityKey, generation: u64) {
        if self.dirty.get(key) == Some(&generation) {
            self.dirty.remove(key);
        }
    }

    fn insert_note(&mut self, note: Note) -> u64 {
        let seq = self.next_seq();
        let key = EntityKey::Note(note.id.clone());
        self.notes.insert(note.id.clone(), Cached { seq, value: note });
        self.mark_dirty(key)
    }

    fn insert_folder(&mut self, folder: Folder) -> u64 {
        let seq = self.next_seq();
        let key = EntityKey::Folder(folder.id.clone());
        self.folders.insert(folder.id.clone(), Cached { seq, value: folder });
        self.mark_dirty(key)
    }

    fn ordered_notes(&self) -> Vec<&Note> {
        let mut entries: Vec<&Cached<Note>> = self.notes.values().collect();
        entries.sort_by_key(|c| c.seq);
        entries.into_iter().map(|c| &c.value).collect()
    }

    fn ordered_folders(&self) -> Vec<&Folder> {
        let mut entries: Vec<&Cached<Folder>> = self.folders.values().collect();
        entries.sort_by_key(|c| c.seq);
        entries.into_iter().map(|c| &c.value).collect()
    }

    fn folder_names(&self) -> HashMap<String, String> {
        self.folders
            .iter()
            .map(|(id, f)| (id.clone(), f.value.name.clone()))
            .collect()
    }

    /// Whether making `parent` the parent of `folder` would create a cycle
    fn creates_cycle(&self, folder: &str, parent: &str) -> bool {
        let mut current = Some(parent.to_string());
        let mut seen = HashSet::new();
        while let Some(id) = current {
            if id == folder || !seen.insert(id.clone()) {
                return true;
            }
            current = self
                .folders
                .get(&id)
                .and_then(|f| f.value.parent_id.clone());
        }
        false
    }
}

/// Recompute fields derived from content
fn refresh_derived(note: &mut Note) {
    note.metadata.word_count = word_count(&note.content);
    note.metadata.links = extract_links(&note.content);
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// The note and folder repository
pub struct NoteRepository {
    store: Arc<dyn EntityStore>,
    state: RwLock<RepositoryState>,
    load_guard: Mutex<()>,
    save_guard: Mutex<()>,
    write_gate: Mutex<()>,
    flush_waker: Option<FlushWaker>,
}

impl NoteRepository {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            state: RwLock::new(RepositoryState::default()),
            load_guard: Mutex::new(()),
            save_guard: Mutex::new(()),
            write_gate: Mutex::new(()),
            flush_waker: None,
        }
    }

    /// Attach the waker of a [`FlushProcessor`](super::FlushProcessor)
    pub fn with_flush_waker(mut self, waker: FlushWaker) -> Self {
        self.flush_waker = Some(waker);
        self
    }

    pub fn store(&self) -> Arc<dyn EntityStore> {
        Arc::clone(&self.store)
    }

    pub fn settings(&self) -> Settings {
        Settings::new(self.store())
    }

    fn wake_flusher(&self) {
        if let Some(waker) = &self.flush_waker {
            waker.wake();
        }
    }

    pub async fn is_loaded(&self) -> bool {
        self.state.read().await.loaded
    }

    /// Number of entities changed in memory but not yet saved
    pub async fn pending_writes(&self) -> usize {
        self.state.read().await.dirty.len()
    }

    /// Populate the cache from the store.
    ///
    /// Records that fail validation are skipped with a warning. Entities still
    /// in the dirty set keep their in-memory version.
    pub async fn load(&self) -> Result<LoadOutcome, RepositoryError> {
        let Ok(_loading) = self.load_guard.try_lock() else {
            tracing::debug!("Load already in progress, request dropped");
            return Ok(LoadOutcome::Skipped);
        };
        let _gate = self.write_gate.lock().await;

        let folder_records = self.store.get_all(Collection::Folders).await?;
        let note_records = self.store.get_all(Collection::Notes).await?;
        let total = folder_records.len() + note_records.len();

        // Parent references may point at any folder in the batch
        let raw_folder_ids: HashSet<String> = folder_records
            .iter()
            .filter_map(|r| r.get("id").and_then(Value::as_str).map(str::to_string))
            .collect();
        let mut folders: Vec<Folder> = folder_records
            .iter()
            .filter_map(|r| validate_folder(r, Strictness::Lenient, &raw_folder_ids).ok().flatten())
            .collect();

        let folder_ids: HashSet<String> = folders.iter().map(|f| f.id.clone()).collect();
        for folder in &mut folders {
            if folder
                .parent_id
                .as_ref()
                .is_some_and(|parent| !folder_ids.contains(parent))
            {
                tracing::warn!(id = %folder.id, "Parent folder was rejected, folder moved to top level");
                folder.parent_id = None;
            }
        }

        let notes: Vec<Note> = note_records
            .iter()
            .filter_map(|r| validate_note(r, Strictness::Lenient, &folder_ids).ok().flatten())
            .collect();

        let skipped = total - folders.len() - notes.len();
        let mut state = self.state.write().await;
        let state = &mut *state;

        let mut next_folders: HashMap<String, Cached<Folder>> = HashMap::new();
        let mut next_notes: HashMap<String, Cached<Note>> = HashMap::new();
        let mut seq = 0u64;

        for folder in folders {
            let key = EntityKey::Folder(folder.id.clone());
            if state.tombstones.contains(&key) {
                continue;
            }
            seq += 1;
            let value = match (state.dirty.contains_key(&key), state.folders.get(&folder.id)) {
                (true, Some(cached)) => cached.value.clone(),
                _ => folder,
            };
            next_folders.insert(value.id.clone(), Cached { seq, value });
        }
        for mut note in notes {
            let key = EntityKey::Note(note.id.clone());
            if state.tombstones.contains(&key) {
                continue;
            }
            seq += 1;
            if note
                .folder_id
                .as_ref()
                .is_some_and(|f| state.tombstones.contains(&EntityKey::Folder(f.clone())))
            {
                note.folder_id = None;
            }
            let value = match (state.dirty.contains_key(&key), state.notes.get(&note.id)) {
                (true, Some(cached)) => cached.value.clone(),
                _ => note,
            };
            next_notes.insert(value.id.clone(), Cached { seq, value });
        }

        // Unsaved entities that the store has never seen
        let mut unsaved_folders: Vec<&Cached<Folder>> = state
            .folders
            .values()
            .filter(|c| !next_folders.contains_key(&c.value.id))
            .filter(|c| state.dirty.contains_key(&EntityKey::Folder(c.value.id.clone())))
            .collect();
        unsaved_folders.sort_by_key(|c| c.seq);
        for cached in unsaved_folders {
            seq += 1;
            next_folders.insert(
                cached.value.id.clone(),
                Cached {
                    seq,
                    value: cached.value.clone(),
                },
            );
        }

        let mut unsaved_notes: Vec<&Cached<Note>> = state
            .notes
            .values()
            .filter(|c| !next_notes.contains_key(&c.value.id))
            .filter(|c| state.dirty.contains_key(&EntityKey::Note(c.value.id.clone())))
            .collect();
        unsaved_notes.sort_by_key(|c| c.seq);
        for cached in unsaved_notes {
            seq += 1;
            next_notes.insert(
                cached.value.id.clone(),
                Cached {
                    seq,
                    value: cached.value.clone(),
                },
            );
        }

        state.folders = next_folders;
        state.notes = next_notes;
        state.next_seq = seq;
        state.loaded = true;

        let outcome = LoadOutcome::Loaded {
            notes: state.notes.len(),
            folders: state.folders.len(),
            skipped,
        };
        tracing::info!(
            "Loaded {} notes and {} folders ({} invalid records skipped)",
            state.notes.len(),
            state.folders.len(),
            skipped
        );
        Ok(outcome)
    }

    /// Persist a full snapshot in one transaction.
    ///
    /// A save requested while another is running is dropped; the dirty set
    /// keeps anything that the running save did not capture.
    pub async fn save(&self) -> Result<SaveOutcome, RepositoryError> {
        let Ok(_saving) = self.save_guard.try_lock() else {
            tracing::debug!("Save already in progress, request dropped");
            return Ok(SaveOutcome::Skipped);
        };
        let _gate = self.write_gate.lock().await;
        self.persist_snapshot().await
    }

    /// Write the current snapshot. The caller must hold the write gate.
    async fn persist_snapshot(&self) -> Result<SaveOutcome, RepositoryError> {
        self.purge_tombstones().await?;

        let (notes, folders, written) = {
            let state = self.state.read().await;
            let notes = state
                .ordered_notes()
                .into_iter()
                .map(Note::to_record)
                .collect::<Result<Vec<_>, _>>()?;
            let folders = state
                .ordered_folders()
                .into_iter()
                .map(Folder::to_record)
                .collect::<Result<Vec<_>, _>>()?;
            (notes, folders, state.dirty.clone())
        };

        self.store.save_many(&notes, &folders).await?;

        let mut state = self.state.write().await;
        for (key, generation) in &written {
            state.clear_dirty(key, *generation);
        }
        Ok(SaveOutcome::Saved {
            notes: notes.len(),
            folders: folders.len(),
        })
    }

    /// Remove the store rows of deleted entities. The caller must hold the
    /// write gate.
    async fn purge_tombstones(&self) -> Result<(), RepositoryError> {
        let pending: Vec<EntityKey> = self.state.read().await.tombstones.iter().cloned().collect();
        for key in pending {
            let (collection, id) = key.location();
            self.store.delete(collection, id).await?;
            self.state.write().await.tombstones.remove(&key);
        }
        Ok(())
    }

    /// Create a note.
    ///
    /// Returns as soon as the note is in memory; persisting it is left to the
    /// flush processor.
    pub async fn create(&self, fields: NewNote) -> Result<Note, RepositoryError> {
        let now = Utc::now();
        let record = json!({
            "id": new_id(),
            "title": fields.title,
            "content": fields.content,
            "color": fields.color,
            "tags": fields.tags,
            "folderId": fields.folder_id,
            "favorite": fields.favorite,
            "shared": fields.shared,
            "createdAt": now,
            "modifiedAt": now,
            "synced": false,
            "metadata": { "attachments": fields.attachments, "version": 1 },
        });

        let note = {
            let mut state = self.state.write().await;
            let mut note = sanitize_note(&record, &state.folders, now)?;
            refresh_derived(&mut note);
            state.insert_note(note.clone());
            note
        };

        tracing::debug!(id = %note.id, "Created note");
        self.wake_flusher();
        Ok(note)
    }

    /// Replace a note with an edited version and persist it.
    ///
    /// The note is re-validated in full. `createdAt` is kept from the stored
    /// copy, `modifiedAt` moves forward, the version is bumped and the note is
    /// marked unsynchronized. On a store failure the error is returned and
    /// the change stays in the dirty set.
    pub async fn update(&self, note: Note) -> Result<Note, RepositoryError> {
        let record = note.to_record()?;
        let (updated, generation) = {
            let mut state = self.state.write().await;
            let previous = state
                .notes
                .get(&note.id)
                .map(|c| c.value.clone())
                .ok_or_else(|| RepositoryError::note_not_found(&note.id))?;

            let now = Utc::now();
            let mut updated = sanitize_note(&record, &state.folders, now)?;
            updated.created_at = previous.created_at;
            updated.modified_at = now.max(previous.modified_at);
            updated.metadata.version = previous.metadata.version.max(note.metadata.version) + 1;
            updated.synced = false;
            refresh_derived(&mut updated);

            if let Some(cached) = state.notes.get_mut(&updated.id) {
                cached.value = updated.clone();
            }
            let generation = state.mark_dirty(EntityKey::Note(updated.id.clone()));
            (updated, generation)
        };

        self.persist_entity(EntityKey::Note(updated.id.clone()), updated.to_record()?, generation)
            .await?;
        Ok(updated)
    }

    /// Durably write one entity that was just changed in memory
    async fn persist_entity(
        &self,
        key: EntityKey,
        record: Value,
        generation: u64,
    ) -> Result<(), RepositoryError> {
        let _gate = self.write_gate.lock().await;

        let (collection, id) = key.location();

        // Deleted while waiting for the gate; writing now would resurrect it
        let still_present = {
            let state = self.state.read().await;
            match collection {
                Collection::Notes => state.notes.contains_key(id),
                _ => state.folders.contains_key(id),
            }
        };
        if !still_present {
            return Err(match collection {
                Collection::Notes => RepositoryError::note_not_found(id),
                _ => RepositoryError::folder_not_found(id),
            });
        }

        if let Err(e) = self.store.put(collection, record).await {
            tracing::warn!("Failed to persist {} {}: {}", collection, id, e);
            self.wake_flusher();
            return Err(e.into());
        }

        self.state.write().await.clear_dirty(&key, generation);
        Ok(())
    }

    /// Delete a note.
    ///
    /// The note leaves memory first and stays gone even if the store
    /// operations fail; the error tells the caller that durability is
    /// unconfirmed.
    pub async fn delete(&self, id: &str) -> Result<(), RepositoryError> {
        {
            let mut state = self.state.write().await;
            state
                .notes
                .remove(id)
                .ok_or_else(|| RepositoryError::note_not_found(id))?;
            let key = EntityKey::Note(id.to_string());
            state.dirty.remove(&key);
            state.tombstones.insert(key);
        }

        let _gate = self.write_gate.lock().await;
        self.persist_snapshot().await?;
        tracing::debug!(id, "Deleted note");
        Ok(())
    }

    pub async fn toggle_favorite(&self, id: &str) -> Result<Note, RepositoryError> {
        let mut note = self
            .get_note(id)
            .await
            .ok_or_else(|| RepositoryError::note_not_found(id))?;
        note.favorite = !note.favorite;
        self.update(note).await
    }

    pub async fn toggle_shared(&self, id: &str) -> Result<Note, RepositoryError> {
        let mut note = self
            .get_note(id)
            .await
            .ok_or_else(|| RepositoryError::note_not_found(id))?;
        note.shared = !note.shared;
        self.update(note).await
    }

    /// Create a folder; persisted by the flush processor like `create`
    pub async fn create_folder(&self, fields: NewFolder) -> Result<Folder, RepositoryError> {
        let now = Utc::now();
        let record = json!({
            "id": new_id(),
            "name": fields.name,
            "parentId": fields.parent_id,
            "color": fields.color,
            "createdAt": now,
            "modifiedAt": now,
        });

        let folder = {
            let mut state = self.state.write().await;
            let folder = sanitize_folder(&record, &state.folders, now)?;
            state.insert_folder(folder.clone());
            folder
        };

        tracing::debug!(id = %folder.id, "Created folder");
        self.wake_flusher();
        Ok(folder)
    }

    /// Replace a folder and persist it; a parent that would create a cycle
    /// is dropped
    pub async fn update_folder(&self, folder: Folder) -> Result<Folder, RepositoryError> {
        let record = folder.to_record()?;
        let (updated, generation) = {
            let mut state = self.state.write().await;
            let previous = state
                .folders
                .get(&folder.id)
                .map(|c| c.value.clone())
                .ok_or_else(|| RepositoryError::folder_not_found(&folder.id))?;

            let now = Utc::now();
            let mut updated = sanitize_folder(&record, &state.folders, now)?;
            if let Some(parent) = updated.parent_id.clone() {
                if state.creates_cycle(&updated.id, &parent) {
                    tracing::warn!(id = %updated.id, "Parent '{}' would create a cycle, folder moved to top level", parent);
                    updated.parent_id = None;
                }
            }
            updated.created_at = previous.created_at;
            updated.modified_at = now.max(previous.modified_at);

            if let Some(cached) = state.folders.get_mut(&updated.id) {
                cached.value = updated.clone();
            }
            let generation = state.mark_dirty(EntityKey::Folder(updated.id.clone()));
            (updated, generation)
        };

        self.persist_entity(
            EntityKey::Folder(updated.id.clone()),
            updated.to_record()?,
            generation,
        )
        .await?;
        Ok(updated)
    }

    /// Delete a folder, detaching its notes and child folders.
    ///
    /// Member notes become unfiled (with a bumped version and the
    /// unsynchronized flag set) and are written in a single batch along with
    /// re-parented child folders.
    pub async fn delete_folder(&self, id: &str) -> Result<FolderDeletion, RepositoryError> {
        let (notes, folders, written) = {
            let mut state = self.state.write().await;
            state
                .folders
                .remove(id)
                .ok_or_else(|| RepositoryError::folder_not_found(id))?;
            let key = EntityKey::Folder(id.to_string());
            state.dirty.remove(&key);
            state.tombstones.insert(key);

            let now = Utc::now();
            let mut notes = Vec::new();
            let mut folders = Vec::new();
            let mut written = Vec::new();

            let member_ids: Vec<String> = state
                .notes
                .values()
                .filter(|c| c.value.folder_id.as_deref() == Some(id))
                .map(|c| c.value.id.clone())
                .collect();
            for note_id in member_ids {
                let Some(cached) = state.notes.get_mut(&note_id) else {
                    continue;
                };
                let note = &mut cached.value;
                note.folder_id = None;
                note.modified_at = now.max(note.modified_at);
                note.metadata.version += 1;
                note.synced = false;
                let record = note.to_record()?;
                notes.push(record);
                let key = EntityKey::Note(note_id);
                let generation = state.mark_dirty(key.clone());
                written.push((key, generation));
            }

            let child_ids: Vec<String> = state
                .folders
                .values()
                .filter(|c| c.value.parent_id.as_deref() == Some(id))
                .map(|c| c.value.id.clone())
                .collect();
            for folder_id in child_ids {
                let Some(cached) = state.folders.get_mut(&folder_id) else {
                    continue;
                };
                let folder = &mut cached.value;
                folder.parent_id = None;
                folder.modified_at = now.max(folder.modified_at);
                let record = folder.to_record()?;
                folders.push(record);
                let key = EntityKey::Folder(folder_id);
                let generation = state.mark_dirty(key.clone());
                written.push((key, generation));
            }

            (notes, folders, written)
        };

        let _gate = self.write_gate.lock().await;
        self.purge_tombstones().await?;
        self.store.save_many(&notes, &folders).await?;

        let mut state = self.state.write().await;
        for (key, generation) in &written {
            state.clear_dirty(key, *generation);
        }

        tracing::debug!(id, "Deleted folder, detached {} notes", notes.len());
        Ok(FolderDeletion {
            detached_notes: notes.len(),
            detached_folders: folders.len(),
        })
    }

    pub async fn get_note(&self, id: &str) -> Option<Note> {
        self.state.read().await.notes.get(id).map(|c| c.value.clone())
    }

    pub async fn get_folder(&self, id: &str) -> Option<Folder> {
        self.state.read().await.folders.get(id).map(|c| c.value.clone())
    }

    /// All notes in insertion order
    pub async fn notes(&self) -> Vec<Note> {
        self.state
            .read()
            .await
            .ordered_notes()
            .into_iter()
            .cloned()
            .collect()
    }

    /// All folders in insertion order
    pub async fn folders(&self) -> Vec<Folder> {
        self.state
            .read()
            .await
            .ordered_folders()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn notes_in_folder(&self, folder_id: &str) -> Vec<Note> {
        self.state
            .read()
            .await
            .ordered_notes()
            .into_iter()
            .filter(|n| n.folder_id.as_deref() == Some(folder_id))
            .cloned()
            .collect()
    }

    /// Folders with their derived note counts
    pub async fn folders_with_counts(&self) -> Vec<FolderSummary> {
        let state = self.state.read().await;
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for cached in state.notes.values() {
            if let Some(folder_id) = cached.value.folder_id.as_deref() {
                *counts.entry(folder_id).or_default() += 1;
            }
        }

        state
            .ordered_folders()
            .into_iter()
            .map(|folder| FolderSummary {
                note_count: counts.get(folder.id.as_str()).copied().unwrap_or(0),
                folder: folder.clone(),
            })
            .collect()
    }

    /// Evaluate a filter/sort query over the cached notes
    pub async fn query(&self, query: &NoteQuery) -> Vec<Note> {
        let state = self.state.read().await;
        query::evaluate(
            state.ordered_notes(),
            &state.folder_names(),
            query,
            Utc::now(),
        )
    }

    pub async fn stats(&self) -> RepositoryStats {
        let state = self.state.read().await;
        let mut stats = RepositoryStats {
            notes: state.notes.len(),
            folders: state.folders.len(),
            ..Default::default()
        };
        for note in state.notes.values().map(|c| &c.value) {
            stats.favorites += note.favorite as usize;
            stats.shared += note.shared as usize;
            stats.unsynced += (!note.synced) as usize;
            stats.words += note.metadata.word_count;
        }
        stats
    }

    /// Create many notes at once.
    ///
    /// Every record is validated strictly before any is inserted; one bad
    /// record rejects the whole batch with its position. Ids already in use
    /// are replaced with fresh ones. The batch is persisted before returning.
    pub async fn bulk_create(&self, records: Vec<Value>) -> Result<Vec<Note>, RepositoryError> {
        let imported = ImportRecords {
            notes: records,
            folders: Vec::new(),
        };
        let (notes, _, _) = self.import_records(imported).await?;
        Ok(notes)
    }

    /// Import a JSON export (see [`export::parse_json_export`])
    pub async fn import_json(&self, input: &str) -> Result<ImportSummary, RepositoryError> {
        let records = export::parse_json_export(input)?;
        let (notes, folders, renamed) = self.import_records(records).await?;
        let summary = ImportSummary {
            notes: notes.len(),
            folders: folders.len(),
            renamed,
        };
        tracing::info!(
            "Imported {} notes and {} folders ({} renamed)",
            summary.notes,
            summary.folders,
            summary.renamed
        );
        Ok(summary)
    }

    async fn import_records(
        &self,
        records: ImportRecords,
    ) -> Result<(Vec<Note>, Vec<Folder>, usize), RepositoryError> {
        let now = Utc::now();
        let (notes, folders, renamed) = {
            let mut state = self.state.write().await;
            let (notes, folders, renamed) = prepare_import(&state, &records, now)?;
            for folder in &folders {
                state.insert_folder(folder.clone());
            }
            for note in &notes {
                state.insert_note(note.clone());
            }
            (notes, folders, renamed)
        };

        if notes.is_empty() && folders.is_empty() {
            return Ok((notes, folders, renamed));
        }

        let _gate = self.write_gate.lock().await;
        if let Err(e) = self.persist_snapshot().await {
            self.wake_flusher();
            return Err(e);
        }
        Ok((notes, folders, renamed))
    }

    /// Render every entity in `format`
    pub async fn export(&self, format: ExportFormat) -> Result<String, RepositoryError> {
        let (notes, folders) = {
            let state = self.state.read().await;
            let notes: Vec<Note> = state.ordered_notes().into_iter().cloned().collect();
            let folders: Vec<Folder> = state.ordered_folders().into_iter().cloned().collect();
            (notes, folders)
        };
        Ok(export::export(format, &notes, &folders, Utc::now())?)
    }

    /// JSON export that also records the backup time in settings
    pub async fn backup_json(&self) -> Result<String, RepositoryError> {
        let json = self.export(ExportFormat::Json).await?;
        self.settings().record_backup(Utc::now()).await?;
        Ok(json)
    }
}

/// Validate an import batch against the current state without mutating it.
///
/// Folders are validated first so notes can reference them. Returns the
/// entities to insert and how many were given fresh ids.
fn prepare_import(
    state: &RepositoryState,
    records: &ImportRecords,
    now: DateTime<Utc>,
) -> Result<(Vec<Note>, Vec<Folder>, usize), ValidationError> {
    let mut taken: HashSet<String> = state.folders.keys().cloned().collect();
    let mut renamed = 0;

    // Original id -> id the folder is imported under
    let mut folder_ids: HashMap<String, String> = HashMap::new();
    for record in &records.folders {
        // Records without an id are rejected by the validator below
        let Some(original) = record.get("id").and_then(Value::as_str).map(str::to_string) else {
            continue;
        };
        let assigned = if taken.contains(&original) {
            renamed += 1;
            new_id()
        } else {
            original.clone()
        };
        taken.insert(assigned.clone());
        folder_ids.insert(original, assigned);
    }

    let mut lookup: HashSet<String> = state.folders.keys().cloned().collect();
    lookup.extend(folder_ids.values().cloned());

    let mut folders = Vec::with_capacity(records.folders.len());
    for (index, record) in records.folders.iter().enumerate() {
        let mut record = record.clone();
        remap(&mut record, "id", &folder_ids);
        remap(&mut record, "parentId", &folder_ids);
        let folder = sanitize_folder(&record, &lookup, now).map_err(|e| e.in_batch(index))?;
        folders.push(folder);
    }

    let mut taken: HashSet<String> = state.notes.keys().cloned().collect();
    let mut notes = Vec::with_capacity(records.notes.len());
    for (index, record) in records.notes.iter().enumerate() {
        let mut record = record.clone();
        remap(&mut record, "folderId", &folder_ids);
        let mut note = sanitize_note(&record, &lookup, now).map_err(|e| e.in_batch(index))?;
        if !taken.insert(note.id.clone()) {
            renamed += 1;
            note.id = new_id();
            taken.insert(note.id.clone());
        }
        note.synced = false;
        refresh_derived(&mut note);
        notes.push(note);
    }

    Ok((notes, folders, renamed))
}

fn remap(record: &mut Value, field: &str, ids: &HashMap<String, String>) {
    let Some(slot) = record.get_mut(field) else {
        return;
    };
    let replacement = slot.as_str().and_then(|id| ids.get(id)).cloned();
    if let Some(new_id) = replacement {
        *slot = Value::String(new_id);
    }
}

#[async_trait]
impl SyncObserver for NoteRepository {
    async fn note_synced(&self, note_id: &str, version: u64) {
        let mut state = self.state.write().await;
        match state.notes.get_mut(note_id) {
            Some(cached) if cached.value.metadata.version == version => {
                cached.value.synced = true;
            }
            Some(_) => {
                tracing::debug!(id = note_id, "Note changed during sync, stays unsynced");
            }
            None => {}
        }
    }
}
