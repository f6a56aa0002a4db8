//! Persisted-state records over an external key/value store.
//!
//! The store itself (browser localStorage, a settings file, an in-memory
//! map in tests) belongs to the surrounding application; the core only
//! reads and writes two records through the [`KeyValueStore`] trait: the
//! last authenticated user (with token) and the last-known project list.
//! Records are JSON with ISO-8601 date fields and are revalidated on load —
//! corrupted entries are dropped rather than crashing startup.
//!
//! Persistence happens through explicit save calls at the end of mutating
//! operations; there is no watch-and-autosave machinery.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store key for the last authenticated user record.
pub const USER_KEY: &str = "atelier.user";
/// Store key for the last-known project list.
pub const PROJECTS_KEY: &str = "atelier.projects";

/// Errors from serializing records for the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to serialize record: {0}")]
    Serialize(String),
}

/// The opaque key/value collaborator.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// In-memory store for tests and headless use.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.entries.lock().unwrap().insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }
}

/// Last authenticated user, kept so a restart can reconnect without a fresh
/// login round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredUser {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub token: String,
    pub authenticated_at: DateTime<Utc>,
}

/// One entry of the last-known project list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredProject {
    pub id: String,
    pub name: String,
    pub updated_at: DateTime<Utc>,
}

/// Load the persisted user, dropping (and removing) a corrupted record.
pub fn load_user(store: &dyn KeyValueStore) -> Option<StoredUser> {
    let raw = store.get(USER_KEY)?;
    match serde_json::from_str(&raw) {
        Ok(user) => Some(user),
        Err(e) => {
            log::warn!("corrupted persisted user record dropped: {e}");
            store.remove(USER_KEY);
            None
        }
    }
}

pub fn save_user(store: &dyn KeyValueStore, user: &StoredUser) -> Result<(), StoreError> {
    let raw = serde_json::to_string(user).map_err(|e| StoreError::Serialize(e.to_string()))?;
    store.set(USER_KEY, &raw);
    Ok(())
}

/// Forget the persisted user (logout, auth rejection).
pub fn clear_user(store: &dyn KeyValueStore) {
    store.remove(USER_KEY);
}

/// Load the persisted project list.
///
/// Individually corrupted entries are dropped and the valid remainder kept;
/// a wholly unreadable record yields an empty list.
pub fn load_projects(store: &dyn KeyValueStore) -> Vec<StoredProject> {
    let Some(raw) = store.get(PROJECTS_KEY) else {
        return Vec::new();
    };

    let entries: Vec<serde_json::Value> = match serde_json::from_str(&raw) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("corrupted persisted project list dropped: {e}");
            store.remove(PROJECTS_KEY);
            return Vec::new();
        }
    };

    let total = entries.len();
    let projects: Vec<StoredProject> = entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value(entry) {
            Ok(project) => Some(project),
            Err(e) => {
                log::warn!("corrupted project entry dropped: {e}");
                None
            }
        })
        .collect();

    if projects.len() < total {
        log::info!("kept {}/{total} persisted projects", projects.len());
    }
    projects
}

pub fn save_projects(
    store: &dyn KeyValueStore,
    projects: &[StoredProject],
) -> Result<(), StoreError> {
    let raw = serde_json::to_string(projects).map_err(|e| StoreError::Serialize(e.to_string()))?;
    store.set(PROJECTS_KEY, &raw);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> StoredUser {
        StoredUser {
            id: "u1".into(),
            username: "alice".into(),
            avatar: None,
            token: "tok-123".into(),
            authenticated_at: "2026-08-01T10:00:00Z".parse().unwrap(),
        }
    }

    fn project(id: &str) -> StoredProject {
        StoredProject {
            id: id.into(),
            name: format!("project {id}"),
            updated_at: "2026-08-01T10:00:00Z".parse().unwrap(),
        }
    }

    #[test]
    fn test_user_roundtrip() {
        let store = MemoryStore::new();
        save_user(&store, &user()).unwrap();

        let loaded = load_user(&store).unwrap();
        assert_eq!(loaded, user());
    }

    #[test]
    fn test_user_dates_are_iso8601() {
        let store = MemoryStore::new();
        save_user(&store, &user()).unwrap();

        let raw = store.get(USER_KEY).unwrap();
        assert!(raw.contains("2026-08-01T10:00:00Z"), "raw: {raw}");
    }

    #[test]
    fn test_missing_user_is_none() {
        let store = MemoryStore::new();
        assert!(load_user(&store).is_none());
    }

    #[test]
    fn test_corrupted_user_dropped_and_removed() {
        let store = MemoryStore::new();
        store.set(USER_KEY, "{not valid json");

        assert!(load_user(&store).is_none());
        // The bad record is gone, so the next load is a clean miss.
        assert!(store.get(USER_KEY).is_none());
    }

    #[test]
    fn test_clear_user() {
        let store = MemoryStore::new();
        save_user(&store, &user()).unwrap();
        clear_user(&store);
        assert!(load_user(&store).is_none());
    }

    #[test]
    fn test_projects_roundtrip() {
        let store = MemoryStore::new();
        let projects = vec![project("p1"), project("p2")];
        save_projects(&store, &projects).unwrap();

        assert_eq!(load_projects(&store), projects);
    }

    #[test]
    fn test_corrupted_project_entry_dropped_rest_kept() {
        let store = MemoryStore::new();
        store.set(
            PROJECTS_KEY,
            r#"[
                {"id":"p1","name":"one","updatedAt":"2026-08-01T10:00:00Z"},
                {"id":"p2","name":"two"},
                {"id":"p3","name":"three","updatedAt":"2026-08-02T10:00:00Z"}
            ]"#,
        );

        let projects = load_projects(&store);
        assert_eq!(projects.len(), 2);
        assert_eq!(projects[0].id, "p1");
        assert_eq!(projects[1].id, "p3");
    }

    #[test]
    fn test_unreadable_project_list_yields_empty() {
        let store = MemoryStore::new();
        store.set(PROJECTS_KEY, "42");

        assert!(load_projects(&store).is_empty());
        assert!(store.get(PROJECTS_KEY).is_none());
    }

    #[test]
    fn test_missing_project_list_yields_empty() {
        let store = MemoryStore::new();
        assert!(load_projects(&store).is_empty());
    }
}
