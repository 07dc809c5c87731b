//! Persisted session store.
//!
//! Persists session records in `sessions.json` under the configured state
//! path so sessions can be resumed across broker restarts.  Each session id
//! maps to a [`PersistedSession`] tracking the adapter, the upstream agent
//! session id (for `--resume`), and the seeded cwd/model.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use bc_domain::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persisted session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single session tracked by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSession {
    pub session_id: String,
    pub adapter_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// The agent's own session id, captured from `session_init`.  Cleared
    /// when a resume attempt quick-exits so the next launch is fresh.
    #[serde(default)]
    pub upstream_session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Broker-owned session store backed by a JSON file.
pub struct SessionStore {
    sessions_path: PathBuf,
    sessions: RwLock<HashMap<String, PersistedSession>>,
}

impl SessionStore {
    /// Load or create the session store at `state_path/sessions/sessions.json`.
    pub fn new(state_path: &Path) -> Result<Self> {
        let dir = state_path.join("sessions");
        std::fs::create_dir_all(&dir).map_err(Error::Io)?;

        let sessions_path = dir.join("sessions.json");
        let sessions = if sessions_path.exists() {
            let raw = std::fs::read_to_string(&sessions_path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        tracing::info!(
            sessions = sessions.len(),
            path = %sessions_path.display(),
            "session store loaded"
        );

        Ok(Self {
            sessions_path,
            sessions: RwLock::new(sessions),
        })
    }

    pub fn get(&self, session_id: &str) -> Option<PersistedSession> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Record a newly created session.
    pub fn insert(
        &self,
        session_id: &str,
        adapter_name: &str,
        model: Option<String>,
        cwd: Option<String>,
    ) -> PersistedSession {
        let now = Utc::now();
        let entry = PersistedSession {
            session_id: session_id.to_owned(),
            adapter_name: adapter_name.to_owned(),
            created_at: now,
            updated_at: now,
            upstream_session_id: None,
            model,
            cwd,
        };
        self.sessions
            .write()
            .insert(session_id.to_owned(), entry.clone());
        entry
    }

    /// Store the upstream agent session id for later resume.
    pub fn set_upstream_id(&self, session_id: &str, upstream_id: String) {
        let mut sessions = self.sessions.write();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.upstream_session_id = Some(upstream_id);
            entry.updated_at = Utc::now();
        }
    }

    /// Forget the upstream session id (resume failed; next launch is fresh).
    pub fn clear_upstream_id(&self, session_id: &str) {
        let mut sessions = self.sessions.write();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.upstream_session_id = None;
            entry.updated_at = Utc::now();
        }
    }

    pub fn touch(&self, session_id: &str) {
        let mut sessions = self.sessions.write();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.updated_at = Utc::now();
        }
    }

    /// Remove a session record.  Returns true when it existed.
    pub fn remove(&self, session_id: &str) -> bool {
        self.sessions.write().remove(session_id).is_some()
    }

    pub fn list(&self) -> Vec<PersistedSession> {
        self.sessions.read().values().cloned().collect()
    }

    /// Persist the current state to disk.
    pub fn flush(&self) -> Result<()> {
        let sessions = self.sessions.read();
        let json = serde_json::to_string_pretty(&*sessions)
            .map_err(|e| Error::Other(format!("serializing sessions: {e}")))?;
        std::fs::write(&self.sessions_path, json).map_err(Error::Io)?;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (SessionStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        (store, dir)
    }

    #[test]
    fn insert_and_get() {
        let (store, _dir) = make_store();
        store.insert("s1", "claude", Some("sonnet".into()), Some("/tmp".into()));

        let entry = store.get("s1").unwrap();
        assert_eq!(entry.adapter_name, "claude");
        assert_eq!(entry.model.as_deref(), Some("sonnet"));
        assert!(entry.upstream_session_id.is_none());
    }

    #[test]
    fn upstream_id_lifecycle() {
        let (store, _dir) = make_store();
        store.insert("s1", "claude", None, None);

        store.set_upstream_id("s1", "up-1".into());
        assert_eq!(
            store.get("s1").unwrap().upstream_session_id.as_deref(),
            Some("up-1")
        );

        store.clear_upstream_id("s1");
        assert!(store.get("s1").unwrap().upstream_session_id.is_none());
    }

    #[test]
    fn flush_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SessionStore::new(dir.path()).unwrap();
            store.insert("s1", "opencode", None, None);
            store.set_upstream_id("s1", "oc-9".into());
            store.flush().unwrap();
        }
        let store = SessionStore::new(dir.path()).unwrap();
        let entry = store.get("s1").unwrap();
        assert_eq!(entry.adapter_name, "opencode");
        assert_eq!(entry.upstream_session_id.as_deref(), Some("oc-9"));
    }

    #[test]
    fn remove_session() {
        let (store, _dir) = make_store();
        store.insert("s1", "claude", None, None);
        assert!(store.remove("s1"));
        assert!(!store.remove("s1"));
        assert!(store.get("s1").is_none());
    }

    #[test]
    fn list_sessions() {
        let (store, _dir) = make_store();
        store.insert("a", "claude", None, None);
        store.insert("b", "codex", None, None);
        assert_eq!(store.list().len(), 2);
    }
}
