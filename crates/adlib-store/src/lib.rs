#![warn(missing_docs)]

//! # adlib-store
//!
//! Durable, per-session record storage for the adlib metaservice.
//!
//! A [`SessionStore`] maps opaque session identifiers to isolated [`Tenant`]
//! namespaces (one directory per session). A tenant owns named collections of
//! JSON records, each served by a [`CollectionStore`] providing auto-increment
//! ids, CRUD, filtered search, and pagination.
//!
//! ## Durability model
//!
//! Every mutation serializes the full collection to a temporary file in the
//! same directory, fsyncs it, and atomically renames it over the previous
//! state. A crash mid-write never corrupts the durable copy; readers always
//! observe a complete pre- or post-state and never take a lock.
//!
//! ## Concurrency model
//!
//! Mutations on the same tenant × collection are serialized by a per-collection
//! mutex held across the load-modify-save cycle: no lost updates, no
//! interleaved partial writes. Different collections and different tenants
//! share nothing and proceed fully in parallel.
//!
//! There is no atomicity *across* collections: a caller making several store
//! calls gets each one atomically but not the group.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use thiserror::Error;

mod collection;

pub use collection::{normalize_identifier, CollectionStore, SchemaSnapshot};

/// Errors returned by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A record handed to `insert`/`replace`/`update` was not a JSON object.
    #[error("record must be a JSON object")]
    InvalidRecord,

    /// `insert` was given an id that already exists in the collection.
    #[error("record with identifier {id} already exists")]
    DuplicateId {
        /// The colliding identifier, rendered for the error message.
        id: String,
    },

    /// The session identifier contains characters outside `[A-Za-z0-9_-]`.
    #[error("session id contains invalid characters")]
    InvalidSession,

    /// The collection name contains characters outside `[A-Za-z0-9_-]`.
    #[error("collection name contains invalid characters")]
    InvalidCollection,

    /// A durable read, write, or rename failed.
    #[error("storage i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// Collection state could not be serialized.
    #[error("storage encoding failure: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Returns true when `name` is safe to use as a path component.
///
/// The store never builds paths from anything else, so traversal is
/// structurally impossible; this check exists to reject garbage early with a
/// typed error instead of creating odd directories.
fn is_safe_component(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

struct Inner {
    root: PathBuf,
    /// One write lock per (session, collection). Locks are created lazily and
    /// never dropped for the process lifetime, matching tenant retention.
    locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

/// Root handle over all tenant namespaces under a data directory.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Inner>,
}

impl SessionStore {
    /// Create a session store rooted at `root`. The directory is created on
    /// first tenant resolution, not here.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                root: root.into(),
                locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Resolve a session identifier to its tenant namespace, creating the
    /// backing directory on first sight. Idempotent; two distinct identifiers
    /// never alias.
    pub fn resolve(&self, session_id: &str) -> Result<Tenant, StoreError> {
        if !is_safe_component(session_id) {
            return Err(StoreError::InvalidSession);
        }
        let dir = self.inner.root.join(session_id);
        std::fs::create_dir_all(dir.join(".schemas"))?;
        Ok(Tenant {
            inner: Arc::clone(&self.inner),
            session_id: session_id.to_string(),
            dir,
        })
    }

    #[cfg(test)]
    fn collection_lock(&self, session_id: &str, name: &str) -> Arc<Mutex<()>> {
        lock_for(&self.inner, session_id, name)
    }
}

fn lock_for(inner: &Inner, session_id: &str, name: &str) -> Arc<Mutex<()>> {
    let mut locks = inner
        .locks
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    Arc::clone(
        locks
            .entry((session_id.to_string(), name.to_string()))
            .or_default(),
    )
}

/// One session's isolated namespace. Owns zero or more collections.
#[derive(Clone)]
pub struct Tenant {
    inner: Arc<Inner>,
    session_id: String,
    dir: PathBuf,
}

impl Tenant {
    /// The session identifier this tenant was resolved from.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Bind a collection by name, creating its durable backing lazily on
    /// first write. Reading a collection that was never written yields empty
    /// results, never an error.
    pub fn collection(&self, name: &str) -> Result<CollectionStore, StoreError> {
        if !is_safe_component(name) {
            return Err(StoreError::InvalidCollection);
        }
        Ok(CollectionStore::new(
            &self.dir,
            name,
            lock_for(&self.inner, &self.session_id, name),
        ))
    }

    /// All schema snapshots remembered for this tenant, sorted by collection
    /// name. Used to keep oracle-generated code consistent across calls.
    pub fn schemas(&self) -> Vec<(String, SchemaSnapshot)> {
        let schema_dir = self.dir.join(".schemas");
        let Ok(entries) = std::fs::read_dir(&schema_dir) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(name) = file_name.strip_suffix(".json") else {
                continue;
            };
            if name.ends_with(".meta") {
                continue;
            }
            let Ok(bytes) = std::fs::read(&path) else {
                continue;
            };
            if let Ok(snapshot) = serde_json::from_slice::<SchemaSnapshot>(&bytes) {
                out.push((name.to_string(), snapshot));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_rejects_traversal_shaped_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path());
        assert!(matches!(
            store.resolve("../escape"),
            Err(StoreError::InvalidSession)
        ));
        assert!(matches!(store.resolve(""), Err(StoreError::InvalidSession)));
        assert!(matches!(
            store.resolve("a/b"),
            Err(StoreError::InvalidSession)
        ));
    }

    #[test]
    fn resolve_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path());
        let a = store.resolve("session-1").unwrap();
        let b = store.resolve("session-1").unwrap();
        assert_eq!(a.session_id(), b.session_id());
    }

    #[test]
    fn collection_rejects_bad_names() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path());
        let tenant = store.resolve("s").unwrap();
        assert!(matches!(
            tenant.collection("../../etc"),
            Err(StoreError::InvalidCollection)
        ));
    }

    #[test]
    fn same_collection_shares_one_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path());
        let l1 = store.collection_lock("s", "members");
        let l2 = store.collection_lock("s", "members");
        assert!(Arc::ptr_eq(&l1, &l2));
        let other = store.collection_lock("s", "orders");
        assert!(!Arc::ptr_eq(&l1, &other));
        let other_tenant = store.collection_lock("t", "members");
        assert!(!Arc::ptr_eq(&l1, &other_tenant));
    }

    #[test]
    fn tenants_never_alias() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path());
        let a = store.resolve("alpha").unwrap();
        let b = store.resolve("beta").unwrap();
        a.collection("items")
            .unwrap()
            .insert(serde_json::json!({"name": "X"}).as_object().unwrap().clone())
            .unwrap();
        let (items, total) = b.collection("items").unwrap().list(None, 0, None);
        assert!(items.is_empty());
        assert_eq!(total, 0);
    }
}
