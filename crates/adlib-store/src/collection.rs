//! File-backed JSON collection with auto-increment ids, CRUD, search, and
//! pagination.
//!
//! Layout per tenant directory:
//!
//! ```text
//! <tenant>/<collection>.json              record array
//! <tenant>/.schemas/<collection>.json     schema snapshot
//! <tenant>/.schemas/<collection>.meta.json  auto-increment counter
//! ```

use std::cmp::Ordering;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::StoreError;

/// A record is a JSON object; `id` is always present after insert.
pub type Record = Map<String, Value>;

/// Remembered shape of a collection: field names, one example record, and the
/// time of the last write. Updated on every insert/replace, never on reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    /// Sorted field names observed in the last written record.
    pub fields: Vec<String>,
    /// The last written record, as an example of the shape.
    pub example: Value,
    /// RFC 3339 timestamp of the last write.
    pub updated_at: String,
}

/// Normalize an identifier: integers stay integers; strings of ASCII digits
/// with no leading zero (or exactly `"0"`) become integers; everything else
/// passes through. Path segments always arrive as strings, so `/members/1`
/// must agree with an integer-keyed record.
pub fn normalize_identifier(value: &Value) -> Value {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            let is_digits = !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit());
            if is_digits && (!trimmed.starts_with('0') || trimmed == "0") {
                if let Ok(n) = trimmed.parse::<i64>() {
                    return Value::from(n);
                }
            }
            Value::String(trimmed.to_string())
        }
        other => other.clone(),
    }
}

fn ids_equal(a: &Value, b: &Value) -> bool {
    normalize_identifier(a) == normalize_identifier(b)
}

/// Durable record storage scoped to one tenant × collection.
pub struct CollectionStore {
    name: String,
    data_file: PathBuf,
    schema_file: PathBuf,
    meta_file: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Meta {
    #[serde(default)]
    auto_id: i64,
}

impl CollectionStore {
    pub(crate) fn new(tenant_dir: &Path, name: &str, write_lock: Arc<Mutex<()>>) -> Self {
        Self {
            name: name.to_string(),
            data_file: tenant_dir.join(format!("{name}.json")),
            schema_file: tenant_dir.join(".schemas").join(format!("{name}.json")),
            meta_file: tenant_dir.join(".schemas").join(format!("{name}.meta.json")),
            write_lock,
        }
    }

    /// The collection name this store is bound to.
    pub fn name(&self) -> &str {
        &self.name
    }

    // --- durable state ---

    /// Read the current record array. An absent file is an empty collection;
    /// an unreadable or corrupt file is treated as empty with a warning (the
    /// atomic rename path makes corruption a disk-level event, not a normal
    /// outcome).
    fn load(&self) -> Vec<Record> {
        let bytes = match std::fs::read(&self.data_file) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::warn!(collection = %self.name, error = %e, "collection read failed");
                return Vec::new();
            }
        };
        match serde_json::from_slice::<Vec<Record>>(&bytes) {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(collection = %self.name, error = %e, "collection state corrupt");
                Vec::new()
            }
        }
    }

    /// Write-then-rename: serialize to a sibling temp file, fsync, then
    /// atomically replace the prior state.
    fn save(&self, items: &[Record]) -> Result<(), StoreError> {
        atomic_write(&self.data_file, &serde_json::to_vec_pretty(items)?)
    }

    fn load_meta(&self) -> Meta {
        std::fs::read(&self.meta_file)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    fn save_meta(&self, meta: &Meta) {
        // Counter persistence is best-effort: next_id also scans existing
        // integer ids, so a lost counter can only skip values, never reuse.
        if let Ok(bytes) = serde_json::to_vec(meta) {
            if let Err(e) = atomic_write(&self.meta_file, &bytes) {
                tracing::warn!(collection = %self.name, error = %e, "counter write failed");
            }
        }
    }

    fn remember_schema(&self, record: &Record) {
        let mut fields: Vec<String> = record.keys().cloned().collect();
        fields.sort();
        let snapshot = SchemaSnapshot {
            fields,
            example: Value::Object(record.clone()),
            updated_at: chrono::Utc::now().to_rfc3339(),
        };
        // Never blocks or fails the primary write.
        if let Ok(bytes) = serde_json::to_vec_pretty(&snapshot) {
            if let Err(e) = atomic_write(&self.schema_file, &bytes) {
                tracing::warn!(collection = %self.name, error = %e, "schema write failed");
            }
        }
    }

    /// The learned schema snapshot, if any write has happened.
    pub fn schema(&self) -> Option<SchemaSnapshot> {
        let bytes = std::fs::read(&self.schema_file).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(&self, items: &[Record]) -> i64 {
        let mut meta = self.load_meta();
        let max_existing = items
            .iter()
            .filter_map(|r| r.get("id").and_then(Value::as_i64))
            .max()
            .unwrap_or(0);
        let next = meta.auto_id.max(max_existing + 1).max(1);
        meta.auto_id = next + 1;
        self.save_meta(&meta);
        next
    }

    fn find_index(items: &[Record], identifier: &Value) -> Option<usize> {
        let target = normalize_identifier(identifier);
        items
            .iter()
            .position(|r| r.get("id").is_some_and(|id| ids_equal(id, &target)))
    }

    // --- operations ---

    /// Insert a record, assigning the next integer id when the caller did not
    /// supply one. A caller-supplied integer id at or above the counter
    /// advances the counter past it so future assignments cannot collide.
    pub fn insert(&self, record: Record) -> Result<Record, StoreError> {
        let _guard = self.guard();
        let mut items = self.load();
        let mut record = record;

        match record.get("id").filter(|v| !v.is_null()).cloned() {
            Some(supplied) => {
                let id = normalize_identifier(&supplied);
                if Self::find_index(&items, &id).is_some() {
                    return Err(StoreError::DuplicateId { id: id.to_string() });
                }
                if let Some(n) = id.as_i64() {
                    let mut meta = self.load_meta();
                    if n >= meta.auto_id {
                        meta.auto_id = n + 1;
                        self.save_meta(&meta);
                    }
                }
                record.insert("id".to_string(), id);
            }
            None => {
                let id = self.next_id(&items);
                record.insert("id".to_string(), Value::from(id));
            }
        }

        items.push(record.clone());
        self.save(&items)?;
        self.remember_schema(&record);
        Ok(record)
    }

    /// Fetch a record by id. Absence is a normal outcome, never an error.
    pub fn get(&self, identifier: &Value) -> Option<Record> {
        let items = self.load();
        Self::find_index(&items, identifier).map(|i| items[i].clone())
    }

    /// Replace all fields of a record except `id`, which is preserved.
    /// Returns `None` when the id is absent.
    pub fn replace(&self, identifier: &Value, record: Record) -> Result<Option<Record>, StoreError> {
        let _guard = self.guard();
        let mut items = self.load();
        let Some(index) = Self::find_index(&items, identifier) else {
            return Ok(None);
        };
        let id = items[index].get("id").cloned().unwrap_or(Value::Null);
        let mut record = record;
        record.insert("id".to_string(), id);
        items[index] = record.clone();
        self.save(&items)?;
        self.remember_schema(&record);
        Ok(Some(record))
    }

    /// Shallow-merge `delta` into the record, preserving unspecified fields.
    /// The `id` field cannot be changed through the delta.
    pub fn update(&self, identifier: &Value, delta: Record) -> Result<Option<Record>, StoreError> {
        let _guard = self.guard();
        let mut items = self.load();
        let Some(index) = Self::find_index(&items, identifier) else {
            return Ok(None);
        };
        let mut merged = items[index].clone();
        for (key, value) in delta {
            if key == "id" {
                continue;
            }
            merged.insert(key, value);
        }
        items[index] = merged.clone();
        self.save(&items)?;
        self.remember_schema(&merged);
        Ok(Some(merged))
    }

    /// Remove a record by id. Returns whether anything was removed. Ids are
    /// never reassigned after deletion.
    pub fn delete(&self, identifier: &Value) -> Result<bool, StoreError> {
        let _guard = self.guard();
        let mut items = self.load();
        let Some(index) = Self::find_index(&items, identifier) else {
            return Ok(false);
        };
        items.remove(index);
        self.save(&items)?;
        Ok(true)
    }

    /// Page through the collection. `total` is the full size before paging,
    /// so the returned item count is always `min(limit, max(0, total - offset))`.
    ///
    /// `sort` names a field; prefix with `-` for descending. Records missing
    /// the field (or holding a value that does not order against the others)
    /// sort last in either direction.
    pub fn list(
        &self,
        limit: Option<usize>,
        offset: usize,
        sort: Option<&str>,
    ) -> (Vec<Record>, usize) {
        let mut items = self.load();
        let total = items.len();

        if let Some(sort) = sort.filter(|s| !s.is_empty()) {
            let (field, descending) = match sort.strip_prefix('-') {
                Some(rest) => (rest, true),
                None => (sort, false),
            };
            items.sort_by(|a, b| {
                match (a.get(field), b.get(field)) {
                    (None, None) => Ordering::Equal,
                    (None, Some(_)) => Ordering::Greater, // missing sorts last
                    (Some(_), None) => Ordering::Less,
                    (Some(x), Some(y)) => {
                        let ord = compare_values(x, y);
                        if descending {
                            ord.reverse()
                        } else {
                            ord
                        }
                    }
                }
            });
        }

        let page: Vec<Record> = items
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        (page, total)
    }

    /// Filter records by criteria. Keys may carry an operator suffix
    /// (`field__contains`, `field__icontains`, `field__startswith`,
    /// `field__endswith`); without one the match is exact equality. All terms
    /// are ANDed; missing fields never match; `None` values and the
    /// pagination keys (`limit`, `offset`, `sort`) are ignored. List-valued
    /// criteria use their last element, matching multi-valued query params.
    pub fn search(&self, criteria: &Map<String, Value>) -> Vec<Record> {
        let mut results = self.load();

        for (key, raw_value) in criteria {
            if raw_value.is_null() {
                continue;
            }
            if matches!(key.as_str(), "limit" | "offset" | "sort") {
                continue;
            }
            let value = match raw_value {
                Value::Array(values) => match values.last() {
                    Some(last) if !last.is_null() => last.clone(),
                    _ => continue,
                },
                other => other.clone(),
            };

            if let Some(field) = key.strip_suffix("__contains") {
                let needle = coerce_str(&value);
                results.retain(|r| field_str(r, field).contains(&needle));
            } else if let Some(field) = key.strip_suffix("__icontains") {
                let needle = coerce_str(&value).to_lowercase();
                results.retain(|r| field_str(r, field).to_lowercase().contains(&needle));
            } else if let Some(field) = key.strip_suffix("__startswith") {
                let needle = coerce_str(&value);
                results.retain(|r| field_str(r, field).starts_with(&needle));
            } else if let Some(field) = key.strip_suffix("__endswith") {
                let needle = coerce_str(&value);
                results.retain(|r| field_str(r, field).ends_with(&needle));
            } else {
                results.retain(|r| r.get(key) == Some(&value));
            }
        }

        results
    }
}

/// Total order over JSON values for sorting: type rank first (null < bool <
/// number < string < array < object), then within-type comparison.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// String coercion used by the suffix operators, mirroring the loose matching
/// the query-string origin of criteria implies.
fn coerce_str(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn field_str(record: &Record, field: &str) -> String {
    record.get(field).map(coerce_str).unwrap_or_default()
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionStore;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().unwrap().clone()
    }

    fn fresh(name: &str) -> (tempfile::TempDir, CollectionStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path());
        let collection = store.resolve("test-session").unwrap().collection(name).unwrap();
        (tmp, collection)
    }

    #[test]
    fn insert_get_round_trip() {
        let (_tmp, c) = fresh("members");
        let inserted = c.insert(record(json!({"name": "Alice"}))).unwrap();
        assert_eq!(inserted["id"], json!(1));
        let fetched = c.get(&json!(1)).unwrap();
        assert_eq!(fetched, inserted);
    }

    #[test]
    fn ids_increase_and_never_recycle() {
        let (_tmp, c) = fresh("members");
        let a = c.insert(record(json!({"n": 1}))).unwrap();
        let b = c.insert(record(json!({"n": 2}))).unwrap();
        assert_eq!(a["id"], json!(1));
        assert_eq!(b["id"], json!(2));
        assert!(c.delete(&json!(2)).unwrap());
        let d = c.insert(record(json!({"n": 3}))).unwrap();
        assert_eq!(d["id"], json!(3), "deleted ids must not be reused");
    }

    #[test]
    fn caller_supplied_integer_id_advances_counter() {
        let (_tmp, c) = fresh("members");
        let a = c.insert(record(json!({"id": 10, "n": 1}))).unwrap();
        assert_eq!(a["id"], json!(10));
        let b = c.insert(record(json!({"n": 2}))).unwrap();
        assert_eq!(b["id"], json!(11));
    }

    #[test]
    fn caller_supplied_string_id_is_kept() {
        let (_tmp, c) = fresh("members");
        let a = c.insert(record(json!({"id": "abc-1", "n": 1}))).unwrap();
        assert_eq!(a["id"], json!("abc-1"));
        assert!(c.get(&json!("abc-1")).is_some());
    }

    #[test]
    fn digit_string_ids_normalize_to_integers() {
        let (_tmp, c) = fresh("members");
        let a = c.insert(record(json!({"id": "7", "n": 1}))).unwrap();
        assert_eq!(a["id"], json!(7));
        assert!(c.get(&json!(7)).is_some());
        assert!(c.get(&json!("7")).is_some());
        // but a zero-padded string is not a number
        assert_eq!(normalize_identifier(&json!("007")), json!("007"));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let (_tmp, c) = fresh("members");
        c.insert(record(json!({"id": 1, "n": 1}))).unwrap();
        let err = c.insert(record(json!({"id": "1", "n": 2}))).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId { .. }));
    }

    #[test]
    fn replace_preserves_id_and_drops_other_fields() {
        let (_tmp, c) = fresh("members");
        c.insert(record(json!({"name": "Alice", "role": "admin"})))
            .unwrap();
        let replaced = c
            .replace(&json!(1), record(json!({"name": "Bob", "id": 999})))
            .unwrap()
            .unwrap();
        assert_eq!(replaced["id"], json!(1));
        assert_eq!(replaced["name"], json!("Bob"));
        assert!(replaced.get("role").is_none());
        assert!(c.replace(&json!(42), record(json!({}))).unwrap().is_none());
    }

    #[test]
    fn update_merges_shallowly() {
        let (_tmp, c) = fresh("members");
        c.insert(record(json!({"name": "Alice", "role": "admin"})))
            .unwrap();
        let updated = c
            .update(&json!(1), record(json!({"role": "user", "id": 999})))
            .unwrap()
            .unwrap();
        assert_eq!(updated["id"], json!(1));
        assert_eq!(updated["name"], json!("Alice"));
        assert_eq!(updated["role"], json!("user"));
        assert!(c.update(&json!(42), record(json!({}))).unwrap().is_none());
    }

    #[test]
    fn delete_reports_absence() {
        let (_tmp, c) = fresh("members");
        c.insert(record(json!({"n": 1}))).unwrap();
        assert!(c.delete(&json!(1)).unwrap());
        assert!(!c.delete(&json!(1)).unwrap());
        assert!(c.get(&json!(1)).is_none());
    }

    #[test]
    fn list_page_matches_the_invariant() {
        let (_tmp, c) = fresh("members");
        for name in ["A", "B", "C", "D", "E"] {
            c.insert(record(json!({"name": name}))).unwrap();
        }
        let (items, total) = c.list(Some(2), 2, Some("id"));
        assert_eq!(total, 5);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["name"], json!("C"));
        assert_eq!(items[1]["name"], json!("D"));

        // offset past the end
        let (items, total) = c.list(Some(10), 99, None);
        assert_eq!(total, 5);
        assert!(items.is_empty());

        // total never depends on the page
        let (items, total) = c.list(None, 0, None);
        assert_eq!(items.len(), total);
    }

    #[test]
    fn list_sorts_descending_with_missing_last() {
        let (_tmp, c) = fresh("members");
        c.insert(record(json!({"name": "A", "rank": 1}))).unwrap();
        c.insert(record(json!({"name": "B"}))).unwrap();
        c.insert(record(json!({"name": "C", "rank": 3}))).unwrap();
        let (items, _) = c.list(None, 0, Some("-rank"));
        assert_eq!(items[0]["name"], json!("C"));
        assert_eq!(items[1]["name"], json!("A"));
        assert_eq!(items[2]["name"], json!("B"), "missing field sorts last");
    }

    #[test]
    fn search_exact_and_operators() {
        let (_tmp, c) = fresh("members");
        c.insert(record(json!({"name": "Alice"}))).unwrap();
        c.insert(record(json!({"name": "Hartmann"}))).unwrap();
        c.insert(record(json!({"name": "Martha"}))).unwrap();

        let exact = c.search(json!({"name": "Alice"}).as_object().unwrap());
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0]["name"], json!("Alice"));

        let contains = c.search(json!({"name__contains": "art"}).as_object().unwrap());
        let names: Vec<_> = contains.iter().map(|r| r["name"].clone()).collect();
        assert_eq!(names, vec![json!("Hartmann"), json!("Martha")]);

        let icontains = c.search(json!({"name__icontains": "HART"}).as_object().unwrap());
        assert_eq!(icontains.len(), 1);

        let starts = c.search(json!({"name__startswith": "Hart"}).as_object().unwrap());
        assert_eq!(starts.len(), 1);

        let ends = c.search(json!({"name__endswith": "tha"}).as_object().unwrap());
        assert_eq!(ends.len(), 1);
    }

    #[test]
    fn search_terms_are_anded_and_missing_fields_never_match() {
        let (_tmp, c) = fresh("members");
        c.insert(record(json!({"name": "Alice", "role": "admin"})))
            .unwrap();
        c.insert(record(json!({"name": "Alice"}))).unwrap();
        let both = c.search(
            json!({"name": "Alice", "role": "admin"})
                .as_object()
                .unwrap(),
        );
        assert_eq!(both.len(), 1);
        let missing = c.search(json!({"ghost": "x"}).as_object().unwrap());
        assert!(missing.is_empty());
    }

    #[test]
    fn search_uses_last_element_of_list_values_and_skips_paging_keys() {
        let (_tmp, c) = fresh("members");
        c.insert(record(json!({"name": "Alice"}))).unwrap();
        c.insert(record(json!({"name": "Bob"}))).unwrap();
        let hits = c.search(
            json!({"name": ["Bob", "Alice"], "limit": "2", "sort": "id"})
                .as_object()
                .unwrap(),
        );
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["name"], json!("Alice"));
    }

    #[test]
    fn schema_snapshot_tracks_writes_only() {
        let (_tmp, c) = fresh("members");
        assert!(c.schema().is_none());
        c.search(json!({"phantom": "x"}).as_object().unwrap());
        assert!(c.schema().is_none(), "reads must not create schemas");

        c.insert(record(json!({"name": "Alice", "age": 30}))).unwrap();
        let snapshot = c.schema().unwrap();
        assert_eq!(snapshot.fields, vec!["age", "id", "name"]);
        assert_eq!(snapshot.example["name"], json!("Alice"));

        c.replace(&json!(1), record(json!({"nick": "Al"}))).unwrap();
        let snapshot = c.schema().unwrap();
        assert_eq!(snapshot.fields, vec!["id", "nick"]);
    }

    #[test]
    fn state_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = SessionStore::new(tmp.path());
            let c = store.resolve("s").unwrap().collection("members").unwrap();
            c.insert(record(json!({"name": "Alice"}))).unwrap();
        }
        let store = SessionStore::new(tmp.path());
        let c = store.resolve("s").unwrap().collection("members").unwrap();
        assert_eq!(c.get(&json!(1)).unwrap()["name"], json!("Alice"));
        // counter survives too
        let next = c.insert(record(json!({"name": "Bob"}))).unwrap();
        assert_eq!(next["id"], json!(2));
    }

    #[test]
    fn no_stray_temp_file_after_mutation() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path());
        let c = store.resolve("s").unwrap().collection("members").unwrap();
        c.insert(record(json!({"name": "Alice"}))).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path().join("s"))
            .unwrap()
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn concurrent_inserts_never_share_an_id() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path());
        let tenant = store.resolve("s").unwrap();

        let mut handles = Vec::new();
        for t in 0..4 {
            let tenant = tenant.clone();
            handles.push(std::thread::spawn(move || {
                let c = tenant.collection("members").unwrap();
                let mut ids = Vec::new();
                for i in 0..25 {
                    let rec = c
                        .insert(
                            serde_json::json!({"thread": t, "i": i})
                                .as_object()
                                .unwrap()
                                .clone(),
                        )
                        .unwrap();
                    ids.push(rec["id"].as_i64().unwrap());
                }
                ids
            }));
        }

        let mut all: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        let before = all.len();
        all.dedup();
        assert_eq!(before, all.len(), "duplicate ids across threads");
        assert_eq!(all.len(), 100);

        let (_, total) = tenant.collection("members").unwrap().list(None, 0, None);
        assert_eq!(total, 100, "no lost updates");
    }
}
