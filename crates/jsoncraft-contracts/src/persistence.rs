use std::path::{Path, PathBuf};

use anyhow::bail;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub const DB_VERSION: u64 = 1;
pub const SESSIONS_KEY: &str = "jsoncraft/sessions/v1";
pub const TEMPLATES_KEY: &str = "jsoncraft/templates/v1";
pub const VISUALS_KEY: &str = "jsoncraft/visuals/v1";

/// File-backed key-value store holding the three JSONCraft collections
/// inside one pretty-printed JSON object. Reads and writes are always
/// whole-collection; `set` re-reads the file and merges before writing,
/// so concurrent writers race per key, last writer wins.
#[derive(Debug, Clone)]
pub struct KvStore {
    path: PathBuf,
}

impl KvStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        read_json_object(&self.path)?.remove(key)
    }

    pub fn set(&self, key: &str, value: Value) -> anyhow::Result<()> {
        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        on_disk.insert(key.to_string(), value);
        write_json_object(&self.path, &on_disk)
    }

    /// Full-dataset snapshot: every collection, plus version and export
    /// timestamp. Absent collections export as their empty shape.
    pub fn export_all(&self) -> Value {
        let mut payload = Map::new();
        payload.insert("version".to_string(), Value::Number(DB_VERSION.into()));
        payload.insert("exported_at".to_string(), Value::String(now_utc_iso()));
        payload.insert(
            "sessions".to_string(),
            self.get(SESSIONS_KEY).unwrap_or(Value::Object(Map::new())),
        );
        payload.insert(
            "templates".to_string(),
            self.get(TEMPLATES_KEY).unwrap_or(Value::Array(Vec::new())),
        );
        payload.insert(
            "visuals".to_string(),
            self.get(VISUALS_KEY).unwrap_or(Value::Array(Vec::new())),
        );
        Value::Object(payload)
    }

    /// Wholesale import: every collection present in the payload replaces
    /// the stored collection; absent collections are left untouched.
    pub fn import_all(&self, payload: &Value) -> anyhow::Result<()> {
        let Some(obj) = payload.as_object() else {
            bail!("import payload must be a JSON object");
        };
        if let Some(sessions) = obj.get("sessions") {
            self.set(SESSIONS_KEY, sessions.clone())?;
        }
        if let Some(templates) = obj.get("templates") {
            self.set(TEMPLATES_KEY, templates.clone())?;
        }
        if let Some(visuals) = obj.get("visuals") {
            self.set(VISUALS_KEY, visuals.clone())?;
        }
        Ok(())
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{KvStore, SESSIONS_KEY, TEMPLATES_KEY, VISUALS_KEY};

    #[test]
    fn set_then_get_roundtrips() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = KvStore::new(temp.path().join("jsoncraft.json"));
        store.set(TEMPLATES_KEY, json!([{"id": "cinema"}]))?;
        assert_eq!(store.get(TEMPLATES_KEY), Some(json!([{"id": "cinema"}])));
        assert_eq!(store.get(SESSIONS_KEY), None);
        Ok(())
    }

    #[test]
    fn set_merges_with_other_keys_on_disk() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("jsoncraft.json");
        let store_a = KvStore::new(&path);
        let store_b = KvStore::new(&path);

        store_a.set(TEMPLATES_KEY, json!([1]))?;
        store_b.set(VISUALS_KEY, json!([2]))?;

        let reloaded = KvStore::new(path);
        assert_eq!(reloaded.get(TEMPLATES_KEY), Some(json!([1])));
        assert_eq!(reloaded.get(VISUALS_KEY), Some(json!([2])));
        Ok(())
    }

    #[test]
    fn export_import_roundtrips_collections() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = KvStore::new(temp.path().join("a.json"));
        source.set(SESSIONS_KEY, json!({"s1": {"meta": {"id": "s1"}}}))?;
        source.set(TEMPLATES_KEY, json!([{"id": "cinema"}]))?;
        source.set(VISUALS_KEY, json!([{"id": "v1"}]))?;

        let snapshot = source.export_all();
        assert_eq!(snapshot["version"], json!(1));
        assert!(snapshot
            .get("exported_at")
            .and_then(Value::as_str)
            .is_some());

        let target = KvStore::new(temp.path().join("b.json"));
        target.set(VISUALS_KEY, json!([{"id": "stale"}]))?;
        target.import_all(&snapshot)?;

        assert_eq!(target.get(SESSIONS_KEY), source.get(SESSIONS_KEY));
        assert_eq!(target.get(TEMPLATES_KEY), source.get(TEMPLATES_KEY));
        assert_eq!(target.get(VISUALS_KEY), Some(json!([{"id": "v1"}])));
        Ok(())
    }

    #[test]
    fn import_leaves_absent_collections_untouched() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = KvStore::new(temp.path().join("jsoncraft.json"));
        store.set(TEMPLATES_KEY, json!([{"id": "keep"}]))?;

        store.import_all(&json!({"visuals": [{"id": "v1"}]}))?;
        assert_eq!(store.get(TEMPLATES_KEY), Some(json!([{"id": "keep"}])));
        assert_eq!(store.get(VISUALS_KEY), Some(json!([{"id": "v1"}])));
        Ok(())
    }

    #[test]
    fn import_rejects_non_object_payloads() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = KvStore::new(temp.path().join("jsoncraft.json"));
        assert!(store.import_all(&json!([1, 2])).is_err());
        Ok(())
    }
}
