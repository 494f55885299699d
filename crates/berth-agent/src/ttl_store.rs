use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use serde_json::Value;
use tokio::io::AsyncWriteExt;

pub const STORE_FILE: &str = "ttl-store.json";

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct TtlEntry {
    value: Value,
    /// Unix epoch milliseconds.
    expires_at: u64,
}

/// Durable key/value map where every entry expires `ttl` after it was last set.
///
/// The whole map is rewritten on each mutation; it only ever holds the task ids this
/// process created, so it stays small.
#[derive(Debug)]
pub struct TtlStore {
    path: PathBuf,
    ttl: Duration,
    entries: BTreeMap<String, TtlEntry>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl TtlStore {
    /// Loads `<dir>/ttl-store.json`, dropping expired entries. A missing file is an empty
    /// store; an unreadable or corrupt one is logged and also treated as empty.
    pub async fn open(dir: impl AsRef<Path>, ttl: Duration) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("create store dir {}", dir.display()))?;
        let path = dir.join(STORE_FILE);

        let mut entries = match tokio::fs::read(&path).await {
            Ok(raw) => match serde_json::from_slice::<BTreeMap<String, TtlEntry>>(&raw) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "task store is corrupt; starting empty");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "task store is unreadable; starting empty");
                BTreeMap::new()
            }
        };

        let now = now_ms();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        tracing::debug!(
            path = %path.display(),
            live = entries.len(),
            expired = before - entries.len(),
            "task store opened"
        );

        Ok(Self { path, ttl, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn set(&mut self, key: impl Into<String>, value: Value) -> anyhow::Result<()> {
        let ttl_ms = u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX);
        let entry = TtlEntry {
            value,
            expires_at: now_ms().saturating_add(ttl_ms),
        };
        let key = key.into();
        let previous = self.entries.insert(key.clone(), entry);
        if let Err(e) = self.persist().await {
            // Memory never holds what disk does not.
            match previous {
                Some(p) => self.entries.insert(key, p),
                None => self.entries.remove(&key),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Expired keys read as a miss and are purged on the way out.
    pub async fn get(&mut self, key: &str) -> Option<Value> {
        let entry = self.entries.get(key)?;
        if entry.expires_at > now_ms() {
            return Some(entry.value.clone());
        }
        self.entries.remove(key);
        if let Err(e) = self.persist().await {
            tracing::warn!(key, error = %format!("{e:#}"), "failed to persist expiry purge");
        }
        None
    }

    pub async fn contains(&mut self, key: &str) -> bool {
        self.get(key).await.is_some()
    }

    /// Returns whether the key was present.
    pub async fn del(&mut self, key: &str) -> anyhow::Result<bool> {
        let existed = self.entries.remove(key).is_some();
        if existed {
            self.persist().await?;
        }
        Ok(existed)
    }

    /// Live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = now_ms();
        self.entries.values().filter(|e| e.expires_at > now).count()
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(&self.entries).context("serialize ttl-store.json")?;
        let mut f = tokio::fs::File::create(&tmp)
            .await
            .context("create ttl-store.json.tmp")?;
        f.write_all(&data)
            .await
            .context("write ttl-store.json.tmp")?;
        f.flush().await.ok();
        tokio::fs::rename(&tmp, &self.path)
            .await
            .context("persist ttl-store.json")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::test_support::temp_dir_for;

    use super::*;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[tokio::test]
    async fn get_returns_value_before_expiry_and_misses_after() {
        let dir = temp_dir_for("ttl_expiry");
        let mut store = TtlStore::open(&dir, Duration::from_millis(40)).await.unwrap();

        store.set("t1", json!({ "agents": ["blog"] })).await.unwrap();
        assert_eq!(store.get("t1").await, Some(json!({ "agents": ["blog"] })));
        assert_eq!(store.len(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.len(), 0);
        assert_eq!(store.get("t1").await, None);

        let reopened = TtlStore::open(&dir, DAY).await.unwrap();
        assert_eq!(reopened.len(), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        let dir = temp_dir_for("ttl_reopen");
        {
            let mut store = TtlStore::open(&dir, DAY).await.unwrap();
            store.set("t1", json!({ "n": 1 })).await.unwrap();
            store.set("t2", json!("x")).await.unwrap();
        }

        let mut store = TtlStore::open(&dir, DAY).await.unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("t2").await, Some(json!("x")));
        assert!(!dir.join("ttl-store.json.tmp").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn expired_entries_are_dropped_on_open() {
        let dir = temp_dir_for("ttl_stale_file");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(STORE_FILE),
            r#"{"old":{"value":1,"expiresAt":1},"new":{"value":2,"expiresAt":18446744073709551615}}"#,
        )
        .unwrap();

        let mut store = TtlStore::open(&dir, DAY).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("old").await, None);
        assert_eq!(store.get("new").await, Some(json!(2)));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn corrupt_file_opens_empty_and_is_overwritten() {
        let dir = temp_dir_for("ttl_corrupt");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(STORE_FILE), b"{not json").unwrap();

        let mut store = TtlStore::open(&dir, DAY).await.unwrap();
        assert_eq!(store.len(), 0);

        store.set("t1", json!(true)).await.unwrap();
        let raw = std::fs::read_to_string(dir.join(STORE_FILE)).unwrap();
        let v: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["t1"]["value"], true);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn del_persists() {
        let dir = temp_dir_for("ttl_del");
        let mut store = TtlStore::open(&dir, DAY).await.unwrap();
        store.set("a", json!(1)).await.unwrap();
        store.set("b", json!(2)).await.unwrap();

        assert!(store.del("a").await.unwrap());
        assert!(!store.del("a").await.unwrap());

        let mut reopened = TtlStore::open(&dir, DAY).await.unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get("a").await, None);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn failed_write_leaves_memory_unchanged() {
        let dir = temp_dir_for("ttl_unwritable");
        let mut store = TtlStore::open(&dir, DAY).await.unwrap();
        store.set("kept", json!(1)).await.unwrap();
        std::fs::remove_file(dir.join(STORE_FILE)).unwrap();
        std::fs::create_dir_all(dir.join(STORE_FILE).join("blocker")).unwrap();

        assert!(store.set("new", json!(2)).await.is_err());
        assert!(store.set("kept", json!(3)).await.is_err());
        assert_eq!(store.get("new").await, None);
        assert_eq!(store.get("kept").await, Some(json!(1)));
        assert_eq!(store.len(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
