use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::core::{CatalogRecord, LoadError};
use crate::index::generation::Snapshot;
use crate::storage::snapshot;

/// 每次查询领取的 generation 句柄。持有期间该 generation 不会被释放；
/// 被替换后的旧 generation 在最后一个句柄 drop 时回收。
pub type SnapshotHandle = Arc<Snapshot>;

/// 记录存储：拥有当前活跃 generation 的原子句柄。
///
/// - `load` 只构建新 generation，不影响正在服务的那个
/// - `activate` 是一次原子指针替换，读者要么看到旧的、要么看到新的
pub struct RecordStore {
    active: ArcSwapOption<Snapshot>,
    next_generation: AtomicU64,
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore {
    pub fn new() -> Self {
        Self {
            active: ArcSwapOption::const_empty(),
            next_generation: AtomicU64::new(1),
        }
    }

    /// 读取并校验快照文件，构建（但不激活）一个新 generation。阻塞调用。
    pub fn load(&self, path: &Path) -> Result<Snapshot, LoadError> {
        let decoded = match snapshot::decode_file(path) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("Snapshot load failed for {:?}: {}", path, e);
                return Err(e);
            }
        };
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        Snapshot::build(generation, decoded, path)
    }

    /// 原子切换到新 generation，返回被替换的旧句柄（调用方 drop 即可）
    pub fn activate(&self, snap: Snapshot) -> Option<SnapshotHandle> {
        let generation = snap.generation();
        let records = snap.count();
        let prev = self.active.swap(Some(Arc::new(snap)));
        tracing::info!(
            "Activated generation {} ({} records), superseded {:?}",
            generation,
            records,
            prev.as_ref().map(|p| p.generation())
        );
        prev
    }

    /// 领取当前 generation 的句柄；从未加载过则为 None
    pub fn handle(&self) -> Option<SnapshotHandle> {
        self.active.load_full()
    }

    pub fn is_ready(&self) -> bool {
        self.active.load().is_some()
    }

    pub fn generation(&self) -> Option<u64> {
        self.active.load().as_deref().map(|s| s.generation())
    }

    pub fn get(&self, asset_id: u64) -> Option<CatalogRecord> {
        self.handle()?.get(asset_id).cloned()
    }

    pub fn search(&self, query: &str, limit: usize) -> Vec<CatalogRecord> {
        match self.handle() {
            Some(h) => h.search(query, limit).into_iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn count(&self) -> u64 {
        self.active.load().as_deref().map_or(0, |s| s.count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::snapshot::{SnapshotWriter, SCHEMA_BINCODE};
    use crate::testing::record;

    #[test]
    fn load_does_not_activate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.snap");
        SnapshotWriter::new(path.clone())
            .write_atomic(&[record(1, "Red Hat", 10)], SCHEMA_BINCODE)
            .unwrap();

        let store = RecordStore::new();
        let snap = store.load(&path).unwrap();
        assert!(!store.is_ready());
        assert_eq!(store.count(), 0);
        assert!(store.get(1).is_none());

        store.activate(snap);
        assert!(store.is_ready());
        assert_eq!(store.count(), 1);
        assert_eq!(store.get(1).unwrap().name, "Red Hat");
    }

    #[test]
    fn generations_increase_and_old_handle_stays_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.snap");
        let writer = SnapshotWriter::new(path.clone());
        let store = RecordStore::new();

        writer.write_atomic(&[record(1, "Red Hat", 10)], SCHEMA_BINCODE).unwrap();
        store.activate(store.load(&path).unwrap());
        let old = store.handle().unwrap();

        writer
            .write_atomic(&[record(1, "Red Hat", 10), record(2, "Red Cap", 50)], SCHEMA_BINCODE)
            .unwrap();
        let prev = store.activate(store.load(&path).unwrap()).unwrap();

        assert!(store.generation().unwrap() > old.generation());
        assert_eq!(prev.generation(), old.generation());
        // 旧句柄仍可读，内容不变
        assert_eq!(old.count(), 1);
        assert_eq!(store.count(), 2);
        drop(prev);
        assert_eq!(Arc::strong_count(&old), 1);
    }

    #[test]
    fn failed_load_keeps_previous_generation_serving() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("catalog.snap");
        SnapshotWriter::new(good.clone())
            .write_atomic(&[record(1, "Red Hat", 10)], SCHEMA_BINCODE)
            .unwrap();
        let store = RecordStore::new();
        store.activate(store.load(&good).unwrap());

        let bad = dir.path().join("bad.snap");
        std::fs::write(&bad, b"garbage").unwrap();
        assert!(matches!(store.load(&bad), Err(LoadError::Corrupt(_))));
        assert!(matches!(
            store.load(&dir.path().join("missing.snap")),
            Err(LoadError::Io(_))
        ));
        assert_eq!(store.get(1).unwrap().asset_id, 1);
    }

    #[test]
    fn search_without_generation_is_empty() {
        let store = RecordStore::new();
        assert!(store.search("hat", 10).is_empty());
        assert!(store.handle().is_none());
    }
}
