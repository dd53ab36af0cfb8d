use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::core::DownloadError;

/// 源端交付的一份快照：字节流 + 期望 checksum + schema 版本
pub struct RemoteBlob {
    /// 整个 blob 的 sha256（hex）
    pub checksum: String,
    pub schema_version: u32,
    pub size_hint: Option<u64>,
    pub body: BoxStream<'static, Result<Vec<u8>, DownloadError>>,
}

/// 远端快照源（HTTP / 本地文件 / 测试 mock）
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    fn name(&self) -> &str;

    /// 打开一次下载。返回后才开始拉取 body。
    async fn open(&self) -> Result<RemoteBlob, DownloadError>;
}

/// 下载中的临时文件。
///
/// 持有者被 drop（失败、超时、任务被 abort）时自动删除文件；
/// 只有 [`TempFile::install`] 成功后才“解除武装”。
#[derive(Debug)]
pub struct TempFile {
    path: PathBuf,
    schema_version: u32,
    sha256: String,
    bytes: u64,
    armed: bool,
}

impl TempFile {
    fn new(path: PathBuf, schema_version: u32) -> Self {
        Self {
            path,
            schema_version,
            sha256: String::new(),
            bytes: 0,
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 源端声明的 schema 版本（校验阶段与文件 header 对照）
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub fn len(&self) -> u64 {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    /// 单次 rename 原子替换 final，然后 fsync 目录项。
    /// 并发 load 只会看到完整的旧文件或完整的新文件。
    pub fn install(mut self, final_path: &Path) -> std::io::Result<()> {
        std::fs::rename(&self.path, final_path)?;
        self.armed = false;
        if let Some(parent) = final_path.parent() {
            if let Ok(dir) = std::fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        tracing::info!("Snapshot installed: {:?} ({} bytes)", final_path, self.bytes);
        Ok(())
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Discarded temp download {:?}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to discard temp download {:?}: {}", self.path, e),
        }
    }
}

/// 快照下载器：流式写临时文件，边写边算 sha256，校验通过才返回。
///
/// 临时文件与 final 同目录（保证 rename 不跨文件系统），命名为
/// `.<final-name>.<pid>.<seq>.download`。
pub struct SnapshotDownloader {
    source: Arc<dyn SnapshotSource>,
    timeout: Duration,
    seq: AtomicU64,
}

impl SnapshotDownloader {
    pub fn new(source: Arc<dyn SnapshotSource>, timeout: Duration) -> Self {
        Self {
            source,
            timeout,
            seq: AtomicU64::new(0),
        }
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    /// 下载到 `target_path` 旁边的临时文件。任何失败都不会留下部分文件，
    /// 也不会触碰 `target_path` 本身。
    pub async fn fetch(&self, target_path: &Path) -> Result<TempFile, DownloadError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let tmp_path = temp_path_for(target_path, seq);

        match tokio::time::timeout(self.timeout, self.fetch_into(target_path, tmp_path)).await {
            Ok(res) => res,
            Err(_) => {
                tracing::warn!(
                    "Snapshot download from {} timed out after {:?}",
                    self.source.name(),
                    self.timeout
                );
                Err(DownloadError::timeout(self.timeout))
            }
        }
    }

    async fn fetch_into(
        &self,
        target_path: &Path,
        tmp_path: PathBuf,
    ) -> Result<TempFile, DownloadError> {
        if let Some(parent) = target_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let RemoteBlob {
            checksum,
            schema_version,
            size_hint,
            mut body,
        } = self.source.open().await?;
        tracing::info!(
            "Downloading snapshot from {} (schema v{}, {} bytes expected)",
            self.source.name(),
            schema_version,
            size_hint.map(|n| n.to_string()).unwrap_or_else(|| "?".into())
        );

        // guard 先于文件创建：之后任何 `?` / drop 都会清理
        let mut tmp = TempFile::new(tmp_path, schema_version);
        let mut file = tokio::fs::File::create(tmp.path()).await?;
        let mut hasher = Sha256::new();

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            tmp.bytes += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let actual = format!("{:x}", hasher.finalize());
        if !actual.eq_ignore_ascii_case(checksum.trim()) {
            tracing::warn!(
                "Snapshot checksum mismatch: expected {}, got {}",
                checksum,
                actual
            );
            return Err(DownloadError::ChecksumMismatch {
                expected: checksum,
                actual,
            });
        }
        if let Some(expected) = size_hint {
            if expected != tmp.bytes {
                tracing::debug!(
                    "Size hint {} differs from downloaded {} bytes (checksum ok)",
                    expected,
                    tmp.bytes
                );
            }
        }

        tmp.sha256 = actual;
        tracing::info!("Snapshot download verified: {} bytes", tmp.bytes);
        Ok(tmp)
    }
}

fn final_name(target_path: &Path) -> String {
    target_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string())
}

fn temp_path_for(target_path: &Path, seq: u64) -> PathBuf {
    target_path.with_file_name(format!(
        ".{}.{}.{}.download",
        final_name(target_path),
        std::process::id(),
        seq
    ))
}

/// 启动清扫：删除上次崩溃遗留的临时文件（best-effort）。返回删除数量。
pub fn sweep_orphans(target_path: &Path) -> usize {
    let Some(dir) = target_path.parent() else {
        return 0;
    };
    let prefix = format!(".{}.", final_name(target_path));
    let rd = match std::fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(_) => return 0,
    };

    let mut removed = 0;
    for ent in rd.flatten() {
        let name = ent.file_name();
        let name = name.to_string_lossy();
        let orphan = name.starts_with(&prefix)
            && (name.ends_with(".download") || name.ends_with(".write.tmp"));
        if !orphan {
            continue;
        }
        match std::fs::remove_file(ent.path()) {
            Ok(()) => {
                removed += 1;
                tracing::info!("Removed orphaned temp file {:?}", ent.path());
            }
            Err(e) => tracing::warn!("Failed to remove orphan {:?}: {}", ent.path(), e),
        }
    }
    removed
}

/// 整个文件的 sha256（hex），供发布侧生成 manifest
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    use std::io::Read;
    let mut f = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::snapshot::{encode, SCHEMA_BINCODE};
    use crate::testing::{record, MockSnapshotSource};

    fn temp_leftovers(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".download"))
            .collect()
    }

    #[tokio::test]
    async fn verified_download_lands_in_temp_not_final() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("catalog.snap");
        let blob = encode(&[record(1, "Red Hat", 10)], SCHEMA_BINCODE).unwrap();
        let source = Arc::new(MockSnapshotSource::new(blob.clone(), SCHEMA_BINCODE));

        let dl = SnapshotDownloader::new(source, Duration::from_secs(5));
        let tmp = dl.fetch(&target).await.unwrap();

        assert!(!target.exists());
        assert!(tmp.path().exists());
        assert_eq!(tmp.len(), blob.len() as u64);
        assert_eq!(std::fs::read(tmp.path()).unwrap(), blob);

        let tmp_path = tmp.path().to_path_buf();
        tmp.install(&target).unwrap();
        assert!(target.exists());
        assert!(!tmp_path.exists());
        assert_eq!(std::fs::read(&target).unwrap(), blob);
    }

    #[tokio::test]
    async fn checksum_mismatch_discards_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("catalog.snap");
        let blob = encode(&[record(1, "Red Hat", 10)], SCHEMA_BINCODE).unwrap();
        let source = Arc::new(
            MockSnapshotSource::new(blob, SCHEMA_BINCODE).with_declared_checksum("00ff"),
        );

        let dl = SnapshotDownloader::new(source, Duration::from_secs(5));
        let err = dl.fetch(&target).await.unwrap_err();
        assert!(matches!(err, DownloadError::ChecksumMismatch { .. }));
        assert!(temp_leftovers(dir.path()).is_empty());
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn mid_stream_network_failure_discards_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("catalog.snap");
        let blob = encode(&[record(1, "Red Hat", 10)], SCHEMA_BINCODE).unwrap();
        let source = Arc::new(MockSnapshotSource::new(blob, SCHEMA_BINCODE).fail_after_first_chunk());

        let dl = SnapshotDownloader::new(source, Duration::from_secs(5));
        let err = dl.fetch(&target).await.unwrap_err();
        assert!(matches!(err, DownloadError::Network(_)));
        assert!(temp_leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn stalled_stream_times_out_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("catalog.snap");
        let blob = encode(&[record(1, "Red Hat", 10)], SCHEMA_BINCODE).unwrap();
        let source = Arc::new(MockSnapshotSource::new(blob, SCHEMA_BINCODE).stall_after_first_chunk());

        let dl = SnapshotDownloader::new(source, Duration::from_millis(100));
        let err = dl.fetch(&target).await.unwrap_err();
        assert_eq!(err, DownloadError::Timeout(100));
        assert!(temp_leftovers(dir.path()).is_empty());
        assert!(!target.exists());
    }

    #[test]
    fn sweep_removes_only_our_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("catalog.snap");
        std::fs::write(&target, b"keep").unwrap();
        std::fs::write(dir.path().join(".catalog.snap.123.1.download"), b"x").unwrap();
        std::fs::write(dir.path().join(".catalog.snap.write.tmp"), b"x").unwrap();
        std::fs::write(dir.path().join("unrelated.download"), b"x").unwrap();

        assert_eq!(sweep_orphans(&target), 2);
        assert!(target.exists());
        assert!(dir.path().join("unrelated.download").exists());
    }

    #[test]
    fn sha256_file_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("abc");
        std::fs::write(&p, b"abc").unwrap();
        assert_eq!(
            sha256_file(&p).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
