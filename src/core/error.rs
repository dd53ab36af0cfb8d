//! 组件边界上的错误类型。
//!
//! 这些错误都会进入 status 契约（跨线程读取、多次复制），因此全部 `Clone`，
//! io 错误在边界处落成字符串。

use serde::Serialize;
use thiserror::Error;

/// 快照加载失败（非致命：旧 generation 或 NotPresent 继续生效）
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum LoadError {
    #[error("snapshot corrupt: {0}")]
    Corrupt(String),

    #[error("unsupported snapshot schema version {found}")]
    SchemaMismatch { found: u32 },

    #[error("snapshot io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for LoadError {
    fn from(e: std::io::Error) -> Self {
        LoadError::Io(e.to_string())
    }
}

/// 下载失败：只通过 status 暴露，只在显式 start 时重试
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// 超时时长，毫秒
    #[error("download timed out after {0}ms")]
    Timeout(u64),

    #[error("disk full while writing snapshot")]
    DiskFull,

    #[error("download io error: {0}")]
    Io(String),
}

impl DownloadError {
    pub fn timeout(after: std::time::Duration) -> Self {
        DownloadError::Timeout(u64::try_from(after.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn from_io(e: &std::io::Error) -> Self {
        if e.raw_os_error() == Some(libc::ENOSPC) {
            DownloadError::DiskFull
        } else {
            DownloadError::Io(e.to_string())
        }
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(e: std::io::Error) -> Self {
        DownloadError::from_io(&e)
    }
}

/// overlay 刷新失败，只覆盖失败的那部分 id
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("sales refresh failed for {} ids: {reason}", failed.len())]
pub struct FetchError {
    pub failed: Vec<u64>,
    pub reason: String,
}

/// 查询面唯一的失败：从未有过可用快照
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq, Serialize)]
pub enum QueryError {
    #[error("catalog not ready")]
    NotReady,
}

/// 一次 sync（下载 → 校验 → 安装）失败的原因
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", content = "error", rename_all = "snake_case")]
pub enum SyncError {
    #[error(transparent)]
    Download(DownloadError),

    #[error(transparent)]
    Load(LoadError),

    #[error("sync cancelled")]
    Cancelled,
}

impl From<DownloadError> for SyncError {
    fn from(e: DownloadError) -> Self {
        SyncError::Download(e)
    }
}

impl From<LoadError> for SyncError {
    fn from(e: LoadError) -> Self {
        SyncError::Load(e)
    }
}
