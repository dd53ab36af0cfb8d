//! 快照生命周期：NotPresent → Downloading → Validating → Ready | Failed。
//!
//! 同一时刻最多一个 sync 任务；状态通过 `ArcSwap<Status>` 发布，读取永不阻塞。
//! 每次 start 分配一个 attempt 号，只有当前 attempt 的任务能写状态，
//! 被取消或被替代的任务的迟到写入直接丢弃。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::core::{DownloadError, LoadError, SyncError};
use crate::index::{RecordStore, Snapshot};
use crate::storage::download::{sweep_orphans, SnapshotDownloader, TempFile};
use crate::storage::snapshot;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum LifecycleState {
    NotPresent,
    Downloading,
    Validating,
    Ready,
    Failed(SyncError),
}

impl LifecycleState {
    /// 有 sync 任务在跑
    pub fn is_busy(&self) -> bool {
        matches!(self, LifecycleState::Downloading | LifecycleState::Validating)
    }

    pub fn label(&self) -> &'static str {
        match self {
            LifecycleState::NotPresent => "not_present",
            LifecycleState::Downloading => "downloading",
            LifecycleState::Validating => "validating",
            LifecycleState::Ready => "ready",
            LifecycleState::Failed(_) => "failed",
        }
    }
}

/// 对外的状态契约
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub state: LifecycleState,
    pub path: PathBuf,
    pub last_error: Option<SyncError>,
    /// 有可服务的 generation
    pub exists: bool,
    pub downloading: bool,
    pub generation: Option<u64>,
    pub attempt: u64,
}

#[derive(Default)]
struct RunState {
    attempt: u64,
    task: Option<JoinHandle<()>>,
}

pub struct LifecycleController {
    store: Arc<RecordStore>,
    downloader: SnapshotDownloader,
    final_path: PathBuf,
    status: ArcSwap<Status>,
    run: Mutex<RunState>,
}

impl LifecycleController {
    pub fn new(store: Arc<RecordStore>, downloader: SnapshotDownloader, final_path: PathBuf) -> Self {
        let status = Status {
            state: LifecycleState::NotPresent,
            path: final_path.clone(),
            last_error: None,
            exists: store.is_ready(),
            downloading: false,
            generation: store.generation(),
            attempt: 0,
        };
        Self {
            store,
            downloader,
            final_path,
            status: ArcSwap::from_pointee(status),
            run: Mutex::new(RunState::default()),
        }
    }

    /// 启动恢复：清扫崩溃遗留的临时文件；final 存在则加载。
    /// 加载失败只报告 Failed(Load)，不删文件。
    pub async fn open(
        store: Arc<RecordStore>,
        downloader: SnapshotDownloader,
        final_path: PathBuf,
    ) -> Arc<Self> {
        let this = Arc::new(Self::new(store, downloader, final_path));

        let store = this.store.clone();
        let path = this.final_path.clone();
        let recovered = tokio::task::spawn_blocking(move || {
            let swept = sweep_orphans(&path);
            if swept > 0 {
                tracing::info!("Startup sweep removed {} orphaned temp files", swept);
            }
            if !path.exists() {
                return None;
            }
            Some(store.load(&path).map(|snap| {
                store.activate(snap);
            }))
        })
        .await
        .unwrap_or_else(|e| Some(Err(LoadError::Io(format!("startup load task failed: {}", e)))));

        match recovered {
            None => tracing::info!("No local snapshot at {:?}", this.final_path),
            Some(Ok(())) => {
                tracing::info!("Recovered local snapshot {:?}", this.final_path);
                this.publish(&this.run.lock(), LifecycleState::Ready, None);
            }
            Some(Err(e)) => {
                tracing::warn!("Local snapshot unusable, keeping file for inspection: {}", e);
                let err = SyncError::Load(e);
                this.publish(&this.run.lock(), LifecycleState::Failed(err.clone()), Some(err));
            }
        }
        this
    }

    pub fn path(&self) -> &Path {
        &self.final_path
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// 非阻塞，永不失败
    pub fn status(&self) -> Status {
        (**self.status.load()).clone()
    }

    /// 显式触发一次 sync。已在进行中则什么都不做，返回当前状态。
    pub fn start(self: &Arc<Self>) -> Status {
        let mut run = self.run.lock();
        if self.status.load().state.is_busy() {
            tracing::debug!("start ignored: attempt {} still running", run.attempt);
            return self.status();
        }

        run.attempt += 1;
        let attempt = run.attempt;
        self.publish(&run, LifecycleState::Downloading, None);
        tracing::info!(
            "Snapshot sync #{} started from {}",
            attempt,
            self.downloader.source_name()
        );

        let this = self.clone();
        run.task = Some(tokio::spawn(async move { this.run_attempt(attempt).await }));
        self.status()
    }

    /// 取消进行中的 sync。临时文件由下载 guard 清理，活跃 generation 不受影响。
    pub async fn cancel(&self) -> Status {
        let task = {
            let mut run = self.run.lock();
            if !self.status.load().state.is_busy() {
                return self.status();
            }
            // 先作废 attempt，任务的迟到写入全部失效
            run.attempt += 1;
            run.task.take()
        };

        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        let run = self.run.lock();
        let state = if self.store.is_ready() {
            LifecycleState::Ready
        } else {
            LifecycleState::Failed(SyncError::Cancelled)
        };
        self.publish(&run, state, Some(SyncError::Cancelled));
        tracing::info!("Snapshot sync cancelled");
        self.status()
    }

    /// 轮询直到没有 sync 在跑
    pub async fn wait_settled(&self, poll: Duration) -> Status {
        loop {
            let st = self.status();
            if !st.state.is_busy() {
                return st;
            }
            tokio::time::sleep(poll).await;
        }
    }

    fn publish(&self, run: &RunState, state: LifecycleState, last_error: Option<SyncError>) {
        let downloading = state.is_busy();
        self.status.store(Arc::new(Status {
            state,
            path: self.final_path.clone(),
            last_error,
            exists: self.store.is_ready(),
            downloading,
            generation: self.store.generation(),
            attempt: run.attempt,
        }));
    }

    /// 只有仍是当前 attempt 时才写入
    fn transition(&self, attempt: u64, state: LifecycleState, last_error: Option<SyncError>) -> bool {
        let run = self.run.lock();
        if run.attempt != attempt {
            tracing::debug!("Dropping stale transition from attempt {}", attempt);
            return false;
        }
        self.publish(&run, state, last_error);
        true
    }

    async fn run_attempt(self: Arc<Self>, attempt: u64) {
        match self.sync_once(attempt).await {
            Ok(generation) => {
                if self.transition(attempt, LifecycleState::Ready, None) {
                    tracing::info!("Snapshot sync #{} ready at generation {}", attempt, generation);
                }
            }
            Err(e) => {
                tracing::warn!("Snapshot sync #{} failed: {}", attempt, e);
                self.transition(attempt, LifecycleState::Failed(e.clone()), Some(e));
            }
        }
    }

    async fn sync_once(self: &Arc<Self>, attempt: u64) -> Result<u64, SyncError> {
        let tmp = self.downloader.fetch(&self.final_path).await?;
        if !self.transition(attempt, LifecycleState::Validating, None) {
            return Err(SyncError::Cancelled);
        }

        // 校验、rename + fsync、activate 都是阻塞 io，整体放到 blocking 线程
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.validate_and_install(attempt, tmp))
            .await
            .map_err(|e| LoadError::Io(format!("validation task failed: {}", e)))?
    }

    /// install 与 activate 在 run 锁内完成：取消要么发生在前，要么在后。
    /// 任务被 abort 后这里仍会跑完，attempt 已作废时临时文件随 guard 删除。
    fn validate_and_install(&self, attempt: u64, tmp: TempFile) -> Result<u64, SyncError> {
        let (snap, tmp) = validate(&self.store, tmp)?;

        let run = self.run.lock();
        if run.attempt != attempt {
            return Err(SyncError::Cancelled);
        }
        tmp.install(&self.final_path)
            .map_err(|e| DownloadError::from_io(&e))?;
        let generation = snap.generation();
        self.store.activate(snap);
        drop(run);
        Ok(generation)
    }
}

/// 校验临时文件：header 版本必须等于源端声明的版本，然后完整构建 generation
fn validate(store: &RecordStore, tmp: TempFile) -> Result<(Snapshot, TempFile), SyncError> {
    let header = snapshot::read_header(tmp.path())?;
    if header.schema_version != tmp.schema_version() {
        return Err(LoadError::Corrupt(format!(
            "source declared schema v{} but file header says v{}",
            tmp.schema_version(),
            header.schema_version
        ))
        .into());
    }
    let snap = store.load(tmp.path())?;
    Ok((snap, tmp))
}
