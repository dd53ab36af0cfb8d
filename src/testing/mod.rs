//! 测试替身：内存快照源、可控的销量源、记录构造器。
//!
//! 常驻编译（不挂 cfg(test)），集成测试与 bench 也能直接用。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::core::{CatalogRecord, DownloadError};
use crate::overlay::{SalesSource, SalesSourceError};
use crate::storage::download::{RemoteBlob, SnapshotSource};

/// 只带必填字段的记录
pub fn record(asset_id: u64, name: &str, sales: u64) -> CatalogRecord {
    CatalogRecord {
        asset_id,
        product_id: None,
        name: name.to_string(),
        description: None,
        asset_type_id: None,
        created: None,
        updated: None,
        price_in_robux: None,
        is_for_sale: false,
        is_limited: false,
        is_limited_unique: false,
        sales_snapshot: sales,
        collectibles_detail: None,
    }
}

const MOCK_CHUNK: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BodyMode {
    Complete,
    FailAfterFirstChunk,
    StallAfterFirstChunk,
}

struct MockBlob {
    data: Vec<u8>,
    schema_version: u32,
    declared: Option<String>,
    mode: BodyMode,
}

/// 内存快照源：按小块吐出 blob，可注入 checksum 错误、中途断流、卡死。
pub struct MockSnapshotSource {
    blob: Mutex<MockBlob>,
    open_error: Mutex<Option<DownloadError>>,
    opens: AtomicUsize,
}

impl MockSnapshotSource {
    pub fn new(data: Vec<u8>, schema_version: u32) -> Self {
        Self {
            blob: Mutex::new(MockBlob {
                data,
                schema_version,
                declared: None,
                mode: BodyMode::Complete,
            }),
            open_error: Mutex::new(None),
            opens: AtomicUsize::new(0),
        }
    }

    /// 声明一个与内容不符的 checksum
    pub fn with_declared_checksum(self, hex: &str) -> Self {
        self.set_declared_checksum(hex);
        self
    }

    pub fn fail_after_first_chunk(self) -> Self {
        self.blob.lock().mode = BodyMode::FailAfterFirstChunk;
        self
    }

    pub fn stall_after_first_chunk(self) -> Self {
        self.blob.lock().mode = BodyMode::StallAfterFirstChunk;
        self
    }

    /// 换一份新内容（checksum 恢复为真实值，流恢复为完整）
    pub fn replace(&self, data: Vec<u8>, schema_version: u32) {
        *self.blob.lock() = MockBlob {
            data,
            schema_version,
            declared: None,
            mode: BodyMode::Complete,
        };
    }

    pub fn set_declared_checksum(&self, hex: &str) {
        self.blob.lock().declared = Some(hex.to_string());
    }

    pub fn set_stall(&self, stall: bool) {
        self.blob.lock().mode = if stall {
            BodyMode::StallAfterFirstChunk
        } else {
            BodyMode::Complete
        };
    }

    /// open 直接失败（None 恢复）
    pub fn set_open_error(&self, err: Option<DownloadError>) {
        *self.open_error.lock() = err;
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSource for MockSnapshotSource {
    fn name(&self) -> &str {
        "mock"
    }

    async fn open(&self) -> Result<RemoteBlob, DownloadError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.open_error.lock().clone() {
            return Err(e);
        }

        let blob = self.blob.lock();
        let checksum = match &blob.declared {
            Some(hex) => hex.clone(),
            None => format!("{:x}", Sha256::digest(&blob.data)),
        };
        let mut chunks: Vec<Vec<u8>> = blob.data.chunks(MOCK_CHUNK).map(<[u8]>::to_vec).collect();

        let body = match blob.mode {
            BodyMode::Complete => stream::iter(chunks.into_iter().map(Ok)).boxed(),
            BodyMode::FailAfterFirstChunk => {
                chunks.truncate(1);
                stream::iter(chunks.into_iter().map(Ok))
                    .chain(stream::once(async {
                        Err(DownloadError::Network("connection reset by peer".into()))
                    }))
                    .boxed()
            }
            BodyMode::StallAfterFirstChunk => {
                chunks.truncate(1);
                stream::iter(chunks.into_iter().map(Ok))
                    .chain(stream::pending())
                    .boxed()
            }
        };

        Ok(RemoteBlob {
            checksum,
            schema_version: blob.schema_version,
            size_hint: Some(blob.data.len() as u64),
            body,
        })
    }
}

/// 可控的销量源：固定销量表，可让指定 id 所在的批次整体失败。
#[derive(Default)]
pub struct MockSalesSource {
    sales: Mutex<HashMap<u64, u64>>,
    failing: Mutex<HashSet<u64>>,
    fail_all: AtomicBool,
    calls: AtomicUsize,
    requested: Mutex<Vec<u64>>,
    delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockSalesSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sales(&self, pairs: &[(u64, u64)]) {
        self.sales.lock().extend(pairs.iter().copied());
    }

    /// 含这些 id 的请求整体失败
    pub fn fail_ids(&self, ids: &[u64]) {
        self.failing.lock().extend(ids.iter().copied());
    }

    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 每次请求前先等待这么久（用于观察并发）
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// 按请求顺序累计的所有 id
    pub fn requested_ids(&self) -> Vec<u64> {
        self.requested.lock().clone()
    }

    /// 同时在途请求数的峰值
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SalesSource for MockSalesSource {
    fn name(&self) -> &str {
        "mock"
    }

    async fn fetch_sales(&self, ids: &[u64]) -> Result<HashMap<u64, u64>, SalesSourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().extend_from_slice(ids);

        let delay = *self.delay.lock();
        if let Some(d) = delay {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(d).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        if self.fail_all.load(Ordering::SeqCst) {
            return Err(SalesSourceError::Network("sales endpoint unavailable".into()));
        }
        {
            let failing = self.failing.lock();
            if ids.iter().any(|id| failing.contains(id)) {
                return Err(SalesSourceError::Network("upstream rejected batch".into()));
            }
        }
        let sales = self.sales.lock();
        Ok(ids
            .iter()
            .filter_map(|id| sales.get(id).map(|&n| (*id, n)))
            .collect())
    }
}
