//! 实时销量 overlay：短 TTL、有界容量，在读时叠加到快照记录之上。
//!
//! 锁只包住单次 get/set，绝不跨越网络调用。

pub mod http;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;

use crate::core::FetchError;

pub use http::HttpSalesSource;

/// 实时销量源的失败（整块失败，由 overlay 映射到具体 id）
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SalesSourceError {
    #[error("network error: {0}")]
    Network(String),
    #[error("sales request timed out")]
    Timeout,
    #[error("bad response: {0}")]
    BadResponse(String),
}

/// 批量 id → 销量
#[async_trait]
pub trait SalesSource: Send + Sync {
    fn name(&self) -> &str;

    /// 返回的 map 可以缺少部分 id（视为该 id 失败）
    async fn fetch_sales(&self, ids: &[u64]) -> Result<HashMap<u64, u64>, SalesSourceError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SalesOverlayEntry {
    pub asset_id: u64,
    pub live_sales: u64,
    pub fetched_at: Instant,
}

#[derive(Clone, Copy, Debug)]
pub struct OverlayConfig {
    pub ttl: Duration,
    pub capacity: usize,
    /// 单次请求源端的最大 id 数
    pub chunk_size: usize,
    pub fetch_timeout: Duration,
    /// 同时在途的分块请求上限
    pub max_in_flight: usize,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            capacity: 50_000,
            chunk_size: 100,
            fetch_timeout: Duration::from_secs(10),
            max_in_flight: 4,
        }
    }
}

/// 超过这么多个 TTL 未刷新成功的条目不再被后台循环轮询，直接移除
const RETIRE_AFTER_TTLS: u32 = 3;

#[derive(Debug)]
struct Slot {
    entry: SalesOverlayEntry,
    stamp: u64,
}

/// entries + 按抓取先后排序的索引（stamp 单调递增），用于淘汰最早抓取的条目
#[derive(Debug, Default)]
struct OverlayState {
    entries: HashMap<u64, Slot>,
    by_fetch: BTreeMap<u64, u64>,
    next_stamp: u64,
}

impl OverlayState {
    fn upsert(&mut self, entry: SalesOverlayEntry, capacity: usize) -> usize {
        if let Some(old) = self.entries.remove(&entry.asset_id) {
            self.by_fetch.remove(&old.stamp);
        }
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.by_fetch.insert(stamp, entry.asset_id);
        self.entries.insert(entry.asset_id, Slot { entry, stamp });

        let mut evicted = 0;
        while self.entries.len() > capacity {
            let Some((_, victim)) = self.by_fetch.pop_first() else {
                break;
            };
            self.entries.remove(&victim);
            evicted += 1;
        }
        evicted
    }

    fn retire_before(&mut self, cutoff: Instant) -> usize {
        let old: Vec<(u64, u64)> = self
            .by_fetch
            .iter()
            .filter(|(_, id)| {
                self.entries
                    .get(*id)
                    .is_some_and(|s| s.entry.fetched_at < cutoff)
            })
            .map(|(&stamp, &id)| (stamp, id))
            .collect();
        for (stamp, id) in &old {
            self.by_fetch.remove(stamp);
            self.entries.remove(id);
        }
        old.len()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OverlayStats {
    pub entries: usize,
    pub fresh: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct SalesOverlay {
    state: Mutex<OverlayState>,
    source: Arc<dyn SalesSource>,
    config: OverlayConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl SalesOverlay {
    pub fn new(source: Arc<dyn SalesSource>, config: OverlayConfig) -> Self {
        Self {
            state: Mutex::new(OverlayState::default()),
            source,
            config: OverlayConfig {
                capacity: config.capacity.max(1),
                chunk_size: config.chunk_size.max(1),
                max_in_flight: config.max_in_flight.max(1),
                ..config
            },
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn is_fresh(&self, entry: &SalesOverlayEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.fetched_at) <= self.config.ttl
    }

    /// 新鲜值；过期或缺失都返回 None（调用方回退到快照销量）
    pub fn get(&self, asset_id: u64) -> Option<u64> {
        let v = self.entry(asset_id).map(|e| e.live_sales);
        match v {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        v
    }

    /// 新鲜条目（含抓取时间）
    pub fn entry(&self, asset_id: u64) -> Option<SalesOverlayEntry> {
        let now = Instant::now();
        let st = self.state.lock();
        st.entries
            .get(&asset_id)
            .map(|s| s.entry)
            .filter(|e| self.is_fresh(e, now))
    }

    pub(crate) fn insert_at(&self, asset_id: u64, live_sales: u64, fetched_at: Instant) {
        let evicted = self.state.lock().upsert(
            SalesOverlayEntry {
                asset_id,
                live_sales,
                fetched_at,
            },
            self.config.capacity,
        );
        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        }
    }

    pub fn insert(&self, asset_id: u64, live_sales: u64) {
        self.insert_at(asset_id, live_sales, Instant::now());
    }

    /// 向源端刷新一批 id。
    ///
    /// 按 `chunk_size` 分块，最多 `max_in_flight` 块同时在途；某块失败只影响该块的 id，
    /// 已缓存的旧值保持不动。
    pub async fn refresh_batch(&self, asset_ids: &[u64]) -> Result<(), FetchError> {
        let mut seen = HashSet::with_capacity(asset_ids.len());
        let ids: Vec<u64> = asset_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect();
        if ids.is_empty() {
            return Ok(());
        }

        let chunks: Vec<Vec<u64>> = ids.chunks(self.config.chunk_size).map(<[u64]>::to_vec).collect();
        let results: Vec<_> = stream::iter(chunks)
            .map(|chunk| async move {
                let res = tokio::time::timeout(self.config.fetch_timeout, self.source.fetch_sales(&chunk))
                    .await;
                (chunk, res)
            })
            .buffer_unordered(self.config.max_in_flight)
            .collect()
            .await;

        let mut failed: Vec<u64> = Vec::new();
        let mut reason: Option<String> = None;
        let mut updated = 0usize;

        for (chunk, res) in results {
            match res {
                Ok(Ok(sales)) => {
                    let now = Instant::now();
                    for &id in &chunk {
                        match sales.get(&id) {
                            Some(&n) => {
                                self.insert_at(id, n, now);
                                updated += 1;
                            }
                            None => {
                                failed.push(id);
                                reason.get_or_insert_with(|| "missing from response".into());
                            }
                        }
                    }
                }
                Ok(Err(e)) => {
                    failed.extend_from_slice(&chunk);
                    reason = Some(e.to_string());
                }
                Err(_) => {
                    failed.extend_from_slice(&chunk);
                    reason = Some(SalesSourceError::Timeout.to_string());
                }
            }
        }

        tracing::debug!(
            "Sales refresh via {}: {} updated, {} failed",
            self.source.name(),
            updated,
            failed.len()
        );
        if failed.is_empty() {
            Ok(())
        } else {
            Err(FetchError {
                failed,
                reason: reason.unwrap_or_default(),
            })
        }
    }

    fn retire_cutoff(&self, now: Instant) -> Option<Instant> {
        now.checked_sub(self.config.ttl.saturating_mul(RETIRE_AFTER_TTLS))
    }

    /// 后台刷新要轮询的 id（最早抓取的在前）；过期太久的不算在内
    pub fn tracked_ids(&self) -> Vec<u64> {
        let cutoff = self.retire_cutoff(Instant::now());
        let st = self.state.lock();
        st.by_fetch
            .values()
            .copied()
            .filter(|id| match (cutoff, st.entries.get(id)) {
                (Some(c), Some(s)) => s.entry.fetched_at >= c,
                _ => true,
            })
            .collect()
    }

    /// 移除连续多个 TTL 都没刷新成功的条目，返回移除数
    pub fn retire_expired(&self) -> usize {
        let Some(cutoff) = self.retire_cutoff(Instant::now()) else {
            return 0;
        };
        let n = self.state.lock().retire_before(cutoff);
        if n > 0 {
            tracing::debug!("Overlay retired {} long-expired entries", n);
        }
        n
    }

    pub fn stats(&self) -> OverlayStats {
        let now = Instant::now();
        let (entries, fresh) = {
            let st = self.state.lock();
            let fresh = st
                .entries
                .values()
                .filter(|s| self.is_fresh(&s.entry, now))
                .count();
            (st.entries.len(), fresh)
        };
        OverlayStats {
            entries,
            fresh,
            capacity: self.config.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// 后台刷新循环：每个周期刷新一遍已跟踪的 id（最早抓取的优先）
    pub async fn refresh_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.retire_expired();
            let ids = self.tracked_ids();
            if ids.is_empty() {
                continue;
            }
            match self.refresh_batch(&ids).await {
                Ok(()) => tracing::debug!("Overlay refresh ok: {} ids", ids.len()),
                Err(e) => tracing::warn!("Overlay refresh partial failure: {}", e),
            }
        }
    }

    /// 在独立任务上跑 [`Self::refresh_loop`]；abort 返回的 handle 即可取消
    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.clone().refresh_loop(interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockSalesSource;

    fn overlay(source: Arc<MockSalesSource>, ttl: Duration, capacity: usize) -> SalesOverlay {
        SalesOverlay::new(
            source,
            OverlayConfig {
                ttl,
                capacity,
                chunk_size: 2,
                fetch_timeout: Duration::from_secs(1),
                max_in_flight: 2,
            },
        )
    }

    #[test]
    fn stale_entry_reads_as_absent() {
        let ov = overlay(Arc::new(MockSalesSource::new()), Duration::from_secs(60), 10);
        let long_ago = Instant::now()
            .checked_sub(Duration::from_secs(120))
            .unwrap();
        ov.insert_at(1, 500, long_ago);
        ov.insert(2, 700);

        assert_eq!(ov.get(1), None);
        assert_eq!(ov.get(2), Some(700));
        let st = ov.stats();
        assert_eq!(st.entries, 2);
        assert_eq!(st.fresh, 1);
        assert_eq!(st.hits, 1);
        assert_eq!(st.misses, 1);
    }

    #[test]
    fn evicts_oldest_fetched_when_full() {
        let ov = overlay(Arc::new(MockSalesSource::new()), Duration::from_secs(60), 2);
        ov.insert(1, 10);
        ov.insert(2, 20);
        // 重新抓取 1，使 2 成为最早抓取
        ov.insert(1, 11);
        ov.insert(3, 30);

        assert_eq!(ov.get(1), Some(11));
        assert_eq!(ov.get(2), None);
        assert_eq!(ov.get(3), Some(30));
        assert_eq!(ov.stats().evictions, 1);
        assert_eq!(ov.tracked_ids(), vec![1, 3]);
    }

    #[tokio::test]
    async fn refresh_batch_fills_entries_in_chunks() {
        let src = Arc::new(MockSalesSource::new());
        src.set_sales(&[(1, 100), (2, 200), (3, 300)]);
        let ov = overlay(src.clone(), Duration::from_secs(60), 10);

        ov.refresh_batch(&[1, 2, 3, 3]).await.unwrap();
        assert_eq!(ov.get(1), Some(100));
        assert_eq!(ov.get(3), Some(300));
        // chunk_size = 2 → 两次请求
        assert_eq!(src.calls(), 2);
    }

    #[tokio::test]
    async fn failed_chunk_leaves_cached_values_untouched() {
        let src = Arc::new(MockSalesSource::new());
        src.set_sales(&[(1, 100), (2, 200)]);
        let ov = overlay(src.clone(), Duration::from_secs(60), 10);
        ov.insert(3, 33);

        src.fail_ids(&[3]);
        let err = ov.refresh_batch(&[1, 2, 3, 4]).await.unwrap_err();
        // 块 [1,2] 成功；块 [3,4] 整块失败
        let mut failed = err.failed.clone();
        failed.sort_unstable();
        assert_eq!(failed, vec![3, 4]);
        assert_eq!(ov.get(1), Some(100));
        assert_eq!(ov.get(3), Some(33));
        assert_eq!(ov.get(4), None);
    }

    #[tokio::test]
    async fn ids_missing_from_response_are_reported() {
        let src = Arc::new(MockSalesSource::new());
        src.set_sales(&[(1, 100)]);
        let ov = overlay(src, Duration::from_secs(60), 10);

        let err = ov.refresh_batch(&[1, 2]).await.unwrap_err();
        assert_eq!(err.failed, vec![2]);
        assert_eq!(err.reason, "missing from response");
        assert_eq!(ov.get(1), Some(100));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_keeps_at_most_max_in_flight_chunks() {
        let src = Arc::new(MockSalesSource::new());
        src.set_sales(&(1..=10).map(|id| (id, id * 10)).collect::<Vec<_>>());
        src.set_delay(Duration::from_millis(200));
        let ov = overlay(src.clone(), Duration::from_secs(60), 100);

        let ids: Vec<u64> = (1..=10).collect();
        ov.refresh_batch(&ids).await.unwrap();
        // 5 块，同时在途不超过 2
        assert_eq!(src.calls(), 5);
        assert_eq!(src.peak_in_flight(), 2);
        assert_eq!(ov.get(10), Some(100));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_loop_repolls_tracked_ids_and_retires_long_expired() {
        let src = Arc::new(MockSalesSource::new());
        let ov = Arc::new(overlay(src.clone(), Duration::from_secs(60), 10));
        ov.insert(1, 10);
        ov.insert(2, 20);
        // 已过期 4 个 TTL
        let long_ago = Instant::now()
            .checked_sub(Duration::from_secs(240))
            .unwrap();
        ov.insert_at(9, 90, long_ago);
        assert_eq!(ov.tracked_ids(), vec![1, 2]);

        src.set_sales(&[(1, 11), (2, 22), (9, 99)]);
        let task = ov.spawn_refresh(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert!(src.calls() >= 1);
        assert_eq!(ov.get(1), Some(11));
        assert_eq!(ov.get(2), Some(22));
        assert!(!src.requested_ids().contains(&9));
        assert_eq!(ov.get(9), None);
        assert_eq!(ov.stats().entries, 2);
        task.abort();
    }
}
