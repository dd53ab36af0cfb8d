use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::core::{CatalogRecord, QueryError};
use crate::index::{RecordStore, SnapshotHandle};
use crate::lifecycle::{LifecycleController, Status};
use crate::overlay::SalesOverlay;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueryLimits {
    /// search 未给 limit 时的默认值
    pub default_limit: usize,
    pub max_limit: usize,
    /// batch_sales 单次最多向源端补拉的 id 数
    pub max_batch: usize,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            default_limit: 50,
            max_limit: 500,
            max_batch: 200,
        }
    }
}

/// 对外返回的记录：快照字段 + 叠加后的有效销量
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogItem {
    #[serde(flatten)]
    pub record: CatalogRecord,
    pub effective_sales: u64,
    /// effective_sales 是否来自新鲜的 overlay 值
    pub sales_live: bool,
}

/// 唯一对外的查询入口。
///
/// 从未有过可用 generation 时所有查询返回 `QueryError::NotReady`；
/// 刷新失败期间旧 generation 继续服务。
pub struct QueryFacade {
    store: Arc<RecordStore>,
    overlay: Arc<SalesOverlay>,
    lifecycle: Arc<LifecycleController>,
    limits: QueryLimits,
}

impl QueryFacade {
    pub fn new(
        lifecycle: Arc<LifecycleController>,
        overlay: Arc<SalesOverlay>,
        limits: QueryLimits,
    ) -> Self {
        Self {
            store: lifecycle.store().clone(),
            overlay,
            lifecycle,
            limits,
        }
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn overlay(&self) -> &Arc<SalesOverlay> {
        &self.overlay
    }

    pub fn limits(&self) -> QueryLimits {
        self.limits
    }

    fn handle(&self) -> Result<SnapshotHandle, QueryError> {
        self.store.handle().ok_or(QueryError::NotReady)
    }

    /// overlay 新鲜值优先，否则严格等于快照销量
    pub fn effective_sales(&self, record: &CatalogRecord) -> u64 {
        self.overlay.get(record.asset_id).unwrap_or(record.sales_snapshot)
    }

    fn item(&self, record: &CatalogRecord) -> CatalogItem {
        let live = self.overlay.get(record.asset_id);
        CatalogItem {
            record: record.clone(),
            effective_sales: live.unwrap_or(record.sales_snapshot),
            sales_live: live.is_some(),
        }
    }

    pub fn lookup(&self, asset_id: u64) -> Result<Option<CatalogItem>, QueryError> {
        let snap = self.handle()?;
        Ok(snap.get(asset_id).map(|r| self.item(r)))
    }

    /// 顺序由快照决定（词前缀优先，再按 salesSnapshot desc、assetId asc）
    pub fn search(&self, keyword: &str, limit: Option<usize>) -> Result<Vec<CatalogItem>, QueryError> {
        let snap = self.handle()?;
        let limit = self.clamp_limit(limit);
        let hits = snap.search(keyword, limit);
        tracing::debug!("search {:?} limit {} -> {} hits", keyword, limit, hits.len());
        Ok(hits.into_iter().map(|r| self.item(r)).collect())
    }

    fn clamp_limit(&self, limit: Option<usize>) -> usize {
        limit
            .unwrap_or(self.limits.default_limit)
            .min(self.limits.max_limit)
    }

    /// id → 有效销量。
    ///
    /// 唯一会按需刷新 overlay 的调用：缺少新鲜值的 id 向源端补拉一次，
    /// 补拉的 id 数不超过 `max_batch`（超出部分直接用快照销量），失败的 id
    /// 同样回退到快照销量。每个请求的 id 都会解析；既不在快照中、也没有
    /// 实时值的 id 不出现在结果里。
    pub async fn batch_sales(&self, asset_ids: &[u64]) -> Result<BTreeMap<u64, u64>, QueryError> {
        let snap = self.handle()?;

        let mut seen = HashSet::with_capacity(asset_ids.len());
        let ids: Vec<u64> = asset_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect();

        let mut missing: Vec<u64> = ids
            .iter()
            .copied()
            .filter(|&id| self.overlay.entry(id).is_none())
            .collect();
        if missing.len() > self.limits.max_batch {
            tracing::debug!(
                "batch_sales refreshing {} of {} missing ids",
                self.limits.max_batch,
                missing.len()
            );
            missing.truncate(self.limits.max_batch);
        }
        if !missing.is_empty() {
            if let Err(e) = self.overlay.refresh_batch(&missing).await {
                tracing::debug!("batch_sales falling back to snapshot: {}", e);
            }
        }

        let mut out = BTreeMap::new();
        for id in ids {
            let live = self.overlay.get(id);
            let sales = match (live, snap.get(id)) {
                (Some(n), _) => n,
                (None, Some(r)) => r.sales_snapshot,
                (None, None) => continue,
            };
            out.insert(id, sales);
        }
        Ok(out)
    }

    pub fn count(&self) -> Result<u64, QueryError> {
        Ok(self.handle()?.count())
    }

    pub fn status(&self) -> Status {
        self.lifecycle.status()
    }

    /// 已在下载中时不会启动第二个 fetch，返回当前状态
    pub fn start_download(&self) -> Status {
        self.lifecycle.start()
    }

    pub async fn cancel_download(&self) -> Status {
        self.lifecycle.cancel().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::lifecycle::LifecycleState;
    use crate::overlay::OverlayConfig;
    use crate::storage::download::SnapshotDownloader;
    use crate::storage::snapshot::{SnapshotWriter, SCHEMA_BINCODE};
    use crate::testing::{record, MockSalesSource, MockSnapshotSource};

    struct Fixture {
        _dir: tempfile::TempDir,
        facade: QueryFacade,
        sales: Arc<MockSalesSource>,
    }

    async fn fixture(records: &[CatalogRecord], limits: QueryLimits) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.snap");
        if !records.is_empty() {
            SnapshotWriter::new(path.clone())
                .write_atomic(records, SCHEMA_BINCODE)
                .unwrap();
        }

        let source = Arc::new(MockSnapshotSource::new(Vec::new(), SCHEMA_BINCODE));
        let downloader = SnapshotDownloader::new(source, Duration::from_secs(5));
        let lifecycle = LifecycleController::open(Arc::new(RecordStore::new()), downloader, path).await;

        let sales = Arc::new(MockSalesSource::new());
        let overlay = Arc::new(SalesOverlay::new(
            sales.clone(),
            OverlayConfig {
                ttl: Duration::from_secs(60),
                ..OverlayConfig::default()
            },
        ));
        Fixture {
            _dir: dir,
            facade: QueryFacade::new(lifecycle, overlay, limits),
            sales,
        }
    }

    fn catalog() -> Vec<CatalogRecord> {
        vec![
            record(1, "Red Hat", 10),
            record(2, "Red Cap", 50),
            record(3, "Blue Hat", 30),
        ]
    }

    #[tokio::test]
    async fn never_loaded_store_answers_not_ready() {
        let f = fixture(&[], QueryLimits::default()).await;
        let q = &f.facade;

        assert_eq!(q.lookup(1), Err(QueryError::NotReady));
        assert_eq!(q.search("hat", Some(10)), Err(QueryError::NotReady));
        assert_eq!(q.count(), Err(QueryError::NotReady));
        assert_eq!(q.batch_sales(&[1, 2]).await, Err(QueryError::NotReady));
        let st = q.status();
        assert_eq!(st.state, LifecycleState::NotPresent);
        assert!(!st.exists);
    }

    #[tokio::test]
    async fn batch_sales_mixes_overlay_and_snapshot_values() {
        let f = fixture(&catalog(), QueryLimits::default()).await;
        f.facade.overlay().insert(1, 999);
        f.sales.set_fail_all(true);

        let got = f.facade.batch_sales(&[1, 2, 3]).await.unwrap();
        let want: BTreeMap<u64, u64> = [(1, 999), (2, 50), (3, 30)].into_iter().collect();
        assert_eq!(got, want);
        // 只为缺少新鲜值的 2、3 请求过一次
        assert_eq!(f.sales.calls(), 1);
    }

    #[tokio::test]
    async fn batch_sales_refreshes_missing_ids_on_demand() {
        let f = fixture(&catalog(), QueryLimits::default()).await;
        f.sales.set_sales(&[(2, 77), (3, 88)]);

        let got = f.facade.batch_sales(&[2, 3, 3, 404]).await.unwrap();
        let want: BTreeMap<u64, u64> = [(2, 77), (3, 88)].into_iter().collect();
        assert_eq!(got, want);
        assert_eq!(f.facade.overlay().get(2), Some(77));

        // 第二次全部命中新鲜值，不再请求源端
        f.facade.batch_sales(&[2, 3]).await.unwrap();
        assert_eq!(f.sales.calls(), 1);
    }

    #[tokio::test]
    async fn on_demand_refresh_is_capped_but_every_id_resolves() {
        let limits = QueryLimits {
            max_batch: 2,
            ..QueryLimits::default()
        };
        let f = fixture(&catalog(), limits).await;
        f.sales.set_fail_all(true);

        let got = f.facade.batch_sales(&[3, 2, 1]).await.unwrap();
        let want: BTreeMap<u64, u64> = [(1, 10), (2, 50), (3, 30)].into_iter().collect();
        assert_eq!(got, want);
        let asked = f.sales.requested_ids();
        assert!(asked.len() <= 2);
        assert_eq!(asked, vec![3, 2]);
    }

    #[tokio::test]
    async fn stale_overlay_falls_back_to_snapshot_sales_exactly() {
        let f = fixture(&catalog(), QueryLimits::default()).await;
        let long_ago = Instant::now().checked_sub(Duration::from_secs(3600)).unwrap();
        f.facade.overlay().insert_at(2, 12_345, long_ago);

        let item = f.facade.lookup(2).unwrap().unwrap();
        assert_eq!(item.effective_sales, 50);
        assert!(!item.sales_live);
        assert_eq!(f.facade.effective_sales(&item.record), item.record.sales_snapshot);

        f.facade.overlay().insert(2, 60);
        let item = f.facade.lookup(2).unwrap().unwrap();
        assert_eq!(item.effective_sales, 60);
        assert!(item.sales_live);
    }

    #[tokio::test]
    async fn lookup_and_search_serve_the_active_generation() {
        let f = fixture(&catalog(), QueryLimits::default()).await;
        let q = &f.facade;

        assert_eq!(q.count(), Ok(3));
        assert_eq!(q.lookup(404), Ok(None));
        assert_eq!(q.lookup(1).unwrap().unwrap().record.name, "Red Hat");

        let ids: Vec<u64> = q
            .search("red", Some(10))
            .unwrap()
            .into_iter()
            .map(|i| i.record.asset_id)
            .collect();
        assert_eq!(ids, vec![2, 1]);
        assert!(q.search("  ", None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_limit_defaults_and_clamps() {
        let records: Vec<CatalogRecord> = (1..=20).map(|i| record(i, "Hat", i)).collect();
        let limits = QueryLimits {
            default_limit: 5,
            max_limit: 8,
            max_batch: 10,
        };
        let f = fixture(&records, limits).await;

        assert_eq!(f.facade.search("hat", None).unwrap().len(), 5);
        assert_eq!(f.facade.search("hat", Some(100)).unwrap().len(), 8);
        assert_eq!(f.facade.search("hat", Some(3)).unwrap().len(), 3);
        assert!(f.facade.search("hat", Some(0)).unwrap().is_empty());
    }

    #[test]
    fn item_serializes_flat_with_effective_sales() {
        let item = CatalogItem {
            record: record(1, "Red Hat", 10),
            effective_sales: 12,
            sales_live: true,
        };
        let v = serde_json::to_value(&item).unwrap();
        assert_eq!(v["assetId"], 1);
        assert_eq!(v["salesSnapshot"], 10);
        assert_eq!(v["effectiveSales"], 12);
        assert_eq!(v["salesLive"], true);
    }
}
