//! 配置：TOML 文件（所有字段有默认值），CLI 参数再覆盖。

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::overlay::OverlayConfig;
use crate::query::QueryLimits;

pub const DEFAULT_CONFIG_FILE: &str = "catalog-mirror.toml";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// 快照的最终路径；临时文件写在同一目录
    pub snapshot_path: PathBuf,
    /// 快照 manifest 地址（JSON：url / sha256 / schemaVersion）
    pub snapshot_url: Option<String>,
    /// 实时销量接口：`GET {sales_url}?ids=1,2,3`
    pub sales_url: Option<String>,
    pub download_timeout_secs: u64,
    pub overlay_ttl_secs: u64,
    pub overlay_capacity: usize,
    pub overlay_refresh_secs: u64,
    pub overlay_fetch_timeout_secs: u64,
    /// 同时在途的销量请求数
    pub overlay_max_in_flight: usize,
    /// 单次请求销量源的 id 数
    pub sales_batch_size: usize,
    /// batch_sales 单次上限
    pub max_batch: usize,
    pub default_limit: usize,
    pub max_limit: usize,
    pub listen: SocketAddr,
    /// 0 关闭周期报告
    pub report_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            snapshot_path: default_data_dir().join("catalog.snap"),
            snapshot_url: None,
            sales_url: None,
            download_timeout_secs: 300,
            overlay_ttl_secs: 600,
            overlay_capacity: 50_000,
            overlay_refresh_secs: 120,
            overlay_fetch_timeout_secs: 10,
            overlay_max_in_flight: 4,
            sales_batch_size: 100,
            max_batch: 200,
            default_limit: 50,
            max_limit: 500,
            listen: SocketAddr::from(([127, 0, 0, 1], 6061)),
            report_interval_secs: 300,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("catalog-mirror")
}

impl Config {
    /// 显式给出的路径必须存在；未给出时默认文件不存在就用默认配置
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };
        if !path.exists() {
            if required {
                anyhow::bail!("config file not found: {}", path.display());
            }
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let cfg = Self::from_toml(&raw).with_context(|| format!("parsing {}", path.display()))?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(cfg)
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let cfg: Self = toml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.download_timeout_secs > 0, "download_timeout_secs must be > 0");
        anyhow::ensure!(self.overlay_capacity > 0, "overlay_capacity must be > 0");
        anyhow::ensure!(self.overlay_refresh_secs > 0, "overlay_refresh_secs must be > 0");
        anyhow::ensure!(self.sales_batch_size > 0, "sales_batch_size must be > 0");
        anyhow::ensure!(self.overlay_max_in_flight > 0, "overlay_max_in_flight must be > 0");
        anyhow::ensure!(self.max_batch > 0, "max_batch must be > 0");
        anyhow::ensure!(
            self.default_limit <= self.max_limit,
            "default_limit ({}) exceeds max_limit ({})",
            self.default_limit,
            self.max_limit
        );
        Ok(())
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn overlay_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.overlay_refresh_secs)
    }

    pub fn report_interval(&self) -> Option<Duration> {
        (self.report_interval_secs > 0).then(|| Duration::from_secs(self.report_interval_secs))
    }

    pub fn overlay(&self) -> OverlayConfig {
        OverlayConfig {
            ttl: Duration::from_secs(self.overlay_ttl_secs),
            capacity: self.overlay_capacity,
            chunk_size: self.sales_batch_size,
            fetch_timeout: Duration::from_secs(self.overlay_fetch_timeout_secs),
            max_in_flight: self.overlay_max_in_flight,
        }
    }

    pub fn limits(&self) -> QueryLimits {
        QueryLimits {
            default_limit: self.default_limit,
            max_limit: self.max_limit,
            max_batch: self.max_batch,
        }
    }
}
