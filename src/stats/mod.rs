use std::fmt;

use crate::index::SnapshotStats;
use crate::overlay::OverlayStats;
use crate::query::QueryFacade;

/// 周期性打印的运行报告
#[derive(Clone, Debug, Default)]
pub struct CatalogReport {
    /// 生命周期状态标签（ready / downloading / ...）
    pub state: &'static str,
    /// 当前活跃 generation；从未加载过为默认值
    pub snapshot: SnapshotStats,
    pub snapshot_file_bytes: u64,
    pub overlay: OverlayStats,
    /// 进程级 RSS（从 /proc/self/statm 读取）
    pub process_rss_bytes: u64,
}

impl CatalogReport {
    pub fn collect(facade: &QueryFacade) -> Self {
        let status = facade.status();
        let snapshot = facade
            .store()
            .handle()
            .map(|h| h.stats())
            .unwrap_or_default();
        Self {
            state: status.state.label(),
            snapshot,
            snapshot_file_bytes: std::fs::metadata(&status.path).map(|m| m.len()).unwrap_or(0),
            overlay: facade.overlay().stats(),
            process_rss_bytes: Self::read_process_rss(),
        }
    }

    pub fn read_process_rss() -> u64 {
        std::fs::read_to_string("/proc/self/statm")
            .ok()
            .and_then(|s| {
                // statm: size resident shared ...（单位: 页）
                let parts: Vec<&str> = s.split_whitespace().collect();
                parts.get(1)?.parse::<u64>().ok()
            })
            .map(|pages| pages * 4096)
            .unwrap_or(0)
    }
}

fn human_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

impl fmt::Display for CatalogReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║           catalog-mirror Report                  ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(f, "║ State:       {:>35} ║", self.state)?;
        writeln!(
            f,
            "║ Process RSS: {:>35} ║",
            human_bytes(self.process_rss_bytes)
        )?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Snapshot:                                        ║")?;
        writeln!(
            f,
            "║   generation:   {:>10}                       ║",
            self.snapshot.generation
        )?;
        writeln!(
            f,
            "║   records:      {:>10}  ({:>10})          ║",
            self.snapshot.records,
            human_bytes(self.snapshot_file_bytes)
        )?;
        writeln!(
            f,
            "║   rejected:     {:>10}                       ║",
            self.snapshot.rejected
        )?;
        writeln!(
            f,
            "║   tokens:       {:>10}                       ║",
            self.snapshot.distinct_tokens
        )?;
        writeln!(
            f,
            "║   trigram keys: {:>10}                       ║",
            self.snapshot.trigram_keys
        )?;
        writeln!(
            f,
            "║   postings:     {:>10}                       ║",
            self.snapshot.postings_total
        )?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Sales Overlay:                                   ║")?;
        writeln!(
            f,
            "║   entries:      {:>10}  (fresh {:>10})    ║",
            self.overlay.entries, self.overlay.fresh
        )?;
        writeln!(
            f,
            "║   capacity:     {:>10}                       ║",
            self.overlay.capacity
        )?;
        writeln!(
            f,
            "║   hits/misses:  {:>10} / {:<10}          ║",
            self.overlay.hits, self.overlay.misses
        )?;
        writeln!(
            f,
            "║   evictions:    {:>10}                       ║",
            self.overlay.evictions
        )?;
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_bytes_picks_unit() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.00 KB");
        assert_eq!(human_bytes(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn report_renders_every_section() {
        let report = CatalogReport {
            state: "ready",
            snapshot: SnapshotStats {
                generation: 4,
                records: 120_000,
                rejected: 3,
                distinct_tokens: 9_000,
                trigram_keys: 40_000,
                postings_total: 1_000_000,
            },
            snapshot_file_bytes: 30 * 1024 * 1024,
            overlay: OverlayStats {
                entries: 10,
                fresh: 8,
                capacity: 50_000,
                hits: 5,
                misses: 2,
                evictions: 0,
            },
            process_rss_bytes: 0,
        };
        let s = report.to_string();
        assert!(s.contains("ready"));
        assert!(s.contains("120000"));
        assert!(s.contains("30.00 MB"));
        assert!(s.contains("Sales Overlay"));
        assert_eq!(s.lines().count(), 20);
    }
}
