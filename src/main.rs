use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use catalog_mirror::config::Config;
use catalog_mirror::index::RecordStore;
use catalog_mirror::lifecycle::{LifecycleController, LifecycleState};
use catalog_mirror::overlay::{HttpSalesSource, SalesOverlay};
use catalog_mirror::query::{QueryFacade, QueryServer};
use catalog_mirror::stats::CatalogReport;
use catalog_mirror::storage::snapshot::{self, SnapshotWriter, SCHEMA_CURRENT};
use catalog_mirror::storage::{sha256_file, HttpSnapshotSource, SnapshotDownloader};

#[derive(Parser, Debug)]
#[command(name = "catalog-mirror", version, about = "Offline catalog mirror with live sales overlay")]
struct Cli {
    /// TOML 配置文件（默认读取当前目录的 catalog-mirror.toml，不存在则用默认值）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 加载本地快照并提供 HTTP 查询
    Serve {
        #[arg(long)]
        listen: Option<SocketAddr>,
        #[arg(long)]
        snapshot_path: Option<PathBuf>,
        #[arg(long)]
        snapshot_url: Option<String>,
        #[arg(long)]
        sales_url: Option<String>,
        /// 启动后立即触发一次 sync
        #[arg(long)]
        sync: bool,
    },
    /// 把 JSON-lines feed 打包成快照文件，并输出发布用 manifest
    Pack {
        input: PathBuf,
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve {
            listen,
            snapshot_path,
            snapshot_url,
            sales_url,
            sync,
        } => {
            if let Some(v) = listen {
                config.listen = v;
            }
            if let Some(v) = snapshot_path {
                config.snapshot_path = v;
            }
            if snapshot_url.is_some() {
                config.snapshot_url = snapshot_url;
            }
            if sales_url.is_some() {
                config.sales_url = sales_url;
            }
            config.validate()?;
            serve(config, sync).await
        }
        Command::Pack { input, output } => pack(&input, output),
    }
}

async fn serve(config: Config, sync: bool) -> anyhow::Result<()> {
    info!("Starting catalog-mirror, snapshot at {:?}", config.snapshot_path);

    let snapshot_url = config
        .snapshot_url
        .as_deref()
        .context("snapshot_url is not configured")?;
    let sales_url = config
        .sales_url
        .as_deref()
        .context("sales_url is not configured")?;

    let source = Arc::new(HttpSnapshotSource::new(snapshot_url, Duration::from_secs(30))?);
    let downloader = SnapshotDownloader::new(source, config.download_timeout());
    let lifecycle = LifecycleController::open(
        Arc::new(RecordStore::new()),
        downloader,
        config.snapshot_path.clone(),
    )
    .await;

    let sales = Arc::new(HttpSalesSource::new(
        sales_url,
        Duration::from_secs(config.overlay_fetch_timeout_secs),
    )?);
    let overlay = Arc::new(SalesOverlay::new(sales, config.overlay()));
    let overlay_task = overlay.spawn_refresh(config.overlay_refresh_interval());

    let facade = Arc::new(QueryFacade::new(lifecycle.clone(), overlay, config.limits()));

    if sync || lifecycle.status().state == LifecycleState::NotPresent {
        let st = lifecycle.start();
        info!("Initial sync requested (attempt {})", st.attempt);
    }

    let report_task = config.report_interval().map(|every| {
        let facade = facade.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                info!("\n{}", CatalogReport::collect(&facade));
            }
        })
    });

    info!(
        "catalog-mirror ready. Query via: http://{}/search?q=keyword",
        config.listen
    );
    let server = QueryServer::new(facade);
    server
        .run(config.listen, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down...");
        })
        .await?;

    overlay_task.abort();
    if let Some(t) = report_task {
        t.abort();
    }
    if lifecycle.status().state.is_busy() {
        lifecycle.cancel().await;
    }
    Ok(())
}

fn pack(input: &std::path::Path, output: PathBuf) -> anyhow::Result<()> {
    let feed = std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    let (records, rejected) = snapshot::decode_feed(&feed);
    anyhow::ensure!(!records.is_empty(), "no valid records in {}", input.display());

    let writer = SnapshotWriter::new(output);
    let bytes = writer
        .write_atomic(&records, SCHEMA_CURRENT)
        .with_context(|| format!("writing {}", writer.path().display()))?;
    let sha256 = sha256_file(writer.path())?;
    info!(
        "Packed {} records ({} rejected) into {:?}, {} bytes",
        records.len(),
        rejected,
        writer.path(),
        bytes
    );

    let file_name = writer
        .path()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let manifest = serde_json::json!({
        "url": file_name,
        "sha256": sha256,
        "schemaVersion": SCHEMA_CURRENT,
        "size": bytes,
    });
    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}
