use std::{fs, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use anyhow::{ensure, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use vista_seg_rs::{
    config::Command, server, CommandInferenceRunner, Config, SegmentationService, SessionId,
};

type Service = Arc<SegmentationService<CommandInferenceRunner>>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::new();
    fs::create_dir_all(&config.workspace_root).with_context(|| {
        format!(
            "Failed to create workspace root: {}",
            config.workspace_root.display()
        )
    })?;

    let service = Arc::new(SegmentationService::from_config(&config));
    match &config.command {
        Command::Serve {
            bind,
            max_upload_mb,
        } => serve(service, *bind, *max_upload_mb).await,
        Command::Run { image, out_dir } => run_once(&service, image, out_dir).await,
    }
}

async fn serve(service: Service, bind: SocketAddr, max_upload_mb: usize) -> Result<()> {
    ensure!(max_upload_mb > 0, "Upload limit must be at least 1 MB");

    let app = server::router(service, max_upload_mb * 1024 * 1024);
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;

    tracing::info!(%bind, max_upload_mb, "serving segmentation API");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutting down");
            }
        })
        .await?;
    Ok(())
}

async fn run_once(service: &Service, image: &Path, out_dir: &Path) -> Result<()> {
    ensure!(
        image.is_file(),
        "Input image does not exist: {}",
        image.display()
    );
    let raw =
        fs::read(image).with_context(|| format!("Failed to read image: {}", image.display()))?;

    let id = service.create_session()?;
    let summary = service.store_upload(id, image.file_name().and_then(|n| n.to_str()), &raw)?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.green} [{elapsed}] {msg}")?);
    spinner.set_message(format!(
        "segmenting {} ({}x{})",
        summary.original_name, summary.width, summary.height
    ));
    spinner.enable_steady_tick(Duration::from_millis(120));

    let interrupt = {
        let service = Arc::clone(service);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                if let Err(e) = service.cancel_inference(id) {
                    tracing::warn!(error = %e, "cancellation failed");
                }
            }
        })
    };
    let result = service.run_inference(id).await;
    interrupt.abort();
    spinner.finish_and_clear();

    if let Err(e) = &result {
        if let Some(log) = e.inference_log() {
            eprintln!("{log}");
        }
    }
    let written = result
        .with_context(|| format!("Inference failed for {}", image.display()))
        .and_then(|_| write_payloads(service, id, out_dir));

    if let Err(e) = service.remove_session(id) {
        tracing::warn!(session = %id, error = %e, "session workspace left behind");
    }
    written
}

fn write_payloads(
    service: &SegmentationService<CommandInferenceRunner>,
    id: SessionId,
    out_dir: &Path,
) -> Result<()> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create output directory: {}", out_dir.display()))?;
    for payload in service.payloads(id)? {
        let path = payload.write_into(out_dir)?;
        println!("{}", path.display());
    }
    Ok(())
}
