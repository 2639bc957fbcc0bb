// src/bin/headless.rs - Frame loop without a window
//
// Runs against the synthetic feed and logs every parameter revision.
//
//   headless [model.glb|https://...] [seconds]
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use virtual_dresser::advisor::GeminiFitAdvisor;
use virtual_dresser::config::AppConfig;
use virtual_dresser::controller::{Command, FrameLoopController, NoticeLevel, SourceStatus};
use virtual_dresser::model::ModelAsset;
use virtual_dresser::video::SyntheticFeed;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("virtual_dresser=info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let model = args.next().map(|arg| ModelAsset::parse(&arg));
    let run_for = args
        .next()
        .map(|s| s.parse::<u64>().context("seconds must be a whole number"))
        .transpose()?
        .map(Duration::from_secs);

    let config = AppConfig::from_env();
    let advisor = Arc::new(
        GeminiFitAdvisor::new(config.advisor.clone())
            .context("fit advisor is not configured (set GEMINI_API_KEY)")?,
    );
    let feed = SyntheticFeed::new(config.capture);
    let source = config.pose_source.build();

    let (controller, mut handle) = FrameLoopController::new(source, feed, advisor, config.controller.clone());
    let frame_loop = tokio::spawn(controller.run());

    let status = handle
        .snapshots
        .wait_for(|s| s.source_status != SourceStatus::Initializing)
        .await
        .context("frame loop stopped during initialization")?
        .source_status
        .clone();
    if let SourceStatus::Failed(reason) = status {
        bail!("pose detection failed to initialize: {}", reason);
    }

    handle.commands.send(Command::SetCameraEnabled(true)).await?;
    match model {
        Some(model) => handle.commands.send(Command::LoadModel(model)).await?,
        None => warn!("No model given; detecting poses only"),
    }

    let deadline = async {
        match run_for {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut last_parameters = handle.snapshots.borrow().state.current_parameters;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = &mut deadline => break,
            Some(notice) = handle.notices.recv() => match notice.level {
                NoticeLevel::Info => info!("{}: {}", notice.title, notice.description),
                NoticeLevel::Error => error!("{}: {}", notice.title, notice.description),
            },
            changed = handle.snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = handle.snapshots.borrow_and_update().clone();
                if snapshot.state.current_parameters != last_parameters {
                    last_parameters = snapshot.state.current_parameters;
                    info!(
                        parameters = %last_parameters,
                        reasoning = snapshot.last_reasoning.as_deref().unwrap_or(""),
                        "Parameters revised"
                    );
                }
            }
        }
    }

    let _ = handle.commands.send(Command::Shutdown).await;
    frame_loop.await.context("frame loop task failed")?;
    Ok(())
}
