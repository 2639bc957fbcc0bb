// src/main.rs
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use eframe::egui;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use virtual_dresser::advisor::GeminiFitAdvisor;
use virtual_dresser::app::VirtualDresserApp;
use virtual_dresser::config::AppConfig;
use virtual_dresser::controller::{Command, FrameLoopController};
use virtual_dresser::video::CameraFeed;

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("virtual_dresser=info")),
        )
        .init();

    let config = AppConfig::from_env();
    log_cameras();

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let advisor = Arc::new(
        GeminiFitAdvisor::new(config.advisor.clone())
            .context("fit advisor is not configured (set GEMINI_API_KEY)")?,
    );
    let feed = CameraFeed::new(config.camera_index, config.capture);
    let preview = feed.preview();
    let source = config.pose_source.build();

    let (controller, handle) = FrameLoopController::new(source, feed, advisor, config.controller.clone());
    let shutdown = handle.commands.clone();
    let frame_loop = runtime.spawn(controller.run());
    info!(pose_source = ?config.pose_source, "Virtual Dresser starting");

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([1280.0, 820.0])
            .with_min_inner_size([960.0, 640.0]),
        centered: true,
        ..Default::default()
    };

    let model_dir = config.model_dir.clone();
    let result = eframe::run_native(
        "Virtual Dresser",
        options,
        Box::new(move |cc| {
            cc.egui_ctx.set_visuals(create_visuals());
            Box::new(VirtualDresserApp::new(cc, handle, preview, model_dir))
        }),
    );

    // The window is gone; stop the frame loop so the camera is released.
    let _ = shutdown.blocking_send(Command::Shutdown);
    if let Err(e) = runtime.block_on(frame_loop) {
        warn!("Frame loop ended abnormally: {}", e);
    }

    result.map_err(|e| anyhow!("error running application: {}", e))
}

fn log_cameras() {
    match nokhwa::query(nokhwa::utils::ApiBackend::Auto) {
        Ok(cameras) => {
            info!("Found {} camera(s)", cameras.len());
            for (i, camera) in cameras.iter().enumerate() {
                info!("  [{}] {}", i, camera.human_name());
            }
        }
        Err(e) => warn!("Failed to query cameras: {}", e),
    }
}

fn create_visuals() -> egui::Visuals {
    let mut visuals = egui::Visuals::dark();

    visuals.widgets.noninteractive.bg_fill = egui::Color32::from_rgb(30, 30, 35);
    visuals.widgets.inactive.bg_fill = egui::Color32::from_rgb(45, 45, 52);
    visuals.widgets.hovered.bg_fill = egui::Color32::from_rgb(55, 55, 65);
    visuals.widgets.active.bg_fill = egui::Color32::from_rgb(70, 130, 240);

    visuals.widgets.noninteractive.rounding = egui::Rounding::same(8.0);
    visuals.widgets.inactive.rounding = egui::Rounding::same(8.0);
    visuals.widgets.hovered.rounding = egui::Rounding::same(8.0);
    visuals.widgets.active.rounding = egui::Rounding::same(8.0);

    visuals.window_rounding = egui::Rounding::same(12.0);
    visuals.menu_rounding = egui::Rounding::same(8.0);

    visuals
}
