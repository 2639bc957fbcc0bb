// src/app.rs
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Local;
use eframe::egui;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::controller::{Command, ControllerHandle, ControllerSnapshot, Notice, SourceStatus};
use crate::model::ModelAsset;
use crate::ui::{self, Theme, VideoWidget};
use crate::video::FramePreview;

const TOAST_LIFETIME: Duration = Duration::from_secs(5);
const MAX_TOASTS: usize = 4;

pub struct VirtualDresserApp {
    // Controller link
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<ControllerSnapshot>,
    notices: mpsc::UnboundedReceiver<Notice>,
    preview: FramePreview,

    // UI State
    theme: Theme,
    video: VideoWidget,
    toasts: VecDeque<Notice>,
    model_dir: PathBuf,
    model_url: String,
    feedback: String,
    show_skeleton: bool,
    show_about: bool,
}

impl VirtualDresserApp {
    pub fn new(
        _cc: &eframe::CreationContext<'_>,
        handle: ControllerHandle,
        preview: FramePreview,
        model_dir: PathBuf,
    ) -> Self {
        Self {
            commands: handle.commands,
            snapshots: handle.snapshots,
            notices: handle.notices,
            preview,
            theme: Theme::default(),
            video: VideoWidget::new(),
            toasts: VecDeque::new(),
            model_dir,
            model_url: String::new(),
            feedback: String::new(),
            show_skeleton: true,
            show_about: false,
        }
    }

    fn send(&self, command: Command) {
        if let Err(e) = self.commands.try_send(command) {
            warn!("Dropped UI command: {}", e);
        }
    }

    fn pick_model_file(&mut self) {
        let picked = rfd::FileDialog::new()
            .set_title("Upload 3D Model")
            .add_filter("3D model", &["glb", "gltf"])
            .set_directory(&self.model_dir)
            .pick_file();
        if let Some(path) = picked {
            if let Some(parent) = path.parent() {
                self.model_dir = parent.to_path_buf();
            }
            self.send(Command::LoadModel(ModelAsset::from_path(path)));
        }
    }

    fn collect_notices(&mut self) {
        while let Ok(notice) = self.notices.try_recv() {
            self.toasts.push_back(notice);
        }
        let now = Local::now();
        self.toasts.retain(|toast| {
            now.signed_duration_since(toast.at)
                .to_std()
                .map(|age| age < TOAST_LIFETIME)
                .unwrap_or(true)
        });
        while self.toasts.len() > MAX_TOASTS {
            self.toasts.pop_front();
        }
    }

    fn render_header(&mut self, ctx: &egui::Context, snapshot: &ControllerSnapshot) {
        egui::TopBottomPanel::top("header").show(ctx, |ui| {
            ui.add_space(10.0);
            egui::menu::bar(ui, |ui| {
                ui.heading("Virtual Dresser");
                ui.separator();
                ui::draw_status_badge(ui, &snapshot.source_status, &self.theme);

                ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                    if ui.button("ℹ About").clicked() {
                        self.show_about = !self.show_about;
                    }
                });
            });
            ui.add_space(10.0);
        });
    }

    fn render_control_panel(&mut self, ctx: &egui::Context, snapshot: &ControllerSnapshot) {
        egui::SidePanel::right("controls")
            .resizable(false)
            .default_width(320.0)
            .show(ctx, |ui| {
                ui.add_space(10.0);
                ui.heading("Controls");
                ui.add_space(10.0);

                let state = &snapshot.state;
                let source_ready = snapshot.source_status == SourceStatus::Ready;

                let camera_label = if state.camera_enabled { "⏹ Disable Webcam" } else { "🎥 Enable Webcam" };
                let camera_fill = if state.camera_enabled { self.theme.error } else { self.theme.success };
                let camera_button = ui.add_enabled(
                    source_ready || state.camera_enabled,
                    egui::Button::new(camera_label).fill(camera_fill).min_size(egui::vec2(200.0, 36.0)),
                );
                if camera_button.clicked() {
                    self.send(Command::SetCameraEnabled(!state.camera_enabled));
                }

                ui.add_space(10.0);
                ui.group(|ui| {
                    ui.label("Model");
                    match &snapshot.model_name {
                        Some(name) => ui.colored_label(self.theme.text_primary, name),
                        None => ui.colored_label(self.theme.text_secondary, "No model loaded"),
                    };
                    if ui.button("📁 Upload Model (.glb, .gltf)").clicked() {
                        self.pick_model_file();
                    }
                    ui.horizontal(|ui| {
                        ui.text_edit_singleline(&mut self.model_url);
                        if ui.button("Load URL").clicked() && !self.model_url.trim().is_empty() {
                            self.send(Command::LoadModel(ModelAsset::parse(self.model_url.trim())));
                        }
                    });
                });

                ui.add_space(10.0);
                ui.group(|ui| {
                    ui.label("Feedback for the fit advisor");
                    ui.add(
                        egui::TextEdit::multiline(&mut self.feedback)
                            .hint_text("e.g. the shirt sits too low")
                            .desired_rows(3),
                    );
                    if ui.button("Apply Feedback").clicked() {
                        self.send(Command::ProvideFeedback(self.feedback.clone()));
                    }
                    if let Some(active) = &snapshot.feedback {
                        ui.colored_label(self.theme.text_secondary, format!("Active: {}", active));
                    }
                });

                ui.add_space(10.0);
                // Unmet preconditions are reported by the controller as a notice.
                let adjust = ui.add(egui::Button::new("✨ Adjust Fit").min_size(egui::vec2(200.0, 36.0)));
                if adjust.clicked() {
                    self.send(Command::RequestManualAdjustment);
                }
                if state.adjustment_in_flight {
                    ui.horizontal(|ui| {
                        ui.spinner();
                        ui.label("Adjusting fit...");
                    });
                }

                ui.separator();
                ui.heading("Model Parameters");
                let params = state.current_parameters;
                egui::Grid::new("parameters").num_columns(2).show(ui, |ui| {
                    ui.label("Scale");
                    ui.label(format!("{:.2}", params.scale));
                    ui.end_row();
                    ui.label("Rotation Y");
                    ui.label(format!("{:.1}°", params.rotation_y.to_degrees()));
                    ui.end_row();
                    ui.label("Position");
                    ui.label(format!(
                        "{:.2}, {:.2}, {:.2}",
                        params.position_x, params.position_y, params.position_z
                    ));
                    ui.end_row();
                });

                if let Some(reasoning) = &snapshot.last_reasoning {
                    ui.add_space(10.0);
                    ui.label("Advisor reasoning:");
                    ui.colored_label(self.theme.text_secondary, reasoning);
                }

                ui.separator();
                ui.checkbox(&mut self.show_skeleton, "Show pose skeleton");
                if let Some((w, h)) = snapshot.frame_size {
                    ui.colored_label(self.theme.text_secondary, format!("Video: {}×{}", w, h));
                }
            });
    }

    fn render_video_panel(&mut self, ctx: &egui::Context, snapshot: &ControllerSnapshot) {
        let frame = self.preview.borrow().clone();
        self.video.update_frame(ctx, frame.as_ref());

        egui::CentralPanel::default().show(ctx, |ui| {
            let rect = self.video.show(ui);
            let painter = ui.painter_at(rect);

            if self.show_skeleton {
                if let Some(landmarks) = &snapshot.state.current_landmarks {
                    ui::draw_pose_skeleton(&painter, rect, landmarks, &self.theme);
                }
            }
            if snapshot.model_name.is_some() && snapshot.state.camera_enabled {
                ui::draw_model_bounds(&painter, rect, &snapshot.state.current_parameters, &self.theme);
            }
        });
    }

    fn render_toasts(&self, ctx: &egui::Context) {
        for (i, toast) in self.toasts.iter().enumerate() {
            egui::Area::new(egui::Id::new(("toast", i)))
                .anchor(egui::Align2::RIGHT_BOTTOM, egui::vec2(-16.0, -16.0 - 72.0 * i as f32))
                .show(ctx, |ui| {
                    egui::Frame::popup(ui.style())
                        .stroke(egui::Stroke::new(1.5, self.theme.notice_color(toast.level)))
                        .show(ui, |ui| {
                            ui.set_max_width(280.0);
                            ui.strong(&toast.title);
                            ui.label(&toast.description);
                        });
                });
        }
    }

    fn render_about_window(&mut self, ctx: &egui::Context) {
        egui::Window::new("About")
            .open(&mut self.show_about)
            .resizable(false)
            .default_size([400.0, 300.0])
            .show(ctx, |ui| {
                ui.vertical_centered(|ui| {
                    ui.heading("Virtual Dresser");
                    ui.label(format!("Version {}", env!("CARGO_PKG_VERSION")));
                    ui.add_space(20.0);
                    ui.label("Overlays a 3D clothing model on your webcam feed");
                    ui.label("and lets an AI fit advisor adjust it to your pose.");
                });
            });
    }
}

impl eframe::App for VirtualDresserApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        let snapshot = self.snapshots.borrow_and_update().clone();
        self.collect_notices();

        self.render_header(ctx, &snapshot);
        self.render_control_panel(ctx, &snapshot);
        if self.show_about {
            self.render_about_window(ctx);
        }
        self.render_video_panel(ctx, &snapshot);
        self.render_toasts(ctx);

        // Request repaint for continuous updates
        ctx.request_repaint();
    }
}
