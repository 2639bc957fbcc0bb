// src/ui.rs - Theme, video widget and overlay drawing
use eframe::egui::{self, Color32, Pos2, Rect, Stroke, Vec2};
use nalgebra::{Point3, Vector3};

use crate::controller::{NoticeLevel, SourceStatus};
use crate::model::{Keypoint, LandmarkFrame, ModelParameters};
use crate::pose::POSE_CONNECTIONS;
use crate::video::VideoFrame;

/// Landmarks below this visibility are not drawn.
const MIN_DRAW_VISIBILITY: f32 = 0.3;

// Virtual scene camera: looking down -Z from z = 2.5 with a 50° vertical fov.
const SCENE_CAMERA_Z: f64 = 2.5;
const SCENE_FOV_Y_DEGREES: f64 = 50.0;

#[derive(Debug, Clone)]
pub struct Theme {
    pub primary: Color32,
    pub secondary: Color32,
    pub background: Color32,
    pub surface: Color32,
    pub error: Color32,
    pub warning: Color32,
    pub success: Color32,
    pub text_primary: Color32,
    pub text_secondary: Color32,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            primary: Color32::from_rgb(70, 130, 240),
            secondary: Color32::from_rgb(255, 152, 0),
            background: Color32::from_rgb(20, 20, 25),
            surface: Color32::from_rgb(30, 30, 35),
            error: Color32::from_rgb(244, 67, 54),
            warning: Color32::from_rgb(255, 152, 0),
            success: Color32::from_rgb(76, 175, 80),
            text_primary: Color32::WHITE,
            text_secondary: Color32::from_rgb(200, 200, 200),
        }
    }
}

impl Theme {
    pub fn status_color(&self, status: &SourceStatus) -> Color32 {
        match status {
            SourceStatus::Initializing => self.warning,
            SourceStatus::Ready => self.success,
            SourceStatus::Failed(_) => self.error,
        }
    }

    pub fn notice_color(&self, level: NoticeLevel) -> Color32 {
        match level {
            NoticeLevel::Info => self.primary,
            NoticeLevel::Error => self.error,
        }
    }
}

pub fn frame_to_color_image(frame: &VideoFrame) -> egui::ColorImage {
    egui::ColorImage::from_rgb(
        [frame.width as usize, frame.height as usize],
        frame.image.as_raw(),
    )
}

// Custom widget for video display
pub struct VideoWidget {
    texture: Option<egui::TextureHandle>,
    shown_timestamp: Option<std::time::Duration>,
    aspect_ratio: f32,
}

impl Default for VideoWidget {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoWidget {
    pub fn new() -> Self {
        Self {
            texture: None,
            shown_timestamp: None,
            aspect_ratio: 4.0 / 3.0,
        }
    }

    /// Upload a frame unless it is the one already on screen.
    pub fn update_frame(&mut self, ctx: &egui::Context, frame: Option<&VideoFrame>) {
        let Some(frame) = frame else {
            self.texture = None;
            self.shown_timestamp = None;
            return;
        };
        if self.shown_timestamp == Some(frame.timestamp) {
            return;
        }

        let image = frame_to_color_image(frame);
        match self.texture.as_mut() {
            Some(texture) => texture.set(image, egui::TextureOptions::LINEAR),
            None => {
                self.texture = Some(ctx.load_texture("video_frame", image, egui::TextureOptions::LINEAR));
            }
        }
        if frame.height > 0 {
            self.aspect_ratio = frame.width as f32 / frame.height as f32;
        }
        self.shown_timestamp = Some(frame.timestamp);
    }

    /// Draw the frame (or a placeholder) and return the area it occupies.
    pub fn show(&self, ui: &mut egui::Ui) -> Rect {
        let available = ui.available_size();
        let mut size = Vec2::new(available.x, available.x / self.aspect_ratio);
        if size.y > available.y && available.y > 0.0 {
            size = Vec2::new(available.y * self.aspect_ratio, available.y);
        }
        let (rect, _response) = ui.allocate_exact_size(size, egui::Sense::hover());

        if let Some(texture) = &self.texture {
            ui.painter().image(
                texture.id(),
                rect,
                Rect::from_min_max(Pos2::ZERO, Pos2::new(1.0, 1.0)),
                Color32::WHITE,
            );
        } else {
            ui.painter().rect_filled(rect, egui::Rounding::same(4.0), Color32::from_rgb(50, 50, 55));
            ui.painter().text(
                rect.center(),
                egui::Align2::CENTER_CENTER,
                "Webcam is off",
                egui::FontId::proportional(16.0),
                Color32::from_rgb(150, 150, 155),
            );
        }
        rect
    }
}

fn landmark_to_screen(rect: Rect, keypoint: &Keypoint) -> Pos2 {
    Pos2::new(
        rect.left() + keypoint.x * rect.width(),
        rect.top() + keypoint.y * rect.height(),
    )
}

pub fn draw_pose_skeleton(painter: &egui::Painter, rect: Rect, landmarks: &LandmarkFrame, theme: &Theme) {
    let keypoints = landmarks.keypoints();

    for (from, to) in POSE_CONNECTIONS {
        let (a, b) = (landmarks.get(from), landmarks.get(to));
        if a.visibility < MIN_DRAW_VISIBILITY || b.visibility < MIN_DRAW_VISIBILITY {
            continue;
        }
        painter.line_segment(
            [landmark_to_screen(rect, a), landmark_to_screen(rect, b)],
            Stroke::new(2.0, theme.primary),
        );
    }

    for keypoint in keypoints.iter().filter(|k| k.visibility >= MIN_DRAW_VISIBILITY) {
        painter.circle_filled(landmark_to_screen(rect, keypoint), 3.5, theme.secondary);
    }
}

/// Perspective projection of a scene point onto the video rect.
fn project(rect: Rect, point: &Point3<f64>) -> Option<Pos2> {
    let depth = SCENE_CAMERA_Z - point.z;
    if depth <= 1e-3 {
        return None;
    }
    let half_height = depth * (SCENE_FOV_Y_DEGREES.to_radians() / 2.0).tan();
    let aspect = (rect.width() / rect.height().max(1.0)) as f64;
    let ndc_x = point.x / (half_height * aspect);
    let ndc_y = point.y / half_height;
    Some(Pos2::new(
        rect.center().x + (ndc_x as f32) * rect.width() / 2.0,
        rect.center().y - (ndc_y as f32) * rect.height() / 2.0,
    ))
}

/// Wireframe stand-in for the loaded model: a torso-sized box placed
/// with the current parameters.
pub fn draw_model_bounds(painter: &egui::Painter, rect: Rect, parameters: &ModelParameters, theme: &Theme) {
    let transform = parameters.transform();
    let corners: Vec<Option<Pos2>> = (0..8)
        .map(|i| {
            let local = Vector3::new(
                if i & 1 == 0 { -0.4 } else { 0.4 },
                if i & 2 == 0 { -0.5 } else { 0.5 },
                if i & 4 == 0 { -0.2 } else { 0.2 },
            );
            let world = transform.transform_point(&Point3::from(local));
            project(rect, &world)
        })
        .collect();

    let stroke = Stroke::new(1.5, theme.success);
    for i in 0..8usize {
        for bit in [1usize, 2, 4] {
            let j = i | bit;
            if j == i {
                continue;
            }
            if let (Some(a), Some(b)) = (corners[i], corners[j]) {
                painter.line_segment([a, b], stroke);
            }
        }
    }
}

pub fn draw_status_badge(ui: &mut egui::Ui, status: &SourceStatus, theme: &Theme) {
    let (text, color) = match status {
        SourceStatus::Initializing => ("Initializing pose detection...".to_string(), theme.status_color(status)),
        SourceStatus::Ready => ("Pose detection ready".to_string(), theme.status_color(status)),
        SourceStatus::Failed(reason) => (format!("Pose detection failed: {}", reason), theme.status_color(status)),
    };
    ui.horizontal(|ui| {
        let (dot, _) = ui.allocate_exact_size(Vec2::splat(12.0), egui::Sense::hover());
        ui.painter().circle_filled(dot.center(), 5.0, color);
        ui.colored_label(theme.text_secondary, text);
    });
}
