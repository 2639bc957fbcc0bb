// src/model.rs - Value types shared by the controller, the pose source and the advisor
use std::fmt;
use std::path::{Path, PathBuf};

use nalgebra::{Matrix4, Rotation3, Translation3, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{AdvisorError, ModelLoadError, PoseError};
use crate::pose::{PoseLandmark, POSE_LANDMARK_COUNT};

/// Scale the renderer applies on top of `ModelParameters::scale`.
/// Clothing assets are typically authored far larger than the scene.
pub const BASE_MODEL_SCALE: f64 = 0.05;

/// Transform of the clothing model. Replaced wholesale on every revision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelParameters {
    pub scale: f64,
    /// Radians about the vertical axis.
    pub rotation_y: f64,
    pub position_x: f64,
    pub position_y: f64,
    pub position_z: f64,
}

impl ModelParameters {
    /// Starting point for every newly loaded model. The advisor adjusts from here.
    pub const DEFAULT: ModelParameters = ModelParameters {
        scale: 20.0,
        rotation_y: 0.0,
        position_x: 0.0,
        position_y: -0.5,
        position_z: 0.0,
    };

    pub fn validate(&self) -> Result<(), AdvisorError> {
        let fields = [
            ("scale", self.scale),
            ("rotationY", self.rotation_y),
            ("positionX", self.position_x),
            ("positionY", self.position_y),
            ("positionZ", self.position_z),
        ];
        for (name, value) in fields {
            if !value.is_finite() {
                return Err(AdvisorError::validation(format!("{name} is not a finite number")));
            }
        }
        if self.scale < 0.0 {
            return Err(AdvisorError::validation(format!(
                "scale must be non-negative, got {}",
                self.scale
            )));
        }
        Ok(())
    }

    /// Homogeneous model matrix: uniform scale, then yaw, then translation.
    pub fn transform(&self) -> Matrix4<f64> {
        let scaling = Matrix4::new_scaling(self.scale * BASE_MODEL_SCALE);
        let rotation = Rotation3::from_axis_angle(&Vector3::y_axis(), self.rotation_y);
        let translation = Translation3::new(self.position_x, self.position_y, self.position_z);
        translation.to_homogeneous() * rotation.to_homogeneous() * scaling
    }
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for ModelParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scale={}, rotationY={}, positionX={}, positionY={}, positionZ={}",
            self.scale, self.rotation_y, self.position_x, self.position_y, self.position_z
        )
    }
}

/// One tracked body landmark.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    /// Normalized X (0.0 - 1.0 of frame width)
    pub x: f32,
    /// Normalized Y (0.0 - 1.0 of frame height)
    pub y: f32,
    /// Depth relative to the hips, roughly in the same scale as x
    pub z: f32,
    /// Confidence (0.0 - 1.0), 0 when the detector does not report one
    #[serde(default)]
    pub visibility: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, z: f32, visibility: f32) -> Self {
        Self { x, y, z, visibility }
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.x as f64, self.y as f64, self.z as f64)
    }
}

/// Keypoints of the single detected person in one video frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Keypoint>", into = "Vec<Keypoint>")]
pub struct LandmarkFrame {
    keypoints: Vec<Keypoint>,
}

impl LandmarkFrame {
    pub fn new(keypoints: Vec<Keypoint>) -> Result<Self, PoseError> {
        if keypoints.len() != POSE_LANDMARK_COUNT {
            return Err(PoseError::unavailable(format!(
                "expected {} landmarks, got {}",
                POSE_LANDMARK_COUNT,
                keypoints.len()
            )));
        }
        Ok(Self { keypoints })
    }

    pub fn from_array(keypoints: [Keypoint; POSE_LANDMARK_COUNT]) -> Self {
        Self {
            keypoints: keypoints.to_vec(),
        }
    }

    pub fn keypoints(&self) -> &[Keypoint] {
        &self.keypoints
    }

    pub fn get(&self, landmark: PoseLandmark) -> &Keypoint {
        &self.keypoints[landmark as usize]
    }
}

impl TryFrom<Vec<Keypoint>> for LandmarkFrame {
    type Error = PoseError;

    fn try_from(keypoints: Vec<Keypoint>) -> Result<Self, Self::Error> {
        Self::new(keypoints)
    }
}

impl From<LandmarkFrame> for Vec<Keypoint> {
    fn from(frame: LandmarkFrame) -> Self {
        frame.keypoints
    }
}

/// Input of a fit advisor call. Built fresh for every call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdjustmentRequest {
    #[serde(rename = "poseLandmarks")]
    pub keypoints: Vec<Keypoint>,
    #[serde(rename = "modelParameters")]
    pub current_parameters: ModelParameters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(rename = "videoWidth")]
    pub frame_width: u32,
    #[serde(rename = "videoHeight")]
    pub frame_height: u32,
}

impl AdjustmentRequest {
    pub fn compose(
        landmarks: &LandmarkFrame,
        current_parameters: ModelParameters,
        feedback: Option<&str>,
        frame_width: u32,
        frame_height: u32,
    ) -> Self {
        Self {
            keypoints: landmarks.keypoints().to_vec(),
            current_parameters,
            feedback: feedback.map(str::to_owned),
            frame_width,
            frame_height,
        }
    }

    /// Landmarks as a validated frame, if the request carries a full set.
    pub fn landmarks(&self) -> Option<LandmarkFrame> {
        LandmarkFrame::new(self.keypoints.clone()).ok()
    }
}

/// Output of a fit advisor call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentResponse {
    #[serde(rename = "updatedModelParameters")]
    pub updated_parameters: ModelParameters,
    pub reasoning: String,
}

impl AdjustmentResponse {
    pub fn validated(self) -> Result<Self, AdvisorError> {
        self.updated_parameters.validate()?;
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelLocation {
    File(PathBuf),
    Url(String),
}

/// A user-supplied 3D clothing model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelAsset {
    pub name: String,
    pub location: ModelLocation,
}

const MODEL_EXTENSIONS: [&str; 2] = ["glb", "gltf"];

impl ModelAsset {
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            name,
            location: ModelLocation::File(path),
        }
    }

    pub fn from_url(url: impl Into<String>) -> Self {
        let url = url.into();
        let name = url
            .split(['?', '#'])
            .next()
            .and_then(|base| base.rsplit('/').next())
            .filter(|segment| !segment.is_empty())
            .unwrap_or(url.as_str())
            .to_string();
        Self {
            name,
            location: ModelLocation::Url(url),
        }
    }

    /// Interprets `http(s)://` strings as URLs and everything else as a path.
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            Self::from_url(trimmed)
        } else {
            Self::from_path(trimmed)
        }
    }

    pub fn verify(&self) -> Result<(), ModelLoadError> {
        let extension = self
            .name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        if !MODEL_EXTENSIONS.contains(&extension.as_str()) {
            return Err(ModelLoadError::UnsupportedFormat(self.name.clone()));
        }
        if let ModelLocation::File(path) = &self.location {
            if !path.is_file() {
                return Err(ModelLoadError::NotFound(path.display().to_string()));
            }
        }
        Ok(())
    }
}
