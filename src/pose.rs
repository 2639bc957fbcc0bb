// src/pose.rs - Landmark source contract, BlazePose topology and a simulated source
use std::time::Duration;

use async_trait::async_trait;
use nalgebra::Vector3;
use tracing::info;

use crate::error::PoseError;
use crate::model::{Keypoint, LandmarkFrame};
use crate::video::VideoFrame;

/// Keypoints per detected person (MediaPipe BlazePose).
pub const POSE_LANDMARK_COUNT: usize = 33;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum PoseLandmark {
    Nose = 0,
    LeftEyeInner = 1,
    LeftEye = 2,
    LeftEyeOuter = 3,
    RightEyeInner = 4,
    RightEye = 5,
    RightEyeOuter = 6,
    LeftEar = 7,
    RightEar = 8,
    MouthLeft = 9,
    MouthRight = 10,
    LeftShoulder = 11,
    RightShoulder = 12,
    LeftElbow = 13,
    RightElbow = 14,
    LeftWrist = 15,
    RightWrist = 16,
    LeftPinky = 17,
    RightPinky = 18,
    LeftIndex = 19,
    RightIndex = 20,
    LeftThumb = 21,
    RightThumb = 22,
    LeftHip = 23,
    RightHip = 24,
    LeftKnee = 25,
    RightKnee = 26,
    LeftAnkle = 27,
    RightAnkle = 28,
    LeftHeel = 29,
    RightHeel = 30,
    LeftFootIndex = 31,
    RightFootIndex = 32,
}

/// Bones drawn by the skeleton overlay.
pub const POSE_CONNECTIONS: [(PoseLandmark, PoseLandmark); 22] = {
    use PoseLandmark::*;
    [
        (LeftShoulder, RightShoulder),
        (LeftShoulder, LeftElbow),
        (LeftElbow, LeftWrist),
        (RightShoulder, RightElbow),
        (RightElbow, RightWrist),
        (LeftShoulder, LeftHip),
        (RightShoulder, RightHip),
        (LeftHip, RightHip),
        (LeftHip, LeftKnee),
        (LeftKnee, LeftAnkle),
        (RightHip, RightKnee),
        (RightKnee, RightAnkle),
        (LeftAnkle, LeftHeel),
        (LeftHeel, LeftFootIndex),
        (RightAnkle, RightHeel),
        (RightHeel, RightFootIndex),
        (LeftWrist, LeftIndex),
        (RightWrist, RightIndex),
        (Nose, LeftEye),
        (Nose, RightEye),
        (LeftEye, LeftEar),
        (RightEye, RightEar),
    ]
};

/// Produces body keypoints for video frames.
///
/// `initialize` is awaited once before the first `detect`. `detect` runs
/// inside a controller tick and must return before the tick completes.
#[async_trait]
pub trait LandmarkSource: Send + 'static {
    async fn initialize(&mut self) -> Result<(), PoseError>;

    /// `Ok(None)` means no person was found in this frame.
    fn detect(
        &mut self,
        frame: &VideoFrame,
        timestamp: Duration,
    ) -> Result<Option<LandmarkFrame>, PoseError>;
}

#[async_trait]
impl LandmarkSource for Box<dyn LandmarkSource> {
    async fn initialize(&mut self) -> Result<(), PoseError> {
        (**self).initialize().await
    }

    fn detect(
        &mut self,
        frame: &VideoFrame,
        timestamp: Duration,
    ) -> Result<Option<LandmarkFrame>, PoseError> {
        (**self).detect(frame, timestamp)
    }
}

/// Body measurements derived from one landmark frame, in normalized units.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseSummary {
    pub shoulder_center: Vector3<f64>,
    pub shoulder_width: f64,
    pub hip_center: Vector3<f64>,
    pub hip_width: f64,
    /// Distance between shoulder center and hip center.
    pub torso_length: f64,
    /// Estimated yaw in radians, positive when the left shoulder is nearer the camera.
    pub body_yaw: f64,
    /// Mean visibility of shoulders and hips.
    pub torso_visibility: f64,
}

impl PoseSummary {
    pub fn from_landmarks(frame: &LandmarkFrame) -> Self {
        let ls = frame.get(PoseLandmark::LeftShoulder);
        let rs = frame.get(PoseLandmark::RightShoulder);
        let lh = frame.get(PoseLandmark::LeftHip);
        let rh = frame.get(PoseLandmark::RightHip);

        let shoulder_center = (ls.position() + rs.position()) / 2.0;
        let hip_center = (lh.position() + rh.position()) / 2.0;

        let planar = |a: &Keypoint, b: &Keypoint| {
            let d = a.position() - b.position();
            (d.x * d.x + d.y * d.y).sqrt()
        };

        let torso = shoulder_center - hip_center;
        let body_yaw = ((rs.z - ls.z) as f64).atan2((ls.x - rs.x) as f64);

        Self {
            shoulder_center,
            shoulder_width: planar(ls, rs),
            hip_center,
            hip_width: planar(lh, rh),
            torso_length: (torso.x * torso.x + torso.y * torso.y).sqrt(),
            body_yaw,
            torso_visibility: [ls, rs, lh, rh]
                .iter()
                .map(|k| k.visibility as f64)
                .sum::<f64>()
                / 4.0,
        }
    }
}

// Standing person facing the camera, normalized image coordinates.
const BASE_POSE: [[f32; 2]; POSE_LANDMARK_COUNT] = [
    [0.500, 0.180],
    [0.510, 0.160],
    [0.520, 0.160],
    [0.530, 0.160],
    [0.490, 0.160],
    [0.480, 0.160],
    [0.470, 0.160],
    [0.545, 0.170],
    [0.455, 0.170],
    [0.515, 0.210],
    [0.485, 0.210],
    [0.600, 0.300],
    [0.400, 0.300],
    [0.640, 0.420],
    [0.360, 0.420],
    [0.660, 0.530],
    [0.340, 0.530],
    [0.670, 0.560],
    [0.330, 0.560],
    [0.665, 0.565],
    [0.335, 0.565],
    [0.655, 0.550],
    [0.345, 0.550],
    [0.570, 0.580],
    [0.430, 0.580],
    [0.575, 0.730],
    [0.425, 0.730],
    [0.580, 0.880],
    [0.420, 0.880],
    [0.575, 0.900],
    [0.425, 0.900],
    [0.590, 0.920],
    [0.410, 0.920],
];

/// Deterministic stand-in for a real detector: a standing figure that
/// sways and turns slowly. Used for demos and when no bridge is configured.
pub struct SimulatedPoseSource {
    init_delay: Duration,
    absence: Option<Duration>,
    ready: bool,
}

impl SimulatedPoseSource {
    pub fn new() -> Self {
        Self {
            init_delay: Duration::ZERO,
            absence: None,
            ready: false,
        }
    }

    /// Simulated model loading time.
    pub fn with_init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = delay;
        self
    }

    /// The figure leaves the frame for the last quarter of every `period`.
    pub fn with_absence(mut self, period: Duration) -> Self {
        self.absence = Some(period);
        self
    }

    pub fn pose_at(timestamp: Duration) -> LandmarkFrame {
        let t = timestamp.as_secs_f32();
        let sway = 0.03 * (0.8 * t).sin();
        let yaw = 0.25 * (0.5 * t).sin();
        let center_x = 0.5;

        let keypoints = std::array::from_fn(|i| {
            let [x, y] = BASE_POSE[i];
            let offset = x - center_x;
            let visibility = if i >= PoseLandmark::LeftAnkle as usize { 0.7 } else { 0.95 };
            Keypoint::new(
                center_x + sway + offset * yaw.cos(),
                y + 0.005 * (1.6 * t).sin(),
                -offset * yaw.sin(),
                visibility,
            )
        });

        LandmarkFrame::from_array(keypoints)
    }

    fn person_present(&self, timestamp: Duration) -> bool {
        match self.absence {
            Some(period) if !period.is_zero() => {
                let phase = timestamp.as_secs_f64() % period.as_secs_f64();
                phase < period.as_secs_f64() * 0.75
            }
            _ => true,
        }
    }
}

impl Default for SimulatedPoseSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LandmarkSource for SimulatedPoseSource {
    async fn initialize(&mut self) -> Result<(), PoseError> {
        if !self.init_delay.is_zero() {
            tokio::time::sleep(self.init_delay).await;
        }
        self.ready = true;
        info!("Simulated pose source ready");
        Ok(())
    }

    fn detect(
        &mut self,
        frame: &VideoFrame,
        _timestamp: Duration,
    ) -> Result<Option<LandmarkFrame>, PoseError> {
        if !self.ready {
            return Err(PoseError::unavailable("simulated source not initialized"));
        }
        if !self.person_present(frame.timestamp) {
            return Ok(None);
        }
        Ok(Some(Self::pose_at(frame.timestamp)))
    }
}
