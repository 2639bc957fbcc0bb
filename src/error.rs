// src/error.rs
use thiserror::Error;

/// Failures of the landmark source.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PoseError {
    /// The detector could not be loaded. Camera control stays disabled.
    #[error("pose detection failed to initialize: {0}")]
    InitializationFailure(String),

    /// Transient detection problem; the tick is skipped.
    #[error("pose detection unavailable: {0}")]
    DetectionUnavailable(String),
}

impl PoseError {
    pub fn init(msg: impl Into<String>) -> Self {
        Self::InitializationFailure(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::DetectionUnavailable(msg.into())
    }
}

/// Failures of a fit advisor call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AdvisorError {
    /// Network error, timeout or a non-success status.
    #[error("fit advisor transport failure: {0}")]
    TransportFailure(String),

    /// The response did not match the expected numeric schema.
    #[error("fit advisor returned an invalid response: {0}")]
    ValidationFailure(String),

    #[error("fit advisor is not configured: {0}")]
    NotConfigured(String),
}

impl AdvisorError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::TransportFailure(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationFailure(msg.into())
    }

    /// Transport failures may succeed on a later call; validation
    /// failures usually mean the model misunderstood the contract.
    pub fn is_transient(&self) -> bool {
        matches!(self, AdvisorError::TransportFailure(_))
    }
}

/// Failures opening or reading the video feed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CaptureError {
    #[error("camera access denied: {0}")]
    PermissionDenied(String),

    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Why a clothing model could not be loaded.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelLoadError {
    #[error("unsupported model format '{0}' (expected .glb or .gltf)")]
    UnsupportedFormat(String),

    #[error("model file not found: {0}")]
    NotFound(String),
}

/// Why a manual adjustment request was turned down.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ManualAdjustRejected {
    #[error("enable the webcam, load a model, and make sure a pose is detected")]
    NotReady,

    #[error("an adjustment is already in progress")]
    AlreadyInFlight,
}
