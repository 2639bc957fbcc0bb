// src/controller.rs - Frame loop controller
//
// A single-owner state machine. Every mutation goes through one of four
// transitions (tick, manual adjustment, model load, camera toggle) or the
// application of a finished fit advisor call. At most one advisor call is
// outstanding at any time; `adjustment_in_flight` is the only guard.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::advisor::FitAdvisor;
use crate::error::{AdvisorError, ManualAdjustRejected, ModelLoadError, PoseError};
use crate::model::{AdjustmentRequest, AdjustmentResponse, LandmarkFrame, ModelAsset, ModelParameters};
use crate::pose::LandmarkSource;
use crate::video::FrameSource;

const COMMAND_BUFFER: usize = 32;

/// What to do with an advisor result that resolves after the context it
/// was requested in has changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StaleResultPolicy {
    /// Always apply, even after the camera was disabled or a new model loaded.
    #[default]
    Apply,
    /// Drop results whose camera session has ended.
    DiscardAfterDisable,
    /// Drop results requested for a previously loaded model.
    DiscardOnModelChange,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Polling interval of the frame loop.
    pub tick_interval: Duration,
    /// Used when a frame reports a zero dimension.
    pub default_frame_size: (u32, u32),
    pub stale_policy: StaleResultPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(16),
            default_frame_size: (640, 480),
            stale_policy: StaleResultPolicy::Apply,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceStatus {
    Initializing,
    Ready,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerState {
    pub camera_enabled: bool,
    pub last_frame_timestamp: Option<Duration>,
    pub adjustment_in_flight: bool,
    pub current_parameters: ModelParameters,
    pub current_landmarks: Option<LandmarkFrame>,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            camera_enabled: false,
            last_frame_timestamp: None,
            adjustment_in_flight: false,
            current_parameters: ModelParameters::DEFAULT,
            current_landmarks: None,
        }
    }
}

/// Read-only view of the controller for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSnapshot {
    pub state: ControllerState,
    pub source_status: SourceStatus,
    pub model_name: Option<String>,
    pub last_reasoning: Option<String>,
    pub feedback: Option<String>,
    pub frame_size: Option<(u32, u32)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Error,
}

/// A user-visible notification.
#[derive(Debug, Clone)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub description: String,
    pub at: DateTime<Local>,
}

impl Notice {
    pub fn info(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Info, title, description)
    }

    pub fn error(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Error, title, description)
    }

    fn new(level: NoticeLevel, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            description: description.into(),
            at: Local::now(),
        }
    }
}

/// Requests from the presentation layer.
#[derive(Debug, Clone)]
pub enum Command {
    SetCameraEnabled(bool),
    LoadModel(ModelAsset),
    RequestManualAdjustment,
    ProvideFeedback(String),
    Shutdown,
}

/// The presentation layer's side of the controller.
pub struct ControllerHandle {
    pub commands: mpsc::Sender<Command>,
    pub snapshots: watch::Receiver<ControllerSnapshot>,
    pub notices: mpsc::UnboundedReceiver<Notice>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustmentTrigger {
    Automatic,
    Manual,
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    CameraDisabled,
    /// The feed lost its stream; the camera was turned off.
    CaptureFailed,
    SourceNotReady,
    NoFrame,
    /// The feed has not advanced since the previous tick.
    StaleFrame,
    DetectionUnavailable,
    NoPerson,
    /// A person was detected but no model is loaded.
    Detected,
    /// A person was detected while an adjustment is still outstanding.
    AdjustmentPending,
    AdjustmentDispatched,
}

/// A resolved advisor call waiting to be applied.
#[derive(Debug)]
pub struct AdjustmentCompletion {
    pub id: Uuid,
    pub trigger: AdjustmentTrigger,
    camera_session: u64,
    model_revision: u64,
    pub result: Result<AdjustmentResponse, AdvisorError>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdjustmentOutcome {
    Applied(ModelParameters),
    Discarded,
    Failed(AdvisorError),
}

enum SourceSlot<S> {
    Pending(S),
    Initializing,
    Ready(S),
    Failed(String),
}

type InitTask<S> = JoinHandle<(S, Result<(), PoseError>)>;

pub struct FrameLoopController<S, F, A> {
    state: ControllerState,
    source: SourceSlot<S>,
    feed: F,
    advisor: Arc<A>,
    config: ControllerConfig,
    model: Option<ModelAsset>,
    model_revision: u64,
    camera_session: u64,
    feedback: Option<String>,
    last_reasoning: Option<String>,
    frame_size: Option<(u32, u32)>,
    clock: Instant,
    last_detection_at: Option<Duration>,
    commands: mpsc::Receiver<Command>,
    completion_tx: mpsc::UnboundedSender<AdjustmentCompletion>,
    completion_rx: mpsc::UnboundedReceiver<AdjustmentCompletion>,
    notices: mpsc::UnboundedSender<Notice>,
    snapshots: watch::Sender<ControllerSnapshot>,
}

impl<S, F, A> FrameLoopController<S, F, A>
where
    S: LandmarkSource,
    F: FrameSource,
    A: FitAdvisor,
{
    pub fn new(source: S, feed: F, advisor: Arc<A>, config: ControllerConfig) -> (Self, ControllerHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(ControllerSnapshot {
            state: ControllerState::default(),
            source_status: SourceStatus::Initializing,
            model_name: None,
            last_reasoning: None,
            feedback: None,
            frame_size: None,
        });

        let controller = Self {
            state: ControllerState::default(),
            source: SourceSlot::Pending(source),
            feed,
            advisor,
            config,
            model: None,
            model_revision: 0,
            camera_session: 0,
            feedback: None,
            last_reasoning: None,
            frame_size: None,
            clock: Instant::now(),
            last_detection_at: None,
            commands: command_rx,
            completion_tx,
            completion_rx,
            notices: notice_tx,
            snapshots: snapshot_tx,
        };
        let handle = ControllerHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
            notices: notice_rx,
        };
        (controller, handle)
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn source_status(&self) -> SourceStatus {
        match &self.source {
            SourceSlot::Pending(_) | SourceSlot::Initializing => SourceStatus::Initializing,
            SourceSlot::Ready(_) => SourceStatus::Ready,
            SourceSlot::Failed(reason) => SourceStatus::Failed(reason.clone()),
        }
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            state: self.state.clone(),
            source_status: self.source_status(),
            model_name: self.model.as_ref().map(|m| m.name.clone()),
            last_reasoning: self.last_reasoning.clone(),
            feedback: self.feedback.clone(),
            frame_size: self.frame_size,
        }
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn notify(&self, notice: Notice) {
        debug!(title = %notice.title, "{}", notice.description);
        // The presentation layer may already be gone during shutdown.
        let _ = self.notices.send(notice);
    }

    /// Load the landmark source in place. `run` does the same in a background task.
    pub async fn initialize(&mut self) -> SourceStatus {
        match std::mem::replace(&mut self.source, SourceSlot::Initializing) {
            SourceSlot::Pending(mut source) => {
                info!("Initializing pose detection...");
                let result = source.initialize().await;
                self.finish_initialization(source, result);
            }
            other => self.source = other,
        }
        self.source_status()
    }

    fn begin_initialization(&mut self) -> Option<InitTask<S>> {
        match std::mem::replace(&mut self.source, SourceSlot::Initializing) {
            SourceSlot::Pending(mut source) => {
                info!("Initializing pose detection...");
                Some(tokio::spawn(async move {
                    let result = source.initialize().await;
                    (source, result)
                }))
            }
            other => {
                self.source = other;
                None
            }
        }
    }

    fn finish_initialization(&mut self, source: S, result: Result<(), PoseError>) {
        match result {
            Ok(()) => {
                info!("✓ Pose detection ready");
                self.source = SourceSlot::Ready(source);
                self.notify(Notice::info("Pose detection ready", "Webcam can now be enabled."));
            }
            Err(e) => self.fail_initialization(e.to_string()),
        }
        self.publish();
    }

    fn fail_initialization(&mut self, reason: String) {
        error!("✗ Pose detection failed to initialize: {}", reason);
        self.source = SourceSlot::Failed(reason);
        self.notify(Notice::error(
            "Initialization Error",
            "Could not initialize pose detection.",
        ));
        self.publish();
    }

    pub fn set_camera_enabled(&mut self, enabled: bool) {
        if enabled == self.state.camera_enabled {
            return;
        }

        if enabled {
            match &self.source {
                SourceSlot::Ready(_) => {}
                SourceSlot::Failed(reason) => {
                    let description = format!("Pose detection is unavailable: {}", reason);
                    self.notify(Notice::error("Cannot enable webcam", description));
                    return;
                }
                SourceSlot::Pending(_) | SourceSlot::Initializing => {
                    self.notify(Notice::info("Please wait", "Pose detection is still initializing."));
                    return;
                }
            }

            if let Err(e) = self.feed.open() {
                error!("Webcam error: {}", e);
                self.state.camera_enabled = false;
                self.notify(Notice::error("Webcam Error", format!("Could not access webcam: {}", e)));
                self.publish();
                return;
            }

            self.camera_session += 1;
            self.state.camera_enabled = true;
            self.state.last_frame_timestamp = None;
            info!(session = self.camera_session, "Camera enabled");
        } else {
            self.feed.close();
            self.state.camera_enabled = false;
            self.state.current_landmarks = None;
            info!(session = self.camera_session, "Camera disabled");
        }
        self.publish();
    }

    pub fn load_model(&mut self, asset: ModelAsset) -> Result<(), ModelLoadError> {
        if let Err(e) = asset.verify() {
            warn!(model = %asset.name, "Rejected model: {}", e);
            self.notify(Notice::error("Model Error", e.to_string()));
            return Err(e);
        }

        info!(model = %asset.name, "Model loaded, parameters reset");
        self.notify(Notice::info("Model Loaded", format!("{} is ready.", asset.name)));
        self.model = Some(asset);
        self.model_revision += 1;
        self.state.current_parameters = ModelParameters::DEFAULT;
        self.last_reasoning = None;
        self.publish();
        Ok(())
    }

    /// Store feedback for subsequent requests. Blank text clears it.
    pub fn provide_feedback(&mut self, text: &str) {
        let trimmed = text.trim();
        self.feedback = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
        debug!(feedback = ?self.feedback, "Feedback updated");
        self.publish();
    }

    pub fn request_manual_adjustment(&mut self) -> Result<Uuid, ManualAdjustRejected> {
        let ready = self.state.camera_enabled
            && self.model.is_some()
            && self.state.current_landmarks.is_some();
        if !ready {
            let rejection = ManualAdjustRejected::NotReady;
            self.notify(Notice::info("Cannot adjust", rejection.to_string()));
            return Err(rejection);
        }
        if self.state.adjustment_in_flight {
            let rejection = ManualAdjustRejected::AlreadyInFlight;
            self.notify(Notice::info("Please wait", rejection.to_string()));
            return Err(rejection);
        }

        let id = self
            .dispatch(AdjustmentTrigger::Manual)
            .ok_or(ManualAdjustRejected::NotReady)?;
        self.publish();
        Ok(id)
    }

    /// One iteration of the frame loop.
    pub fn tick(&mut self) -> TickOutcome {
        if !self.state.camera_enabled {
            return TickOutcome::CameraDisabled;
        }
        if let Some(e) = self.feed.take_error() {
            error!("Webcam error: {}", e);
            self.set_camera_enabled(false);
            self.notify(Notice::error("Webcam Error", format!("Lost access to webcam: {}", e)));
            return TickOutcome::CaptureFailed;
        }
        let SourceSlot::Ready(source) = &mut self.source else {
            return TickOutcome::SourceNotReady;
        };
        let Some(frame) = self.feed.latest_frame() else {
            return TickOutcome::NoFrame;
        };
        if self.state.last_frame_timestamp == Some(frame.timestamp) {
            return TickOutcome::StaleFrame;
        }

        self.state.last_frame_timestamp = Some(frame.timestamp);
        self.frame_size = Some((frame.width, frame.height));

        // Detectors running in video mode need strictly increasing timestamps.
        let mut detect_at = self.clock.elapsed();
        if let Some(previous) = self.last_detection_at {
            detect_at = detect_at.max(previous + Duration::from_millis(1));
        }
        self.last_detection_at = Some(detect_at);

        match source.detect(&frame, detect_at) {
            Ok(landmarks) => self.state.current_landmarks = landmarks,
            Err(e) => {
                debug!("Skipping tick: {}", e);
                self.publish();
                return TickOutcome::DetectionUnavailable;
            }
        }

        let outcome = if self.state.current_landmarks.is_none() {
            TickOutcome::NoPerson
        } else if self.model.is_none() {
            TickOutcome::Detected
        } else if self.state.adjustment_in_flight {
            TickOutcome::AdjustmentPending
        } else if self.dispatch(AdjustmentTrigger::Automatic).is_some() {
            TickOutcome::AdjustmentDispatched
        } else {
            TickOutcome::Detected
        };
        self.publish();
        outcome
    }

    fn request_frame_size(&self) -> (u32, u32) {
        let (default_w, default_h) = self.config.default_frame_size;
        let (w, h) = self.frame_size.unwrap_or((0, 0));
        (
            if w == 0 { default_w } else { w },
            if h == 0 { default_h } else { h },
        )
    }

    fn dispatch(&mut self, trigger: AdjustmentTrigger) -> Option<Uuid> {
        let landmarks = self.state.current_landmarks.as_ref()?;
        let (width, height) = self.request_frame_size();
        let request = AdjustmentRequest::compose(
            landmarks,
            self.state.current_parameters,
            self.feedback.as_deref(),
            width,
            height,
        );

        let id = Uuid::new_v4();
        self.state.adjustment_in_flight = true;

        let advisor = Arc::clone(&self.advisor);
        let completions = self.completion_tx.clone();
        let camera_session = self.camera_session;
        let model_revision = self.model_revision;
        let span = info_span!("adjustment", %id, ?trigger);

        tokio::spawn(
            async move {
                let started = Instant::now();
                let result = advisor.improve_fit(&request).await;
                debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    ok = result.is_ok(),
                    "Advisor call resolved"
                );
                let _ = completions.send(AdjustmentCompletion {
                    id,
                    trigger,
                    camera_session,
                    model_revision,
                    result,
                });
            }
            .instrument(span),
        );

        info!(%id, ?trigger, "Dispatched fit adjustment");
        Some(id)
    }

    fn accepts(&self, camera_session: u64, model_revision: u64) -> bool {
        match self.config.stale_policy {
            StaleResultPolicy::Apply => true,
            StaleResultPolicy::DiscardAfterDisable => {
                self.state.camera_enabled && camera_session == self.camera_session
            }
            StaleResultPolicy::DiscardOnModelChange => model_revision == self.model_revision,
        }
    }

    /// Apply a resolved advisor call. Clears the in-flight flag in every case.
    pub fn apply_completion(&mut self, completion: AdjustmentCompletion) -> AdjustmentOutcome {
        let AdjustmentCompletion {
            id,
            trigger,
            camera_session,
            model_revision,
            result,
        } = completion;
        self.state.adjustment_in_flight = false;

        let outcome = match result.and_then(AdjustmentResponse::validated) {
            Ok(advice) if self.accepts(camera_session, model_revision) => {
                let parameters = advice.updated_parameters;
                info!(%id, %parameters, "Applied fit adjustment");
                debug!(%id, reasoning = %advice.reasoning);
                self.state.current_parameters = parameters;
                self.last_reasoning = Some(advice.reasoning);
                if trigger == AdjustmentTrigger::Manual {
                    self.notify(Notice::info(
                        "Model Re-Adjusted",
                        "AI has updated the model fit based on current pose.",
                    ));
                }
                AdjustmentOutcome::Applied(parameters)
            }
            Ok(_) => {
                info!(%id, policy = ?self.config.stale_policy, "Discarded stale fit adjustment");
                AdjustmentOutcome::Discarded
            }
            Err(e) => {
                warn!(%id, "Error adjusting model fit: {}", e);
                let description = match trigger {
                    AdjustmentTrigger::Automatic => "Could not adjust model fit.",
                    AdjustmentTrigger::Manual => "Could not re-adjust model fit.",
                };
                self.notify(Notice::error("AI Error", description));
                AdjustmentOutcome::Failed(e)
            }
        };

        self.publish();
        outcome
    }

    /// Wait for the outstanding advisor call and apply it.
    pub async fn await_adjustment(&mut self) -> Option<AdjustmentOutcome> {
        let completion = self.completion_rx.recv().await?;
        Some(self.apply_completion(completion))
    }

    pub fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetCameraEnabled(enabled) => self.set_camera_enabled(enabled),
            Command::LoadModel(asset) => {
                let _ = self.load_model(asset);
            }
            Command::RequestManualAdjustment => {
                let _ = self.request_manual_adjustment();
            }
            Command::ProvideFeedback(text) => self.provide_feedback(&text),
            Command::Shutdown => {}
        }
    }

    /// Drive the controller until `Shutdown` or until every handle is dropped.
    pub async fn run(mut self) {
        let mut init = self.begin_initialization();
        self.publish();

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_ms = self.config.tick_interval.as_millis() as u64, "Frame loop started");

        loop {
            tokio::select! {
                joined = async {
                    match init.as_mut() {
                        Some(task) => task.await,
                        None => std::future::pending().await,
                    }
                }, if init.is_some() => {
                    init = None;
                    match joined {
                        Ok((source, result)) => self.finish_initialization(source, result),
                        Err(e) => self.fail_initialization(format!("initialization task failed: {}", e)),
                    }
                }
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => {
                        let was_enabled = self.state.camera_enabled;
                        self.handle_command(command);
                        if !was_enabled && self.state.camera_enabled {
                            ticker.reset();
                        }
                    }
                },
                Some(completion) = self.completion_rx.recv() => {
                    self.apply_completion(completion);
                }
                _ = ticker.tick(), if self.state.camera_enabled => {
                    self.tick();
                }
            }
        }

        if self.state.camera_enabled {
            self.feed.close();
        }
        info!("Frame loop stopped");
    }
}
