use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::sync::Semaphore;
use tokio_test::{assert_err, assert_ok};

use virtual_dresser::advisor::FitAdvisor;
use virtual_dresser::controller::{
    AdjustmentOutcome, Command, ControllerConfig, ControllerHandle, FrameLoopController, Notice,
    NoticeLevel, SourceStatus, StaleResultPolicy, TickOutcome,
};
use virtual_dresser::error::{AdvisorError, CaptureError, ManualAdjustRejected, PoseError};
use virtual_dresser::model::{
    AdjustmentRequest, AdjustmentResponse, LandmarkFrame, ModelAsset, ModelParameters,
};
use virtual_dresser::pose::{LandmarkSource, SimulatedPoseSource};
use virtual_dresser::video::{CaptureFormat, FrameSource, SyntheticFeed, VideoFrame};

// ---------------------------------------------------------------------------
// Stubs
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct SourceScript {
    person_absent: Arc<AtomicBool>,
    detection_fails: Arc<AtomicBool>,
    detect_calls: Arc<AtomicUsize>,
}

struct ScriptedSource {
    script: SourceScript,
    init_result: Result<(), PoseError>,
    init_delay: Duration,
}

impl ScriptedSource {
    fn ready(script: &SourceScript) -> Self {
        Self {
            script: script.clone(),
            init_result: Ok(()),
            init_delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl LandmarkSource for ScriptedSource {
    async fn initialize(&mut self) -> Result<(), PoseError> {
        if !self.init_delay.is_zero() {
            tokio::time::sleep(self.init_delay).await;
        }
        self.init_result.clone()
    }

    fn detect(&mut self, frame: &VideoFrame, _timestamp: Duration) -> Result<Option<LandmarkFrame>, PoseError> {
        self.script.detect_calls.fetch_add(1, Ordering::SeqCst);
        if self.script.detection_fails.load(Ordering::SeqCst) {
            return Err(PoseError::unavailable("detector busy"));
        }
        if self.script.person_absent.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(SimulatedPoseSource::pose_at(frame.timestamp)))
    }
}

/// Feed whose clock only moves when the test advances it.
#[derive(Clone)]
struct ManualFeed {
    timestamp: Arc<Mutex<Duration>>,
    size: (u32, u32),
    open: Arc<AtomicBool>,
    open_error: Option<CaptureError>,
    stream_error: Arc<Mutex<Option<CaptureError>>>,
}

impl ManualFeed {
    fn new() -> Self {
        Self {
            timestamp: Arc::new(Mutex::new(Duration::from_millis(33))),
            size: (64, 48),
            open: Arc::new(AtomicBool::new(false)),
            open_error: None,
            stream_error: Arc::new(Mutex::new(None)),
        }
    }

    fn advance(&self) {
        *self.timestamp.lock().unwrap() += Duration::from_millis(33);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Simulate the device disappearing while streaming.
    fn lose_stream(&self, error: CaptureError) {
        *self.stream_error.lock().unwrap() = Some(error);
    }
}

impl FrameSource for ManualFeed {
    fn open(&mut self) -> Result<(), CaptureError> {
        if let Some(e) = &self.open_error {
            return Err(e.clone());
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn latest_frame(&self) -> Option<VideoFrame> {
        if !self.is_open() {
            return None;
        }
        let timestamp = *self.timestamp.lock().unwrap();
        Some(VideoFrame::blank(self.size.0, self.size.1, timestamp))
    }

    fn take_error(&mut self) -> Option<CaptureError> {
        self.stream_error.lock().unwrap().take()
    }
}

/// Advisor that records every request and answers only when released.
struct GatedAdvisor {
    requests: Mutex<Vec<AdjustmentRequest>>,
    replies: Mutex<VecDeque<Result<AdjustmentResponse, AdvisorError>>>,
    gate: Semaphore,
}

impl GatedAdvisor {
    fn gated() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            replies: Mutex::new(VecDeque::new()),
            gate: Semaphore::new(0),
        })
    }

    fn open() -> Arc<Self> {
        let advisor = Self::gated();
        advisor.release(1000);
        advisor
    }

    fn release(&self, calls: usize) {
        self.gate.add_permits(calls);
    }

    fn reply(&self, reply: Result<AdjustmentResponse, AdvisorError>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn last_request(&self) -> AdjustmentRequest {
        self.requests.lock().unwrap().last().cloned().expect("no advisor call recorded")
    }
}

#[async_trait]
impl FitAdvisor for GatedAdvisor {
    async fn improve_fit(&self, request: &AdjustmentRequest) -> Result<AdjustmentResponse, AdvisorError> {
        self.requests.lock().unwrap().push(request.clone());
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| AdvisorError::transport(e.to_string()))?;
        permit.forget();
        let reply = self.replies.lock().unwrap().pop_front();
        reply.unwrap_or_else(|| Ok(advice(24.0, "default reply")))
    }
}

fn advice(scale: f64, reasoning: &str) -> AdjustmentResponse {
    AdjustmentResponse {
        updated_parameters: ModelParameters {
            scale,
            rotation_y: 0.1,
            position_x: 0.02,
            position_y: -0.4,
            position_z: 0.0,
        },
        reasoning: reasoning.to_string(),
    }
}

fn model_file() -> NamedTempFile {
    tempfile::Builder::new()
        .prefix("shirt")
        .suffix(".glb")
        .tempfile()
        .unwrap()
}

type TestController = FrameLoopController<ScriptedSource, ManualFeed, GatedAdvisor>;

struct Harness {
    controller: TestController,
    handle: ControllerHandle,
    script: SourceScript,
    feed: ManualFeed,
    advisor: Arc<GatedAdvisor>,
    model: NamedTempFile,
}

impl Harness {
    async fn with_config(advisor: Arc<GatedAdvisor>, config: ControllerConfig) -> Self {
        let script = SourceScript::default();
        let feed = ManualFeed::new();
        let (mut controller, handle) =
            FrameLoopController::new(ScriptedSource::ready(&script), feed.clone(), Arc::clone(&advisor), config);
        assert_eq!(controller.initialize().await, SourceStatus::Ready);
        Self {
            controller,
            handle,
            script,
            feed,
            advisor,
            model: model_file(),
        }
    }

    async fn new(advisor: Arc<GatedAdvisor>) -> Self {
        Self::with_config(advisor, ControllerConfig::default()).await
    }

    /// Camera on and a model loaded: the next tick with a person dispatches.
    async fn armed(advisor: Arc<GatedAdvisor>) -> Self {
        let mut harness = Self::new(advisor).await;
        harness.controller.set_camera_enabled(true);
        assert_ok!(harness.controller.load_model(ModelAsset::from_path(harness.model.path())));
        harness.drain_notices();
        harness
    }

    fn next_tick(&mut self) -> TickOutcome {
        self.feed.advance();
        self.controller.tick()
    }

    async fn settle(&mut self) -> AdjustmentOutcome {
        tokio::time::timeout(Duration::from_secs(5), self.controller.await_adjustment())
            .await
            .expect("adjustment did not resolve")
            .expect("completion channel closed")
    }

    fn drain_notices(&mut self) -> Vec<Notice> {
        let mut notices = Vec::new();
        while let Ok(notice) = self.handle.notices.try_recv() {
            notices.push(notice);
        }
        notices
    }
}

// ---------------------------------------------------------------------------
// Tick scheduling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn disabled_camera_never_detects_or_calls_the_advisor() {
    let mut h = Harness::new(GatedAdvisor::open()).await;
    assert_ok!(h.controller.load_model(ModelAsset::from_path(h.model.path())));

    for _ in 0..10 {
        assert_eq!(h.next_tick(), TickOutcome::CameraDisabled);
    }
    assert_eq!(h.script.detect_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.advisor.calls(), 0);
}

#[tokio::test]
async fn unchanged_frame_is_processed_once() {
    let mut h = Harness::new(GatedAdvisor::open()).await;
    h.controller.set_camera_enabled(true);

    assert_eq!(h.controller.tick(), TickOutcome::Detected);
    for _ in 0..5 {
        assert_eq!(h.controller.tick(), TickOutcome::StaleFrame);
    }
    assert_eq!(h.script.detect_calls.load(Ordering::SeqCst), 1);

    let before = h.controller.snapshot();
    assert_eq!(h.controller.tick(), TickOutcome::StaleFrame);
    assert_eq!(h.controller.snapshot(), before);
}

#[tokio::test]
async fn landmarks_without_a_model_do_not_call_the_advisor() {
    let mut h = Harness::new(GatedAdvisor::open()).await;
    h.controller.set_camera_enabled(true);

    assert_eq!(h.next_tick(), TickOutcome::Detected);
    assert!(h.controller.state().current_landmarks.is_some());
    assert_eq!(h.advisor.calls(), 0);
    assert!(!h.controller.state().adjustment_in_flight);
}

#[tokio::test]
async fn absent_person_leaves_parameters_untouched() {
    let mut h = Harness::armed(GatedAdvisor::open()).await;
    h.script.person_absent.store(true, Ordering::SeqCst);

    for _ in 0..5 {
        assert_eq!(h.next_tick(), TickOutcome::NoPerson);
    }
    assert_eq!(h.controller.state().current_parameters, ModelParameters::DEFAULT);
    assert!(h.controller.state().current_landmarks.is_none());
    assert_eq!(h.advisor.calls(), 0);
}

#[tokio::test]
async fn detection_failure_skips_the_tick() {
    let mut h = Harness::armed(GatedAdvisor::open()).await;
    h.script.detection_fails.store(true, Ordering::SeqCst);

    assert_eq!(h.next_tick(), TickOutcome::DetectionUnavailable);
    assert!(!h.controller.state().adjustment_in_flight);
    assert!(h.drain_notices().is_empty());

    h.script.detection_fails.store(false, Ordering::SeqCst);
    assert_eq!(h.next_tick(), TickOutcome::AdjustmentDispatched);
}

// ---------------------------------------------------------------------------
// Mutual exclusion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn only_one_adjustment_is_outstanding() {
    let advisor = GatedAdvisor::gated();
    let mut h = Harness::armed(Arc::clone(&advisor)).await;

    assert_eq!(h.next_tick(), TickOutcome::AdjustmentDispatched);
    assert!(h.controller.state().adjustment_in_flight);
    for _ in 0..5 {
        assert_eq!(h.next_tick(), TickOutcome::AdjustmentPending);
    }

    advisor.reply(Ok(advice(22.0, "slightly larger")));
    advisor.release(1);
    assert_eq!(h.settle().await, AdjustmentOutcome::Applied(advice(22.0, "").updated_parameters));

    assert_eq!(advisor.calls(), 1);
    assert!(!h.controller.state().adjustment_in_flight);
    assert_eq!(h.controller.state().current_parameters.scale, 22.0);
    assert_eq!(h.controller.snapshot().last_reasoning.as_deref(), Some("slightly larger"));

    // The flag is clear again, so the next fresh frame dispatches.
    assert_eq!(h.next_tick(), TickOutcome::AdjustmentDispatched);
}

#[tokio::test]
async fn manual_adjustment_during_flight_is_rejected() {
    let advisor = GatedAdvisor::gated();
    let mut h = Harness::armed(Arc::clone(&advisor)).await;
    assert_eq!(h.next_tick(), TickOutcome::AdjustmentDispatched);

    let rejection = assert_err!(h.controller.request_manual_adjustment());
    assert_eq!(rejection, ManualAdjustRejected::AlreadyInFlight);

    let notices = h.drain_notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].level, NoticeLevel::Info);

    advisor.release(1);
    h.settle().await;
    assert_eq!(advisor.calls(), 1);
}

#[tokio::test]
async fn manual_adjustment_requires_camera_model_and_pose() {
    let mut h = Harness::new(GatedAdvisor::open()).await;
    assert_eq!(
        h.controller.request_manual_adjustment(),
        Err(ManualAdjustRejected::NotReady)
    );

    h.controller.set_camera_enabled(true);
    assert_eq!(h.next_tick(), TickOutcome::Detected);
    assert_eq!(
        h.controller.request_manual_adjustment(),
        Err(ManualAdjustRejected::NotReady)
    );
    assert_eq!(h.advisor.calls(), 0);
    assert!(h.drain_notices().iter().any(|n| n.title == "Cannot adjust"));
}

#[tokio::test]
async fn manual_adjustment_announces_success_but_automatic_does_not() {
    let mut h = Harness::armed(GatedAdvisor::open()).await;

    assert_eq!(h.next_tick(), TickOutcome::AdjustmentDispatched);
    assert!(matches!(h.settle().await, AdjustmentOutcome::Applied(_)));
    assert!(h.drain_notices().is_empty());

    assert_ok!(h.controller.request_manual_adjustment());
    assert!(h.controller.state().adjustment_in_flight);
    assert!(matches!(h.settle().await, AdjustmentOutcome::Applied(_)));
    let notices = h.drain_notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].title, "Model Re-Adjusted");
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transport_failure_keeps_parameters_and_reports_once() {
    let advisor = GatedAdvisor::open();
    advisor.reply(Err(AdvisorError::transport("connection reset")));
    let mut h = Harness::armed(Arc::clone(&advisor)).await;

    assert_eq!(h.next_tick(), TickOutcome::AdjustmentDispatched);
    let outcome = h.settle().await;
    assert!(matches!(outcome, AdjustmentOutcome::Failed(AdvisorError::TransportFailure(_))));

    assert_eq!(h.controller.state().current_parameters, ModelParameters::DEFAULT);
    assert!(!h.controller.state().adjustment_in_flight);

    let notices = h.drain_notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].level, NoticeLevel::Error);
    assert_eq!(notices[0].title, "AI Error");
}

#[tokio::test]
async fn invalid_advice_is_not_applied() {
    let advisor = GatedAdvisor::open();
    advisor.reply(Ok(advice(-3.0, "shrink past zero")));
    let mut h = Harness::armed(Arc::clone(&advisor)).await;

    assert_eq!(h.next_tick(), TickOutcome::AdjustmentDispatched);
    assert!(matches!(
        h.settle().await,
        AdjustmentOutcome::Failed(AdvisorError::ValidationFailure(_))
    ));
    assert_eq!(h.controller.state().current_parameters, ModelParameters::DEFAULT);
    assert!(h.controller.snapshot().last_reasoning.is_none());
    assert_eq!(h.drain_notices().len(), 1);
}

#[tokio::test]
async fn camera_stays_off_when_the_feed_cannot_open() {
    let script = SourceScript::default();
    let mut feed = ManualFeed::new();
    feed.open_error = Some(CaptureError::PermissionDenied("user declined".to_string()));
    let (mut controller, mut handle) = FrameLoopController::new(
        ScriptedSource::ready(&script),
        feed,
        GatedAdvisor::open(),
        ControllerConfig::default(),
    );
    controller.initialize().await;
    while handle.notices.try_recv().is_ok() {}

    controller.set_camera_enabled(true);
    assert!(!controller.state().camera_enabled);
    let notice = handle.notices.try_recv().unwrap();
    assert_eq!(notice.title, "Webcam Error");
    assert_eq!(notice.level, NoticeLevel::Error);
}

#[tokio::test]
async fn lost_stream_turns_the_camera_off() {
    let mut h = Harness::armed(GatedAdvisor::open()).await;
    assert_eq!(h.next_tick(), TickOutcome::AdjustmentDispatched);
    h.settle().await;
    h.drain_notices();

    h.feed.lose_stream(CaptureError::DeviceUnavailable("device unplugged".to_string()));
    assert_eq!(h.next_tick(), TickOutcome::CaptureFailed);
    assert!(!h.controller.state().camera_enabled);
    assert!(!h.feed.is_open());
    assert!(h.controller.state().current_landmarks.is_none());
    assert!(!h.controller.snapshot().state.camera_enabled);

    let notices = h.drain_notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].title, "Webcam Error");
    assert_eq!(notices[0].level, NoticeLevel::Error);

    assert_eq!(h.next_tick(), TickOutcome::CameraDisabled);
    let calls = h.advisor.calls();
    h.controller.set_camera_enabled(true);
    assert!(h.controller.state().camera_enabled);
    assert_eq!(h.next_tick(), TickOutcome::AdjustmentDispatched);
    h.settle().await;
    assert_eq!(h.advisor.calls(), calls + 1);
}

#[tokio::test]
async fn camera_cannot_be_enabled_before_pose_detection_is_ready() {
    let script = SourceScript::default();
    let (mut controller, mut handle) = FrameLoopController::new(
        ScriptedSource::ready(&script),
        ManualFeed::new(),
        GatedAdvisor::open(),
        ControllerConfig::default(),
    );
    assert_eq!(controller.source_status(), SourceStatus::Initializing);

    controller.set_camera_enabled(true);
    assert!(!controller.state().camera_enabled);
    assert_eq!(handle.notices.try_recv().unwrap().title, "Please wait");
}

#[tokio::test]
async fn failed_initialization_keeps_camera_disabled() {
    let script = SourceScript::default();
    let source = ScriptedSource {
        script: script.clone(),
        init_result: Err(PoseError::init("model download failed")),
        init_delay: Duration::ZERO,
    };
    let (mut controller, mut handle) =
        FrameLoopController::new(source, ManualFeed::new(), GatedAdvisor::open(), ControllerConfig::default());

    let status = controller.initialize().await;
    assert!(matches!(status, SourceStatus::Failed(ref reason) if reason.contains("model download failed")));
    assert_eq!(handle.notices.try_recv().unwrap().title, "Initialization Error");

    controller.set_camera_enabled(true);
    assert!(!controller.state().camera_enabled);
    assert_eq!(controller.tick(), TickOutcome::CameraDisabled);
}

// ---------------------------------------------------------------------------
// Model loading, feedback and request contents
// ---------------------------------------------------------------------------

#[tokio::test]
async fn loading_a_model_resets_parameters() {
    let mut h = Harness::armed(GatedAdvisor::open()).await;
    assert_eq!(h.next_tick(), TickOutcome::AdjustmentDispatched);
    h.settle().await;
    assert_ne!(h.controller.state().current_parameters, ModelParameters::DEFAULT);

    let second = model_file();
    assert_ok!(h.controller.load_model(ModelAsset::from_path(second.path())));
    assert_eq!(h.controller.state().current_parameters, ModelParameters::DEFAULT);
    assert!(h.controller.snapshot().last_reasoning.is_none());
}

#[tokio::test]
async fn loading_a_model_mid_flight_keeps_the_flag() {
    let advisor = GatedAdvisor::gated();
    let mut h = Harness::armed(Arc::clone(&advisor)).await;
    assert_eq!(h.next_tick(), TickOutcome::AdjustmentDispatched);

    let second = model_file();
    assert_ok!(h.controller.load_model(ModelAsset::from_path(second.path())));
    assert!(h.controller.state().adjustment_in_flight);
    assert_eq!(h.next_tick(), TickOutcome::AdjustmentPending);

    advisor.release(1);
    assert!(matches!(h.settle().await, AdjustmentOutcome::Applied(_)));
}

#[tokio::test]
async fn rejected_model_leaves_state_alone() {
    let mut h = Harness::armed(GatedAdvisor::open()).await;
    assert_eq!(h.next_tick(), TickOutcome::AdjustmentDispatched);
    h.settle().await;
    let before = h.controller.snapshot();

    assert_err!(h.controller.load_model(ModelAsset::parse("/tmp/shirt.obj")));
    assert_err!(h.controller.load_model(ModelAsset::parse("/definitely/missing/shirt.glb")));

    assert_eq!(h.controller.snapshot(), before);
    let notices = h.drain_notices();
    assert_eq!(notices.len(), 2);
    assert!(notices.iter().all(|n| n.level == NoticeLevel::Error));
}

#[tokio::test]
async fn request_carries_pose_parameters_feedback_and_frame_size() {
    let mut h = Harness::armed(GatedAdvisor::open()).await;
    h.controller.provide_feedback("  the sleeves are too long ");

    assert_eq!(h.next_tick(), TickOutcome::AdjustmentDispatched);
    h.settle().await;
    let request = h.advisor.last_request();
    assert_eq!(request.feedback.as_deref(), Some("the sleeves are too long"));
    assert_eq!(request.current_parameters, ModelParameters::DEFAULT);
    assert_eq!((request.frame_width, request.frame_height), (64, 48));
    assert_eq!(request.landmarks(), h.controller.state().current_landmarks);

    // Feedback persists until replaced; blank text clears it.
    assert_eq!(h.next_tick(), TickOutcome::AdjustmentDispatched);
    h.settle().await;
    assert_eq!(h.advisor.last_request().feedback.as_deref(), Some("the sleeves are too long"));
    assert_eq!(h.advisor.last_request().current_parameters.scale, 24.0);

    h.controller.provide_feedback("   ");
    assert_eq!(h.next_tick(), TickOutcome::AdjustmentDispatched);
    h.settle().await;
    assert!(h.advisor.last_request().feedback.is_none());
}

#[tokio::test]
async fn manual_adjustment_matches_a_loop_adjustment_for_the_same_inputs() {
    let mut h = Harness::armed(GatedAdvisor::open()).await;
    h.controller.provide_feedback("tuck it in");

    assert_eq!(h.next_tick(), TickOutcome::AdjustmentDispatched);
    let from_loop = h.settle().await;
    let loop_request = h.advisor.last_request();

    // Same model, same frame: only the parameters need resetting.
    assert_ok!(h.controller.load_model(ModelAsset::from_path(h.model.path())));
    assert_eq!(h.controller.state().current_parameters, ModelParameters::DEFAULT);
    assert_ok!(h.controller.request_manual_adjustment());
    let manual = h.settle().await;
    let manual_request = h.advisor.last_request();

    assert_eq!(h.advisor.calls(), 2);
    assert_eq!(manual_request, loop_request);
    assert!(matches!(manual, AdjustmentOutcome::Applied(_)));
    assert_eq!(manual, from_loop);
    assert_eq!(h.controller.state().current_parameters, advice(24.0, "").updated_parameters);
}

#[tokio::test]
async fn zero_sized_frames_fall_back_to_default_dimensions() {
    let script = SourceScript::default();
    let mut feed = ManualFeed::new();
    feed.size = (0, 0);
    let advisor = GatedAdvisor::open();
    let (mut controller, _handle) = FrameLoopController::new(
        ScriptedSource::ready(&script),
        feed.clone(),
        Arc::clone(&advisor),
        ControllerConfig::default(),
    );
    controller.initialize().await;
    controller.set_camera_enabled(true);
    let model = model_file();
    assert_ok!(controller.load_model(ModelAsset::from_path(model.path())));

    feed.advance();
    assert_eq!(controller.tick(), TickOutcome::AdjustmentDispatched);
    controller.await_adjustment().await;
    let request = advisor.last_request();
    assert_eq!((request.frame_width, request.frame_height), (640, 480));
}

// ---------------------------------------------------------------------------
// Camera toggling and late results
// ---------------------------------------------------------------------------

#[tokio::test]
async fn disabling_the_camera_clears_landmarks_and_stops_ticks() {
    let mut h = Harness::armed(GatedAdvisor::open()).await;
    assert_eq!(h.next_tick(), TickOutcome::AdjustmentDispatched);
    h.settle().await;

    h.controller.set_camera_enabled(false);
    assert!(!h.feed.is_open());
    assert!(h.controller.state().current_landmarks.is_none());
    assert_eq!(h.next_tick(), TickOutcome::CameraDisabled);

    h.controller.set_camera_enabled(true);
    assert_eq!(h.controller.state().last_frame_timestamp, None);
    assert_eq!(h.next_tick(), TickOutcome::AdjustmentDispatched);
}

#[tokio::test]
async fn late_result_is_applied_after_disable_by_default() {
    let advisor = GatedAdvisor::gated();
    let mut h = Harness::armed(Arc::clone(&advisor)).await;
    assert_eq!(h.next_tick(), TickOutcome::AdjustmentDispatched);

    h.controller.set_camera_enabled(false);
    advisor.release(1);
    assert!(matches!(h.settle().await, AdjustmentOutcome::Applied(_)));
    assert_eq!(h.controller.state().current_parameters.scale, 24.0);
}

#[tokio::test]
async fn late_result_can_be_discarded_after_disable() {
    let advisor = GatedAdvisor::gated();
    let config = ControllerConfig {
        stale_policy: StaleResultPolicy::DiscardAfterDisable,
        ..ControllerConfig::default()
    };
    let mut h = Harness::with_config(Arc::clone(&advisor), config).await;
    h.controller.set_camera_enabled(true);
    assert_ok!(h.controller.load_model(ModelAsset::from_path(h.model.path())));
    assert_eq!(h.next_tick(), TickOutcome::AdjustmentDispatched);

    // Off and on again: the result belongs to the previous session.
    h.controller.set_camera_enabled(false);
    h.controller.set_camera_enabled(true);
    advisor.release(1);
    assert_eq!(h.settle().await, AdjustmentOutcome::Discarded);
    assert_eq!(h.controller.state().current_parameters, ModelParameters::DEFAULT);
    assert!(!h.controller.state().adjustment_in_flight);
}

#[tokio::test]
async fn late_result_can_be_discarded_after_model_change() {
    let advisor = GatedAdvisor::gated();
    let config = ControllerConfig {
        stale_policy: StaleResultPolicy::DiscardOnModelChange,
        ..ControllerConfig::default()
    };
    let mut h = Harness::with_config(Arc::clone(&advisor), config).await;
    h.controller.set_camera_enabled(true);
    assert_ok!(h.controller.load_model(ModelAsset::from_path(h.model.path())));
    assert_eq!(h.next_tick(), TickOutcome::AdjustmentDispatched);

    let second = model_file();
    assert_ok!(h.controller.load_model(ModelAsset::from_path(second.path())));
    advisor.release(1);
    assert_eq!(h.settle().await, AdjustmentOutcome::Discarded);
    assert_eq!(h.controller.state().current_parameters, ModelParameters::DEFAULT);
}

// ---------------------------------------------------------------------------
// Run loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_loop_fits_the_model_end_to_end() {
    let advisor = GatedAdvisor::open();
    let feed = SyntheticFeed::new(CaptureFormat {
        width: 32,
        height: 24,
        fps: 60,
    });
    let source = SimulatedPoseSource::new().with_init_delay(Duration::from_millis(20));
    let config = ControllerConfig {
        tick_interval: Duration::from_millis(5),
        ..ControllerConfig::default()
    };
    let (controller, mut handle) = FrameLoopController::new(source, feed, Arc::clone(&advisor), config);
    let frame_loop = tokio::spawn(controller.run());

    // Refused while the source is still loading.
    handle.commands.send(Command::SetCameraEnabled(true)).await.unwrap();
    // Map the borrowed snapshot away at once; holding it would block the controller.
    let ready = tokio::time::timeout(
        Duration::from_secs(5),
        handle.snapshots.wait_for(|s| s.source_status == SourceStatus::Ready),
    )
    .await
    .map(|seen| seen.is_ok())
    .unwrap_or(false);
    assert!(ready);

    let model = model_file();
    handle.commands.send(Command::SetCameraEnabled(true)).await.unwrap();
    handle
        .commands
        .send(Command::LoadModel(ModelAsset::from_path(model.path())))
        .await
        .unwrap();

    let fitted = tokio::time::timeout(
        Duration::from_secs(5),
        handle.snapshots.wait_for(|s| {
            s.state.camera_enabled && s.state.current_parameters.scale == 24.0 && s.last_reasoning.is_some()
        }),
    )
    .await
    .map(|seen| seen.is_ok())
    .unwrap_or(false);
    assert!(fitted);
    assert!(advisor.calls() >= 1);

    handle.commands.send(Command::Shutdown).await.unwrap();
    assert_ok!(tokio::time::timeout(Duration::from_secs(5), frame_loop).await.unwrap());
}

#[tokio::test]
async fn run_loop_stops_when_handles_are_dropped() {
    let script = SourceScript::default();
    let (controller, handle) = FrameLoopController::new(
        ScriptedSource::ready(&script),
        ManualFeed::new(),
        GatedAdvisor::open(),
        ControllerConfig::default(),
    );
    let frame_loop = tokio::spawn(controller.run());
    drop(handle);
    assert_ok!(tokio::time::timeout(Duration::from_secs(5), frame_loop).await.unwrap());
}
