// src/mediapipe_bridge.rs - Landmark source backed by an external MediaPipe helper process
//
// Protocol (one request/response per frame, over the child's stdio):
//   child -> {"status":"ready"}                        once, after the model loads
//   parent -> {"width":W,"height":H,"timestamp_ms":T}  header line
//   parent -> W*H*3 raw RGB bytes
//   child -> {"landmarks":[{"x":..,"y":..,"z":..,"visibility":..}, ...]}
//            {"landmarks":null}                        no person in frame
//            {"error":"..."}                           detection failed
//
// Pipes are serviced by two helper threads so that a helper that stops
// reading or writing can never block the caller past its deadline.
use std::io::{self, BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::PoseError;
use crate::model::{Keypoint, LandmarkFrame};
use crate::pose::LandmarkSource;
use crate::video::VideoFrame;

/// How long the bridge may take to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeTimeouts {
    /// Until the ready handshake (covers model download and load).
    pub startup: Duration,
    /// Per frame, from writing the header to reading the reply.
    pub frame: Duration,
}

impl Default for BridgeTimeouts {
    fn default() -> Self {
        Self {
            startup: Duration::from_secs(30),
            frame: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Serialize)]
struct FrameHeader {
    width: u32,
    height: u32,
    timestamp_ms: u64,
}

#[derive(Debug, Default, Deserialize)]
struct BridgeReply {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    landmarks: Option<Vec<Keypoint>>,
    #[serde(default)]
    error: Option<String>,
}

struct FramePayload {
    header: String,
    pixels: Arc<RgbImage>,
}

struct BridgeProcess {
    child: Child,
    frames: Sender<FramePayload>,
    replies: Receiver<io::Result<String>>,
}

impl BridgeProcess {
    fn spawn(command: &[String], startup: Duration) -> Result<Self, PoseError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| PoseError::init("empty bridge command"))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| PoseError::init(format!("failed to start '{}': {}", program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoseError::init("bridge stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoseError::init("bridge stdout unavailable"))?;

        let (frame_tx, frame_rx) = mpsc::channel();
        let (reply_tx, reply_rx) = mpsc::channel();
        // Build the process first so a failed thread spawn still kills the child.
        let process = Self {
            child,
            frames: frame_tx,
            replies: reply_rx,
        };

        std::thread::Builder::new()
            .name("pose-bridge-writer".to_string())
            .spawn(move || write_frames(stdin, frame_rx))
            .map_err(|e| PoseError::init(format!("bridge writer thread: {}", e)))?;
        std::thread::Builder::new()
            .name("pose-bridge-reader".to_string())
            .spawn(move || read_replies(BufReader::new(stdout), reply_tx))
            .map_err(|e| PoseError::init(format!("bridge reader thread: {}", e)))?;

        let handshake = process
            .read_line(startup)
            .map_err(|e| PoseError::init(format!("no handshake from bridge: {}", e)))?;
        parse_handshake(&handshake)?;
        Ok(process)
    }

    fn read_line(&self, timeout: Duration) -> io::Result<String> {
        match self.replies.recv_timeout(timeout) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no reply within {} ms", timeout.as_millis()),
            )),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "bridge process exited",
            )),
        }
    }

    fn exchange(&self, frame: &VideoFrame, timestamp: Duration, timeout: Duration) -> io::Result<String> {
        let header = FrameHeader {
            width: frame.width,
            height: frame.height,
            timestamp_ms: timestamp.as_millis() as u64,
        };
        let payload = FramePayload {
            header: serde_json::to_string(&header)?,
            pixels: Arc::clone(&frame.image),
        };
        self.frames
            .send(payload)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "bridge stdin closed"))?;
        self.read_line(timeout)
    }
}

impl Drop for BridgeProcess {
    fn drop(&mut self) {
        // Killing the child also unblocks both pipe threads.
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn write_frames(mut stdin: ChildStdin, frames: Receiver<FramePayload>) {
    for payload in frames {
        let written = stdin
            .write_all(payload.header.as_bytes())
            .and_then(|_| stdin.write_all(b"\n"))
            .and_then(|_| stdin.write_all(payload.pixels.as_raw()))
            .and_then(|_| stdin.flush());
        if let Err(e) = written {
            debug!("Bridge writer stopped: {}", e);
            return;
        }
    }
}

fn read_replies(mut stdout: BufReader<ChildStdout>, replies: Sender<io::Result<String>>) {
    loop {
        let mut line = String::new();
        let reply = match stdout.read_line(&mut line) {
            Ok(0) => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "bridge process exited")),
            Ok(_) => Ok(line),
            Err(e) => Err(e),
        };
        let done = reply.is_err();
        if replies.send(reply).is_err() || done {
            return;
        }
    }
}

fn parse_handshake(line: &str) -> Result<(), PoseError> {
    let reply: BridgeReply = serde_json::from_str(line.trim())
        .map_err(|e| PoseError::init(format!("malformed handshake '{}': {}", line.trim(), e)))?;
    if let Some(message) = reply.error {
        return Err(PoseError::init(message));
    }
    match reply.status.as_deref() {
        Some("ready") => Ok(()),
        other => Err(PoseError::init(format!("unexpected bridge status {:?}", other))),
    }
}

fn parse_detection(line: &str) -> Result<Option<LandmarkFrame>, PoseError> {
    let reply: BridgeReply = serde_json::from_str(line.trim())
        .map_err(|e| PoseError::unavailable(format!("malformed bridge reply: {}", e)))?;
    if let Some(message) = reply.error {
        return Err(PoseError::unavailable(message));
    }
    reply.landmarks.map(LandmarkFrame::new).transpose()
}

/// Runs pose detection in a helper process (for example a small Python
/// script wrapping MediaPipe's PoseLandmarker in VIDEO mode).
pub struct MediaPipeBridge {
    command: Vec<String>,
    timeouts: BridgeTimeouts,
    process: Option<BridgeProcess>,
}

impl MediaPipeBridge {
    pub fn new(command_line: &str) -> Self {
        Self {
            command: command_line.split_whitespace().map(str::to_owned).collect(),
            timeouts: BridgeTimeouts::default(),
            process: None,
        }
    }

    pub fn with_timeouts(mut self, timeouts: BridgeTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }
}

#[async_trait]
impl LandmarkSource for MediaPipeBridge {
    async fn initialize(&mut self) -> Result<(), PoseError> {
        if self.process.is_some() {
            return Ok(());
        }
        info!(command = ?self.command, "Starting MediaPipe bridge");

        let command = self.command.clone();
        let startup = self.timeouts.startup;
        let process = tokio::task::spawn_blocking(move || BridgeProcess::spawn(&command, startup))
            .await
            .map_err(|e| PoseError::init(format!("bridge startup task failed: {}", e)))??;

        info!("✓ MediaPipe bridge ready");
        self.process = Some(process);
        Ok(())
    }

    fn detect(
        &mut self,
        frame: &VideoFrame,
        timestamp: Duration,
    ) -> Result<Option<LandmarkFrame>, PoseError> {
        let process = self
            .process
            .as_ref()
            .ok_or_else(|| PoseError::unavailable("bridge not running"))?;

        match process.exchange(frame, timestamp, self.timeouts.frame) {
            Ok(line) => parse_detection(&line).map_err(|e| {
                warn!("Bridge detection failed: {}", e);
                e
            }),
            Err(e) => {
                // A late reply would pair with the wrong frame, so the process goes.
                error!("✗ MediaPipe bridge stopped responding: {}", e);
                self.process = None;
                Err(PoseError::unavailable(e.to_string()))
            }
        }
    }
}
