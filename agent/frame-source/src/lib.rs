//! Capture abstraction for the device agent.
//!
//! `FrameSource` is the only thing the transport knows about cameras: ask for a
//! frame, get encoded bytes or a `CaptureError`. Sensor setup, exposure and
//! image post-processing all live behind it.
//!
//! Two implementations ship here:
//! - `TestPatternCamera` — development stand-in, renders a flat grey PPM.
//! - `CommandCamera` — runs an external still-capture tool (for example
//!   `rpicam-still -n -o - -e jpg`) and takes its stdout as the frame.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use tracing::debug;

// ──────────────────────────────────────────────────────────────────────────────
// Errors
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// Camera could not be reached at all (missing device, tool not installed).
    #[error("camera unavailable: {0}")]
    Unavailable(String),
    /// Camera answered but produced no usable frame.
    #[error("capture failed: {0}")]
    Failed(String),
    #[error("capture timed out after {0:?}")]
    Timeout(Duration),
}

// ──────────────────────────────────────────────────────────────────────────────
// The trait
// ──────────────────────────────────────────────────────────────────────────────

pub type CaptureFuture<'a> = Pin<Box<dyn Future<Output = Result<Bytes, CaptureError>> + Send + 'a>>;

/// One camera attached to this device.
///
/// `capture_frame` may be called while the previous call is still pending if
/// the broker requests a capture; implementations must tolerate that.
pub trait FrameSource: Send + Sync + 'static {
    /// Capture one still frame and return it encoded.
    fn capture_frame(&self) -> CaptureFuture<'_>;

    /// Human-readable source name for logs.
    fn source_id(&self) -> &str;
}

// ──────────────────────────────────────────────────────────────────────────────
// Configuration
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default)]
    pub kind: CameraKind,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    /// argv of the capture tool; only used with `kind: command`.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default = "default_capture_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraKind {
    #[default]
    TestPattern,
    Command,
}

fn default_width()           -> u32 { 640 }
fn default_height()          -> u32 { 480 }
fn default_capture_timeout() -> u64 { 5_000 }

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            kind:       CameraKind::default(),
            width:      default_width(),
            height:     default_height(),
            command:    Vec::new(),
            timeout_ms: default_capture_timeout(),
        }
    }
}

/// Build the configured source.
pub fn from_config(cfg: &CameraConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
    match cfg.kind {
        CameraKind::TestPattern => Ok(Box::new(TestPatternCamera::new(cfg.width, cfg.height))),
        CameraKind::Command => {
            let (program, args) = cfg
                .command
                .split_first()
                .ok_or_else(|| CaptureError::Unavailable("camera.command is empty".into()))?;
            Ok(Box::new(CommandCamera::new(
                program.clone(),
                args.to_vec(),
                Duration::from_millis(cfg.timeout_ms),
            )))
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Test pattern
// ──────────────────────────────────────────────────────────────────────────────

pub struct TestPatternCamera {
    width:    u32,
    height:   u32,
    captured: AtomicU64,
    id:       String,
}

impl TestPatternCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            captured: AtomicU64::new(0),
            id: format!("test-pattern:{width}x{height}"),
        }
    }

    /// Binary PPM (P6). The grey level steps with every frame so consecutive
    /// frames differ.
    fn render(&self, n: u64) -> Bytes {
        let header = format!("P6\n{} {}\n255\n", self.width, self.height);
        let pixels = self.width as usize * self.height as usize;
        let level = 96u8.wrapping_add((n % 64) as u8);

        let mut buf = BytesMut::with_capacity(header.len() + pixels * 3);
        buf.put_slice(header.as_bytes());
        buf.put_bytes(level, pixels * 3);
        buf.freeze()
    }
}

impl FrameSource for TestPatternCamera {
    fn capture_frame(&self) -> CaptureFuture<'_> {
        Box::pin(async move {
            let n = self.captured.fetch_add(1, Ordering::Relaxed);
            Ok(self.render(n))
        })
    }

    fn source_id(&self) -> &str {
        &self.id
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// External capture tool
// ──────────────────────────────────────────────────────────────────────────────

pub struct CommandCamera {
    program: String,
    args:    Vec<String>,
    timeout: Duration,
    id:      String,
}

impl CommandCamera {
    pub fn new(program: String, args: Vec<String>, timeout: Duration) -> Self {
        let id = format!("command:{program}");
        Self { program, args, timeout, id }
    }

    async fn run(&self) -> Result<Bytes, CaptureError> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| CaptureError::Timeout(self.timeout))?
            .map_err(|e| CaptureError::Unavailable(format!("{}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CaptureError::Failed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        if output.stdout.is_empty() {
            return Err(CaptureError::Failed(format!("{} produced no output", self.program)));
        }

        debug!(source = %self.id, bytes = output.stdout.len(), "Frame captured");
        Ok(Bytes::from(output.stdout))
    }
}

impl FrameSource for CommandCamera {
    fn capture_frame(&self) -> CaptureFuture<'_> {
        Box::pin(self.run())
    }

    fn source_id(&self) -> &str {
        &self.id
    }
}
