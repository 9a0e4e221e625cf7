//! FrameSource - Producer-side media pipeline
//!
//! ## Responsibilities
//!
//! - `FrameSource` seam: start, pull timestamped JPEG frames, stop
//! - ffmpeg pipeline (`image2pipe` MJPEG on stdout) split on SOI/EOI markers
//! - Scripted source for tests
//!
//! Frame timestamps are the pipeline start wall clock plus elapsed monotonic
//! time, reset on every start.

use crate::{Error, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::Instant;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Capture tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Output frame rate requested from the pipeline
    pub fps: u32,
    /// ffmpeg MJPEG qscale (2 best .. 31 worst)
    pub jpeg_qscale: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            fps: 18,
            jpeg_qscale: 10,
        }
    }
}

impl CaptureConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fps == 0 {
            return Err(Error::Validation("capture fps must be > 0".into()));
        }
        if !(2..=31).contains(&self.jpeg_qscale) {
            return Err(Error::Validation(format!(
                "capture jpeg_qscale {} must be in 2..=31",
                self.jpeg_qscale
            )));
        }
        Ok(())
    }
}

/// One captured frame
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    pub timestamp: NaiveDateTime,
    pub jpeg: Vec<u8>,
}

#[async_trait]
pub trait FrameSource: Send {
    async fn start(&mut self) -> Result<()>;

    /// Next frame; `None` once a finite source is exhausted
    async fn next_frame(&mut self) -> Result<Option<CapturedFrame>>;

    async fn stop(&mut self) -> Result<()>;
}

/// Builds the frame source of a stream
pub trait FrameSourceFactory: Send + Sync {
    fn create(&self, stream_id: &str, uri: &str) -> Box<dyn FrameSource>;
}

/// Factory for `FfmpegFrameSource`
#[derive(Debug, Clone, Default)]
pub struct FfmpegSourceFactory {
    pub config: CaptureConfig,
}

impl FrameSourceFactory for FfmpegSourceFactory {
    fn create(&self, _stream_id: &str, uri: &str) -> Box<dyn FrameSource> {
        Box::new(FfmpegFrameSource::new(uri, self.config.clone()))
    }
}

/// Incremental JPEG splitter for an MJPEG byte stream
#[derive(Debug, Default)]
pub struct JpegSplitter {
    buf: Vec<u8>,
}

impl JpegSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete JPEG. Bytes before the first SOI are discarded.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let Some(start) = find(&self.buf, &SOI, 0) else {
            // Keep a trailing byte that may open a SOI split across chunks
            let cut = self.buf.len().saturating_sub(1);
            self.buf.drain(..cut);
            return None;
        };
        if start > 0 {
            self.buf.drain(..start);
        }
        let end = find(&self.buf, &EOI, SOI.len())? + EOI.len();
        Some(self.buf.drain(..end).collect())
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    if haystack.len() < from + 2 {
        return None;
    }
    haystack[from..]
        .windows(2)
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Whether the uri points at a finite file rather than a live stream
fn is_file_source(uri: &str) -> bool {
    !uri.contains("://") || uri.starts_with("file://")
}

/// ffmpeg-backed source
pub struct FfmpegFrameSource {
    uri: String,
    config: CaptureConfig,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    splitter: JpegSplitter,
    started_wall: Option<NaiveDateTime>,
    started_at: Option<Instant>,
}

impl FfmpegFrameSource {
    pub fn new(uri: impl Into<String>, config: CaptureConfig) -> Self {
        Self {
            uri: uri.into(),
            config,
            child: None,
            stdout: None,
            splitter: JpegSplitter::new(),
            started_wall: None,
            started_at: None,
        }
    }

    fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.uri.starts_with("rtsp://") {
            args.extend(["-rtsp_transport".to_string(), "tcp".to_string()]);
        }
        if is_file_source(&self.uri) {
            args.push("-re".to_string());
        }
        args.extend([
            "-i".to_string(),
            self.uri.clone(),
            "-r".to_string(),
            self.config.fps.to_string(),
            "-f".to_string(),
            "image2pipe".to_string(),
            "-vcodec".to_string(),
            "mjpeg".to_string(),
            "-q:v".to_string(),
            self.config.jpeg_qscale.to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-".to_string(),
        ]);
        args
    }

    fn timestamp_now(&self) -> NaiveDateTime {
        match (self.started_wall, self.started_at) {
            (Some(wall), Some(at)) => {
                wall + chrono::Duration::from_std(at.elapsed()).unwrap_or_else(|_| chrono::Duration::zero())
            }
            _ => chrono::Local::now().naive_local(),
        }
    }
}

#[async_trait]
impl FrameSource for FfmpegFrameSource {
    async fn start(&mut self) -> Result<()> {
        self.stop().await?;

        let mut child = Command::new("ffmpeg")
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Transport(format!("ffmpeg spawn failed: {}", e)))?;

        self.stdout = child.stdout.take();
        if self.stdout.is_none() {
            return Err(Error::Transport("ffmpeg stdout unavailable".into()));
        }
        self.child = Some(child);
        self.started_wall = Some(chrono::Local::now().naive_local());
        self.started_at = Some(Instant::now());

        tracing::info!(uri = %self.uri, fps = self.config.fps, "Pipeline set up");
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Option<CapturedFrame>> {
        let mut chunk = vec![0u8; 64 * 1024];

        loop {
            if let Some(jpeg) = self.splitter.next_frame() {
                return Ok(Some(CapturedFrame {
                    timestamp: self.timestamp_now(),
                    jpeg,
                }));
            }

            let stdout = self
                .stdout
                .as_mut()
                .ok_or_else(|| Error::Transport("pipeline not started".into()))?;

            // A silent pipeline blocks here; the producer watchdog handles it
            let read = stdout
                .read(&mut chunk)
                .await
                .map_err(|e| Error::Transport(format!("pipeline read failed: {}", e)))?;

            if read == 0 {
                if is_file_source(&self.uri) {
                    return Ok(None);
                }
                return Err(Error::Transport("pipeline ended (EOF)".into()));
            }
            self.splitter.push(&chunk[..read]);
        }
    }

    async fn stop(&mut self) -> Result<()> {
        self.stdout = None;
        self.splitter.clear();
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                tracing::debug!(uri = %self.uri, error = %e, "ffmpeg already exited");
            }
            tracing::info!(uri = %self.uri, "Pipeline set to NULL");
        }
        Ok(())
    }
}

/// Scripted frame source. Each `start` begins the next session script.
#[derive(Debug, Default)]
pub struct ScriptedFrameSource {
    sessions: VecDeque<SourceScript>,
    current: VecDeque<CapturedFrame>,
    current_end: SourceEnd,
    pace: Option<Duration>,
    fail_starts: usize,
    starts: usize,
}

/// What happens after a session's frames run out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SourceEnd {
    /// Source ends cleanly (`None`)
    #[default]
    Finished,
    /// No more data, the read blocks forever
    Stall,
    /// Transport error
    Fail,
}

#[derive(Debug, Clone, Default)]
pub struct SourceScript {
    pub frames: Vec<CapturedFrame>,
    pub end: SourceEnd,
    /// Delay before each frame
    pub pace: Option<Duration>,
}

impl ScriptedFrameSource {
    pub fn new(sessions: Vec<SourceScript>) -> Self {
        Self {
            sessions: sessions.into(),
            ..Default::default()
        }
    }

    /// Fail the next `n` starts with a transport error
    pub fn fail_starts(mut self, n: usize) -> Self {
        self.fail_starts = n;
        self
    }

    pub fn starts(&self) -> usize {
        self.starts
    }
}

#[async_trait]
impl FrameSource for ScriptedFrameSource {
    async fn start(&mut self) -> Result<()> {
        self.starts += 1;
        if self.fail_starts > 0 {
            self.fail_starts -= 1;
            return Err(Error::Transport("source unreachable".into()));
        }
        let script = self.sessions.pop_front().unwrap_or(SourceScript {
            frames: Vec::new(),
            end: SourceEnd::Stall,
            pace: None,
        });
        self.current = script.frames.into();
        self.current_end = script.end;
        self.pace = script.pace;
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Option<CapturedFrame>> {
        if let Some(pace) = self.pace {
            tokio::time::sleep(pace).await;
        }
        match self.current.pop_front() {
            Some(frame) => Ok(Some(frame)),
            None => match self.current_end {
                SourceEnd::Finished => Ok(None),
                SourceEnd::Stall => std::future::pending().await,
                SourceEnd::Fail => Err(Error::Transport("source dropped".into())),
            },
        }
    }

    async fn stop(&mut self) -> Result<()> {
        self.current.clear();
        Ok(())
    }
}
