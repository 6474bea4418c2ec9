//! Query frame preparation via ffmpeg
//!
//! Uploaded media (image, GIF or video) is normalized to its first frame,
//! scaled to 320 px wide JPEG. Optional letterbox removal detects the content
//! rectangle with `cropdetect` and cuts it out.

use crate::error::SearchError;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::debug;

/// Luma threshold below which pixels count as border
const BORDER_LIMIT: u32 = 4;

/// Normalize arbitrary uploaded media into a search frame
#[async_trait]
pub trait FrameExtractor: Send + Sync {
    async fn extract(&self, media: Bytes) -> Result<Bytes, SearchError>;
}

/// Remove black borders around the picture content
#[async_trait]
pub trait BorderCropper: Send + Sync {
    async fn crop_borders(&self, frame: Bytes) -> Result<Bytes, SearchError>;
}

/// Pixel rectangle, origin top-left
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

impl CropRect {
    pub fn full(width: i64, height: i64) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    fn filter(&self) -> String {
        format!("crop={}:{}:{}:{}", self.width, self.height, self.x, self.y)
    }
}

fn round_half_up(v: f64) -> i64 {
    (v + 0.5).floor() as i64
}

/// Region to cut from a `width`×`height` frame given the detected content
///
/// Returns `None` when the content already fills the frame. Content slightly
/// wider than 16:10 but narrower than 16:9 is assumed to be 16:9 and
/// recentred, shaving one extra row for anti-aliasing.
pub fn fit_letterbox(width: i64, height: i64, detected: CropRect) -> Option<CropRect> {
    if detected == CropRect::full(width, height) {
        return None;
    }

    let CropRect {
        mut x,
        mut y,
        width: mut w,
        height: mut h,
    } = detected;

    if w > 0 && h > 0 {
        let ratio = w as f64 / h as f64;
        if (1.6..16.0 / 9.0).contains(&ratio) {
            let new_height = round_half_up(w as f64 / 16.0 * 9.0);
            y = round_half_up(y as f64 - (new_height - h) as f64 / 2.0);
            h = new_height - 1;
            y += 1;
        }
    }

    x = x.max(0);
    y = y.max(0);
    w = w.clamp(1, width.max(1));
    h = h.clamp(1, height.max(1));
    // keep the region inside the frame
    x = x.min(width - w).max(0);
    y = y.min(height - h).max(0);

    Some(CropRect {
        x,
        y,
        width: w,
        height: h,
    })
}

/// Last `crop=w:h:x:y` suggestion in cropdetect's log output
pub fn parse_cropdetect(log: &str) -> Option<CropRect> {
    let spec = log.rsplit("crop=").next().filter(|_| log.contains("crop="))?;
    let spec = spec.split_whitespace().next()?;
    let parts: Vec<i64> = spec
        .split(':')
        .map(|p| p.parse().ok())
        .collect::<Option<Vec<_>>>()?;
    match parts[..] {
        [width, height, x, y] => Some(CropRect {
            x,
            y,
            width,
            height,
        }),
        _ => None,
    }
}

/// Parse ffprobe `WIDTHxHEIGHT` output
pub fn parse_dimensions(output: &str) -> Option<(i64, i64)> {
    let (w, h) = output.lines().next()?.trim().split_once('x')?;
    Some((w.parse().ok()?, h.parse().ok()?))
}

/// Frame tools backed by the ffmpeg and ffprobe executables
#[derive(Debug, Clone)]
pub struct FfmpegTools {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    timeout: Duration,
}

impl FfmpegTools {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            timeout,
        }
    }

    /// Run a tool to completion, returning (stdout, stderr)
    async fn run(&self, program: &Path, args: &[&str]) -> Result<(String, String), SearchError> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| {
                SearchError::ImageProcessingFailed(format!(
                    "{} timed out after {:?}",
                    program.display(),
                    self.timeout
                ))
            })?
            .map_err(|e| {
                SearchError::ImageProcessingFailed(format!(
                    "Failed to run {}: {}",
                    program.display(),
                    e
                ))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            debug!(program = %program.display(), stderr = %stderr.trim(), "Tool exited with failure");
            return Err(SearchError::ImageProcessingFailed(format!(
                "{} exited with {}",
                program.display(),
                output.status
            )));
        }
        Ok((stdout, stderr))
    }

    async fn write_input(dir: &TempDir, name: &str, data: &[u8]) -> Result<PathBuf, SearchError> {
        let path = dir.path().join(name);
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| SearchError::Internal(format!("Failed to stage frame: {}", e)))?;
        Ok(path)
    }

    async fn read_output(path: &Path) -> Result<Bytes, SearchError> {
        match tokio::fs::read(path).await {
            Ok(data) if !data.is_empty() => Ok(Bytes::from(data)),
            _ => Err(SearchError::ImageProcessingFailed(
                "Failed to process image".to_string(),
            )),
        }
    }

    fn temp_dir() -> Result<TempDir, SearchError> {
        tempfile::Builder::new()
            .prefix("sola-frame")
            .tempdir()
            .map_err(|e| SearchError::Internal(format!("Failed to create temp dir: {}", e)))
    }

    async fn dimensions(&self, input: &Path) -> Result<(i64, i64), SearchError> {
        let input = input.to_string_lossy();
        let (stdout, _) = self
            .run(
                &self.ffprobe,
                &[
                    "-v",
                    "error",
                    "-select_streams",
                    "v:0",
                    "-show_entries",
                    "stream=width,height",
                    "-of",
                    "csv=s=x:p=0",
                    &*input,
                ],
            )
            .await?;
        parse_dimensions(&stdout).ok_or_else(|| {
            SearchError::ImageProcessingFailed("Failed to read frame dimensions".to_string())
        })
    }

    async fn detect_content(&self, input: &Path) -> Result<Option<CropRect>, SearchError> {
        let input = input.to_string_lossy();
        let filter = format!("cropdetect=limit={}:round=2:reset=0", BORDER_LIMIT);
        // A looped still gives cropdetect enough frames to report on
        let (_, stderr) = self
            .run(
                &self.ffmpeg,
                &[
                    "-hide_banner",
                    "-nostats",
                    "-loop",
                    "1",
                    "-i",
                    &*input,
                    "-vframes",
                    "3",
                    "-vf",
                    filter.as_str(),
                    "-f",
                    "null",
                    "-",
                ],
            )
            .await?;
        Ok(parse_cropdetect(&stderr))
    }
}

#[async_trait]
impl FrameExtractor for FfmpegTools {
    async fn extract(&self, media: Bytes) -> Result<Bytes, SearchError> {
        let dir = Self::temp_dir()?;
        let input = Self::write_input(&dir, "query", &media).await?;
        let output = dir.path().join("frame.jpg");

        let input_arg = input.to_string_lossy();
        let output_arg = output.to_string_lossy();
        self.run(
            &self.ffmpeg,
            &[
                "-hide_banner",
                "-loglevel",
                "warning",
                "-nostats",
                "-y",
                "-ss",
                "00:00:00",
                "-i",
                &*input_arg,
                "-vframes",
                "1",
                "-vf",
                "scale=320:-2",
                &*output_arg,
            ],
        )
        .await
        .map_err(|_| SearchError::ImageProcessingFailed("Failed to process image".to_string()))?;

        Self::read_output(&output).await
    }
}

#[async_trait]
impl BorderCropper for FfmpegTools {
    async fn crop_borders(&self, frame: Bytes) -> Result<Bytes, SearchError> {
        let failed = |_| SearchError::ImageProcessingFailed("Failed to detect and cut borders".to_string());

        let dir = Self::temp_dir()?;
        let input = Self::write_input(&dir, "frame.jpg", &frame).await?;

        let (width, height) = self.dimensions(&input).await.map_err(failed)?;
        let detected = self
            .detect_content(&input)
            .await
            .map_err(failed)?
            .unwrap_or_else(|| CropRect::full(width, height));

        let Some(rect) = fit_letterbox(width, height, detected) else {
            return Ok(frame);
        };
        debug!(width, height, ?rect, "Cutting frame borders");

        let output = dir.path().join("cropped.jpg");
        let input_arg = input.to_string_lossy();
        let output_arg = output.to_string_lossy();
        let filter = rect.filter();
        self.run(
            &self.ffmpeg,
            &[
                "-hide_banner",
                "-loglevel",
                "warning",
                "-nostats",
                "-y",
                "-i",
                &*input_arg,
                "-vf",
                filter.as_str(),
                &*output_arg,
            ],
        )
        .await
        .map_err(failed)?;

        Self::read_output(&output).await.map_err(failed)
    }
}
