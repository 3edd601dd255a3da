//! Vision Module - Screen Capture and Text Recognition
//!
//! SAFETY: live monitor capture is disabled by default and requires explicit
//! opt-in via the `vision` feature flag: `--features vision`
//!
//! Without it the loop can still run against image files (mock screens).

pub mod ocr;

pub use ocr::{OcrPage, TesseractOcr, TextRecognizer};

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture unavailable: {0}")]
    CaptureUnavailable(String),

    #[error("OCR failed: {0}")]
    Ocr(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Produces encoded image bytes (PNG/JPEG) of the current screen
#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn capture(&self) -> Result<Vec<u8>, CaptureError>;
}

/// Reads a screenshot from disk on every capture
pub struct FileCapture {
    path: PathBuf,
}

impl FileCapture {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ScreenCapture for FileCapture {
    async fn capture(&self) -> Result<Vec<u8>, CaptureError> {
        debug!(path = %self.path.display(), "reading screen image");
        tokio::fs::read(&self.path).await.map_err(|e| {
            CaptureError::CaptureUnavailable(format!("{}: {}", self.path.display(), e))
        })
    }
}

/// Primary monitor via xcap
#[cfg(feature = "vision")]
pub struct MonitorCapture {
    monitor_index: usize,
}

#[cfg(feature = "vision")]
impl MonitorCapture {
    pub fn new(monitor_index: usize) -> Self {
        Self { monitor_index }
    }

    fn grab(monitor_index: usize) -> Result<Vec<u8>, CaptureError> {
        use std::io::Cursor;
        use xcap::Monitor;

        let monitors = Monitor::all().map_err(|e| CaptureError::CaptureUnavailable(e.to_string()))?;
        let monitor = monitors
            .get(monitor_index)
            .ok_or_else(|| CaptureError::CaptureUnavailable(format!("no monitor {}", monitor_index)))?;
        let image = monitor
            .capture_image()
            .map_err(|e| CaptureError::CaptureUnavailable(e.to_string()))?;

        let mut buffer = Cursor::new(Vec::new());
        image
            .write_to(&mut buffer, xcap::image::ImageFormat::Png)
            .map_err(|e| CaptureError::CaptureUnavailable(e.to_string()))?;
        Ok(buffer.into_inner())
    }
}

#[cfg(feature = "vision")]
#[async_trait]
impl ScreenCapture for MonitorCapture {
    async fn capture(&self) -> Result<Vec<u8>, CaptureError> {
        let index = self.monitor_index;
        tokio::task::spawn_blocking(move || Self::grab(index))
            .await
            .map_err(|e| CaptureError::CaptureUnavailable(e.to_string()))?
    }
}

/// Stand-in when live capture was requested but not compiled in
pub struct NoCapture;

#[async_trait]
impl ScreenCapture for NoCapture {
    async fn capture(&self) -> Result<Vec<u8>, CaptureError> {
        Err(CaptureError::CaptureUnavailable(
            "live capture requires the `vision` feature".into(),
        ))
    }
}

/// Live monitor capture when compiled in, otherwise [`NoCapture`]
pub fn live_capture() -> Box<dyn ScreenCapture> {
    #[cfg(feature = "vision")]
    return Box::new(MonitorCapture::new(0));

    #[cfg(not(feature = "vision"))]
    Box::new(NoCapture)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_file_capture_reads_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"\x89PNG fake").unwrap();

        let capture = FileCapture::new(file.path());
        assert_eq!(capture.capture().await.unwrap(), b"\x89PNG fake".to_vec());
    }

    #[tokio::test]
    async fn test_missing_file_is_capture_unavailable() {
        let capture = FileCapture::new("/definitely/not/here.png");
        assert!(matches!(
            capture.capture().await,
            Err(CaptureError::CaptureUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_no_capture() {
        assert!(NoCapture.capture().await.is_err());
    }
}
