use std::io::Cursor;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("Invalid image: {0}")]
    InvalidImage(String),
    #[error("Model failure: {0}")]
    Model(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Detection pool is not accepting work")]
    Unavailable,
    #[error("Detection cancelled")]
    Cancelled,
}

/// Set once nobody is waiting for a detection any more: the exchange timed
/// out, the client left, or the server is shutting down.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Turns raw image bytes into annotated image bytes.
///
/// Implementations run on the blocking thread pool and may take as long as
/// the model needs; the server bounds the exchange as a whole.
pub trait Detector: Send + Sync + 'static {
    fn detect(&self, image: &[u8]) -> Result<Vec<u8>, DetectionError>;

    /// Called by the detection pool. Implementations that can stop early
    /// should poll `cancel` and return [`DetectionError::Cancelled`].
    fn detect_cancellable(
        &self,
        image: &[u8],
        cancel: &CancelFlag,
    ) -> Result<Vec<u8>, DetectionError> {
        let _ = cancel;
        self.detect(image)
    }
}

impl Detector for Box<dyn Detector> {
    fn detect(&self, image: &[u8]) -> Result<Vec<u8>, DetectionError> {
        (**self).detect(image)
    }

    fn detect_cancellable(
        &self,
        image: &[u8],
        cancel: &CancelFlag,
    ) -> Result<Vec<u8>, DetectionError> {
        (**self).detect_cancellable(image, cancel)
    }
}

/// Detector backed by a plain function, see [`from_fn`].
pub struct FnDetector<F> {
    detect: F,
}

pub fn from_fn<F>(detect: F) -> FnDetector<F>
where
    F: Fn(&[u8]) -> Result<Vec<u8>, DetectionError> + Send + Sync + 'static,
{
    FnDetector { detect }
}

impl<F> Detector for FnDetector<F>
where
    F: Fn(&[u8]) -> Result<Vec<u8>, DetectionError> + Send + Sync + 'static,
{
    fn detect(&self, image: &[u8]) -> Result<Vec<u8>, DetectionError> {
        (self.detect)(image)
    }
}

/// Checks that the payload is a decodable image and sends it back untouched.
#[derive(Debug, Default, Clone)]
pub struct PassthroughDetector;

impl Detector for PassthroughDetector {
    fn detect(&self, image: &[u8]) -> Result<Vec<u8>, DetectionError> {
        let image_reader = image::ImageReader::new(Cursor::new(image))
            .with_guessed_format()
            .map_err(|e| DetectionError::InvalidImage(format!("Error reading image: {}", e)))?;

        image_reader
            .decode()
            .map_err(|e| DetectionError::InvalidImage(format!("Error decoding image: {}", e)))?;

        Ok(image.to_vec())
    }
}
