//! Boundary to the inference backend.
//!
//! The crate does not implement a forward pass. It defines how an artifact
//! is located, loaded, and invoked: the [`InferenceBackend`] loads an
//! artifact into an [`ArtifactHandle`], and the handle is the only way to
//! run a prediction. Which of the two artifact formats is in use is decided
//! once at load time; call sites never branch on it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Structured prediction payload as produced by a backend.
pub type Predictions = serde_json::Value;

/// On-disk serialization format of an artifact, derived from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactFormat {
    /// Framework-native weights (`.pt`, `.pth`, `.safetensors`, `.bin`).
    Native,
    /// Portable interchange format (`.onnx`).
    Portable,
}

impl ArtifactFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match extension.as_str() {
            "onnx" => Ok(ArtifactFormat::Portable),
            "pt" | "pth" | "safetensors" | "bin" => Ok(ArtifactFormat::Native),
            other => Err(Error::LoadFailure(format!(
                "unrecognized artifact extension '.{other}' for {}",
                path.display()
            ))),
        }
    }
}

/// Cooperative cancellation flag handed to the backend for each prediction.
///
/// The worker sets it when a job's soft time limit fires; a backend that
/// polls it can abandon work and clean up before the hard limit abandons
/// the job outright.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a backend needs to materialize one artifact.
#[derive(Debug, Clone)]
pub struct LoadSpec {
    pub artifact_path: PathBuf,
    pub format: ArtifactFormat,
    /// Opaque key/value bag recorded at registration time.
    pub load_parameters: serde_json::Value,
}

/// A loaded, ready-to-invoke engine for one artifact.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    async fn infer(&self, payload: &[u8], cancel: &CancelSignal) -> Result<Predictions>;
}

/// In-memory representation of a loaded artifact.
///
/// Owned by the artifact registry; destroyed only on invalidation or
/// process exit.
pub struct ArtifactHandle {
    format: ArtifactFormat,
    engine: Box<dyn InferenceEngine>,
}

impl ArtifactHandle {
    pub fn new(format: ArtifactFormat, engine: Box<dyn InferenceEngine>) -> Self {
        Self { format, engine }
    }

    pub fn format(&self) -> ArtifactFormat {
        self.format
    }

    /// Run one prediction over raw input bytes.
    pub async fn infer(&self, payload: &[u8], cancel: &CancelSignal) -> Result<Predictions> {
        self.engine.infer(payload, cancel).await
    }
}

impl std::fmt::Debug for ArtifactHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactHandle")
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

/// Loads artifacts. Implemented outside this crate (and by test fakes).
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn load(&self, spec: &LoadSpec) -> Result<ArtifactHandle>;
}
