//! Best-effort steps of the compare pass.
//!
//! Figures are cosmetic: a renderer failure is logged and the pass moves on.
//! `RenderError` has no conversion into `HarnessError` and never reaches `?`
//! in a required step.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::Tag;
use crate::report::render::ArtifactKind;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("renderer '{renderer}' does not produce {artifact}")]
    Unsupported {
        renderer: String,
        artifact: ArtifactKind,
    },

    #[error("renderer '{renderer}' failed: {cause}")]
    Failed { renderer: String, cause: String },

    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RenderError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// An artifact that was not written, and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedArtifact {
    pub tag: Tag,
    pub artifact: ArtifactKind,
    pub reason: String,
    /// The renderer never produces this artifact; not a failure.
    pub unsupported: bool,
}

/// What the render pass produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RenderSummary {
    pub written: Vec<PathBuf>,
    pub skipped: Vec<SkippedArtifact>,
}

impl RenderSummary {
    /// Run one cosmetic step and record its outcome.
    pub fn step(
        &mut self,
        tag: &Tag,
        artifact: ArtifactKind,
        f: impl FnOnce() -> Result<PathBuf, RenderError>,
    ) {
        match f() {
            Ok(path) => {
                debug!(tag = %tag, artifact = %artifact, path = %path.display(), "artifact written");
                self.written.push(path);
            }
            Err(err) => {
                let unsupported = matches!(err, RenderError::Unsupported { .. });
                if unsupported {
                    debug!(tag = %tag, artifact = %artifact, "artifact not supported by renderer");
                } else {
                    warn!(tag = %tag, artifact = %artifact, error = %err, "figure skipped");
                }
                self.skipped.push(SkippedArtifact {
                    tag: tag.clone(),
                    artifact,
                    reason: err.to_string(),
                    unsupported,
                });
            }
        }
    }

    pub fn failures(&self) -> usize {
        self.skipped
            .iter()
            .filter(|s| !s.unsupported)
            .count()
    }
}
