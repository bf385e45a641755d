//! Figure renderers.
//!
//! Artifacts land at `<out>/<tag>/<tag>_<artifact>.<ext>`.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;

use crate::domain::{Dataset, Tag};
use crate::report::ComparisonUnit;
use crate::report::steps::RenderError;

/// One figure per configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Posterior,
    PtProfile,
    Opacities,
    Spectrum,
    Contribution,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 5] = [
        ArtifactKind::Posterior,
        ArtifactKind::PtProfile,
        ArtifactKind::Opacities,
        ArtifactKind::Spectrum,
        ArtifactKind::Contribution,
    ];

    pub fn file_stem(self) -> &'static str {
        match self {
            ArtifactKind::Posterior => "posterior",
            ArtifactKind::PtProfile => "pt_profile",
            ArtifactKind::Opacities => "opacities",
            ArtifactKind::Spectrum => "spectrum",
            ArtifactKind::Contribution => "contribution",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_stem())
    }
}

/// `<out>/<tag>/<tag>_<artifact>.<ext>`
pub fn artifact_path(out_dir: &Path, tag: &Tag, artifact: ArtifactKind, extension: &str) -> PathBuf {
    out_dir
        .join(tag.as_str())
        .join(format!("{tag}_{}.{extension}", artifact.file_stem()))
}

pub trait Renderer {
    fn name(&self) -> &str;

    /// File extension of produced artifacts, without the dot.
    fn extension(&self) -> &str;

    fn supports(&self, artifact: ArtifactKind) -> bool;

    /// Write `artifact` for `unit` to `path`. The parent directory exists.
    fn render(
        &self,
        artifact: ArtifactKind,
        unit: &ComparisonUnit,
        dataset: &Dataset,
        path: &Path,
    ) -> Result<(), RenderError>;
}

#[derive(Serialize)]
struct RenderRequest<'a> {
    artifact: ArtifactKind,
    unit: &'a ComparisonUnit,
    dataset: &'a Dataset,
    output: &'a Path,
}

/// Delegates every artifact to an external plotting command.
///
/// The command is invoked as `<command...> <request.json>`; the request names
/// the artifact, the unit, the dataset and the output path.
#[derive(Debug, Clone)]
pub struct ExternalRenderer {
    command: Vec<String>,
}

impl ExternalRenderer {
    pub fn new(command: Vec<String>) -> Option<Self> {
        (!command.is_empty()).then_some(Self { command })
    }
}

impl Renderer for ExternalRenderer {
    fn name(&self) -> &str {
        "external"
    }

    fn extension(&self) -> &str {
        "pdf"
    }

    fn supports(&self, _artifact: ArtifactKind) -> bool {
        true
    }

    fn render(
        &self,
        artifact: ArtifactKind,
        unit: &ComparisonUnit,
        dataset: &Dataset,
        path: &Path,
    ) -> Result<(), RenderError> {
        let request_path = path.with_extension("request.json");
        let body = serde_json::to_vec_pretty(&RenderRequest {
            artifact,
            unit,
            dataset,
            output: path,
        })
        .map_err(|e| RenderError::Failed {
            renderer: self.name().to_string(),
            cause: e.to_string(),
        })?;
        fs::write(&request_path, body).map_err(|e| RenderError::io(&request_path, e))?;

        let status = Command::new(&self.command[0])
            .args(&self.command[1..])
            .arg(&request_path)
            .status()
            .map_err(|e| RenderError::Failed {
                renderer: self.name().to_string(),
                cause: format!("failed to run '{}': {e}", self.command[0]),
            })?;
        let _ = fs::remove_file(&request_path);

        if !status.success() {
            return Err(RenderError::Failed {
                renderer: self.name().to_string(),
                cause: format!("exited with {status}"),
            });
        }
        if !path.is_file() {
            return Err(RenderError::Failed {
                renderer: self.name().to_string(),
                cause: format!("no file written at '{}'", path.display()),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_paths_follow_tag_layout() {
        let tag = Tag::new("HD72946B-am-molliere-mass-freeab").unwrap();
        assert_eq!(
            artifact_path(Path::new("figures"), &tag, ArtifactKind::PtProfile, "pdf"),
            PathBuf::from("figures/HD72946B-am-molliere-mass-freeab/HD72946B-am-molliere-mass-freeab_pt_profile.pdf")
        );
    }

    #[test]
    fn external_renderer_needs_a_command() {
        assert!(ExternalRenderer::new(Vec::new()).is_none());
    }
}
