//! Output artifacts produced by a pipeline run.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// The kind of content an artifact holds, derived from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// Binary glTF asset.
    Glb,
    /// Wavefront mesh.
    Obj,
    /// Point cloud.
    Ply,
    /// Raster image.
    Image,
    /// Anything else.
    Other,
}

impl ContentKind {
    /// Guesses the kind from a file path.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "glb" => Self::Glb,
            "obj" => Self::Obj,
            "ply" => Self::Ply,
            "png" | "jpg" | "jpeg" => Self::Image,
            _ => Self::Other,
        }
    }

    /// Returns the MIME type used when uploading.
    #[must_use]
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Glb => "model/gltf-binary",
            Self::Obj => "model/obj",
            Self::Ply => "application/ply",
            Self::Image => "image/png",
            Self::Other => "application/octet-stream",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Glb => write!(f, "glb"),
            Self::Obj => write!(f, "obj"),
            Self::Ply => write!(f, "ply"),
            Self::Image => write!(f, "image"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// A local file waiting to be uploaded.
///
/// The pipeline run that created it owns it until the upload confirms; after
/// that the object store owns the remote copy and the local file is deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputArtifact {
    /// Where the file sits in the task working directory.
    pub local_path: PathBuf,
    /// The destination key in the object store.
    pub remote_key: String,
    /// What the file contains.
    pub content_kind: ContentKind,
}

impl OutputArtifact {
    /// Creates an artifact whose remote key is `<prefix>/<file name>`.
    #[must_use]
    pub fn under_prefix(local_path: impl Into<PathBuf>, prefix: &str) -> Self {
        let local_path = local_path.into();
        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let prefix = prefix.trim_matches('/');
        let remote_key = if prefix.is_empty() {
            file_name
        } else {
            format!("{prefix}/{file_name}")
        };
        let content_kind = ContentKind::from_path(&local_path);
        Self {
            local_path,
            remote_key,
            content_kind,
        }
    }
}
