//! Accept filter over task source objects.

use serde::{Deserialize, Serialize};

use super::Task;

/// Decides which source objects are pipeline inputs.
///
/// Bucket notifications fire for every object written, including the
/// pipeline's own intermediates. Only objects under `prefix` with one of
/// `extensions` and none of `exclude_suffixes` are processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFilter {
    /// Required object key prefix. Empty accepts any key.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Accepted file extensions, without the dot, compared case-insensitively.
    /// Empty accepts any extension.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Object key suffixes that are never inputs.
    #[serde(default = "default_exclude_suffixes")]
    pub exclude_suffixes: Vec<String>,
}

fn default_prefix() -> String {
    "fullbodyimages/".to_string()
}

fn default_extensions() -> Vec<String> {
    vec!["png".to_string()]
}

fn default_exclude_suffixes() -> Vec<String> {
    vec!["_rgba.png".to_string()]
}

impl Default for SourceFilter {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            extensions: default_extensions(),
            exclude_suffixes: default_exclude_suffixes(),
        }
    }
}

impl SourceFilter {
    /// A filter that accepts every object.
    #[must_use]
    pub fn accept_all() -> Self {
        Self {
            prefix: String::new(),
            extensions: Vec::new(),
            exclude_suffixes: Vec::new(),
        }
    }

    /// Why `task` is not an input, or `None` if it is.
    #[must_use]
    pub fn rejection(&self, task: &Task) -> Option<String> {
        let key = task.source_blob_ref.key.as_str();

        if !key.starts_with(&self.prefix) {
            return Some(format!("'{key}' is not under '{}'", self.prefix));
        }

        if !self.extensions.is_empty() {
            let extension = key.rsplit_once('.').map_or("", |(_, ext)| ext);
            if !self
                .extensions
                .iter()
                .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(extension))
            {
                return Some(format!("'{key}' does not have an accepted extension"));
            }
        }

        self.exclude_suffixes
            .iter()
            .find(|suffix| key.ends_with(suffix.as_str()))
            .map(|suffix| format!("'{key}' ends with excluded suffix '{suffix}'"))
    }
}
