//! Stage definitions and argument templates.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_render_produces() -> String {
    "{output_dir}/{stem}.glb".to_string()
}

/// A configured pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageDefinition {
    /// Runs an external program.
    Command(CommandStage),
    /// Calls the render service.
    Render(RenderStage),
}

/// A subprocess stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandStage {
    /// Unique stage name.
    pub name: String,
    /// Program to execute.
    pub program: String,
    /// Argument templates.
    #[serde(default)]
    pub args: Vec<String>,
    /// Output path templates that must exist after a zero exit.
    #[serde(default)]
    pub produces: Vec<String>,
    /// Kill the child after this many seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// A render service stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderStage {
    /// Unique stage name.
    pub name: String,
    /// Where to write the returned asset.
    #[serde(default = "default_render_produces")]
    pub produces: String,
}

impl StageDefinition {
    /// The stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Command(stage) => &stage.name,
            Self::Render(stage) => &stage.name,
        }
    }

    /// `command` or `render`.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Command(_) => "command",
            Self::Render(_) => "render",
        }
    }

    /// Creates a render stage writing `<output_dir>/<stem>.glb`.
    #[must_use]
    pub fn render(name: impl Into<String>) -> Self {
        Self::Render(RenderStage {
            name: name.into(),
            produces: default_render_produces(),
        })
    }

    /// Creates a command stage.
    #[must_use]
    pub fn command(name: impl Into<String>, program: impl Into<String>, args: &[&str]) -> Self {
        Self::Command(CommandStage {
            name: name.into(),
            program: program.into(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
            produces: Vec::new(),
            timeout_seconds: None,
        })
    }

    /// Adds a declared output. Replaces the output of a render stage.
    #[must_use]
    pub fn producing(mut self, template: impl Into<String>) -> Self {
        match &mut self {
            Self::Command(stage) => stage.produces.push(template.into()),
            Self::Render(stage) => stage.produces = template.into(),
        }
        self
    }

    /// Sets the timeout of a command stage. No effect on render stages.
    #[must_use]
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        if let Self::Command(stage) = &mut self {
            stage.timeout_seconds = Some(seconds);
        }
        self
    }
}

/// Values substituted into `{input}`, `{stem}`, `{workdir}` and `{output_dir}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateVars {
    /// Input file of the stage.
    pub input: PathBuf,
    /// Task key.
    pub stem: String,
    /// Task working directory.
    pub workdir: PathBuf,
    /// Directory whose contents the watcher uploads.
    pub output_dir: PathBuf,
}

impl TemplateVars {
    /// Substitutes every placeholder in `template`.
    #[must_use]
    pub fn render(&self, template: &str) -> String {
        template
            .replace("{input}", &self.input.display().to_string())
            .replace("{stem}", &self.stem)
            .replace("{workdir}", &self.workdir.display().to_string())
            .replace("{output_dir}", &self.output_dir.display().to_string())
    }

    /// Substitutes and resolves relative results against the workdir.
    #[must_use]
    pub fn render_path(&self, template: &str) -> PathBuf {
        let rendered = PathBuf::from(self.render(template));
        if rendered.is_absolute() {
            rendered
        } else {
            self.workdir.join(rendered)
        }
    }

    /// Same variables with a different input.
    #[must_use]
    pub fn with_input(&self, input: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            ..self.clone()
        }
    }
}

/// A command stage with its templates resolved for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    /// Stage name.
    pub name: String,
    /// Program to execute.
    pub program: String,
    /// Working directory of the child.
    pub cwd: PathBuf,
    /// Outputs checked after a zero exit.
    pub produces: Vec<PathBuf>,
    /// Kill deadline.
    pub timeout: Option<Duration>,
}

impl StageSpec {
    /// Creates a spec with no declared outputs and no timeout.
    #[must_use]
    pub fn new(name: impl Into<String>, program: impl Into<String>, cwd: impl AsRef<Path>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            cwd: cwd.as_ref().to_path_buf(),
            produces: Vec::new(),
            timeout: None,
        }
    }

    /// Adds a declared output.
    #[must_use]
    pub fn with_produces(mut self, path: impl Into<PathBuf>) -> Self {
        self.produces.push(path.into());
        self
    }

    /// Sets the kill deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl CommandStage {
    /// Resolves templates into a runnable spec and its arguments.
    #[must_use]
    pub fn resolve(&self, vars: &TemplateVars) -> (StageSpec, Vec<String>) {
        let spec = StageSpec {
            name: self.name.clone(),
            program: vars.render(&self.program),
            cwd: vars.workdir.clone(),
            produces: self.produces.iter().map(|p| vars.render_path(p)).collect(),
            timeout: self.timeout_seconds.map(Duration::from_secs),
        };
        let args = self.args.iter().map(|a| vars.render(a)).collect();
        (spec, args)
    }
}
