use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::args::{
    ArgumentTemplate, DELTA_PLACEHOLDER, OUTPUT_PLACEHOLDER, SOURCE_FLAG, SOURCE_PLACEHOLDER,
};
use crate::config::PatcherConfig;
use crate::error::{IoContext, PatchError, PatchResult};
use crate::runner::ToolRunner;
use crate::scratch::ScratchFile;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The tool exited non-zero; holds everything it printed.
    ToolFailed(String),
}

impl ApplyOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyOutcome::Applied => f.write_str("All OK."),
            ApplyOutcome::ToolFailed(output) => write!(f, "Error: {output}"),
        }
    }
}

pub struct PatchApplier<'a> {
    config: &'a PatcherConfig,
    runner: &'a dyn ToolRunner,
}

impl<'a> PatchApplier<'a> {
    pub fn new(config: &'a PatcherConfig, runner: &'a dyn ToolRunner) -> Self {
        Self { config, runner }
    }

    /// Applies `delta`. Without a source or output the tool falls back on
    /// the names stored in the delta header, resolved relative to the
    /// directory of whichever file was given.
    pub fn apply(
        &self,
        source: Option<&Path>,
        delta: &Path,
        output: Option<&Path>,
    ) -> PatchResult<ApplyOutcome> {
        if delta.as_os_str().is_empty() {
            return Err(PatchError::Validation("Please specify the delta file.".into()));
        }
        // The tool may run in another directory, so relative names are
        // pinned to ours first.
        let delta = absolute(delta)?;
        let source = source
            .filter(|path| !path.as_os_str().is_empty())
            .map(absolute)
            .transpose()?;
        let output = output
            .filter(|path| !path.as_os_str().is_empty())
            .map(absolute)
            .transpose()?;
        let (delta, source, output) = (delta.as_path(), source.as_deref(), output.as_deref());

        let source_copy = match source {
            Some(path) if self.config.needs_scratch_copy(path) => {
                Some(ScratchFile::copy_of(path, &self.config.scratch_dir()?)?)
            }
            _ => None,
        };
        let output_scratch = match output {
            Some(path) if self.config.needs_scratch_copy(path) => {
                Some(ScratchFile::reserve(&self.config.scratch_dir()?))
            }
            _ => None,
        };
        let tool_source = match (&source_copy, source) {
            (Some(copy), _) => Some(copy.path()),
            (None, path) => path,
        };
        let tool_output = match (&output_scratch, output) {
            (Some(scratch), _) => Some(scratch.path()),
            (None, path) => path,
        };

        let mut args = ArgumentTemplate::new(self.config.apply_args());
        let mut working_dir = None;
        match (tool_source, tool_output) {
            (Some(src), None) => {
                args = args
                    .remove(OUTPUT_PLACEHOLDER)
                    .substitute_path(SOURCE_PLACEHOLDER, src);
                working_dir = source.and_then(parent_dir);
            }
            (None, Some(out)) => {
                args = args
                    .remove(SOURCE_PLACEHOLDER)
                    .remove(SOURCE_FLAG)
                    .substitute_path(OUTPUT_PLACEHOLDER, out);
                working_dir = parent_dir(delta);
            }
            (None, None) => {
                args = args
                    .remove(OUTPUT_PLACEHOLDER)
                    .remove(SOURCE_PLACEHOLDER)
                    .remove(SOURCE_FLAG);
                working_dir = parent_dir(delta);
            }
            (Some(src), Some(out)) => {
                args = args
                    .substitute_path(SOURCE_PLACEHOLDER, src)
                    .substitute_path(OUTPUT_PLACEHOLDER, out);
            }
        }
        let args = args.substitute_path(DELTA_PLACEHOLDER, delta);
        debug!(args = args.as_str(), ?working_dir, "applying delta");

        let result = self
            .runner
            .run(self.config.tool_name(), args.as_str(), working_dir);
        drop(source_copy);
        let output_text = result?;
        if !output_text.success() {
            return Ok(ApplyOutcome::ToolFailed(output_text.combined_output));
        }

        if let (Some(scratch), Some(destination)) = (output_scratch, output) {
            scratch.persist(destination)?;
        }
        Ok(ApplyOutcome::Applied)
    }
}

fn absolute(path: &Path) -> PatchResult<PathBuf> {
    std::path::absolute(path).at_path("resolving", path)
}

fn parent_dir(path: &Path) -> Option<&Path> {
    path.parent().filter(|dir| !dir.as_os_str().is_empty())
}
