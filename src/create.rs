use std::path::{Path, PathBuf};

use tracing::debug;

use crate::args::{
    AppHeader, ArgumentTemplate, DELTA_PLACEHOLDER, NO_EXTERNAL_DECOMPRESSION, PATCHED_PLACEHOLDER,
    SOURCE_PLACEHOLDER,
};
use crate::config::PatcherConfig;
use crate::encoding::needs_unicode;
use crate::error::{PatchError, PatchResult};
use crate::logging::LogSink;
use crate::runner::ToolRunner;
use crate::scratch::ScratchFile;

pub const DELTA_FILE_NAME: &str = "changes.vcdiff";

// The tool sees U+FF02 as an ASCII quote once the name is squeezed through
// the legacy codepage.
const FULLWIDTH_QUOTE: char = '\u{FF02}';

/// Produces `changes.vcdiff` for one source/target pair.
pub struct PatchCreator<'a> {
    config: &'a PatcherConfig,
    runner: &'a dyn ToolRunner,
}

impl<'a> PatchCreator<'a> {
    pub fn new(config: &'a PatcherConfig, runner: &'a dyn ToolRunner) -> Self {
        Self { config, runner }
    }

    /// Runs the tool and returns the path of the written delta. Temporary
    /// copies are gone by the time this returns, whatever the outcome.
    pub fn create(
        &self,
        source: &Path,
        target: &Path,
        output_dir: &Path,
        log: &dyn LogSink,
    ) -> PatchResult<PathBuf> {
        let mut source_name = file_name(source);
        let mut target_name = file_name(target);
        let embed_names = self.config.store_names_only
            || needs_unicode(&source_name, self.config.force_unicode)
            || needs_unicode(&target_name, self.config.force_unicode);

        let mut source_copy = None;
        let mut target_copy = None;
        if self.config.needs_scratch_copy(source) {
            log.line("Making a temporary copy of the source file...");
            source_copy = Some(ScratchFile::copy_of(source, &self.config.scratch_dir()?)?);
            source_name = source_name.replace(FULLWIDTH_QUOTE, "");
        }
        if self.config.needs_scratch_copy(target) {
            log.line("Making a temporary copy of the target file...");
            target_copy = Some(ScratchFile::copy_of(target, &self.config.scratch_dir()?)?);
            target_name = target_name.replace(FULLWIDTH_QUOTE, "");
        }
        let tool_source = source_copy.as_ref().map_or(source, ScratchFile::path);
        let tool_target = target_copy.as_ref().map_or(target, ScratchFile::path);
        let delta = output_dir.join(DELTA_FILE_NAME);

        let header = if self.config.decoy_header {
            AppHeader::Decoy
        } else if embed_names {
            AppHeader::Names {
                target: target_name,
                source: source_name,
            }
        } else {
            AppHeader::None
        };

        let args = ArgumentTemplate::new(self.config.create_args())
            .prefixed(NO_EXTERNAL_DECOMPRESSION)
            .substitute_path(SOURCE_PLACEHOLDER, tool_source)
            .substitute_path(PATCHED_PLACEHOLDER, tool_target)
            .substitute_path(DELTA_PLACEHOLDER, &delta)
            .without_header()
            .with_header(&header);
        debug!(args = args.as_str(), "creating delta");

        let result = self.runner.run(self.config.tool_name(), args.as_str(), None);
        drop(source_copy);
        drop(target_copy);

        let output = result?;
        if !output.success() {
            return Err(PatchError::ToolFailed {
                code: output.exit_code,
                output: output.combined_output.trim().to_string(),
            });
        }
        Ok(delta)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
