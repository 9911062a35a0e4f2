use std::path::{Path, PathBuf};

use crate::args::{CreatePreset, DEFAULT_APPLY_ARGS};
use crate::encoding::path_fits_legacy_codepage;
use crate::episode::OutputPlace;
use crate::error::{IoContext, PatchError, PatchResult};
use crate::runner::{DEFAULT_TOOL, WINDOWS_64BIT_TOOL};
use crate::settings::Settings;

pub const RESOURCE_DIR_NAME: &str = "resources";

/// Everything the create/apply pipeline needs to know, fixed for the
/// duration of one run.
#[derive(Debug, Clone)]
pub struct PatcherConfig {
    /// Where script templates and distributable binaries live.
    pub resource_dir: PathBuf,
    /// Directory for temporary copies; the current directory when unset.
    pub scratch_dir: Option<PathBuf>,
    pub tool_name: Option<String>,
    pub run_64bit_tool: bool,
    pub dist_64bit_tool: bool,
    pub create_preset: CreatePreset,
    pub custom_create_args: Option<String>,
    pub custom_apply_args: Option<String>,
    pub store_names_only: bool,
    pub force_unicode: bool,
    pub decoy_header: bool,
    pub legacy_codepage_workaround: bool,
    pub always_copy: bool,
    pub skip_alternative_scripts: bool,
    pub apply_all_scripts: bool,
    pub distribute_binaries: bool,
    pub detect_episode: bool,
    pub output_place: OutputPlace,
    pub default_output_dir: Option<PathBuf>,
}

impl Default for PatcherConfig {
    fn default() -> Self {
        Self {
            resource_dir: default_resource_dir(),
            scratch_dir: None,
            tool_name: None,
            run_64bit_tool: false,
            dist_64bit_tool: false,
            create_preset: CreatePreset::Default,
            custom_create_args: None,
            custom_apply_args: None,
            store_names_only: false,
            force_unicode: false,
            decoy_header: false,
            legacy_codepage_workaround: cfg!(windows),
            always_copy: false,
            skip_alternative_scripts: false,
            apply_all_scripts: false,
            distribute_binaries: true,
            detect_episode: true,
            output_place: OutputPlace::Source,
            default_output_dir: None,
        }
    }
}

impl PatcherConfig {
    /// Executable to launch; the 64-bit build only exists for Windows.
    pub fn tool_name(&self) -> &str {
        if let Some(name) = self.tool_name.as_deref().filter(|name| !name.trim().is_empty()) {
            return name;
        }
        if self.run_64bit_tool && cfg!(windows) {
            WINDOWS_64BIT_TOOL
        } else {
            DEFAULT_TOOL
        }
    }

    pub fn create_args(&self) -> &str {
        self.custom_create_args
            .as_deref()
            .unwrap_or_else(|| self.create_preset.arguments())
    }

    pub fn apply_args(&self) -> &str {
        self.custom_apply_args.as_deref().unwrap_or(DEFAULT_APPLY_ARGS)
    }

    /// True when `path` has to be copied to an ASCII scratch name before the
    /// tool can open it.
    pub fn needs_scratch_copy(&self, path: &Path) -> bool {
        self.legacy_codepage_workaround && (self.always_copy || !path_fits_legacy_codepage(path))
    }

    pub fn scratch_dir(&self) -> PatchResult<PathBuf> {
        let cwd = std::env::current_dir().io_context(|| "resolving current directory".into())?;
        Ok(match &self.scratch_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => cwd.join(dir),
            None => cwd,
        })
    }

    /// Builds a config from stored settings. Absent keys keep their
    /// defaults and only the literal `true` switches a flag on.
    pub fn from_settings(settings: &Settings) -> PatchResult<Self> {
        let mut config = Self::default();
        let flag = |name: &str, default: bool| settings.read(name).map_or(default, |v| v == "true");
        let text = |name: &str| {
            settings
                .read(name)
                .filter(|value| !value.trim().is_empty())
                .map(str::to_string)
        };

        if let Some(dir) = text(keys::RESOURCE_DIR) {
            config.resource_dir = PathBuf::from(dir);
        }
        config.scratch_dir = text(keys::SCRATCH_DIR).map(PathBuf::from);
        config.tool_name = text(keys::TOOL_NAME);
        config.run_64bit_tool = flag(keys::RUN_64BIT, config.run_64bit_tool);
        config.dist_64bit_tool = flag(keys::DIST_64BIT, config.dist_64bit_tool);
        if let Some(preset) = text(keys::CREATE_PRESET) {
            config.create_preset = parse_preset(&preset)?;
        }
        config.custom_create_args = text(keys::CREATE_CUSTOM_ARGS);
        config.custom_apply_args = text(keys::APPLY_CUSTOM_ARGS);
        config.store_names_only = flag(keys::STORE_NAMES_ONLY, config.store_names_only);
        config.force_unicode = flag(keys::FORCE_UNICODE, config.force_unicode);
        config.decoy_header = flag(keys::DECOY_HEADER, config.decoy_header);
        config.legacy_codepage_workaround =
            flag(keys::CODEPAGE_WORKAROUND, config.legacy_codepage_workaround);
        config.always_copy = flag(keys::ALWAYS_COPY, config.always_copy);
        config.skip_alternative_scripts =
            flag(keys::SKIP_ALTERNATIVE, config.skip_alternative_scripts);
        config.apply_all_scripts = flag(keys::APPLY_ALL, config.apply_all_scripts);
        config.distribute_binaries = flag(keys::DISTRIBUTE_BINARIES, config.distribute_binaries);
        config.detect_episode = flag(keys::DETECT_EPISODE, config.detect_episode);
        if let Some(place) = text(keys::OUTPUT_PLACE) {
            config.output_place = place.parse()?;
        }
        config.default_output_dir = text(keys::DEFAULT_OUTPUT_DIR).map(PathBuf::from);

        Ok(config)
    }
}

pub fn parse_preset(value: &str) -> PatchResult<CreatePreset> {
    match value.trim().to_ascii_lowercase().as_str() {
        "default" => Ok(CreatePreset::Default),
        "high-compression" => Ok(CreatePreset::HighCompression),
        "high-memory" => Ok(CreatePreset::HighMemory),
        other => Err(PatchError::Config(format!(
            "unknown create preset '{other}' (expected default, high-compression or high-memory)"
        ))),
    }
}

/// Setting names understood by [`PatcherConfig::from_settings`].
pub mod keys {
    pub const RESOURCE_DIR: &str = "tool.resource_dir";
    pub const TOOL_NAME: &str = "tool.name";
    pub const RUN_64BIT: &str = "tool.run_64bit";
    pub const DIST_64BIT: &str = "tool.dist_64bit";
    pub const SCRATCH_DIR: &str = "create.scratch_dir";
    pub const CREATE_PRESET: &str = "create.preset";
    pub const CREATE_CUSTOM_ARGS: &str = "create.custom_args";
    pub const STORE_NAMES_ONLY: &str = "create.store_names_only";
    pub const FORCE_UNICODE: &str = "create.force_unicode";
    pub const DECOY_HEADER: &str = "create.decoy_header";
    pub const CODEPAGE_WORKAROUND: &str = "create.codepage_workaround";
    pub const ALWAYS_COPY: &str = "create.always_copy";
    pub const APPLY_CUSTOM_ARGS: &str = "apply.custom_args";
    pub const SKIP_ALTERNATIVE: &str = "scripts.skip_alternative";
    pub const APPLY_ALL: &str = "scripts.apply_all";
    pub const DISTRIBUTE_BINARIES: &str = "scripts.distribute_binaries";
    pub const DETECT_EPISODE: &str = "output.detect_episode";
    pub const OUTPUT_PLACE: &str = "output.place";
    pub const DEFAULT_OUTPUT_DIR: &str = "output.default_dir";

    pub const ALL: &[&str] = &[
        RESOURCE_DIR,
        TOOL_NAME,
        RUN_64BIT,
        DIST_64BIT,
        SCRATCH_DIR,
        CREATE_PRESET,
        CREATE_CUSTOM_ARGS,
        STORE_NAMES_ONLY,
        FORCE_UNICODE,
        DECOY_HEADER,
        CODEPAGE_WORKAROUND,
        ALWAYS_COPY,
        APPLY_CUSTOM_ARGS,
        SKIP_ALTERNATIVE,
        APPLY_ALL,
        DISTRIBUTE_BINARIES,
        DETECT_EPISODE,
        OUTPUT_PLACE,
        DEFAULT_OUTPUT_DIR,
    ];
}

fn default_resource_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(RESOURCE_DIR_NAME)))
        .unwrap_or_else(|| PathBuf::from(RESOURCE_DIR_NAME))
}

/// `<executable>.ini` next to the running binary.
pub fn default_settings_path() -> PathBuf {
    std::env::current_exe()
        .map(|exe| exe.with_extension("ini"))
        .unwrap_or_else(|_| PathBuf::from("deltabatch.ini"))
}
