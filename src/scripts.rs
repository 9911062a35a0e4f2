//! Apply-script generation.
//!
//! Every job folder gets one ready-to-run script per platform plus a
//! readme, all with the job's file names baked in. Optionally a cumulative
//! "apply all" script per platform one level up calls each job's script in
//! turn.

use std::borrow::Cow;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::debug;

use crate::args::ShellDialect;
use crate::config::PatcherConfig;
use crate::encoding::{decode_text, encode_utf8, needs_unicode};
use crate::error::{IoContext, PatchResult, missing_parent};
use crate::files::{mark_executable, write_via_temp};

pub const LINUX_SCRIPT: &str = "apply_patch_linux.sh";
pub const MAC_SCRIPT: &str = "apply_patch_mac.command";
pub const WINDOWS_SCRIPT: &str = "apply_patch_windows.bat";
pub const POWERSHELL_SUBSCRIPT: &str = "subscript1.ps1";
pub const README: &str = "how_to_apply_this_patch.txt";

pub const ALTERNATIVE_SCRIPTS: [&str; 3] = [
    "apply_patch_windows_alternative.bat",
    "apply_patch_mac_alternative.command",
    "apply_patch_linux_alternative.sh",
];

pub const APPLY_ALL_WINDOWS: &str = "apply_all_patches_windows.bat";
pub const APPLY_ALL_LINUX: &str = "apply_all_patches_linux.sh";
pub const APPLY_ALL_MAC: &str = "apply_all_patches_mac.command";

const APPLY_ALL_WINDOWS_HEADER: &str = "chdir /d %~dp0\r\n@echo off\r\nsetlocal";
const APPLY_ALL_POSIX_HEADER: &str = "#!/bin/sh\ncd \"$(cd \"$(dirname \"$0\")\" && pwd)\"";

const BATCH_MOVE_SOURCE: (&str, &str) = ("set movesourcefile=0", "set movesourcefile=1");
const BATCH_MOVE_TARGET: (&str, &str) = ("set movetargetfile=0", "set movetargetfile=1");
const PS_MOVE_SOURCE: (&str, &str) = ("movesourcefile = 0", "movesourcefile = 1");
const PS_MOVE_TARGET: (&str, &str) = ("movetargetfile = 0", "movetargetfile = 1");
const CODEPAGE_SWITCH: (&str, &str) = ("chcp 65001", "rem chcp 65001");

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("&(sourcefile|targetfile)&").expect("placeholder pattern"));

/// File names substituted into one job's templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateContext {
    pub source_name: String,
    pub target_name: String,
}

impl TemplateContext {
    pub fn new(source_name: impl Into<String>, target_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            target_name: target_name.into(),
        }
    }

    /// Replaces `&sourcefile&` and `&targetfile&` in a single pass, so a
    /// file name that itself contains a placeholder is left alone.
    pub fn render(&self, template: &str, dialect: Option<ShellDialect>) -> String {
        let escape = |name: &str| match dialect {
            Some(dialect) => dialect.escape(name),
            None => name.to_string(),
        };
        let source = escape(&self.source_name);
        let target = escape(&self.target_name);
        PLACEHOLDER
            .replace_all(template, |caps: &Captures<'_>| {
                if &caps[1] == "sourcefile" {
                    source.clone()
                } else {
                    target.clone()
                }
            })
            .into_owned()
    }
}

pub struct ScriptGenerator<'a> {
    config: &'a PatcherConfig,
}

impl<'a> ScriptGenerator<'a> {
    pub fn new(config: &'a PatcherConfig) -> Self {
        Self { config }
    }

    /// Writes the apply scripts for one job into `output_dir`. Only file
    /// names are embedded; the scripts expect to run next to the files.
    pub fn emit(&self, source_name: &str, target_name: &str, output_dir: &Path) -> PatchResult<()> {
        let apply_all = if self.config.apply_all_scripts {
            Some(apply_all_location(output_dir)?)
        } else {
            None
        };

        if !self.config.skip_alternative_scripts {
            for name in ALTERNATIVE_SCRIPTS {
                let from = self.config.resource_dir.join(name);
                let to = output_dir.join(name);
                fs::copy(&from, &to).io_context(|| {
                    format!("copying {} to {}", from.display(), to.display())
                })?;
                if !name.ends_with(".bat") {
                    mark_executable(&to)?;
                }
            }
        }

        let context = TemplateContext::new(source_name, target_name);
        let force = self.config.force_unicode;
        let source_unicode = needs_unicode(source_name, force);
        let target_unicode = needs_unicode(target_name, force);

        let mut batch = self.load_template(WINDOWS_SCRIPT)?;
        let mut powershell = self.load_template(POWERSHELL_SUBSCRIPT)?;
        if source_unicode {
            batch = flip(batch, BATCH_MOVE_SOURCE);
            powershell = flip(powershell, PS_MOVE_SOURCE);
        }
        if target_unicode {
            batch = flip(batch, BATCH_MOVE_TARGET);
            powershell = flip(powershell, PS_MOVE_TARGET);
        }
        if !source_unicode && !target_unicode {
            batch = flip(batch, CODEPAGE_SWITCH);
        }

        let linux = context.render(&self.load_template(LINUX_SCRIPT)?, Some(ShellDialect::Posix));
        let mac = context.render(&self.load_template(MAC_SCRIPT)?, Some(ShellDialect::Posix));
        let readme = context.render(&self.load_template(README)?, None);
        let batch = context.render(&batch, Some(ShellDialect::Batch));
        let powershell = context.render(&powershell, Some(ShellDialect::PowerShell));

        let rendered = [
            (WINDOWS_SCRIPT, batch, false),
            (LINUX_SCRIPT, linux, false),
            (MAC_SCRIPT, mac, false),
            (README, readme, true),
            (POWERSHELL_SUBSCRIPT, powershell, true),
        ];
        for (name, text, with_bom) in rendered {
            let path = output_dir.join(name);
            write_via_temp(&path, &encode_utf8(&text, with_bom))?;
            if name == LINUX_SCRIPT || name == MAC_SCRIPT {
                mark_executable(&path)?;
            }
        }

        if let Some(location) = apply_all {
            location.append()?;
        }
        Ok(())
    }

    fn load_template(&self, name: &str) -> PatchResult<String> {
        let path = self.config.resource_dir.join(name);
        let bytes = fs::read(&path).at_path("reading template", &path)?;
        let decoded = decode_text(&bytes);
        debug!(template = name, encoding = decoded.decision.encoding.name(), source = %decoded.decision.source, "loaded template");
        Ok(decoded.text)
    }
}

fn flip(text: String, (from, to): (&str, &str)) -> String {
    text.replace(from, to)
}

/// Where the cumulative scripts for a job folder go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyAllLocation {
    pub parent: PathBuf,
    pub job_dir_name: String,
}

/// The parent of `output_dir` and the folder name scripts refer to. Fails
/// when `output_dir` is a filesystem root.
pub fn apply_all_location(output_dir: &Path) -> PatchResult<ApplyAllLocation> {
    let absolute: Cow<'_, Path> = if output_dir.is_absolute() {
        Cow::Borrowed(output_dir)
    } else {
        let cwd = std::env::current_dir().io_context(|| "resolving current directory".into())?;
        Cow::Owned(cwd.join(output_dir))
    };
    let parent = absolute.parent().ok_or_else(|| missing_parent(output_dir))?;
    let job_dir_name = absolute
        .file_name()
        .ok_or_else(|| missing_parent(output_dir))?
        .to_string_lossy()
        .into_owned();
    Ok(ApplyAllLocation {
        parent: parent.to_path_buf(),
        job_dir_name,
    })
}

impl ApplyAllLocation {
    /// Adds this job to every cumulative script, creating missing scripts
    /// with their boilerplate first.
    pub fn append(&self) -> PatchResult<()> {
        let windows_dir = ShellDialect::Batch.escape(&self.job_dir_name);
        let posix_dir = ShellDialect::Posix.escape(&self.job_dir_name);
        let entries = [
            (
                APPLY_ALL_WINDOWS,
                APPLY_ALL_WINDOWS_HEADER,
                format!("\r\ncall \".\\{windows_dir}\\{WINDOWS_SCRIPT}\""),
            ),
            (
                APPLY_ALL_LINUX,
                APPLY_ALL_POSIX_HEADER,
                format!("\nsh './{posix_dir}/{LINUX_SCRIPT}'"),
            ),
            (
                APPLY_ALL_MAC,
                APPLY_ALL_POSIX_HEADER,
                format!("\nsh './{posix_dir}/{MAC_SCRIPT}'"),
            ),
        ];

        for (name, header, line) in entries {
            let path = self.parent.join(name);
            let fresh = !path.exists();
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .at_path("opening", &path)?;
            if fresh {
                file.write_all(header.as_bytes()).at_path("writing", &path)?;
            }
            file.write_all(line.as_bytes()).at_path("appending to", &path)?;
            if fresh && name != APPLY_ALL_WINDOWS {
                mark_executable(&path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::{TempDir, tempdir};

    const BATCH_TEMPLATE: &str = "@echo off\r\nchcp 65001\r\nset movesourcefile=0\r\nset movetargetfile=0\r\nset sourcefile=&sourcefile&\r\nset targetfile=&targetfile&\r\n";
    const PS_TEMPLATE: &str = "$movesourcefile = 0\r\n$movetargetfile = 0\r\n$sourcefile = '&sourcefile&'\r\n$targetfile = '&targetfile&'\r\n";
    const POSIX_TEMPLATE: &str = "#!/bin/sh\nsourcefile='&sourcefile&'\ntargetfile='&targetfile&'\n";
    const README_TEMPLATE: &str = "Put &sourcefile& next to the script to get &targetfile&.\n";

    fn resources() -> TempDir {
        let dir = tempdir().expect("resource dir");
        let files = [
            (WINDOWS_SCRIPT, BATCH_TEMPLATE),
            (POWERSHELL_SUBSCRIPT, PS_TEMPLATE),
            (LINUX_SCRIPT, POSIX_TEMPLATE),
            (MAC_SCRIPT, POSIX_TEMPLATE),
            (README, README_TEMPLATE),
        ];
        for (name, body) in files {
            fs::write(dir.path().join(name), body).expect("template");
        }
        for name in ALTERNATIVE_SCRIPTS {
            fs::write(dir.path().join(name), format!("alternative {name}")).expect("alt");
        }
        dir
    }

    fn config(resources: &TempDir) -> PatcherConfig {
        PatcherConfig {
            resource_dir: resources.path().to_path_buf(),
            ..PatcherConfig::default()
        }
    }

    fn read(path: &Path) -> String {
        fs::read_to_string(path).expect("read output")
    }

    #[test]
    fn renders_every_dialect_with_its_escaping() {
        let res = resources();
        let out = tempdir().expect("out dir");
        ScriptGenerator::new(&config(&res))
            .emit("Bob's 100% R&D.mkv", "Bob's v2.mkv", out.path())
            .expect("emit");

        let linux = read(&out.path().join(LINUX_SCRIPT));
        assert!(linux.contains("sourcefile='Bob'\"'\"'s 100% R&D.mkv'"));
        let batch = read(&out.path().join(WINDOWS_SCRIPT));
        assert!(batch.contains("set sourcefile=Bob's 100%% R^&D.mkv\r\n"));
        assert!(batch.contains("rem chcp 65001"));
        assert!(batch.contains("set movesourcefile=0"));
        let readme = fs::read(out.path().join(README)).expect("readme");
        assert!(readme.starts_with(&[0xEF, 0xBB, 0xBF]));
        assert!(String::from_utf8_lossy(&readme).contains("Put Bob's 100% R&D.mkv next"));
        let ps = fs::read(out.path().join(POWERSHELL_SUBSCRIPT)).expect("ps1");
        assert!(ps.starts_with(&[0xEF, 0xBB, 0xBF]));
        assert!(String::from_utf8_lossy(&ps).contains("$sourcefile = 'Bob''s 100% R&D.mkv'"));
        assert!(!fs::read(out.path().join(LINUX_SCRIPT)).expect("sh").starts_with(&[0xEF]));

        for name in ALTERNATIVE_SCRIPTS {
            assert_eq!(read(&out.path().join(name)), format!("alternative {name}"));
        }
    }

    #[test]
    fn unicode_names_flip_move_markers_independently() {
        let res = resources();
        let out = tempdir().expect("out dir");
        ScriptGenerator::new(&config(&res))
            .emit("plain.mkv", "進撃 01.mkv", out.path())
            .expect("emit");

        let batch = read(&out.path().join(WINDOWS_SCRIPT));
        assert!(batch.contains("set movesourcefile=0"));
        assert!(batch.contains("set movetargetfile=1"));
        assert!(batch.contains("\r\nchcp 65001"));
        assert!(!batch.contains("rem chcp"));
        let ps = read(&out.path().join(POWERSHELL_SUBSCRIPT));
        assert!(ps.contains("$movesourcefile = 0"));
        assert!(ps.contains("$movetargetfile = 1"));
    }

    #[test]
    fn placeholder_inside_a_name_is_not_expanded() {
        let context = TemplateContext::new("&targetfile&.mkv", "t.mkv");
        assert_eq!(
            context.render("'&sourcefile&' -> '&targetfile&'", None),
            "'&targetfile&.mkv' -> 't.mkv'"
        );
    }

    #[test]
    fn powershell_literal_round_trips() {
        let name = "it's 'quoted'.mkv";
        let rendered = TemplateContext::new(name, "x")
            .render("'&sourcefile&'", Some(ShellDialect::PowerShell));
        let inner = &rendered[1..rendered.len() - 1];
        assert_eq!(inner.replace("''", "'"), name);
        assert!(!inner.replace("''", "").contains('\''));
    }

    #[test]
    fn skipping_alternatives_copies_nothing_extra() {
        let res = resources();
        let out = tempdir().expect("out dir");
        let config = PatcherConfig {
            skip_alternative_scripts: true,
            ..config(&res)
        };
        ScriptGenerator::new(&config)
            .emit("a.mkv", "b.mkv", out.path())
            .expect("emit");
        assert_eq!(fs::read_dir(out.path()).expect("list").count(), 5);
    }

    #[test]
    fn apply_all_collects_jobs_in_order() {
        let res = resources();
        let root = tempdir().expect("root");
        let config = PatcherConfig {
            apply_all_scripts: true,
            ..config(&res)
        };
        let generator = ScriptGenerator::new(&config);
        for (dir, name) in [("01", "a01.mkv"), ("02", "a02.mkv")] {
            let out = root.path().join(dir);
            fs::create_dir_all(&out).expect("job dir");
            generator.emit(name, name, &out).expect("emit");
        }

        let linux = read(&root.path().join(APPLY_ALL_LINUX));
        assert_eq!(
            linux,
            format!(
                "{APPLY_ALL_POSIX_HEADER}\nsh './01/apply_patch_linux.sh'\nsh './02/apply_patch_linux.sh'"
            )
        );
        let mac = read(&root.path().join(APPLY_ALL_MAC));
        assert_eq!(mac.matches("\nsh './").count(), 2);
        let windows = read(&root.path().join(APPLY_ALL_WINDOWS));
        assert_eq!(
            windows,
            "chdir /d %~dp0\r\n@echo off\r\nsetlocal\r\ncall \".\\01\\apply_patch_windows.bat\"\r\ncall \".\\02\\apply_patch_windows.bat\""
        );
    }

    #[cfg(unix)]
    #[test]
    fn posix_scripts_are_executable() {
        use std::os::unix::fs::PermissionsExt;
        let res = resources();
        let root = tempdir().expect("root");
        let out = root.path().join("05");
        fs::create_dir_all(&out).expect("job dir");
        let config = PatcherConfig {
            apply_all_scripts: true,
            ..config(&res)
        };
        ScriptGenerator::new(&config)
            .emit("a.mkv", "b.mkv", &out)
            .expect("emit");
        for path in [
            out.join(LINUX_SCRIPT),
            out.join(MAC_SCRIPT),
            root.path().join(APPLY_ALL_LINUX),
        ] {
            let mode = fs::metadata(&path).expect("meta").permissions().mode();
            assert_eq!(mode & 0o111, 0o111, "{}", path.display());
        }
    }

    #[cfg(unix)]
    #[test]
    fn root_output_dir_fails_before_writing() {
        let res = resources();
        let config = PatcherConfig {
            apply_all_scripts: true,
            ..config(&res)
        };
        let err = ScriptGenerator::new(&config)
            .emit("a.mkv", "b.mkv", Path::new("/"))
            .expect_err("root has no parent");
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("one level above it"));
        assert!(!Path::new("/apply_patch_windows_alternative.bat").exists());
    }

    #[test]
    fn missing_template_names_the_file() {
        let res = tempdir().expect("empty resources");
        let out = tempdir().expect("out dir");
        let config = PatcherConfig {
            resource_dir: res.path().to_path_buf(),
            skip_alternative_scripts: true,
            ..PatcherConfig::default()
        };
        let err = ScriptGenerator::new(&config)
            .emit("a.mkv", "b.mkv", out.path())
            .expect_err("no templates");
        assert_eq!(err.kind(), ErrorKind::FileSystem);
        assert!(err.to_string().contains(WINDOWS_SCRIPT));
    }

    #[test]
    fn shipped_templates_carry_markers() {
        let shipped = Path::new(env!("CARGO_MANIFEST_DIR")).join("resources");
        let batch = fs::read_to_string(shipped.join(WINDOWS_SCRIPT)).expect("bat");
        for marker in [BATCH_MOVE_SOURCE.0, BATCH_MOVE_TARGET.0, CODEPAGE_SWITCH.0] {
            assert!(batch.contains(marker), "{marker}");
        }
        let ps = fs::read_to_string(shipped.join(POWERSHELL_SUBSCRIPT)).expect("ps1");
        assert!(ps.contains(PS_MOVE_SOURCE.0) && ps.contains(PS_MOVE_TARGET.0));
        for name in [WINDOWS_SCRIPT, POWERSHELL_SUBSCRIPT, LINUX_SCRIPT, MAC_SCRIPT, README] {
            let text = fs::read_to_string(shipped.join(name)).expect("template");
            assert!(text.contains("&sourcefile&"), "{name}");
            assert!(text.contains("&targetfile&"), "{name}");
        }
        for name in ALTERNATIVE_SCRIPTS {
            assert!(shipped.join(name).is_file(), "{name}");
        }
    }
}
