use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, unbounded};
use tracing::debug;

#[cfg(not(windows))]
use crate::args::split_arguments;
use crate::error::{PatchError, PatchResult};

pub const DEFAULT_TOOL: &str = "xdelta3";
pub const WINDOWS_64BIT_TOOL: &str = "xdelta3.x86_64.exe";

/// Exit status and interleaved stdout/stderr of one tool run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub combined_output: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs the external delta tool. The process runner is the production
/// implementation; tests substitute scripted fakes.
pub trait ToolRunner: Send + Sync {
    fn run(
        &self,
        program: &str,
        args: &str,
        working_dir: Option<&Path>,
    ) -> PatchResult<ToolOutput>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ToolRunner for ProcessRunner {
    fn run(
        &self,
        program: &str,
        args: &str,
        working_dir: Option<&Path>,
    ) -> PatchResult<ToolOutput> {
        let mut command = Command::new(program);
        pass_arguments(&mut command, args)?;
        debug!(program, args, ?working_dir, "spawning delta tool");
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = working_dir {
            command.current_dir(dir);
        }
        hide_console_window(&mut command);

        let mut child = command.spawn().map_err(|source| PatchError::Spawn {
            program: program.to_string(),
            source,
        })?;

        let (line_tx, line_rx) = unbounded::<String>();
        let readers = [
            spawn_line_reader(child.stdout.take(), line_tx.clone()),
            spawn_line_reader(child.stderr.take(), line_tx),
        ];

        let mut combined_output = String::new();
        for line in line_rx.iter() {
            combined_output.push_str(&line);
            combined_output.push('\n');
        }

        let status = child.wait().map_err(|source| PatchError::Spawn {
            program: program.to_string(),
            source,
        })?;
        for reader in readers.into_iter().flatten() {
            let _ = reader.join();
        }

        let exit_code = status.code().unwrap_or(-1);
        debug!(program, exit_code, "delta tool exited");
        Ok(ToolOutput {
            exit_code,
            combined_output,
        })
    }
}

fn spawn_line_reader<R>(stream: Option<R>, lines: Sender<String>) -> Option<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    let stream = stream?;
    Some(thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\r', '\n']).to_string();
                    if lines.send(line).is_err() {
                        break;
                    }
                }
            }
        }
    }))
}

// The argument string is already a Windows command line, so it goes to the
// process untouched.
#[cfg(windows)]
fn pass_arguments(command: &mut Command, args: &str) -> PatchResult<()> {
    use std::os::windows::process::CommandExt;
    if !args.trim().is_empty() {
        command.raw_arg(args);
    }
    Ok(())
}

#[cfg(not(windows))]
fn pass_arguments(command: &mut Command, args: &str) -> PatchResult<()> {
    command.args(split_arguments(args)?);
    Ok(())
}

#[cfg(windows)]
fn hide_console_window(command: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    command.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn hide_console_window(_command: &mut Command) {}


#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::args::quote;

    #[test]
    fn captures_both_streams_and_exit_code() {
        let output = ProcessRunner
            .run("sh", "-c \"echo to-stdout; echo to-stderr >&2; exit 3\"", None)
            .expect("sh runs");
        assert_eq!(output.exit_code, 3);
        assert!(!output.success());
        assert!(output.combined_output.contains("to-stdout\n"));
        assert!(output.combined_output.contains("to-stderr\n"));
    }

    #[test]
    fn honours_working_directory() {
        let dir = tempfile::tempdir().expect("temp dir");
        let output = ProcessRunner
            .run("sh", "-c pwd", Some(dir.path()))
            .expect("sh runs");
        assert!(output.success());
        let reported = std::path::PathBuf::from(output.combined_output.trim());
        assert_eq!(
            reported.canonicalize().expect("canonical pwd"),
            dir.path().canonicalize().expect("canonical temp")
        );
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = ProcessRunner
            .run("deltabatch-no-such-tool", "-h", None)
            .expect_err("spawn fails");
        assert_eq!(err.kind(), crate::error::ErrorKind::Tool);
    }

    #[test]
    fn backslashes_reach_the_tool_as_written() {
        let unc = r"\\server\share\Show 01.mkv";
        let args = format!("-c \"printf %s \\\"$0\\\"\" {}", quote(unc));
        let output = ProcessRunner.run("sh", &args, None).expect("sh runs");
        assert!(output.success());
        assert_eq!(output.combined_output.trim_end_matches('\n'), unc);
    }

    #[test]
    fn unbalanced_quotes_are_rejected() {
        let err = ProcessRunner
            .run("sh", "-c \"echo", None)
            .expect_err("bad quoting");
        assert!(matches!(err, PatchError::Arguments(_)));
    }
}
