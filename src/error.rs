use std::fmt;
use std::path::Path;

use thiserror::Error;

/// Failure of one step in a create or apply pipeline.
///
/// The `Display` text is what follows `Task failed: ` in the run log.
#[derive(Error, Debug)]
pub enum PatchError {
    #[error("{0}")]
    Validation(String),

    #[error("{output}")]
    ToolFailed { code: i32, output: String },

    #[error("unable to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Config(String),

    #[error("invalid tool arguments: {0}")]
    Arguments(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Tool,
    FileSystem,
    Configuration,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Tool => "tool",
            ErrorKind::FileSystem => "file-system",
            ErrorKind::Configuration => "configuration",
        };
        f.write_str(label)
    }
}

impl PatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PatchError::Validation(_) => ErrorKind::Validation,
            PatchError::ToolFailed { .. } | PatchError::Spawn { .. } => ErrorKind::Tool,
            PatchError::Arguments(_) => ErrorKind::Tool,
            PatchError::Io { .. } => ErrorKind::FileSystem,
            PatchError::Config(_) => ErrorKind::Configuration,
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        PatchError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Attaches a path-bearing context message to `std::io::Result`, in the
/// spirit of `anyhow::Context` but producing a typed [`PatchError`].
pub trait IoContext<T> {
    fn io_context<F>(self, describe: F) -> Result<T, PatchError>
    where
        F: FnOnce() -> String;

    fn at_path(self, action: &str, path: &Path) -> Result<T, PatchError>
    where
        Self: Sized,
    {
        self.io_context(|| format!("{action} {}", path.display()))
    }
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<F>(self, describe: F) -> Result<T, PatchError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|source| PatchError::io(describe(), source))
    }
}

pub fn missing_parent(path: &Path) -> PatchError {
    PatchError::Config(format!(
        "\"Apply all\" scripts can't be created when the output directory ({}) is a root \
         directory, they need to live one level above it.",
        path.display()
    ))
}

pub type PatchResult<T> = Result<T, PatchError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn tool_failure_displays_captured_output() {
        let err = PatchError::ToolFailed {
            code: 1,
            output: "xdelta3: target window checksum mismatch".into(),
        };
        assert_eq!(err.to_string(), "xdelta3: target window checksum mismatch");
        assert_eq!(err.kind(), ErrorKind::Tool);
    }

    #[test]
    fn io_context_includes_path() {
        let result: io::Result<()> = Err(io::Error::new(io::ErrorKind::NotFound, "gone"));
        let err = result
            .at_path("copying", Path::new("a/b.mkv"))
            .expect_err("must fail");
        assert_eq!(err.kind(), ErrorKind::FileSystem);
        assert_eq!(err.to_string(), "copying a/b.mkv: gone");
    }
}
