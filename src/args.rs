use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{PatchError, PatchResult};

pub const DEFAULT_CREATE_ARGS: &str = "-f -e -s %source% %patched% %vcdiff%";
pub const HIGH_COMPRESSION_CREATE_ARGS: &str =
    "-e -f -7 -B1073741824 -S djw -s %source% %patched% %vcdiff%";
pub const HIGH_MEMORY_CREATE_ARGS: &str = "-e -f -B1073741824 -s %source% %patched% %vcdiff%";
pub const DEFAULT_APPLY_ARGS: &str = "-d -f -s %source% %vcdiff% %output%";

pub const SOURCE_PLACEHOLDER: &str = "%source%";
pub const PATCHED_PLACEHOLDER: &str = "%patched%";
pub const OUTPUT_PLACEHOLDER: &str = "%output%";
pub const DELTA_PLACEHOLDER: &str = "%vcdiff%";

/// Disables the tool's external decompression of gzip/xz style inputs.
pub const NO_EXTERNAL_DECOMPRESSION: &str = "-D";
pub const SOURCE_FLAG: &str = "-s ";
const HEADER_FLAG: &str = "-A=";

const DECOY_HEADER_TARGET: &str = "**STAR**STAR**STAR** Why am I suddenly seeing stars?";
const DECOY_HEADER_SOURCE: &str =
    "???!@#$%^&*() Either use the provided scripts or type the full command. Thx.";

// Only a flag that starts a token counts; "-A=" inside a quoted path does not.
static HEADER_OPTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)-A=").expect("header option pattern"));

/// What to put in the delta's application header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppHeader {
    None,
    Names { target: String, source: String },
    Decoy,
}

impl AppHeader {
    fn payload(&self) -> Option<String> {
        match self {
            AppHeader::None => None,
            // output name, empty compression field, input name, empty compression field
            AppHeader::Names { target, source } => Some(format!("{target}//{source}/")),
            AppHeader::Decoy => Some(format!("{DECOY_HEADER_TARGET}//{DECOY_HEADER_SOURCE}/")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreatePreset {
    Default,
    HighCompression,
    HighMemory,
}

impl CreatePreset {
    pub fn arguments(self) -> &'static str {
        match self {
            CreatePreset::Default => DEFAULT_CREATE_ARGS,
            CreatePreset::HighCompression => HIGH_COMPRESSION_CREATE_ARGS,
            CreatePreset::HighMemory => HIGH_MEMORY_CREATE_ARGS,
        }
    }
}

/// Argument string for one tool invocation, built up by textual
/// substitution of `%placeholder%` tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentTemplate {
    text: String,
}

impl ArgumentTemplate {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn prefixed(mut self, flag: &str) -> Self {
        self.text = join_args(flag, &self.text);
        self
    }

    pub fn substitute(mut self, placeholder: &str, value: &str) -> Self {
        self.text = self.text.replace(placeholder, value);
        self
    }

    pub fn substitute_path(self, placeholder: &str, path: &Path) -> Self {
        let quoted = quote_path(path);
        self.substitute(placeholder, &quoted)
    }

    /// Drops every literal occurrence of `fragment`, e.g. the source flag
    /// when no source file is given.
    pub fn remove(self, fragment: &str) -> Self {
        self.substitute(fragment, "")
    }

    /// Removes any header option already present. The tool honours only the
    /// last one and wants every option before the file names, so the wanted
    /// header has to be re-added at the front afterwards.
    pub fn without_header(mut self) -> Self {
        self.text = strip_header_option(&self.text);
        self
    }

    pub fn with_header(self, header: &AppHeader) -> Self {
        match header.payload() {
            Some(payload) => {
                let flag = format!("{HEADER_FLAG}{}", quote(&payload));
                self.prefixed(&flag)
            }
            None => self,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

/// Wraps `text` in double quotes following the Windows command-line rules:
/// backslashes are literal unless they run into a quote, in which case they
/// are doubled, and embedded quotes become `\"`. UNC prefixes and trailing
/// separators survive [`split_arguments`] unchanged.
pub fn quote(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('"');
    let mut backslashes = 0usize;
    for ch in text.chars() {
        match ch {
            '\\' => backslashes += 1,
            '"' => {
                push_backslashes(&mut quoted, backslashes * 2 + 1);
                quoted.push('"');
                backslashes = 0;
            }
            _ => {
                push_backslashes(&mut quoted, backslashes);
                quoted.push(ch);
                backslashes = 0;
            }
        }
    }
    push_backslashes(&mut quoted, backslashes * 2);
    quoted.push('"');
    quoted
}

pub fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}

/// Splits an argument string into argv the way the Windows C runtime does.
/// Whitespace separates arguments outside quotes, `2n` backslashes before a
/// quote give `n` backslashes and toggle quoting, `2n + 1` give `n` plus a
/// literal quote, and any other backslash is kept as written.
pub fn split_arguments(args: &str) -> PatchResult<Vec<String>> {
    let mut argv = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut quoted = false;
    let mut backslashes = 0usize;

    for ch in args.chars() {
        match ch {
            '\\' => {
                backslashes += 1;
                in_arg = true;
            }
            '"' => {
                push_backslashes(&mut current, backslashes / 2);
                if backslashes % 2 == 1 {
                    current.push('"');
                } else {
                    quoted = !quoted;
                }
                backslashes = 0;
                in_arg = true;
            }
            _ if ch.is_whitespace() && !quoted => {
                push_backslashes(&mut current, backslashes);
                backslashes = 0;
                if in_arg {
                    argv.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            _ => {
                push_backslashes(&mut current, backslashes);
                backslashes = 0;
                current.push(ch);
                in_arg = true;
            }
        }
    }

    if quoted {
        return Err(PatchError::Arguments(format!(
            "missing closing quote in '{args}'"
        )));
    }
    push_backslashes(&mut current, backslashes);
    if in_arg {
        argv.push(current);
    }
    Ok(argv)
}

fn push_backslashes(out: &mut String, count: usize) {
    out.extend(std::iter::repeat_n('\\', count));
}

fn join_args(left: &str, right: &str) -> String {
    match (left.is_empty(), right.is_empty()) {
        (true, _) => right.to_string(),
        (_, true) => left.to_string(),
        _ => format!("{left} {right}"),
    }
}

/// Cuts every `-A=value` option out of `args`. A quoted value is removed
/// through its closing quote plus one delimiter; an unquoted value through
/// the first whitespace. An unterminated quote swallows the rest.
pub fn strip_header_option(args: &str) -> String {
    let mut rest = args.to_string();
    while let Some(found) = HEADER_OPTION.find(&rest) {
        let flag_start = found.end() - HEADER_FLAG.len();
        let before = rest[..flag_start].trim_end();
        let value = &rest[found.end()..];
        let after = match value.strip_prefix('"') {
            Some(quoted) => match quoted.find('"') {
                Some(close) => skip_one_char(&quoted[close + 1..]),
                None => "",
            },
            None => match value.find(char::is_whitespace) {
                Some(space) => skip_one_char(&value[space..]),
                None => "",
            },
        };
        rest = join_args(before, after.trim_start());
    }
    rest
}

fn skip_one_char(text: &str) -> &str {
    let mut chars = text.chars();
    chars.next();
    chars.as_str()
}

/// Script dialects the apply scripts are written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellDialect {
    /// `sh` with file names inside single quotes.
    Posix,
    /// `cmd.exe` batch files.
    Batch,
    /// PowerShell with file names inside single quotes.
    PowerShell,
}

impl ShellDialect {
    pub fn escape(self, text: &str) -> String {
        match self {
            ShellDialect::Posix => escape_posix_single_quoted(text),
            ShellDialect::Batch => escape_batch(text),
            ShellDialect::PowerShell => escape_powershell_single_quoted(text),
        }
    }
}

/// `'` becomes `'"'"'`: close the quote, emit a double-quoted quote, reopen.
pub fn escape_posix_single_quoted(text: &str) -> String {
    text.replace('\'', "'\"'\"'")
}

/// `%`, `^` and `&` are special to cmd.exe. `\/<>"*:?|` cannot appear in a
/// Windows file name at all.
pub fn escape_batch(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '%' => out.push_str("%%"),
            '^' => out.push_str("^^"),
            '&' => out.push_str("^&"),
            other => out.push(other),
        }
    }
    out
}

pub fn escape_powershell_single_quoted(text: &str) -> String {
    text.replace('\'', "''")
}
