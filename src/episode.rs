use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PatchError, PatchResult};

const DELIMITERS: &[char] = &['_', '-', ' ', '[', ']', 'v', '.'];
const VERSION_MARK: char = 'v';
const FALLBACK_DIR_NAME: &str = "patch";

/// A numeric token seen while scanning a file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodeCandidate {
    /// Matched text including its delimiters.
    pub text: String,
    pub number: i32,
    pub digit_width: usize,
    pub priority: i32,
}

/// Best guess at the episode number inside `filename`, zero-padded to the
/// width it was written with. Empty when nothing looks like one.
///
/// Digit runs between two delimiters are scored and the highest score wins,
/// the leftmost on ties. A run that opens the name (no leading delimiter)
/// counts as the first token.
pub fn extract(filename: &str) -> String {
    let found = candidates(filename);
    let Some(best) = best_candidate(&found) else {
        return String::new();
    };
    format!("{:0width$}", best.number, width = best.digit_width)
}

pub fn candidates(filename: &str) -> Vec<EpisodeCandidate> {
    let chars: Vec<char> = filename.chars().collect();
    let mut found = Vec::new();
    let mut run_start = 0usize;
    let mut leading: Option<char> = None;

    for (idx, &ch) in chars.iter().enumerate() {
        if !DELIMITERS.contains(&ch) {
            continue;
        }
        let run: String = chars[run_start..idx].iter().collect();
        if let Some(candidate) = score(&run, leading, ch) {
            found.push(candidate);
        }
        leading = Some(ch);
        run_start = idx + 1;
    }

    found
}

fn score(run: &str, leading: Option<char>, trailing: char) -> Option<EpisodeCandidate> {
    if run.is_empty() || !run.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    // Runs too long for a 32-bit number are not episode numbers.
    let number: i32 = run.parse().ok()?;
    let digit_width = run.len();

    let mut priority = 0;
    if trailing == VERSION_MARK {
        priority += 1;
        if leading == Some(VERSION_MARK) {
            priority -= 1;
        }
    } else if leading == Some(trailing) {
        priority += 1;
    }

    let first_token = leading.is_none();
    let token_len = if first_token {
        digit_width + 1
    } else {
        digit_width + 2
    };
    if (first_token && token_len == 3) || (!first_token && digit_width == 2) {
        priority += 1;
    }

    let mut text = String::with_capacity(token_len);
    if let Some(open) = leading {
        text.push(open);
    }
    text.push_str(run);
    text.push(trailing);

    Some(EpisodeCandidate {
        text,
        number,
        digit_width,
        priority,
    })
}

fn best_candidate(candidates: &[EpisodeCandidate]) -> Option<&EpisodeCandidate> {
    let mut best: Option<&EpisodeCandidate> = None;
    for candidate in candidates {
        match best {
            Some(current) if candidate.priority <= current.priority => {}
            _ => best = Some(candidate),
        }
    }
    best
}

/// Where a new job's output folder goes by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputPlace {
    #[default]
    Source,
    Target,
    Custom,
}

impl std::str::FromStr for OutputPlace {
    type Err = PatchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "source" | "0" => Ok(OutputPlace::Source),
            "target" | "1" => Ok(OutputPlace::Target),
            "custom" | "2" => Ok(OutputPlace::Custom),
            other => Err(PatchError::Config(format!(
                "unknown output place '{other}' (expected source, target or custom)"
            ))),
        }
    }
}

/// Output folder for a job: `<base>/<episode>` when detection finds a
/// number, `<base>/patch` otherwise.
pub fn suggest_output_dir(
    source: &Path,
    target: &Path,
    place: OutputPlace,
    default_dir: Option<&Path>,
    detect_episode: bool,
) -> PatchResult<PathBuf> {
    let (base, named_by) = match place {
        OutputPlace::Source => (parent_dir(source), source),
        OutputPlace::Target => (parent_dir(target), target),
        OutputPlace::Custom => {
            let dir = default_dir.filter(|dir| !dir.as_os_str().is_empty()).ok_or_else(|| {
                PatchError::Validation("Please specify the default output directory.".into())
            })?;
            (dir.to_path_buf(), source)
        }
    };

    let mut leaf = String::new();
    if detect_episode {
        if let Some(name) = named_by.file_name().and_then(|name| name.to_str()) {
            leaf = extract(name);
        }
    }
    if leaf.is_empty() {
        leaf = FALLBACK_DIR_NAME.to_string();
    }

    Ok(base.join(leaf))
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent()
        .map(Path::to_path_buf)
        .unwrap_or_default()
}
