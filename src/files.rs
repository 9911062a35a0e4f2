use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use time::OffsetDateTime;
use walkdir::{DirEntry, WalkDir};

use crate::error::{IoContext, PatchError, PatchResult};

/// A source/target pair produced by matching two directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePair {
    pub source: PathBuf,
    pub target: PathBuf,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub include: Vec<String>,
    pub include_hidden: bool,
}

/// Regular files directly inside `dir`, sorted by path.
pub fn list_files(dir: &Path, options: &ListOptions) -> PatchResult<Vec<PathBuf>> {
    let include = build_include_globs(&options.include)?;
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| options.include_hidden || !is_hidden(entry));

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|err| {
            let source = err
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("directory loop"));
            PatchError::io(format!("listing {}", dir.display()), source)
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(set) = &include {
            if !set.is_match(entry.file_name()) {
                continue;
            }
        }
        files.push(entry.into_path());
    }

    files.sort();
    Ok(files)
}

/// Pairs the files of two directories in sorted order. The longer list is
/// truncated to the shorter one; pair `n` (1-based) writes into
/// `<output_root>/<nn>`.
pub fn pair_directories(
    source_dir: &Path,
    target_dir: &Path,
    output_root: &Path,
    options: &ListOptions,
) -> PatchResult<Vec<FilePair>> {
    let sources = list_files(source_dir, options)?;
    let targets = list_files(target_dir, options)?;
    let count = sources.len().min(targets.len());
    if count == 0 {
        return Err(PatchError::Validation(
            "No files found in one of the directories!".into(),
        ));
    }

    Ok(sources
        .into_iter()
        .zip(targets)
        .take(count)
        .enumerate()
        .map(|(idx, (source, target))| FilePair {
            source,
            target,
            output_dir: output_root.join(format!("{:02}", idx + 1)),
        })
        .collect())
}

fn build_include_globs(patterns: &[String]) -> PatchResult<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }

    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|err| PatchError::Validation(format!("invalid include glob '{pattern}': {err}")))?;
        builder.add(glob);
    }

    builder
        .build()
        .map(Some)
        .map_err(|err| PatchError::Validation(format!("unable to build include globs: {err}")))
}

// The root is handed to the filter too; it is never treated as hidden.
fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with('.'))
            .unwrap_or(false)
}

/// Replaces `path` with `data` through a sibling temp file and a rename, so
/// readers never observe a half-written file.
pub fn write_via_temp(path: &Path, data: &[u8]) -> PatchResult<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(dir) = parent {
        fs::create_dir_all(dir).at_path("creating directory", dir)?;
    }
    let base_dir = parent.unwrap_or_else(|| Path::new("."));
    let unique = format!(
        ".deltabatch-tmp-{}-{}",
        std::process::id(),
        OffsetDateTime::now_utc().unix_timestamp_nanos()
    );
    let temp_path = base_dir.join(unique);
    {
        let mut file = fs::File::create(&temp_path).at_path("creating temp file", &temp_path)?;
        file.write_all(data)
            .at_path("writing temp file", &temp_path)?;
        file.sync_all().at_path("syncing temp file", &temp_path)?;
    }
    fs::rename(&temp_path, path).or_else(|err| {
        let _ = fs::remove_file(&temp_path);
        Err(err).at_path("replacing", path)
    })?;
    Ok(())
}

#[cfg(unix)]
pub fn mark_executable(path: &Path) -> PatchResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).at_path("marking executable", path)
}

#[cfg(not(unix))]
pub fn mark_executable(_path: &Path) -> PatchResult<()> {
    Ok(())
}
