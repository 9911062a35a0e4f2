use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;
use uuid::Uuid;

use crate::error::{IoContext, PatchResult};

/// A randomly named `.tmp` file standing in for a path the external tool
/// cannot open. The file is deleted when the guard drops unless it was
/// persisted to its final name first.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
    armed: bool,
}

impl ScratchFile {
    /// Copies `original` into `dir` under a random ASCII name.
    pub fn copy_of(original: &Path, dir: &Path) -> PatchResult<Self> {
        let scratch = Self::reserve(dir);
        fs::copy(original, &scratch.path).io_context(|| {
            format!(
                "making a temporary copy of {} at {}",
                original.display(),
                scratch.path.display()
            )
        })?;
        Ok(scratch)
    }

    /// Picks a fresh name in `dir` without creating anything; the tool
    /// writes the file.
    pub fn reserve(dir: &Path) -> Self {
        let path = dir.join(format!("{}.tmp", Uuid::new_v4()));
        Self { path, armed: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Moves the scratch file to `destination`, replacing what is there.
    pub fn persist(mut self, destination: &Path) -> PatchResult<()> {
        if fs::rename(&self.path, destination).is_err() {
            // rename fails across volumes; fall back to copy + delete
            fs::copy(&self.path, destination).io_context(|| {
                format!(
                    "moving {} to {}",
                    self.path.display(),
                    destination.display()
                )
            })?;
            let _ = fs::remove_file(&self.path);
        }
        self.armed = false;
        Ok(())
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), %err, "leaving temporary file behind"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn copy_is_removed_on_drop() {
        let dir = tempdir().expect("temp dir");
        let original = dir.path().join("Über.mkv");
        fs::write(&original, b"payload").expect("write original");

        let scratch_path = {
            let scratch = ScratchFile::copy_of(&original, dir.path()).expect("copy");
            assert_eq!(fs::read(scratch.path()).expect("read copy"), b"payload");
            assert!(scratch.path().to_str().expect("utf-8").is_ascii());
            scratch.path().to_path_buf()
        };
        assert!(!scratch_path.exists());
        assert!(original.exists());
    }

    #[test]
    fn persisted_file_survives_drop() {
        let dir = tempdir().expect("temp dir");
        let scratch = ScratchFile::reserve(dir.path());
        fs::write(scratch.path(), b"patched").expect("tool output");
        let destination = dir.path().join("Ép 01.mkv");
        scratch.persist(&destination).expect("persist");
        assert_eq!(fs::read(&destination).expect("read"), b"patched");
        assert_eq!(fs::read_dir(dir.path()).expect("list").count(), 1);
    }

    #[test]
    fn reserved_but_unwritten_file_drops_quietly() {
        let dir = tempdir().expect("temp dir");
        let scratch = ScratchFile::reserve(dir.path());
        assert!(!scratch.path().exists());
        drop(scratch);
    }

    #[test]
    fn copy_of_missing_file_fails() {
        let dir = tempdir().expect("temp dir");
        let err = ScratchFile::copy_of(&dir.path().join("missing.mkv"), dir.path())
            .expect_err("missing source");
        assert!(err.to_string().contains("making a temporary copy"));
        assert_eq!(fs::read_dir(dir.path()).expect("list").count(), 0);
    }
}
