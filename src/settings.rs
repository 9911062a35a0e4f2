use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{IoContext, PatchResult};
use crate::files::write_via_temp;

/// Flat `name=value` settings file. Names never contain `=` or line breaks;
/// values are everything after the first `=`.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl Settings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            values: BTreeMap::new(),
        }
    }

    /// Opens `path`, treating a missing file as empty.
    pub fn open(path: impl Into<PathBuf>) -> PatchResult<Self> {
        let mut settings = Self::new(path);
        settings.load()?;
        Ok(settings)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Returns false, storing nothing, when `name` cannot be represented.
    pub fn write(&mut self, name: &str, value: &str) -> bool {
        if name.contains(['=', '\r', '\n']) {
            return false;
        }
        self.values.insert(name.to_string(), value.to_string());
        true
    }

    pub fn load(&mut self) -> PatchResult<()> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err).at_path("reading settings", &self.path),
        };
        for line in text.lines() {
            match line.find('=') {
                Some(pos) if pos > 0 => {
                    self.values
                        .insert(line[..pos].to_string(), line[pos + 1..].to_string());
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn flush(&self) -> PatchResult<()> {
        write_via_temp(&self.path, self.to_string().as_bytes())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl std::fmt::Display for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (name, value) in &self.values {
            writeln!(f, "{name}={value}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_rejects_unrepresentable_names() {
        let mut settings = Settings::new("unused.ini");
        assert!(!settings.write("a=b", "x"));
        assert!(!settings.write("line\nbreak", "x"));
        assert!(!settings.write("cr\r", "x"));
        assert!(settings.write("tool.run_64bit", "true"));
        assert_eq!(settings.read("tool.run_64bit"), Some("true"));
        assert_eq!(settings.read("a=b"), None);
    }

    #[test]
    fn flush_then_load_keeps_values() {
        let temp = tempdir().expect("temp dir");
        let path = temp.path().join("deltabatch.ini");
        let mut settings = Settings::new(&path);
        settings.write("create.custom_args", "-e -9 -s %source% %patched% %vcdiff%");
        settings.write("output.default_dir", "");
        settings.flush().expect("flush");

        let reloaded = Settings::open(&path).expect("open");
        assert_eq!(
            reloaded.read("create.custom_args"),
            Some("-e -9 -s %source% %patched% %vcdiff%")
        );
        assert_eq!(reloaded.read("output.default_dir"), Some(""));
    }

    #[test]
    fn load_skips_lines_without_name_and_last_duplicate_wins() {
        let temp = tempdir().expect("temp dir");
        let path = temp.path().join("legacy.ini");
        fs::write(&path, "=orphan\nno separator\nkey=1\r\nkey=2\nempty=\n").expect("write");
        let settings = Settings::open(&path).expect("open");
        assert_eq!(settings.read("key"), Some("2"));
        assert_eq!(settings.read("empty"), Some(""));
        assert_eq!(settings.iter().count(), 2);
    }

    #[test]
    fn missing_file_loads_empty() {
        let temp = tempdir().expect("temp dir");
        let settings = Settings::open(temp.path().join("absent.ini")).expect("open");
        assert_eq!(settings.iter().count(), 0);
    }
}
