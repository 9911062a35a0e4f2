use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::config::PatcherConfig;
use crate::episode::suggest_output_dir;
use crate::files::{ListOptions, pair_directories};
use crate::queue::Job;

/// A file of jobs to append to the queue.
#[derive(Debug, Deserialize)]
pub struct JobPlan {
    pub jobs: Vec<PlanEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanEntry {
    Pair(PairPlan),
    Directories(DirectoriesPlan),
}

impl PlanEntry {
    pub fn kind(&self) -> &'static str {
        match self {
            PlanEntry::Pair(_) => "pair",
            PlanEntry::Directories(_) => "directories",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PairPlan {
    pub source: PathBuf,
    pub target: PathBuf,
    /// Derived from the file names and config when absent.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct DirectoriesPlan {
    pub source_dir: PathBuf,
    pub target_dir: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub include_hidden: bool,
}

pub fn load_plan(path: &Path) -> Result<JobPlan> {
    let data = fs::read(path).with_context(|| format!("reading plan {}", path.display()))?;
    if path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
    {
        serde_json::from_slice(&data).with_context(|| format!("parsing plan {}", path.display()))
    } else {
        serde_yaml::from_slice(&data).with_context(|| format!("parsing plan {}", path.display()))
    }
}

/// Turns every plan entry into queue jobs, in plan order.
pub fn expand_plan(plan: &JobPlan, config: &PatcherConfig) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();
    for (idx, entry) in plan.jobs.iter().enumerate() {
        let describe = || format!("plan entry {} ({})", idx + 1, entry.kind());
        match entry {
            PlanEntry::Pair(pair) => {
                let output_dir = match &pair.output_dir {
                    Some(dir) => dir.clone(),
                    None => suggest_output_dir(
                        &pair.source,
                        &pair.target,
                        config.output_place,
                        config.default_output_dir.as_deref(),
                        config.detect_episode,
                    )
                    .with_context(describe)?,
                };
                jobs.push(Job::new(&pair.source, &pair.target, output_dir));
            }
            PlanEntry::Directories(dirs) => {
                let options = ListOptions {
                    include: dirs.include.clone(),
                    include_hidden: dirs.include_hidden,
                };
                let pairs =
                    pair_directories(&dirs.source_dir, &dirs.target_dir, &dirs.output_dir, &options)
                        .with_context(describe)?;
                jobs.extend(
                    pairs
                        .into_iter()
                        .map(|pair| Job::new(pair.source, pair.target, pair.output_dir)),
                );
            }
        }
    }
    Ok(jobs)
}
