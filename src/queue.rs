use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{IoContext, PatchError, PatchResult};
use crate::files::write_via_temp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    New,
    Running,
    Finished,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::New => "new",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
        };
        f.write_str(label)
    }
}

/// One patch-creation task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub source: PathBuf,
    pub target: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub status: JobStatus,
}

impl Job {
    pub fn new(
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            target: target.into(),
            output_dir: output_dir.into(),
            status: JobStatus::New,
        }
    }
}

/// Replacement values for an edit; `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct JobEdit {
    pub source: Option<PathBuf>,
    pub target: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
}

/// Ordered job list shared between whoever fills it and the worker that
/// drains it. Clones share the same list.
///
/// A queue opened with [`JobQueue::attached`] also tracks its queue file:
/// [`JobQueue::sync`] folds in jobs other processes added, edited or removed
/// there while keeping the status changes made through this queue.
#[derive(Debug, Clone, Default)]
pub struct JobQueue {
    jobs: Arc<Mutex<Vec<Job>>>,
    // Ids whose status changed here since the last sync. Locked after `jobs`.
    touched: Arc<Mutex<HashSet<Uuid>>>,
    store: Option<Arc<PathBuf>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueFile {
    #[serde(default)]
    jobs: Vec<Job>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_jobs(jobs: Vec<Job>) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(jobs)),
            ..Self::default()
        }
    }

    /// Loads `path` like [`JobQueue::load`] and remembers it for
    /// [`JobQueue::sync`].
    pub fn attached(path: impl Into<PathBuf>) -> PatchResult<Self> {
        let path = path.into();
        let jobs = read_jobs(&path)?;
        Ok(Self {
            store: Some(Arc::new(path)),
            ..Self::from_jobs(jobs)
        })
    }

    pub fn push(&self, job: Job) -> Uuid {
        let id = job.id;
        self.jobs.lock().push(job);
        id
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Job> {
        self.jobs.lock().clone()
    }

    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.jobs.lock().iter().find(|job| job.id == id).cloned()
    }

    /// Flips the job at `index` from `New` to `Running` and returns a copy.
    /// `None` when the index is out of range or the job is not new.
    pub fn claim(&self, index: usize) -> Option<Job> {
        let mut jobs = self.jobs.lock();
        let job = jobs.get_mut(index)?;
        if job.status != JobStatus::New {
            return None;
        }
        job.status = JobStatus::Running;
        let claimed = job.clone();
        self.touched.lock().insert(claimed.id);
        Some(claimed)
    }

    /// Marks `id` finished. False when the job was removed meanwhile.
    pub fn finish(&self, id: Uuid) -> bool {
        self.set_status(id, JobStatus::Finished)
    }

    pub fn reset(&self, id: Uuid) -> bool {
        self.set_status(id, JobStatus::New)
    }

    pub fn reset_all(&self) -> usize {
        let mut jobs = self.jobs.lock();
        let mut touched = self.touched.lock();
        let mut count = 0;
        for job in jobs.iter_mut().filter(|job| job.status != JobStatus::New) {
            job.status = JobStatus::New;
            touched.insert(job.id);
            count += 1;
        }
        count
    }

    pub fn remove(&self, id: Uuid) -> Option<Job> {
        let mut jobs = self.jobs.lock();
        let index = jobs.iter().position(|job| job.id == id)?;
        Some(jobs.remove(index))
    }

    /// Drops every job, or only finished ones.
    pub fn clear(&self, finished_only: bool) -> usize {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        if finished_only {
            jobs.retain(|job| job.status != JobStatus::Finished);
        } else {
            jobs.clear();
        }
        before - jobs.len()
    }

    pub fn edit(&self, id: Uuid, edit: JobEdit) -> PatchResult<Job> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or_else(|| PatchError::Validation(format!("no job with id {id}")))?;
        if job.status == JobStatus::Running {
            return Err(PatchError::Validation(format!(
                "job {id} is running and cannot be edited"
            )));
        }
        if let Some(source) = edit.source {
            job.source = source;
        }
        if let Some(target) = edit.target {
            job.target = target;
        }
        if let Some(output_dir) = edit.output_dir {
            job.output_dir = output_dir;
        }
        Ok(job.clone())
    }

    /// Accepts a full id, a unique id prefix, or a 1-based position.
    pub fn resolve(&self, reference: &str) -> PatchResult<Uuid> {
        let jobs = self.jobs.lock();
        let reference = reference.trim();
        if let Ok(position) = reference.parse::<usize>() {
            if position >= 1 && position <= jobs.len() && reference.len() < 8 {
                return Ok(jobs[position - 1].id);
            }
        }
        let needle = reference.to_ascii_lowercase();
        let mut matches = jobs
            .iter()
            .filter(|job| !needle.is_empty() && job.id.to_string().starts_with(&needle));
        match (matches.next(), matches.next()) {
            (Some(job), None) => Ok(job.id),
            (Some(_), Some(_)) => Err(PatchError::Validation(format!(
                "job reference '{reference}' is ambiguous"
            ))),
            (None, _) => Err(PatchError::Validation(format!(
                "no job matches '{reference}'"
            ))),
        }
    }

    fn set_status(&self, id: Uuid, status: JobStatus) -> bool {
        let mut jobs = self.jobs.lock();
        match jobs.iter_mut().find(|job| job.id == id) {
            Some(job) => {
                job.status = status;
                self.touched.lock().insert(id);
                true
            }
            None => false,
        }
    }

    /// Reads a saved queue; a missing file is an empty queue.
    pub fn load(path: &Path) -> PatchResult<Self> {
        Ok(Self::from_jobs(read_jobs(path)?))
    }

    pub fn save(&self, path: &Path) -> PatchResult<()> {
        write_jobs(path, self.snapshot())
    }

    /// Rereads the queue file and writes back the merge: the file decides
    /// which jobs exist, their order and their fields; statuses changed
    /// through this queue since the last sync win over the file's. A queue
    /// without a file is left alone.
    pub fn sync(&self) -> PatchResult<()> {
        let Some(path) = self.store.as_deref() else {
            return Ok(());
        };
        let mut merged = read_jobs(path)?;
        let mut jobs = self.jobs.lock();
        let mut touched = self.touched.lock();
        for job in merged.iter_mut().filter(|job| touched.contains(&job.id)) {
            if let Some(ours) = jobs.iter().find(|ours| ours.id == job.id) {
                job.status = ours.status;
            }
        }
        write_jobs(path, merged.clone())?;
        *jobs = merged;
        touched.clear();
        Ok(())
    }
}

fn read_jobs(path: &Path) -> PatchResult<Vec<Job>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).at_path("reading queue", path),
    };
    let file: QueueFile = serde_json::from_slice(&data)
        .map_err(|err| PatchError::Config(format!("parsing queue {}: {err}", path.display())))?;
    Ok(file.jobs)
}

fn write_jobs(path: &Path, jobs: Vec<Job>) -> PatchResult<()> {
    let json = serde_json::to_vec_pretty(&QueueFile { jobs })
        .map_err(|err| PatchError::Config(format!("serializing queue: {err}")))?;
    write_via_temp(path, &json)
}
