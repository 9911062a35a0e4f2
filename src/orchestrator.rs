//! Batch driver: runs create jobs one after another on a worker thread and
//! streams progress back over a channel.

use std::any::Any;
use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::PatcherConfig;
use crate::create::PatchCreator;
use crate::distribute::copy_binaries;
use crate::error::{IoContext, PatchResult};
use crate::logging::{Journal, JournalEntry, LogSink};
use crate::queue::{Job, JobQueue, JobStatus};
use crate::runner::ToolRunner;
use crate::scripts::ScriptGenerator;

#[derive(Debug)]
pub enum Event {
    Log(String),
    Status { id: Uuid, status: JobStatus },
    Finished(JobReport),
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub job: Job,
    pub delta: Option<PathBuf>,
    pub failure: Option<String>,
}

impl JobReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// What a run works through.
#[derive(Debug, Clone)]
pub enum Work {
    /// One job outside any queue, validated before it runs.
    Single(Job),
    /// Every `New` job in the queue, including ones added mid-run.
    Batch(JobQueue),
}

struct ChannelSink<'a> {
    events: &'a Sender<Event>,
}

impl LogSink for ChannelSink<'_> {
    fn line(&self, text: &str) {
        // a caller that stopped listening does not stop the batch
        let _ = self.events.send(Event::Log(text.to_string()));
    }
}

pub struct Orchestrator {
    config: Arc<PatcherConfig>,
    runner: Arc<dyn ToolRunner>,
    journal: Option<Journal>,
}

impl Orchestrator {
    pub fn new(config: PatcherConfig, runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            config: Arc::new(config),
            runner,
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Runs `work` on a dedicated thread. The receiver yields events until
    /// the run is over and then disconnects.
    pub fn spawn(self, work: Work) -> PatchResult<(JoinHandle<()>, Receiver<Event>)> {
        let (events, receiver) = unbounded();
        let handle = thread::Builder::new()
            .name("deltabatch-worker".into())
            .spawn(move || self.run(work, &events))
            .io_context(|| "starting worker thread".into())?;
        Ok((handle, receiver))
    }

    pub fn run(&self, work: Work, events: &Sender<Event>) {
        match work {
            Work::Single(job) => self.run_single(job, events),
            Work::Batch(queue) => self.run_batch(&queue, events),
        }
    }

    pub fn run_single(&self, job: Job, events: &Sender<Event>) {
        let sink = ChannelSink { events };
        if let Some(problem) = missing_field(&job) {
            sink.line(problem);
            return;
        }
        let _ = events.send(Event::Status {
            id: job.id,
            status: JobStatus::Running,
        });
        let report = self.guarded(job, &sink);
        let _ = events.send(Event::Status {
            id: report.job.id,
            status: JobStatus::Finished,
        });
        let _ = events.send(Event::Finished(report));
    }

    /// Scans the queue from the front, running each `New` job. Whenever the
    /// queue length differs from the last scan's, the scan restarts at the
    /// first job; finished jobs are skipped, so nothing runs twice.
    ///
    /// A queue backed by a file is synced with it around every job, so
    /// jobs enqueued by other processes run too and none are overwritten.
    pub fn run_batch(&self, queue: &JobQueue, events: &Sender<Event>) {
        let sink = ChannelSink { events };
        sync_queue(queue);
        let mut baseline = queue.len();
        let mut index = 0;

        while index < queue.len() {
            if let Some(job) = queue.claim(index) {
                let id = job.id;
                sync_queue(queue);
                let _ = events.send(Event::Status {
                    id,
                    status: JobStatus::Running,
                });
                let report = self.guarded(job, &sink);
                if !queue.finish(id) {
                    warn!(%id, "job left the queue while it was running");
                }
                sync_queue(queue);
                let _ = events.send(Event::Status {
                    id,
                    status: JobStatus::Finished,
                });
                let _ = events.send(Event::Finished(report));
            }

            let current = queue.len();
            if current != baseline {
                info!(from = baseline, to = current, "queue changed, rescanning");
                baseline = current;
                index = 0;
                continue;
            }
            index += 1;
        }
    }

    /// Runs one job's pipeline; neither errors nor panics escape.
    fn guarded(&self, job: Job, sink: &dyn LogSink) -> JobReport {
        info!(id = %job.id, source = %job.source.display(), "job started");
        let outcome = catch_unwind(AssertUnwindSafe(|| self.process(&job, sink)));
        let (delta, failure) = match outcome {
            Ok(Ok(delta)) => (Some(delta), None),
            Ok(Err(err)) => {
                warn!(id = %job.id, kind = %err.kind(), "job failed: {err}");
                (None, Some(err.to_string()))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(id = %job.id, "job panicked: {message}");
                (None, Some(message))
            }
        };
        if let Some(message) = &failure {
            sink.line(&format!("Task failed: {}", message.trim()));
        }

        if let Some(journal) = &self.journal {
            let entry = JournalEntry::now(
                job.id,
                &job.source,
                &job.target,
                &job.output_dir,
                failure.as_deref(),
            );
            if let Err(err) = journal.record(&entry) {
                warn!(path = %journal.path().display(), "unable to update run journal: {err}");
            }
        }

        JobReport {
            job,
            delta,
            failure,
        }
    }

    fn process(&self, job: &Job, sink: &dyn LogSink) -> PatchResult<PathBuf> {
        sink.line("Creating output directory...");
        fs::create_dir_all(&job.output_dir).at_path("creating output directory", &job.output_dir)?;

        sink.line("Creating patch...");
        let delta = PatchCreator::new(&self.config, self.runner.as_ref()).create(
            &job.source,
            &job.target,
            &job.output_dir,
            sink,
        )?;

        sink.line("Creating applying scripts...");
        ScriptGenerator::new(&self.config).emit(
            &file_name(&job.source),
            &file_name(&job.target),
            &job.output_dir,
        )?;

        if self.config.distribute_binaries {
            sink.line("Copying xdelta3 to output directory...");
            copy_binaries(&self.config, &job.output_dir)?;
        }

        sink.line("Done.");
        Ok(delta)
    }
}

/// The first empty field of a single job, as the message shown for it.
pub fn missing_field(job: &Job) -> Option<&'static str> {
    let blank = |path: &Path| path.to_string_lossy().trim().is_empty();
    if blank(&job.source) {
        Some("Please specify the source file.")
    } else if blank(&job.target) {
        Some("Please specify the target file.")
    } else if blank(&job.output_dir) {
        Some("Please specify the output directory.")
    } else {
        None
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn sync_queue(queue: &JobQueue) {
    if let Err(err) = queue.sync() {
        warn!(kind = %err.kind(), "queue file not synced: {err}");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unexpected internal error".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::fake::FakeRunner;
    use crate::scripts::{
        ALTERNATIVE_SCRIPTS, LINUX_SCRIPT, MAC_SCRIPT, POWERSHELL_SUBSCRIPT, README,
        WINDOWS_SCRIPT,
    };
    use parking_lot::Mutex;
    use tempfile::{TempDir, tempdir};

    struct Workspace {
        temp: TempDir,
        config: PatcherConfig,
    }

    impl Workspace {
        fn new() -> Self {
            let temp = tempdir().expect("temp dir");
            let resources = temp.path().join("resources");
            fs::create_dir_all(&resources).expect("resources");
            for name in [WINDOWS_SCRIPT, POWERSHELL_SUBSCRIPT, LINUX_SCRIPT, MAC_SCRIPT, README] {
                fs::write(resources.join(name), "&sourcefile& -> &targetfile&\n").expect("template");
            }
            for name in ALTERNATIVE_SCRIPTS {
                fs::write(resources.join(name), "alt").expect("alternative");
            }
            let config = PatcherConfig {
                resource_dir: resources,
                legacy_codepage_workaround: false,
                distribute_binaries: false,
                ..PatcherConfig::default()
            };
            Self { temp, config }
        }

        fn job(&self, n: usize) -> Job {
            let source = self.temp.path().join(format!("Show - {n:02}.mkv"));
            let target = self.temp.path().join(format!("Show - {n:02} v2.mkv"));
            fs::write(&source, b"old").expect("source");
            fs::write(&target, b"new").expect("target");
            Job::new(source, target, self.temp.path().join("out").join(format!("{n:02}")))
        }
    }

    fn drain(receiver: &Receiver<Event>) -> (Vec<String>, Vec<JobReport>) {
        let mut lines = Vec::new();
        let mut reports = Vec::new();
        for event in receiver.try_iter() {
            match event {
                Event::Log(line) => lines.push(line),
                Event::Finished(report) => reports.push(report),
                Event::Status { .. } => {}
            }
        }
        (lines, reports)
    }

    fn source_of(args: &str) -> String {
        crate::args::split_arguments(args).expect("args")[4].clone()
    }

    #[test]
    fn single_job_logs_steps_in_order() {
        let ws = Workspace::new();
        let config = PatcherConfig {
            distribute_binaries: true,
            ..ws.config.clone()
        };
        for name in ["xdelta3.exe", "xdelta3", "xdelta3.x86_64", "xdelta3_mac"] {
            fs::write(config.resource_dir.join(name), name).expect("binary");
        }
        let job = ws.job(1);
        let output_dir = job.output_dir.clone();
        let (tx, rx) = unbounded();
        Orchestrator::new(config, Arc::new(FakeRunner::succeeding())).run(Work::Single(job), &tx);

        let (lines, reports) = drain(&rx);
        assert_eq!(
            lines,
            vec![
                "Creating output directory...",
                "Creating patch...",
                "Creating applying scripts...",
                "Copying xdelta3 to output directory...",
                "Done.",
            ]
        );
        assert_eq!(reports.len(), 1);
        assert!(reports[0].succeeded());
        assert_eq!(reports[0].delta, Some(output_dir.join("changes.vcdiff")));
        assert!(output_dir.join(LINUX_SCRIPT).exists());
        assert!(output_dir.join("xdelta3_mac").exists());
    }

    #[test]
    fn single_job_validation_does_no_work() {
        let ws = Workspace::new();
        let runner = Arc::new(FakeRunner::succeeding());
        let (tx, rx) = unbounded();
        let orchestrator = Orchestrator::new(ws.config.clone(), runner.clone());

        orchestrator.run(Work::Single(Job::new("a.mkv", "  ", "out")), &tx);
        orchestrator.run(Work::Single(Job::new("", "", "")), &tx);
        orchestrator.run(Work::Single(Job::new("a.mkv", "b.mkv", "")), &tx);

        let (lines, reports) = drain(&rx);
        assert_eq!(
            lines,
            vec![
                "Please specify the target file.",
                "Please specify the source file.",
                "Please specify the output directory.",
            ]
        );
        assert!(reports.is_empty());
        assert!(runner.invocations().is_empty());
    }

    #[test]
    fn job_added_mid_run_triggers_rescan_without_reruns() {
        let ws = Workspace::new();
        let queue = JobQueue::new();
        for n in 1..=3 {
            queue.push(ws.job(n));
        }
        let late = ws.job(4);
        let late_source = late.source.to_string_lossy().into_owned();

        let handle = queue.clone();
        let pending = Mutex::new(Some(late));
        let runner = Arc::new(FakeRunner::succeeding().with_hook(move |_| {
            if let Some(job) = pending.lock().take() {
                handle.push(job);
            }
        }));
        let (tx, rx) = unbounded();
        Orchestrator::new(ws.config.clone(), runner.clone()).run(Work::Batch(queue.clone()), &tx);

        let sources: Vec<String> = runner
            .invocations()
            .iter()
            .map(|call| source_of(&call.args))
            .collect();
        let expected: Vec<String> = queue
            .snapshot()
            .iter()
            .map(|job| job.source.to_string_lossy().into_owned())
            .collect();
        assert_eq!(sources, expected);
        assert_eq!(sources.last(), Some(&late_source));
        assert!(queue.snapshot().iter().all(|job| job.status == JobStatus::Finished));

        let (lines, reports) = drain(&rx);
        assert_eq!(reports.len(), 4);
        assert_eq!(lines.iter().filter(|line| *line == "Done.").count(), 4);
    }

    #[test]
    fn jobs_enqueued_through_the_file_mid_run_are_run_and_kept() {
        let ws = Workspace::new();
        let path = ws.temp.path().join("deltabatch-queue.json");
        let first = ws.job(1);
        JobQueue::from_jobs(vec![first.clone()]).save(&path).expect("seed");
        let queue = JobQueue::attached(&path).expect("attach");

        let late = ws.job(2);
        let late_id = late.id;
        let pending = Mutex::new(Some(late));
        let file = path.clone();
        let runner = Arc::new(FakeRunner::succeeding().with_hook(move |_| {
            if let Some(job) = pending.lock().take() {
                let other = JobQueue::load(&file).expect("outside load");
                assert_eq!(other.snapshot()[0].status, JobStatus::Running);
                other.push(job);
                other.save(&file).expect("outside save");
            }
        }));
        let (tx, rx) = unbounded();
        Orchestrator::new(ws.config.clone(), runner.clone()).run(Work::Batch(queue.clone()), &tx);

        assert_eq!(runner.invocations().len(), 2);
        let (_, reports) = drain(&rx);
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|report| report.failure.is_none()));
        let on_disk = JobQueue::load(&path).expect("reload").snapshot();
        let ids: Vec<_> = on_disk.iter().map(|job| job.id).collect();
        assert_eq!(ids, vec![first.id, late_id]);
        assert!(on_disk.iter().all(|job| job.status == JobStatus::Finished));
        assert_eq!(queue.snapshot(), on_disk);
    }

    #[test]
    fn empty_and_finished_queues_are_no_ops() {
        let ws = Workspace::new();
        let runner = Arc::new(FakeRunner::succeeding());
        let orchestrator = Orchestrator::new(ws.config.clone(), runner.clone());
        let (tx, rx) = unbounded();

        orchestrator.run(Work::Batch(JobQueue::new()), &tx);

        let queue = JobQueue::new();
        let id = queue.push(ws.job(1));
        queue.finish(id);
        orchestrator.run(Work::Batch(queue), &tx);

        assert!(runner.invocations().is_empty());
        assert_eq!(rx.try_iter().count(), 0);
    }

    #[test]
    fn failures_are_logged_and_the_batch_continues() {
        let ws = Workspace::new();
        let queue = JobQueue::new();
        for n in 1..=3 {
            queue.push(ws.job(n));
        }
        let runner = Arc::new(FakeRunner::with_exit_codes(vec![0, 1, 0]));
        let (tx, rx) = unbounded();
        Orchestrator::new(ws.config.clone(), runner.clone()).run(Work::Batch(queue.clone()), &tx);

        let (lines, reports) = drain(&rx);
        assert_eq!(reports.len(), 3);
        assert!(reports[0].succeeded());
        assert_eq!(
            reports[1].failure.as_deref(),
            Some("xdelta3: simulated output")
        );
        assert!(reports[2].succeeded());
        assert!(lines.contains(&"Task failed: xdelta3: simulated output".to_string()));
        assert_eq!(lines.iter().filter(|line| *line == "Done.").count(), 2);
        assert!(queue.snapshot().iter().all(|job| job.status == JobStatus::Finished));
        assert!(!queue.snapshot()[1].output_dir.join(LINUX_SCRIPT).exists());
    }

    #[test]
    fn panic_in_one_job_does_not_stop_the_next() {
        let ws = Workspace::new();
        let queue = JobQueue::new();
        queue.push(ws.job(1));
        queue.push(ws.job(2));
        let calls = Mutex::new(0usize);
        let runner = Arc::new(FakeRunner::succeeding().with_hook(move |_| {
            let mut calls = calls.lock();
            *calls += 1;
            if *calls == 1 {
                panic!("tool wrapper exploded");
            }
        }));
        let (tx, rx) = unbounded();
        Orchestrator::new(ws.config.clone(), runner).run(Work::Batch(queue.clone()), &tx);

        let (lines, reports) = drain(&rx);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].failure.as_deref(), Some("tool wrapper exploded"));
        assert!(lines.contains(&"Task failed: tool wrapper exploded".to_string()));
        assert!(reports[1].succeeded());
        assert!(queue.snapshot().iter().all(|job| job.status == JobStatus::Finished));
    }

    #[test]
    fn unusable_output_dir_fails_only_that_job() {
        let ws = Workspace::new();
        let blocker = ws.temp.path().join("blocker");
        fs::write(&blocker, b"not a directory").expect("blocker");
        let queue = JobQueue::new();
        let mut blocked = ws.job(1);
        blocked.output_dir = blocker.join("01");
        queue.push(blocked);
        queue.push(ws.job(2));
        let runner = Arc::new(FakeRunner::succeeding());
        let (tx, rx) = unbounded();
        Orchestrator::new(ws.config.clone(), runner.clone()).run(Work::Batch(queue), &tx);

        let (lines, reports) = drain(&rx);
        assert!(!reports[0].succeeded());
        assert!(lines[1].starts_with("Task failed: creating output directory"));
        assert!(reports[1].succeeded());
        assert_eq!(runner.invocations().len(), 1);
    }

    #[test]
    fn spawned_worker_streams_events_and_journals() {
        let ws = Workspace::new();
        let queue = JobQueue::new();
        queue.push(ws.job(1));
        let journal = Journal::in_dir(ws.temp.path());
        let (handle, rx) = Orchestrator::new(ws.config.clone(), Arc::new(FakeRunner::succeeding()))
            .with_journal(journal.clone())
            .spawn(Work::Batch(queue.clone()))
            .expect("spawn");

        let events: Vec<Event> = rx.iter().collect();
        handle.join().expect("worker");
        assert!(matches!(
            events.first(),
            Some(Event::Status {
                status: JobStatus::Running,
                ..
            })
        ));
        assert!(matches!(events.last(), Some(Event::Finished(_))));
        let entries = journal.read_recent(10).expect("journal");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].job, queue.snapshot()[0].id);
    }
}
