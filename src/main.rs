use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum, ValueHint};
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod apply;
mod args;
mod batch;
mod config;
mod create;
mod distribute;
mod encoding;
mod episode;
mod error;
mod files;
mod logging;
mod orchestrator;
mod queue;
mod runner;
mod scratch;
mod scripts;
mod settings;
use apply::PatchApplier;
use args::CreatePreset;
use config::{PatcherConfig, default_settings_path};
use episode::{OutputPlace, suggest_output_dir};
use files::{ListOptions, pair_directories};
use logging::{Journal, Outcome};
use orchestrator::{Event, Orchestrator, Work, missing_field};
use queue::{Job, JobEdit, JobQueue, JobStatus};
use runner::ProcessRunner;
use settings::Settings;

const DEFAULT_QUEUE_FILE: &str = "deltabatch-queue.json";

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
enum PresetChoice {
    Default,
    HighCompression,
    HighMemory,
}

impl From<PresetChoice> for CreatePreset {
    fn from(choice: PresetChoice) -> Self {
        match choice {
            PresetChoice::Default => CreatePreset::Default,
            PresetChoice::HighCompression => CreatePreset::HighCompression,
            PresetChoice::HighMemory => CreatePreset::HighMemory,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
enum PlaceChoice {
    Source,
    Target,
    Custom,
}

impl From<PlaceChoice> for OutputPlace {
    fn from(choice: PlaceChoice) -> Self {
        match choice {
            PlaceChoice::Source => OutputPlace::Source,
            PlaceChoice::Target => OutputPlace::Target,
            PlaceChoice::Custom => OutputPlace::Custom,
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run(cli)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let global = cli.global;
    match cli.command {
        Command::Create(cmd) => handle_create(&global, cmd)?,
        Command::Enqueue(cmd) => handle_enqueue(&global, cmd)?,
        Command::EnqueueDirs(cmd) => handle_enqueue_dirs(&global, cmd)?,
        Command::Import(cmd) => handle_import(&global, cmd)?,
        Command::List => handle_list(&global)?,
        Command::Edit(cmd) => handle_edit(&global, cmd)?,
        Command::Remove(cmd) => handle_remove(&global, cmd)?,
        Command::Clear(cmd) => handle_clear(&global, cmd)?,
        Command::Reset(cmd) => handle_reset(&global, cmd)?,
        Command::Run(cmd) => handle_run(&global, cmd)?,
        Command::Apply(cmd) => handle_apply(&global, cmd)?,
        Command::Episode(cmd) => handle_episode(cmd),
        Command::Settings(cmd) => handle_settings(&global, cmd)?,
        Command::Log(cmd) => handle_log(cmd)?,
    }

    Ok(())
}

fn handle_create(global: &GlobalArgs, cmd: CreateCommand) -> Result<()> {
    let config = load_config(global, &cmd.overrides)?;
    let output_dir = match cmd.output_dir {
        Some(dir) => dir,
        None if has_text(&cmd.source) && has_text(&cmd.target) => {
            output_dir_for(&config, &cmd.source, &cmd.target)?
        }
        None => PathBuf::new(),
    };
    let job = Job::new(cmd.source, cmd.target, output_dir);
    if let Some(problem) = missing_field(&job) {
        bail!("{problem}");
    }
    let summary = drive(config, Work::Single(job))?;
    if summary.failed > 0 {
        bail!("patch creation failed");
    }
    Ok(())
}

fn handle_enqueue(global: &GlobalArgs, cmd: EnqueueCommand) -> Result<()> {
    let config = load_config(global, &ConfigOverrides::default())?;
    let output_dir = match cmd.output_dir {
        Some(dir) => dir,
        None => output_dir_for(&config, &cmd.source, &cmd.target)?,
    };
    let job = Job::new(cmd.source, cmd.target, output_dir);
    if let Some(problem) = missing_field(&job) {
        bail!("{problem}");
    }

    let queue = open_queue(global)?;
    println!("queued {} -> {}", short_id(job.id), job.output_dir.display());
    queue.push(job);
    save_queue(global, &queue)
}

fn handle_enqueue_dirs(global: &GlobalArgs, cmd: EnqueueDirsCommand) -> Result<()> {
    let options = ListOptions {
        include: cmd.include,
        include_hidden: cmd.include_hidden,
    };
    let pairs = pair_directories(&cmd.source_dir, &cmd.target_dir, &cmd.output_dir, &options)?;

    let queue = open_queue(global)?;
    for pair in pairs {
        println!(
            "queued {} + {} -> {}",
            pair.source.display(),
            pair.target.display(),
            pair.output_dir.display()
        );
        queue.push(Job::new(pair.source, pair.target, pair.output_dir));
    }
    save_queue(global, &queue)
}

fn handle_import(global: &GlobalArgs, cmd: ImportCommand) -> Result<()> {
    let config = load_config(global, &ConfigOverrides::default())?;
    let plan = batch::load_plan(&cmd.plan)?;
    if plan.jobs.is_empty() {
        bail!("plan {} does not contain any jobs", cmd.plan.display());
    }
    let jobs = batch::expand_plan(&plan, &config)?;

    let queue = open_queue(global)?;
    let count = jobs.len();
    for job in jobs {
        queue.push(job);
    }
    println!("imported {count} job(s) from {}", cmd.plan.display());
    save_queue(global, &queue)
}

fn handle_list(global: &GlobalArgs) -> Result<()> {
    let queue = open_queue(global)?;
    let jobs = queue.snapshot();
    if jobs.is_empty() {
        println!("queue is empty.");
        return Ok(());
    }
    for (idx, job) in jobs.iter().enumerate() {
        println!(
            "{:>3} {} {:<8} {}",
            idx + 1,
            short_id(job.id),
            job.status,
            job.output_dir.display()
        );
        println!("      source: {}", job.source.display());
        println!("      target: {}", job.target.display());
    }
    Ok(())
}

fn handle_edit(global: &GlobalArgs, cmd: EditCommand) -> Result<()> {
    let queue = open_queue(global)?;
    let id = queue.resolve(&cmd.job)?;
    let edited = queue.edit(
        id,
        JobEdit {
            source: cmd.source,
            target: cmd.target,
            output_dir: cmd.output_dir,
        },
    )?;
    println!("updated {}", short_id(edited.id));
    save_queue(global, &queue)
}

fn handle_remove(global: &GlobalArgs, cmd: RemoveCommand) -> Result<()> {
    let queue = open_queue(global)?;
    let id = queue.resolve(&cmd.job)?;
    let removed = queue
        .remove(id)
        .ok_or_else(|| anyhow!("job {} vanished from the queue", short_id(id)))?;
    println!("removed {} ({})", short_id(removed.id), removed.source.display());
    save_queue(global, &queue)
}

fn handle_clear(global: &GlobalArgs, cmd: ClearCommand) -> Result<()> {
    let queue = open_queue(global)?;
    let removed = queue.clear(cmd.finished);
    println!("removed {removed} job(s).");
    save_queue(global, &queue)
}

fn handle_reset(global: &GlobalArgs, cmd: ResetCommand) -> Result<()> {
    let queue = open_queue(global)?;
    match cmd.job {
        Some(reference) => {
            let id = queue.resolve(&reference)?;
            queue.reset(id);
            if let Some(job) = queue.get(id) {
                println!("reset {} ({})", short_id(id), job.source.display());
            }
        }
        None => println!("reset {} job(s).", queue.reset_all()),
    }
    save_queue(global, &queue)
}

fn handle_run(global: &GlobalArgs, cmd: RunCommand) -> Result<()> {
    let config = load_config(global, &cmd.overrides)?;
    let queue = JobQueue::attached(&global.queue)
        .with_context(|| format!("loading queue {}", global.queue.display()))?;
    let pending = queue
        .snapshot()
        .iter()
        .filter(|job| job.status == JobStatus::New)
        .count();
    if pending == 0 {
        println!("queue has no new jobs.");
        return Ok(());
    }

    // The worker syncs with the queue file as it goes; this catches jobs it
    // never reached and any sync it had to skip.
    let result = drive(config, Work::Batch(queue.clone()));
    queue
        .sync()
        .with_context(|| format!("saving queue {}", global.queue.display()))?;
    let summary = result?;
    println!(
        "{} job(s) finished, {} failed.",
        summary.succeeded + summary.failed,
        summary.failed
    );
    Ok(())
}

fn handle_apply(global: &GlobalArgs, cmd: ApplyCommand) -> Result<()> {
    let config = load_config(global, &cmd.overrides)?;
    let source_name = cmd
        .source
        .as_deref()
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    println!("Attempting to patch \"{source_name}\"...");

    let applier = PatchApplier::new(&config, &ProcessRunner);
    match applier.apply(cmd.source.as_deref(), &cmd.delta, cmd.output.as_deref()) {
        Ok(outcome) => {
            println!("{}", outcome.to_string().trim());
            if !outcome.is_ok() {
                bail!("patch could not be applied");
            }
        }
        Err(err) => {
            println!("Task failed: {}", err.to_string().trim());
            return Err(err.into());
        }
    }
    Ok(())
}

fn handle_episode(cmd: EpisodeCommand) {
    for name in &cmd.names {
        println!("{}", episode::extract(name));
    }
}

fn handle_settings(global: &GlobalArgs, cmd: SettingsCommand) -> Result<()> {
    let mut settings = open_settings(global)?;
    match cmd.action {
        SettingsAction::Show => {
            println!("# {}", settings.path().display());
            print!("{settings}");
            for (name, _) in settings.iter() {
                if !config::keys::ALL.contains(&name) {
                    println!("# '{name}' is not a known setting");
                }
            }
        }
        SettingsAction::Set { name, value } => {
            if !config::keys::ALL.contains(&name.as_str()) {
                println!("note: '{name}' is not a known setting; storing it anyway.");
            }
            if !settings.write(&name, &value) {
                bail!("setting names cannot contain '=' or line breaks");
            }
            // surface typos in values before they are saved
            PatcherConfig::from_settings(&settings)?;
            settings
                .flush()
                .with_context(|| format!("saving settings {}", settings.path().display()))?;
            println!("{name}={value}");
        }
    }
    Ok(())
}

fn handle_log(cmd: LogCommand) -> Result<()> {
    let journal = Journal::in_dir(&std::env::current_dir().context("resolving current directory")?);
    let entries = journal.read_recent(cmd.tail)?;
    if entries.is_empty() {
        println!("run journal is empty.");
        return Ok(());
    }
    for entry in entries {
        let outcome = match entry.outcome {
            Outcome::Ok => "ok",
            Outcome::Failed => "failed",
        };
        println!(
            "[{}] {} {:<6} {} -> {}",
            entry.timestamp,
            short_id(entry.job),
            outcome,
            entry.target.display(),
            entry.output_dir.display()
        );
        if let Some(message) = entry.message {
            println!("    {}", message.trim());
        }
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct RunSummary {
    succeeded: usize,
    failed: usize,
}

/// Runs `work` on the worker thread and prints its log as it streams in.
fn drive(config: PatcherConfig, work: Work) -> Result<RunSummary> {
    let journal = Journal::in_dir(&std::env::current_dir().context("resolving current directory")?);
    let orchestrator = Orchestrator::new(config, Arc::new(ProcessRunner)).with_journal(journal);
    let (handle, events) = orchestrator.spawn(work)?;

    let mut summary = RunSummary::default();
    for event in events.iter() {
        match event {
            Event::Log(line) => println!("{line}"),
            Event::Status { id, status } => debug!(%id, %status, "job status changed"),
            Event::Finished(report) => {
                debug!(id = %report.job.id, delta = ?report.delta, "job finished");
                if report.succeeded() {
                    summary.succeeded += 1;
                } else {
                    summary.failed += 1;
                }
                println!();
            }
        }
    }
    handle
        .join()
        .map_err(|_| anyhow!("worker thread stopped unexpectedly"))?;
    Ok(summary)
}

fn output_dir_for(config: &PatcherConfig, source: &Path, target: &Path) -> Result<PathBuf> {
    Ok(suggest_output_dir(
        source,
        target,
        config.output_place,
        config.default_output_dir.as_deref(),
        config.detect_episode,
    )?)
}

fn has_text(path: &Path) -> bool {
    !path.to_string_lossy().trim().is_empty()
}

fn short_id(id: uuid::Uuid) -> String {
    id.to_string()[..8].to_string()
}

fn open_settings(global: &GlobalArgs) -> Result<Settings> {
    let path = global
        .settings
        .clone()
        .unwrap_or_else(default_settings_path);
    Settings::open(&path).with_context(|| format!("loading settings {}", path.display()))
}

fn load_config(global: &GlobalArgs, overrides: &ConfigOverrides) -> Result<PatcherConfig> {
    let settings = open_settings(global)?;
    let mut config = PatcherConfig::from_settings(&settings)
        .with_context(|| format!("reading settings {}", settings.path().display()))?;
    if let Some(dir) = &global.resource_dir {
        config.resource_dir = dir.clone();
    }
    overrides.merge_into(&mut config);
    Ok(config)
}

fn open_queue(global: &GlobalArgs) -> Result<JobQueue> {
    JobQueue::load(&global.queue).with_context(|| format!("loading queue {}", global.queue.display()))
}

fn save_queue(global: &GlobalArgs, queue: &JobQueue) -> Result<()> {
    queue
        .save(&global.queue)
        .with_context(|| format!("saving queue {}", global.queue.display()))
}

#[derive(Debug, Parser)]
#[command(name = "deltabatch", version, about = "Batch xdelta3 patch maker")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct GlobalArgs {
    /// Settings file; defaults to `<executable>.ini`.
    #[arg(long, global = true, value_name = "FILE", value_hint = ValueHint::FilePath)]
    settings: Option<PathBuf>,
    #[arg(long, global = true, value_name = "FILE", default_value = DEFAULT_QUEUE_FILE, value_hint = ValueHint::FilePath)]
    queue: PathBuf,
    /// Directory holding script templates and xdelta3 builds.
    #[arg(long = "resource-dir", global = true, value_name = "DIR", value_hint = ValueHint::DirPath)]
    resource_dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create one patch right away.
    Create(CreateCommand),
    /// Add one job to the queue.
    Enqueue(EnqueueCommand),
    /// Pair the files of two directories and queue one job per pair.
    EnqueueDirs(EnqueueDirsCommand),
    /// Queue the jobs of a YAML or JSON plan.
    Import(ImportCommand),
    List,
    Edit(EditCommand),
    Remove(RemoveCommand),
    Clear(ClearCommand),
    Reset(ResetCommand),
    /// Work through every new job in the queue.
    Run(RunCommand),
    /// Apply a delta file.
    Apply(ApplyCommand),
    /// Print the episode number detected in each name.
    Episode(EpisodeCommand),
    Settings(SettingsCommand),
    Log(LogCommand),
}

/// Per-invocation overrides of the stored settings.
#[derive(Debug, Clone, Default, Args)]
struct ConfigOverrides {
    #[arg(long, value_enum)]
    preset: Option<PresetChoice>,
    /// Create arguments with %source%, %patched% and %vcdiff% placeholders.
    #[arg(long = "custom-args", value_name = "ARGS", allow_hyphen_values = true)]
    custom_args: Option<String>,
    /// Apply arguments with %source%, %vcdiff% and %output% placeholders.
    #[arg(long = "apply-args", value_name = "ARGS", allow_hyphen_values = true)]
    apply_args: Option<String>,
    #[arg(long, value_name = "PROGRAM")]
    tool: Option<String>,
    #[arg(long = "run-64bit", action = ArgAction::SetTrue)]
    run_64bit: bool,
    #[arg(long = "dist-64bit", action = ArgAction::SetTrue)]
    dist_64bit: bool,
    #[arg(long = "scratch-dir", value_name = "DIR", value_hint = ValueHint::DirPath)]
    scratch_dir: Option<PathBuf>,
    #[arg(long = "store-names-only", action = ArgAction::SetTrue)]
    store_names_only: bool,
    #[arg(long = "force-unicode", action = ArgAction::SetTrue)]
    force_unicode: bool,
    #[arg(long = "decoy-header", action = ArgAction::SetTrue)]
    decoy_header: bool,
    #[arg(long = "codepage-workaround", value_name = "BOOL")]
    codepage_workaround: Option<bool>,
    #[arg(long = "always-copy", action = ArgAction::SetTrue)]
    always_copy: bool,
    #[arg(long = "skip-alternative", action = ArgAction::SetTrue)]
    skip_alternative: bool,
    #[arg(long = "apply-all", action = ArgAction::SetTrue)]
    apply_all: bool,
    #[arg(long = "no-binaries", action = ArgAction::SetTrue)]
    no_binaries: bool,
    #[arg(long = "output-place", value_enum)]
    output_place: Option<PlaceChoice>,
    #[arg(long = "default-output-dir", value_name = "DIR", value_hint = ValueHint::DirPath)]
    default_output_dir: Option<PathBuf>,
    #[arg(long = "no-episode", action = ArgAction::SetTrue)]
    no_episode: bool,
}

impl ConfigOverrides {
    /// Switches only ever turn settings on; the stored value stays when a
    /// flag is absent.
    fn merge_into(&self, config: &mut PatcherConfig) {
        if let Some(preset) = self.preset {
            config.create_preset = preset.into();
        }
        if let Some(args) = &self.custom_args {
            config.custom_create_args = Some(args.clone());
        }
        if let Some(args) = &self.apply_args {
            config.custom_apply_args = Some(args.clone());
        }
        if let Some(tool) = &self.tool {
            config.tool_name = Some(tool.clone());
        }
        if let Some(dir) = &self.scratch_dir {
            config.scratch_dir = Some(dir.clone());
        }
        if let Some(enabled) = self.codepage_workaround {
            config.legacy_codepage_workaround = enabled;
        }
        if let Some(place) = self.output_place {
            config.output_place = place.into();
        }
        if let Some(dir) = &self.default_output_dir {
            config.default_output_dir = Some(dir.clone());
        }
        config.run_64bit_tool |= self.run_64bit;
        config.dist_64bit_tool |= self.dist_64bit;
        config.store_names_only |= self.store_names_only;
        config.force_unicode |= self.force_unicode;
        config.decoy_header |= self.decoy_header;
        config.always_copy |= self.always_copy;
        config.skip_alternative_scripts |= self.skip_alternative;
        config.apply_all_scripts |= self.apply_all;
        config.distribute_binaries &= !self.no_binaries;
        config.detect_episode &= !self.no_episode;
    }
}

#[derive(Debug, Args)]
struct CreateCommand {
    #[arg(value_name = "SOURCE", value_hint = ValueHint::FilePath)]
    source: PathBuf,
    #[arg(value_name = "TARGET", value_hint = ValueHint::FilePath)]
    target: PathBuf,
    /// Derived from the episode number when omitted.
    #[arg(long = "output-dir", short = 'o', value_name = "DIR", value_hint = ValueHint::DirPath)]
    output_dir: Option<PathBuf>,
    #[command(flatten)]
    overrides: ConfigOverrides,
}

#[derive(Debug, Args)]
struct EnqueueCommand {
    #[arg(value_name = "SOURCE", value_hint = ValueHint::FilePath)]
    source: PathBuf,
    #[arg(value_name = "TARGET", value_hint = ValueHint::FilePath)]
    target: PathBuf,
    #[arg(long = "output-dir", short = 'o', value_name = "DIR", value_hint = ValueHint::DirPath)]
    output_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct EnqueueDirsCommand {
    #[arg(value_name = "SOURCE_DIR", value_hint = ValueHint::DirPath)]
    source_dir: PathBuf,
    #[arg(value_name = "TARGET_DIR", value_hint = ValueHint::DirPath)]
    target_dir: PathBuf,
    #[arg(long = "output-dir", short = 'o', value_name = "DIR", value_hint = ValueHint::DirPath)]
    output_dir: PathBuf,
    #[arg(long = "include", value_name = "GLOB")]
    include: Vec<String>,
    #[arg(long = "include-hidden", action = ArgAction::SetTrue)]
    include_hidden: bool,
}

#[derive(Debug, Args)]
struct ImportCommand {
    #[arg(value_name = "PLAN", value_hint = ValueHint::FilePath)]
    plan: PathBuf,
}

#[derive(Debug, Args)]
struct EditCommand {
    /// Position, id prefix or full id.
    #[arg(value_name = "JOB")]
    job: String,
    #[arg(long, value_hint = ValueHint::FilePath)]
    source: Option<PathBuf>,
    #[arg(long, value_hint = ValueHint::FilePath)]
    target: Option<PathBuf>,
    #[arg(long = "output-dir", value_hint = ValueHint::DirPath)]
    output_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RemoveCommand {
    #[arg(value_name = "JOB")]
    job: String,
}

#[derive(Debug, Args)]
struct ClearCommand {
    /// Only drop jobs that already ran.
    #[arg(long, action = ArgAction::SetTrue)]
    finished: bool,
}

#[derive(Debug, Args)]
struct ResetCommand {
    /// Resets every job when omitted.
    #[arg(value_name = "JOB")]
    job: Option<String>,
}

#[derive(Debug, Args)]
struct RunCommand {
    #[command(flatten)]
    overrides: ConfigOverrides,
}

#[derive(Debug, Args)]
struct ApplyCommand {
    #[arg(value_name = "DELTA", value_hint = ValueHint::FilePath)]
    delta: PathBuf,
    /// Falls back on the name stored in the delta when omitted.
    #[arg(long, value_hint = ValueHint::FilePath)]
    source: Option<PathBuf>,
    #[arg(long, value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,
    #[command(flatten)]
    overrides: ConfigOverrides,
}

#[derive(Debug, Args)]
struct EpisodeCommand {
    #[arg(value_name = "NAME", required = true)]
    names: Vec<String>,
}

#[derive(Debug, Args)]
struct SettingsCommand {
    #[command(subcommand)]
    action: SettingsAction,
}

#[derive(Debug, Subcommand)]
enum SettingsAction {
    Show,
    Set {
        #[arg(value_name = "NAME")]
        name: String,
        #[arg(value_name = "VALUE", allow_hyphen_values = true)]
        value: String,
    },
}

#[derive(Debug, Args)]
struct LogCommand {
    #[arg(long = "tail", default_value_t = 20)]
    tail: usize,
}
