// ============================================
// RTA Builder - pipeline.rs
// ============================================
// The build controller: source ISO in, customised image out.
//
// Stages run in a fixed order, never backwards:
//
//   Extract -> Populate -> Customize -> Create -> Convert -> Cleanup -> Done
//
// Extract and Create each try an ordered list of strategies (see extract.rs
// and create.rs). A strategy failing is not a build failure - the next one
// is tried. Only running out of strategies fails the build.
//
// The stop flag is checked between stages and after every failed strategy,
// and the strategies themselves check it between files / output lines.
// A stopped build ends as Cancelled, never as Failed.
//
// PROGRESS
// Each stage owns a fixed share of 0-100 (Stage::weight). The overall number
// only ever goes up, even when a fallback starts its own count over.
// ============================================

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info_span};
use uuid::Uuid;

use crate::cancel::StopFlag;
use crate::config::BuilderConfig;
use crate::context::{RunSettings, StepContext, StrategyResult};
use crate::convert::{convert, OutputFormat};
use crate::create::{creation_plan, skipped_creation, CreateStrategy, CreationTier};
use crate::error::{BuildError, Result};
use crate::extract::{extraction_plan, skipped_extraction, ExtractStrategy};
use crate::mount::{HostMountBackend, MountBackend, MountManager};
use crate::probe::CapabilitySet;
use crate::progress::Reporter;
use crate::verify::{inspect_artifact, ArtifactKind};

// ============================================
// STAGES
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Extract,
    Populate,
    Customize,
    Create,
    Convert,
    Cleanup,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Extract,
        Stage::Populate,
        Stage::Customize,
        Stage::Create,
        Stage::Convert,
        Stage::Cleanup,
    ];

    /// Share of overall progress. The weights of ALL sum to 100.
    pub fn weight(&self) -> u32 {
        match self {
            Stage::Extract => 20,
            Stage::Populate => 10,
            Stage::Customize => 10,
            Stage::Create => 50,
            Stage::Convert => 0,
            Stage::Cleanup => 10,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Stage::Extract => "Extracting ISO contents",
            Stage::Populate => "Copying selected tools",
            Stage::Customize => "Customizing ISO settings",
            Stage::Create => "Rebuilding ISO",
            Stage::Convert => "Creating additional formats",
            Stage::Cleanup => "Cleaning up temporary files",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================
// BUILD JOB
// ============================================

/// Everything one build needs to know. Owned by the controller for the
/// duration of the run.
#[derive(Debug, Clone)]
pub struct BuildJob {
    pub id: Uuid,
    pub source_image: PathBuf,
    pub output_image: PathBuf,
    pub workspace: PathBuf,
    pub volume_label: String,
    /// Names of the selected content items (tools)
    pub content_items: Vec<String>,
    pub hostname: String,
    pub branding: bool,
    pub extra_formats: Vec<OutputFormat>,
}

impl BuildJob {
    pub fn new(source_image: PathBuf, output_image: PathBuf, workspace: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_image,
            output_image,
            workspace,
            volume_label: "KALI_RTA".to_string(),
            content_items: Vec::new(),
            hostname: "kali-rta".to_string(),
            branding: false,
            extra_formats: Vec::new(),
        }
    }

    /// Where the image's file tree is unpacked and modified
    pub fn extract_dir(&self) -> PathBuf {
        self.workspace.join("iso_contents")
    }
}

/// Pre-flight checks before a build is started.
///
/// Errors on a missing source image, an empty label/hostname, or an output
/// folder that can't be created. Returns warnings that should be shown but
/// don't block the build.
pub fn validate_job(job: &BuildJob) -> Result<Vec<String>> {
    if !job.source_image.is_file() {
        return Err(BuildError::Config {
            reason: format!("source image not found: {}", job.source_image.display()),
        });
    }
    if job.volume_label.trim().is_empty() {
        return Err(BuildError::Config {
            reason: "volume label must not be empty".to_string(),
        });
    }
    if job.hostname.trim().is_empty() || job.hostname.contains(char::is_whitespace) {
        return Err(BuildError::Config {
            reason: format!("invalid hostname: {:?}", job.hostname),
        });
    }
    if let Some(parent) = job.output_image.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| BuildError::io_at("Cannot create output folder", parent, e))?;
    }

    let mut warnings = Vec::new();
    if job.content_items.is_empty() {
        warnings.push("No tools are selected; the image will only be re-branded".to_string());
    }
    if job.volume_label.len() > 32 {
        warnings.push(format!(
            "Volume label {:?} is longer than 32 characters and may be truncated",
            job.volume_label
        ));
    }
    Ok(warnings)
}

// ============================================
// MUTATION STEP
// ============================================

/// The changes applied to the extracted tree between Extract and Create.
/// An error from either step fails the build at that stage.
pub trait Mutation {
    /// Copy the selected content items into the tree
    fn populate(&self, ctx: &mut StepContext, tree: &Path, job: &BuildJob) -> Result<()>;

    /// Hostname, branding and other settings
    fn customize(&self, ctx: &mut StepContext, tree: &Path, job: &BuildJob) -> Result<()>;
}

/// Leaves the tree as extracted (straight rebuild)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMutation;

impl Mutation for NoMutation {
    fn populate(&self, _ctx: &mut StepContext, _tree: &Path, _job: &BuildJob) -> Result<()> {
        Ok(())
    }

    fn customize(&self, _ctx: &mut StepContext, _tree: &Path, _job: &BuildJob) -> Result<()> {
        Ok(())
    }
}

// ============================================
// OUTCOME
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Pending,
    Running(Stage),
    Done,
    Cancelled,
    Failed,
}

/// What a finished build produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub job_id: Uuid,
    pub output: PathBuf,
    pub extraction: &'static str,
    pub tier: CreationTier,
    pub artifact: ArtifactKind,
    /// The output exists but is not a bootable image
    pub degraded: bool,
    pub extra_outputs: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Done(BuildReport),
    Cancelled,
    Failed { stage: Stage, detail: String },
}

impl BuildOutcome {
    fn state(&self) -> BuildState {
        match self {
            BuildOutcome::Done(_) => BuildState::Done,
            BuildOutcome::Cancelled => BuildState::Cancelled,
            BuildOutcome::Failed { .. } => BuildState::Failed,
        }
    }
}

type StateCell = Arc<Mutex<BuildState>>;

fn set_state(cell: &StateCell, next: BuildState) {
    if let Ok(mut state) = cell.lock() {
        debug!("Build state {:?} -> {:?}", *state, next);
        *state = next;
    }
}

/// Result of walking one strategy list
enum Cascade<S> {
    Succeeded(S),
    Cancelled,
    Exhausted(String),
}

/// Try each strategy in order until one succeeds. Announces every
/// fallback, and gives up early once the stop flag is set.
fn run_cascade<S>(
    ctx: &mut StepContext,
    plan: Vec<S>,
    name: impl Fn(&S) -> &'static str,
    mut attempt: impl FnMut(&mut StepContext, &S) -> StrategyResult,
) -> Cascade<S> {
    let mut last_detail = None;
    for (index, strategy) in plan.into_iter().enumerate() {
        if ctx.stop.is_stopped() {
            return Cascade::Cancelled;
        }
        if index == 0 {
            ctx.reporter.info(&format!("Using {}", name(&strategy)));
        } else {
            ctx.reporter.warn(&format!("Falling back to {}", name(&strategy)));
        }

        let result = attempt(ctx, &strategy);
        if result.success {
            return Cascade::Succeeded(strategy);
        }
        if ctx.stop.is_stopped() {
            return Cascade::Cancelled;
        }
        last_detail = result.detail;
    }
    Cascade::Exhausted(last_detail.unwrap_or_else(|| "no strategy available".to_string()))
}

/// Tiers whose tool is missing never enter the cascade; say so instead.
fn announce_skipped(ctx: &mut StepContext, skipped: Vec<(&'static str, BuildError)>) {
    for (tier, reason) in skipped {
        ctx.reporter.warn(&format!("{}, skipping {}", reason, tier));
    }
}

/// Run one half of the mutation step. Returns the outcome if the build ends here.
fn mutation_step(
    ctx: &mut StepContext,
    state: &StateCell,
    stage: Stage,
    step: impl FnOnce(&mut StepContext) -> Result<()>,
) -> Option<BuildOutcome> {
    if ctx.stop.is_stopped() {
        return Some(BuildOutcome::Cancelled);
    }
    set_state(state, BuildState::Running(stage));
    ctx.reporter.begin_stage(stage);
    match step(ctx) {
        Ok(()) => {
            ctx.reporter.complete_stage(stage);
            None
        }
        Err(e) if e.is_cancelled() => Some(BuildOutcome::Cancelled),
        Err(e) => Some(BuildOutcome::Failed {
            stage,
            detail: e.to_string(),
        }),
    }
}

// ============================================
// CONTROLLER
// ============================================

/// Runs builds. One job at a time per pipeline; the caller is expected not to
/// start a second build on the same workspace while one is running.
pub struct BuildPipeline {
    caps: CapabilitySet,
    settings: RunSettings,
    mount_backend: Arc<dyn MountBackend>,
    mount_attempts: u32,
    mount_poll_interval: Duration,
    keep_workspace: bool,
}

impl BuildPipeline {
    pub fn new(caps: CapabilitySet, config: &BuilderConfig) -> Self {
        Self {
            caps,
            settings: RunSettings::from(config),
            mount_backend: Arc::new(HostMountBackend),
            mount_attempts: config.mount_attempts,
            mount_poll_interval: config.mount_poll_interval(),
            keep_workspace: config.keep_workspace,
        }
    }

    /// Swap the host mount primitives (tests use a fake)
    pub fn with_mount_backend(mut self, backend: Arc<dyn MountBackend>) -> Self {
        self.mount_backend = backend;
        self
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.caps
    }

    /// Run a job to completion on the calling thread
    pub fn run(
        &self,
        job: &BuildJob,
        mutation: &dyn Mutation,
        stop: &StopFlag,
        on_event: impl FnMut(&str, Option<u8>),
    ) -> BuildOutcome {
        let state = Arc::new(Mutex::new(BuildState::Pending));
        self.execute(job, mutation, stop, &state, on_event)
    }

    /// Run a job on its own worker thread
    pub fn spawn(
        self,
        job: BuildJob,
        mutation: Box<dyn Mutation + Send>,
        on_event: impl FnMut(&str, Option<u8>) + Send + 'static,
    ) -> BuildHandle {
        let stop = StopFlag::new();
        let state = Arc::new(Mutex::new(BuildState::Pending));
        let worker_stop = stop.clone();
        let worker_state = Arc::clone(&state);

        let thread = thread::spawn(move || {
            self.execute(&job, mutation.as_ref(), &worker_stop, &worker_state, on_event)
        });

        BuildHandle { stop, state, thread }
    }

    fn execute(
        &self,
        job: &BuildJob,
        mutation: &dyn Mutation,
        stop: &StopFlag,
        state: &StateCell,
        on_event: impl FnMut(&str, Option<u8>),
    ) -> BuildOutcome {
        let span = info_span!("build", job = %job.id);
        let _guard = span.enter();

        let mut ctx = StepContext {
            reporter: Reporter::new(on_event),
            stop: stop.clone(),
            settings: self.settings,
            mounts: MountManager::new(
                Arc::clone(&self.mount_backend),
                self.mount_attempts,
                self.mount_poll_interval,
            ),
        };

        ctx.reporter.info("Starting build process...");
        let outcome = self.stages(&mut ctx, job, mutation, state);

        match &outcome {
            BuildOutcome::Done(report) => {
                ctx.reporter
                    .finish(&format!("Build completed successfully! Output saved to {}", report.output.display()));
            }
            BuildOutcome::Cancelled => ctx.reporter.warn("Build process stopped by user"),
            BuildOutcome::Failed { stage, detail } => {
                ctx.reporter.error(&format!("Build failed during {}: {}", stage, detail))
            }
        }
        set_state(state, outcome.state());
        outcome
    }

    fn stages(&self, ctx: &mut StepContext, job: &BuildJob, mutation: &dyn Mutation, state: &StateCell) -> BuildOutcome {
        let tree = job.extract_dir();

        // ---- Extract ----
        if ctx.stop.is_stopped() {
            return BuildOutcome::Cancelled;
        }
        set_state(state, BuildState::Running(Stage::Extract));
        ctx.reporter.begin_stage(Stage::Extract);
        if let Err(e) = fs::create_dir_all(&tree) {
            return BuildOutcome::Failed {
                stage: Stage::Extract,
                detail: BuildError::io_at("Failed to create", &tree, e).to_string(),
            };
        }
        ctx.reporter.info(&format!("Created workspace at {}", job.workspace.display()));

        announce_skipped(ctx, skipped_extraction(&self.caps));
        let extraction = match run_cascade(ctx, extraction_plan(&self.caps), ExtractStrategy::name, |ctx, s| {
            s.extract(ctx, &job.source_image, &tree)
        }) {
            Cascade::Succeeded(strategy) => strategy,
            Cascade::Cancelled => return BuildOutcome::Cancelled,
            Cascade::Exhausted(detail) => {
                return BuildOutcome::Failed {
                    stage: Stage::Extract,
                    detail,
                }
            }
        };
        ctx.reporter.complete_stage(Stage::Extract);

        // ---- Populate / Customize ----
        if let Some(outcome) = mutation_step(ctx, state, Stage::Populate, |ctx| mutation.populate(ctx, &tree, job)) {
            return outcome;
        }
        if let Some(outcome) = mutation_step(ctx, state, Stage::Customize, |ctx| mutation.customize(ctx, &tree, job)) {
            return outcome;
        }

        // ---- Create ----
        if ctx.stop.is_stopped() {
            return BuildOutcome::Cancelled;
        }
        set_state(state, BuildState::Running(Stage::Create));
        ctx.reporter.begin_stage(Stage::Create);
        let output = &job.output_image;
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = fs::create_dir_all(parent) {
                return BuildOutcome::Failed {
                    stage: Stage::Create,
                    detail: BuildError::io_at("Failed to create", parent, e).to_string(),
                };
            }
        }
        ctx.reporter.info(&format!("Rebuilding ISO as {}...", output.display()));

        announce_skipped(ctx, skipped_creation(&self.caps));
        let creation = match run_cascade(ctx, creation_plan(&self.caps), CreateStrategy::name, |ctx, s| {
            s.create(ctx, &tree, output, &job.volume_label)
        }) {
            Cascade::Succeeded(strategy) => strategy,
            Cascade::Cancelled => return BuildOutcome::Cancelled,
            Cascade::Exhausted(detail) => {
                return BuildOutcome::Failed {
                    stage: Stage::Create,
                    detail,
                }
            }
        };

        let tier = creation.tier();
        let artifact = inspect_artifact(output);
        let degraded = tier.is_degraded() || artifact == ArtifactKind::Other;
        ctx.reporter.info(&format!("Output is a {}", artifact.describe()));
        if degraded {
            ctx.reporter.warn(&format!(
                "Degraded artifact: {} exists but is not a bootable image",
                output.display()
            ));
        }
        ctx.reporter.complete_stage(Stage::Create);

        // ---- Convert ----
        let mut extra_outputs = Vec::new();
        if !job.extra_formats.is_empty() {
            if ctx.stop.is_stopped() {
                return BuildOutcome::Cancelled;
            }
            set_state(state, BuildState::Running(Stage::Convert));
            ctx.reporter.begin_stage(Stage::Convert);
            for format in &job.extra_formats {
                match convert(ctx, output, *format) {
                    Ok(path) => extra_outputs.push(path),
                    Err(e) if e.is_cancelled() => return BuildOutcome::Cancelled,
                    Err(e) => ctx.reporter.warn(&format!("{} conversion failed: {}", format.label(), e)),
                }
            }
            ctx.reporter.complete_stage(Stage::Convert);
        }

        // ---- Cleanup ----
        if ctx.stop.is_stopped() {
            return BuildOutcome::Cancelled;
        }
        set_state(state, BuildState::Running(Stage::Cleanup));
        ctx.reporter.begin_stage(Stage::Cleanup);
        if self.keep_workspace {
            ctx.reporter.info(&format!("Keeping workspace at {}", job.workspace.display()));
        } else {
            self.clean_workspace(ctx, job, &tree);
        }
        ctx.reporter.complete_stage(Stage::Cleanup);

        BuildOutcome::Done(BuildReport {
            job_id: job.id,
            output: output.clone(),
            extraction: extraction.name(),
            tier,
            artifact,
            degraded,
            extra_outputs,
        })
    }

    /// Remove the extracted tree, then the workspace if nothing else is in it
    fn clean_workspace(&self, ctx: &mut StepContext, job: &BuildJob, tree: &Path) {
        if let Err(e) = fs::remove_dir_all(tree) {
            ctx.reporter.warn(&format!("Could not remove {}: {}", tree.display(), e));
            return;
        }
        if fs::remove_dir(&job.workspace).is_err() {
            debug!("Workspace {} not empty, leaving it", job.workspace.display());
        }
    }
}

// ============================================
// WORKER HANDLE
// ============================================

/// A build running on its own thread
pub struct BuildHandle {
    stop: StopFlag,
    state: StateCell,
    thread: JoinHandle<BuildOutcome>,
}

impl BuildHandle {
    /// Ask the build to stop at its next check. Safe to call repeatedly.
    pub fn request_stop(&self) {
        self.stop.request_stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    pub fn state(&self) -> BuildState {
        self.state.lock().map(|s| *s).unwrap_or(BuildState::Failed)
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the build. A panic on the worker is re-raised here.
    pub fn join(self) -> BuildOutcome {
        match self.thread.join() {
            Ok(outcome) => outcome,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
