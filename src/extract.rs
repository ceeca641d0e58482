// ============================================
// RTA Builder - extract.rs
// ============================================
// Gets the files out of the source ISO and into a working folder.
//
// Two interchangeable ways to do it:
//   - Archiver:   7-Zip reads the ISO directly (fast, shows progress)
//   - MountCopy:  mount the ISO as a drive and copy every file off it
//                 (needs nothing installed, so it is always the last resort)
//
// Both report plain success/failure. Details go to the log/progress channel
// so the pipeline can decide whether to try the next strategy.
// ============================================

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use walkdir::WalkDir;

use crate::context::{StepContext, StrategyResult};
use crate::error::{BuildError, Result};
use crate::probe::CapabilitySet;
use crate::progress::{parse_archiver_line, Cadence, LineEvent};
use crate::subprocess::run_monitored;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractStrategy {
    /// 7-Zip at the given path
    Archiver { tool: PathBuf },
    /// Mount-DiskImage, then copy the tree
    MountCopy,
}

/// Order to try extraction in: 7-Zip when installed, then mount-and-copy
pub fn extraction_plan(caps: &CapabilitySet) -> Vec<ExtractStrategy> {
    let mut plan = Vec::new();
    if let Some(tool) = &caps.archiver {
        plan.push(ExtractStrategy::Archiver { tool: tool.clone() });
    }
    plan.push(ExtractStrategy::MountCopy);
    plan
}

/// Tiers left out of the plan because their tool is missing, with the reason
pub fn skipped_extraction(caps: &CapabilitySet) -> Vec<(&'static str, BuildError)> {
    let mut skipped = Vec::new();
    if caps.archiver.is_none() {
        skipped.push(("7-Zip extraction", BuildError::unavailable("7-Zip")));
    }
    skipped
}

impl ExtractStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            ExtractStrategy::Archiver { .. } => "7-Zip extraction",
            ExtractStrategy::MountCopy => "mount-and-copy extraction",
        }
    }

    /// Populate `target` with the contents of `image`
    pub fn extract(&self, ctx: &mut StepContext, image: &Path, target: &Path) -> StrategyResult {
        let result = match self {
            ExtractStrategy::Archiver { tool } => extract_with_archiver(ctx, tool, image, target),
            ExtractStrategy::MountCopy => extract_by_mounting(ctx, image, target).map(|_| ()),
        };
        if let Err(e) = &result {
            if !e.is_cancelled() {
                ctx.reporter.warn(&format!("{} failed: {}", self.name(), e));
            }
        }
        result.into()
    }
}

// ============================================
// 7-ZIP
// ============================================

fn extract_with_archiver(ctx: &mut StepContext, tool: &Path, image: &Path, target: &Path) -> Result<()> {
    ctx.reporter.info("Extracting ISO with 7-Zip...");
    fs::create_dir_all(target).map_err(|e| BuildError::io_at("Failed to create", target, e))?;

    let mut cmd = Command::new(tool);
    cmd.arg("x")                                // Extract with full paths
        .arg(format!("-o{}", target.display())) // Output directory
        .arg("-y")                              // Yes to all prompts
        .arg("-bsp1")                           // Progress to stdout
        .arg(image);

    let reporter = &mut ctx.reporter;
    run_monitored("7-Zip", cmd, &ctx.stop, ctx.settings.tool_idle_timeout, |line| {
        match parse_archiver_line(line) {
            LineEvent::Progress(event) => reporter.report(&event),
            LineEvent::Message(message) => reporter.detail(&message),
            LineEvent::Blank => {}
        }
    })?;

    ctx.reporter.info("ISO extraction completed successfully");
    Ok(())
}

// ============================================
// MOUNT AND COPY
// ============================================

/// File counts from a bulk copy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub total: u64,
    pub copied: u64,
    pub failed: u64,
}

fn extract_by_mounting(ctx: &mut StepContext, image: &Path, target: &Path) -> Result<CopyStats> {
    ctx.reporter.info("Mounting ISO using Windows built-in functionality...");
    fs::create_dir_all(target).map_err(|e| BuildError::io_at("Failed to create", target, e))?;

    let handle = ctx.mounts.mount(image)?;
    ctx.reporter.info(&format!("ISO mounted at drive {}:", handle.volume()));

    let result = copy_tree(ctx, &handle.root(), target);

    // Released on every path, including cancellation and copy errors
    handle.unmount();

    let stats = result?;
    if stats.failed > 0 {
        ctx.reporter.warn(&format!("{} file(s) could not be copied and were skipped", stats.failed));
    }
    ctx.reporter.info("ISO extraction completed successfully");
    Ok(stats)
}

/// Copy every file under `source` to the same relative path under `target`.
///
/// A file that fails to copy is logged and skipped. The stop flag is checked
/// before every file.
pub fn copy_tree(ctx: &mut StepContext, source: &Path, target: &Path) -> Result<CopyStats> {
    let total = WalkDir::new(source)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .count() as u64;

    let cadence = Cadence::new(ctx.settings.progress_every, total);
    let mut stats = CopyStats {
        total,
        ..Default::default()
    };

    for entry in WalkDir::new(source) {
        ctx.stop.check()?;

        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                ctx.reporter.warn(&format!("Error reading source tree: {}", e));
                continue;
            }
        };
        let relative = match entry.path().strip_prefix(source) {
            Ok(relative) => relative,
            Err(_) => continue,
        };
        let destination = target.join(relative);

        if entry.file_type().is_dir() {
            if let Err(e) = fs::create_dir_all(&destination) {
                ctx.reporter.warn(&format!("Error creating {}: {}", destination.display(), e));
            }
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }

        if let Some(parent) = destination.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                ctx.reporter.warn(&format!("Error creating {}: {}", parent.display(), e));
            }
        }
        match fs::copy(entry.path(), &destination) {
            Ok(_) => {
                stats.copied += 1;
                if cadence.should_report(stats.copied) {
                    let percent = cadence.percent(stats.copied);
                    ctx.reporter.progress(
                        percent,
                        &format!("Copying files: {}/{} ({}%)", stats.copied, total, percent),
                    );
                }
            }
            Err(e) => {
                stats.failed += 1;
                ctx.reporter.warn(&format!("Error copying {}: {}", entry.path().display(), e));
            }
        }
    }

    if cadence.is_short(stats.copied) {
        ctx.reporter.progress(
            100,
            &format!("Copy finished: {}/{} files, {} skipped", stats.copied, total, stats.failed),
        );
    }
    Ok(stats)
}
