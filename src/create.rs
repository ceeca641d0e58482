// ============================================
// RTA Builder - create.rs
// ============================================
// Turns the customised folder back into a single image file.
//
// Three tiers, strongest first:
//   1. Masterer:          oscdimg from the Windows ADK (real bootable ISO)
//   2. ScriptedAuthoring: New-IsoFile via PowerShell + IMAPI2FS
//   3. RawArchive:        zip the tree and name it like the image
//
// RawArchive always works but the result is NOT bootable. The pipeline
// reports it as a degraded artifact.
//
// Boot sector lookup (first hit wins):
//   <source>/boot/etfsboot.com   BIOS, no emulation
//   <source>/boot/efisys.bin     EFI
// ============================================

use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::context::{StepContext, StrategyResult};
use crate::error::{BuildError, Result};
use crate::probe::CapabilitySet;
use crate::progress::{parse_authoring_line, parse_masterer_line, Cadence, LineEvent};
use crate::subprocess::{no_window, ps_quote, run_monitored};

/// The IMAPI2FS authoring function, dot-sourced when the host lacks it
const NEW_ISO_FILE_SCRIPT: &str = include_str!("New-IsoFile.ps1");

/// Suffix of the archive while it is being written
const ARCHIVE_SUFFIX: &str = ".zip";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateStrategy {
    /// oscdimg at the given path
    Masterer { tool: PathBuf },
    /// PowerShell at the given path
    ScriptedAuthoring { host: PathBuf },
    /// Deflate archive renamed to the output path
    RawArchive,
}

/// Which tier produced the artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationTier {
    NativeMaster,
    ScriptedAuthoring,
    RawArchive,
}

impl CreationTier {
    /// The artifact exists but is not a bootable image
    pub fn is_degraded(&self) -> bool {
        matches!(self, CreationTier::RawArchive)
    }
}

/// Order to try creation in. RawArchive is always last.
pub fn creation_plan(caps: &CapabilitySet) -> Vec<CreateStrategy> {
    let mut plan = Vec::new();
    if let Some(tool) = &caps.masterer {
        plan.push(CreateStrategy::Masterer { tool: tool.clone() });
    }
    if let Some(host) = &caps.script_host {
        plan.push(CreateStrategy::ScriptedAuthoring { host: host.clone() });
    }
    plan.push(CreateStrategy::RawArchive);
    plan
}

/// Tiers left out of the plan because their tool is missing, with the reason
pub fn skipped_creation(caps: &CapabilitySet) -> Vec<(&'static str, BuildError)> {
    let mut skipped = Vec::new();
    if caps.masterer.is_none() {
        skipped.push(("oscdimg image creation", BuildError::unavailable("oscdimg")));
    }
    if caps.script_host.is_none() {
        skipped.push(("PowerShell image authoring", BuildError::unavailable("PowerShell")));
    }
    skipped
}

impl CreateStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            CreateStrategy::Masterer { .. } => "oscdimg image creation",
            CreateStrategy::ScriptedAuthoring { .. } => "PowerShell image authoring",
            CreateStrategy::RawArchive => "raw archive creation",
        }
    }

    pub fn tier(&self) -> CreationTier {
        match self {
            CreateStrategy::Masterer { .. } => CreationTier::NativeMaster,
            CreateStrategy::ScriptedAuthoring { .. } => CreationTier::ScriptedAuthoring,
            CreateStrategy::RawArchive => CreationTier::RawArchive,
        }
    }

    /// Build `output` from the tree at `source`
    pub fn create(&self, ctx: &mut StepContext, source: &Path, output: &Path, volume_label: &str) -> StrategyResult {
        let mut result = match self {
            CreateStrategy::Masterer { tool } => create_with_masterer(ctx, tool, source, output, volume_label),
            CreateStrategy::ScriptedAuthoring { host } => {
                create_with_script(ctx, host, source, output, volume_label)
            }
            CreateStrategy::RawArchive => create_raw_archive(ctx, source, output),
        };

        if result.is_ok() && !output.is_file() {
            result = Err(BuildError::SubprocessFailure {
                tool: self.name().to_string(),
                code: Some(0),
                detail: format!("reported success but {} was not written", output.display()),
            });
        }

        if let Err(e) = &result {
            if !e.is_cancelled() {
                ctx.reporter.warn(&format!("{} failed: {}", self.name(), e));
            }
        }
        result.into()
    }
}

// ============================================
// BOOT SECTOR DISCOVERY
// ============================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootAsset {
    pub path: PathBuf,
    pub efi: bool,
}

pub fn find_boot_asset(source: &Path) -> Option<BootAsset> {
    ["etfsboot.com", "efisys.bin"].iter().find_map(|name| {
        let path = source.join("boot").join(name);
        path.is_file().then(|| BootAsset {
            path,
            efi: name.contains("efi"),
        })
    })
}

/// Remove a stale output so a failed run can't leave an old image in place
fn remove_existing_output(output: &Path) {
    if output.exists() {
        debug!("Removing existing output file {}", output.display());
        if let Err(e) = fs::remove_file(output) {
            warn!("Could not remove existing file {}: {}", output.display(), e);
        }
    }
}

fn discard_partial(output: &Path) {
    if output.exists() {
        if let Err(e) = fs::remove_file(output) {
            warn!("Could not remove partial output {}: {}", output.display(), e);
        }
    }
}

// ============================================
// OSCDIMG
// ============================================

/// Full oscdimg argument list, source and destination last
pub fn masterer_args(source: &Path, output: &Path, volume_label: &str, boot: Option<&BootAsset>) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-m".into(),                          // Ignore maximum image size
        "-o".into(),                          // Optimize storage (dedupe files)
        "-u2".into(),                         // UDF file system
        format!("-l{}", volume_label).into(), // Volume label
    ];
    if let Some(boot) = boot {
        if boot.efi {
            args.push("-pEF".into()); // EFI platform id
            args.push("-e".into());   // No floppy emulation
        }
        let mut flag = OsString::from("-b");
        flag.push(&boot.path);
        args.push(flag);
    }
    args.push(source.as_os_str().to_os_string());
    args.push(output.as_os_str().to_os_string());
    args
}

fn create_with_masterer(
    ctx: &mut StepContext,
    tool: &Path,
    source: &Path,
    output: &Path,
    volume_label: &str,
) -> Result<()> {
    ctx.reporter.info("Creating ISO with oscdimg.exe...");
    remove_existing_output(output);

    let boot = find_boot_asset(source);
    match &boot {
        Some(asset) => ctx.reporter.info(&format!("Boot sector: {}", asset.path.display())),
        None => ctx.reporter.warn("No boot sector found - image may not be bootable"),
    }

    let mut cmd = Command::new(tool);
    cmd.args(masterer_args(source, output, volume_label, boot.as_ref()));

    let reporter = &mut ctx.reporter;
    let result = run_monitored("oscdimg", cmd, &ctx.stop, ctx.settings.tool_idle_timeout, |line| {
        match parse_masterer_line(line) {
            LineEvent::Progress(event) => reporter.report(&event),
            LineEvent::Message(message) => reporter.detail(&message),
            LineEvent::Blank => {}
        }
    });
    if result.is_err() {
        discard_partial(output);
    }
    result?;

    ctx.reporter.info("ISO created successfully");
    Ok(())
}

// ============================================
// POWERSHELL (IMAPI2FS)
// ============================================

/// Does the host already define New-IsoFile (profile, module path)?
fn host_has_new_iso_file(host: &Path) -> bool {
    let mut cmd = Command::new(host);
    cmd.args([
        "-NoProfile",
        "-NonInteractive",
        "-Command",
        "Get-Command New-IsoFile -ErrorAction SilentlyContinue",
    ]);
    no_window(&mut cmd);
    match cmd.output() {
        Ok(output) => String::from_utf8_lossy(&output.stdout).contains("New-IsoFile"),
        Err(e) => {
            debug!("New-IsoFile lookup failed to run: {}", e);
            false
        }
    }
}

/// Write the embedded script where PowerShell can dot-source it
pub fn materialize_script(dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir).map_err(|e| BuildError::io_at("Failed to create", dir, e))?;
    let path = dir.join("New-IsoFile.ps1");
    fs::write(&path, NEW_ISO_FILE_SCRIPT).map_err(|e| BuildError::io_at("Failed to write", &path, e))?;
    Ok(path)
}

/// The `-Command` text: optional dot-source, then the New-IsoFile call
pub fn authoring_script(
    script: Option<&Path>,
    source: &Path,
    output: &Path,
    volume_label: &str,
    boot: Option<&BootAsset>,
) -> String {
    let mut text = String::new();
    if let Some(script) = script {
        text.push_str(&format!(". {}; ", ps_quote(&script.to_string_lossy())));
    }
    text.push_str(&format!(
        "New-IsoFile -Source {} -Destination {} -VolumeName {}",
        ps_quote(&source.to_string_lossy()),
        ps_quote(&output.to_string_lossy()),
        ps_quote(volume_label)
    ));
    if let Some(boot) = boot {
        text.push_str(&format!(" -Bootable -BootFile {}", ps_quote(&boot.path.to_string_lossy())));
    }
    text
}

fn create_with_script(
    ctx: &mut StepContext,
    host: &Path,
    source: &Path,
    output: &Path,
    volume_label: &str,
) -> Result<()> {
    ctx.reporter.info("Creating ISO with PowerShell...");
    remove_existing_output(output);

    let script = if host_has_new_iso_file(host) {
        None
    } else {
        ctx.reporter.info("New-IsoFile command not available, loading bundled script...");
        Some(materialize_script(&std::env::temp_dir().join("rtabuilder"))?)
    };

    let boot = find_boot_asset(source);
    let command_text = authoring_script(script.as_deref(), source, output, volume_label, boot.as_ref());

    let mut cmd = Command::new(host);
    cmd.args([
        "-NoProfile",
        "-NonInteractive",
        "-ExecutionPolicy",
        "Bypass",
        "-Command",
        &command_text,
    ]);

    let reporter = &mut ctx.reporter;
    let result = run_monitored("PowerShell", cmd, &ctx.stop, ctx.settings.tool_idle_timeout, |line| {
        match parse_authoring_line(line) {
            LineEvent::Progress(event) => reporter.report(&event),
            LineEvent::Message(message) => reporter.detail(&message),
            LineEvent::Blank => {}
        }
    });
    if result.is_err() {
        discard_partial(output);
    }
    result?;

    ctx.reporter.info("ISO created successfully with PowerShell");
    Ok(())
}

// ============================================
// RAW ARCHIVE (LAST RESORT)
// ============================================

fn archive_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(ARCHIVE_SUFFIX);
    PathBuf::from(name)
}

fn create_raw_archive(ctx: &mut StepContext, source: &Path, output: &Path) -> Result<()> {
    ctx.reporter.warn("Attempting basic image creation (note: result will not be bootable)...");
    let partial = archive_path(output);

    if let Err(e) = write_archive(ctx, source, &partial) {
        discard_partial(&partial);
        return Err(e);
    }

    if output.exists() {
        fs::remove_file(output).map_err(|e| BuildError::io_at("Failed to replace", output, e))?;
    }
    if let Err(e) = fs::rename(&partial, output) {
        discard_partial(&partial);
        return Err(BuildError::io_at("Failed to rename archive to", output, e));
    }

    ctx.reporter.warn("Basic archive created (note: this is not a bootable image)");
    Ok(())
}

fn zip_error(e: zip::result::ZipError) -> BuildError {
    BuildError::io("Failed to write archive", io::Error::other(e))
}

fn write_archive(ctx: &mut StepContext, source: &Path, archive: &Path) -> Result<()> {
    let total = WalkDir::new(source)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count() as u64;
    let cadence = Cadence::new(ctx.settings.progress_every, total);

    let file = File::create(archive).map_err(|e| BuildError::io_at("Failed to create", archive, e))?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);

    let mut processed = 0u64;
    for entry in WalkDir::new(source).min_depth(1) {
        ctx.stop.check()?;

        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                ctx.reporter.warn(&format!("Error reading source tree: {}", e));
                continue;
            }
        };
        let name = match entry.path().strip_prefix(source) {
            Ok(relative) => archive_name(relative),
            Err(_) => continue,
        };

        if entry.file_type().is_dir() {
            zip.add_directory(name, options).map_err(zip_error)?;
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }

        let mut input = match File::open(entry.path()) {
            Ok(f) => f,
            Err(e) => {
                ctx.reporter.warn(&format!("Skipping {}: {}", entry.path().display(), e));
                continue;
            }
        };
        if let Err(e) = add_file(&mut zip, name, options, &mut input) {
            ctx.reporter.warn(&format!("Skipping {}: {}", entry.path().display(), e));
            continue;
        }

        processed += 1;
        if cadence.should_report(processed) {
            let percent = cadence.percent(processed);
            ctx.reporter.progress(
                percent,
                &format!("Archiving: {}/{} files ({}%)", processed, total, percent),
            );
        }
    }

    if cadence.is_short(processed) {
        ctx.reporter.progress(
            100,
            &format!("Archiving finished: {}/{} files, {} skipped", processed, total, total - processed),
        );
    }

    zip.finish().map_err(zip_error)?;
    Ok(())
}

/// Write one entry. A read error drops the half-written entry and leaves
/// the archive usable for the next file.
fn add_file<W: io::Write + io::Seek>(
    zip: &mut ZipWriter<W>,
    name: String,
    options: SimpleFileOptions,
    input: &mut impl io::Read,
) -> Result<()> {
    zip.start_file(name, options).map_err(zip_error)?;
    if let Err(e) = io::copy(input, zip) {
        zip.abort_file().map_err(zip_error)?;
        return Err(BuildError::io("Failed to read file", e));
    }
    Ok(())
}

/// Zip entry names always use forward slashes
fn archive_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::StopFlag;
    use crate::context::RunSettings;
    use crate::mount::tests::FakeBackend;
    use crate::mount::MountManager;
    use crate::progress::Reporter;
    use std::sync::Arc;
    use std::time::Duration;

    fn context<'a>(stop: StopFlag, sink: impl FnMut(&str, Option<u8>) + 'a) -> StepContext<'a> {
        StepContext {
            reporter: Reporter::new(sink),
            stop,
            settings: RunSettings::default(),
            mounts: MountManager::new(Arc::new(FakeBackend::new(Path::new("."))), 1, Duration::ZERO),
        }
    }

    fn make_tree(root: &Path, files: usize) {
        for i in 0..files {
            let dir = root.join(format!("pool{}", i % 5));
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join(format!("pkg{}.deb", i)), vec![b'k'; i % 64]).unwrap();
        }
        fs::create_dir_all(root.join("boot")).unwrap();
    }

    #[test]
    fn test_plan_order() {
        let caps = CapabilitySet {
            archiver: None,
            masterer: Some(PathBuf::from("oscdimg.exe")),
            script_host: Some(PathBuf::from("powershell.exe")),
        };
        let tiers: Vec<_> = creation_plan(&caps).iter().map(|s| s.tier()).collect();
        assert_eq!(
            tiers,
            vec![CreationTier::NativeMaster, CreationTier::ScriptedAuthoring, CreationTier::RawArchive]
        );
        assert_eq!(creation_plan(&CapabilitySet::none()), vec![CreateStrategy::RawArchive]);
        assert!(CreationTier::RawArchive.is_degraded());
        assert!(!CreationTier::NativeMaster.is_degraded());
    }

    #[test]
    fn test_boot_asset_prefers_etfsboot() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(find_boot_asset(dir.path()), None);

        fs::create_dir_all(dir.path().join("boot")).unwrap();
        fs::write(dir.path().join("boot").join("efisys.bin"), b"efi").unwrap();
        let efi = find_boot_asset(dir.path()).unwrap();
        assert!(efi.efi);

        fs::write(dir.path().join("boot").join("etfsboot.com"), b"bios").unwrap();
        let bios = find_boot_asset(dir.path()).unwrap();
        assert!(!bios.efi);
        assert!(bios.path.ends_with("etfsboot.com"));
    }

    #[test]
    fn test_masterer_args() {
        let boot = BootAsset {
            path: PathBuf::from("src/boot/efisys.bin"),
            efi: true,
        };
        let args: Vec<String> = masterer_args(Path::new("src"), Path::new("out.iso"), "KALI_RTA", Some(&boot))
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(&args[..4], &["-m", "-o", "-u2", "-lKALI_RTA"]);
        assert!(args.contains(&"-pEF".to_string()));
        assert!(args.contains(&"-e".to_string()));
        assert!(args.iter().any(|a| a.starts_with("-b") && a.ends_with("efisys.bin")));
        assert_eq!(&args[args.len() - 2..], &["src", "out.iso"]);

        let plain = masterer_args(Path::new("src"), Path::new("out.iso"), "X", None);
        assert_eq!(plain.len(), 6);
    }

    #[test]
    fn test_authoring_script_text() {
        let boot = BootAsset {
            path: PathBuf::from("boot/etfsboot.com"),
            efi: false,
        };
        let text = authoring_script(
            Some(Path::new("New-IsoFile.ps1")),
            Path::new("tree"),
            Path::new("it's.iso"),
            "KALI_RTA",
            Some(&boot),
        );
        assert!(text.starts_with(". 'New-IsoFile.ps1'; New-IsoFile"));
        assert!(text.contains("-Destination 'it''s.iso'"));
        assert!(text.ends_with("-Bootable -BootFile 'boot/etfsboot.com'"));

        let bare = authoring_script(None, Path::new("tree"), Path::new("o.iso"), "L", None);
        assert!(bare.starts_with("New-IsoFile"));
        assert!(!bare.contains("-Bootable"));
    }

    #[test]
    fn test_materialized_script_defines_function() {
        let dir = tempfile::tempdir().unwrap();
        let path = materialize_script(dir.path()).unwrap();
        let text = fs::read_to_string(path).unwrap();
        assert!(text.contains("function New-IsoFile"));
        assert!(text.contains("% complete"));
    }

    #[test]
    fn test_raw_archive_250_files() {
        let source = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        make_tree(source.path(), 250);
        let output = out_dir.path().join("kali-rta-custom.iso");
        fs::write(&output, b"stale").unwrap();

        let mut percents = Vec::new();
        let result = {
            let mut ctx = context(StopFlag::new(), |_: &str, p: Option<u8>| {
                if let Some(p) = p {
                    percents.push(p);
                }
            });
            CreateStrategy::RawArchive.create(&mut ctx, source.path(), &output, "KALI_RTA")
        };

        assert!(result.success, "{:?}", result.detail);
        assert_eq!(percents, vec![40, 80, 100]);
        let produced: Vec<_> = fs::read_dir(out_dir.path()).unwrap().collect();
        assert_eq!(produced.len(), 1);

        let archive = zip::ZipArchive::new(File::open(&output).unwrap()).unwrap();
        let files = archive.file_names().filter(|n| !n.ends_with('/')).count();
        assert_eq!(files, 250);
        assert!(archive.file_names().any(|n| n == "pool3/pkg3.deb"));
    }

    #[test]
    fn test_raw_archive_stop_leaves_no_partial_archive() {
        let source = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        make_tree(source.path(), 20);
        let output = out_dir.path().join("out.iso");

        let stop = StopFlag::new();
        stop.request_stop();
        let result = {
            let mut ctx = context(stop, |_: &str, _: Option<u8>| {});
            CreateStrategy::RawArchive.create(&mut ctx, source.path(), &output, "KALI_RTA")
        };
        assert!(!result.success);
        assert!(!archive_path(&output).exists());
    }

    /// Hands out a few bytes, then fails like a bad sector
    struct FailingReader {
        served: bool,
    }

    impl io::Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.served {
                return Err(io::Error::other("read error"));
            }
            self.served = true;
            let n = buf.len().min(4);
            buf[..n].copy_from_slice(&b"data"[..n]);
            Ok(n)
        }
    }

    #[test]
    fn test_unreadable_file_is_skipped_not_fatal() {
        let mut zip = ZipWriter::new(io::Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        let err = add_file(&mut zip, "bad.bin".to_string(), options, &mut FailingReader { served: false });
        assert!(err.is_err());
        add_file(&mut zip, "good.bin".to_string(), options, &mut &b"fine"[..]).unwrap();

        let bytes = zip.finish().unwrap().into_inner();
        let archive = zip::ZipArchive::new(io::Cursor::new(bytes)).unwrap();
        let names: Vec<_> = archive.file_names().collect();
        assert_eq!(names, vec!["good.bin"]);
    }

    #[cfg(unix)]
    fn fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn test_masterer_exit_codes() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("tree");
        make_tree(&source, 3);
        let output = dir.path().join("out.iso");

        let good = fake_tool(
            dir.path(),
            "oscdimg",
            "for last; do :; done\necho ' 45% complete'\necho image > \"$last\"\nexit 0",
        );
        let killed = fake_tool(dir.path(), "oscdimg-killed", "echo 'terminated' >&2\nexit 137");

        let mut events = Vec::new();
        let (ok, bad) = {
            let mut ctx = context(StopFlag::new(), |m: &str, p: Option<u8>| events.push((m.to_string(), p)));
            let ok = CreateStrategy::Masterer { tool: good }.create(&mut ctx, &source, &output, "KALI_RTA");
            let bad = CreateStrategy::Masterer { tool: killed }.create(&mut ctx, &source, &output, "KALI_RTA");
            (ok, bad)
        };

        assert!(ok.success);
        assert!(events.iter().any(|(m, p)| m == "ISO creation progress: 45%" && *p == Some(45)));
        assert!(!bad.success);
        assert!(bad.detail.unwrap().contains("exit code 137"));
        // The failed run removed the previous image rather than leaving it behind
        assert!(!output.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_masterer_success_without_output_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "oscdimg", "exit 0");
        let result = {
            let mut ctx = context(StopFlag::new(), |_: &str, _: Option<u8>| {});
            CreateStrategy::Masterer { tool }.create(&mut ctx, dir.path(), &dir.path().join("none.iso"), "L")
        };
        assert!(!result.success);
    }

    #[cfg(unix)]
    #[test]
    fn test_scripted_authoring_progress() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("tree");
        make_tree(&source, 3);
        let output = dir.path().join("authored.iso");

        let host = fake_tool(
            dir.path(),
            "powershell",
            r#"for last; do :; done
dest=$(printf '%s' "$last" | sed -n "s/.*-Destination '\([^']*\)'.*/\1/p")
echo 'Adding files to image...'
echo '50% of files queued'
echo '60% complete'
[ -n "$dest" ] && echo image > "$dest"
exit 0"#,
        );

        let mut events = Vec::new();
        let result = {
            let mut ctx = context(StopFlag::new(), |m: &str, p: Option<u8>| events.push((m.to_string(), p)));
            CreateStrategy::ScriptedAuthoring { host }.create(&mut ctx, &source, &output, "KALI_RTA")
        };

        assert!(result.success, "{:?}", result.detail);
        assert!(output.is_file());
        let progress: Vec<_> = events.iter().filter_map(|(_, p)| *p).collect();
        assert_eq!(progress, vec![60]);
        assert!(events.iter().any(|(m, p)| m == "50% of files queued" && p.is_none()));
    }
}
