// ============================================
// RTA Builder - customize.rs
// ============================================
// The stock mutation step run between Extract and Create.
//
// Populate:
//   For each selected tool, copy <tools_folder>/<slug>/ into
//   <tree>/tools/<slug>/. Tools without a folder get a placeholder info.txt
//   so the selection is still visible in the finished image.
//
// Customize:
//   <tree>/etc/hostname   single line, the job's hostname
//   <tree>/branding/      copied from <tools_folder>/branding/ when enabled
// ============================================

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::context::StepContext;
use crate::error::{BuildError, Result};
use crate::pipeline::{BuildJob, Mutation};

/// Folder name used for a tool: "Burp Suite" -> "burp_suite".
/// Separators and leading/trailing dots are dropped so the result is always
/// a single component under tools/.
pub fn slug(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| !matches!(*c, '/' | '\\' | ':'))
        .map(|c| if c == ' ' { '_' } else { c })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "tool".to_string(),
        slug => slug.to_string(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct DefaultMutation {
    tools_folder: Option<PathBuf>,
}

impl DefaultMutation {
    pub fn new(tools_folder: Option<PathBuf>) -> Self {
        Self { tools_folder }
    }

    fn tool_source(&self, slug: &str) -> Option<PathBuf> {
        self.tools_folder
            .as_ref()
            .map(|folder| folder.join(slug))
            .filter(|dir| dir.is_dir())
    }
}

impl Mutation for DefaultMutation {
    fn populate(&self, ctx: &mut StepContext, tree: &Path, job: &BuildJob) -> Result<()> {
        let tools_dir = tree.join("tools");
        fs::create_dir_all(&tools_dir).map_err(|e| BuildError::io_at("Failed to create", &tools_dir, e))?;

        let total = job.content_items.len();
        if total == 0 {
            ctx.reporter.info("No tools selected");
            return Ok(());
        }

        for (index, tool) in job.content_items.iter().enumerate() {
            ctx.stop.check()?;

            let slug = slug(tool);
            let dest = tools_dir.join(&slug);
            match self.tool_source(&slug) {
                Some(source) => {
                    ctx.reporter.info(&format!("Adding tool: {}", tool));
                    let copied = copy_dir_recursive(ctx, &source, &dest)?;
                    debug!("Copied {} file(s) for {}", copied, tool);
                }
                None => {
                    ctx.reporter.info(&format!("Adding tool: {} (placeholder)", tool));
                    fs::create_dir_all(&dest).map_err(|e| BuildError::io_at("Failed to create", &dest, e))?;
                    let info = dest.join("info.txt");
                    let text = format!(
                        "Placeholder for {}\nPut the tool's files in tools/{}/ of the tools folder to include them.\n",
                        tool, slug
                    );
                    fs::write(&info, text).map_err(|e| BuildError::io_at("Failed to write", &info, e))?;
                }
            }

            let percent = (((index + 1) * 100) / total) as u8;
            ctx.reporter.progress(percent, &format!("Tools added: {}/{}", index + 1, total));
        }
        Ok(())
    }

    fn customize(&self, ctx: &mut StepContext, tree: &Path, job: &BuildJob) -> Result<()> {
        let hostname_file = tree.join("etc").join("hostname");
        if let Some(parent) = hostname_file.parent() {
            fs::create_dir_all(parent).map_err(|e| BuildError::io_at("Failed to create", parent, e))?;
        }
        fs::write(&hostname_file, format!("{}\n", job.hostname.trim()))
            .map_err(|e| BuildError::io_at("Failed to write", &hostname_file, e))?;
        ctx.reporter.info(&format!("Hostname set to {}", job.hostname.trim()));
        ctx.reporter.progress(50, "Hostname written");

        ctx.stop.check()?;
        if job.branding {
            let assets = self
                .tools_folder
                .as_ref()
                .map(|folder| folder.join("branding"))
                .filter(|dir| dir.is_dir());
            match assets {
                Some(source) => {
                    ctx.reporter.info("Adding branding...");
                    copy_dir_recursive(ctx, &source, &tree.join("branding"))?;
                }
                None => ctx.reporter.warn("Branding enabled but no branding/ folder was found; skipping"),
            }
        }
        ctx.reporter.progress(100, "Customization applied");
        Ok(())
    }
}

/// Copy a directory tree, checking the stop flag between files.
/// Returns the number of files copied.
pub fn copy_dir_recursive(ctx: &mut StepContext, source: &Path, dest: &Path) -> Result<u64> {
    let mut copied = 0;
    for entry in WalkDir::new(source) {
        ctx.stop.check()?;
        let entry = entry.map_err(|e| BuildError::io(format!("Failed to read {}", source.display()), e.into()))?;
        let relative = match entry.path().strip_prefix(source) {
            Ok(relative) => relative,
            Err(_) => continue,
        };
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| BuildError::io_at("Failed to create", &target, e))?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target).map_err(|e| BuildError::io_at("Failed to copy", entry.path(), e))?;
            copied += 1;
        }
    }
    Ok(copied)
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

    fn context(stop: StopFlag) -> StepContext<'static> {
        StepContext {
            reporter: Reporter::silent(),
            stop,
            settings: RunSettings::default(),
            mounts: MountManager::new(Arc::new(FakeBackend::new(Path::new("."))), 1, Duration::ZERO),
        }
    }

    fn job(items: &[&str]) -> BuildJob {
        let mut job = BuildJob::new(PathBuf::from("kali.iso"), PathBuf::from("out.iso"), PathBuf::from("ws"));
        job.content_items = items.iter().map(|s| s.to_string()).collect();
        job.hostname = "rta-01".to_string();
        job
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Burp Suite"), "burp_suite");
        assert_eq!(slug("John the Ripper"), "john_the_ripper");
        assert_eq!(slug(" Nmap "), "nmap");
        assert_eq!(slug("../x"), "x");
        assert_eq!(slug(".."), "tool");
        assert_eq!(slug(r"..\..\Windows"), "windows");
    }

    #[test]
    fn test_hostile_names_stay_inside_tools() {
        let tree = tempfile::tempdir().unwrap();
        let root = tree.path().join("iso");
        fs::create_dir_all(&root).unwrap();

        let mut ctx = context(StopFlag::new());
        DefaultMutation::default()
            .populate(&mut ctx, &root, &job(&["../escape", "/etc"]))
            .unwrap();

        assert!(!tree.path().join("escape").exists());
        assert!(root.join("tools").join("escape").join("info.txt").is_file());
        assert!(root.join("tools").join("etc").join("info.txt").is_file());
    }

    #[test]
    fn test_populate_copies_real_folders_and_writes_placeholders() {
        let tools = tempfile::tempdir().unwrap();
        let tree = tempfile::tempdir().unwrap();
        let nmap = tools.path().join("nmap");
        fs::create_dir_all(nmap.join("scripts")).unwrap();
        fs::write(nmap.join("nmap.exe"), b"MZ").unwrap();
        fs::write(nmap.join("scripts").join("http-title.nse"), b"-- nse").unwrap();

        let mutation = DefaultMutation::new(Some(tools.path().to_path_buf()));
        let mut ctx = context(StopFlag::new());
        mutation
            .populate(&mut ctx, tree.path(), &job(&["Nmap", "Burp Suite"]))
            .unwrap();

        let installed = tree.path().join("tools");
        assert_eq!(fs::read(installed.join("nmap").join("nmap.exe")).unwrap(), b"MZ");
        assert!(installed.join("nmap").join("scripts").join("http-title.nse").is_file());
        let info = fs::read_to_string(installed.join("burp_suite").join("info.txt")).unwrap();
        assert!(info.starts_with("Placeholder for Burp Suite"));
    }

    #[test]
    fn test_customize_writes_hostname_and_branding() {
        let tools = tempfile::tempdir().unwrap();
        let tree = tempfile::tempdir().unwrap();
        fs::create_dir_all(tools.path().join("branding")).unwrap();
        fs::write(tools.path().join("branding").join("splash.png"), b"png").unwrap();

        let mut job = job(&[]);
        job.branding = true;
        let mutation = DefaultMutation::new(Some(tools.path().to_path_buf()));
        let mut ctx = context(StopFlag::new());
        mutation.customize(&mut ctx, tree.path(), &job).unwrap();

        let hostname = fs::read_to_string(tree.path().join("etc").join("hostname")).unwrap();
        assert_eq!(hostname, "rta-01\n");
        assert!(tree.path().join("branding").join("splash.png").is_file());
    }

    #[test]
    fn test_populate_honours_stop() {
        let tree = tempfile::tempdir().unwrap();
        let stop = StopFlag::new();
        stop.request_stop();
        let mut ctx = context(stop);
        let err = DefaultMutation::default()
            .populate(&mut ctx, tree.path(), &job(&["Nmap"]))
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(!tree.path().join("tools").join("nmap").exists());
    }
}
