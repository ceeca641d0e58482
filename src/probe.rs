// ============================================
// RTA Builder - probe.rs
// ============================================
// Finds the optional external tools this builder can use:
//   - 7-Zip (7z.exe)         -> archiver extraction tier
//   - oscdimg (Windows ADK)  -> native mastering tier
//   - PowerShell             -> scripted image-authoring tier
//
// A missing tool is normal. It just means a weaker tier gets used.
// ============================================

use std::path::PathBuf;

use tracing::debug;

use crate::config::{get_app_directory, BuilderConfig};

const OSCDIMG_SUBPATH: &str =
    r"Windows Kits\10\Assessment and Deployment Kit\Deployment Tools\amd64\Oscdimg\oscdimg.exe";

/// What the host has available. Paths are absolute when present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    pub archiver: Option<PathBuf>,
    pub masterer: Option<PathBuf>,
    pub script_host: Option<PathBuf>,
}

impl CapabilitySet {
    /// Nothing installed: mount-and-copy plus raw archive only
    pub fn none() -> Self {
        Self::default()
    }

    pub fn has_archiver(&self) -> bool {
        self.archiver.is_some()
    }

    pub fn has_masterer(&self) -> bool {
        self.masterer.is_some()
    }

    pub fn has_script_host(&self) -> bool {
        self.script_host.is_some()
    }
}

/// Ordered candidate locations for each tool
#[derive(Debug, Clone, Default)]
pub struct ToolLocations {
    pub archiver: Vec<PathBuf>,
    pub masterer: Vec<PathBuf>,
    pub script_host: Vec<PathBuf>,
    /// Also consult PATH after the explicit candidates
    pub search_path: bool,
}

impl ToolLocations {
    /// Configured paths first, then the well-known install locations
    pub fn for_host(config: &BuilderConfig) -> Self {
        let program_files = env_dir("ProgramFiles", r"C:\Program Files");
        let program_files_x86 = env_dir("ProgramFiles(x86)", r"C:\Program Files (x86)");
        let system_root = env_dir("SystemRoot", r"C:\Windows");

        let mut archiver = config.archiver_paths.clone();
        archiver.push(program_files.join("7-Zip").join("7z.exe"));
        archiver.push(program_files_x86.join("7-Zip").join("7z.exe"));

        let mut masterer = config.masterer_paths.clone();
        masterer.push(program_files.join(OSCDIMG_SUBPATH));
        masterer.push(program_files_x86.join(OSCDIMG_SUBPATH));
        // Bundled copy next to our exe
        masterer.push(get_app_directory().join("tools").join("oscdimg.exe"));

        let mut script_host = config.script_host_paths.clone();
        script_host.push(
            system_root
                .join("System32")
                .join("WindowsPowerShell")
                .join("v1.0")
                .join("powershell.exe"),
        );

        Self {
            archiver,
            masterer,
            script_host,
            search_path: true,
        }
    }
}

fn env_dir(var: &str, fallback: &str) -> PathBuf {
    std::env::var_os(var)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(fallback))
}

/// Probe the host with its default locations. Never fails.
pub fn probe(config: &BuilderConfig) -> CapabilitySet {
    probe_locations(&ToolLocations::for_host(config))
}

/// Probe an explicit set of locations
pub fn probe_locations(locations: &ToolLocations) -> CapabilitySet {
    let path_lookup = |names: &[&str]| -> Option<PathBuf> {
        if !locations.search_path {
            return None;
        }
        names.iter().find_map(|name| which::which(name).ok())
    };

    let caps = CapabilitySet {
        archiver: first_existing(&locations.archiver).or_else(|| path_lookup(&["7z", "7z.exe"])),
        masterer: first_existing(&locations.masterer)
            .or_else(|| path_lookup(&["oscdimg", "oscdimg.exe"])),
        script_host: first_existing(&locations.script_host)
            .or_else(|| path_lookup(&["powershell", "pwsh"])),
    };

    debug!(
        archiver = ?caps.archiver,
        masterer = ?caps.masterer,
        script_host = ?caps.script_host,
        "Capability scan finished"
    );
    caps
}

fn first_existing(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates.iter().find(|p| p.is_file()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_finds_first_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let second = dir.path().join("b").join("7z.exe");
        fs::create_dir_all(second.parent().unwrap()).unwrap();
        fs::write(&second, b"").unwrap();

        let locations = ToolLocations {
            archiver: vec![dir.path().join("a").join("7z.exe"), second.clone()],
            masterer: vec![dir.path().join("oscdimg.exe")],
            script_host: Vec::new(),
            search_path: false,
        };

        let caps = probe_locations(&locations);
        assert_eq!(caps.archiver, Some(second));
        assert!(!caps.has_masterer());
        assert!(!caps.has_script_host());
    }

    #[test]
    fn test_directories_are_not_tools() {
        let dir = tempfile::tempdir().unwrap();
        let locations = ToolLocations {
            archiver: vec![dir.path().to_path_buf()],
            search_path: false,
            ..Default::default()
        };
        assert_eq!(probe_locations(&locations), CapabilitySet::none());
    }

    #[test]
    fn test_configured_paths_come_first() {
        let config = BuilderConfig {
            masterer_paths: vec![PathBuf::from("custom-oscdimg.exe")],
            ..Default::default()
        };
        let locations = ToolLocations::for_host(&config);
        assert_eq!(locations.masterer[0], PathBuf::from("custom-oscdimg.exe"));
        assert!(locations.masterer.len() >= 3);
        assert!(locations.archiver.iter().any(|p| p.ends_with("7z.exe")));
    }
}
