// ============================================
// RTA Builder - verify.rs
// ============================================
// Post-build sanity check of the artifact.
//
// Reads the volume descriptors directly:
//   - sector 16 (0x8000): Primary Volume Descriptor, type 0x01 + "CD001"
//   - sector 17 (0x8800): Boot Record, type 0x00 + "CD001" + "EL TORITO..."
//
// The raw-archive tier produces a zip, which is reported as Other.
// ============================================

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

const PVD_OFFSET: u64 = 0x8000;
const BOOT_RECORD_OFFSET: u64 = 0x8800;

/// What kind of file the build produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// ISO 9660 with an El Torito boot record
    BootableIso,
    /// ISO 9660, no boot record
    Iso,
    /// Anything else (zip fallback, truncated file)
    Other,
}

impl ArtifactKind {
    pub fn describe(&self) -> &'static str {
        match self {
            ArtifactKind::BootableIso => "bootable ISO 9660 image",
            ArtifactKind::Iso => "ISO 9660 image without boot record",
            ArtifactKind::Other => "not an ISO 9660 image",
        }
    }
}

/// Classify the file at `path`. Unreadable files are `Other`.
pub fn inspect_artifact(path: &Path) -> ArtifactKind {
    if !check_iso_9660_signature(path) {
        return ArtifactKind::Other;
    }
    if check_el_torito_boot(path) {
        ArtifactKind::BootableIso
    } else {
        ArtifactKind::Iso
    }
}

fn read_at(path: &Path, offset: u64, buf: &mut [u8]) -> bool {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    file.seek(SeekFrom::Start(offset)).is_ok() && file.read_exact(buf).is_ok()
}

/// Primary Volume Descriptor: type 0x01 followed by "CD001"
pub fn check_iso_9660_signature(path: &Path) -> bool {
    let mut buf = [0u8; 6];
    read_at(path, PVD_OFFSET, &mut buf) && buf[0] == 0x01 && &buf[1..6] == b"CD001"
}

/// Boot Record Volume Descriptor naming the El Torito system
pub fn check_el_torito_boot(path: &Path) -> bool {
    let mut buf = [0u8; 39];
    if !read_at(path, BOOT_RECORD_OFFSET, &mut buf) {
        return false;
    }
    let system_id = String::from_utf8_lossy(&buf[7..39]);
    buf[0] == 0x00 && &buf[1..6] == b"CD001" && system_id.contains("EL TORITO")
}
