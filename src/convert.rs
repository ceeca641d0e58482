// ============================================
// RTA Builder - convert.rs
// ============================================
// Extra output formats written next to the finished image.
//
//   Vhd      fixed-size VHD: the image padded to 512 bytes + a 512-byte footer
//   RawDisk  the image padded to 1 MiB, for cloud VM import (AMI)
//
// Fixed VHD footer layout (integers big-endian):
//   0   cookie "conectix"         40  original size
//   8   features (2)              48  current size
//   12  format version 1.0        56  geometry (cyl u16, heads u8, spt u8)
//   16  data offset (all ones)    60  disk type (2 = fixed)
//   24  timestamp (since 2000)    64  checksum
//   28  creator application       68  unique id (16 bytes)
//   32  creator version           84  saved state, then zero padding
//   36  creator host OS
// ============================================

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::context::StepContext;
use crate::error::{BuildError, Result};

const SECTOR: u64 = 512;
const MIB: u64 = 1024 * 1024;
const CHUNK: usize = 4 * 1024 * 1024;

/// Seconds between the Unix epoch and 2000-01-01T00:00:00Z
const VHD_EPOCH_OFFSET: i64 = 946_684_800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Vhd,
    RawDisk,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Vhd => "vhd",
            OutputFormat::RawDisk => "raw",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            OutputFormat::Vhd => "VHD",
            OutputFormat::RawDisk => "raw disk (AMI)",
        }
    }

    fn alignment(&self) -> u64 {
        match self {
            OutputFormat::Vhd => SECTOR,
            OutputFormat::RawDisk => MIB,
        }
    }
}

/// Where the converted copy of `image` goes. Never the image itself:
/// "build.raw" converted to raw disk becomes "build-disk.raw".
pub fn converted_path(image: &Path, format: OutputFormat) -> PathBuf {
    let target = image.with_extension(format.extension());
    if target != image {
        return target;
    }
    let stem = image
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    image.with_file_name(format!("{}-disk.{}", stem, format.extension()))
}

/// Write `image` out in `format`. A partial file is removed on failure.
pub fn convert(ctx: &mut StepContext, image: &Path, format: OutputFormat) -> Result<PathBuf> {
    let target = converted_path(image, format);
    ctx.reporter.info(&format!("Converting to {}: {}", format.label(), target.display()));

    let result = write_converted(ctx, image, &target, format);
    if result.is_err() && target.exists() {
        let _ = fs::remove_file(&target);
    }
    let data_size = result?;

    info!(size = data_size, "Wrote {}", target.display());
    ctx.reporter.info(&format!("{} created: {}", format.label(), target.display()));
    Ok(target)
}

fn write_converted(ctx: &mut StepContext, image: &Path, target: &Path, format: OutputFormat) -> Result<u64> {
    let input = File::open(image).map_err(|e| BuildError::io_at("Failed to open", image, e))?;
    let total = input
        .metadata()
        .map_err(|e| BuildError::io_at("Failed to read size of", image, e))?
        .len();
    let output = File::create(target).map_err(|e| BuildError::io_at("Failed to create", target, e))?;

    let mut reader = BufReader::new(input);
    let mut writer = BufWriter::new(output);
    let write_err = |e| BuildError::io_at("Failed to write", target, e);

    let mut buf = vec![0u8; CHUNK];
    let mut copied = 0u64;
    let mut last_percent = 0u8;
    loop {
        ctx.stop.check()?;
        let n = reader
            .read(&mut buf)
            .map_err(|e| BuildError::io_at("Failed to read", image, e))?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).map_err(write_err)?;
        copied += n as u64;

        let percent = ((copied * 100) / total.max(1)).min(100) as u8;
        if percent >= last_percent.saturating_add(10) {
            last_percent = percent;
            ctx.reporter.progress(percent, &format!("{} conversion: {}%", format.label(), percent));
        }
    }

    let data_size = align_up(copied, format.alignment());
    write_zeros(&mut writer, data_size - copied).map_err(write_err)?;

    if format == OutputFormat::Vhd {
        let footer = vhd_footer(data_size, vhd_timestamp(), *uuid::Uuid::new_v4().as_bytes());
        writer.write_all(&footer).map_err(write_err)?;
    }
    writer.flush().map_err(write_err)?;
    Ok(data_size)
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

fn write_zeros(writer: &mut impl Write, mut count: u64) -> std::io::Result<()> {
    let zeros = [0u8; 4096];
    while count > 0 {
        let n = count.min(zeros.len() as u64) as usize;
        writer.write_all(&zeros[..n])?;
        count -= n as u64;
    }
    Ok(())
}

fn vhd_timestamp() -> u32 {
    (chrono::Utc::now().timestamp() - VHD_EPOCH_OFFSET).clamp(0, u32::MAX as i64) as u32
}

// ============================================
// VHD FOOTER
// ============================================

/// CHS geometry for a disk of `size` bytes, per the VHD format's algorithm
pub fn chs_geometry(size: u64) -> (u16, u8, u8) {
    let mut total_sectors = size / SECTOR;
    if total_sectors > 65535 * 16 * 255 {
        total_sectors = 65535 * 16 * 255;
    }

    let (sectors_per_track, heads, cyl_times_heads) = if total_sectors >= 65535 * 16 * 63 {
        (255u64, 16u64, total_sectors / 255)
    } else {
        let mut spt = 17u64;
        let mut cth = total_sectors / spt;
        let mut heads = ((cth + 1023) / 1024).max(4);
        if cth >= heads * 1024 || heads > 16 {
            spt = 31;
            heads = 16;
            cth = total_sectors / spt;
        }
        if cth >= heads * 1024 {
            spt = 63;
            heads = 16;
            cth = total_sectors / spt;
        }
        (spt, heads, cth)
    };

    let cylinders = (cyl_times_heads / heads).min(u16::MAX as u64);
    (cylinders as u16, heads as u8, sectors_per_track as u8)
}

/// Build the 512-byte footer of a fixed VHD holding `size` bytes of data
pub fn vhd_footer(size: u64, timestamp: u32, unique_id: [u8; 16]) -> [u8; 512] {
    let mut footer = [0u8; 512];
    let (cylinders, heads, sectors) = chs_geometry(size);

    footer[0..8].copy_from_slice(b"conectix");
    footer[8..12].copy_from_slice(&2u32.to_be_bytes());             // features: reserved bit
    footer[12..16].copy_from_slice(&0x0001_0000u32.to_be_bytes());  // format version
    footer[16..24].copy_from_slice(&u64::MAX.to_be_bytes());        // data offset (fixed disk)
    footer[24..28].copy_from_slice(&timestamp.to_be_bytes());
    footer[28..32].copy_from_slice(b"rtab");                        // creator application
    footer[32..36].copy_from_slice(&0x0001_0000u32.to_be_bytes());  // creator version
    footer[36..40].copy_from_slice(b"Wi2k");                        // creator host OS
    footer[40..48].copy_from_slice(&size.to_be_bytes());            // original size
    footer[48..56].copy_from_slice(&size.to_be_bytes());            // current size
    footer[56..58].copy_from_slice(&cylinders.to_be_bytes());
    footer[58] = heads;
    footer[59] = sectors;
    footer[60..64].copy_from_slice(&2u32.to_be_bytes());            // disk type: fixed
    footer[68..84].copy_from_slice(&unique_id);

    let checksum = footer_checksum(&footer);
    footer[64..68].copy_from_slice(&checksum.to_be_bytes());
    footer
}

/// One's complement of the byte sum, with the checksum field counted as zero
pub fn footer_checksum(footer: &[u8; 512]) -> u32 {
    let sum = footer
        .iter()
        .enumerate()
        .filter(|(i, _)| !(64..68).contains(i))
        .fold(0u32, |acc, (_, b)| acc.wrapping_add(*b as u32));
    !sum
}
