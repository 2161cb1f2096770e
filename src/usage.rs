//! Filesystem capacity and the usage watermark.

use std::path::{Path, PathBuf};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub block_size: u64,
    pub blocks: u64,
    /// Blocks available to unprivileged users.
    pub bfree: u64,
}

/// `statvfs(2)` of the filesystem holding `path`.
pub fn statfs(path: &Path) -> Result<FsStats> {
    let st = rustix::fs::statvfs(path).map_err(std::io::Error::from)?;
    let block_size = if st.f_frsize > 0 { st.f_frsize } else { st.f_bsize };
    Ok(FsStats {
        block_size,
        blocks: st.f_blocks,
        bfree: st.f_bavail,
    })
}

/// Round `n` up to a multiple of `block_size`.
pub fn align_up(n: u64, block_size: u64) -> u64 {
    if block_size == 0 {
        return n;
    }
    n + ((block_size - n % block_size) % block_size)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub free: u64,
    /// Space kept free by the watermark.
    pub reserved: u64,
    pub available: u64,
    pub required: u64,
    pub watermark: u8,
}

impl UsageInfo {
    pub fn from_stats(path: &Path, stats: FsStats, required: u64, watermark: u8) -> Result<Self> {
        if !(20..=95).contains(&watermark) {
            return Err(Error::InvalidInput(format!(
                "usage watermark {watermark} is outside [20, 95]"
            )));
        }
        let size_bytes = stats.blocks.saturating_mul(stats.block_size);
        let free = stats.bfree.saturating_mul(stats.block_size);
        let reserved = (u128::from(size_bytes) * u128::from(100 - watermark) / 100) as u64;
        Ok(Self {
            path: path.to_path_buf(),
            size_bytes,
            free,
            reserved,
            available: free.saturating_sub(reserved),
            required,
            watermark,
        })
    }

    fn percent(&self, n: u64) -> f64 {
        if self.size_bytes == 0 {
            return 0.0;
        }
        n as f64 * 100.0 / self.size_bytes as f64
    }

    pub fn free_percent(&self) -> f64 {
        self.percent(self.free)
    }

    pub fn available_percent(&self) -> f64 {
        self.percent(self.available)
    }

    pub fn required_percent(&self) -> f64 {
        self.percent(self.required)
    }

    pub fn is_sufficient(&self) -> bool {
        self.required <= self.available
    }

    /// Fail with `ResourceExhausted` when `required > available`.
    pub fn check(&self) -> Result<()> {
        if self.is_sufficient() {
            return Ok(());
        }
        Err(Error::ResourceExhausted(format!(
            "{} bytes required under {} but only {} available ({:.1}% free, {}% watermark)",
            self.required,
            self.path.display(),
            self.available,
            self.free_percent(),
            self.watermark
        )))
    }
}

/// Usage of the filesystem holding `path` for a prospective `required`
/// bytes.
pub fn usage_info(path: &Path, required: u64, watermark: u8) -> Result<UsageInfo> {
    UsageInfo::from_stats(path, statfs(path)?, required, watermark)
}
