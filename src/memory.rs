//! Memory size parsing, formatting and host memory checks.
//!
//! Provides human-readable memory size parsing (e.g., "32G", "1024M"),
//! byte-count formatting for telemetry logs, and the soft/hard usage checks
//! run by the submitter while results stream back.

use crate::error::{FarmError, Result};
use std::fmt;
use std::fs;
use std::str::FromStr;
use thiserror::Error;

/// Memory size in bytes with parsing and formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemorySize(u64);

impl MemorySize {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from mebibytes (MiB).
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    /// Create from gibibytes (GiB).
    pub const fn from_gib(gib: u64) -> Self {
        Self(gib * 1024 * 1024 * 1024)
    }

    /// Get the raw byte count.
    pub const fn as_bytes(&self) -> u64 {
        self.0
    }

    /// Get the size in mebibytes (MiB).
    pub const fn as_mib(&self) -> u64 {
        self.0 / (1024 * 1024)
    }

    /// Get the size in gibibytes (GiB), truncated.
    pub const fn as_gib(&self) -> u64 {
        self.0 / (1024 * 1024 * 1024)
    }
}

/// Errors that can occur when parsing a memory size.
#[derive(Debug, Clone, Error)]
pub enum MemoryError {
    #[error("invalid memory size: {0}")]
    InvalidFormat(String),
}

impl FromStr for MemorySize {
    type Err = MemoryError;

    /// Parse a human-readable memory size string.
    ///
    /// Supported formats:
    /// - Plain number: treated as MiB (e.g., "6144" = 6 GiB)
    /// - With suffix: "32G", "32GB", "32GiB", "1024M", "1024MB", "1024MiB"
    /// - Case insensitive
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(MemoryError::InvalidFormat("empty string".into()));
        }

        let num_end = s
            .chars()
            .position(|c| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());

        if num_end == 0 {
            return Err(MemoryError::InvalidFormat(format!(
                "no numeric value in '{}'",
                s
            )));
        }

        let num_str = &s[..num_end];
        let suffix = s[num_end..].trim().to_lowercase();

        let value: f64 = num_str
            .parse()
            .map_err(|_| MemoryError::InvalidFormat(format!("invalid number: '{}'", num_str)))?;

        let multiplier: u64 = match suffix.as_str() {
            "" => 1024 * 1024,
            "b" => 1,
            "k" | "kb" | "kib" => 1024,
            "m" | "mb" | "mib" => 1024 * 1024,
            "g" | "gb" | "gib" => 1024 * 1024 * 1024,
            "t" | "tb" | "tib" => 1024_u64 * 1024 * 1024 * 1024,
            _ => {
                return Err(MemoryError::InvalidFormat(format!(
                    "unknown suffix: '{}'",
                    suffix
                )));
            }
        };

        Ok(MemorySize((value * multiplier as f64) as u64))
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const GIB: u64 = 1024 * 1024 * 1024;

        if self.0 >= GIB {
            let gib = self.0 as f64 / GIB as f64;
            if gib.fract() < 0.01 {
                write!(f, "{} GiB", self.as_gib())
            } else {
                write!(f, "{:.1} GiB", gib)
            }
        } else if self.as_mib() > 0 {
            write!(f, "{} MiB", self.as_mib())
        } else {
            write!(f, "{} bytes", self.0)
        }
    }
}

/// Format a byte count for logs: "0 B", "1.5 KB", "3.02 MB".
pub fn humansize(nbytes: u64) -> String {
    const SUFFIXES: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    if nbytes == 0 {
        return "0 B".to_string();
    }
    let mut value = nbytes as f64;
    let mut i = 0;
    while value >= 1024.0 && i < SUFFIXES.len() - 1 {
        value /= 1024.0;
        i += 1;
    }
    let formatted = format!("{:.2}", value);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", trimmed, SUFFIXES[i])
}

/// Raised by a task that cannot continue for lack of memory.
///
/// The safely-call boundary turns it into the nil sentinel.
#[derive(Debug, Clone, Error)]
#[error("memory exhausted: {0}")]
pub struct MemoryExhausted(pub String);

/// Memory thresholds applied by the submitter.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryLimits {
    /// Above this percentage of used system memory a warning is logged.
    pub soft_percent: f64,
    /// Above this percentage the computation is aborted.
    pub hard_percent: f64,
    /// Largest single allocation estimate accepted by `preflight`.
    pub ceiling: Option<MemorySize>,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            soft_percent: DEFAULT_SOFT_PERCENT,
            hard_percent: DEFAULT_HARD_PERCENT,
            ceiling: None,
        }
    }
}

pub const DEFAULT_SOFT_PERCENT: f64 = 80.0;
pub const DEFAULT_HARD_PERCENT: f64 = 99.0;

/// Snapshot of host memory from /proc/meminfo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemMemory {
    pub total: MemorySize,
    pub available: MemorySize,
}

impl SystemMemory {
    /// Percentage of memory in use.
    pub fn used_percent(&self) -> f64 {
        let total = self.total.as_bytes();
        if total == 0 {
            return 0.0;
        }
        let used = total.saturating_sub(self.available.as_bytes());
        used as f64 * 100.0 / total as f64
    }
}

/// Read total and available memory of the host.
#[cfg(target_os = "linux")]
pub fn system_memory() -> Option<SystemMemory> {
    let contents = fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&contents)
}

#[cfg(not(target_os = "linux"))]
pub fn system_memory() -> Option<SystemMemory> {
    None
}

fn parse_meminfo(contents: &str) -> Option<SystemMemory> {
    let mut total = None;
    let mut available = None;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = parse_kb(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = parse_kb(rest);
        }
    }
    Some(SystemMemory {
        total: MemorySize::from_bytes(total?),
        available: MemorySize::from_bytes(available?),
    })
}

fn parse_kb(field: &str) -> Option<u64> {
    let kb: u64 = field.split_whitespace().next()?.parse().ok()?;
    Some(kb * 1024)
}

/// Resident set size of a process, from /proc/<pid>/status.
#[cfg(target_os = "linux")]
pub fn current_rss_bytes(pid: u32) -> Option<u64> {
    let contents = fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    contents
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(parse_kb)
}

#[cfg(not(target_os = "linux"))]
pub fn current_rss_bytes(_pid: u32) -> Option<u64> {
    None
}

/// Resident set size of the calling process.
pub fn own_rss_bytes() -> Option<u64> {
    current_rss_bytes(std::process::id())
}

/// Warn above the soft limit, fail above the hard limit.
///
/// Returns the observed usage percentage, or 0 where host memory cannot be
/// read.
pub fn check_mem_usage(limits: &MemoryLimits) -> Result<f64> {
    let Some(mem) = system_memory() else {
        return Ok(0.0);
    };
    check_against(mem.used_percent(), limits)
}

fn check_against(used: f64, limits: &MemoryLimits) -> Result<f64> {
    if used > limits.hard_percent {
        return Err(FarmError::MemoryLimit(format!(
            "Using more memory than allowed by configuration (Used: {:.0}% / Allowed: {:.0}%)! Shutting down.",
            used, limits.hard_percent
        )));
    }
    if used > limits.soft_percent {
        tracing::warn!(
            used_percent = used,
            host = %crate::paths::hostname(),
            "Using over {:.0}% of the memory",
            used
        );
    }
    Ok(used)
}

/// Reject an allocation estimate before any work is scheduled.
pub fn preflight(bytes: u64, limits: &MemoryLimits) -> Result<()> {
    if let Some(ceiling) = limits.ceiling
        && bytes > ceiling.as_bytes()
    {
        return Err(FarmError::MemoryLimit(format!(
            "estimated {} exceeds the configured ceiling of {}",
            humansize(bytes),
            ceiling
        )));
    }
    if let Some(mem) = system_memory()
        && bytes > mem.available.as_bytes()
    {
        return Err(FarmError::MemoryLimit(format!(
            "estimated {} exceeds the {} currently available",
            humansize(bytes),
            mem.available
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_number_as_mib() {
        assert_eq!(MemorySize::from_str("6144").unwrap().as_mib(), 6144);
        assert_eq!(MemorySize::from_str("1024").unwrap().as_gib(), 1);
    }

    #[test]
    fn test_parse_with_suffix() {
        assert_eq!(MemorySize::from_str("32G").unwrap().as_gib(), 32);
        assert_eq!(MemorySize::from_str("32GB").unwrap().as_gib(), 32);
        assert_eq!(MemorySize::from_str("32gib").unwrap().as_gib(), 32);
        assert_eq!(MemorySize::from_str("1024M").unwrap().as_mib(), 1024);
        assert_eq!(MemorySize::from_str("1T").unwrap().as_gib(), 1024);
        assert_eq!(MemorySize::from_str("1.5G").unwrap().as_mib(), 1536);
    }

    #[test]
    fn test_parse_errors() {
        assert!(MemorySize::from_str("").is_err());
        assert!(MemorySize::from_str("abc").is_err());
        assert!(MemorySize::from_str("32X").is_err());
        assert!(MemorySize::from_str("-5G").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", MemorySize::from_gib(8)), "8 GiB");
        assert_eq!(format!("{}", MemorySize::from_mib(512)), "512 MiB");
        assert_eq!(format!("{}", MemorySize::from_mib(1536)), "1.5 GiB");
    }

    #[test]
    fn test_humansize() {
        assert_eq!(humansize(0), "0 B");
        assert_eq!(humansize(1000), "1000 B");
        assert_eq!(humansize(1024), "1 KB");
        assert_eq!(humansize(1536), "1.5 KB");
        assert_eq!(humansize(3 * 1024 * 1024), "3 MB");
    }

    #[test]
    fn test_parse_meminfo() {
        let text = "MemTotal:       16000000 kB\nMemFree:  100 kB\nMemAvailable:    4000000 kB\n";
        let mem = parse_meminfo(text).unwrap();
        assert_eq!(mem.total.as_bytes(), 16_000_000 * 1024);
        assert!((mem.used_percent() - 75.0).abs() < 1e-9);
        assert!(parse_meminfo("MemTotal: 10 kB\n").is_none());
    }

    #[test]
    fn test_check_against_limits() {
        let limits = MemoryLimits::default();
        assert_eq!(check_against(50.0, &limits).unwrap(), 50.0);
        // soft limit only warns
        assert!(check_against(85.0, &limits).is_ok());
        let err = check_against(99.5, &limits).unwrap_err();
        assert!(matches!(err, FarmError::MemoryLimit(_)));
        assert!(err.to_string().contains("Allowed: 99%"));
    }

    #[test]
    fn test_preflight_ceiling() {
        let limits = MemoryLimits {
            ceiling: Some(MemorySize::from_mib(1)),
            ..MemoryLimits::default()
        };
        assert!(preflight(1024, &limits).is_ok());
        let err = preflight(2 * 1024 * 1024, &limits).unwrap_err();
        assert!(err.to_string().contains("ceiling"));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_read_own_rss() {
        let rss = own_rss_bytes().unwrap();
        assert!(rss >= 1024 * 1024, "RSS too low: {} bytes", rss);
    }
}
