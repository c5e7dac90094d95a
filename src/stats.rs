// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Processing statistics attached to worker log lines.

use std::{
    fmt,
    time::{Duration, Instant},
};

/// Elapsed time since a start instant plus the process resident memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeStatistics {
    pub elapsed: Duration,
    pub rss_kb: Option<u64>,
}

impl RuntimeStatistics {
    pub fn since(started: Instant) -> Self {
        RuntimeStatistics {
            elapsed: started.elapsed(),
            rss_kb: resident_memory_kb(),
        }
    }
}

impl fmt::Display for RuntimeStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "elapsed: {:?}", self.elapsed)?;
        match self.rss_kb {
            Some(kb) => write!(f, ", rss: {} kB", kb),
            None => write!(f, ", rss: n/a"),
        }
    }
}

#[cfg(target_os = "linux")]
fn resident_memory_kb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_kb() -> Option<u64> {
    None
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_vm_rss(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}
