/*
Copyright 2021 Jakub Lewandowski

This file is part of ERA5 GRIB Converter (era5grib).

ERA5 GRIB Converter (era5grib) is a free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation; either version 3 of the License, or
(at your option) any later version.

ERA5 GRIB Converter (era5grib) is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with ERA5 GRIB Converter (era5grib). If not, see https://www.gnu.org/licenses/.
*/

//! Worker pool evaluating deferred array computations.
//!
//! Pool size and memory cap follow the execution environment: inside a
//! batch job the CPUs of the job cpuset and a fraction of the RSS limit are
//! used, interactively a small fixed pool is built. The `resources` key
//! of the configuration overrides both.

use crate::constants::{
    BATCH_MEMORY_FRACTION, INTERACTIVE_MEMORY, INTERACTIVE_WORKERS, LOGIN_NODE_PREFIX,
};
use crate::errors::{ConfigError, ConvertError};
use crate::ALLOCATOR;

use super::configuration::ConfigStore;
use log::{debug, info};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::{env, fs, thread};

#[derive(Debug)]
pub struct WorkerPool {
    pool: ThreadPool,
    pub workers: usize,
    pub memory: usize,
}

impl WorkerPool {
    /// Builds the thread pool without touching the allocator limit.
    pub fn new(workers: usize, memory: usize) -> Result<Self, ConvertError> {
        debug!("Setting up ThreadPool");
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .stack_size(2 * 1024 * 1024)
            .build()?;

        Ok(WorkerPool {
            pool,
            workers: workers.max(1),
            memory,
        })
    }

    /// Sizes the pool for the current environment and caps
    /// the process memory accordingly.
    pub fn acquire(config: &ConfigStore) -> Result<Self, ConvertError> {
        let (workers, memory) = detect_resources(config)?;

        info!(
            "Starting worker pool with {} workers and {} MB of memory",
            workers,
            memory / (1024 * 1024)
        );

        debug!("Setting memory limit");
        ALLOCATOR
            .set_limit(memory)
            .map_err(|_| ConvertError::MemoryLimit(memory))?;

        WorkerPool::new(workers, memory)
    }

    /// Runs the operation inside the pool, so that `par_iter`
    /// calls made by it use pool threads.
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }
}

fn detect_resources(config: &ConfigStore) -> Result<(usize, usize), ConfigError> {
    if let Some(resources) = config.resources()? {
        resources.check_bounds()?;
        debug!("Using resources from configuration");
        return Ok((
            resources.threads as usize,
            resources.memory.saturating_mul(1024 * 1024),
        ));
    }

    if !in_batch_job() {
        return Ok((INTERACTIVE_WORKERS, INTERACTIVE_MEMORY));
    }

    let workers = cpus_from_cpuset().unwrap_or_else(available_parallelism);
    let memory = match rss_limit() {
        Some(limit) => (limit as f64 * BATCH_MEMORY_FRACTION) as usize,
        None => usize::MAX,
    };

    Ok((workers, memory))
}

fn in_batch_job() -> bool {
    env::var_os("PBS_ENVIRONMENT").is_some() && !hostname().starts_with(LOGIN_NODE_PREFIX)
}

fn hostname() -> String {
    env::var("HOSTNAME")
        .ok()
        .or_else(|| fs::read_to_string("/proc/sys/kernel/hostname").ok())
        .map(|h| h.trim().to_string())
        .unwrap_or_default()
}

fn available_parallelism() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}

fn cpus_from_cpuset() -> Option<usize> {
    let cpuset = fs::read_to_string("/proc/self/cpuset").ok()?;
    let cpus_path = format!("/sys/fs/cgroup/cpuset{}/cpuset.cpus", cpuset.trim());
    let cpus = fs::read_to_string(cpus_path).ok()?;

    debug!("Job cpuset: {}", cpus.trim());
    parse_cpu_list(&cpus)
}

/// Counts CPUs in a kernel cpu list such as `0-3,8`.
pub fn parse_cpu_list(list: &str) -> Option<usize> {
    let mut count = 0;

    for part in list.trim().split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((first, last)) => {
                let first: usize = first.trim().parse().ok()?;
                let last: usize = last.trim().parse().ok()?;

                if last < first {
                    return None;
                }
                count += last - first + 1;
            }
            None => {
                part.trim().parse::<usize>().ok()?;
                count += 1;
            }
        }
    }

    if count == 0 {
        None
    } else {
        Some(count)
    }
}

fn rss_limit() -> Option<usize> {
    parse_rss_limit(&fs::read_to_string("/proc/self/limits").ok()?)
}

/// Soft RSS limit in bytes from the contents of `/proc/<pid>/limits`.
pub fn parse_rss_limit(limits: &str) -> Option<usize> {
    let line = limits
        .lines()
        .find(|l| l.starts_with("Max resident set"))?;

    line.trim_start_matches("Max resident set")
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::{parse_cpu_list, parse_rss_limit, WorkerPool};
    use rayon::prelude::*;

    #[test]
    fn cpu_lists() {
        assert_eq!(parse_cpu_list("0-3,8\n"), Some(5));
        assert_eq!(parse_cpu_list("7"), Some(1));
        assert_eq!(parse_cpu_list("0-1,4-5,10"), Some(5));
        assert_eq!(parse_cpu_list(""), None);
        assert_eq!(parse_cpu_list("3-1"), None);
        assert_eq!(parse_cpu_list("a-b"), None);
    }

    #[test]
    fn rss_limits() {
        let limited = "Limit                     Soft Limit           Hard Limit           Units     \n\
                       Max cpu time              unlimited            unlimited            seconds   \n\
                       Max resident set          4294967296           4294967296           bytes     \n";
        assert_eq!(parse_rss_limit(limited), Some(4294967296));

        let unlimited = "Max resident set          unlimited            unlimited            bytes     \n";
        assert_eq!(parse_rss_limit(unlimited), None);
        assert_eq!(parse_rss_limit("Max processes 10 10 processes"), None);
    }

    #[test]
    fn install_uses_pool() {
        let pool = WorkerPool::new(2, usize::MAX).unwrap();
        let sum: u32 = pool.install(|| (1..=4u32).into_par_iter().sum());

        assert_eq!(pool.workers, 2);
        assert_eq!(sum, 10);
    }
}
