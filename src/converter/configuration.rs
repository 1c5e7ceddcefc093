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

//! Module responsible for reading and querying the configuration.
//!
//! The configuration uses [YAML](https://en.wikipedia.org/wiki/YAML)
//! and is kept as a tree of `serde_yaml` values, as the set of keys depends
//! on the fields and catalogues requested by user. Values are typed
//! on access with `serde`, so that wrong types still give meaningful error messages.
//!
//! Keys are addressed with dots (`catalogue_flags.era5.realm`). A key segment
//! can itself contain dots (catalogue names often do), the longest matching
//! segment is always preferred.
//!
//! A configuration file can pull other files in with a top-level `include` list.
//! Included files are read first and overlaid by the including file. Values missing
//! from the configuration are looked up in the optional `defaults` mapping.

use crate::constants::DEFAULT_DOMAIN_BUFFER;
use crate::errors::ConfigError;
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use log::debug;
use serde::{de::DeserializeOwned, Deserialize};
use serde_yaml::{Mapping, Value};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Formats accepted for timestamps in configuration.
const TIMESTAMP_FORMATS: [&str; 7] = [
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d_%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y%m%d%H%M",
    "%Y%m%dT%H%M",
];

/// Formats accepted for dates (midnight is assumed) in configuration.
const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%Y%m%d"];

/// _(Optional)_ Fields with information about
/// resources available for the converter.
///
/// When absent, the worker pool is sized from the execution environment.
#[derive(Clone, PartialEq, PartialOrd, Debug, Deserialize)]
pub struct Resources {
    /// _(Optional)_ Thread count used by the converter.
    /// The thread pool will use up to this number of workers.
    ///
    /// Cannot be less than `1`. Defaults to `1`.
    #[serde(default = "Resources::default_threads")]
    pub threads: u16,

    /// _(Optional)_ Heap memory limit for the converter in MB.
    /// Useful for enabling meaningful Out-of-memory error messages.
    ///
    /// Cannot be less than `128`. Defaults to whole addressable-space
    /// (`2^32` or `2^64` bytes).
    ///
    /// By default, Rust memory allocator doesn't know about memory available
    /// in your system, so when converting large domains the system will slow down
    /// and eventually kill the process without any additional information.
    /// With a capped limit the process is aborted with an OOM error message instead.
    #[serde(default = "Resources::default_memory")]
    pub memory: usize,
}

impl Resources {
    fn default_threads() -> u16 {
        1
    }

    fn default_memory() -> usize {
        usize::MAX / (1024 * 1024)
    }

    /// Checks if thread count and memory limit are
    /// above limits.
    pub fn check_bounds(&self) -> Result<(), ConfigError> {
        if self.threads < 1 {
            return Err(ConfigError::OutOfBounds(
                "Available threads cannot be less than 1",
            ));
        }

        if self.memory < 128 {
            return Err(ConfigError::OutOfBounds(
                "Available memory cannot be less than 128 MB",
            ));
        }

        Ok(())
    }
}

/// Hierarchical key-value configuration store.
#[derive(Clone, Debug)]
pub struct ConfigStore {
    root: Value,
}

impl ConfigStore {
    /// Reads configuration file together with all files it includes.
    pub fn new_from_file(file_path: &Path) -> Result<ConfigStore, ConfigError> {
        let root = read_with_includes(file_path)?;
        let config = ConfigStore::from_value(root)?;

        if let Some(resources) = config.resources()? {
            resources.check_bounds()?;
        }

        if config.domain_buffer()? < 0.0 {
            return Err(ConfigError::OutOfBounds(
                "Domain buffer cannot be negative",
            ));
        }

        Ok(config)
    }

    /// Builds the store from already parsed YAML.
    /// The top level of configuration must be a mapping.
    pub fn from_value(root: Value) -> Result<ConfigStore, ConfigError> {
        match root {
            Value::Mapping(_) => Ok(ConfigStore { root }),
            Value::Null => Ok(ConfigStore {
                root: Value::Mapping(Mapping::new()),
            }),
            _ => Err(ConfigError::OutOfBounds(
                "Top level of configuration must be a mapping",
            )),
        }
    }

    /// Returns the raw value under the key, looking into `defaults`
    /// when the key is absent. `null` values are treated as absent.
    fn lookup(&self, key: &str) -> Option<&Value> {
        let segments: Vec<&str> = key.split('.').collect();

        if let Some(value) = lookup_in(&self.root, &segments) {
            return Some(value);
        }

        let defaults = self.root.get("defaults")?;
        lookup_in(defaults, &segments)
    }

    /// Checks if the key is set (to something else than `null`).
    pub fn contains(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    /// Returns the value under the key deserialized to requested type
    /// or `None` if the key is not set.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.lookup(key) {
            Some(value) => serde_yaml::from_value(value.clone())
                .map(Some)
                .map_err(|err| ConfigError::WrongType(key.to_string(), err)),
            None => Ok(None),
        }
    }

    /// Returns the value under the key or provided default if the key is not set.
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// Returns the value under the key, missing key is an error.
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError> {
        self.get(key)?
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
    }

    /// Sets the value under dotted key, creating intermediate mappings
    /// (and replacing non-mapping values on the way).
    pub fn set<V: Into<Value>>(&mut self, key: &str, value: V) {
        let segments: Vec<&str> = key.split('.').collect();
        let mut node = &mut self.root;

        for segment in segments {
            if !node.is_mapping() {
                *node = Value::Mapping(Mapping::new());
            }
            node = &mut node[segment];
        }

        *node = value.into();
    }

    /// Returns the list of strings under the key or empty list if the key is not set.
    pub fn get_list(&self, key: &str) -> Result<Vec<String>, ConfigError> {
        self.get_or(key, vec![])
    }

    /// Returns the timestamp under the key. Timestamps written without
    /// separators (`202001010000`) are read by YAML as numbers, so those are accepted too.
    pub fn get_timestamp(&self, key: &str) -> Result<Option<NaiveDateTime>, ConfigError> {
        match self.lookup(key) {
            Some(Value::String(text)) => parse_timestamp(text).map(Some),
            Some(Value::Number(number)) => parse_timestamp(&number.to_string()).map(Some),
            Some(other) => Err(ConfigError::InvalidTimestamp(format!("{}: {:?}", key, other))),
            None => Ok(None),
        }
    }

    /// First timestamp of the converted period.
    pub fn start(&self) -> Result<NaiveDateTime, ConfigError> {
        if let Some(start) = self.get_timestamp("start")? {
            return Ok(start);
        }

        self.get_timestamp("time")?
            .ok_or_else(|| ConfigError::MissingKey("start".to_string()))
    }

    /// Last timestamp of the converted period.
    pub fn end(&self) -> Result<NaiveDateTime, ConfigError> {
        match self.get_timestamp("end")? {
            Some(end) => Ok(end),
            None => self.start(),
        }
    }

    /// Returns all timestamps of the converted period (inclusive on both ends)
    /// spaced by `time_step_hours`.
    pub fn get_time_range(&self) -> Result<Vec<NaiveDateTime>, ConfigError> {
        let start = self.start()?;
        let end = self.end()?;
        let step: i64 = self.get_or("time_step_hours", 1)?;

        if step < 1 {
            return Err(ConfigError::OutOfBounds(
                "Time step cannot be shorter than 1 hour",
            ));
        }

        if end < start {
            return Err(ConfigError::OutOfBounds(
                "End of converted period cannot precede its start",
            ));
        }

        let mut range = vec![];
        let mut current = start;

        while current <= end {
            range.push(current);
            current += Duration::hours(step);
        }

        Ok(range)
    }

    /// Returns first-of-month timestamps of every month touched by converted period.
    pub fn get_month_range(&self) -> Result<Vec<NaiveDateTime>, ConfigError> {
        let start = self.start()?;
        let end = self.end()?;

        let mut range = vec![];
        let (mut year, mut month) = (start.year(), start.month());

        while (year, month) <= (end.year(), end.month()) {
            let first = NaiveDate::from_ymd_opt(year, month, 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .ok_or_else(|| ConfigError::InvalidTimestamp(format!("{}-{}", year, month)))?;
            range.push(first);

            if month == 12 {
                year += 1;
                month = 1;
            } else {
                month += 1;
            }
        }

        debug!("Months to process: {:?}", range);

        Ok(range)
    }

    /// Optional override of worker pool resources.
    pub fn resources(&self) -> Result<Option<Resources>, ConfigError> {
        self.get("resources")
    }

    /// Width of interpolation margin around the output domain in degrees.
    pub fn domain_buffer(&self) -> Result<f64, ConfigError> {
        self.get_or("domain_buffer", DEFAULT_DOMAIN_BUFFER)
    }

    /// Output format name, GRIB by default.
    pub fn format(&self) -> Result<String, ConfigError> {
        self.get_or("format", "grib".to_string())
    }

    /// Output file path.
    pub fn output(&self) -> Result<PathBuf, ConfigError> {
        self.require("output")
    }

    /// Whether precomputed weight file regridding has been requested.
    pub fn weight_file_mode(&self) -> Result<bool, ConfigError> {
        Ok(self.get::<String>("regrid_options")?.as_deref() == Some("weight_file"))
    }
}

/// Descends into mappings following the key segments.
/// Longest segment joined with dots that exists in the mapping wins.
fn lookup_in<'a>(node: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    if segments.is_empty() {
        return match node {
            Value::Null => None,
            _ => Some(node),
        };
    }

    let mapping = node.as_mapping()?;

    for split in (1..=segments.len()).rev() {
        let key = Value::String(segments[..split].join("."));

        if let Some(child) = mapping.get(&key) {
            if let Some(found) = lookup_in(child, &segments[split..]) {
                return Some(found);
            }
        }
    }

    None
}

/// Reads YAML file and overlays it onto files listed in its `include` key.
fn read_with_includes(file_path: &Path) -> Result<Value, ConfigError> {
    debug!("Reading configuration from {}", file_path.display());

    let data = fs::read(file_path)?;
    let mut value: Value = serde_yaml::from_slice(data.as_slice())?;

    let includes: Vec<PathBuf> = match value.get("include") {
        Some(list) => serde_yaml::from_value(list.clone())
            .map_err(|err| ConfigError::WrongType("include".to_string(), err))?,
        None => vec![],
    };

    if includes.is_empty() {
        return Ok(value);
    }

    if let Value::Mapping(mapping) = &mut value {
        mapping.remove(&Value::String("include".to_string()));
    }

    let base_dir = file_path.parent().unwrap_or_else(|| Path::new("."));
    let mut merged = Value::Mapping(Mapping::new());

    for include in includes {
        let include_path = if include.is_absolute() {
            include
        } else {
            base_dir.join(include)
        };

        let included = read_with_includes(&include_path)?;
        overlay(&mut merged, included, "")?;
    }

    overlay(&mut merged, value, "")?;

    Ok(merged)
}

/// Deep-merges `upper` onto `lower`. Mappings are merged key by key,
/// any other value replaces the lower one.
fn overlay(lower: &mut Value, upper: Value, path: &str) -> Result<(), ConfigError> {
    match (lower, upper) {
        (Value::Mapping(lower_map), Value::Mapping(upper_map)) => {
            for (key, upper_value) in upper_map {
                let key_name = match &key {
                    Value::String(s) => s.clone(),
                    other => format!("{:?}", other),
                };
                let child_path = if path.is_empty() {
                    key_name
                } else {
                    format!("{}.{}", path, key_name)
                };

                match lower_map.get_mut(&key) {
                    Some(lower_value) => overlay(lower_value, upper_value, &child_path)?,
                    None => {
                        lower_map.insert(key, upper_value);
                    }
                }
            }
            Ok(())
        }
        (lower, upper) => {
            if lower.is_mapping() != upper.is_mapping() && !lower.is_null() && !upper.is_null() {
                return Err(ConfigError::ConflictingTypes(path.to_string()));
            }
            *lower = upper;
            Ok(())
        }
    }
}

/// Parses timestamp given in one of accepted formats.
pub fn parse_timestamp(input: &str) -> Result<NaiveDateTime, ConfigError> {
    let trimmed = input.trim();

    for format in TIMESTAMP_FORMATS {
        if let Ok(timestamp) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(timestamp);
        }
    }

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            if let Some(timestamp) = date.and_hms_opt(0, 0, 0) {
                return Ok(timestamp);
            }
        }
    }

    Err(ConfigError::InvalidTimestamp(input.to_string()))
}
