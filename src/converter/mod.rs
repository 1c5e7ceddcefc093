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

//! Module containing the conversion pipeline.
//!
//! The converter runs in four stages:
//!
//! 1. Catalogues listed in configuration are resolved into an ordered
//!    list of search targets, with the custom-fields placeholder among them.
//! 2. For every month touched by the requested time range the catalogues
//!    are searched for remaining fields and the found variables are opened
//!    as lazy arrays, one per field and realm.
//! 3. Months are concatenated in time, all arrays are regridded onto one
//!    target grid and realms of each field are merged using a land-sea mask.
//! 4. The finished dataset is evaluated on the worker pool and written
//!    by the driver selected with the `format` key.
//!
//! No array values are computed before the last stage.

mod array;
mod catalogue;
mod combine;
mod configuration;
mod context;
mod dataset;
mod domain;
mod field;
mod loader;
mod metadata;
mod output;
mod parallel;
mod regrid;
mod source;

#[cfg(test)]
mod super_tests;

use crate::constants::DEFAULT_CONFIG_FILE;
use crate::errors::ConvertError;

use catalogue::{resolve_catalogues, CatalogueHandle};
use chrono::NaiveDateTime;
use configuration::ConfigStore;
use context::Context;
use field::FieldSet;
use indexmap::IndexMap;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn, LevelFilter};
use parallel::WorkerPool;
use std::{env, path::PathBuf, str::FromStr};

/// Main converter function, responsible for all conversion steps.
pub fn main() -> Result<(), ConvertError> {
    info!("Preparing the converter core");

    let core = Core::new()?;

    let catalogues = resolve_catalogues(&core.context)?;
    debug!(
        "Catalogues in search order: {:?}",
        catalogues.iter().map(|c| c.name()).collect::<Vec<_>>()
    );

    let months = load_months(&core.context, &catalogues)?;

    info!("Combining fields");
    let dataset = combine::combine(&core.context, &catalogues, months)?;

    output::write(&dataset, &core.context.config, &core.pool)?;

    Ok(())
}

/// Structure holding everything the pipeline needs for a run.
///
/// The worker pool is owned here so it lives exactly as long
/// as the run and is released on every exit path.
#[derive(Debug)]
pub struct Core {
    pub context: Context,
    pub pool: WorkerPool,
}

impl Core {
    /// Converter [`Core`] constructor.
    ///
    /// Configuration path is taken from `ERA5GRIB_CONFIG`,
    /// `config.yaml` in the working directory is read otherwise.
    pub fn new() -> Result<Self, ConvertError> {
        let config_path = config_path();

        debug!("Reading configuration from {}", config_path.display());
        let config = ConfigStore::new_from_file(&config_path)?;

        // unknown level names are reported here, after the logger is up
        log_level(&config)?;

        let context = Context::new(config)?;
        let pool = WorkerPool::acquire(&context.config)?;

        Ok(Core { context, pool })
    }
}

fn config_path() -> PathBuf {
    env::var_os("ERA5GRIB_CONFIG").map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from)
}

/// Log level set with `log_level` in the configuration file.
///
/// Called before the logger is built, so any problem with the file
/// is ignored here and reported by [`Core::new`].
pub fn configured_log_level() -> Option<LevelFilter> {
    let config = ConfigStore::new_from_file(&config_path()).ok()?;
    log_level(&config).ok().flatten()
}

fn log_level(config: &ConfigStore) -> Result<Option<LevelFilter>, ConvertError> {
    let level = match config.get::<String>("log_level")? {
        Some(level) => level,
        None => return Ok(None),
    };

    match LevelFilter::from_str(&level) {
        Ok(filter) => Ok(Some(filter)),
        Err(_) => {
            warn!("Unknown log level {} in configuration, ignoring", level);
            Ok(None)
        }
    }
}

fn load_months(
    ctx: &Context,
    catalogues: &[CatalogueHandle],
) -> Result<IndexMap<NaiveDateTime, FieldSet>, ConvertError> {
    info!("Loading fields for {} months", ctx.months.len());

    let months_bar = ProgressBar::new(ctx.months.len() as u64);
    months_bar.set_style(
        ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}")
            .progress_chars("#>-"),
    );
    months_bar.set_prefix("Searched months");

    let mut months = IndexMap::with_capacity(ctx.months.len());

    for month in &ctx.months {
        months_bar.set_message(month.format("%Y-%m").to_string());
        let fields = loader::load_month(ctx, catalogues, *month)?;
        months.insert(*month, fields);
        months_bar.inc(1);
    }

    months_bar.finish_with_message("All months loaded");

    Ok(months)
}
