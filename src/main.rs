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

//! ERA5 GRIB Converter (era5grib) turns archived ERA5 and ERA5-Land
//! reanalysis data into boundary and initial condition files for
//! limited-area and global numerical weather models.
//!
//! For every requested month the converter searches the configured
//! catalogues for the requested variables, loads them as lazy arrays,
//! stitches the months together, regrids all sources onto one target grid,
//! merges land-only and ocean-only contributions with a land-sea mask
//! and writes the result as NetCDF or GRIB.

mod constants;
mod converter;
mod errors;

use cap::Cap;
use env_logger::Env;
use log::{error, info};
use std::{alloc, process};

/// Global allocator used by the converter.
///
/// Use of static global allocator allows for capping the memory to the limit
/// derived from the execution environment (or set by user in configuration file)
/// and in effect provide better [OOM error](https://en.wikipedia.org/wiki/Out_of_memory) handling.
#[global_allocator]
static ALLOCATOR: Cap<alloc::System> = Cap::new(alloc::System, usize::MAX);

/// The main program function.
/// Prepares the runtime environment and calls the [`converter::main`].
///
/// The `env_logger` needs to be initiated before any log messages are possible to occur.
/// `ERA5GRIB_LOG_LEVEL` takes precedence over `log_level` from the configuration file.
/// Any error returned by the converter is fatal and terminates the process
/// with non-zero exit status.
fn main() {
    #[cfg(not(feature = "debug"))]
    let default_level = "info";

    #[cfg(feature = "debug")]
    let default_level = "debug";

    let default_level = converter::configured_log_level()
        .map_or_else(|| default_level.to_string(), |level| level.to_string());

    let logger_env = Env::new().filter_or("ERA5GRIB_LOG_LEVEL", default_level);

    env_logger::Builder::from_env(logger_env)
        .format_timestamp_millis()
        .init();

    match converter::main() {
        Ok(_) => info!("Conversion finished. Check the output file and log."),
        Err(err) => {
            error!("Conversion failed with error: {}", err);
            process::exit(1);
        }
    }
}
