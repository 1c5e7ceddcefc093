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

//! Module containing constants used by the converter.

/// Names under which latitude coordinate can appear in input files.
/// The first entry is the canonical name.
pub const LAT_NAMES: [&str; 6] = ["latitude", "lat", "LAT", "LATITUDE", "Lat", "Latitude"];

/// Names under which longitude coordinate can appear in input files.
/// The first entry is the canonical name.
pub const LON_NAMES: [&str; 6] = ["longitude", "lon", "LON", "LONGITUDE", "Lon", "Longitude"];

/// Names under which time coordinate can appear in input files.
pub const TIME_NAMES: [&str; 3] = ["time", "valid_time", "Time"];

/// Names under which vertical (pressure) coordinate can appear in input files.
pub const LEVEL_NAMES: [&str; 4] = ["level", "pressure_level", "plev", "isobaricInhPa"];

/// Shape (latitude, longitude) of the fine ERA5-Land grid, the only source grid
/// supported by precomputed weight file regridding.
pub const WEIGHT_FILE_SOURCE_SHAPE: (usize, usize) = (1801, 3600);

/// Default configuration file read when `ERA5GRIB_CONFIG` is not set.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Default key of the placeholder catalogue for custom fields.
pub const DEFAULT_CUSTOM_CATALOGUE_KEY: &str = "custom";

/// Default width (in degrees) of the interpolation margin around the output domain.
pub const DEFAULT_DOMAIN_BUFFER: f64 = 1.0;

/// Number of workers used outside of batch jobs.
pub const INTERACTIVE_WORKERS: usize = 2;

/// Memory (in bytes) available outside of batch jobs.
pub const INTERACTIVE_MEMORY: usize = 3 * 1024 * 1024 * 1024;

/// Fraction of RSS limit the converter is allowed to use inside batch jobs.
pub const BATCH_MEMORY_FRACTION: f64 = 0.9;

/// Hostname prefix of login nodes on which batch environment is not trusted.
pub const LOGIN_NODE_PREFIX: &str = "gadi-login-";

/// Fill value written to the intermediate NetCDF file before GRIB conversion.
pub const GRIB_FILL_VALUE: f32 = -1e10;

/// Arguments passed to the external GRIB converter before input and output paths.
pub const GRIB_CONVERTER_ARGS: [&str; 6] = ["-v", "-f", "grb1", "-t", "ecmwf", "copy"];

/// Units of the time coordinate in output files.
pub const OUTPUT_TIME_UNITS: &str = "hours since 1970-01-01 00:00:00";

/// Eastern bound of a domain spanning the full longitude circle,
/// the last longitude of the ERA5 grid.
pub const FULL_CIRCLE_EAST: f64 = 359.75;
