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

//! Module responsible for opening data files.
//!
//! File format is chosen by extension: GRIB files go through eccodes,
//! everything else is read as NetCDF.

mod grib_file;
mod netcdf_file;

use super::array::DataArray;
use crate::errors::InputError;
use log::debug;
use std::path::Path;

const GRIB_EXTENSIONS: [&str; 4] = ["grib", "grb", "grib1", "grib2"];

fn is_grib(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| GRIB_EXTENSIONS.contains(&e.to_lowercase().as_str()))
}

/// Opens a variable from a single file.
pub fn open_variable(path: &Path, variable: &str) -> Result<Option<DataArray>, InputError> {
    if is_grib(path) {
        grib_file::open_variable(path, variable)
    } else {
        netcdf_file::open_variable(path, variable)
    }
}

/// Names of data variables present in a single file.
pub fn list_variables(path: &Path) -> Result<Vec<String>, InputError> {
    if is_grib(path) {
        grib_file::list_variables(path)
    } else {
        netcdf_file::list_variables(path)
    }
}

/// Opens a variable split across several files and concatenates
/// the pieces along time in time order.
pub fn open_series(paths: &[&Path], variable: &str) -> Result<Option<DataArray>, InputError> {
    let mut pieces = vec![];

    for path in paths {
        match open_variable(path, variable)? {
            Some(piece) => pieces.push(piece),
            None => debug!("{} not found in {}", variable, path.display()),
        }
    }

    pieces.sort_by_key(|piece| piece.coords.time.as_ref().and_then(|t| t.first().copied()));

    let mut pieces = pieces.into_iter();
    let first = match pieces.next() {
        Some(first) => first,
        None => return Ok(None),
    };

    let series = pieces.try_fold(first, |series, piece| series.concat_time(&piece))?;

    Ok(Some(series))
}
