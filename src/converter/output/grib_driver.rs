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

use super::netcdf_driver::{write_netcdf, NetcdfSettings};
use crate::constants::{GRIB_CONVERTER_ARGS, GRIB_FILL_VALUE};
use crate::converter::dataset::Dataset;
use crate::converter::parallel::WorkerPool;
use crate::errors::OutputError;

use log::{debug, info};
use std::{env, path::Path, process::Command};

/// Writes the dataset to an intermediate NetCDF file and
/// converts it to GRIB with an external tool.
///
/// The intermediate file lives in `TMPDIR` (or the system temporary
/// directory) and is removed when this function returns.
pub fn write_grib(
    dataset: &Dataset,
    path: &Path,
    pool: &WorkerPool,
    converter: &str,
) -> Result<(), OutputError> {
    let tmp_dir = env::var_os("TMPDIR").map_or_else(env::temp_dir, Into::into);
    let intermediate = tempfile::Builder::new()
        .prefix("era5grib")
        .suffix(".nc")
        .tempfile_in(tmp_dir)?;

    let settings = NetcdfSettings {
        fill_value: GRIB_FILL_VALUE,
        chunks: None,
    };
    write_netcdf(dataset, intermediate.path(), pool, &settings)?;

    info!("Converting to GRIB with {}", converter);
    debug!(
        "Running {} {} {} {}",
        converter,
        GRIB_CONVERTER_ARGS.join(" "),
        intermediate.path().display(),
        path.display()
    );

    let status = Command::new(converter)
        .args(GRIB_CONVERTER_ARGS)
        .arg(intermediate.path())
        .arg(path)
        .status()?;

    if !status.success() {
        return Err(OutputError::ConverterFailed(
            converter.to_string(),
            status.to_string(),
        ));
    }

    Ok(())
}
