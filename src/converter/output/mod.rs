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

//! Output drivers selected by the `format` configuration key.

mod grib_driver;
mod netcdf_driver;

pub use grib_driver::write_grib;
pub use netcdf_driver::{write_netcdf, NetcdfSettings};

use super::configuration::ConfigStore;
use super::dataset::Dataset;
use super::parallel::WorkerPool;
use crate::errors::OutputError;

use indexmap::IndexMap;
use log::info;

pub fn write(dataset: &Dataset, config: &ConfigStore, pool: &WorkerPool) -> Result<(), OutputError> {
    let format = config.format()?;
    let path = config.output()?;

    info!("Writing {} output to {}", format, path.display());

    match format.as_str() {
        "netcdf" => {
            let chunks = match dataset.common_source() {
                Some(source) => config
                    .get::<IndexMap<String, usize>>(&format!("catalogue_flags.{}.chunks", source))?,
                None => None,
            };

            let settings = NetcdfSettings {
                chunks,
                ..NetcdfSettings::default()
            };
            write_netcdf(dataset, &path, pool, &settings)
        }
        "grib" => {
            let converter = config.get_or("grib_converter", "cdo".to_string())?;
            write_grib(dataset, &path, pool, &converter)
        }
        _ => Err(OutputError::UnknownFormat(format)),
    }
}

#[cfg(test)]
mod tests {
    use super::write;
    use crate::converter::configuration::ConfigStore;
    use crate::converter::dataset::Dataset;
    use crate::converter::parallel::WorkerPool;
    use crate::errors::OutputError;

    #[test]
    fn unknown_format() {
        let config = ConfigStore::from_value(
            serde_yaml::from_str("{format: zarr, output: out.zarr}").unwrap(),
        )
        .unwrap();
        let pool = WorkerPool::new(1, usize::MAX).unwrap();

        let result = write(&Dataset::default(), &config, &pool);
        assert!(matches!(result, Err(OutputError::UnknownFormat(name)) if name == "zarr"));
    }
}
