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

use crate::constants::OUTPUT_TIME_UNITS;
use crate::converter::array::{AttrValue, DataArray};
use crate::converter::dataset::Dataset;
use crate::converter::parallel::WorkerPool;
use crate::errors::OutputError;

use chrono::NaiveDateTime;
use indexmap::IndexMap;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use ndarray::Axis;
use std::path::Path;

/// How the variables are laid out in the NetCDF file.
#[derive(Clone, Debug)]
pub struct NetcdfSettings {
    /// Value written in place of missing data, `NaN` keeps NaNs as they are.
    pub fill_value: f32,
    /// Chunk sizes per dimension name.
    pub chunks: Option<IndexMap<String, usize>>,
}

impl Default for NetcdfSettings {
    fn default() -> Self {
        NetcdfSettings {
            fill_value: f32::NAN,
            chunks: None,
        }
    }
}

pub fn write_netcdf(
    dataset: &Dataset,
    path: &Path,
    pool: &WorkerPool,
    settings: &NetcdfSettings,
) -> Result<(), OutputError> {
    let first = dataset.variables.first().ok_or(OutputError::EmptyDataset)?;
    let times = dataset.time_axis();
    let levels = dataset.level_axis().cloned();

    check_layout(dataset, first, &times, levels.as_deref())?;

    debug!("Writing NetCDF file {}", path.display());
    let mut file = netcdf::create(path)?;

    file.add_unlimited_dimension("time")?;
    if let Some(levels) = &levels {
        file.add_dimension("level", levels.len())?;
    }
    file.add_dimension("latitude", first.coords.latitude.len())?;
    file.add_dimension("longitude", first.coords.longitude.len())?;

    {
        let mut time_var = file.add_variable::<f64>("time", &["time"])?;
        time_var.put_attribute("standard_name", "time")?;
        time_var.put_attribute("units", OUTPUT_TIME_UNITS)?;
        time_var.put_attribute("calendar", "proleptic_gregorian")?;

        for (t, time) in times.iter().enumerate() {
            time_var.put_value(hours_since_epoch(time), [t])?;
        }
    }

    if let Some(levels) = &levels {
        let mut level_var = file.add_variable::<f64>("level", &["level"])?;
        level_var.put_attribute("long_name", "pressure_level")?;
        level_var.put_attribute("units", "millibars")?;
        level_var.put_values(levels, ..)?;
    }

    {
        let mut lat_var = file.add_variable::<f64>("latitude", &["latitude"])?;
        lat_var.put_attribute("standard_name", "latitude")?;
        lat_var.put_attribute("units", "degrees_north")?;
        lat_var.put_values(&first.coords.latitude, ..)?;
    }

    {
        let mut lon_var = file.add_variable::<f64>("longitude", &["longitude"])?;
        lon_var.put_attribute("standard_name", "longitude")?;
        lon_var.put_attribute("units", "degrees_east")?;
        lon_var.put_values(&first.coords.longitude, ..)?;
    }

    let bar = ProgressBar::new(dataset.variables.len() as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}")
            .progress_chars("#>-"),
    );
    bar.set_prefix("Written variables");

    // only one evaluated variable is held in memory at a time
    for variable in &dataset.variables {
        bar.set_message(variable.name.clone());

        let dims: Vec<&str> = if variable.coords.level.is_some() {
            vec!["time", "level", "latitude", "longitude"]
        } else {
            vec!["time", "latitude", "longitude"]
        };
        let sizes: Vec<usize> = dims
            .iter()
            .map(|d| match *d {
                "time" => times.len(),
                "level" => levels.as_ref().map_or(1, |l| l.len()),
                "latitude" => first.coords.latitude.len(),
                _ => first.coords.longitude.len(),
            })
            .collect();

        let mut var = file.add_variable::<f32>(&variable.name, &dims)?;

        for (name, value) in variable.attrs.iter().filter(|(n, _)| *n != "_FillValue") {
            match value {
                AttrValue::Int(v) => var.put_attribute(name, *v)?,
                AttrValue::Float(v) => var.put_attribute(name, *v)?,
                AttrValue::Str(v) => var.put_attribute(name, v.as_str())?,
            };
        }
        var.set_fill_value(settings.fill_value)?;

        if let Some(chunks) = &settings.chunks {
            var.set_chunking(&chunk_sizes(&dims, &sizes, chunks))?;
        }

        let data = pool.install(|| variable.compute())?;

        for t in 0..data.len_of(Axis(0)) {
            let plane: Vec<f32> = data
                .index_axis(Axis(0), t)
                .iter()
                .map(|v| fill_missing(*v, settings.fill_value))
                .collect();

            if variable.coords.level.is_some() {
                var.put_values(&plane, (t, .., .., ..))?;
            } else {
                var.put_values(&plane, (t, .., ..))?;
            }
        }

        bar.inc(1);
    }

    bar.finish_with_message("All variables written");

    Ok(())
}

/// Every variable has to share the grid and the levels,
/// and its timestamps have to start the dataset time axis.
fn check_layout(
    dataset: &Dataset,
    first: &DataArray,
    times: &[NaiveDateTime],
    levels: Option<&[f64]>,
) -> Result<(), OutputError> {
    for variable in &dataset.variables {
        if !variable.coords.same_grid(&first.coords) {
            return Err(OutputError::GridMismatch(variable.name.clone()));
        }

        let own_times = variable.coords.time.as_deref().unwrap_or(&[]);
        if own_times.is_empty() || !times.starts_with(own_times) {
            return Err(OutputError::TimeMismatch(variable.name.clone()));
        }

        if let (Some(own), Some(levels)) = (&variable.coords.level, levels) {
            if own.as_slice() != levels {
                return Err(OutputError::GridMismatch(variable.name.clone()));
            }
        }
    }

    Ok(())
}

fn chunk_sizes(dims: &[&str], sizes: &[usize], chunks: &IndexMap<String, usize>) -> Vec<usize> {
    dims.iter()
        .zip(sizes)
        .map(|(dim, size)| match chunks.get(*dim) {
            Some(&c) if c > 0 && c <= *size => c,
            _ => (*size).max(1),
        })
        .collect()
}

fn fill_missing(value: f32, fill_value: f32) -> f32 {
    if value.is_nan() && !fill_value.is_nan() {
        fill_value
    } else {
        value
    }
}

fn hours_since_epoch(time: &NaiveDateTime) -> f64 {
    time.timestamp() as f64 / 3600.0
}

#[cfg(test)]
mod tests {
    use super::{chunk_sizes, write_netcdf, NetcdfSettings};
    use crate::converter::array::{AttrValue, Coords, DataArray};
    use crate::converter::dataset::Dataset;
    use crate::converter::parallel::WorkerPool;
    use crate::errors::{ArrayError, OutputError};
    use chrono::NaiveDate;
    use float_cmp::approx_eq;
    use indexmap::IndexMap;
    use ndarray::Array4;

    fn variable(name: &str, hours: u32, value: f32) -> DataArray {
        let day = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let coords = Coords {
            time: Some((0..hours).map(|h| day.and_hms_opt(h, 0, 0).unwrap()).collect()),
            level: None,
            latitude: vec![10.0, 9.0],
            longitude: vec![0.0, 1.0, 2.0],
        };
        let mut data = Array4::from_elem((hours as usize, 1, 2, 3), value);
        data[[0, 0, 1, 2]] = f32::NAN;

        DataArray::from_data(name, coords, data).unwrap()
    }

    #[test]
    fn chunks_are_clamped() {
        let mut chunks = IndexMap::new();
        chunks.insert("time".to_string(), 1);
        chunks.insert("latitude".to_string(), 500);

        assert_eq!(
            chunk_sizes(&["time", "latitude", "longitude"], &[4, 100, 200], &chunks),
            vec![1, 100, 200]
        );
    }

    #[test]
    fn written_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.nc");
        let pool = WorkerPool::new(2, usize::MAX).unwrap();

        let mut skt = variable("skt", 3, 280.0);
        skt.attrs
            .insert("units".to_string(), AttrValue::Str("K".to_string()));
        let lsm = variable("lsm", 1, 1.0);
        let dataset = Dataset::new(vec![skt, lsm]);

        let settings = NetcdfSettings {
            fill_value: -1e10,
            chunks: None,
        };
        write_netcdf(&dataset, &path, &pool, &settings).unwrap();

        let file = netcdf::open(&path).unwrap();
        let time = file.variable("time").unwrap();
        let hours: Vec<f64> = time.get_values::<f64, _>(..).unwrap();
        assert_eq!(hours.len(), 3);
        assert!(approx_eq!(f64, hours[1] - hours[0], 1.0));

        let skt = file.variable("skt").unwrap();
        let values: Vec<f32> = skt.get_values::<f32, _>(..).unwrap();
        assert_eq!(values.len(), 18);
        assert!(approx_eq!(f32, values[0], 280.0));
        assert!(approx_eq!(f32, values[5], -1e10));

        let lsm = file.variable("lsm").unwrap();
        let values: Vec<f32> = lsm.get_values::<f32, _>((0, .., ..)).unwrap();
        assert!(approx_eq!(f32, values[0], 1.0));
    }

    #[test]
    fn variables_are_written_in_turn() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.nc");
        let pool = WorkerPool::new(2, usize::MAX).unwrap();

        let skt = variable("skt", 2, 280.0);
        let broken = DataArray::new_lazy("sst", skt.coords.clone(), || {
            Err(ArrayError::Read("sst".to_string(), "unreadable".to_string()))
        });

        let result = write_netcdf(
            &Dataset::new(vec![skt, broken]),
            &path,
            &pool,
            &NetcdfSettings::default(),
        );
        assert!(matches!(result, Err(OutputError::Array(ArrayError::Read(_, _)))));

        let file = netcdf::open(&path).unwrap();
        let values: Vec<f32> = file
            .variable("skt")
            .unwrap()
            .get_values::<f32, _>((1, .., ..))
            .unwrap();
        assert!(approx_eq!(f32, values[0], 280.0));
    }

    #[test]
    fn mismatched_grid() {
        let dir = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(1, usize::MAX).unwrap();

        let skt = variable("skt", 2, 280.0);
        let mut coords = skt.coords.clone();
        coords.longitude = vec![5.0, 6.0, 7.0];
        let shifted = DataArray::from_data("sst", coords, skt.compute().unwrap()).unwrap();

        let result = write_netcdf(
            &Dataset::new(vec![skt, shifted]),
            &dir.path().join("out.nc"),
            &pool,
            &NetcdfSettings::default(),
        );

        assert!(matches!(result, Err(OutputError::GridMismatch(name)) if name == "sst"));
    }

    #[test]
    fn empty_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(1, usize::MAX).unwrap();

        let result = write_netcdf(
            &Dataset::default(),
            &dir.path().join("out.nc"),
            &pool,
            &NetcdfSettings::default(),
        );

        assert!(matches!(result, Err(OutputError::EmptyDataset)));
    }
}
