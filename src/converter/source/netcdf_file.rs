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

//! Reading of variables from NetCDF files.
//!
//! Coordinates and attributes are read eagerly when the variable is opened,
//! values are read (and decoded) only when the array is computed.

use crate::constants::{LAT_NAMES, LEVEL_NAMES, LON_NAMES, TIME_NAMES};
use crate::converter::array::{AttrValue, Attributes, Coords, DataArray};
use crate::errors::{ArrayError, InputError};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use log::{debug, warn};
use ndarray::{Array4, ArrayD, IxDyn};
use netcdf::AttributeValue;
use std::path::{Path, PathBuf};

/// Role of the variable dimension, in the order of output axes.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
enum Role {
    Time,
    Level,
    Latitude,
    Longitude,
}

impl Role {
    fn of(dimension: &str) -> Option<Role> {
        if TIME_NAMES.contains(&dimension) {
            Some(Role::Time)
        } else if LEVEL_NAMES.contains(&dimension) {
            Some(Role::Level)
        } else if LAT_NAMES.contains(&dimension) {
            Some(Role::Latitude)
        } else if LON_NAMES.contains(&dimension) {
            Some(Role::Longitude)
        } else {
            None
        }
    }
}

/// Packing of values on disk.
#[derive(Clone, PartialEq, Debug)]
struct Decoding {
    scale: f64,
    offset: f64,
    fills: Vec<f64>,
}

impl Decoding {
    fn apply(&self, raw: f64) -> f32 {
        if raw.is_nan() || self.fills.iter().any(|fill| *fill == raw) {
            return f32::NAN;
        }

        (raw * self.scale + self.offset) as f32
    }
}

/// How the values stored in the file map onto the 4D array.
#[derive(Clone, Debug)]
struct Layout {
    /// Lengths of recognised dimensions in file order.
    shape: Vec<usize>,
    /// Permutation bringing recognised dimensions into output order.
    order: Vec<usize>,
    target: [usize; 4],
    decoding: Decoding,
}

/// Names of data variables (not coordinates) in the file.
pub fn list_variables(path: &Path) -> Result<Vec<String>, InputError> {
    let file = netcdf::open(path)?;

    let dimensions: Vec<String> = file.dimensions().map(|d| d.name()).collect();

    Ok(file
        .variables()
        .map(|v| v.name())
        .filter(|name| !dimensions.contains(name))
        .filter(|name| Role::of(name).is_none())
        .filter(|name| {
            file.variable(name)
                .map_or(false, |v| v.dimensions().len() >= 2)
        })
        .collect())
}

/// Opens variable `name`, returns `None` if the file does not contain it.
pub fn open_variable(path: &Path, name: &str) -> Result<Option<DataArray>, InputError> {
    let file = netcdf::open(path)?;

    let variable = match file.variable(name) {
        Some(variable) => variable,
        None => return Ok(None),
    };

    let mut recognised: Vec<(Role, String, usize)> = vec![];

    for dimension in variable.dimensions() {
        let dimension_name = dimension.name();

        match Role::of(&dimension_name) {
            Some(role) => {
                if recognised.iter().any(|(r, _, _)| *r == role) {
                    return Err(InputError::UnknownDimension(dimension_name, name.to_string()));
                }
                recognised.push((role, dimension_name, dimension.len()));
            }
            None if dimension.len() == 1 => {
                debug!("Squeezing dimension {} of {}", dimension_name, name);
            }
            None => return Err(InputError::UnknownDimension(dimension_name, name.to_string())),
        }
    }

    let coordinate = |role: Role| recognised.iter().find(|(r, _, _)| *r == role);

    let read_axis = |dimension: &str| -> Result<Option<Vec<f64>>, InputError> {
        match file.variable(dimension) {
            Some(axis) => Ok(Some(axis.get_values::<f64, _>(..)?)),
            None => Ok(None),
        }
    };

    let latitude = match coordinate(Role::Latitude) {
        Some((_, dimension, _)) => read_axis(dimension)?,
        None => None,
    }
    .ok_or_else(|| InputError::MissingCoordinate(name.to_string(), "latitude"))?;

    let longitude = match coordinate(Role::Longitude) {
        Some((_, dimension, _)) => read_axis(dimension)?,
        None => None,
    }
    .ok_or_else(|| InputError::MissingCoordinate(name.to_string(), "longitude"))?;

    let level = match coordinate(Role::Level) {
        Some((_, dimension, len)) => {
            Some(read_axis(dimension)?.unwrap_or_else(|| (0..*len).map(|i| i as f64).collect()))
        }
        None => None,
    };

    let time = match coordinate(Role::Time) {
        Some((_, dimension, _)) => {
            let axis = file
                .variable(dimension)
                .ok_or_else(|| InputError::MissingCoordinate(name.to_string(), "time"))?;
            let units = match axis.attribute_value("units").and_then(|r| r.ok()) {
                Some(AttributeValue::Str(units)) => units,
                _ => return Err(InputError::TimeUnits(format!("{} has no units", dimension))),
            };
            let values: Vec<f64> = axis.get_values(..)?;
            Some(decode_times(&values, &units)?)
        }
        None => None,
    };

    let attrs = read_attributes(&variable);
    let decoding = read_decoding(name, &attrs);

    let coords = Coords {
        time,
        level,
        latitude,
        longitude,
    };

    let mut order: Vec<usize> = (0..recognised.len()).collect();
    order.sort_by_key(|&i| recognised[i].0);

    let layout = Layout {
        shape: recognised.iter().map(|(_, _, len)| *len).collect(),
        order,
        target: coords.shape(),
        decoding,
    };

    debug!("Opened {} from {} with shape {:?}", name, path.display(), layout.target);

    let file_path: PathBuf = path.to_path_buf();
    let variable_name = name.to_string();

    let mut array = DataArray::new_lazy(name, coords, move || {
        read_values(&file_path, &variable_name, &layout)
            .map_err(|err| ArrayError::Read(variable_name.clone(), err.to_string()))
    });
    array.attrs = attrs;

    Ok(Some(array))
}

fn read_values(path: &Path, name: &str, layout: &Layout) -> Result<Array4<f32>, InputError> {
    let file = netcdf::open(path)?;
    let variable = file
        .variable(name)
        .ok_or_else(|| InputError::MissingVariable(name.to_string(), path.display().to_string()))?;

    let raw: Vec<f64> = variable.get_values(..)?;
    let decoded: Vec<f32> = raw.into_iter().map(|v| layout.decoding.apply(v)).collect();

    let data = ArrayD::from_shape_vec(IxDyn(&layout.shape), decoded)?
        .permuted_axes(IxDyn(&layout.order))
        .as_standard_layout()
        .into_owned();

    Ok(data.into_shape(layout.target)?)
}

fn read_attributes(variable: &netcdf::Variable) -> Attributes {
    let mut attrs = Attributes::new();

    for attribute in variable.attributes() {
        let value = match attribute.value() {
            Ok(AttributeValue::Str(text)) => AttrValue::Str(text),
            Ok(AttributeValue::Double(value)) => AttrValue::Float(value),
            Ok(AttributeValue::Float(value)) => AttrValue::Float(value as f64),
            Ok(AttributeValue::Int(value)) => AttrValue::Int(value),
            Ok(AttributeValue::Short(value)) => AttrValue::Int(value as i32),
            Ok(AttributeValue::Schar(value)) => AttrValue::Int(value as i32),
            Ok(AttributeValue::Uchar(value)) => AttrValue::Int(value as i32),
            _ => continue,
        };

        attrs.insert(attribute.name().to_string(), value);
    }

    attrs
}

fn read_decoding(name: &str, attrs: &Attributes) -> Decoding {
    let number = |key: &str| match attrs.get(key) {
        Some(AttrValue::Float(value)) => Some(*value),
        Some(AttrValue::Int(value)) => Some(*value as f64),
        _ => None,
    };

    let mut fills: Vec<f64> = ["_FillValue", "missing_value"]
        .iter()
        .filter_map(|key| number(key))
        .collect();
    fills.dedup();

    if fills.len() > 1 {
        warn!(
            "{} has multiple fill values {:?}, all of them are treated as missing",
            name, fills
        );
    }

    Decoding {
        scale: number("scale_factor").unwrap_or(1.0),
        offset: number("add_offset").unwrap_or(0.0),
        fills,
    }
}

/// Decodes CF time values given in `<unit> since <reference>` units.
pub fn decode_times(values: &[f64], units: &str) -> Result<Vec<NaiveDateTime>, InputError> {
    let (unit, reference) = units
        .split_once(" since ")
        .ok_or_else(|| InputError::TimeUnits(units.to_string()))?;

    let millis_per_unit: f64 = match unit.trim() {
        "seconds" | "second" | "s" => 1e3,
        "minutes" | "minute" | "min" => 6e4,
        "hours" | "hour" | "h" => 3.6e6,
        "days" | "day" | "d" => 8.64e7,
        _ => return Err(InputError::TimeUnits(units.to_string())),
    };

    let reference = parse_reference(reference).ok_or_else(|| InputError::TimeUnits(units.to_string()))?;

    Ok(values
        .iter()
        .map(|v| reference + Duration::milliseconds((v * millis_per_unit).round() as i64))
        .collect())
}

fn parse_reference(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim().trim_end_matches("UTC").trim_end_matches('Z').trim();

    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

#[cfg(test)]
mod tests {
    use super::{decode_times, list_variables, open_variable};
    use crate::converter::array::AttrValue;
    use chrono::NaiveDate;
    use float_cmp::assert_approx_eq;

    #[test]
    fn cf_times() {
        let times = decode_times(&[0.0, 1.5], "hours since 1900-01-01 00:00:00.0").unwrap();
        let expected = NaiveDate::from_ymd_opt(1900, 1, 1)
            .unwrap()
            .and_hms_opt(1, 30, 0)
            .unwrap();
        assert_eq!(times[1], expected);

        let times = decode_times(&[2.0], "days since 2020-01-01").unwrap();
        assert_eq!(times[0].date(), NaiveDate::from_ymd_opt(2020, 1, 3).unwrap());

        assert!(decode_times(&[0.0], "fortnights since 2020-01-01").is_err());
        assert!(decode_times(&[0.0], "hours after 2020-01-01").is_err());
    }

    #[test]
    fn packed_variable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skt.nc");

        {
            let mut file = netcdf::create(&path).unwrap();
            file.add_dimension("time", 1).unwrap();
            file.add_dimension("lon", 3).unwrap();
            file.add_dimension("lat", 2).unwrap();

            {
                let mut time = file.add_variable::<f64>("time", &["time"]).unwrap();
                time.put_attribute("units", "hours since 2020-01-01 00:00:00").unwrap();
                time.put_values(&[6.0], ..).unwrap();
            }
            {
                let mut lat = file.add_variable::<f64>("lat", &["lat"]).unwrap();
                lat.put_values(&[10.0, 0.0], ..).unwrap();
            }
            {
                let mut lon = file.add_variable::<f64>("lon", &["lon"]).unwrap();
                lon.put_values(&[0.0, 1.0, 2.0], ..).unwrap();
            }

            // stored as (time, lon, lat) to check axis reordering
            let mut skt = file.add_variable::<i16>("skt", &["time", "lon", "lat"]).unwrap();
            skt.put_attribute("scale_factor", 0.5f64).unwrap();
            skt.put_attribute("add_offset", 100.0f64).unwrap();
            skt.put_attribute("_FillValue", -32767i16).unwrap();
            skt.put_attribute("units", "K").unwrap();
            skt.put_values(&[0i16, 2, 4, 6, 8, -32767], ..).unwrap();
        }

        assert_eq!(list_variables(&path).unwrap(), vec!["skt".to_string()]);
        assert!(open_variable(&path, "sst").unwrap().is_none());

        let array = open_variable(&path, "skt").unwrap().unwrap();
        assert_eq!(array.coords.shape(), [1, 1, 2, 3]);
        assert_eq!(array.coords.latitude, vec![10.0, 0.0]);
        assert_eq!(
            array.coords.time.as_ref().unwrap()[0],
            NaiveDate::from_ymd_opt(2020, 1, 1).unwrap().and_hms_opt(6, 0, 0).unwrap()
        );
        assert_eq!(array.attrs.get("units"), Some(&AttrValue::Str("K".to_string())));

        let data = array.compute().unwrap();
        // file value at (lon = 1, lat = 0) is 4
        assert_approx_eq!(f32, data[[0, 0, 0, 1]], 102.0);
        assert_approx_eq!(f32, data[[0, 0, 1, 0]], 101.0);
        assert!(data[[0, 0, 1, 2]].is_nan());
    }
}
