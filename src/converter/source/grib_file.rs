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

//! Reading of variables from GRIB files.
//!
//! Every message holds one horizontal plane. Messages of a variable are
//! scanned once for their grid, validity time and level, values are decoded
//! only when the array is computed.

use crate::converter::array::{AttrValue, Attributes, Coords, DataArray};
use crate::errors::{ArrayError, InputError};
use chrono::{NaiveDate, NaiveDateTime};
use eccodes::codes_handle::{CodesHandle, ProductKind::GRIB};
use eccodes::FallibleIterator;
use eccodes::codes_handle::{
    KeyType::{self, FloatArray, Int, Str},
    KeyedMessage,
};
use log::debug;
use ndarray::{s, Array2, Array4};
use rustc_hash::FxHashSet;
use std::path::{Path, PathBuf};

const PRESSURE_LEVEL_TYPE: &str = "isobaricInhPa";

/// Position of the message plane in the 4D array.
#[derive(Clone, Copy, PartialEq, Debug)]
struct Stamp {
    time: NaiveDateTime,
    level: Option<f64>,
}

fn read_int(msg: &KeyedMessage, key: &str) -> Result<i64, InputError> {
    match msg.read_key(key)?.value {
        Int(value) => Ok(value),
        _ => Err(InputError::IncorrectKeyType(key.to_string())),
    }
}

fn read_float(msg: &KeyedMessage, key: &str) -> Result<f64, InputError> {
    match msg.read_key(key)?.value {
        KeyType::Float(value) => Ok(value),
        Int(value) => Ok(value as f64),
        _ => Err(InputError::IncorrectKeyType(key.to_string())),
    }
}

fn read_str(msg: &KeyedMessage, key: &str) -> Result<String, InputError> {
    match msg.read_key(key)?.value {
        Str(value) => Ok(value),
        _ => Err(InputError::IncorrectKeyType(key.to_string())),
    }
}

fn read_stamp(msg: &KeyedMessage) -> Result<Stamp, InputError> {
    let date = read_int(msg, "validityDate")?;
    let time = read_int(msg, "validityTime")?;

    let time = NaiveDate::from_ymd_opt((date / 10000) as i32, ((date / 100) % 100) as u32, (date % 100) as u32)
        .and_then(|d| d.and_hms_opt((time / 100) as u32, (time % 100) as u32, 0))
        .ok_or_else(|| InputError::IncorrectKeyType("validityDate".to_string()))?;

    let level = if read_str(msg, "typeOfLevel")? == PRESSURE_LEVEL_TYPE {
        Some(read_float(msg, "level")?)
    } else {
        None
    };

    Ok(Stamp { time, level })
}

fn collect_messages(path: &Path, short_name: &str) -> Result<Vec<KeyedMessage>, InputError> {
    let handle = CodesHandle::new_from_file(path, GRIB)?;

    let messages: Vec<KeyedMessage> = handle
        .filter(|msg| Ok(msg.read_key("shortName")?.value == Str(short_name.to_string())))
        .collect()?;

    Ok(messages)
}

/// Evenly spaced axis between first and last grid point.
fn axis(first: f64, last: f64, points: usize) -> Vec<f64> {
    if points < 2 {
        return vec![first; points];
    }

    let step = (last - first) / (points - 1) as f64;
    (0..points).map(|i| first + step * i as f64).collect()
}

/// Short names of all variables in the file, in order of appearance.
pub fn list_variables(path: &Path) -> Result<Vec<String>, InputError> {
    let handle = CodesHandle::new_from_file(path, GRIB)?;
    let messages: Vec<KeyedMessage> = handle.collect()?;

    let mut seen = FxHashSet::default();
    let mut names = vec![];

    for msg in &messages {
        let name = read_str(msg, "shortName")?;
        if seen.insert(name.clone()) {
            names.push(name);
        }
    }

    Ok(names)
}

/// Opens variable `short_name`, returns `None` if the file has no messages of it.
pub fn open_variable(path: &Path, short_name: &str) -> Result<Option<DataArray>, InputError> {
    let messages = collect_messages(path, short_name)?;

    let first = match messages.first() {
        Some(first) => first,
        None => return Ok(None),
    };

    let ni = read_int(first, "Ni")? as usize;
    let nj = read_int(first, "Nj")? as usize;

    let latitude = axis(
        read_float(first, "latitudeOfFirstGridPointInDegrees")?,
        read_float(first, "latitudeOfLastGridPointInDegrees")?,
        nj,
    );

    let lon_first = read_float(first, "longitudeOfFirstGridPointInDegrees")?;
    let mut lon_last = read_float(first, "longitudeOfLastGridPointInDegrees")?;
    if lon_last < lon_first {
        lon_last += 360.0;
    }
    let longitude = axis(lon_first, lon_last, ni);

    let stamps = messages.iter().map(read_stamp).collect::<Result<Vec<_>, _>>()?;

    let mut times: Vec<NaiveDateTime> = stamps.iter().map(|s| s.time).collect();
    times.sort();
    times.dedup();

    let mut levels: Vec<f64> = stamps.iter().filter_map(|s| s.level).collect();
    levels.sort_by(|a, b| b.total_cmp(a));
    levels.dedup();

    let level_count = levels.len().max(1);
    if stamps.len() != times.len() * level_count {
        return Err(InputError::IrregularMessages(
            short_name.to_string(),
            path.display().to_string(),
        ));
    }

    let mut attrs = Attributes::new();
    for key in ["name", "units", "cfVarName"] {
        if let Ok(value) = read_str(first, key) {
            attrs.insert(key.to_string(), AttrValue::Str(value));
        }
    }

    let coords = Coords {
        time: Some(times),
        level: if levels.is_empty() { None } else { Some(levels) },
        latitude,
        longitude,
    };

    debug!(
        "Found {} messages of {} in {}",
        stamps.len(),
        short_name,
        path.display()
    );

    let file_path: PathBuf = path.to_path_buf();
    let name = short_name.to_string();
    let layout = coords.clone();

    let mut array = DataArray::new_lazy(short_name, coords, move || {
        read_values(&file_path, &name, &layout)
            .map_err(|err| ArrayError::Read(name.clone(), err.to_string()))
    });
    array.attrs = attrs;

    Ok(Some(array))
}

fn read_values(path: &Path, short_name: &str, coords: &Coords) -> Result<Array4<f32>, InputError> {
    let shape = coords.shape();
    let mut data = Array4::<f32>::from_elem(shape, f32::NAN);

    for msg in collect_messages(path, short_name)? {
        let stamp = read_stamp(&msg)?;

        let t = coords
            .time
            .as_ref()
            .and_then(|times| times.iter().position(|t| *t == stamp.time));
        let l = match (&coords.level, stamp.level) {
            (Some(levels), Some(level)) => levels.iter().position(|l| *l == level),
            (None, None) => Some(0),
            _ => None,
        };

        let (t, l) = match (t, l) {
            (Some(t), Some(l)) => (t, l),
            _ => {
                return Err(InputError::IrregularMessages(
                    short_name.to_string(),
                    path.display().to_string(),
                ))
            }
        };

        let missing = read_float(&msg, "missingValue").ok();
        let values = match msg.read_key("values")?.value {
            FloatArray(values) => values,
            _ => return Err(InputError::IncorrectKeyType("values".to_string())),
        };

        let plane = Array2::from_shape_vec((shape[2], shape[3]), values)?
            .mapv(|v| if Some(v) == missing { f32::NAN } else { v as f32 });

        data.slice_mut(s![t, l, .., ..]).assign(&plane);
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::axis;

    #[test]
    fn grid_axis() {
        assert_eq!(axis(90.0, -90.0, 3), vec![90.0, 0.0, -90.0]);
        assert_eq!(axis(0.0, 359.0, 360).len(), 360);
        assert_eq!(axis(5.0, 5.0, 1), vec![5.0]);
    }
}
