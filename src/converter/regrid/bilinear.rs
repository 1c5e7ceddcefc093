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

//! NaN-aware bilinear regridding.
//!
//! Land-only data (like ERA5-Land) has missing values over the sea, and
//! plain bilinear interpolation would spread them along every coastline.
//! Before interpolation the missing values are therefore filled: NaN corners
//! get the field mean, then two fills are computed (along latitude first
//! and along longitude first) with linear interpolation between valid
//! neighbours, and their average is interpolated onto the target grid.

use super::bisection::{find_left_closest, find_right_closest};
use crate::converter::array::{same_axis, Coords, DataArray};
use crate::errors::{RegridError, SearchError};
use ndarray::{Array2, ArrayView2, ArrayViewMut1, Axis, Zip};
use std::sync::Arc;

/// Interpolation stencil of one target coordinate:
/// neighbouring source indices and the weight of the second one.
type Stencil = Option<(usize, usize, f64)>;

/// Regridder interpolating bilinearly from one regular
/// latitude-longitude grid to another.
#[derive(Clone, Debug)]
pub struct InterpolatingRegridder {
    source_latitude: Vec<f64>,
    source_longitude: Vec<f64>,
    target_latitude: Vec<f64>,
    target_longitude: Vec<f64>,
    latitude_stencils: Vec<Stencil>,
    longitude_stencils: Vec<Stencil>,
}

impl InterpolatingRegridder {
    /// Builds interpolation stencils from `source` grid onto `target` grid.
    pub fn new(source: &Coords, target: &Coords) -> Result<Self, RegridError> {
        let (ny, nx) = (source.latitude.len(), source.longitude.len());

        if ny < 2 || nx < 2 {
            return Err(RegridError::DegenerateGrid(ny, nx));
        }

        let source_lons = unwrap_longitudes(&source.longitude);
        let target_lons = align_longitudes(&unwrap_longitudes(&target.longitude), &source_lons);

        Ok(InterpolatingRegridder {
            source_latitude: source.latitude.clone(),
            source_longitude: source.longitude.clone(),
            target_latitude: target.latitude.clone(),
            target_longitude: target.longitude.clone(),
            latitude_stencils: axis_stencils(&source.latitude, &target.latitude)?,
            longitude_stencils: axis_stencils(&source_lons, &target_lons)?,
        })
    }

    /// Returns the array regridded onto the target grid. Nothing is computed
    /// until the array is evaluated.
    pub fn apply(&self, array: &DataArray) -> Result<DataArray, RegridError> {
        if !same_axis(&array.coords.latitude, &self.source_latitude)
            || !same_axis(&array.coords.longitude, &self.source_longitude)
        {
            return Err(RegridError::GridMismatch(array.name.clone()));
        }

        let regridder = Arc::new(self.clone());

        Ok(array.map_planes(
            self.target_latitude.clone(),
            self.target_longitude.clone(),
            move |plane| regridder.regrid_plane(plane),
        ))
    }

    /// Fills missing values and interpolates one horizontal plane.
    pub fn regrid_plane(&self, plane: ArrayView2<f32>) -> Array2<f32> {
        let filled = fill_missing(plane);
        let mut output = Array2::<f32>::from_elem(
            (self.latitude_stencils.len(), self.longitude_stencils.len()),
            f32::NAN,
        );

        for (j, lat_stencil) in self.latitude_stencils.iter().enumerate() {
            let (y0, y1, wy) = match lat_stencil {
                Some(stencil) => *stencil,
                None => continue,
            };

            for (i, lon_stencil) in self.longitude_stencils.iter().enumerate() {
                let (x0, x1, wx) = match lon_stencil {
                    Some(stencil) => *stencil,
                    None => continue,
                };

                let value = (1.0 - wy) * (1.0 - wx) * f64::from(filled[[y0, x0]])
                    + (1.0 - wy) * wx * f64::from(filled[[y0, x1]])
                    + wy * (1.0 - wx) * f64::from(filled[[y1, x0]])
                    + wy * wx * f64::from(filled[[y1, x1]]);

                output[[j, i]] = value as f32;
            }
        }

        output
    }
}

/// Computes interpolation stencils of target coordinates on source axis.
/// Target coordinates outside of the source axis get no stencil.
fn axis_stencils(source: &[f64], target: &[f64]) -> Result<Vec<Stencil>, RegridError> {
    let mut stencils = Vec::with_capacity(target.len());

    for x in target {
        let left = find_left_closest(source, x);
        let right = find_right_closest(source, x);

        let stencil = match (left, right) {
            (Ok(left), Ok(right)) => {
                if left == right {
                    Some((left, right, 0.0))
                } else {
                    let weight = (x - source[left]) / (source[right] - source[left]);
                    Some((left, right, weight))
                }
            }
            (Err(SearchError::OutOfBounds), _) | (_, Err(SearchError::OutOfBounds)) => None,
            _ => {
                return Err(RegridError::DegenerateGrid(source.len(), target.len()));
            }
        };

        stencils.push(stencil);
    }

    Ok(stencils)
}

/// Makes longitudes crossing the 0 meridian monotonic
/// by adding full circles after the wrap.
fn unwrap_longitudes(longitude: &[f64]) -> Vec<f64> {
    let mut offset = 0.0;
    let mut previous: Option<f64> = None;

    longitude
        .iter()
        .map(|lon| {
            if let Some(prev) = previous {
                if lon + offset < prev - 180.0 {
                    offset += 360.0;
                }
            }
            let unwrapped = lon + offset;
            previous = Some(unwrapped);
            unwrapped
        })
        .collect()
}

/// Shifts target longitudes by full circles so that the middle
/// of their range is closest to the middle of the source range.
fn align_longitudes(target: &[f64], source: &[f64]) -> Vec<f64> {
    let (source_middle, target_middle) = match (middle(source), middle(target)) {
        (Some(s), Some(t)) => (s, t),
        _ => return target.to_vec(),
    };

    let shift = ((source_middle - target_middle) / 360.0).round() * 360.0;
    target.iter().map(|lon| lon + shift).collect()
}

fn middle(axis: &[f64]) -> Option<f64> {
    let min = axis.iter().copied().reduce(f64::min)?;
    let max = axis.iter().copied().reduce(f64::max)?;

    Some((min + max) / 2.0)
}

/// Fills missing values of the plane.
///
/// Corners are set to the mean of valid values, then the plane is filled
/// along latitude then longitude and along longitude then latitude,
/// and both results are averaged. A plane without valid values is returned as is.
pub fn fill_missing(plane: ArrayView2<f32>) -> Array2<f32> {
    let (sum, count) = plane
        .iter()
        .filter(|v| !v.is_nan())
        .fold((0.0_f64, 0_usize), |(sum, count), v| (sum + f64::from(*v), count + 1));

    if count == 0 || count == plane.len() {
        return plane.to_owned();
    }

    let mean = (sum / count as f64) as f32;
    let mut filled = plane.to_owned();
    let (ny, nx) = filled.dim();

    for (y, x) in [(0, 0), (0, nx - 1), (ny - 1, 0), (ny - 1, nx - 1)] {
        if filled[[y, x]].is_nan() {
            filled[[y, x]] = mean;
        }
    }

    let mut lat_first = filled.clone();
    fill_along(&mut lat_first, Axis(0));
    fill_along(&mut lat_first, Axis(1));

    let mut lon_first = filled;
    fill_along(&mut lon_first, Axis(1));
    fill_along(&mut lon_first, Axis(0));

    Zip::from(&mut lat_first)
        .and(&lon_first)
        .for_each(|a, &b| *a = (*a + b) / 2.0);

    lat_first
}

/// Linearly fills NaNs lying between valid values in every lane along the axis.
/// Leading and trailing NaNs are left untouched.
fn fill_along(plane: &mut Array2<f32>, axis: Axis) {
    for lane in plane.lanes_mut(axis) {
        fill_lane(lane);
    }
}

fn fill_lane(mut lane: ArrayViewMut1<f32>) {
    let mut previous_valid: Option<usize> = None;

    for i in 0..lane.len() {
        if lane[i].is_nan() {
            continue;
        }

        if let Some(p) = previous_valid {
            if i - p > 1 {
                let (start, end) = (lane[p], lane[i]);
                let span = (i - p) as f32;

                for k in (p + 1)..i {
                    let weight = (k - p) as f32 / span;
                    lane[k] = start + (end - start) * weight;
                }
            }
        }

        previous_valid = Some(i);
    }
}
