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

//! Module with the lazy, coordinate-labelled array used for all fields.
//!
//! Every [`DataArray`] is a 4-D array with axes ordered as
//! (time, level, latitude, longitude). Data on single levels has a level axis
//! of length `1` and no level coordinate, "timeless" data (static fields
//! after selection, land-sea mask, reference grids) has a time axis of length `1`
//! and no time coordinate.
//!
//! Coordinates are always kept in memory, but values are a deferred computation:
//! each transformation wraps the computation of its input in a new closure
//! and nothing is read from disk or computed until [`DataArray::compute`]
//! is called by an output driver.

use crate::errors::ArrayError;
use chrono::NaiveDateTime;
use float_cmp::approx_eq;
use indexmap::IndexMap;
use ndarray::{concatenate, s, Array2, Array4, ArrayView2, Axis, Zip};
use rayon::prelude::*;
use std::{fmt, sync::Arc};

use super::domain::DomainExtent;

/// Deferred computation producing the array values.
pub type Graph = Arc<dyn Fn() -> Result<Array4<f32>, ArrayError> + Send + Sync>;

/// Value of a single field attribute.
#[derive(Clone, PartialEq, Debug)]
pub enum AttrValue {
    Int(i32),
    Float(f64),
    Str(String),
}

/// Field attributes in insertion order.
pub type Attributes = IndexMap<String, AttrValue>;

/// Coordinates of the [`DataArray`] axes.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct Coords {
    pub time: Option<Vec<NaiveDateTime>>,
    pub level: Option<Vec<f64>>,
    pub latitude: Vec<f64>,
    pub longitude: Vec<f64>,
}

impl Coords {
    /// Shape of the array described by these coordinates.
    pub fn shape(&self) -> [usize; 4] {
        [
            self.time.as_ref().map_or(1, |t| t.len()),
            self.level.as_ref().map_or(1, |l| l.len()),
            self.latitude.len(),
            self.longitude.len(),
        ]
    }

    /// Checks if both coordinates describe the same horizontal grid.
    ///
    /// Coordinates read from different sources are rarely bit-identical,
    /// so they are compared with a small tolerance.
    pub fn same_grid(&self, other: &Coords) -> bool {
        same_axis(&self.latitude, &other.latitude) && same_axis(&self.longitude, &other.longitude)
    }

    /// Checks if both coordinates have the same levels.
    fn same_levels(&self, other: &Coords) -> bool {
        match (&self.level, &other.level) {
            (None, None) => true,
            (Some(a), Some(b)) => same_axis(a, b),
            _ => false,
        }
    }
}

/// Compares two coordinate axes element-wise with tolerance.
pub fn same_axis(a: &[f64], b: &[f64]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|(x, y)| approx_eq!(f64, *x, *y, epsilon = 1e-6, ulps = 4))
}

/// Lazy, named and coordinate-labelled array.
#[derive(Clone)]
pub struct DataArray {
    pub name: String,
    pub attrs: Attributes,
    /// Name of the catalogue (or path of the file) the data comes from.
    pub source: String,
    pub coords: Coords,
    graph: Graph,
}

impl fmt::Debug for DataArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataArray")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("shape", &self.coords.shape())
            .field("attrs", &self.attrs)
            .finish()
    }
}

impl DataArray {
    /// Creates array which values are produced by provided closure.
    pub fn new_lazy<F>(name: &str, coords: Coords, compute: F) -> Self
    where
        F: Fn() -> Result<Array4<f32>, ArrayError> + Send + Sync + 'static,
    {
        DataArray {
            name: name.to_string(),
            attrs: Attributes::new(),
            source: String::new(),
            coords,
            graph: Arc::new(compute),
        }
    }

    /// Creates array from values already in memory.
    pub fn from_data(name: &str, coords: Coords, data: Array4<f32>) -> Result<Self, ArrayError> {
        let expected = coords.shape();

        if data.shape() != &expected[..] {
            return Err(ArrayError::ShapeMismatch(
                name.to_string(),
                data.shape().to_vec(),
                expected.to_vec(),
            ));
        }

        let data = Arc::new(data);
        Ok(DataArray::new_lazy(name, coords, move || Ok((*data).clone())))
    }

    /// Evaluates the deferred computation and checks that the result
    /// matches the coordinates.
    pub fn compute(&self) -> Result<Array4<f32>, ArrayError> {
        let data = (self.graph)()?;
        let expected = self.coords.shape();

        if data.shape() != &expected[..] {
            return Err(ArrayError::ShapeMismatch(
                self.name.clone(),
                data.shape().to_vec(),
                expected.to_vec(),
            ));
        }

        Ok(data)
    }

    /// Wraps the computation of this array into a new transformation.
    fn derive<F>(&self, coords: Coords, transform: F) -> DataArray
    where
        F: Fn(Array4<f32>) -> Result<Array4<f32>, ArrayError> + Send + Sync + 'static,
    {
        let parent = Arc::clone(&self.graph);

        DataArray {
            name: self.name.clone(),
            attrs: self.attrs.clone(),
            source: self.source.clone(),
            coords,
            graph: Arc::new(move || transform(parent()?)),
        }
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }

    pub fn rename(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn has_time(&self) -> bool {
        self.coords.time.is_some()
    }

    pub fn time_len(&self) -> usize {
        self.coords.time.as_ref().map_or(0, |t| t.len())
    }

    fn times(&self) -> Result<&Vec<NaiveDateTime>, ArrayError> {
        self.coords
            .time
            .as_ref()
            .ok_or_else(|| ArrayError::NoTime(self.name.clone()))
    }

    /// Selects exactly the requested timestamps, each of them must exist.
    pub fn sel_times(&self, times: &[NaiveDateTime]) -> Result<DataArray, ArrayError> {
        let own_times = self.times()?;
        let mut indices = Vec::with_capacity(times.len());

        for time in times {
            let index = own_times.iter().position(|t| t == time).ok_or_else(|| {
                ArrayError::MissingTimestamp(self.name.clone(), time.to_string())
            })?;
            indices.push(index);
        }

        let mut coords = self.coords.clone();
        coords.time = Some(times.to_vec());

        Ok(self.derive(coords, move |data| Ok(data.select(Axis(0), &indices))))
    }

    /// Selects those of requested timestamps which fall into the time span
    /// of this array. Every such timestamp must exist in the array.
    pub fn sel_requested_times(&self, times: &[NaiveDateTime]) -> Result<DataArray, ArrayError> {
        let own_times = self.times()?;

        let (first, last) = match (own_times.iter().min(), own_times.iter().max()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return Err(ArrayError::EmptySelection(self.name.clone())),
        };

        let requested: Vec<NaiveDateTime> = times
            .iter()
            .filter(|t| **t >= first && **t <= last)
            .copied()
            .collect();

        if requested.is_empty() {
            return Err(ArrayError::EmptySelection(self.name.clone()));
        }

        self.sel_times(&requested)
    }

    /// Selects a single timestamp and drops the time axis.
    pub fn sel_time_scalar(&self, time: NaiveDateTime) -> Result<DataArray, ArrayError> {
        self.sel_times(&[time])?.drop_time()
    }

    /// Takes the first timestep and drops the time axis.
    pub fn first_timestep(&self) -> Result<DataArray, ArrayError> {
        if !self.has_time() {
            return Ok(self.clone());
        }

        let first = self
            .times()?
            .first()
            .copied()
            .ok_or_else(|| ArrayError::EmptySelection(self.name.clone()))?;

        let mut coords = self.coords.clone();
        coords.time = Some(vec![first]);

        self.derive(coords, |data| Ok(data.slice(s![0..1, .., .., ..]).to_owned()))
            .drop_time()
    }

    /// Removes the time coordinate of array with a single timestep.
    pub fn drop_time(&self) -> Result<DataArray, ArrayError> {
        let length = self.times()?.len();

        if length != 1 {
            return Err(ArrayError::TimeLength(self.name.clone(), length, 1));
        }

        let mut array = self.clone();
        array.coords.time = None;
        Ok(array)
    }

    /// Broadcasts timeless array along provided timestamps.
    pub fn expand_time(&self, times: &[NaiveDateTime]) -> Result<DataArray, ArrayError> {
        if self.has_time() {
            return Err(ArrayError::HasTime(self.name.clone()));
        }

        let mut coords = self.coords.clone();
        coords.time = Some(times.to_vec());
        let count = times.len();

        Ok(self.derive(coords, move |data| {
            let views = vec![data.view(); count];
            concatenate(Axis(0), &views)
                .map_err(|err| ArrayError::Read("time broadcast".to_string(), err.to_string()))
        }))
    }

    /// Replaces time coordinate with another one of the same length.
    pub fn assign_time(&self, times: &[NaiveDateTime]) -> Result<DataArray, ArrayError> {
        let length = self.times()?.len();

        if length != times.len() {
            return Err(ArrayError::TimeLength(self.name.clone(), length, times.len()));
        }

        let mut array = self.clone();
        array.coords.time = Some(times.to_vec());
        Ok(array)
    }

    /// Concatenates another array after this one along time axis.
    pub fn concat_time(&self, other: &DataArray) -> Result<DataArray, ArrayError> {
        let own_times = self.times()?;
        let other_times = other.times()?;

        if !self.coords.same_grid(&other.coords) || !self.coords.same_levels(&other.coords) {
            return Err(ArrayError::Incompatible(self.name.clone(), other.name.clone()));
        }

        let mut coords = self.coords.clone();
        coords.time = Some([own_times.as_slice(), other_times.as_slice()].concat());

        let other_graph = Arc::clone(&other.graph);
        let names = (self.name.clone(), other.name.clone());

        Ok(self.derive(coords, move |data| {
            let other_data = other_graph()?;
            concatenate(Axis(0), &[data.view(), other_data.view()])
                .map_err(|_| ArrayError::Incompatible(names.0.clone(), names.1.clone()))
        }))
    }

    /// Takes the first level and drops the level coordinate.
    pub fn first_level(&self) -> DataArray {
        if self.coords.level.is_none() {
            return self.clone();
        }

        let mut coords = self.coords.clone();
        coords.level = None;

        self.derive(coords, |data| Ok(data.slice(s![.., 0..1, .., ..]).to_owned()))
    }

    /// Trims the array to the domain extent.
    ///
    /// Latitudes keep their original order. When the extent crosses
    /// the 0 meridian (west > east) longitudes east of `west` are placed
    /// before those west of `east`.
    pub fn sel_domain(&self, extent: &DomainExtent) -> Result<DataArray, ArrayError> {
        let lat_indices: Vec<usize> = self
            .coords
            .latitude
            .iter()
            .enumerate()
            .filter(|(_, lat)| **lat >= extent.south && **lat <= extent.north)
            .map(|(i, _)| i)
            .collect();

        let lons = &self.coords.longitude;
        let lon_indices: Vec<usize> = if extent.west <= extent.east {
            (0..lons.len())
                .filter(|&i| lons[i] >= extent.west && lons[i] <= extent.east)
                .collect()
        } else {
            let left_half = (0..lons.len()).filter(|&i| lons[i] >= extent.west);
            let right_half = (0..lons.len()).filter(|&i| lons[i] <= extent.east);
            left_half.chain(right_half).collect()
        };

        if lat_indices.is_empty() || lon_indices.is_empty() {
            return Err(ArrayError::EmptySelection(self.name.clone()));
        }

        if lat_indices.len() == self.coords.latitude.len()
            && lon_indices.iter().enumerate().all(|(n, i)| n == *i)
            && lon_indices.len() == lons.len()
        {
            return Ok(self.clone());
        }

        let mut coords = self.coords.clone();
        coords.latitude = lat_indices.iter().map(|&i| self.coords.latitude[i]).collect();
        coords.longitude = lon_indices.iter().map(|&i| lons[i]).collect();

        Ok(self.derive(coords, move |data| {
            Ok(data
                .select(Axis(2), &lat_indices)
                .select(Axis(3), &lon_indices))
        }))
    }

    /// Moves longitudes into the 0-360 range and sorts them ascending.
    pub fn normalise_longitude(&self) -> DataArray {
        let shifted: Vec<f64> = self
            .coords
            .longitude
            .iter()
            .map(|lon| lon.rem_euclid(360.0))
            .collect();

        let mut order: Vec<usize> = (0..shifted.len()).collect();
        order.sort_by(|a, b| shifted[*a].total_cmp(&shifted[*b]));

        if order.iter().enumerate().all(|(n, i)| n == *i) {
            let mut array = self.clone();
            array.coords.longitude = shifted;
            return array;
        }

        let mut coords = self.coords.clone();
        coords.longitude = order.iter().map(|&i| shifted[i]).collect();

        self.derive(coords, move |data| Ok(data.select(Axis(3), &order)))
    }

    /// Applies function to every value.
    pub fn map<F>(&self, function: F) -> DataArray
    where
        F: Fn(f32) -> f32 + Send + Sync + 'static,
    {
        self.derive(self.coords.clone(), move |data| Ok(data.mapv(&function)))
    }

    /// Array of zeros with the same coordinates and metadata.
    pub fn zeros_like(&self) -> DataArray {
        let mut array = self.clone();
        let shape = self.coords.shape();
        array.graph = Arc::new(move || Ok(Array4::zeros(shape)));
        array
    }

    /// Combines this array with another one of the same shape, weighting
    /// values with a timeless, single-level mask on the same grid.
    ///
    /// The closure receives (this value, other value, mask value).
    pub fn combine_with_mask<F>(
        &self,
        other: &DataArray,
        mask: &DataArray,
        function: F,
    ) -> Result<DataArray, ArrayError>
    where
        F: Fn(f32, f32, f32) -> f32 + Send + Sync + 'static,
    {
        if self.coords.shape() != other.coords.shape()
            || !self.coords.same_grid(&other.coords)
        {
            return Err(ArrayError::Incompatible(self.name.clone(), other.name.clone()));
        }

        let mask_shape = mask.coords.shape();
        if mask_shape[0] != 1 || mask_shape[1] != 1 || !mask.coords.same_grid(&self.coords) {
            return Err(ArrayError::Incompatible(self.name.clone(), mask.name.clone()));
        }

        let other_graph = Arc::clone(&other.graph);
        let mask_graph = Arc::clone(&mask.graph);
        let names = (self.name.clone(), mask.name.clone());

        Ok(self.derive(self.coords.clone(), move |mut data| {
            let other_data = other_graph()?;
            let mask_data = mask_graph()?;
            let mask_view = mask_data
                .broadcast(data.raw_dim())
                .ok_or_else(|| ArrayError::Incompatible(names.0.clone(), names.1.clone()))?;

            Zip::from(&mut data)
                .and(&other_data)
                .and(&mask_view)
                .for_each(|value, &other_value, &mask_value| {
                    *value = function(*value, other_value, mask_value)
                });

            Ok(data)
        }))
    }

    /// Applies a horizontal transformation to every (time, level) plane.
    /// The output grid is described by `latitude` and `longitude`.
    pub fn map_planes<F>(&self, latitude: Vec<f64>, longitude: Vec<f64>, function: F) -> DataArray
    where
        F: Fn(ArrayView2<f32>) -> Array2<f32> + Send + Sync + 'static,
    {
        let mut coords = self.coords.clone();
        coords.latitude = latitude;
        coords.longitude = longitude;
        let out_shape = coords.shape();

        self.derive(coords, move |data| {
            let levels = out_shape[1];

            // runs on the pool installed by the caller
            let planes: Vec<Array2<f32>> = (0..out_shape[0] * levels)
                .into_par_iter()
                .map(|i| function(data.slice(s![i / levels, i % levels, .., ..])))
                .collect();

            let mut output = Array4::<f32>::zeros(out_shape);
            for (i, plane) in planes.iter().enumerate() {
                output
                    .slice_mut(s![i / levels, i % levels, .., ..])
                    .assign(plane);
            }

            Ok(output)
        })
    }
}
