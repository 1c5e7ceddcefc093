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

//! Regridding with precomputed sparse weights stored
//! in ESMF/xESMF weight file format (`row`, `col` and `S` variables,
//! 1-based indices of flattened destination and source grids).

use crate::converter::array::{same_axis, Coords, DataArray};
use crate::errors::RegridError;
use log::debug;
use ndarray::{Array2, ArrayView2};
use std::{path::Path, sync::Arc};

/// Sparse weights regridder, flattened grids are indexed row-major
/// (longitude changes fastest).
#[derive(Clone, Debug)]
pub struct WeightFileRegridder {
    source: Coords,
    target: Coords,
    rows: Vec<usize>,
    cols: Vec<usize>,
    weights: Vec<f64>,
}

impl WeightFileRegridder {
    /// Reads the source (`n_a`) and destination (`n_b`) sizes of a weight file.
    pub fn file_dimensions(path: &Path) -> Result<(usize, usize), RegridError> {
        let file = netcdf::open(path)?;
        let dimension_len = |dim: &str| file.dimension(dim).map_or(0, |d| d.len());

        Ok((dimension_len("n_a"), dimension_len("n_b")))
    }

    /// Checks the sizes read from a weight file against both grids.
    pub fn check_dimensions(
        name: &str,
        dimensions: (usize, usize),
        source: (usize, usize),
        target: &Coords,
    ) -> Result<(), RegridError> {
        let source_size = source.0 * source.1;
        let target_size = target.latitude.len() * target.longitude.len();

        if dimensions != (source_size, target_size) {
            return Err(RegridError::WeightFileShape(
                name.to_string(),
                source_size,
                target_size,
                dimensions.0,
                dimensions.1,
            ));
        }

        Ok(())
    }

    /// Reads weights from file and checks that they match both grids.
    pub fn new_from_file(path: &Path, source: &Coords, target: &Coords) -> Result<Self, RegridError> {
        debug!("Reading regridding weights from {}", path.display());

        let name = path.display().to_string();
        let (n_a, n_b) = WeightFileRegridder::file_dimensions(path)?;

        let source_shape = (source.latitude.len(), source.longitude.len());
        WeightFileRegridder::check_dimensions(&name, (n_a, n_b), source_shape, target)?;

        let source_size = source_shape.0 * source_shape.1;
        let target_size = target.latitude.len() * target.longitude.len();

        let file = netcdf::open(path)?;

        let read_indices = |var: &str| -> Result<Vec<usize>, RegridError> {
            let variable = file.variable(var).ok_or_else(|| {
                RegridError::WeightFileShape(name.clone(), source_size, target_size, n_a, n_b)
            })?;
            let values = variable.get_values::<i64, _>(..)?;
            Ok(values.into_iter().map(|v| (v.max(1) - 1) as usize).collect())
        };

        let rows = read_indices("row")?;
        let cols = read_indices("col")?;
        let weights = file
            .variable("S")
            .ok_or_else(|| {
                RegridError::WeightFileShape(name.clone(), source_size, target_size, n_a, n_b)
            })?
            .get_values::<f64, _>(..)?;

        WeightFileRegridder::from_triplets(source, target, rows, cols, weights)
            .map_err(|_| RegridError::WeightFileShape(name, source_size, target_size, n_a, n_b))
    }

    /// Builds the regridder from 0-based (destination, source, weight) triplets.
    pub fn from_triplets(
        source: &Coords,
        target: &Coords,
        rows: Vec<usize>,
        cols: Vec<usize>,
        weights: Vec<f64>,
    ) -> Result<Self, RegridError> {
        let source_size = source.latitude.len() * source.longitude.len();
        let target_size = target.latitude.len() * target.longitude.len();

        let max_row = rows.iter().copied().max().unwrap_or(0);
        let max_col = cols.iter().copied().max().unwrap_or(0);

        if rows.len() != cols.len()
            || rows.len() != weights.len()
            || (!rows.is_empty() && (max_row >= target_size || max_col >= source_size))
        {
            return Err(RegridError::WeightFileShape(
                "weights".to_string(),
                source_size,
                target_size,
                max_col + 1,
                max_row + 1,
            ));
        }

        Ok(WeightFileRegridder {
            source: source.clone(),
            target: target.clone(),
            rows,
            cols,
            weights,
        })
    }

    /// Returns the array regridded onto the target grid.
    pub fn apply(&self, array: &DataArray) -> Result<DataArray, RegridError> {
        if !same_axis(&array.coords.latitude, &self.source.latitude)
            || !same_axis(&array.coords.longitude, &self.source.longitude)
        {
            return Err(RegridError::GridMismatch(array.name.clone()));
        }

        let regridder = Arc::new(self.clone());

        Ok(array.map_planes(
            self.target.latitude.clone(),
            self.target.longitude.clone(),
            move |plane| regridder.regrid_plane(plane),
        ))
    }

    fn regrid_plane(&self, plane: ArrayView2<f32>) -> Array2<f32> {
        let source_nx = self.source.longitude.len();
        let target_nx = self.target.longitude.len();

        let mut output =
            Array2::<f64>::from_elem((self.target.latitude.len(), target_nx), f64::NAN);

        for ((row, col), weight) in self.rows.iter().zip(&self.cols).zip(&self.weights) {
            let value = f64::from(plane[[col / source_nx, col % source_nx]]);
            let cell = &mut output[[row / target_nx, row % target_nx]];

            if cell.is_nan() {
                *cell = 0.0;
            }
            *cell += weight * value;
        }

        output.mapv(|v| v as f32)
    }
}
