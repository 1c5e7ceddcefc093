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

//! Finished set of output variables handed over to the writers.

use super::array::DataArray;
use chrono::NaiveDateTime;

#[derive(Clone, Debug, Default)]
pub struct Dataset {
    pub variables: Vec<DataArray>,
}

impl Dataset {
    pub fn new(variables: Vec<DataArray>) -> Self {
        Dataset { variables }
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Source shared by all variables, if there is one.
    pub fn common_source(&self) -> Option<&str> {
        let first = self.variables.first()?.source.as_str();

        if self.variables.iter().all(|v| v.source == first) {
            Some(first)
        } else {
            None
        }
    }

    /// Longest time axis among the variables.
    pub fn time_axis(&self) -> Vec<NaiveDateTime> {
        self.variables
            .iter()
            .filter_map(|v| v.coords.time.as_ref())
            .max_by_key(|t| t.len())
            .cloned()
            .unwrap_or_default()
    }

    /// Levels of the first variable that has them.
    pub fn level_axis(&self) -> Option<&Vec<f64>> {
        self.variables.iter().find_map(|v| v.coords.level.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::Dataset;
    use crate::converter::array::{Coords, DataArray};
    use chrono::NaiveDate;
    use ndarray::Array4;

    fn variable(name: &str, source: &str, hours: u32) -> DataArray {
        let day = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let coords = Coords {
            time: Some((0..hours).map(|h| day.and_hms_opt(h, 0, 0).unwrap()).collect()),
            level: None,
            latitude: vec![0.0],
            longitude: vec![0.0],
        };
        let shape = coords.shape();
        DataArray::from_data(name, coords, Array4::zeros(shape))
            .unwrap()
            .with_source(source)
    }

    #[test]
    fn shared_axes() {
        let dataset = Dataset::new(vec![variable("skt", "era5", 3), variable("lsm", "era5", 1)]);
        assert_eq!(dataset.common_source(), Some("era5"));
        assert_eq!(dataset.time_axis().len(), 3);
        assert!(dataset.level_axis().is_none());

        let mixed = Dataset::new(vec![variable("skt", "era5", 3), variable("sst", "/data/sst.nc", 3)]);
        assert_eq!(mixed.common_source(), None);
        assert!(Dataset::default().is_empty());
    }
}
