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

//! Module handling the output domain and its buffered superset
//! used to trim input data before any heavy processing.
//!
//! All longitudes are kept in the `0..360` convention of ERA5 data.

use super::configuration::ConfigStore;
use crate::constants::FULL_CIRCLE_EAST;
use crate::errors::ConfigError;
use log::{info, warn};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Geographical extent of the domain, in degrees.
///
/// When `west > east` the extent crosses the 0 meridian.
#[derive(Copy, Clone, PartialEq, PartialOrd, Debug)]
pub struct DomainExtent {
    pub north: f64,
    pub south: f64,
    pub west: f64,
    pub east: f64,
}

impl DomainExtent {
    /// Extent covering the whole globe.
    pub fn global() -> Self {
        DomainExtent {
            north: 90.0,
            south: -90.0,
            west: 0.0,
            east: FULL_CIRCLE_EAST,
        }
    }

    /// Checks if the extent spans the whole longitude circle.
    pub fn is_full_circle(&self) -> bool {
        self.west <= self.east && self.east - self.west >= FULL_CIRCLE_EAST
    }

    /// Extent widened by `buffer` degrees on each side.
    pub fn buffered(&self, buffer: f64) -> Self {
        let north = (self.north + buffer).min(90.0);
        let south = (self.south - buffer).max(-90.0);

        let span = if self.west <= self.east {
            self.east - self.west
        } else {
            self.east + 360.0 - self.west
        };

        if span + 2.0 * buffer >= 360.0 {
            return DomainExtent {
                north,
                south,
                west: 0.0,
                east: FULL_CIRCLE_EAST,
            };
        }

        DomainExtent {
            north,
            south,
            west: convert_to_grib_longitudes(self.west - buffer),
            east: (self.east + buffer) % 360.0,
        }
    }

    /// Checks if a grid spanning provided coordinates contains the whole extent.
    pub fn is_covered_by(&self, latitude: &[f64], longitude: &[f64]) -> bool {
        let (lat_min, lat_max) = min_max(latitude);
        let (lon_min, lon_max) = min_max(longitude);

        if lat_min > self.south || lat_max < self.north {
            return false;
        }

        if self.is_full_circle() {
            return wraps_around(longitude);
        }

        if self.west <= self.east {
            return lon_min <= self.west && lon_max >= self.east;
        }

        // crossing the 0 meridian, each side has to be covered separately
        let eastern: Vec<f64> = longitude.iter().copied().filter(|l| *l < 180.0).collect();
        let western: Vec<f64> = longitude.iter().copied().filter(|l| *l >= 180.0).collect();

        min_max(&western).0 <= self.west && min_max(&eastern).1 >= self.east
    }
}

impl std::fmt::Display for DomainExtent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({:.2},{:.2}) - ({:.2},{:.2})",
            self.south, self.west, self.north, self.east
        )
    }
}

/// Output domain and its buffered superset.
///
/// `None` means that data is not trimmed at all.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Domain {
    pub target: Option<DomainExtent>,
    pub buffered: Option<DomainExtent>,
}

/// Domain as written in the configuration file.
#[derive(Clone, PartialEq, Debug, Deserialize)]
struct DomainConfig {
    /// Latitude bounds in any order.
    latitude: Option<(f64, f64)>,

    /// Longitude bounds from west to east, in any convention.
    longitude: Option<(f64, f64)>,

    /// WRF geogrid file (e.g. `geo_em.d01.nc`) from which the domain is read.
    geo_file: Option<PathBuf>,
}

impl Domain {
    /// Domain covering the whole globe, no trimming applied.
    pub fn global() -> Self {
        Domain {
            target: None,
            buffered: None,
        }
    }

    /// Reads the domain from configuration.
    ///
    /// With `polar: true` the full longitude circle is always used.
    pub fn new_from_config(config: &ConfigStore) -> Result<Domain, ConfigError> {
        let domain_config: Option<DomainConfig> = config.get("domain")?;
        let polar: bool = config.get_or("polar", false)?;
        let buffer = config.domain_buffer()?;

        let mut target = match domain_config {
            Some(DomainConfig {
                geo_file: Some(geo_file),
                ..
            }) => read_geogrid_extent(&geo_file)?,
            Some(DomainConfig {
                latitude: Some(latitude),
                longitude,
                ..
            }) => {
                let (west, east) = match longitude {
                    Some((west, east)) if (east - west).abs() >= 360.0 => (0.0, FULL_CIRCLE_EAST),
                    Some((west, east)) => {
                        (convert_to_grib_longitudes(west), convert_to_grib_longitudes(east))
                    }
                    None => (0.0, FULL_CIRCLE_EAST),
                };
                DomainExtent {
                    north: latitude.0.max(latitude.1),
                    south: latitude.0.min(latitude.1),
                    west,
                    east,
                }
            }
            _ => {
                warn!("Outputting the global domain - set domain.latitude and domain.longitude or domain.geo_file to restrict to limited area");
                return Ok(Domain::global());
            }
        };

        check_extent(&target)?;

        if polar {
            target.west = 0.0;
            target.east = FULL_CIRCLE_EAST;
        }

        info!("Latitudes: Target ({:.2}:{:.2})", target.south, target.north);
        info!("Longitudes: Target ({:.2}:{:.2})", target.west, target.east);

        Ok(Domain {
            target: Some(target),
            buffered: Some(target.buffered(buffer)),
        })
    }
}

/// Converts the longitude to the convention used by ERA5 data (`0..360`).
pub fn convert_to_grib_longitudes(longitude: f64) -> f64 {
    if longitude < 0.0 {
        return 360.0 + longitude;
    }

    longitude
}

fn check_extent(extent: &DomainExtent) -> Result<(), ConfigError> {
    if !(-90.0..=90.0).contains(&extent.south) || !(-90.0..=90.0).contains(&extent.north) {
        return Err(ConfigError::OutOfBounds(
            "Domain latitude is too low or too high",
        ));
    }

    if !(0.0..=360.0).contains(&extent.west) || !(0.0..=360.0).contains(&extent.east) {
        return Err(ConfigError::OutOfBounds(
            "Domain longitude must be within -180 and 360 degrees",
        ));
    }

    Ok(())
}

/// Checks if longitudes close the circle: the gap between the last
/// and the first longitude is not wider than the grid spacing.
fn wraps_around(longitude: &[f64]) -> bool {
    let mut sorted: Vec<f64> = longitude.iter().map(|l| l.rem_euclid(360.0)).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let (first, last) = match (sorted.first(), sorted.last()) {
        (Some(first), Some(last)) if sorted.len() > 1 => (*first, *last),
        _ => return false,
    };

    let spacing = sorted
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .fold(0.0, f64::max);

    first + 360.0 - last <= spacing + 1e-6
}

fn min_max(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(*v), hi.max(*v))
        })
}

/// Reads the extent of WRF domain from `XLAT_M` and `XLONG_M` variables of geogrid file.
fn read_geogrid_extent(geo_file: &Path) -> Result<DomainExtent, ConfigError> {
    info!("Reading domain from {}", geo_file.display());

    let file = netcdf::open(geo_file)?;

    let read = |name: &str| -> Result<Vec<f64>, ConfigError> {
        let variable = file
            .variable(name)
            .ok_or_else(|| ConfigError::MissingKey(format!("{} in {}", name, geo_file.display())))?;
        Ok(variable.get_values::<f64, _>(..)?)
    };

    let lats = read("XLAT_M")?;
    let lons: Vec<f64> = read("XLONG_M")?
        .into_iter()
        .map(convert_to_grib_longitudes)
        .collect();

    let (south, north) = min_max(&lats);
    let (west, east) = min_max(&lons);

    if !south.is_finite() || !west.is_finite() {
        return Err(ConfigError::OutOfBounds("Geogrid file contains no coordinates"));
    }

    Ok(DomainExtent {
        north,
        south,
        west,
        east,
    })
}
