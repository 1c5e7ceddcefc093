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

//! Run context shared (by reference) by all stages of the conversion.

use super::configuration::ConfigStore;
use super::domain::Domain;
use super::field::Exclusivity;
use crate::constants::DEFAULT_CUSTOM_CATALOGUE_KEY;
use crate::errors::ConfigError;
use chrono::NaiveDateTime;
use indexmap::IndexMap;
use log::debug;

/// Configuration together with values derived from it once per run.
#[derive(Clone, Debug)]
pub struct Context {
    pub config: ConfigStore,
    pub domain: Domain,
    /// All requested timestamps.
    pub times: Vec<NaiveDateTime>,
    /// First-of-month timestamps of all months touched by the run.
    pub months: Vec<NaiveDateTime>,
}

impl Context {
    pub fn new(config: ConfigStore) -> Result<Context, ConfigError> {
        let domain = Domain::new_from_config(&config)?;
        let times = config.get_time_range()?;
        let months = config.get_month_range()?;

        debug!("Requested {} timesteps in {} months", times.len(), months.len());

        Ok(Context {
            config,
            domain,
            times,
            months,
        })
    }

    pub fn start(&self) -> Result<NaiveDateTime, ConfigError> {
        self.config.start()
    }

    /// Requested variables per dataset group, in the configured order.
    pub fn requested_fields(&self) -> Result<IndexMap<String, Vec<String>>, ConfigError> {
        self.config.require("fields")
    }

    /// Time-invariant variables per dataset group.
    pub fn static_fields(&self) -> Result<IndexMap<String, Vec<String>>, ConfigError> {
        self.config.get_or("static", IndexMap::new())
    }

    pub fn is_static(&self, dataset: &str, name: &str) -> Result<bool, ConfigError> {
        Ok(self
            .static_fields()?
            .get(dataset)
            .map_or(false, |names| names.iter().any(|n| n == name)))
    }

    /// Override files of custom fields, keyed by field name.
    pub fn custom_fields(&self) -> Result<IndexMap<String, String>, ConfigError> {
        self.config.get_or("custom_fields", IndexMap::new())
    }

    pub fn is_custom_source(&self, source: &str) -> Result<bool, ConfigError> {
        Ok(self.custom_fields()?.values().any(|path| path == source))
    }

    /// Name of the placeholder catalogue marking where custom fields are processed.
    pub fn custom_catalogue_key(&self) -> Result<String, ConfigError> {
        self.config.get_or(
            "custom_field_catalogue_key",
            DEFAULT_CUSTOM_CATALOGUE_KEY.to_string(),
        )
    }

    /// Requested variable name to the name under which another source provides it.
    pub fn equivalent_vars(&self) -> Result<IndexMap<String, String>, ConfigError> {
        self.config.get_or("equivalent_vars", IndexMap::new())
    }

    /// Declared exclusivity of the variable.
    /// A variable listed as both ocean-only and land-only is ocean-only.
    pub fn exclusivity(&self, name: &str) -> Result<Exclusivity, ConfigError> {
        let name = name.to_string();

        if self.config.get_list("ocean_only")?.contains(&name) {
            return Ok(Exclusivity::OceanOnly);
        }

        if self.config.get_list("land_only")?.contains(&name) {
            return Ok(Exclusivity::LandOnly);
        }

        Ok(Exclusivity::Unrestricted)
    }
}
