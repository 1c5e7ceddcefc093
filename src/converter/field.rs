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

//! Module with the per-variable accumulator of realm contributions.
//!
//! A variable can be supplied by several sources, each covering
//! only a part of the globe (a realm): land points, ocean points or everything.
//! [`Era5Field`] keeps one array per realm, the regridder assigned to each of them
//! and, once realms have been composited, the merged result.

use super::array::DataArray;
use super::domain::DomainExtent;
use super::regrid::Regridder;
use crate::errors::{ArrayError, FieldError, RegridError};
use indexmap::IndexMap;
use log::debug;
use std::{fmt, str::FromStr};

/// Attributes describing on-disk encoding, not valid after decoding.
const ENCODING_ATTRIBUTES: [&str; 5] = [
    "_FillValue",
    "missing_value",
    "scale_factor",
    "add_offset",
    "dtype",
];

/// Part of the globe on which a contribution to the field is defined.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Realm {
    Global,
    LandOnly,
    OceanOnly,
}

impl Realm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Realm::Global => "global",
            Realm::LandOnly => "land_only",
            Realm::OceanOnly => "ocean_only",
        }
    }
}

impl FromStr for Realm {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(Realm::Global),
            "land_only" => Ok(Realm::LandOnly),
            "ocean_only" => Ok(Realm::OceanOnly),
            "subdomain" => Err(FieldError::UnsupportedRealm(s.to_string())),
            _ => Err(FieldError::InvalidRealm(s.to_string())),
        }
    }
}

impl fmt::Display for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one variable requested from one dataset group.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct FieldKey {
    pub name: String,
    pub dataset: String,
}

impl FieldKey {
    pub fn new(name: &str, dataset: &str) -> Self {
        FieldKey {
            name: name.to_string(),
            dataset: dataset.to_string(),
        }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.name, self.dataset)
    }
}

/// Declared exclusivity of the variable, from `land_only`
/// and `ocean_only` configuration lists.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum Exclusivity {
    #[default]
    Unrestricted,
    LandOnly,
    OceanOnly,
}

/// Field set of one month (or the whole run after temporal merge)
/// in the output order.
pub type FieldSet = IndexMap<FieldKey, Era5Field>;

/// Settings of the realm compositing for one field.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct MergeSettings {
    /// Output domain, the merged field is trimmed to it.
    pub target: Option<DomainExtent>,

    /// Suffix appended to the field name (`dataset_tags.<group>`).
    pub tag: Option<String>,

    /// Whether the field is declared static for its dataset group.
    pub is_static: bool,
}

/// Accumulator of realm contributions of one variable.
#[derive(Clone, Debug)]
pub struct Era5Field {
    pub name: String,
    exclusivity: Exclusivity,
    realms: IndexMap<Realm, DataArray>,
    regridders: IndexMap<Realm, Regridder>,
    merged: Option<DataArray>,
}

impl Era5Field {
    pub fn new(name: &str, exclusivity: Exclusivity) -> Self {
        Era5Field {
            name: name.to_string(),
            exclusivity,
            realms: IndexMap::new(),
            regridders: IndexMap::new(),
            merged: None,
        }
    }

    /// Empty field with the same name and exclusivity.
    pub fn empty_like(&self) -> Self {
        Era5Field::new(&self.name, self.exclusivity)
    }

    pub fn len(&self) -> usize {
        self.realms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.realms.is_empty()
    }

    pub fn contains(&self, realm: Realm) -> bool {
        self.realms.contains_key(&realm)
    }

    /// Realm contributions in insertion order.
    pub fn realms(&self) -> impl Iterator<Item = (Realm, &DataArray)> {
        self.realms.iter().map(|(realm, array)| (*realm, array))
    }

    /// Stores the contribution on a realm, with identity regridder.
    /// Each realm can be defined only once.
    pub fn add(&mut self, mut array: DataArray, realm: Realm) -> Result<(), FieldError> {
        if self.realms.contains_key(&realm) {
            return Err(FieldError::MultipleDefinition(
                self.name.clone(),
                realm.to_string(),
            ));
        }

        for attribute in ENCODING_ATTRIBUTES {
            array.attrs.shift_remove(attribute);
        }

        self.realms.insert(realm, array);
        self.regridders.insert(realm, Regridder::Identity);

        Ok(())
    }

    /// Replaces the array of already existing realm.
    pub fn replace(&mut self, array: DataArray, realm: Realm) -> Result<(), FieldError> {
        match self.realms.get_mut(&realm) {
            Some(existing) => {
                *existing = array;
                Ok(())
            }
            None => Err(FieldError::UnknownRealm(self.name.clone(), realm.to_string())),
        }
    }

    /// Appends data along time to already existing realm.
    pub fn concat(&mut self, array: &DataArray, realm: Realm) -> Result<(), FieldError> {
        let existing = self
            .realms
            .get_mut(&realm)
            .ok_or_else(|| FieldError::UnknownRealm(self.name.clone(), realm.to_string()))?;

        *existing = existing.concat_time(array)?;

        Ok(())
    }

    /// Checks if the collected realms cover everything the variable needs.
    pub fn is_complete(&self) -> bool {
        let has_land = self.contains(Realm::LandOnly);
        let has_ocean = self.contains(Realm::OceanOnly);

        if self.contains(Realm::Global) || (has_land && has_ocean) {
            return true;
        }

        match self.exclusivity {
            Exclusivity::LandOnly => has_land,
            Exclusivity::OceanOnly => has_ocean,
            Exclusivity::Unrestricted => false,
        }
    }

    pub fn set_regridder(&mut self, realm: Realm, regridder: Regridder) {
        self.regridders.insert(realm, regridder);
    }

    /// Applies the assigned regridder to every realm.
    ///
    /// Single timestep is dropped before regridding and restored afterwards.
    pub fn regrid(&mut self) -> Result<(), RegridError> {
        for (realm, array) in self.realms.iter_mut() {
            let regridder = match self.regridders.get(realm) {
                Some(Regridder::Identity) | None => continue,
                Some(regridder) => regridder,
            };

            debug!("Regridding {} on {}", self.name, realm);

            let single_time = match &array.coords.time {
                Some(times) if times.len() == 1 => Some(times.clone()),
                _ => None,
            };

            let input = match single_time {
                Some(_) => array.drop_time()?,
                None => array.clone(),
            };

            let mut regridded = regridder.apply(&input)?;

            if let Some(times) = single_time {
                regridded = regridded.expand_time(&times)?;
            }

            regridded.name = array.name.clone();
            regridded.attrs = array.attrs.clone();
            regridded.source = array.source.clone();

            *array = regridded;
        }

        Ok(())
    }

    /// Composites realm contributions into a single field.
    ///
    /// Realms are visited in reverse insertion order. Ocean-only data is weighted
    /// with `1 - mask`, land-only data with `mask`, global data replaces everything
    /// visited before it. When the running composite has not been weighted yet
    /// (it came from a global realm) it is weighted complementarily to the new
    /// contribution.
    ///
    /// A field with only one realm is just trimmed and (optionally) renamed.
    pub fn merge(
        &mut self,
        land_mask: Option<&DataArray>,
        settings: &MergeSettings,
    ) -> Result<(), FieldError> {
        let trim = |array: &DataArray| -> Result<DataArray, ArrayError> {
            match &settings.target {
                Some(extent) => array.sel_domain(extent),
                None => Ok(array.clone()),
            }
        };

        let tagged_name = |name: &str| match &settings.tag {
            Some(tag) if !settings.is_static => format!("{}_{}", name, tag),
            _ => name.to_string(),
        };

        if self.realms.len() == 1 {
            if let Some(array) = self.realms.values().next() {
                let merged = trim(array)?;
                let name = tagged_name(&merged.name);
                self.merged = Some(merged.rename(&name));
            }
            return Ok(());
        }

        let land_mask = land_mask.ok_or_else(|| FieldError::MaskRequired(self.name.clone()))?;
        let mask = trim(land_mask)?;

        let mut composite: Option<DataArray> = None;
        let mut prev_weighted = true;

        for (realm, array) in self.realms.iter().rev() {
            let array = trim(array)?;
            let current = composite.unwrap_or_else(|| array.zeros_like());

            composite = Some(match realm {
                Realm::OceanOnly => {
                    let merged = if prev_weighted {
                        current.combine_with_mask(&array, &mask, |acc, v, m| acc + v * (1.0 - m))?
                    } else {
                        current.combine_with_mask(&array, &mask, |acc, v, m| acc * m + v * (1.0 - m))?
                    };
                    prev_weighted = true;
                    merged
                }
                Realm::LandOnly => {
                    let merged = if prev_weighted {
                        current.combine_with_mask(&array, &mask, |acc, v, m| acc + v * m)?
                    } else {
                        current.combine_with_mask(&array, &mask, |acc, v, m| acc * (1.0 - m) + v * m)?
                    };
                    prev_weighted = true;
                    merged
                }
                Realm::Global => {
                    prev_weighted = false;
                    array
                }
            });
        }

        if let Some(merged) = composite {
            let name = tagged_name(&self.name);
            self.merged = Some(merged.rename(&name));
        }

        Ok(())
    }

    pub fn get_merged(&self) -> Option<&DataArray> {
        self.merged.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::{Era5Field, Exclusivity, MergeSettings, Realm};
    use crate::converter::array::{AttrValue, Coords, DataArray};
    use crate::errors::FieldError;
    use chrono::NaiveDate;
    use float_cmp::assert_approx_eq;
    use ndarray::Array4;

    fn constant(name: &str, value: f32) -> DataArray {
        let coords = Coords {
            time: Some(vec![NaiveDate::from_ymd_opt(2020, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()]),
            level: None,
            latitude: vec![1.0, 0.0],
            longitude: vec![0.0, 1.0],
        };
        DataArray::from_data(name, coords, Array4::from_elem((1, 1, 2, 2), value)).unwrap()
    }

    fn mask(values: [f32; 4]) -> DataArray {
        let coords = Coords {
            time: None,
            level: None,
            latitude: vec![1.0, 0.0],
            longitude: vec![0.0, 1.0],
        };
        let data = Array4::from_shape_vec((1, 1, 2, 2), values.to_vec()).unwrap();
        DataArray::from_data("lsm", coords, data).unwrap()
    }

    #[test]
    fn realm_parsing() {
        assert_eq!("land_only".parse::<Realm>().unwrap(), Realm::LandOnly);
        assert!(matches!(
            "subdomain".parse::<Realm>(),
            Err(FieldError::UnsupportedRealm(_))
        ));
        assert!(matches!(
            "sea".parse::<Realm>(),
            Err(FieldError::InvalidRealm(_))
        ));
    }

    #[test]
    fn completeness() {
        let mut field = Era5Field::new("skt", Exclusivity::Unrestricted);
        assert!(!field.is_complete());
        field.add(constant("skt", 1.0), Realm::LandOnly).unwrap();
        assert!(!field.is_complete());
        field.add(constant("skt", 2.0), Realm::OceanOnly).unwrap();
        assert!(field.is_complete());

        let mut field = Era5Field::new("swvl1", Exclusivity::LandOnly);
        field.add(constant("swvl1", 1.0), Realm::LandOnly).unwrap();
        assert!(field.is_complete());

        let mut field = Era5Field::new("sst", Exclusivity::OceanOnly);
        field.add(constant("sst", 1.0), Realm::LandOnly).unwrap();
        assert!(!field.is_complete());

        let mut field = Era5Field::new("z", Exclusivity::LandOnly);
        field.add(constant("z", 1.0), Realm::Global).unwrap();
        assert!(field.is_complete());
    }

    #[test]
    fn realm_defined_once() {
        let mut field = Era5Field::new("skt", Exclusivity::Unrestricted);
        field.add(constant("skt", 1.0), Realm::Global).unwrap();
        assert!(matches!(
            field.add(constant("skt", 1.0), Realm::Global),
            Err(FieldError::MultipleDefinition(_, _))
        ));
    }

    #[test]
    fn encoding_is_reset() {
        let mut array = constant("skt", 1.0);
        array.attrs.insert("scale_factor".to_string(), AttrValue::Float(0.5));
        array.attrs.insert("units".to_string(), AttrValue::Str("K".to_string()));

        let mut field = Era5Field::new("skt", Exclusivity::Unrestricted);
        field.add(array, Realm::Global).unwrap();

        let (_, stored) = field.realms().next().unwrap();
        assert!(!stored.attrs.contains_key("scale_factor"));
        assert!(stored.attrs.contains_key("units"));
    }

    #[test]
    fn concat_requires_existing_realm() {
        let mut field = Era5Field::new("skt", Exclusivity::Unrestricted);
        field.add(constant("skt", 1.0), Realm::Global).unwrap();

        assert!(matches!(
            field.concat(&constant("skt", 1.0), Realm::OceanOnly),
            Err(FieldError::UnknownRealm(_, _))
        ));
    }

    #[test]
    fn land_ocean_merge_is_order_independent() {
        let lsm = mask([1.0, 0.0, 0.25, 0.5]);
        let settings = MergeSettings::default();

        for land_first in [true, false] {
            let mut field = Era5Field::new("skt", Exclusivity::Unrestricted);
            if land_first {
                field.add(constant("skt", 10.0), Realm::LandOnly).unwrap();
                field.add(constant("skt", 2.0), Realm::OceanOnly).unwrap();
            } else {
                field.add(constant("skt", 2.0), Realm::OceanOnly).unwrap();
                field.add(constant("skt", 10.0), Realm::LandOnly).unwrap();
            }

            field.merge(Some(&lsm), &settings).unwrap();
            let data = field.get_merged().unwrap().compute().unwrap();

            assert_approx_eq!(f32, data[[0, 0, 0, 0]], 10.0);
            assert_approx_eq!(f32, data[[0, 0, 0, 1]], 2.0);
            assert_approx_eq!(f32, data[[0, 0, 1, 0]], 4.0);
            assert_approx_eq!(f32, data[[0, 0, 1, 1]], 6.0);
        }
    }

    #[test]
    fn global_realm_is_blended_under_earlier_realms() {
        let lsm = mask([1.0, 0.0, 1.0, 0.0]);
        let mut field = Era5Field::new("skt", Exclusivity::Unrestricted);
        field.add(constant("skt", 10.0), Realm::LandOnly).unwrap();
        field.add(constant("skt", 3.0), Realm::Global).unwrap();

        field.merge(Some(&lsm), &MergeSettings::default()).unwrap();
        let data = field.get_merged().unwrap().compute().unwrap();

        assert_approx_eq!(f32, data[[0, 0, 0, 0]], 10.0);
        assert_approx_eq!(f32, data[[0, 0, 0, 1]], 3.0);

        let mut field = Era5Field::new("skt", Exclusivity::Unrestricted);
        field.add(constant("skt", 3.0), Realm::Global).unwrap();
        field.add(constant("skt", 10.0), Realm::LandOnly).unwrap();

        field.merge(Some(&lsm), &MergeSettings::default()).unwrap();
        let data = field.get_merged().unwrap().compute().unwrap();

        assert_approx_eq!(f32, data[[0, 0, 0, 0]], 3.0);
        assert_approx_eq!(f32, data[[0, 0, 0, 1]], 3.0);
    }

    #[test]
    fn single_realm_passes_through() {
        let mut field = Era5Field::new("skt", Exclusivity::Unrestricted);
        field.add(constant("skt", 7.5), Realm::OceanOnly).unwrap();

        let settings = MergeSettings {
            target: None,
            tag: Some("surf".to_string()),
            is_static: false,
        };
        field.merge(None, &settings).unwrap();

        let merged = field.get_merged().unwrap();
        assert_eq!(merged.name, "skt_surf");
        let data = merged.compute().unwrap();
        assert!(data.iter().all(|v| *v == 7.5));

        let mut field = Era5Field::new("z", Exclusivity::Unrestricted);
        field.add(constant("z", 1.0), Realm::Global).unwrap();
        let settings = MergeSettings {
            is_static: true,
            ..settings
        };
        field.merge(None, &settings).unwrap();
        assert_eq!(field.get_merged().unwrap().name, "z");
    }

    #[test]
    fn merge_requires_mask() {
        let mut field = Era5Field::new("skt", Exclusivity::Unrestricted);
        field.add(constant("skt", 1.0), Realm::LandOnly).unwrap();
        field.add(constant("skt", 1.0), Realm::OceanOnly).unwrap();

        assert!(matches!(
            field.merge(None, &MergeSettings::default()),
            Err(FieldError::MaskRequired(_))
        ));
    }
}
