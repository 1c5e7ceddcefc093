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

//! Module responsible for loading one month of requested fields.
//!
//! Catalogues are visited in the resolved order and each of them is asked
//! only for the fields that are still incomplete, so the first catalogue
//! providing a realm of a field wins.

use super::array::DataArray;
use super::catalogue::CatalogueHandle;
use super::context::Context;
use super::field::{Era5Field, Exclusivity, FieldKey, FieldSet, Realm};
use super::source;
use crate::errors::{FieldError, InputError};
use chrono::{Datelike, NaiveDateTime};
use indexmap::IndexMap;
use log::{debug, info, warn};
use std::path::Path;

/// Dataset group under which custom fields are registered.
const CUSTOM_FIELDS_DATASET: &str = "single-levels";

/// Creates empty fields for every requested variable.
/// Dynamic fields of all groups come first, static fields after them.
pub fn init_fields(ctx: &Context) -> Result<FieldSet, FieldError> {
    let requested = ctx.requested_fields()?;
    let static_fields = ctx.static_fields()?;

    let mut fields = FieldSet::new();

    for (dataset, names) in &requested {
        for name in names {
            if ctx.is_static(dataset, name)? {
                continue;
            }

            debug!("Initialise {} from {}", name, dataset);
            fields.insert(
                FieldKey::new(name, dataset),
                Era5Field::new(name, ctx.exclusivity(name)?),
            );
        }
    }

    for (dataset, names) in &static_fields {
        for name in names {
            debug!("Initialise static {} from {}", name, dataset);
            fields.insert(
                FieldKey::new(name, dataset),
                Era5Field::new(name, ctx.exclusivity(name)?),
            );
        }
    }

    Ok(fields)
}

/// Names of incomplete fields (optionally only of one dataset group)
/// together with their equivalent names.
pub fn remaining_list(
    fields: &FieldSet,
    dataset: Option<&str>,
    equivalents: &IndexMap<String, String>,
) -> Vec<String> {
    let mut remaining: Vec<String> = fields
        .iter()
        .filter(|(key, _)| dataset.map_or(true, |d| key.dataset == d))
        .filter(|(_, field)| !field.is_complete())
        .map(|(key, _)| key.name.clone())
        .collect();

    let equivalent: Vec<String> = equivalents
        .iter()
        .filter(|(name, _)| remaining.contains(name))
        .map(|(_, other)| other.clone())
        .collect();

    remaining.extend(equivalent);

    debug!("Fields remaining: {:?}", remaining);

    remaining
}

/// Loads all fields the catalogues can provide for the month starting at `month`.
pub fn load_month(
    ctx: &Context,
    catalogues: &[CatalogueHandle],
    month: NaiveDateTime,
) -> Result<FieldSet, FieldError> {
    let mut fields = init_fields(ctx)?;

    let equivalents = ctx.equivalent_vars()?;
    let inverse: IndexMap<&str, &str> = equivalents
        .iter()
        .map(|(name, other)| (other.as_str(), name.as_str()))
        .collect();

    let weight_file_mode = ctx.config.weight_file_mode()?;

    for handle in catalogues {
        let (name, catalogue, dataset) = match handle {
            CatalogueHandle::CustomFields { .. } => {
                info!("Handling custom fields");
                load_custom_fields(ctx, &mut fields)?;
                continue;
            }
            CatalogueHandle::Data {
                name,
                catalogue,
                dataset,
            } => (name, catalogue, dataset.as_deref()),
        };

        let remaining = remaining_list(&fields, dataset, &equivalents);
        if remaining.is_empty() {
            continue;
        }

        info!("Searching for remaining fields in {}", name);

        let found = catalogue.search(&remaining, month.year(), month.month());
        if found.is_empty() {
            debug!("Nothing found in {}", name);
            continue;
        }

        let mut files: IndexMap<(&str, &str), Vec<&Path>> = IndexMap::new();
        for entry in &found {
            files
                .entry((entry.parameter.as_str(), entry.variable()))
                .or_default()
                .push(entry.path.as_path());
        }

        let catalogue_realm: Realm = ctx
            .config
            .get_or(&format!("catalogue_flags.{}.realm", name), "global".to_string())?
            .parse()?;

        for ((parameter, variable), paths) in files {
            let array = match source::open_series(&paths, variable)? {
                Some(array) => array,
                None => {
                    warn!("{} is listed in {} but missing from its files", variable, name);
                    continue;
                }
            };

            let field_name = inverse.get(parameter).copied().unwrap_or(parameter);

            let array = match (&ctx.domain.buffered, weight_file_mode) {
                (Some(extent), false) => array.sel_domain(extent)?,
                _ => array,
            }
            .with_source(name);

            let realm = match ctx.exclusivity(field_name)? {
                Exclusivity::OceanOnly => Realm::OceanOnly,
                Exclusivity::LandOnly => Realm::LandOnly,
                Exclusivity::Unrestricted => catalogue_realm,
            };

            let field = match dataset {
                Some(dataset) => fields.get_mut(&FieldKey::new(field_name, dataset)),
                None => fields.values_mut().find(|f| f.name == field_name),
            }
            .ok_or_else(|| {
                FieldError::UnrequestedField(
                    field_name.to_string(),
                    dataset.unwrap_or(name).to_string(),
                )
            })?;

            if field.contains(realm) {
                debug!(
                    "{} on {} already provided, skipping the one from {}",
                    field_name, realm, name
                );
                continue;
            }

            debug!("{} from {} defined on {}", field_name, name, realm);
            field.add(array, realm)?;
        }
    }

    Ok(fields)
}

fn load_custom_fields(ctx: &Context, fields: &mut FieldSet) -> Result<(), FieldError> {
    for (field_name, file) in ctx.custom_fields()? {
        let array = handle_custom_field(ctx, &field_name, &file)?;

        let realm: Realm = ctx
            .config
            .get_or(
                &format!("custom_field_flags.{}", field_name),
                "global".to_string(),
            )?
            .parse()?;

        debug!("{} from {} defined on {}", field_name, file, realm);

        fields
            .get_mut(&FieldKey::new(&field_name, CUSTOM_FIELDS_DATASET))
            .ok_or_else(|| {
                FieldError::UnrequestedField(field_name.clone(), CUSTOM_FIELDS_DATASET.to_string())
            })?
            .add(array, realm)?;
    }

    Ok(())
}

/// Picks the variable of custom field file: the only one present,
/// or the one named as the field.
pub fn select_custom_variable(
    variables: &[String],
    field_name: &str,
    file: &str,
) -> Result<String, FieldError> {
    match variables {
        [] => Err(InputError::NoVariables(file.to_string()).into()),
        [only] => Ok(only.clone()),
        _ if variables.iter().any(|v| v == field_name) => Ok(field_name.to_string()),
        _ => Err(FieldError::AmbiguousCustomFile(
            file.to_string(),
            field_name.to_string(),
        )),
    }
}

/// Opens and validates user supplied field overriding catalogue data.
///
/// The file has to hold a single horizontal field with either one timestep
/// (which is dropped) or all requested timesteps, covering the output domain.
pub fn handle_custom_field(
    ctx: &Context,
    field_name: &str,
    file: &str,
) -> Result<DataArray, FieldError> {
    info!("Searching for custom field {} in {}", field_name, file);

    let path = Path::new(file);
    let variables = source::list_variables(path)?;
    let variable = select_custom_variable(&variables, field_name, file)?;

    let array = source::open_variable(path, &variable)?
        .ok_or_else(|| InputError::MissingVariable(variable.clone(), file.to_string()))?;

    let array = match array.time_len() {
        0 => array,
        1 => array.drop_time()?,
        _ => array
            .sel_times(&ctx.times)
            .map_err(|_| FieldError::CustomTimeCoverage(file.to_string()))?,
    };

    if array.coords.level.is_some() {
        return Err(FieldError::CustomLevels(field_name.to_string()));
    }

    let array = array.normalise_longitude();

    let array = match (&ctx.domain.buffered, ctx.config.weight_file_mode()?) {
        (Some(extent), false) => array.sel_domain(extent)?,
        _ => array,
    };

    if let Some(target) = &ctx.domain.target {
        if !target.is_covered_by(&array.coords.latitude, &array.coords.longitude) {
            return Err(FieldError::DomainNotCovered(
                describe_grid(&array),
                target.to_string(),
            ));
        }
    }

    Ok(array.with_source(file))
}

fn describe_grid(array: &DataArray) -> String {
    let bounds = |axis: &[f64]| {
        axis.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(*v), hi.max(*v))
        })
    };
    let (south, north) = bounds(&array.coords.latitude);
    let (west, east) = bounds(&array.coords.longitude);

    format!("({},{}) - ({},{})", south, west, north, east)
}

/// Fetches the first timestep of a single variable, from a file
/// (when `source` is an absolute path) or from the named catalogue.
pub fn get_single_field(
    ctx: &Context,
    catalogues: &[CatalogueHandle],
    name: &str,
    source: &str,
    time: NaiveDateTime,
) -> Result<Option<DataArray>, FieldError> {
    info!("Retrieving single field {} from {}", name, source);

    let array = if source.starts_with('/') {
        debug!("{} is a file", source);
        source::open_variable(Path::new(source), name)?
    } else {
        let catalogue = catalogues.iter().find_map(|handle| match handle {
            CatalogueHandle::Data {
                name: catalogue_name,
                catalogue,
                ..
            } if catalogue_name == source => Some(catalogue),
            _ => None,
        });

        let catalogue = match catalogue {
            Some(catalogue) => catalogue,
            None => {
                debug!("{} not found among catalogues", source);
                return Ok(None);
            }
        };

        match catalogue.search(&[name.to_string()], time.year(), time.month()).first() {
            Some(entry) => source::open_variable(&entry.path, entry.variable())?,
            None => None,
        }
    };

    let array = match array {
        Some(array) => array.first_timestep()?,
        None => {
            debug!("{} not found in {}", name, source);
            return Ok(None);
        }
    };

    let array = match &ctx.domain.buffered {
        Some(extent) => array.sel_domain(extent)?,
        None => array,
    };

    Ok(Some(array.with_source(source)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{init_fields, load_month, remaining_list, select_custom_variable};
    use crate::converter::array::DataArray;
    use crate::converter::catalogue::resolve_catalogues;
    use crate::converter::context::tests::context;
    use crate::converter::field::{FieldKey, Realm};
    use crate::errors::FieldError;
    use chrono::NaiveDate;
    use float_cmp::assert_approx_eq;
    use indexmap::IndexMap;
    use std::{fs, path::Path};

    /// Writes a (time, lat, lon) NetCDF variable filled with a constant.
    pub(crate) fn write_field(
        path: &Path,
        name: &str,
        hours: &[f64],
        latitude: &[f64],
        longitude: &[f64],
        value: f32,
    ) {
        let mut file = netcdf::create(path).unwrap();
        file.add_dimension("time", hours.len()).unwrap();
        file.add_dimension("latitude", latitude.len()).unwrap();
        file.add_dimension("longitude", longitude.len()).unwrap();

        {
            let mut time = file.add_variable::<f64>("time", &["time"]).unwrap();
            time.put_attribute("units", "hours since 2020-01-01 00:00:00").unwrap();
            time.put_values(hours, ..).unwrap();
        }
        {
            let mut lat = file.add_variable::<f64>("latitude", &["latitude"]).unwrap();
            lat.put_values(latitude, ..).unwrap();
        }
        {
            let mut lon = file.add_variable::<f64>("longitude", &["longitude"]).unwrap();
            lon.put_values(longitude, ..).unwrap();
        }

        let values = vec![value; hours.len() * latitude.len() * longitude.len()];
        let mut var = file
            .add_variable::<f32>(name, &["time", "latitude", "longitude"])
            .unwrap();
        var.put_values(&values, ..).unwrap();
    }

    #[test]
    fn field_order() {
        let ctx = context(
            "
start: 2020-01-01
fields:
  single-levels: [lsm, skt]
  pressure-levels: [t]
static:
  single-levels: [lsm]
land_only: [skt]
",
        );

        let fields = init_fields(&ctx).unwrap();
        let keys: Vec<&FieldKey> = fields.keys().collect();

        assert_eq!(
            keys,
            vec![
                &FieldKey::new("skt", "single-levels"),
                &FieldKey::new("t", "pressure-levels"),
                &FieldKey::new("lsm", "single-levels"),
            ]
        );
    }

    #[test]
    fn remaining_with_equivalents() {
        let ctx = context("start: 2020-01-01\nfields: {single-levels: [skt, sst], pressure-levels: [t]}");
        let mut fields = init_fields(&ctx).unwrap();

        let mut equivalents = IndexMap::new();
        equivalents.insert("sst".to_string(), "sstk".to_string());

        assert_eq!(
            remaining_list(&fields, Some("single-levels"), &equivalents),
            vec!["skt", "sst", "sstk"]
        );

        let array = DataArray::from_data(
            "skt",
            Default::default(),
            ndarray::Array4::zeros([1, 1, 0, 0]),
        )
        .unwrap();
        fields.values_mut().next().unwrap().add(array, Realm::Global).unwrap();

        assert_eq!(remaining_list(&fields, None, &IndexMap::new()), vec!["sst", "t"]);
    }

    #[test]
    fn custom_variable_selection() {
        let one = vec!["anything".to_string()];
        assert_eq!(select_custom_variable(&one, "sst", "f.nc").unwrap(), "anything");

        let many = vec!["a".to_string(), "sst".to_string(), "b".to_string()];
        assert_eq!(select_custom_variable(&many, "sst", "f.nc").unwrap(), "sst");

        let unrelated = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert!(matches!(
            select_custom_variable(&unrelated, "sst", "f.nc"),
            Err(FieldError::AmbiguousCustomFile(_, _))
        ));

        assert!(select_custom_variable(&[], "sst", "f.nc").is_err());
    }

    #[test]
    fn month_from_catalogues() {
        let dir = tempfile::tempdir().unwrap();
        let lat = [2.0, 1.0, 0.0];
        let lon = [0.0, 1.0, 2.0];

        write_field(&dir.path().join("skt_era5.nc"), "skt", &[0.0, 1.0], &lat, &lon, 280.0);
        write_field(&dir.path().join("skt_land.nc"), "skt", &[0.0, 1.0], &lat, &lon, 290.0);
        write_field(&dir.path().join("sst_era5.nc"), "sst", &[0.0, 1.0], &lat, &lon, 275.0);
        write_field(&dir.path().join("custom.nc"), "whatever", &[0.0], &lat, &lon, 1.0);

        fs::write(
            dir.path().join("index.yaml"),
            "sources:\n  era5: {path: era5.csv}\n  era5-land: {path: land.csv}\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("era5.csv"),
            "path,parameter,year,month,dataset\n\
             skt_era5.nc,skt,2020,1,single-levels\n\
             sst_era5.nc,sst,2020,1,single-levels\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("land.csv"),
            "path,parameter,year,month\nskt_land.nc,skt,2020,1\n",
        )
        .unwrap();

        let ctx = context(&format!(
            "
start: 2020-01-01 00:00
end: 2020-01-01 01:00
fields:
  single-levels: [skt, sst, ci]
catalogue_paths: [{index}]
catalogues: [era5-land, era5]
catalogue_flags:
  era5-land:
    realm: land_only
custom_fields:
  ci: {custom}
domain:
  latitude: [0.5, 1.5]
  longitude: [0.5, 1.5]
domain_buffer: 0.6
",
            index = dir.path().join("index.yaml").display(),
            custom = dir.path().join("custom.nc").display(),
        ));

        let catalogues = resolve_catalogues(&ctx).unwrap();
        let month = NaiveDate::from_ymd_opt(2020, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let fields = load_month(&ctx, &catalogues, month).unwrap();

        let skt = &fields[&FieldKey::new("skt", "single-levels")];
        let realms: Vec<(Realm, &str)> = skt.realms().map(|(r, a)| (r, a.source.as_str())).collect();
        assert_eq!(
            realms,
            vec![(Realm::LandOnly, "era5-land"), (Realm::Global, "era5")]
        );

        let sst = &fields[&FieldKey::new("sst", "single-levels")];
        let (_, sst) = sst.realms().next().unwrap();
        assert_eq!(sst.coords.latitude, vec![2.0, 1.0, 0.0]);
        assert_eq!(sst.time_len(), 2);
        assert_approx_eq!(f32, sst.compute().unwrap()[[1, 0, 1, 1]], 275.0);

        let ci = &fields[&FieldKey::new("ci", "single-levels")];
        let (realm, ci) = ci.realms().next().unwrap();
        assert_eq!(realm, Realm::Global);
        assert!(!ci.has_time());
        assert_eq!(ci.source, dir.path().join("custom.nc").display().to_string());
    }

    #[test]
    fn custom_field_must_cover_domain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.nc");
        write_field(&path, "ci", &[0.0], &[1.0, 0.0], &[0.0, 1.0], 1.0);

        let ctx = context(&format!(
            "
start: 2020-01-01
fields: {{single-levels: [ci]}}
custom_fields: {{ci: {}}}
domain: {{latitude: [-10, 10], longitude: [0, 10]}}
",
            path.display()
        ));

        let result = super::handle_custom_field(&ctx, "ci", &path.display().to_string());
        assert!(matches!(result, Err(FieldError::DomainNotCovered(_, _))));
    }

    #[test]
    fn custom_field_on_full_circle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("global.nc");
        let longitude: Vec<f64> = (0..1440).map(|i| f64::from(i) * 0.25).collect();
        write_field(&path, "ci", &[0.0], &[20.0, 10.0, 0.0, -10.0, -20.0], &longitude, 1.0);

        for domain in [
            "{latitude: [-10, 10], longitude: [-5, 5]}\npolar: true",
            "{latitude: [-10, 10]}",
            "{latitude: [-10, 10], longitude: [-180, 180]}",
        ] {
            let ctx = context(&format!(
                "
start: 2020-01-01
fields: {{single-levels: [ci]}}
custom_fields: {{ci: {}}}
domain: {}
",
                path.display(),
                domain
            ));

            let array = super::handle_custom_field(&ctx, "ci", &path.display().to_string()).unwrap();
            assert_eq!(array.coords.longitude.len(), 1440);
            assert!(!array.has_time());
        }
    }
}
