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

//! Module stitching monthly field sets into the output dataset.
//!
//! Months are concatenated along time and validated, then fields are
//! regridded, their realms composited with the land-sea mask and the
//! results annotated with GRIB metadata.

use super::array::DataArray;
use super::catalogue::CatalogueHandle;
use super::context::Context;
use super::dataset::Dataset;
use super::field::{FieldKey, FieldSet, MergeSettings, Realm};
use super::loader::get_single_field;
use super::metadata::Paramdb;
use super::regrid::handle_regridding;
use crate::errors::{ConvertError, FieldError};
use chrono::NaiveDateTime;
use indexmap::IndexMap;
use log::{debug, info, warn};

/// Dataset group of the land-sea mask field.
const LAND_MASK_DATASET: &str = "single-levels";

/// Concatenates per-month field sets (in month order) into one field set
/// covering the whole requested period.
///
/// The first month is the baseline: custom fields are taken from it only
/// (broadcast along time when timeless), static fields keep only the start
/// timestep, everything else is restricted to requested timesteps.
/// Later months must provide exactly the baseline realms.
pub fn merge_fields_in_time(
    ctx: &Context,
    months: IndexMap<NaiveDateTime, FieldSet>,
) -> Result<FieldSet, FieldError> {
    let start = ctx.start()?;
    let mut months = months.into_iter();

    let (first_month, baseline) = match months.next() {
        Some(first) => first,
        None => return Ok(FieldSet::new()),
    };

    let mut merged = FieldSet::new();

    for (key, field) in baseline {
        if field.is_empty() {
            return Err(FieldError::NotFound(key.to_string()));
        }

        if !field.is_complete() {
            warn!("Field {} is incomplete, only parts of the globe will be filled", key);
        }

        let mut target = field.empty_like();

        for (realm, array) in field.realms() {
            let array = if ctx.is_custom_source(&array.source)? {
                if array.has_time() {
                    array.clone()
                } else {
                    array.expand_time(&ctx.times)?
                }
            } else if ctx.is_static(&key.dataset, &key.name)? {
                array.sel_times(&[start])?
            } else {
                array.sel_requested_times(&ctx.times)?
            };

            target.add(array, realm)?;
        }

        merged.insert(key, target);
    }

    for (month, fields) in months {
        debug!("Concatenating fields of {}", month);

        for (key, field) in fields {
            let target = merged.get_mut(&key).ok_or_else(|| {
                FieldError::MissingFromBaseline(
                    key.to_string(),
                    month.to_string(),
                    first_month.to_string(),
                )
            })?;

            if ctx.is_static(&key.dataset, &key.name)? {
                continue;
            }

            let mut expected: Vec<Realm> = vec![];
            for (realm, array) in target.realms() {
                if !ctx.is_custom_source(&array.source)? {
                    expected.push(realm);
                }
            }

            for (realm, array) in field.realms() {
                if ctx.is_custom_source(&array.source)? {
                    continue;
                }

                if !target.contains(realm) {
                    return Err(FieldError::MissingFromBaseline(
                        format!("{} on {}", key, realm),
                        month.to_string(),
                        first_month.to_string(),
                    ));
                }

                target.concat(&array.sel_requested_times(&ctx.times)?, realm)?;
                expected.retain(|r| *r != realm);
            }

            if let Some(realm) = expected.first() {
                return Err(FieldError::MissingInMonth(
                    format!("{} on {}", key, realm),
                    month.to_string(),
                    first_month.to_string(),
                ));
            }
        }
    }

    validate_time_axes(ctx, &mut merged)?;

    Ok(merged)
}

/// Checks that all non-static fields share one time axis.
/// Custom fields of the right length are aligned to it.
pub fn validate_time_axes(ctx: &Context, fields: &mut FieldSet) -> Result<(), FieldError> {
    let mut reference: Option<Vec<NaiveDateTime>> = None;

    for (key, field) in fields.iter_mut() {
        if ctx.is_static(&key.dataset, &key.name)? {
            continue;
        }

        let arrays: Vec<(Realm, DataArray)> = field
            .realms()
            .map(|(realm, array)| (realm, array.clone()))
            .collect();

        for (realm, array) in arrays {
            let times = array.coords.time.clone().unwrap_or_default();

            if reference.is_none() {
                reference = Some(times);
                continue;
            }
            let reference = reference.as_deref().unwrap_or_default();

            if reference == times.as_slice() {
                continue;
            }

            if !ctx.is_custom_source(&array.source)? {
                return Err(FieldError::TimeMismatch(key.name.clone()));
            }

            if reference.len() != times.len() {
                return Err(FieldError::CustomTimeLength(
                    key.name.clone(),
                    reference.len(),
                    times.len(),
                ));
            }

            debug!("Aligning time of custom field {} to the remaining data", key);
            field.replace(array.assign_time(reference)?, realm)?;
        }
    }

    Ok(())
}

/// Finds the land-sea mask for compositing, if any field needs compositing.
///
/// The mask is reduced to its first timestep and first level.
pub fn retrieve_land_mask(
    ctx: &Context,
    catalogues: &[CatalogueHandle],
    fields: &FieldSet,
) -> Result<Option<DataArray>, FieldError> {
    if fields.values().all(|field| field.len() <= 1) {
        info!("No merging required");
        return Ok(None);
    }

    info!("Retrieving land mask for field merging");

    let masks: IndexMap<String, String> = ctx
        .config
        .get("land-mask")?
        .ok_or(FieldError::NoLandMaskConfigured)?;
    let regrid: Option<String> = ctx.config.get("regrid")?;

    let mask_name = match &regrid {
        Some(regrid) => masks.get(regrid),
        None => masks.values().next(),
    }
    .ok_or(FieldError::NoLandMaskConfigured)?;

    debug!("Using {} as land mask", mask_name);

    let loaded = fields
        .get(&FieldKey::new(mask_name, LAND_MASK_DATASET))
        .and_then(|field| field.realms().next().map(|(_, array)| array.clone()));

    let mask = match loaded {
        Some(mask) => Some(mask),
        None => {
            let source = match regrid {
                Some(regrid) => regrid,
                None => fields
                    .values()
                    .find_map(|field| field.realms().next().map(|(_, a)| a.source.clone()))
                    .ok_or(FieldError::LandMaskUnavailable)?,
            };

            get_single_field(ctx, catalogues, mask_name, &source, ctx.start()?)?
        }
    };

    match mask {
        Some(mask) => Ok(Some(mask.first_timestep()?.first_level())),
        None => Err(FieldError::LandMaskUnavailable),
    }
}

/// Turns per-month field sets into the output dataset.
pub fn combine(
    ctx: &Context,
    catalogues: &[CatalogueHandle],
    months: IndexMap<NaiveDateTime, FieldSet>,
) -> Result<Dataset, ConvertError> {
    let mut fields = merge_fields_in_time(ctx, months)?;
    handle_regridding(&mut fields, ctx, catalogues)?;

    let land_mask = retrieve_land_mask(ctx, catalogues, &fields)?;
    let tags: IndexMap<String, String> = ctx.config.get_or("dataset_tags", IndexMap::new())?;

    for (key, field) in fields.iter_mut() {
        let settings = MergeSettings {
            target: ctx.domain.target,
            tag: tags.get(&key.dataset).cloned(),
            is_static: ctx.is_static(&key.dataset, &key.name)?,
        };

        field.merge(land_mask.as_ref(), &settings)?;
    }

    let paramdb = Paramdb::new_from_config(&ctx.config)?;

    let variables = fields
        .values()
        .filter_map(|field| field.get_merged())
        .map(|merged| {
            let mut variable = merged.clone();
            variable.attrs.extend(paramdb.lookup(&variable.name));
            variable
        })
        .collect();

    Ok(Dataset::new(variables))
}
