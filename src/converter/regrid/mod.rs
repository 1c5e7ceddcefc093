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

//! Module responsible for bringing all loaded fields onto a common horizontal grid.
//!
//! Every source (catalogue or custom file) gets one [`Regridder`].
//! Sources already on the target grid get [`Regridder::Identity`],
//! sources sharing a grid share a regridder.

pub mod bilinear;
pub mod bisection;
pub mod weights;

use self::bilinear::InterpolatingRegridder;
use self::weights::WeightFileRegridder;
use super::array::{Coords, DataArray};
use super::catalogue::CatalogueHandle;
use super::context::Context;
use super::field::FieldSet;
use super::loader::get_single_field;
use crate::constants::WEIGHT_FILE_SOURCE_SHAPE;
use crate::errors::{FieldError, RegridError};
use indexmap::IndexMap;
use log::{debug, info, warn};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// Transformation of an array onto the target grid.
#[derive(Clone, Debug)]
pub enum Regridder {
    Identity,
    Interpolating(Arc<InterpolatingRegridder>),
    WeightFile(Arc<WeightFileRegridder>),
}

impl Regridder {
    pub fn apply(&self, array: &DataArray) -> Result<DataArray, RegridError> {
        match self {
            Regridder::Identity => Ok(array.clone()),
            Regridder::Interpolating(regridder) => regridder.apply(array),
            Regridder::WeightFile(regridder) => regridder.apply(array),
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Regridder::Identity)
    }
}

/// Horizontal grid of every source present in the field set,
/// in order of first appearance.
pub fn source_grids(fields: &FieldSet) -> IndexMap<String, Coords> {
    let mut grids = IndexMap::new();

    for field in fields.values() {
        for (_, array) in field.realms() {
            grids.entry(array.source.clone()).or_insert_with(|| Coords {
                time: None,
                level: None,
                latitude: array.coords.latitude.clone(),
                longitude: array.coords.longitude.clone(),
            });
        }
    }

    grids
}

/// Picks a regridder for every source grid.
///
/// Grids equal to the target get the identity, grids equal to a grid
/// that already has a regridder reuse it, the rest are passed to `build`.
pub fn select_regridders<F>(
    grids: &IndexMap<String, Coords>,
    target: &Coords,
    mut build: F,
) -> Result<IndexMap<String, Regridder>, RegridError>
where
    F: FnMut(&str, &Coords) -> Result<Regridder, RegridError>,
{
    let mut regridders: IndexMap<String, Regridder> = IndexMap::new();

    for (source, grid) in grids {
        if grid.same_grid(target) {
            regridders.insert(source.clone(), Regridder::Identity);
            continue;
        }

        let reused = regridders
            .iter()
            .filter(|(_, regridder)| !regridder.is_identity())
            .find(|(other, _)| grids.get(*other).map_or(false, |g| g.same_grid(grid)))
            .map(|(other, regridder)| (other.clone(), regridder.clone()));

        let regridder = match reused {
            Some((other, regridder)) => {
                debug!("Reusing regridder of {} for {}", other, source);
                regridder
            }
            None => {
                debug!("Building regridder for {}", source);
                build(source, grid)?
            }
        };

        regridders.insert(source.clone(), regridder);
    }

    Ok(regridders)
}

/// Resolves the target grid and regrids every realm of every field onto it.
pub fn handle_regridding(
    fields: &mut FieldSet,
    ctx: &Context,
    catalogues: &[CatalogueHandle],
) -> Result<(), FieldError> {
    let grids = source_grids(fields);

    let first_source = match grids.keys().next() {
        Some(source) => source.clone(),
        None => return Ok(()),
    };

    let target_source = match ctx.config.get::<String>("regrid")? {
        Some(target) => target,
        None => {
            if let Some(message) = missing_target_warning(&grids) {
                warn!("{}", message);
            }
            first_source
        }
    };

    let target = match grids.get(&target_source) {
        Some(grid) => grid.clone(),
        None => resolve_unloaded_target(ctx, catalogues, &target_source)?,
    };

    info!(
        "Regridding to grid of {} ({}x{})",
        target_source,
        target.latitude.len(),
        target.longitude.len()
    );

    let weight_file = if ctx.config.weight_file_mode()? {
        let path = ctx.config.require::<PathBuf>("regrid_params.weight_file")?;
        check_weight_file(&path, &grids, &target)?;
        Some(path)
    } else {
        None
    };

    let regridders = select_regridders(&grids, &target, |_, grid| match &weight_file {
        Some(path) => Ok(Regridder::WeightFile(Arc::new(
            WeightFileRegridder::new_from_file(path, grid, &target)?,
        ))),
        None => Ok(Regridder::Interpolating(Arc::new(
            InterpolatingRegridder::new(grid, &target)?,
        ))),
    })?;

    for field in fields.values_mut() {
        let assignments: Vec<_> = field
            .realms()
            .filter_map(|(realm, array)| {
                regridders
                    .get(&array.source)
                    .map(|regridder| (realm, regridder.clone()))
            })
            .collect();

        for (realm, regridder) in assignments {
            field.set_regridder(realm, regridder);
        }

        field.regrid()?;
    }

    Ok(())
}

/// Message logged when fields come from several sources
/// and the first one is used as the regrid target.
fn missing_target_warning(grids: &IndexMap<String, Coords>) -> Option<String> {
    match grids.keys().next() {
        Some(first) if grids.len() > 1 => Some(format!(
            "Fields come from multiple sources but regrid target is not set, using {}",
            first
        )),
        _ => None,
    }
}

/// Checks every grid that needs regridding and the weight file sizes
/// before any weights are read.
fn check_weight_file(
    path: &Path,
    grids: &IndexMap<String, Coords>,
    target: &Coords,
) -> Result<(), RegridError> {
    let mut regridded = grids.iter().filter(|(_, grid)| !grid.same_grid(target)).peekable();

    if regridded.peek().is_none() {
        return Ok(());
    }

    for (source, grid) in regridded {
        let shape = (grid.latitude.len(), grid.longitude.len());
        if shape != WEIGHT_FILE_SOURCE_SHAPE {
            return Err(RegridError::UnsupportedWeightGrid(
                WEIGHT_FILE_SOURCE_SHAPE.0,
                WEIGHT_FILE_SOURCE_SHAPE.1,
                source.to_string(),
                shape.0,
                shape.1,
            ));
        }
    }

    let dimensions = WeightFileRegridder::file_dimensions(path)?;
    WeightFileRegridder::check_dimensions(
        &path.display().to_string(),
        dimensions,
        WEIGHT_FILE_SOURCE_SHAPE,
        target,
    )
}

/// Reads the grid of the regrid target that has no loaded fields,
/// using the configured reference field and date.
fn resolve_unloaded_target(
    ctx: &Context,
    catalogues: &[CatalogueHandle],
    target_source: &str,
) -> Result<Coords, FieldError> {
    let ref_field = ctx.config.get::<String>("regrid_params.ref_field")?;
    let ref_date = ctx.config.get_timestamp("regrid_params.ref_date")?;

    let (ref_field, ref_date) = match (ref_field, ref_date) {
        (Some(field), Some(date)) => (field, date),
        _ => return Err(RegridError::NoReferenceParams.into()),
    };

    debug!(
        "Reading {} from {} on {} to establish the target grid",
        ref_field, target_source, ref_date
    );

    let reference = get_single_field(ctx, catalogues, &ref_field, target_source, ref_date)?
        .ok_or_else(|| RegridError::TargetUnresolved(target_source.to_string()))?;

    Ok(Coords {
        time: None,
        level: None,
        latitude: reference.coords.latitude,
        longitude: reference.coords.longitude,
    })
}

#[cfg(test)]
mod tests {
    use super::{handle_regridding, missing_target_warning, select_regridders, Regridder};
    use crate::converter::array::{Coords, DataArray};
    use crate::converter::context::tests::context;
    use crate::converter::field::{Era5Field, Exclusivity, FieldKey, FieldSet, Realm};
    use crate::errors::{FieldError, RegridError};
    use float_cmp::assert_approx_eq;
    use indexmap::IndexMap;
    use ndarray::Array4;

    fn grid(latitude: Vec<f64>, longitude: Vec<f64>) -> Coords {
        Coords {
            time: None,
            level: None,
            latitude,
            longitude,
        }
    }

    fn field(name: &str, source: &str, coords: Coords) -> Era5Field {
        let shape = coords.shape();
        let array = DataArray::from_data(name, coords, Array4::from_elem(shape, 5.0))
            .unwrap()
            .with_source(source);

        let mut field = Era5Field::new(name, Exclusivity::Unrestricted);
        field.add(array, Realm::Global).unwrap();
        field
    }

    #[test]
    fn regridders_are_shared() {
        let target = grid(vec![1.0, 0.0], vec![0.0, 1.0]);
        let coarse = grid(vec![2.0, 0.0], vec![0.0, 2.0]);

        let mut grids = IndexMap::new();
        grids.insert("era5".to_string(), target.clone());
        grids.insert("era5-land".to_string(), coarse.clone());
        grids.insert("/data/sst.nc".to_string(), coarse);

        let mut built = Vec::new();
        let regridders = select_regridders(&grids, &target, |source, _| {
            built.push(source.to_string());
            Ok(Regridder::Identity)
        })
        .unwrap();

        assert_eq!(built, vec!["era5-land".to_string()]);
        assert_eq!(regridders.len(), 3);
        assert!(regridders["era5"].is_identity());
    }

    #[test]
    fn target_defaults_to_first_source() {
        let ctx = context("start: 2020-01-01\nfields: {single-levels: [skt, sst]}");

        let mut fields = FieldSet::new();
        fields.insert(
            FieldKey::new("skt", "single-levels"),
            field("skt", "era5", grid(vec![1.0, 0.0], vec![0.0, 1.0])),
        );
        fields.insert(
            FieldKey::new("sst", "single-levels"),
            field(
                "sst",
                "era5-land",
                grid(vec![2.0, 1.0, 0.0], vec![0.0, 0.5, 1.0]),
            ),
        );

        handle_regridding(&mut fields, &ctx, &[]).unwrap();

        let (_, skt) = fields[&FieldKey::new("skt", "single-levels")].realms().next().unwrap();
        let (_, sst) = fields[&FieldKey::new("sst", "single-levels")].realms().next().unwrap();

        assert_eq!(skt.coords.latitude, vec![1.0, 0.0]);
        assert_eq!(sst.coords.latitude, vec![1.0, 0.0]);
        assert_eq!(sst.coords.longitude, vec![0.0, 1.0]);
        assert_eq!(sst.source, "era5-land");

        for value in sst.compute().unwrap().iter() {
            assert_approx_eq!(f32, *value, 5.0);
        }
    }

    #[test]
    fn unloaded_target_needs_reference() {
        let ctx = context("start: 2020-01-01\nregrid: era5-land\nfields: {single-levels: [skt]}");

        let mut fields = FieldSet::new();
        fields.insert(
            FieldKey::new("skt", "single-levels"),
            field("skt", "era5", grid(vec![1.0, 0.0], vec![0.0, 1.0])),
        );

        let result = handle_regridding(&mut fields, &ctx, &[]);
        assert!(matches!(
            result,
            Err(FieldError::Regrid(RegridError::NoReferenceParams))
        ));
    }

    #[test]
    fn weight_file_rejects_other_source_grids() {
        let ctx = context(
            "start: 2020-01-01\n\
             regrid: era5\n\
             regrid_options: weight_file\n\
             regrid_params: {weight_file: /nonexistent/weights.nc}\n\
             fields: {single-levels: [skt, sst]}",
        );

        let mut fields = FieldSet::new();
        fields.insert(
            FieldKey::new("skt", "single-levels"),
            field("skt", "era5", grid(vec![1.0, 0.0], vec![0.0, 1.0])),
        );
        fields.insert(
            FieldKey::new("sst", "single-levels"),
            field("sst", "era5-land", grid(vec![2.0, 0.0], vec![0.0, 2.0])),
        );

        let result = handle_regridding(&mut fields, &ctx, &[]);
        match result {
            Err(FieldError::Regrid(RegridError::UnsupportedWeightGrid(1801, 3600, source, 2, 2))) => {
                assert_eq!(source, "era5-land")
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn multiple_sources_without_target() {
        let mut grids = IndexMap::new();
        grids.insert("era5".to_string(), grid(vec![1.0, 0.0], vec![0.0, 1.0]));
        assert_eq!(missing_target_warning(&grids), None);

        grids.insert("era5-land".to_string(), grid(vec![2.0, 0.0], vec![0.0, 2.0]));
        let message = missing_target_warning(&grids).unwrap();
        assert!(message.ends_with("using era5"));
    }
}
