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

//! Tests running several pipeline stages together.

use crate::converter::array::{Coords, DataArray};
use crate::converter::catalogue::resolve_catalogues;
use crate::converter::combine::combine;
use crate::converter::context::tests::context;
use crate::converter::field::{Era5Field, Exclusivity, FieldKey, FieldSet, Realm};
use crate::converter::loader::{load_month, tests::write_field};
use crate::converter::output;
use crate::converter::parallel::WorkerPool;
use crate::converter::regrid::handle_regridding;
use crate::converter::{configuration::ConfigStore, log_level};
use chrono::{NaiveDate, NaiveDateTime};
use float_cmp::assert_approx_eq;
use indexmap::IndexMap;
use log::LevelFilter;
use ndarray::Array4;
use std::{fs, path::Path};

const LAND: f32 = 270.0;
const OCEAN: f32 = 290.0;

fn midnight() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2020, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

fn array(name: &str, source: &str, latitude: Vec<f64>, longitude: Vec<f64>, data: Array4<f32>) -> DataArray {
    let coords = Coords {
        time: Some(vec![midnight()]),
        level: None,
        latitude,
        longitude,
    };

    DataArray::from_data(name, coords, data).unwrap().with_source(source)
}

fn mask() -> Array4<f32> {
    let mut data = Array4::zeros((1, 1, 2, 2));
    data[[0, 0, 0, 0]] = 1.0;
    data[[0, 0, 1, 1]] = 1.0;
    data
}

/// Land data on a fine grid, ocean data and the mask on the target grid.
fn month_fields() -> FieldSet {
    let mut skt = Era5Field::new("skt", Exclusivity::Unrestricted);
    skt.add(
        array(
            "skt",
            "era5-land",
            vec![1.0, 0.5, 0.0],
            vec![0.0, 0.5, 1.0],
            Array4::from_elem((1, 1, 3, 3), LAND),
        ),
        Realm::LandOnly,
    )
    .unwrap();
    skt.add(
        array(
            "skt",
            "era5",
            vec![1.0, 0.0],
            vec![0.0, 1.0],
            Array4::from_elem((1, 1, 2, 2), OCEAN),
        ),
        Realm::OceanOnly,
    )
    .unwrap();

    let mut lsm = Era5Field::new("lsm", Exclusivity::Unrestricted);
    lsm.add(array("lsm", "era5", vec![1.0, 0.0], vec![0.0, 1.0], mask()), Realm::Global)
        .unwrap();

    let mut fields = FieldSet::new();
    fields.insert(FieldKey::new("skt", "single-levels"), skt);
    fields.insert(FieldKey::new("lsm", "single-levels"), lsm);
    fields
}

const CONFIG: &str = "
start: 2020-01-01 00:00
fields:
  single-levels: [skt, lsm]
static:
  single-levels: [lsm]
land-mask:
  era5: lsm
format: netcdf
";

#[test]
fn land_and_ocean_are_merged_with_mask() {
    let ctx = context(&format!("{}regrid: era5\n", CONFIG));

    let mut months = IndexMap::new();
    months.insert(midnight(), month_fields());

    let dataset = combine(&ctx, &[], months).unwrap();
    let names: Vec<&str> = dataset.variables.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, vec!["skt", "lsm"]);

    let skt = &dataset.variables[0];
    assert_eq!(skt.coords.latitude, vec![1.0, 0.0]);
    assert_eq!(skt.coords.longitude, vec![0.0, 1.0]);

    let values = skt.compute().unwrap();
    assert_approx_eq!(f32, values[[0, 0, 0, 0]], LAND);
    assert_approx_eq!(f32, values[[0, 0, 1, 1]], LAND);
    assert_approx_eq!(f32, values[[0, 0, 0, 1]], OCEAN);
    assert_approx_eq!(f32, values[[0, 0, 1, 0]], OCEAN);
}

#[test]
fn regrid_target_defaults_to_first_source() {
    let ctx = context(CONFIG);
    let mut fields = month_fields();

    handle_regridding(&mut fields, &ctx, &[]).unwrap();

    let skt: Vec<(Realm, Array4<f32>)> = fields[&FieldKey::new("skt", "single-levels")]
        .realms()
        .map(|(realm, array)| (realm, array.compute().unwrap()))
        .collect();

    assert_eq!(skt[0].1.shape(), &[1, 1, 3, 3]);
    assert_eq!(skt[1].0, Realm::OceanOnly);
    assert_eq!(skt[1].1.shape(), &[1, 1, 3, 3]);
    assert_approx_eq!(f32, skt[1].1[[0, 0, 1, 1]], OCEAN);

    let (_, lsm) = fields[&FieldKey::new("lsm", "single-levels")].realms().next().unwrap();
    assert_eq!(lsm.coords.longitude, vec![0.0, 0.5, 1.0]);
}

fn write_mask(path: &Path) {
    let mut file = netcdf::create(path).unwrap();
    file.add_dimension("time", 2).unwrap();
    file.add_dimension("latitude", 2).unwrap();
    file.add_dimension("longitude", 2).unwrap();

    {
        let mut time = file.add_variable::<f64>("time", &["time"]).unwrap();
        time.put_attribute("units", "hours since 2020-01-01 00:00:00").unwrap();
        time.put_values(&[0.0, 1.0], ..).unwrap();
    }
    {
        let mut lat = file.add_variable::<f64>("latitude", &["latitude"]).unwrap();
        lat.put_values(&[1.0, 0.0], ..).unwrap();
    }
    {
        let mut lon = file.add_variable::<f64>("longitude", &["longitude"]).unwrap();
        lon.put_values(&[0.0, 1.0], ..).unwrap();
    }

    let mut var = file
        .add_variable::<f32>("lsm", &["time", "latitude", "longitude"])
        .unwrap();
    var.put_values(&[1.0f32, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0], ..)
        .unwrap();
}

#[test]
fn catalogues_to_netcdf() {
    let dir = tempfile::tempdir().unwrap();
    let hours = [0.0, 1.0];

    write_field(
        &dir.path().join("skt_land.nc"),
        "skt",
        &hours,
        &[1.0, 0.5, 0.0],
        &[0.0, 0.5, 1.0],
        LAND,
    );
    write_field(&dir.path().join("skt_era5.nc"), "skt", &hours, &[1.0, 0.0], &[0.0, 1.0], OCEAN);
    write_mask(&dir.path().join("lsm_era5.nc"));

    fs::write(
        dir.path().join("index.yaml"),
        "sources:\n  era5: {path: era5.csv}\n  era5-land: {path: land.csv}\n",
    )
    .unwrap();
    fs::write(
        dir.path().join("era5.csv"),
        "path,parameter,year,month,dataset\n\
         skt_era5.nc,skt,2020,1,single-levels\n\
         lsm_era5.nc,lsm,2020,1,single-levels\n",
    )
    .unwrap();
    fs::write(
        dir.path().join("land.csv"),
        "path,parameter,year,month\nskt_land.nc,skt,2020,1\n",
    )
    .unwrap();

    let output_path = dir.path().join("out.nc");
    let ctx = context(&format!(
        "
start: 2020-01-01 00:00
end: 2020-01-01 01:00
fields:
  single-levels: [skt, lsm]
static:
  single-levels: [lsm]
catalogue_paths: [{index}]
catalogues: [era5-land, era5]
catalogue_flags:
  era5-land:
    realm: land_only
  era5:
    realm: ocean_only
land-mask:
  era5: lsm
regrid: era5
format: netcdf
output: {output}
",
        index = dir.path().join("index.yaml").display(),
        output = output_path.display(),
    ));

    let catalogues = resolve_catalogues(&ctx).unwrap();
    let mut months = IndexMap::new();
    for month in &ctx.months {
        months.insert(*month, load_month(&ctx, &catalogues, *month).unwrap());
    }

    let dataset = combine(&ctx, &catalogues, months).unwrap();
    let pool = WorkerPool::new(2, usize::MAX).unwrap();
    output::write(&dataset, &ctx.config, &pool).unwrap();

    let file = netcdf::open(&output_path).unwrap();
    assert_eq!(file.dimension("time").unwrap().len(), 2);

    let skt = file.variable("skt").unwrap();
    let values: Vec<f32> = skt.get_values::<f32, _>(..).unwrap();
    let expected = [LAND, OCEAN, OCEAN, LAND, LAND, OCEAN, OCEAN, LAND];

    assert_eq!(values.len(), expected.len());
    for (value, expected) in values.iter().zip(expected) {
        assert_approx_eq!(f32, *value, expected, epsilon = 1e-3);
    }

    let lsm = file.variable("lsm").unwrap();
    let mask: Vec<f32> = lsm.get_values::<f32, _>((0, .., ..)).unwrap();
    assert_eq!(mask, vec![1.0, 0.0, 0.0, 1.0]);
}

#[test]
fn log_level_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");

    fs::write(&path, "start: 2020-01-01\nlog_level: debug\n").unwrap();
    let config = ConfigStore::new_from_file(&path).unwrap();
    assert_eq!(log_level(&config).unwrap(), Some(LevelFilter::Debug));

    fs::write(&path, "start: 2020-01-01\nlog_level: chatty\n").unwrap();
    let config = ConfigStore::new_from_file(&path).unwrap();
    assert_eq!(log_level(&config).unwrap(), None);

    fs::write(&path, "start: 2020-01-01\n").unwrap();
    let config = ConfigStore::new_from_file(&path).unwrap();
    assert_eq!(log_level(&config).unwrap(), None);
}
