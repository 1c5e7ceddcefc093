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

//! Annotation of output fields with GRIB parameter metadata.
//!
//! The parameter table is a catalogue CSV with one row per parameter,
//! `metadata_mapping` says which of its columns become which attributes.

use super::array::{AttrValue, Attributes};
use super::catalogue::locate_table;
use super::configuration::ConfigStore;
use crate::errors::CatalogueError;
use indexmap::IndexMap;
use log::{debug, warn};
use std::path::{Path, PathBuf};

/// Column holding the variable name the table is searched by.
const NAME_COLUMN: &str = "cfVarName";

#[derive(Clone, Debug)]
struct ParamTable {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl ParamTable {
    fn read(path: &Path) -> Result<ParamTable, CatalogueError> {
        let mut reader = csv::Reader::from_path(path)?;
        let columns = reader.headers()?.iter().map(String::from).collect();

        let rows = reader
            .records()
            .map(|record| record.map(|r| r.iter().map(String::from).collect()))
            .collect::<Result<Vec<Vec<String>>, csv::Error>>()?;

        Ok(ParamTable { columns, rows })
    }

    fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// Parameter database used to attach GRIB metadata to output fields.
#[derive(Clone, Debug)]
pub struct Paramdb {
    catalogue: String,
    table: Option<ParamTable>,
    mapping: IndexMap<String, String>,
}

impl Paramdb {
    pub fn new_from_config(config: &ConfigStore) -> Result<Paramdb, CatalogueError> {
        let catalogue: String = config.get_or("metadata_catalogue", String::new())?;
        let paths: Vec<PathBuf> = config.get_or("catalogue_paths", vec![])?;
        let mapping = config.get_or("metadata_mapping", IndexMap::new())?;

        let mut table = None;

        if !catalogue.is_empty() {
            for path in &paths {
                if let Some(table_path) = locate_table(path, &catalogue)? {
                    debug!("Reading parameter table {}", table_path.display());
                    table = Some(ParamTable::read(&table_path)?);
                    break;
                }
            }
        }

        if table.is_none() && config.format()? == "grib" {
            warn!("Unable to find ECMWF metadata catalogue and GRIB format selected. GRIB field metadata will NOT correspond to input field metadata");
        }

        Ok(Paramdb {
            catalogue,
            table,
            mapping,
        })
    }

    /// Attributes of the (possibly tagged) field.
    pub fn lookup(&self, field_name: &str) -> Attributes {
        let mut attrs = Attributes::new();

        let table = match &self.table {
            Some(table) => table,
            None => return attrs,
        };

        let base_name = field_name.split('_').next().unwrap_or(field_name);

        let row = table.column(NAME_COLUMN).and_then(|name_column| {
            table
                .rows
                .iter()
                .find(|row| row.get(name_column).map(String::as_str) == Some(base_name))
        });

        let row = match row {
            Some(row) => row,
            None => return attrs,
        };

        for (attribute, column) in &self.mapping {
            match table.column(column).and_then(|index| row.get(index)) {
                Some(cell) => {
                    attrs.insert(attribute.clone(), parse_cell(cell));
                }
                None => warn!(
                    "Metadata parameter {} not found in metadata catalogue {}",
                    column, self.catalogue
                ),
            }
        }

        attrs
    }
}

fn parse_cell(cell: &str) -> AttrValue {
    if let Ok(value) = cell.parse::<i64>() {
        if let Ok(value) = i32::try_from(value) {
            return AttrValue::Int(value);
        }
        return AttrValue::Float(value as f64);
    }

    match cell.parse::<f64>() {
        Ok(value) => AttrValue::Float(value),
        Err(_) => AttrValue::Str(cell.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_cell, Paramdb};
    use crate::converter::array::AttrValue;
    use crate::converter::configuration::ConfigStore;
    use std::fs;

    #[test]
    fn cell_types() {
        assert_eq!(parse_cell("235"), AttrValue::Int(235));
        assert_eq!(parse_cell("0.5"), AttrValue::Float(0.5));
        assert_eq!(parse_cell("K"), AttrValue::Str("K".to_string()));
    }

    #[test]
    fn tagged_lookup() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("index.yaml"),
            "sources:\n  era5:\n    params:\n      path: params.csv\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("params.csv"),
            "cfVarName,paramId,table,units\nskt,235,128,K\nsst,34,128,K\n",
        )
        .unwrap();

        let yaml = format!(
            "
catalogue_paths: [{}]
metadata_catalogue: era5.params
metadata_mapping:
  code: paramId
  table: table
  GRIB_shortName: shortName
",
            dir.path().join("index.yaml").display()
        );
        let config = ConfigStore::from_value(serde_yaml::from_str(&yaml).unwrap()).unwrap();
        let paramdb = Paramdb::new_from_config(&config).unwrap();

        let attrs = paramdb.lookup("skt_surf");
        assert_eq!(attrs.get("code"), Some(&AttrValue::Int(235)));
        assert_eq!(attrs.get("table"), Some(&AttrValue::Int(128)));
        assert!(attrs.get("GRIB_shortName").is_none());

        assert!(paramdb.lookup("swvl1").is_empty());
    }

    #[test]
    fn missing_catalogue() {
        let config = ConfigStore::from_value(serde_yaml::from_str("format: netcdf").unwrap()).unwrap();
        let paramdb = Paramdb::new_from_config(&config).unwrap();
        assert!(paramdb.lookup("skt").is_empty());
    }
}
