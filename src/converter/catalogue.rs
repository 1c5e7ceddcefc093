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

//! Module responsible for finding the catalogues that can supply requested variables.
//!
//! A catalogue path points to a YAML index naming catalogues,
//! each of them a CSV table listing one data file per row.

use super::configuration::ConfigStore;
use super::context::Context;
use crate::errors::CatalogueError;
use log::{debug, info};
use rustc_hash::FxHashSet;
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// Single row of the catalogue table.
#[derive(Deserialize, Clone, PartialEq, Debug)]
pub struct CatalogueEntry {
    pub path: PathBuf,
    pub parameter: String,
    pub year: i32,
    pub month: u32,
    #[serde(default)]
    pub file_variable: Option<String>,
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub product_type: Option<String>,
    #[serde(default)]
    pub sub_collection: Option<String>,
    #[serde(default)]
    pub level_type: Option<String>,
}

impl CatalogueEntry {
    /// Name of the variable inside the data file.
    pub fn variable(&self) -> &str {
        self.file_variable.as_deref().unwrap_or(&self.parameter)
    }
}

/// Searchable table of data files.
#[derive(Clone, Debug)]
pub struct Catalogue {
    pub name: String,
    columns: Vec<String>,
    entries: Vec<CatalogueEntry>,
}

impl Catalogue {
    /// Looks for catalogue `name` in the index at `index_path`.
    /// Returns `None` when the index does not list it.
    pub fn open(index_path: &Path, name: &str) -> Result<Option<Catalogue>, CatalogueError> {
        match locate_table(index_path, name)? {
            Some(table_path) => {
                debug!("Reading catalogue table {}", table_path.display());
                Catalogue::read_table(name, &table_path).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Reads the CSV table, resolving relative data paths against its directory.
    pub fn read_table(name: &str, table_path: &Path) -> Result<Catalogue, CatalogueError> {
        let mut reader = csv::Reader::from_path(table_path)?;
        let columns = reader.headers()?.iter().map(String::from).collect();

        let base = table_path.parent().unwrap_or_else(|| Path::new("."));
        let entries = reader
            .deserialize()
            .map(|row| {
                row.map(|mut entry: CatalogueEntry| {
                    entry.path = base.join(&entry.path);
                    entry
                })
            })
            .collect::<Result<Vec<CatalogueEntry>, csv::Error>>()?;

        Ok(Catalogue {
            name: name.to_string(),
            columns,
            entries,
        })
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of the catalogue keeping only rows accepted by the predicate.
    pub fn filtered<P>(&self, name: &str, predicate: P) -> Catalogue
    where
        P: Fn(&CatalogueEntry) -> bool,
    {
        Catalogue {
            name: name.to_string(),
            columns: self.columns.clone(),
            entries: self.entries.iter().filter(|e| predicate(e)).cloned().collect(),
        }
    }

    /// Distinct values of the `dataset` column in order of appearance.
    pub fn datasets(&self) -> Vec<String> {
        let mut seen = FxHashSet::default();

        self.entries
            .iter()
            .filter_map(|e| e.dataset.clone())
            .filter(|d| seen.insert(d.clone()))
            .collect()
    }

    /// Rows of any of the parameters in the given month.
    pub fn search(&self, parameters: &[String], year: i32, month: u32) -> Vec<&CatalogueEntry> {
        let parameters: FxHashSet<&str> = parameters.iter().map(String::as_str).collect();

        self.entries
            .iter()
            .filter(|e| e.year == year && e.month == month)
            .filter(|e| parameters.contains(e.parameter.as_str()))
            .collect()
    }
}

/// Path of the CSV table of catalogue `name` (dotted for nested entries)
/// listed in the index at `index_path`.
pub fn locate_table(index_path: &Path, name: &str) -> Result<Option<PathBuf>, CatalogueError> {
    let index = ConfigStore::new_from_file(index_path)?;

    let table_path = match index.get::<PathBuf>(&format!("sources.{}.path", name))? {
        Some(path) => path,
        None => match index.get::<PathBuf>(&format!("{}.path", name))? {
            Some(path) => path,
            None => return Ok(None),
        },
    };

    let base = index_path.parent().unwrap_or_else(|| Path::new("."));
    Ok(Some(base.join(table_path)))
}

/// Resolved source of data.
#[derive(Clone, Debug)]
pub enum CatalogueHandle {
    /// Catalogue restricted to (at most) one dataset group.
    Data {
        name: String,
        catalogue: Arc<Catalogue>,
        dataset: Option<String>,
    },

    /// Placeholder marking where custom fields are processed.
    CustomFields { name: String },
}

impl CatalogueHandle {
    pub fn name(&self) -> &str {
        match self {
            CatalogueHandle::Data { name, .. } => name,
            CatalogueHandle::CustomFields { name } => name,
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, CatalogueHandle::CustomFields { .. })
    }
}

/// Splits the catalogue into one handle per requested dataset group it contains.
/// Catalogues without the `dataset` column stay whole.
pub fn split_by_dataset(
    catalogue: &Catalogue,
    datasets: &[String],
    name: &str,
) -> Vec<CatalogueHandle> {
    if !catalogue.has_column("dataset") {
        return vec![CatalogueHandle::Data {
            name: name.to_string(),
            catalogue: Arc::new(catalogue.filtered(name, |_| true)),
            dataset: None,
        }];
    }

    datasets
        .iter()
        .filter_map(|dataset| {
            debug!("Searching for dataset {} in {}", dataset, name);

            let sub = catalogue.filtered(name, |e| e.dataset.as_deref() == Some(dataset.as_str()));

            if sub.is_empty() {
                debug!("Dataset {} not found in {}", dataset, name);
                return None;
            }

            Some(CatalogueHandle::Data {
                name: name.to_string(),
                catalogue: Arc::new(sub),
                dataset: Some(dataset.clone()),
            })
        })
        .collect()
}

/// Builds the ordered list of catalogue handles from configuration.
pub fn resolve_catalogues(ctx: &Context) -> Result<Vec<CatalogueHandle>, CatalogueError> {
    let config = &ctx.config;
    let custom_key = ctx.custom_catalogue_key()?;
    let datasets: Vec<String> = ctx.requested_fields()?.keys().cloned().collect();
    let paths: Vec<PathBuf> = config.get_or("catalogue_paths", vec![])?;
    let names = config.get_list("catalogues")?;

    let mut handles = vec![];

    for path in &paths {
        info!("Trying catalogue path: {}", path.display());

        for name in &names {
            if *name == custom_key {
                if !handles.iter().any(CatalogueHandle::is_custom) {
                    debug!("Custom field placeholder {} in catalogue order", name);
                    handles.push(CatalogueHandle::CustomFields { name: name.clone() });
                }
                continue;
            }

            let mut catalogue = match Catalogue::open(path, name)? {
                Some(catalogue) => catalogue,
                None => {
                    debug!("{} not found in {}", name, path.display());
                    continue;
                }
            };

            if let Some(product_type) =
                config.get::<String>(&format!("catalogue_flags.{}.product_type", name))?
            {
                info!("Filtering {} by product type: {}", name, product_type);
                catalogue = catalogue.filtered(name, |e| {
                    e.product_type.as_deref() == Some(product_type.as_str())
                });
            }

            if let Some(preferred) =
                config.get::<String>(&format!("catalogue_flags.{}.sub_collection_pref", name))?
            {
                info!("Attempting to find preferred subcollection: {}", preferred);
                let sub = catalogue.filtered(&preferred, |e| {
                    e.sub_collection.as_deref() == Some(preferred.as_str())
                });

                if !sub.is_empty() {
                    handles.extend(split_by_dataset(&sub, &datasets, &preferred));
                }
            }

            if !catalogue.is_empty() {
                handles.extend(split_by_dataset(&catalogue, &datasets, name));
            }
        }
    }

    if handles.is_empty() {
        return Err(CatalogueError::NoCatalogues);
    }

    if config.contains("custom_fields") && !handles.iter().any(CatalogueHandle::is_custom) {
        info!("Custom fields found, but no order specified, processing them first");
        handles.insert(0, CatalogueHandle::CustomFields { name: custom_key });
    }

    Ok(handles)
}
