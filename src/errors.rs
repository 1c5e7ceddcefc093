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

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("Error while reading configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Error while resolving catalogues: {0}")]
    Catalogue(#[from] CatalogueError),

    #[error("Error while reading input data: {0}")]
    Input(#[from] InputError),

    #[error("Error while assembling fields: {0}")]
    Field(#[from] FieldError),

    #[error("Error while regridding: {0}")]
    Regrid(#[from] RegridError),

    #[error("Error while writing output: {0}")]
    Output(#[from] OutputError),

    #[error("Error while creating ThreadPool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Cannot cap memory at {0} bytes, more is already allocated")]
    MemoryLimit(usize),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot open configuration file: {0}")]
    CantOpenFile(#[from] std::io::Error),

    #[error("Cannot deserialize configuration: {0}")]
    CantDeserialize(#[from] serde_yaml::Error),

    #[error("Configuration has no key: {0}")]
    MissingKey(String),

    #[error("Configuration key {0} has unexpected type: {1}")]
    WrongType(String, serde_yaml::Error),

    #[error("Cannot overlay configuration key {0}: mapping and non-mapping values conflict")]
    ConflictingTypes(String),

    #[error("Cannot parse timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Configuration component is out of bounds: {0}")]
    OutOfBounds(&'static str),

    #[error("Cannot read domain from geogrid file: {0}")]
    GeoFile(#[from] netcdf::Error),
}

#[derive(Error, Debug)]
pub enum CatalogueError {
    #[error("Cannot open catalogue index: {0}")]
    CantOpenIndex(#[from] std::io::Error),

    #[error("Cannot deserialize catalogue index: {0}")]
    CantDeserialize(#[from] serde_yaml::Error),

    #[error("Cannot read catalogue table: {0}")]
    CantReadTable(#[from] csv::Error),

    #[error("No valid catalogues specified")]
    NoCatalogues,

    #[error("{0}")]
    Config(#[from] ConfigError),
}

#[derive(Error, Debug)]
pub enum InputError {
    #[error("NetCDF error: {0}")]
    Netcdf(#[from] netcdf::Error),

    #[error("GRIB error: {0}")]
    Grib(#[from] eccodes::errors::CodesError),

    #[error("Variable {0} not found in {1}")]
    MissingVariable(String, String),

    #[error("{0} contains no variables")]
    NoVariables(String),

    #[error("Dimension {0} of variable {1} is not recognised")]
    UnknownDimension(String, String),

    #[error("Variable {0} lacks a {1} coordinate")]
    MissingCoordinate(String, &'static str),

    #[error("Cannot decode time units: {0}")]
    TimeUnits(String),

    #[error("Incorrect type of GRIB key: {0}")]
    IncorrectKeyType(String),

    #[error("Messages of {0} in {1} do not form a regular time/level grid")]
    IrregularMessages(String, String),

    #[error("Cannot shape input data: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("{0}")]
    Array(#[from] ArrayError),
}

#[derive(Error, Debug)]
pub enum FieldError {
    #[error("Multiple definition of {0} on {1}")]
    MultipleDefinition(String, String),

    #[error("Attempted to concatenate non-existent data array: {0} on {1}")]
    UnknownRealm(String, String),

    #[error("Unknown realm: {0}")]
    InvalidRealm(String),

    #[error("Realm {0} is not supported yet")]
    UnsupportedRealm(String),

    #[error("Field ({0}, {1}) was found in catalogue search results but was never requested")]
    UnrequestedField(String, String),

    #[error("{0} in month {1} of catalogue search results, but not in first month {2}")]
    MissingFromBaseline(String, String, String),

    #[error("{0} in first month {2} of catalogue search results, but not in month {1}")]
    MissingInMonth(String, String, String),

    #[error("Field {0} was not found in any catalogue")]
    NotFound(String),

    #[error("Time dimension mismatch in field {0}")]
    TimeMismatch(String),

    #[error("Custom field {0} has different time dimension length than remaining data: {1}, {2}")]
    CustomTimeLength(String, usize, usize),

    #[error("{0} contains multiple variables, none of which are {1}")]
    AmbiguousCustomFile(String, String),

    #[error("When multiple time steps are present in {0}, all requested time steps must exist in that file")]
    CustomTimeCoverage(String),

    #[error("{0} has more than 2 non-time dimensions and custom pressure levels are not supported")]
    CustomLevels(String),

    #[error("Domain of data ({0}) does not fill the requested domain ({1})")]
    DomainNotCovered(String, String),

    #[error("Field merge is required and no land mask has been specified")]
    NoLandMaskConfigured,

    #[error("Unable to recover land mask for merging fields")]
    LandMaskUnavailable,

    #[error("Field {0} has more than one realm but no land mask was supplied")]
    MaskRequired(String),

    #[error("{0}")]
    Input(#[from] InputError),

    #[error("{0}")]
    Array(#[from] ArrayError),

    #[error("{0}")]
    Regrid(#[from] RegridError),

    #[error("{0}")]
    Config(#[from] ConfigError),
}

#[derive(Error, Debug)]
pub enum RegridError {
    #[error("Regridding to an unloaded field requested, but regrid_params.ref_field and regrid_params.ref_date are not set")]
    NoReferenceParams,

    #[error("Could not find unloaded field to regrid to: {0}")]
    TargetUnresolved(String),

    #[error("Weight file regridding can only be used to regrid from a {0}x{1} grid, {2} is {3}x{4}")]
    UnsupportedWeightGrid(usize, usize, String, usize, usize),

    #[error("Weight file {0} does not match the grids: expected {1} -> {2} points, found {3} -> {4}")]
    WeightFileShape(String, usize, usize, usize, usize),

    #[error("Cannot read weight file: {0}")]
    WeightFile(#[from] netcdf::Error),

    #[error("Source grid needs at least two points along each axis, got {0}x{1}")]
    DegenerateGrid(usize, usize),

    #[error("Array {0} is not on the grid the regridder was built for")]
    GridMismatch(String),

    #[error("{0}")]
    Array(#[from] ArrayError),
}

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("No output driver for format: {0}")]
    UnknownFormat(String),

    #[error("NetCDF error: {0}")]
    Netcdf(#[from] netcdf::Error),

    #[error("Cannot handle output file: {0}")]
    Io(#[from] std::io::Error),

    #[error("External converter {0} failed with status {1}")]
    ConverterFailed(String, String),

    #[error("Field {0} is not on the same grid as the rest of the dataset")]
    GridMismatch(String),

    #[error("Time axis of field {0} does not match the rest of the dataset")]
    TimeMismatch(String),

    #[error("Dataset is empty, nothing to write")]
    EmptyDataset,

    #[error("{0}")]
    Array(#[from] ArrayError),

    #[error("{0}")]
    Config(#[from] ConfigError),
}

#[derive(Error, Debug)]
pub enum ArrayError {
    #[error("Array {0} has shape {1:?} but its coordinates describe {2:?}")]
    ShapeMismatch(String, Vec<usize>, Vec<usize>),

    #[error("Timestamp {1} not found in {0}")]
    MissingTimestamp(String, String),

    #[error("Array {0} has no time coordinate")]
    NoTime(String),

    #[error("Array {0} already has a time coordinate")]
    HasTime(String),

    #[error("Array {0} has {1} timesteps, expected {2}")]
    TimeLength(String, usize, usize),

    #[error("Selection of {0} within the requested domain is empty")]
    EmptySelection(String),

    #[error("Arrays {0} and {1} cannot be combined: incompatible shapes")]
    Incompatible(String, String),

    #[error("Cannot read data of {0}: {1}")]
    Read(String, String),
}

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum SearchError {
    #[error("Array is empty")]
    EmptyArray,

    #[error("Searched value is out of array bounds")]
    OutOfBounds,
}
