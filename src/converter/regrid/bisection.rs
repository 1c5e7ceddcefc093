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

//! Module containg methods for conducting
//! binary search (bisection) of grid points closest
//! to searched coordinates. Coordinates can be sorted
//! ascendingly (longitudes) or descendingly (ERA5 latitudes).

use crate::errors::SearchError;

/// Returns the first and the last item of non-empty array
/// or an error for an empty one.
fn bounds<T>(array: &[T]) -> Result<(&T, &T), SearchError> {
    match (array.first(), array.last()) {
        (Some(first), Some(last)) => Ok((first, last)),
        _ => Err(SearchError::EmptyArray),
    }
}

/// Core bisection function, simply an implementation
/// of binary search algorithm adapted to searching values
/// in-between the set items.
///
/// Returns the index of the first item not "before" `x`
/// in the ordering of the array.
fn binary_search<T: PartialOrd>(array: &[T], x: &T) -> Result<usize, SearchError> {
    let (first, last) = bounds(array)?;

    if x < first && x < last || x > first && x > last {
        return Err(SearchError::OutOfBounds);
    }

    let mut lo = 0;
    let mut hi = array.len() - 1;

    // if the array is sorted descendingly we use a function with reversed signs
    if first < last {
        while lo < hi {
            let mid = (lo + hi) / 2;

            if array[mid] >= *x {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
    } else {
        while lo < hi {
            let mid = (lo + hi) / 2;

            if array[mid] <= *x {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
    }

    Ok(lo)
}

/// Finds the index of the grid point at or before
/// the searched coordinate (in the ordering of the array).
pub fn find_left_closest<T: PartialOrd>(array: &[T], x: &T) -> Result<usize, SearchError> {
    let found_index = binary_search(array, x)?;
    let (first, last) = bounds(array)?;

    let at_or_before = if first < last {
        array[found_index] <= *x
    } else {
        array[found_index] >= *x
    };

    if at_or_before {
        Ok(found_index)
    } else {
        Ok(found_index - 1)
    }
}

/// Finds the index of the grid point at or after
/// the searched coordinate (in the ordering of the array).
pub fn find_right_closest<T: PartialOrd>(array: &[T], x: &T) -> Result<usize, SearchError> {
    binary_search(array, x)
}

#[cfg(test)]
mod tests {
    use super::{find_left_closest, find_right_closest};
    use crate::errors::SearchError;

    #[test]
    fn ascending() {
        let lons = [0.0, 0.25, 0.5, 0.75];

        assert_eq!(find_left_closest(&lons, &0.3).unwrap(), 1);
        assert_eq!(find_right_closest(&lons, &0.3).unwrap(), 2);
        assert_eq!(find_left_closest(&lons, &0.5).unwrap(), 2);
        assert_eq!(find_right_closest(&lons, &0.5).unwrap(), 2);
        assert_eq!(find_left_closest(&lons, &0.0).unwrap(), 0);
        assert_eq!(find_right_closest(&lons, &0.75).unwrap(), 3);
    }

    #[test]
    fn descending() {
        let lats = [90.0, 89.75, 89.5];

        assert_eq!(find_left_closest(&lats, &89.6).unwrap(), 1);
        assert_eq!(find_right_closest(&lats, &89.6).unwrap(), 2);
        assert_eq!(find_left_closest(&lats, &90.0).unwrap(), 0);
    }

    #[test]
    fn errors() {
        let empty: [f64; 0] = [];
        assert_eq!(find_left_closest(&empty, &1.0), Err(SearchError::EmptyArray));
        assert_eq!(
            find_right_closest(&[1.0, 2.0], &2.5),
            Err(SearchError::OutOfBounds)
        );
    }
}
