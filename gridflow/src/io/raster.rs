/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! ESRI ASCII raster I/O.
//!
//! A small header (`ncols`, `nrows`, lower-left corner, `cellsize`,
//! optional `NODATA_value`) followed by rows of whitespace-separated
//! cell values, northernmost row first. Header keys are matched
//! case-insensitively. The file's no-data sentinel maps to the element
//! type's in-band marker on read and back to the sentinel on write.

use std::path::Path;
use std::str::FromStr;

use gridslice::Shape;
use gridslice::Tiling;
use partactor::Block;
use partactor::Caller;

use crate::array::PartitionedArray;
use crate::cluster::Cluster;
use crate::element::Element;
use crate::error::Error;

/// Header of an ESRI ASCII grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterMeta<T> {
    pub ncols: usize,
    pub nrows: usize,
    pub xllcorner: f64,
    pub yllcorner: f64,
    pub cellsize: f64,
    /// The file's no-data sentinel, if it declares one.
    pub nodata: Option<T>,
}

impl<T: Element> RasterMeta<T> {
    /// A header for `shape` with unit geometry and no sentinel.
    pub fn of_shape(shape: Shape<2>) -> Self {
        Self {
            ncols: shape.extent(1),
            nrows: shape.extent(0),
            xllcorner: 0.0,
            yllcorner: 0.0,
            cellsize: 1.0,
            nodata: None,
        }
    }

    pub fn with_nodata(mut self, value: T) -> Self {
        self.nodata = Some(value);
        self
    }

    pub fn shape(&self) -> Shape<2> {
        Shape::new([self.nrows, self.ncols])
    }
}

fn field<F: FromStr>(key: &str, token: &str) -> Result<F, Error> {
    token
        .parse()
        .map_err(|_| Error::Raster(format!("bad {key}: {token:?}")))
}

fn parse<T>(text: &str) -> Result<(RasterMeta<T>, Block<T, 2>), Error>
where
    T: Element + FromStr,
{
    let mut ncols = None;
    let mut nrows = None;
    let mut xllcorner = 0.0;
    let mut yllcorner = 0.0;
    let mut cellsize = 1.0;
    let mut nodata = None;

    let mut tokens = text.split_whitespace().peekable();
    // Header entries are `key value` pairs; the data section starts at
    // the first token that is not a header key.
    while let Some(token) = tokens.peek() {
        let key = token.to_ascii_lowercase();
        if !matches!(
            key.as_str(),
            "ncols" | "nrows" | "xllcorner" | "yllcorner" | "cellsize" | "nodata_value"
        ) {
            break;
        }
        tokens.next();
        let token = tokens
            .next()
            .ok_or_else(|| Error::Raster(format!("missing value for {key}")))?;
        match key.as_str() {
            "ncols" => ncols = Some(field::<usize>(&key, token)?),
            "nrows" => nrows = Some(field::<usize>(&key, token)?),
            "xllcorner" => xllcorner = field::<f64>(&key, token)?,
            "yllcorner" => yllcorner = field::<f64>(&key, token)?,
            "cellsize" => cellsize = field::<f64>(&key, token)?,
            _ => nodata = Some(field::<T>(&key, token)?),
        }
    }
    let (ncols, nrows) = match (ncols, nrows) {
        (Some(ncols), Some(nrows)) => (ncols, nrows),
        _ => return Err(Error::Raster("header missing ncols/nrows".to_string())),
    };
    let meta = RasterMeta {
        ncols,
        nrows,
        xllcorner,
        yllcorner,
        cellsize,
        nodata,
    };

    let mut values = Vec::with_capacity(nrows * ncols);
    for token in tokens {
        let value = field::<T>("cell", token)?;
        values.push(match meta.nodata {
            Some(sentinel) if value == sentinel => T::NO_DATA,
            _ => value,
        });
    }
    if values.len() != nrows * ncols {
        return Err(Error::Raster(format!(
            "expected {} cells, found {}",
            nrows * ncols,
            values.len()
        )));
    }
    let block = Block::new(meta.shape(), values).map_err(|err| Error::Raster(err.to_string()))?;
    Ok((meta, block))
}

fn render<T>(meta: &RasterMeta<T>, block: &Block<T, 2>) -> String
where
    T: Element + std::fmt::Display,
{
    let mut text = String::new();
    text.push_str(&format!("ncols {}\n", meta.ncols));
    text.push_str(&format!("nrows {}\n", meta.nrows));
    text.push_str(&format!("xllcorner {}\n", meta.xllcorner));
    text.push_str(&format!("yllcorner {}\n", meta.yllcorner));
    text.push_str(&format!("cellsize {}\n", meta.cellsize));
    if let Some(sentinel) = meta.nodata {
        text.push_str(&format!("NODATA_value {sentinel}\n"));
    }
    for row in 0..meta.nrows {
        let start = row * meta.ncols;
        for col in 0..meta.ncols {
            if col > 0 {
                text.push(' ');
            }
            let cell = block.values()[start + col];
            match meta.nodata {
                Some(sentinel) if cell.is_no_data() => text.push_str(&sentinel.to_string()),
                _ => text.push_str(&cell.to_string()),
            }
        }
        text.push('\n');
    }
    text
}

/// Read an ESRI ASCII grid into one block.
pub async fn read_raster<T>(path: impl AsRef<Path>) -> Result<(RasterMeta<T>, Block<T, 2>), Error>
where
    T: Element + FromStr,
{
    let text = tokio::fs::read_to_string(path.as_ref()).await?;
    parse(&text)
}

/// Write a block as an ESRI ASCII grid.
pub async fn write_raster<T>(
    path: impl AsRef<Path>,
    meta: &RasterMeta<T>,
    block: &Block<T, 2>,
) -> Result<(), Error>
where
    T: Element + std::fmt::Display,
{
    if *block.shape() != meta.shape() {
        return Err(Error::mismatch(meta.shape(), block.shape()));
    }
    tokio::fs::write(path.as_ref(), render(meta, block)).await?;
    Ok(())
}

/// Read an ESRI ASCII grid into a partitioned array. With no tiling
/// given, the cluster's configured default partition extent applies.
pub async fn from_raster<T>(
    cluster: &Cluster,
    path: impl AsRef<Path>,
    tiling: Option<Tiling<2>>,
) -> Result<(RasterMeta<T>, PartitionedArray<T, 2>), Error>
where
    T: Element + FromStr,
{
    let (meta, whole) = read_raster(path).await?;
    let tiling = match tiling {
        Some(tiling) => {
            whole.shape().ensure_same(&tiling.array_shape())?;
            tiling
        }
        None => cluster.default_tiling(*whole.shape())?,
    };
    let blocks = tiling
        .regions()
        .map(|(_, region)| -> Result<Block<T, 2>, Error> {
            let values = whole.region(&region)?;
            Block::new(region.shape(), values).map_err(|err| Error::Raster(err.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let array = PartitionedArray::from_blocks(cluster, tiling, blocks)?;
    Ok((meta, array))
}

/// Gather a partitioned array and write it as an ESRI ASCII grid.
pub async fn to_raster<T>(
    caller: &Caller,
    array: &PartitionedArray<T, 2>,
    meta: &RasterMeta<T>,
    path: impl AsRef<Path>,
) -> Result<(), Error>
where
    T: Element + std::fmt::Display,
{
    let whole = array.gather(caller).await?;
    write_raster(path, meta, &whole).await
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_parse_maps_the_sentinel() {
        let text = "ncols 3\nnrows 2\nxllcorner 0.5\nyllcorner 1.5\ncellsize 10\n\
                    NODATA_value -9999\n1 -9999 3\n4 5 6\n";
        let (meta, block) = parse::<f64>(text).unwrap();
        assert_eq!(meta.ncols, 3);
        assert_eq!(meta.nrows, 2);
        assert_eq!(meta.xllcorner, 0.5);
        assert_eq!(meta.cellsize, 10.0);
        assert_eq!(meta.nodata, Some(-9999.0));
        assert_eq!(block.values()[0], 1.0);
        assert!(block.values()[1].is_nan());
        assert_eq!(block.values()[5], 6.0);
    }

    #[test]
    fn test_parse_accepts_any_header_case() {
        let text = "NCOLS 2\nNRows 1\nCELLSIZE 1\nNoData_Value -1\n7 -1\n";
        let (meta, block) = parse::<i64>(text).unwrap();
        assert_eq!(meta.shape(), Shape::new([1, 2]));
        assert_eq!(meta.nodata, Some(-1));
        assert_eq!(block.values(), &[7, i64::NO_DATA]);
    }

    #[test]
    fn test_parse_requires_extents() {
        let text = "ncols 2\ncellsize 1\n1 2\n";
        assert_matches!(parse::<f64>(text), Err(Error::Raster(_)));
    }

    #[test]
    fn test_parse_rejects_short_data() {
        let text = "ncols 2\nnrows 2\n1 2 3\n";
        assert_matches!(parse::<f64>(text), Err(Error::Raster(_)));
    }

    #[test]
    fn test_render_parses_back() {
        let meta = RasterMeta::of_shape(Shape::new([2, 2])).with_nodata(-9999.0f64);
        let block =
            Block::new(Shape::new([2, 2]), vec![1.5, f64::NAN, 3.0, 4.0]).unwrap();
        let (parsed_meta, parsed) = parse::<f64>(&render(&meta, &block)).unwrap();
        assert_eq!(parsed_meta, meta);
        assert_eq!(parsed.values()[0], 1.5);
        assert!(parsed.values()[1].is_nan());
        assert_eq!(parsed.values()[3], 4.0);
    }

    #[tokio::test]
    async fn test_raster_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.asc");
        let meta = RasterMeta::of_shape(Shape::new([1, 3])).with_nodata(-1i64);
        let block = Block::new(Shape::new([1, 3]), vec![5, i64::NO_DATA, 7]).unwrap();

        write_raster(&path, &meta, &block).await.unwrap();
        let (read_meta, read_block) = read_raster::<i64>(&path).await.unwrap();
        assert_eq!(read_meta, meta);
        assert_eq!(read_block.values(), block.values());
    }

    #[tokio::test]
    async fn test_from_raster_partitions_the_grid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.asc");
        let values: Vec<f64> = (0..16).map(|v| v as f64).collect();
        let meta = RasterMeta::of_shape(Shape::new([4, 4]));
        let block = Block::new(Shape::new([4, 4]), values.clone()).unwrap();
        write_raster(&path, &meta, &block).await.unwrap();

        let cluster = Cluster::local(2).unwrap();
        let tiling = Tiling::new(Shape::new([4, 4]), Shape::new([2, 2])).unwrap();
        let (read_meta, array) = from_raster::<f64>(&cluster, &path, Some(tiling)).await.unwrap();
        assert_eq!(read_meta.shape(), Shape::new([4, 4]));
        assert_eq!(array.nr_partitions(), 4);
        let gathered = array.gather(cluster.caller()).await.unwrap();
        assert_eq!(gathered.values(), &values[..]);
    }

    #[tokio::test]
    async fn test_from_raster_defaults_the_tiling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.asc");
        let meta = RasterMeta::of_shape(Shape::new([2, 2]));
        let block = Block::new(Shape::new([2, 2]), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        write_raster(&path, &meta, &block).await.unwrap();

        let cluster = Cluster::local(1).unwrap();
        let (_, array) = from_raster::<f64>(&cluster, &path, None).await.unwrap();
        // The default extent far exceeds the array; one tile covers it.
        assert_eq!(array.nr_partitions(), 1);
        let gathered = array.gather(cluster.caller()).await.unwrap();
        assert_eq!(gathered.values(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[tokio::test]
    async fn test_to_raster_gathers_the_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.asc");
        let cluster = Cluster::local(2).unwrap();
        let tiling = Tiling::new(Shape::new([2, 4]), Shape::new([2, 2])).unwrap();
        let array = PartitionedArray::filled(&cluster, tiling, 2.5f64);
        let meta = RasterMeta::of_shape(Shape::new([2, 4]));

        to_raster(cluster.caller(), &array, &meta, &path).await.unwrap();
        let (_, read_block) = read_raster::<f64>(&path).await.unwrap();
        assert!(read_block.values().iter().all(|v| *v == 2.5));
    }
}
