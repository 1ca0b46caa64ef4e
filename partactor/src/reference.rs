/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Identifiers for the entities of the partition runtime.
//!
//! Ids implement a concrete syntax that round-trips through
//! `Display` and `FromStr`:
//!
//! ```text
//! loc[2]          // the locality with rank 2
//! loc[2].part[7]  // partition 7, owned by locality 2
//! ```
//!
//! Ids are plain names: they do not confer the ability to reach the
//! named entity. A reachable partition is a [`crate::partition::
//! PartitionRef`], which pairs a [`PartitionId`] with a route to its
//! serving port.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// The type of error encountered while parsing ids.
#[derive(thiserror::Error, Debug)]
pub enum ReferenceParsingError {
    /// The parser expected more input.
    #[error("expected token")]
    Empty,

    /// The parser encountered unexpected input.
    #[error("unexpected token: {0}")]
    Unexpected(String),

    /// The parser encountered an error parsing an integer.
    #[error(transparent)]
    ParseInt(#[from] ParseIntError),
}

/// Consume `name` followed by a bracketed integer (`name[123]`),
/// returning the integer and the remaining input.
fn parse_field<'a>(input: &'a str, name: &str) -> Result<(u64, &'a str), ReferenceParsingError> {
    let rest = input
        .strip_prefix(name)
        .and_then(|rest| rest.strip_prefix('['))
        .ok_or_else(|| ReferenceParsingError::Unexpected(input.to_string()))?;
    let close = rest.find(']').ok_or(ReferenceParsingError::Empty)?;
    let value = rest[..close].parse::<u64>()?;
    Ok((value, &rest[close + 1..]))
}

fn ensure_consumed(rest: &str) -> Result<(), ReferenceParsingError> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(ReferenceParsingError::Unexpected(rest.to_string()))
    }
}

/// Names a locality: one runtime node hosting partitions and
/// executing tasks. Ranks are dense and assigned at cluster
/// construction.
#[derive(
    Debug, Serialize, Deserialize, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash
)]
pub struct LocalityId(pub usize);

impl LocalityId {
    /// The locality's rank.
    pub fn rank(&self) -> usize {
        self.0
    }

    /// The id of this locality's `index`th partition.
    pub fn partition_id(&self, index: u64) -> PartitionId {
        PartitionId(*self, index)
    }
}

impl fmt::Display for LocalityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loc[{}]", self.0)
    }
}

impl FromStr for LocalityId {
    type Err = ReferenceParsingError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (rank, rest) = parse_field(input, "loc")?;
        ensure_consumed(rest)?;
        Ok(LocalityId(rank as usize))
    }
}

/// Names a partition: a dense array block owned by a locality.
/// Partition indices are allocated monotonically by the owning
/// locality and never reused within a run.
#[derive(
    Debug, Serialize, Deserialize, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash
)]
pub struct PartitionId(pub LocalityId, pub u64);

impl PartitionId {
    /// The locality that owns the partition.
    pub fn locality_id(&self) -> LocalityId {
        self.0
    }

    /// The partition's index within its locality.
    pub fn index(&self) -> u64 {
        self.1
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.part[{}]", self.0, self.1)
    }
}

impl FromStr for PartitionId {
    type Err = ReferenceParsingError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (rank, rest) = parse_field(input, "loc")?;
        let rest = rest
            .strip_prefix('.')
            .ok_or_else(|| ReferenceParsingError::Unexpected(rest.to_string()))?;
        let (index, rest) = parse_field(rest, "part")?;
        ensure_consumed(rest)?;
        Ok(PartitionId(LocalityId(rank as usize), index))
    }
}
