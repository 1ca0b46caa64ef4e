/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Flow direction codes.
//!
//! A flow direction network is a `u8` array in which every cell names
//! the neighbor it drains to. Codes follow the local drain direction
//! (LDD) convention, laid out like a numeric keypad centered on the
//! cell:
//!
//! ```text
//!     7 8 9        NW N NE
//!     4 5 6   =     W .  E
//!     1 2 3        SW S SE
//! ```
//!
//! `5` marks a sink, a cell that keeps everything it receives. Any
//! other value outside `1..=9`, including the `u8` no-data marker
//! `255`, decodes as [`Flow::NoData`]: the cell routes nothing.

use crate::element::Element;

/// The eight compass neighbors of a cell. Row 0 is the northern edge
/// of the array and column 0 the western edge, so north is a step
/// toward smaller row coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    North,
    NorthEast,
    East,
    SouthEast,
    South,
    SouthWest,
    West,
    NorthWest,
}

impl Direction {
    pub const ALL: [Direction; 8] = [
        Direction::North,
        Direction::NorthEast,
        Direction::East,
        Direction::SouthEast,
        Direction::South,
        Direction::SouthWest,
        Direction::West,
        Direction::NorthWest,
    ];

    /// The `[row, column]` step toward this neighbor.
    pub fn delta(self) -> [isize; 2] {
        match self {
            Direction::North => [-1, 0],
            Direction::NorthEast => [-1, 1],
            Direction::East => [0, 1],
            Direction::SouthEast => [1, 1],
            Direction::South => [1, 0],
            Direction::SouthWest => [1, -1],
            Direction::West => [0, -1],
            Direction::NorthWest => [-1, -1],
        }
    }

    /// The keypad code naming this neighbor.
    pub fn code(self) -> u8 {
        match self {
            Direction::North => 8,
            Direction::NorthEast => 9,
            Direction::East => 6,
            Direction::SouthEast => 3,
            Direction::South => 2,
            Direction::SouthWest => 1,
            Direction::West => 4,
            Direction::NorthWest => 7,
        }
    }
}

/// A cell's routing state in a flow direction network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flow {
    /// Material moves to the neighbor in the given direction.
    Toward(Direction),
    /// The cell keeps everything it receives.
    Sink,
    /// The cell routes nothing.
    NoData,
}

impl Flow {
    /// Code of a sink cell.
    pub const SINK: u8 = 5;

    /// Decode a keypad flow code. Codes outside `1..=9` count as
    /// no-data.
    pub fn decode(code: u8) -> Flow {
        match code {
            8 => Flow::Toward(Direction::North),
            9 => Flow::Toward(Direction::NorthEast),
            6 => Flow::Toward(Direction::East),
            3 => Flow::Toward(Direction::SouthEast),
            2 => Flow::Toward(Direction::South),
            1 => Flow::Toward(Direction::SouthWest),
            4 => Flow::Toward(Direction::West),
            Flow::SINK => Flow::Sink,
            _ => Flow::NoData,
        }
    }

    pub fn encode(self) -> u8 {
        match self {
            Flow::Toward(direction) => direction.code(),
            Flow::Sink => Flow::SINK,
            Flow::NoData => u8::NO_DATA,
        }
    }
}

#[cfg(test)]
mod tests {
    use gridslice::Shape;
    use gridslice::offset_index;

    use super::*;

    #[test]
    fn test_decode_every_keypad_code() {
        assert_eq!(Flow::decode(8), Flow::Toward(Direction::North));
        assert_eq!(Flow::decode(9), Flow::Toward(Direction::NorthEast));
        assert_eq!(Flow::decode(6), Flow::Toward(Direction::East));
        assert_eq!(Flow::decode(3), Flow::Toward(Direction::SouthEast));
        assert_eq!(Flow::decode(2), Flow::Toward(Direction::South));
        assert_eq!(Flow::decode(1), Flow::Toward(Direction::SouthWest));
        assert_eq!(Flow::decode(4), Flow::Toward(Direction::West));
        assert_eq!(Flow::decode(7), Flow::Toward(Direction::NorthWest));
        assert_eq!(Flow::decode(5), Flow::Sink);
    }

    #[test]
    fn test_codes_outside_keypad_are_no_data() {
        for code in [0u8, 10, 42, 254, u8::NO_DATA] {
            assert_eq!(Flow::decode(code), Flow::NoData);
        }
    }

    #[test]
    fn test_encode_round_trip() {
        for code in 1..=9u8 {
            assert_eq!(Flow::decode(code).encode(), code);
        }
        assert_eq!(Flow::NoData.encode(), u8::NO_DATA);
    }

    #[test]
    fn test_deltas_step_toward_the_neighbor() {
        let shape = Shape::new([3, 3]);
        assert_eq!(offset_index([1, 1], Direction::North.delta(), &shape), Some([0, 1]));
        assert_eq!(offset_index([1, 1], Direction::SouthWest.delta(), &shape), Some([2, 0]));
        // Stepping off the array is reported, not wrapped.
        assert_eq!(offset_index([0, 1], Direction::North.delta(), &shape), None);
        assert_eq!(offset_index([2, 2], Direction::SouthEast.delta(), &shape), None);
    }

    #[test]
    fn test_all_directions_are_distinct_neighbors() {
        let shape = Shape::new([3, 3]);
        let mut seen = std::collections::HashSet::new();
        for direction in Direction::ALL {
            let neighbor = offset_index([1, 1], direction.delta(), &shape).unwrap();
            assert_ne!(neighbor, [1, 1]);
            assert!(seen.insert(neighbor));
        }
        assert_eq!(seen.len(), 8);
    }
}
