/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Numeric policies: how operations classify inputs and mark outputs.
//!
//! A [`Policies`] value bundles an input domain, input no-data
//! detection, and output no-data marking, and travels inside compute
//! requests, so remote executors apply exactly the caller's rules.
//! Out-of-domain and no-data cells produce the marked output element;
//! they are never errors.

use serde::Deserialize;
use serde::Serialize;

use crate::element::Element;

/// Which input values an operation accepts. Values outside the domain
/// yield the marked no-data output.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Domain {
    AllValues,
    NonNegative,
    NonZero,
}

/// How input cells are recognized as holding no value.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum NoDataDetect<T> {
    /// The element type's canonical marker (NaN for floats, the
    /// sentinel extreme for integers).
    Standard,
    /// A caller-chosen in-band value.
    Value(T),
}

/// How output cells are marked as holding no value.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum NoDataMark<T> {
    Standard,
    Value(T),
}

/// The policy record every operation takes. `In` is the input element
/// type, `Out` the output's; for the elementwise algebra they
/// coincide.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policies<In, Out = In> {
    pub domain: Domain,
    pub input_no_data: NoDataDetect<In>,
    pub output_no_data: NoDataMark<Out>,
}

impl<In: Element, Out: Element> Default for Policies<In, Out> {
    fn default() -> Self {
        Self {
            domain: Domain::AllValues,
            input_no_data: NoDataDetect::Standard,
            output_no_data: NoDataMark::Standard,
        }
    }
}

impl<In: Element, Out: Element> Policies<In, Out> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_domain(mut self, domain: Domain) -> Self {
        self.domain = domain;
        self
    }

    pub fn with_input_no_data(mut self, detect: NoDataDetect<In>) -> Self {
        self.input_no_data = detect;
        self
    }

    pub fn with_output_no_data(mut self, mark: NoDataMark<Out>) -> Self {
        self.output_no_data = mark;
        self
    }

    /// True if `value` counts as a missing input.
    pub fn is_input_no_data(&self, value: In) -> bool {
        match self.input_no_data {
            NoDataDetect::Standard => value.is_no_data(),
            NoDataDetect::Value(marker) => value == marker,
        }
    }

    /// The value that reads back as missing input; used to fill
    /// out-of-array halo cells.
    pub fn input_no_data_value(&self) -> In {
        match self.input_no_data {
            NoDataDetect::Standard => In::NO_DATA,
            NoDataDetect::Value(marker) => marker,
        }
    }

    /// The element written where an output has no value.
    pub fn no_data_mark(&self) -> Out {
        match self.output_no_data {
            NoDataMark::Standard => Out::NO_DATA,
            NoDataMark::Value(marker) => marker,
        }
    }

    /// True if `value` is a marked output.
    pub fn is_output_no_data(&self, value: Out) -> bool {
        match self.output_no_data {
            NoDataMark::Standard => value.is_no_data(),
            NoDataMark::Value(marker) => value == marker,
        }
    }

    /// True if `value` lies in the operation's accepted domain.
    pub fn domain_contains(&self, value: In) -> bool {
        match self.domain {
            Domain::AllValues => true,
            Domain::NonNegative => value >= In::ZERO,
            Domain::NonZero => value != In::ZERO,
        }
    }
}
