/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Configuration for the partition runtime.
//!
//! Knobs have compiled defaults and may be overridden through the
//! environment. The global configuration is loaded once, on first
//! use; tests that need different values should construct a [`Config`]
//! directly and thread it through.

use std::env;
use std::sync::LazyLock;

use crate::channel::ChannelTransport;

/// Runtime configuration knobs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum frame length accepted and produced by the TCP codec.
    pub codec_max_frame_length: usize,

    /// Transport used by clusters that do not specify one.
    pub default_transport: ChannelTransport,

    /// Partition extent per dimension used when a tiling is not
    /// supplied explicitly.
    pub default_partition_extent: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            codec_max_frame_length: 64 * 1024 * 1024, // 64 MB
            default_transport: ChannelTransport::Local,
            default_partition_extent: 1000,
        }
    }
}

impl Config {
    /// A configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables, falling back to
    /// the defaults for unset or unparsable values.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("GRIDFLOW_CODEC_MAX_FRAME_LENGTH") {
            match val.parse::<usize>() {
                Ok(parsed) => config.codec_max_frame_length = parsed,
                Err(_) => tracing::warn!("ignoring bad GRIDFLOW_CODEC_MAX_FRAME_LENGTH: {}", val),
            }
        }

        if let Ok(val) = env::var("GRIDFLOW_DEFAULT_TRANSPORT") {
            match val.parse::<ChannelTransport>() {
                Ok(parsed) => config.default_transport = parsed,
                Err(_) => tracing::warn!("ignoring bad GRIDFLOW_DEFAULT_TRANSPORT: {}", val),
            }
        }

        if let Ok(val) = env::var("GRIDFLOW_DEFAULT_PARTITION_EXTENT") {
            match val.parse::<usize>() {
                Ok(parsed) if parsed > 0 => config.default_partition_extent = parsed,
                _ => tracing::warn!("ignoring bad GRIDFLOW_DEFAULT_PARTITION_EXTENT: {}", val),
            }
        }

        config
    }
}

static GLOBAL: LazyLock<Config> = LazyLock::new(Config::from_env);

/// The process-wide configuration, loaded from the environment on
/// first use.
pub fn global() -> &'static Config {
    &GLOBAL
}
