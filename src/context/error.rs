// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ObsContextError {
    #[error("The observation model has no antennas")]
    NoAntennas,

    #[error("The observation model has no correlator configurations")]
    NoConfigs,

    #[error("The channel count must be non-zero")]
    NoChannels,

    #[error("The channel bandwidth must be positive; got {0} MHz")]
    BadBandwidth(f64),

    #[error("The number of Stokes products must be 1, 2 or 4; got {0}")]
    BadStokes(usize),

    #[error("Frequency setup {0} defines no IFs")]
    EmptyFreqSetup(usize),

    #[error("Config {config} has a non-positive integration time {t_int} s")]
    BadTInt { config: usize, t_int: f64 },

    #[error("Config {config} refers to frequency setup {setup}, but only {len} are defined")]
    BadFreqSetup {
        config: usize,
        setup: usize,
        len: usize,
    },

    #[error("Config {config} records no polarizations")]
    NoPols { config: usize },

    #[error("Config {config} wants {num_pol} polarizations, but an IF records only {got}")]
    NotEnoughPols {
        config: usize,
        num_pol: usize,
        got: usize,
    },

    #[error("Scan {scan} refers to configuration {config}, but only {len} are defined")]
    BadScanConfig {
        scan: usize,
        config: usize,
        len: usize,
    },

    #[error("Scan {scan} refers to antenna {antenna}, but only {len} are defined")]
    BadScanAntenna {
        scan: usize,
        antenna: usize,
        len: usize,
    },

    #[error("Source {src} carries {got} FITS ids, but there are {expected} frequency setups")]
    BadSourceIds {
        src: usize,
        got: usize,
        expected: usize,
    },

    #[error("Couldn't decode toml structure from {file}:\n{err}")]
    TomlDecode { file: String, err: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
