// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for all sniffer-related errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnifferError {
    #[error("Sniffer output name '{0}' is too long. No sniffing today")]
    FileNameTooLong(String),

    #[error("Cannot open {path} for write: {err}")]
    Create { path: String, err: std::io::Error },

    #[error(
        "Sniffer memory requirements are excessive ({need} bytes > {cap} bytes); \
         run without a sniffer or raise the cap"
    )]
    MemoryBudget { need: u64, cap: u64 },

    #[error("The sniffer solution interval must be positive; got {0} s")]
    SolutionInterval(f64),

    #[error("Floats per complex sample must be 2 or 3; got {0}")]
    NumComplex(usize),

    #[error("The FFT oversampling factor must be non-zero")]
    Oversample,

    #[error("{0}")]
    Context(#[from] crate::context::ObsContextError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
