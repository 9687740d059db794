// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Streaming data-quality monitoring ("sniffing") for VLBI correlator output.

The [`Sniffer`] ingests per-baseline visibility records, accumulates them
into fixed-size time/frequency windows per antenna pair, and emits
calibration diagnostics whenever a window completes: fringe delay, phase
and phase-rate from a two-stage Fourier peak search, channel-resolved
spectral fits, weight statistics, window-averaged spectra,
cross-polarization ratios, and an optional integrated bandpass.
 */

pub(crate) mod accumulate;
pub mod context;
pub mod error;
pub(crate) mod fringe;
pub(crate) mod math;
pub(crate) mod output;
pub mod sniffer;
pub(crate) mod time;

// Re-exports.
pub use context::{Antenna, CorrConfig, FreqSetup, IfBand, ObsContext, Scan, Sideband, Source};
pub use error::SnifferError;
pub use sniffer::{FeedOutcome, Sniffer, SnifferOpts, VisRecord, DEFAULT_MEMORY_CAP};

/// Complex double, the sample type of all accumulated spectra.
#[allow(non_camel_case_types)]
pub(crate) type c64 = num_complex::Complex<f64>;
