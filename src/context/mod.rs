// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Metadata on an observation.

The sniffer never owns this information; it is the read-only observation
model maintained by the surrounding pipeline (antenna, source, frequency
setup, correlator configuration and scan tables). Only the fields the
engine actually consumes are represented.
 */

mod error;
mod from_file;

pub use error::ObsContextError;

use std::io::Write;

use itertools::Itertools;
use serde::Deserialize;

/// Spectral inversion convention of an IF. A lower sideband flips the sign
/// of delay, phase and phase-rate and mirrors channel indices about the
/// band centre.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Sideband {
    Upper,
    Lower,
}

impl Sideband {
    pub(crate) fn as_char(self) -> char {
        match self {
            Sideband::Upper => 'U',
            Sideband::Lower => 'L',
        }
    }
}

/// One antenna/station of the array.
#[derive(Debug, Clone, Deserialize)]
pub struct Antenna {
    pub name: String,
}

/// One observed source.
#[derive(Debug, Clone, Deserialize)]
pub struct Source {
    pub name: String,

    /// External (FITS) source ids, one per frequency setup; negative where
    /// the source is absent from that setup. Visibility records carry these
    /// ids 1-based.
    pub fits_ids: Vec<i32>,
}

/// One IF (frequency sub-band of the receiver) within a frequency setup.
#[derive(Debug, Clone, Deserialize)]
pub struct IfBand {
    /// Sky frequency at the band edge \[MHz\].
    pub freq: f64,

    /// Bandwidth \[MHz\].
    pub bw: f64,

    pub sideband: Sideband,

    /// The polarizations recorded for this IF, e.g. `['R', 'L']`.
    pub pols: Vec<char>,
}

/// A frequency setup: the set of IFs shared by one or more correlator
/// configurations.
#[derive(Debug, Clone, Deserialize)]
pub struct FreqSetup {
    pub ifs: Vec<IfBand>,
}

/// One correlator configuration epoch.
#[derive(Debug, Clone, Deserialize)]
pub struct CorrConfig {
    /// Integration time \[s\].
    pub t_int: f64,

    /// Index into [`ObsContext::freq_setups`].
    pub freq_setup: usize,

    /// Number of recorded polarizations per IF.
    pub num_pol: usize,
}

/// One scan: a contiguous on-source time range under one configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Scan {
    pub start_mjd: f64,
    pub stop_mjd: f64,

    /// Index into [`ObsContext::configs`].
    pub config: usize,

    /// The antennas participating in this scan.
    pub antennas: Vec<usize>,
}

/// The static observation model consumed read-only by the engine.
#[derive(Debug, Clone, Deserialize)]
pub struct ObsContext {
    /// The observation code, echoed into every report header.
    pub obs_code: String,

    pub antennas: Vec<Antenna>,
    pub sources: Vec<Source>,
    pub freq_setups: Vec<FreqSetup>,
    pub configs: Vec<CorrConfig>,
    pub scans: Vec<Scan>,

    /// Spectral channels per baseband channel in the visibility records.
    pub num_chan: usize,

    /// Channel bandwidth \[MHz\].
    pub chan_bw: f64,

    /// Stokes products per IF in the visibility records (1, 2 or 4).
    pub num_stokes: usize,
}

impl ObsContext {
    /// The largest IF count over all frequency setups; accumulators are
    /// sized for this.
    pub fn num_if(&self) -> usize {
        self.freq_setups
            .iter()
            .map(|fs| fs.ifs.len())
            .max()
            .unwrap_or(0)
    }

    /// The largest recorded-polarization count over all configurations.
    pub fn num_pol(&self) -> usize {
        self.configs.iter().map(|c| c.num_pol).max().unwrap_or(0)
    }

    /// The longest integration time of any configuration \[s\]; this is the
    /// sniffer's time-bin grid spacing.
    pub fn max_t_int(&self) -> f64 {
        self.configs.iter().fold(0.0, |a, c| c.t_int.max(a))
    }

    /// The scan containing `mjd` in which antenna `ant` participates.
    pub(crate) fn scan_at(&self, mjd: f64, ant: usize) -> Option<usize> {
        self.scans.iter().position(|s| {
            s.antennas.contains(&ant) && mjd >= s.start_mjd && mjd < s.stop_mjd
        })
    }

    /// Build the external (FITS) source id → internal source index table.
    /// Record ids are 1-based on the wire; the table is indexed by id − 1.
    pub(crate) fn source_remap(&self) -> Vec<Option<usize>> {
        let max = self
            .sources
            .iter()
            .flat_map(|s| s.fits_ids.iter().copied())
            .max()
            .unwrap_or(-1);
        if max < 0 {
            return Vec::new();
        }
        let mut map = vec![None; max as usize + 1];
        for (i, source) in self.sources.iter().enumerate() {
            for &fits_id in &source.fits_ids {
                if fits_id >= 0 {
                    map[fits_id as usize] = Some(i);
                }
            }
        }
        map
    }

    /// Check the cross-table invariants the engine relies on.
    pub fn validate(&self) -> Result<(), ObsContextError> {
        if self.antennas.is_empty() {
            return Err(ObsContextError::NoAntennas);
        }
        if self.configs.is_empty() {
            return Err(ObsContextError::NoConfigs);
        }
        if self.num_chan == 0 {
            return Err(ObsContextError::NoChannels);
        }
        if self.chan_bw <= 0.0 {
            return Err(ObsContextError::BadBandwidth(self.chan_bw));
        }
        if !matches!(self.num_stokes, 1 | 2 | 4) {
            return Err(ObsContextError::BadStokes(self.num_stokes));
        }
        for (i, setup) in self.freq_setups.iter().enumerate() {
            if setup.ifs.is_empty() {
                return Err(ObsContextError::EmptyFreqSetup(i));
            }
        }
        for (i, config) in self.configs.iter().enumerate() {
            if config.t_int <= 0.0 {
                return Err(ObsContextError::BadTInt {
                    config: i,
                    t_int: config.t_int,
                });
            }
            if config.num_pol == 0 {
                return Err(ObsContextError::NoPols { config: i });
            }
            let setup = self.freq_setups.get(config.freq_setup).ok_or(
                ObsContextError::BadFreqSetup {
                    config: i,
                    setup: config.freq_setup,
                    len: self.freq_setups.len(),
                },
            )?;
            if let Some(band) = setup.ifs.iter().find(|b| b.pols.len() < config.num_pol) {
                return Err(ObsContextError::NotEnoughPols {
                    config: i,
                    num_pol: config.num_pol,
                    got: band.pols.len(),
                });
            }
        }
        for (i, scan) in self.scans.iter().enumerate() {
            if scan.config >= self.configs.len() {
                return Err(ObsContextError::BadScanConfig {
                    scan: i,
                    config: scan.config,
                    len: self.configs.len(),
                });
            }
            if let Some(&ant) = scan.antennas.iter().find(|&&a| a >= self.antennas.len()) {
                return Err(ObsContextError::BadScanAntenna {
                    scan: i,
                    antenna: ant,
                    len: self.antennas.len(),
                });
            }
        }
        for (i, source) in self.sources.iter().enumerate() {
            if source.fits_ids.len() != self.freq_setups.len() {
                return Err(ObsContextError::BadSourceIds {
                    src: i,
                    got: source.fits_ids.len(),
                    expected: self.freq_setups.len(),
                });
            }
        }
        Ok(())
    }

    /// Write a human-readable summary of the observation model; this is the
    /// content of the sniffer's `.log` artifact.
    pub fn write_summary<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        writeln!(w, "obscode:  {}", self.obs_code)?;
        writeln!(w, "nAntenna = {}", self.antennas.len())?;
        for (i, a) in self.antennas.iter().enumerate() {
            writeln!(w, "  {i:3}  {}", a.name)?;
        }
        writeln!(w, "nSource = {}", self.sources.len())?;
        for (i, s) in self.sources.iter().enumerate() {
            writeln!(
                w,
                "  {i:3}  {:<10}  fits ids: {}",
                s.name,
                s.fits_ids.iter().join(" ")
            )?;
        }
        writeln!(w, "nFreqSet = {}", self.freq_setups.len())?;
        for (i, fs) in self.freq_setups.iter().enumerate() {
            writeln!(w, "  freq set {i}: {} IFs", fs.ifs.len())?;
            for (j, band) in fs.ifs.iter().enumerate() {
                writeln!(
                    w,
                    "    IF {j}: {:.3} MHz  bw {:.3} MHz  side {}  pols {}",
                    band.freq,
                    band.bw,
                    band.sideband.as_char(),
                    band.pols.iter().join("")
                )?;
            }
        }
        writeln!(w, "nConfig = {}", self.configs.len())?;
        for (i, c) in self.configs.iter().enumerate() {
            writeln!(
                w,
                "  config {i}: tInt {:.3} s  freq set {}  nPol {}",
                c.t_int, c.freq_setup, c.num_pol
            )?;
        }
        writeln!(w, "nScan = {}", self.scans.len())?;
        for (i, s) in self.scans.iter().enumerate() {
            writeln!(
                w,
                "  scan {i}: MJD {:.6}-{:.6}  config {}  antennas {}",
                s.start_mjd,
                s.stop_mjd,
                s.config,
                s.antennas.iter().join(" ")
            )?;
        }
        writeln!(
            w,
            "nChan = {}  chanBW = {:.3} MHz  nStokes = {}",
            self.num_chan, self.chan_bw, self.num_stokes
        )?;
        Ok(())
    }
}
