// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
The sniffer engine.

One [`Sniffer`] monitors an entire correlation run. Each call to
[`Sniffer::feed`] routes a visibility record to the accumulator of its
antenna pair; when a record lands past the pair's current window (or on a
different source), the completed window is dumped as calibration reports
and the accumulator reset. Records must arrive in non-decreasing time
order per antenna pair; this is a precondition, not validated here.
 */

#[cfg(test)]
mod tests;

use std::f64::consts::TAU;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::mem::size_of;
use std::path::Path;

use log::{debug, warn};
use ndarray::s;

use crate::accumulate::{Accumulator, AccumulatorGrid, CrossHand, GridDims, Window};
use crate::context::{ObsContext, Sideband};
use crate::error::SnifferError;
use crate::fringe::{FringeFit, FringeFitter};
use crate::math::{atan2, cexp};
use crate::output::{self, OutputSet};
use crate::time::{format_mjd, mjd_day_hour};
use crate::c64;

/// Default memory budget for the accumulator grid \[bytes\].
pub const DEFAULT_MEMORY_CAP: u64 = 2_000_000_000;

/// Window snapshots are emitted at most once per source per this interval
/// \[days\] (15 minutes).
const SNAPSHOT_GAP: f64 = 15.0 / 1440.0;

/// Engine construction options.
#[derive(Debug, Clone)]
pub struct SnifferOpts {
    /// Desired fringe-fit solution interval \[s\]; rounded down to a whole
    /// number of integration times.
    pub solution_interval: f64,

    /// Floats per complex sample in the record data: 2, or 3 when each
    /// sample carries its own weight.
    pub num_complex: usize,

    /// Accumulate a per-channel bandpass over the whole run and emit it at
    /// teardown.
    pub write_bandpass: bool,

    /// Memory budget for the accumulator grid \[bytes\]. When the estimate
    /// exceeds it, construction fails and the host is expected to run
    /// without a sniffer rather than abort.
    pub memory_cap: u64,

    /// Fourier oversampling factor of the search grid.
    pub fft_oversample: usize,
}

impl Default for SnifferOpts {
    fn default() -> SnifferOpts {
        SnifferOpts {
            solution_interval: 30.0,
            num_complex: 2,
            write_bandpass: false,
            memory_cap: DEFAULT_MEMORY_CAP,
            fft_oversample: 3,
        }
    }
}

/// One visibility record offered to [`Sniffer::feed`].
#[derive(Debug, Clone)]
pub struct VisRecord<'a> {
    /// External (FITS) source id, 1-based on the wire.
    pub source_id: i32,

    /// Record timestamp \[MJD\].
    pub mjd: f64,

    /// Packed antenna pair: `256 × a1 + a2`, both 1-based.
    pub baseline: i32,

    /// Sideband of the record's IFs.
    pub sideband: Sideband,

    /// Per-(IF, Stokes) weights followed by interleaved complex samples.
    /// Channel `c` of IF `i`, Stokes `p` starts at
    /// `num_stokes·num_if + stride·num_chan·i + p·num_complex + c·stride`,
    /// with `stride = num_complex·num_stokes`.
    pub data: &'a [f32],
}

/// Outcome of feeding one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    /// Record accumulated; carries the running count of accepted records.
    Accepted(u64),

    /// Record intentionally ignored: unknown source, unresolvable scan or
    /// configuration, or the one-past-the-window time slot.
    Skipped,

    /// Record carried an out-of-range time-bin index; logged and dropped,
    /// not fatal.
    BadTimeBin,
}

/// Grid sizing and timing constants fixed at construction.
struct Layout {
    num_if: usize,
    num_pol: usize,
    num_stokes: usize,
    num_chan: usize,
    num_time: usize,
    num_ant: usize,
    num_complex: usize,
    /// Time-bin grid spacing \[s\].
    delta_t: f64,
    /// Actual solution interval \[s\]: `num_time × delta_t`.
    sol_int: f64,
    /// \[MHz\]
    bw: f64,
}

/// Lookup tables for the configuration epoch currently in effect,
/// rebuilt whenever the record stream moves to a new configuration.
#[derive(Default)]
struct CurrentConfig {
    index: Option<usize>,
    num_if: usize,
    num_pol: usize,
    /// IF index per baseband channel.
    bbc_if: Vec<usize>,
    /// Polarization per baseband channel.
    bbc_pol: Vec<char>,
}

/// The streaming monitor. See the crate documentation for the data model;
/// one instance owns the accumulator grid, the Fourier search engine and
/// the output streams for a whole correlation run.
pub struct Sniffer<'a> {
    obs: &'a ObsContext,
    layout: Layout,
    files: OutputSet,
    fitter: FringeFitter,
    grid: AccumulatorGrid,
    cur: CurrentConfig,
    /// External (FITS) source id − 1 → internal source index.
    source_remap: Vec<Option<usize>>,
    memory_need: u64,
    num_rec: u64,
    /// Counts configuration adoptions, to tell whether multiple setups
    /// were encountered.
    num_configs_used: u32,
}

impl<'a> Sniffer<'a> {
    /// Construct an engine for the given observation. `filebase` prefixes
    /// every output artifact. On error nothing is left open; in
    /// particular, a [`SnifferError::MemoryBudget`] is the cue for the
    /// host to run without a sniffer.
    pub fn new(
        obs: &'a ObsContext,
        filebase: &Path,
        opts: SnifferOpts,
    ) -> Result<Sniffer<'a>, SnifferError> {
        obs.validate()?;
        if !(opts.solution_interval > 0.0) {
            return Err(SnifferError::SolutionInterval(opts.solution_interval));
        }
        if !matches!(opts.num_complex, 2 | 3) {
            return Err(SnifferError::NumComplex(opts.num_complex));
        }
        if opts.fft_oversample == 0 {
            return Err(SnifferError::Oversample);
        }

        output::write_summary_log(filebase, obs)?;

        let delta_t = obs.max_t_int();
        let mut num_time = (opts.solution_interval / delta_t) as usize;
        if num_time <= 1 {
            num_time = 1;
            warn!(
                "Sniffer interval is not long compared to the integration time; \
                 changing to {delta_t} seconds"
            );
        }
        let layout = Layout {
            num_if: obs.num_if(),
            num_pol: obs.num_pol(),
            num_stokes: obs.num_stokes,
            num_chan: obs.num_chan,
            num_time,
            num_ant: obs.antennas.len(),
            num_complex: opts.num_complex,
            delta_t,
            sol_int: delta_t * num_time as f64,
            bw: obs.chan_bw,
        };

        let memory_need = (layout.num_time
            * layout.num_chan
            * layout.num_if
            * layout.num_pol
            * layout.num_ant
            * layout.num_ant) as u64
            * size_of::<c64>() as u64;
        if memory_need > opts.memory_cap {
            return Err(SnifferError::MemoryBudget {
                need: memory_need,
                cap: opts.memory_cap,
            });
        }
        debug!("Sniffer accumulators need {} bytes", memory_need);

        let files = OutputSet::create(filebase, obs, opts.write_bandpass)?;

        let dims = GridDims {
            num_bbc: layout.num_if * layout.num_pol,
            num_if: layout.num_if,
            num_chan: layout.num_chan,
            num_time: layout.num_time,
            num_source: obs.sources.len(),
        };
        let grid = AccumulatorGrid::new(layout.num_ant, &dims, opts.write_bandpass);
        let fitter = FringeFitter::new(
            layout.num_chan,
            layout.num_time,
            opts.fft_oversample,
            layout.sol_int,
            layout.bw,
        );
        let source_remap = obs.source_remap();

        Ok(Sniffer {
            obs,
            layout,
            files,
            fitter,
            grid,
            cur: CurrentConfig::default(),
            source_remap,
            memory_need,
            num_rec: 0,
            num_configs_used: 0,
        })
    }

    /// Memory estimate of the accumulator grid \[bytes\].
    pub fn memory_need(&self) -> u64 {
        self.memory_need
    }

    /// Count of records accepted so far.
    pub fn num_records(&self) -> u64 {
        self.num_rec
    }

    /// How many configuration epochs the stream has moved through.
    pub fn num_configs_used(&self) -> u32 {
        self.num_configs_used
    }

    /// Offer one visibility record. Non-fatal problems are reported in the
    /// [`FeedOutcome`]; an `Err` only means an output stream failed.
    pub fn feed(&mut self, rec: &VisRecord) -> Result<FeedOutcome, SnifferError> {
        if rec.source_id < 1 {
            return Ok(FeedOutcome::Skipped);
        }
        let Some(Some(source)) = self
            .source_remap
            .get(rec.source_id as usize - 1)
            .copied()
        else {
            return Ok(FeedOutcome::Skipped);
        };

        let mjd = rec.mjd;
        let a1 = rec.baseline / 256 - 1;
        let a2 = rec.baseline % 256 - 1;
        if a1 < 0
            || a2 < 0
            || a1 as usize >= self.layout.num_ant
            || a2 as usize >= self.layout.num_ant
        {
            warn!("Record baseline {} decodes outside the antenna table", rec.baseline);
            return Ok(FeedOutcome::Skipped);
        }
        let (a1, a2) = (a1 as usize, a2 as usize);

        let Some(scan) = self.obs.scan_at(mjd, a1) else {
            return Ok(FeedOutcome::Skipped);
        };
        let Some(scan2) = self.obs.scan_at(mjd, a2) else {
            return Ok(FeedOutcome::Skipped);
        };
        if scan != scan2 {
            warn!("antenna {a1} and antenna {a2} refer to different scans ({scan} and {scan2})");
        }

        let config = self.obs.scans[scan].config;
        if self.cur.index != Some(config) {
            self.adopt_config(config, mjd)?;
        }
        if self.cur.bbc_if.is_empty() {
            return Ok(FeedOutcome::Skipped);
        }

        // Window rollover or a source change finishes the pair's window.
        let rollover = {
            let acc = self.grid.get(a1, a2);
            acc.window.map_or(false, |w| mjd > w.stop) || acc.source != Some(source)
        };
        if rollover {
            self.dump_and_reset(a1, a2, source)?;
        }

        let layout = &self.layout;
        let cur = &self.cur;
        let acc = self.grid.get_mut(a1, a2);
        let win = match acc.window {
            Some(win) => win,
            None => {
                // Anchor a new window half a grid spacing before its first
                // record so the record lands mid-bin.
                let start = mjd - 0.5 * layout.delta_t / 86400.0;
                let win = Window {
                    start,
                    stop: start + layout.sol_int / 86400.0,
                };
                acc.window = Some(win);
                win
            }
        };

        let index = ((mjd - win.start) / (layout.delta_t / 86400.0)) as isize;
        if index < 0 || index > layout.num_time as isize {
            warn!(
                "Developer error: bad time slot for mjd={mjd:14.6} index={index} \
                 (max index expected={}). This should not impact the correctness or \
                 completeness of the data, but should be reported",
                layout.num_time - 1
            );
            return Ok(FeedOutcome::BadTimeBin);
        }
        if index == layout.num_time as isize {
            // One more interval than expected holds data. Rare and benign;
            // don't raise a stink, just move on.
            return Ok(FeedOutcome::Skipped);
        }
        let index = index as usize;

        let stride = layout.num_complex * layout.num_stokes;
        let needed = layout.num_stokes * cur.num_if + stride * layout.num_chan * cur.num_if;
        if rec.data.len() < needed {
            warn!(
                "Record data holds {} floats but the configuration needs {}; record ignored",
                rec.data.len(),
                needed
            );
            return Ok(FeedOutcome::Skipped);
        }

        for i in 0..cur.num_if {
            for p in 0..cur.num_pol {
                let bbc = i * cur.num_pol + p;
                let weight = f64::from(rec.data[p + layout.num_stokes * i]);
                let offset = layout.num_stokes * cur.num_if
                    + stride * layout.num_chan * i
                    + p * layout.num_complex;
                acc.add(
                    bbc,
                    index,
                    weight,
                    complex_samples(&rec.data[offset..], stride, layout.num_chan),
                    rec.sideband,
                    mjd,
                );
            }

            // A positive cross-hand weight flags the presence of
            // cross-polar data for this IF.
            if layout.num_stokes == 4 && rec.data[2 + layout.num_stokes * i] > 0.0 {
                acc.if_to_bbc[i] = Some([i * cur.num_pol, i * cur.num_pol + 1]);
                for hand in CrossHand::ALL {
                    let stokes = hand.stokes();
                    let weight = f64::from(rec.data[stokes + layout.num_stokes * i]);
                    let offset = layout.num_stokes * cur.num_if
                        + stride * layout.num_chan * i
                        + stokes * layout.num_complex;
                    acc.add_cross_hand(
                        i,
                        hand,
                        index,
                        weight,
                        complex_samples(&rec.data[offset..], stride, layout.num_chan),
                    );
                }
            }
        }

        self.num_rec += 1;
        Ok(FeedOutcome::Accepted(self.num_rec))
    }

    /// Emit the integrated bandpass (if enabled) and flush every output
    /// stream. Windows still accumulating are not dumped; only complete
    /// windows ever produce reports.
    pub fn finish(mut self) -> Result<(), SnifferError> {
        let Sniffer {
            obs,
            layout,
            files,
            grid,
            cur,
            ..
        } = &mut self;
        if let Some(bp) = files.bandpass.as_mut() {
            for acc in grid.iter() {
                if acc.is_auto() {
                    // Autocorrelations carry no bandpass, at least for now.
                    continue;
                }
                for bbc in 0..acc.num_bbc() {
                    dump_accumulator_bandpass(*obs, layout, cur, bp, acc, bbc)?;
                }
            }
        }
        files.flush_all()?;
        Ok(())
    }

    /// Rebuild the per-bbc lookup tables for a new configuration epoch,
    /// and log the channel layout if the frequency setup changed.
    fn adopt_config(&mut self, config: usize, mjd: f64) -> Result<(), SnifferError> {
        let cfg = &self.obs.configs[config];
        let setup = &self.obs.freq_setups[cfg.freq_setup];
        let write_channels = match self.cur.index {
            None => true,
            Some(prev) => self.obs.configs[prev].freq_setup != cfg.freq_setup,
        };

        let num_if = setup.ifs.len();
        let num_pol = cfg.num_pol;
        self.cur = CurrentConfig {
            index: Some(config),
            num_if,
            num_pol,
            bbc_if: Vec::with_capacity(num_if * num_pol),
            bbc_pol: Vec::with_capacity(num_if * num_pol),
        };
        self.num_configs_used += 1;

        if num_if * num_pol > self.layout.num_if * self.layout.num_pol {
            warn!(
                "Configuration {config} defines {num_if}×{num_pol} baseband channels, \
                 more than the grid was sized for; its records are ignored"
            );
            return Ok(());
        }
        for (i, band) in setup.ifs.iter().enumerate() {
            for p in 0..num_pol {
                self.cur.bbc_if.push(i);
                self.cur.bbc_pol.push(band.pols[p]);
            }
        }

        if write_channels {
            let num_bbc = num_if * num_pol;
            writeln!(
                self.files.channels,
                "MJD {mjd:14.8} {num_bbc} {}",
                cfg.freq_setup + 1
            )?;
            for bbc in 0..num_bbc {
                let band = &setup.ifs[self.cur.bbc_if[bbc]];
                writeln!(
                    self.files.channels,
                    "{} {:5.3} {:5.3} {} {}",
                    bbc + 1,
                    band.freq,
                    band.bw,
                    band.sideband.as_char(),
                    self.cur.bbc_pol[bbc]
                )?;
            }
        }
        Ok(())
    }

    fn dump_and_reset(
        &mut self,
        a1: usize,
        a2: usize,
        new_source: usize,
    ) -> Result<(), SnifferError> {
        let Sniffer {
            obs,
            layout,
            files,
            fitter,
            grid,
            cur,
            ..
        } = self;
        let acc = grid.get_mut(a1, a2);
        dump(*obs, layout, cur, files, fitter, acc)?;
        acc.reset();
        acc.source = Some(new_source);
        Ok(())
    }
}

/// Iterate the complex samples of one baseband channel out of the record's
/// flat float array.
fn complex_samples(data: &[f32], stride: usize, num_chan: usize) -> impl Iterator<Item = c64> + '_ {
    (0..num_chan).map(move |c| {
        let z = &data[c * stride..];
        c64::new(f64::from(z[0]), f64::from(z[1]))
    })
}

/// Write every report due for a completed window. A no-op unless the
/// accumulator has a source, a configuration is in effect and at least one
/// record was folded into the window.
fn dump(
    obs: &ObsContext,
    layout: &Layout,
    cur: &CurrentConfig,
    files: &mut OutputSet,
    fitter: &mut FringeFitter,
    acc: &mut Accumulator,
) -> Result<(), SnifferError> {
    let (Some(source), Some(config)) = (acc.source, cur.index) else {
        return Ok(());
    };
    let Some(mjd) = acc.mean_mjd() else {
        return Ok(());
    };
    let Some(win) = acc.window else {
        return Ok(());
    };

    // Window snapshot, gated to at most one per source per 15 minutes and
    // to windows where the best-covered channel has >= 75% of its bins.
    if win.start > acc.last_snapshot[source] + SNAPSHOT_GAP
        && acc.max_num_rec() as usize >= layout.num_time * 3 / 4
    {
        acc.last_snapshot[source] = win.start;
        write_snapshot(obs, layout, cur, files, acc, source, config, win)?;
    }

    if acc.is_auto() {
        write_weights(obs, files, acc, mjd)?;
    } else {
        write_fringe_fits(obs, layout, cur, files, fitter, acc, source, mjd)?;
    }

    Ok(())
}

/// The window-averaged spectrum reports: real per-channel values for an
/// autocorrelation, amplitude/phase for a cross-correlation.
#[allow(clippy::too_many_arguments)]
fn write_snapshot(
    obs: &ObsContext,
    layout: &Layout,
    cur: &CurrentConfig,
    files: &mut OutputSet,
    acc: &Accumulator,
    source: usize,
    config: usize,
    win: Window,
) -> Result<(), SnifferError> {
    let fp = if acc.is_auto() {
        &mut files.acb
    } else {
        &mut files.xcb
    };

    writeln!(
        fp,
        "timerange: {} {} obscode: {} chans: {} x {}",
        format_mjd(win.start),
        format_mjd(win.stop),
        obs.obs_code,
        layout.num_chan,
        acc.num_bbc()
    )?;
    writeln!(
        fp,
        "source: {} bandw: {:6.3} MHz",
        obs.sources[source].name, layout.bw
    )?;
    let setup = &obs.freq_setups[obs.configs[config].freq_setup];
    for band in setup.ifs.iter().take(cur.num_if) {
        let freq_ghz = band.freq / 1000.0;
        for p in 0..cur.num_pol {
            let pol = band.pols[p];
            writeln!(
                fp,
                "bandfreq: {freq_ghz:9.6} GHz polar: {pol}{pol} side: {} bbchan: 0",
                band.sideband.as_char()
            )?;
        }
    }

    let mut chan = 1;
    if acc.is_auto() {
        for b in 0..acc.num_bbc() {
            for f in 0..layout.num_chan {
                let mut x = 0.0;
                if acc.weight_sum[b] > 0.0 {
                    let z: c64 = acc.spectrum.slice(s![b, .., f]).iter().sum();
                    x = (z / acc.weight_sum[b]).re;
                }
                writeln!(
                    fp,
                    "{:2} {:<3} {chan:5} {x:7.5}",
                    acc.a1 + 1,
                    obs.antennas[acc.a1].name
                )?;
                chan += 1;
            }
        }
    } else {
        for b in 0..acc.num_bbc() {
            for f in 0..layout.num_chan {
                let (mut x, mut y) = (0.0, 0.0);
                if acc.weight_sum[b] > 0.0 {
                    let z: c64 = acc.spectrum.slice(s![b, .., f]).iter().sum();
                    let z = z / acc.weight_sum[b];
                    x = z.re;
                    // Flip the imaginary part to match the AIPS convention.
                    y = -z.im;
                }
                writeln!(
                    fp,
                    "{:2} {:2} {:<3} {:<3} {chan:5} {:7.5} {:8.3}",
                    acc.a1 + 1,
                    acc.a2 + 1,
                    obs.antennas[acc.a1].name,
                    obs.antennas[acc.a2].name,
                    (x * x + y * y).sqrt(),
                    atan2(y, x).to_degrees()
                )?;
                chan += 1;
            }
        }
    }
    Ok(())
}

/// The per-channel weight mean/min/max report for an autocorrelation
/// window.
fn write_weights(
    obs: &ObsContext,
    files: &mut OutputSet,
    acc: &Accumulator,
    mjd: f64,
) -> Result<(), SnifferError> {
    let (day, hour) = mjd_day_hour(mjd);
    write!(
        files.wts,
        "{day:5} {hour:8.5} {:2} {:<3} {:2}",
        acc.a1 + 1,
        obs.antennas[acc.a1].name,
        acc.num_bbc()
    )?;
    for bbc in 0..acc.num_bbc() {
        let w = if acc.num_rec[bbc] == 0 {
            0.0
        } else {
            acc.weight_sum[bbc] / f64::from(acc.num_rec[bbc])
        };
        write!(files.wts, " {w:5.3}")?;
    }
    for bbc in 0..acc.num_bbc() {
        let w = if acc.num_rec[bbc] == 0 {
            0.0
        } else {
            acc.weight_min[bbc]
        };
        write!(files.wts, " {w:5.3}")?;
    }
    for bbc in 0..acc.num_bbc() {
        let w = if acc.num_rec[bbc] == 0 {
            0.0
        } else {
            acc.weight_max[bbc]
        };
        write!(files.wts, " {w:5.3}")?;
    }
    writeln!(files.wts)?;
    Ok(())
}

/// The fringe-fit reports for a cross-correlation window: one `.apd` and
/// one `.apc` line, and the cross-polarization ratios when configured.
#[allow(clippy::too_many_arguments)]
fn write_fringe_fits(
    obs: &ObsContext,
    layout: &Layout,
    cur: &CurrentConfig,
    files: &mut OutputSet,
    fitter: &mut FringeFitter,
    acc: &mut Accumulator,
    source: usize,
    mjd: f64,
) -> Result<(), SnifferError> {
    let (day, hour) = mjd_day_hour(mjd);
    let header = format!(
        "{day:5} {hour:10.7} {:2} {:<10} {:2} {:2} {:<3} {:<3}",
        source + 1,
        obs.sources[source].name,
        acc.a1 + 1,
        acc.a2 + 1,
        obs.antennas[acc.a1].name,
        obs.antennas[acc.a2].name,
    );
    write!(files.apd, "{header} {:2}", acc.num_bbc())?;
    write!(files.apc, "{header} {:2}", acc.num_bbc())?;
    if let Some(cpol) = files.cpol.as_mut() {
        write!(cpol, "{header} {:2}", cur.num_if)?;
    }

    let mut amp = vec![0.0; acc.num_bbc()];
    for bbc in 0..acc.num_bbc() {
        if (acc.num_rec[bbc] as usize) < layout.num_time / 2 || acc.weight_sum[bbc] == 0.0 {
            write!(files.apd, " 0 0 0 0")?;
            write!(files.apc, " 0 0 0 0")?;
            continue;
        }

        let fit = fitter.fit(acc, bbc);
        amp[bbc] = fit.amp;

        add_to_bandpass(acc, bbc, &fit, layout);

        let FringeFit {
            delay,
            mut phase_rate,
            mut phase,
            amp: _,
            spectral,
        } = fit;
        let mut spec_chan = spectral.chan as i64;
        let mut spec_phase_rate = spectral.phase_rate;
        let mut spec_phase = spectral.phase;

        // Correct for the negative frequency axis of a lower sideband.
        if acc.sideband[bbc] == Sideband::Lower {
            phase = -phase;
            phase_rate = -phase_rate;
            spec_phase = -spec_phase;
            spec_chan = fitter.width() as i64 - 1 - spec_chan;
            spec_phase_rate = -spec_phase_rate;
        }

        let norm = 2.0 / (acc.weight_sum[bbc] * layout.num_chan as f64);
        write!(
            files.apd,
            " {delay:10.4} {:7.5} {:10.4} {phase_rate:10.6}",
            amp[bbc] * norm,
            phase.to_degrees()
        )?;
        write!(
            files.apc,
            " {:4} {:7.5} {:10.4} {spec_phase_rate:10.6}",
            spec_chan + 1,
            spectral.amp * norm,
            spec_phase.to_degrees()
        )?;
    }

    if let Some(cpol) = files.cpol.as_mut() {
        for if_idx in 0..cur.num_if {
            let [bbc0, bbc1] = acc.if_to_bbc[if_idx].unwrap_or([0, 0]);
            let starved = (acc.num_rec[bbc0] as usize) < layout.num_time / 2
                || (acc.num_rec[bbc1] as usize) < layout.num_time / 2
                || acc.weight_sum[bbc0] == 0.0
                || acc.weight_sum[bbc1] == 0.0
                || acc.if_weight_sum[[if_idx, 0]] == 0.0
                || acc.if_weight_sum[[if_idx, 1]] == 0.0;
            if starved {
                write!(cpol, " {} {}", -100 - bbc0 as i64, -100 - bbc1 as i64)?;
                continue;
            }

            let mut hand_amp = [0.0; 2];
            for hand in CrossHand::ALL {
                hand_amp[hand.index()] = fitter.fit_cross_hand(acc, if_idx, hand).amp;
            }
            // Each hand's amplitude normalized by the geometric mean of
            // the parallel hands.
            let norm = (amp[bbc0] * amp[bbc1]).sqrt();
            if norm == 0.0 {
                write!(cpol, " -1 -1")?;
            } else {
                write!(cpol, " {:5.3} {:5.3}", hand_amp[0] / norm, hand_amp[1] / norm)?;
            }
        }
        writeln!(cpol)?;
    }

    writeln!(files.apd)?;
    writeln!(files.apc)?;
    Ok(())
}

/// Rotate the window's spectrum into the line-of-sight frame with the
/// fitted model and integrate it into the persistent bandpass. The
/// delay-rate term is never estimated, so the rotation's delay is constant
/// over the window.
fn add_to_bandpass(acc: &mut Accumulator, bbc: usize, fit: &FringeFit, layout: &Layout) {
    let Some(bandpass) = acc.bandpass.as_mut() else {
        return;
    };
    let num_time = acc.spectrum.len_of(ndarray::Axis(1));
    let num_chan = acc.spectrum.len_of(ndarray::Axis(2));
    for j in 0..num_time {
        let delay_now = fit.delay;
        let phase_now = fit.phase + TAU * fit.phase_rate * j as f64 * layout.sol_int / num_time as f64;
        for i in 0..num_chan {
            let phi = -(phase_now + TAU * delay_now * layout.bw * i as f64 / (1000.0 * num_chan as f64));
            bandpass[[bbc, i]] += acc.spectrum[[bbc, j, i]] * cexp(phi);
        }
    }
}

/// One baseband channel of the integrated bandpass, scaled so the
/// per-channel RMS sums to the channel count.
fn dump_accumulator_bandpass(
    obs: &ObsContext,
    layout: &Layout,
    cur: &CurrentConfig,
    w: &mut BufWriter<File>,
    acc: &Accumulator,
    bbc: usize,
) -> Result<(), SnifferError> {
    let Some(bandpass) = acc.bandpass.as_ref() else {
        return Ok(());
    };
    let row = bandpass.slice(s![bbc, ..]);
    let sum: f64 = row.iter().map(|z| z.norm_sqr()).sum();
    if sum <= 0.0 {
        return Ok(());
    }
    let scale = (layout.num_chan as f64 / sum).sqrt();

    let (Some(&if_idx), Some(&pol), Some(config)) =
        (cur.bbc_if.get(bbc), cur.bbc_pol.get(bbc), cur.index)
    else {
        return Ok(());
    };
    let band = &obs.freq_setups[obs.configs[config].freq_setup].ifs[if_idx];
    let freq = band.freq;
    let mut bw = band.bw;
    if band.sideband != Sideband::Upper {
        bw = -bw;
    }
    let df = bw / layout.num_chan as f64;

    writeln!(
        w,
        "Bandpass {} {} {} {} {bbc} {} {freq:.6} {bw:.6} {pol}",
        acc.a1,
        acc.a2,
        obs.antennas[acc.a1].name,
        obs.antennas[acc.a2].name,
        layout.num_chan
    )?;
    for c in 0..layout.num_chan {
        let z = row[c];
        writeln!(
            w,
            "{:.6} {:.6} {:.6}",
            freq + c as f64 * df,
            z.re * scale,
            z.im * scale
        )?;
    }
    Ok(())
}
