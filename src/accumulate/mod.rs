// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Per-antenna-pair accumulation of visibility spectra.

Each [`Accumulator`] owns flat arenas for one ordered antenna pair: summed
complex spectra per (baseband channel, time bin), cross-hand spectra per
IF, weight statistics, and an optional bandpass integral that survives
window resets. The [`AccumulatorGrid`] holds one accumulator per ordered
pair, autocorrelations included.
 */


use ndarray::prelude::*;
use num_traits::Zero;

use crate::context::Sideband;
use crate::c64;

/// Weight minima start above any plausible record weight so that the first
/// `add` establishes the true minimum.
const WEIGHT_MIN_INIT: f64 = 1000.0;

/// Cross-hand polarization products of one IF. The parallel hands live in
/// the ordinary baseband-channel spectra and are reached through
/// [`Accumulator::if_to_bbc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CrossHand {
    Rl,
    Lr,
}

impl CrossHand {
    pub(crate) const ALL: [CrossHand; 2] = [CrossHand::Rl, CrossHand::Lr];

    /// Stokes index of this hand in the record layout.
    pub(crate) fn stokes(self) -> usize {
        match self {
            CrossHand::Rl => 2,
            CrossHand::Lr => 3,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            CrossHand::Rl => 0,
            CrossHand::Lr => 1,
        }
    }
}

/// Accumulation window bounds \[MJD\]. Successive windows of one pair are
/// contiguous: a new window is anchored half a grid spacing before its
/// first record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Window {
    pub(crate) start: f64,
    pub(crate) stop: f64,
}

/// Construction-time sizing of the accumulator grid.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GridDims {
    pub(crate) num_bbc: usize,
    pub(crate) num_if: usize,
    pub(crate) num_chan: usize,
    pub(crate) num_time: usize,
    pub(crate) num_source: usize,
}

/// Summed spectra and window bookkeeping for one ordered antenna pair.
pub(crate) struct Accumulator {
    pub(crate) a1: usize,
    pub(crate) a2: usize,

    /// Summed weighted samples, `[bbc][time][chan]`.
    pub(crate) spectrum: Array3<c64>,

    /// Summed cross-hand samples, `[IF][hand][time][chan]`.
    pub(crate) cross: Array4<c64>,

    /// Bandpass integral, `[bbc][chan]`; never cleared by [`reset`], only
    /// emitted at engine teardown.
    ///
    /// [`reset`]: Accumulator::reset
    pub(crate) bandpass: Option<Array2<c64>>,

    /// Records accumulated per baseband channel this window.
    pub(crate) num_rec: Vec<u32>,

    /// Sideband last seen per baseband channel.
    pub(crate) sideband: Vec<Sideband>,

    pub(crate) weight_sum: Vec<f64>,
    pub(crate) weight_min: Vec<f64>,
    pub(crate) weight_max: Vec<f64>,

    /// Cross-hand weight sums, `[IF][hand]`.
    pub(crate) if_weight_sum: Array2<f64>,

    /// Parallel-hand baseband channels of each IF; set once cross-hand data
    /// has been seen for the IF in the current window.
    pub(crate) if_to_bbc: Vec<Option<[usize; 2]>>,

    /// MJD of the last window-snapshot emission, per source. Persists
    /// across resets; it gates the AC/XC snapshot reports.
    pub(crate) last_snapshot: Vec<f64>,

    /// Current source; `None` forces no dump to run.
    pub(crate) source: Option<usize>,

    pub(crate) window: Option<Window>,

    /// Running sum/count of record timestamps, for the reported mean
    /// time-of-window.
    pub(crate) mjd_sum: f64,
    pub(crate) mjd_count: u32,
}

impl Accumulator {
    pub(crate) fn new(a1: usize, a2: usize, dims: &GridDims, write_bandpass: bool) -> Accumulator {
        Accumulator {
            a1,
            a2,
            spectrum: Array3::zeros((dims.num_bbc, dims.num_time, dims.num_chan)),
            cross: Array4::zeros((dims.num_if, 2, dims.num_time, dims.num_chan)),
            bandpass: write_bandpass.then(|| Array2::zeros((dims.num_bbc, dims.num_chan))),
            num_rec: vec![0; dims.num_bbc],
            sideband: vec![Sideband::Upper; dims.num_bbc],
            weight_sum: vec![0.0; dims.num_bbc],
            weight_min: vec![WEIGHT_MIN_INIT; dims.num_bbc],
            weight_max: vec![0.0; dims.num_bbc],
            if_weight_sum: Array2::zeros((dims.num_if, 2)),
            if_to_bbc: vec![None; dims.num_if],
            last_snapshot: vec![0.0; dims.num_source],
            source: None,
            window: None,
            mjd_sum: 0.0,
            mjd_count: 0,
        }
    }

    pub(crate) fn num_bbc(&self) -> usize {
        self.spectrum.len_of(Axis(0))
    }

    pub(crate) fn num_time(&self) -> usize {
        self.spectrum.len_of(Axis(1))
    }

    pub(crate) fn num_chan(&self) -> usize {
        self.spectrum.len_of(Axis(2))
    }

    pub(crate) fn is_auto(&self) -> bool {
        self.a1 == self.a2
    }

    /// The (time, chan) spectrum of one baseband channel.
    pub(crate) fn spectrum_of(&self, bbc: usize) -> ArrayView2<c64> {
        self.spectrum.slice(s![bbc, .., ..])
    }

    /// The (time, chan) spectrum of one cross hand of one IF.
    pub(crate) fn cross_of(&self, if_idx: usize, hand: CrossHand) -> ArrayView2<c64> {
        self.cross.slice(s![if_idx, hand.index(), .., ..])
    }

    /// Mean record timestamp of the window, or `None` if nothing has been
    /// accumulated.
    pub(crate) fn mean_mjd(&self) -> Option<f64> {
        (self.mjd_count > 0).then(|| self.mjd_sum / f64::from(self.mjd_count))
    }

    /// The best-covered baseband channel's record count.
    pub(crate) fn max_num_rec(&self) -> u32 {
        self.num_rec.iter().copied().max().unwrap_or(0)
    }

    /// Accumulate one record's spectrum into a (baseband channel, time bin)
    /// row, scaling by the record weight, and update the weight statistics
    /// and window timing.
    pub(crate) fn add(
        &mut self,
        bbc: usize,
        bin: usize,
        weight: f64,
        samples: impl IntoIterator<Item = c64>,
        sideband: Sideband,
        mjd: f64,
    ) {
        let mut row = self.spectrum.slice_mut(s![bbc, bin, ..]);
        for (cell, z) in row.iter_mut().zip(samples) {
            *cell += z * weight;
        }

        self.num_rec[bbc] += 1;
        self.sideband[bbc] = sideband;
        self.weight_sum[bbc] += weight;
        if weight > self.weight_max[bbc] {
            self.weight_max[bbc] = weight;
        }
        if weight < self.weight_min[bbc] {
            self.weight_min[bbc] = weight;
        }
        self.mjd_count += 1;
        self.mjd_sum += mjd;
    }

    /// Accumulate one record's cross-hand spectrum for one IF.
    pub(crate) fn add_cross_hand(
        &mut self,
        if_idx: usize,
        hand: CrossHand,
        bin: usize,
        weight: f64,
        samples: impl IntoIterator<Item = c64>,
    ) {
        let mut row = self.cross.slice_mut(s![if_idx, hand.index(), bin, ..]);
        for (cell, z) in row.iter_mut().zip(samples) {
            *cell += z * weight;
        }
        self.if_weight_sum[[if_idx, hand.index()]] += weight;
    }

    /// Zero the per-window state. The bandpass integral, the snapshot
    /// timestamps and the current source survive; after this, the
    /// accumulator is indistinguishable from a freshly constructed one
    /// apart from those and its antenna pair.
    pub(crate) fn reset(&mut self) {
        self.spectrum.fill(c64::zero());
        self.cross.fill(c64::zero());
        self.num_rec.fill(0);
        self.weight_sum.fill(0.0);
        self.weight_min.fill(WEIGHT_MIN_INIT);
        self.weight_max.fill(0.0);
        self.if_weight_sum.fill(0.0);
        self.if_to_bbc.fill(None);
        self.window = None;
        self.mjd_sum = 0.0;
        self.mjd_count = 0;
    }
}

/// A square matrix of accumulators, one per ordered antenna pair. A
/// triangle would do for the cross-correlations, but the auto/cross logic
/// keys off `a1 == a2` rather than a canonical ordering, so the redundant
/// half is kept.
pub(crate) struct AccumulatorGrid {
    num_ant: usize,
    accum: Vec<Accumulator>,
}

impl AccumulatorGrid {
    pub(crate) fn new(num_ant: usize, dims: &GridDims, write_bandpass: bool) -> AccumulatorGrid {
        let mut accum = Vec::with_capacity(num_ant * num_ant);
        for a1 in 0..num_ant {
            for a2 in 0..num_ant {
                accum.push(Accumulator::new(a1, a2, dims, write_bandpass));
            }
        }
        AccumulatorGrid { num_ant, accum }
    }

    pub(crate) fn get(&self, a1: usize, a2: usize) -> &Accumulator {
        &self.accum[a1 * self.num_ant + a2]
    }

    pub(crate) fn get_mut(&mut self, a1: usize, a2: usize) -> &mut Accumulator {
        &mut self.accum[a1 * self.num_ant + a2]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Accumulator> {
        self.accum.iter()
    }
}
