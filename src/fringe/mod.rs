// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
The Fourier search engine.

A [`FringeFitter`] owns a scratch buffer sized to the oversampled
(time, channel) grid and two reusable forward-FFT plans, one per axis.
Transforming along time turns the buffer into a (phase-rate, channel)
plane; transforming along frequency afterwards gives the
(phase-rate, delay) plane, whose interpolated peak is the fringe fit.
The fit runs twice per baseband channel: once at full resolution, then
again with the first estimate removed and the pixels binned, which zooms
the transform into the residual structure.
 */


use std::f64::consts::TAU;
use std::sync::Arc;

use num_traits::Zero;
use rustfft::{Fft, FftPlanner};

use crate::accumulate::{Accumulator, CrossHand};
use crate::math::{atan2, cexp, wrap_phase};
use crate::c64;

/// Fraction of channels excluded from each band edge before transforming.
const EDGE: f64 = 0.02;

/// A trial fringe model removed from the spectrum while populating the
/// transform buffer, so the search sees only the residual.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TrialModel {
    /// \[ns\]
    pub(crate) delay: f64,
    /// \[cycles/s\]
    pub(crate) phase_rate: f64,
    /// \[ns/s\]. Carried through the arithmetic but never estimated; the
    /// delay-rate leg of the fit is unimplemented (see DESIGN.md).
    pub(crate) delay_rate: f64,
    /// \[rad\]
    pub(crate) phase: f64,
}

impl TrialModel {
    fn is_zero(&self) -> bool {
        self.delay == 0.0 && self.phase_rate == 0.0 && self.delay_rate == 0.0 && self.phase == 0.0
    }
}

/// Peak of the (phase-rate, channel) plane after the time-axis transform:
/// the spectral-line view of the window, uncorrected for any delay slope.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SpectralPeak {
    /// Raw buffer channel of the peak.
    pub(crate) chan: usize,
    /// \[cycles/s\]
    pub(crate) phase_rate: f64,
    pub(crate) amp: f64,
    /// \[rad\]
    pub(crate) phase: f64,
}

/// Interpolated peak of the (phase-rate, delay) plane.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DelayRatePeak {
    /// \[ns\]
    pub(crate) delay: f64,
    /// \[cycles/s\]
    pub(crate) phase_rate: f64,
    pub(crate) amp: f64,
    /// \[rad\]
    pub(crate) phase: f64,
}

/// Result of the two-pass fringe fit for one baseband channel.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FringeFit {
    /// \[ns\]
    pub(crate) delay: f64,
    /// \[cycles/s\]
    pub(crate) phase_rate: f64,
    /// \[rad\], wrapped to (-PI, PI].
    pub(crate) phase: f64,
    pub(crate) amp: f64,
    /// First-pass spectral-line peak.
    pub(crate) spectral: SpectralPeak,
}

pub(crate) struct FringeFitter {
    /// Buffer width: oversample × channel count.
    nx: usize,
    /// Buffer height: oversample × window time bins.
    ny: usize,
    oversample: usize,
    /// \[s\]
    sol_int: f64,
    /// \[MHz\]
    bw: f64,
    plan_time: Arc<dyn Fft<f64>>,
    plan_chan: Arc<dyn Fft<f64>>,
    /// Row-major `[time][chan]`.
    buf: Vec<c64>,
    column: Vec<c64>,
    scratch: Vec<c64>,
}

impl FringeFitter {
    pub(crate) fn new(
        num_chan: usize,
        num_time: usize,
        oversample: usize,
        sol_int: f64,
        bw: f64,
    ) -> FringeFitter {
        let nx = oversample * num_chan;
        let ny = oversample * num_time;
        let mut planner = FftPlanner::new();
        let plan_time = planner.plan_fft_forward(ny);
        let plan_chan = planner.plan_fft_forward(nx);
        let scratch_len = plan_time
            .get_inplace_scratch_len()
            .max(plan_chan.get_inplace_scratch_len());
        FringeFitter {
            nx,
            ny,
            oversample,
            sol_int,
            bw,
            plan_time,
            plan_chan,
            buf: vec![c64::zero(); nx * ny],
            column: vec![c64::zero(); ny],
            scratch: vec![c64::zero(); scratch_len],
        }
    }

    /// Width of the transform buffer; the channel axis of the spectral
    /// peak lives on this grid.
    pub(crate) fn width(&self) -> usize {
        self.nx
    }

    /// Populate the buffer from one baseband channel's (time, chan)
    /// spectrum, dropping the band edges, removing the trial model's phase
    /// slopes, and summing `time_bin` × `chan_bin` blocks of samples into
    /// single pixels.
    pub(crate) fn load(
        &mut self,
        acc: &Accumulator,
        bbc: usize,
        time_bin: usize,
        chan_bin: usize,
        trial: TrialModel,
    ) {
        let num_chan = acc.num_chan();
        let num_time = acc.num_time();
        let chan0 = (EDGE * num_chan as f64).round() as usize;
        let chan1 = (num_chan / chan_bin) * chan_bin - chan0;
        let nt = (num_time / time_bin) * time_bin;
        let spectrum = acc.spectrum_of(bbc);
        let rotate = !trial.is_zero();

        self.buf.fill(c64::zero());
        for j in 0..nt {
            let row = (j / time_bin) * self.nx;
            if rotate {
                let delay_now =
                    trial.delay + trial.delay_rate * self.sol_int * j as f64 / num_time as f64;
                let phase_now =
                    trial.phase + TAU * trial.phase_rate * j as f64 * self.sol_int / num_time as f64;
                for i in chan0..chan1 {
                    let phi =
                        -(phase_now + TAU * delay_now * self.bw * i as f64 / (1000.0 * num_chan as f64));
                    self.buf[row + i / chan_bin] += spectrum[[j, i]] * cexp(phi);
                }
            } else {
                for i in chan0..chan1 {
                    self.buf[row + i / chan_bin] += spectrum[[j, i]];
                }
            }
        }
    }

    /// Populate the buffer from one cross-hand IF spectrum. No trial model
    /// is removed; the cross hands are only ever searched once.
    pub(crate) fn load_cross(
        &mut self,
        acc: &Accumulator,
        if_idx: usize,
        hand: CrossHand,
        time_bin: usize,
        chan_bin: usize,
    ) {
        let num_chan = acc.num_chan();
        let num_time = acc.num_time();
        let chan0 = (EDGE * num_chan as f64).round() as usize;
        let chan1 = num_chan - chan0;
        let nt = (num_time / time_bin) * time_bin;
        let spectrum = acc.cross_of(if_idx, hand);

        self.buf.fill(c64::zero());
        for j in 0..nt {
            let row = (j / time_bin) * self.nx;
            for i in chan0..chan1 {
                self.buf[row + i / chan_bin] += spectrum[[j, i]];
            }
        }
    }

    /// Transform along the time axis, turning rows of equal time into rows
    /// of equal phase-rate. Columns are strided, so they go through the
    /// column scratch.
    pub(crate) fn transform_time(&mut self) {
        for i in 0..self.nx {
            for j in 0..self.ny {
                self.column[j] = self.buf[j * self.nx + i];
            }
            self.plan_time
                .process_with_scratch(&mut self.column, &mut self.scratch);
            for j in 0..self.ny {
                self.buf[j * self.nx + i] = self.column[j];
            }
        }
    }

    /// Transform along the frequency axis. Rows are contiguous, so all of
    /// them transform in one batched call.
    pub(crate) fn transform_chan(&mut self) {
        self.plan_chan
            .process_with_scratch(&mut self.buf, &mut self.scratch);
    }

    /// Location and squared magnitude of the strongest pixel.
    fn peak_index(&self) -> (usize, usize, f64) {
        let mut best = (0, 0, 0.0);
        for j in 0..self.ny {
            for i in 0..self.nx {
                let amp2 = self.buf[j * self.nx + i].norm_sqr();
                if amp2 > best.2 {
                    best = (i, j, amp2);
                }
            }
        }
        best
    }

    /// Find the spectral-line peak after the time-axis transform, refining
    /// the phase-rate axis by 1-D parabolic interpolation. The channel axis
    /// is left on the raw grid.
    pub(crate) fn spectral_peak(&self) -> SpectralPeak {
        let (best_i, best_j, max2) = self.peak_index();
        let z = self.buf[best_j * self.nx + best_i];
        let amp = max2.sqrt();

        let prev = if best_j == 0 { self.ny - 1 } else { best_j - 1 };
        let next = if best_j == self.ny - 1 { 0 } else { best_j + 1 };
        let peak = [
            self.buf[prev * self.nx + best_i].norm(),
            amp,
            self.buf[next * self.nx + best_i].norm(),
        ];
        let phase_rate = peak_up(
            peak,
            best_j,
            self.ny,
            self.sol_int * self.oversample as f64,
        );

        SpectralPeak {
            chan: best_i,
            phase_rate,
            amp,
            phase: atan2(z.im, z.re),
        }
    }

    /// Find the (phase-rate, delay) peak after both transforms, refining
    /// both axes from the 3×3 neighbourhood. The bin factors must match
    /// the ones the buffer was populated with.
    pub(crate) fn delay_rate_peak(&self, time_bin: usize, chan_bin: usize) -> DelayRatePeak {
        let (best_i, best_j, _) = self.peak_index();
        let z = self.buf[best_j * self.nx + best_i];
        let phase = atan2(z.im, z.re);

        let mut peak = [[0.0; 3]; 3];
        for (j, row) in peak.iter_mut().enumerate() {
            for (i, cell) in row.iter_mut().enumerate() {
                let ii = (best_i as i64 + i as i64 - 1).rem_euclid(self.nx as i64) as usize;
                let jj = (best_j as i64 + j as i64 - 1).rem_euclid(self.ny as i64) as usize;
                *cell = self.buf[jj * self.nx + ii].norm();
            }
        }
        let (dj, di, amp) = peak_up_2d(&peak);

        let mut best_i = best_i as i64;
        let mut best_j = best_j as i64;
        if best_i > (self.nx / 2) as i64 {
            best_i -= self.nx as i64;
        }
        if best_j > (self.ny / 2) as i64 {
            best_j -= self.ny as i64;
        }

        DelayRatePeak {
            delay: (best_i as f64 + di)
                / (self.bw * (self.oversample * chan_bin) as f64 / 1000.0),
            phase_rate: (best_j as f64 + dj)
                / (self.sol_int * (self.oversample * time_bin) as f64),
            amp,
            phase,
        }
    }

    /// The two-pass fringe fit for one baseband channel: a full-resolution
    /// search, then a zoomed search of the residual with the first
    /// estimate removed and the pixels binned. The passes' delay, rate and
    /// phase estimates sum.
    pub(crate) fn fit(&mut self, acc: &Accumulator, bbc: usize) -> FringeFit {
        self.load(acc, bbc, 1, 1, TrialModel::default());
        self.transform_time();
        let spectral = self.spectral_peak();
        self.transform_chan();
        let first = self.delay_rate_peak(1, 1);

        let (time_bin, chan_bin) = zoom_bin_factors(acc.num_time(), acc.num_chan());
        self.load(
            acc,
            bbc,
            time_bin,
            chan_bin,
            TrialModel {
                delay: first.delay,
                phase_rate: first.phase_rate,
                delay_rate: 0.0,
                phase: first.phase,
            },
        );
        self.transform_time();
        self.transform_chan();
        let second = self.delay_rate_peak(time_bin, chan_bin);

        FringeFit {
            delay: first.delay + second.delay,
            phase_rate: first.phase_rate + second.phase_rate,
            phase: wrap_phase(first.phase + second.phase),
            amp: second.amp,
            spectral,
        }
    }

    /// Single-pass peak search of one cross-hand IF spectrum.
    pub(crate) fn fit_cross_hand(
        &mut self,
        acc: &Accumulator,
        if_idx: usize,
        hand: CrossHand,
    ) -> DelayRatePeak {
        self.load_cross(acc, if_idx, hand, 1, 1);
        self.transform_time();
        self.transform_chan();
        self.delay_rate_peak(1, 1)
    }
}

/// Binning factors for the zoom pass. Perhaps the calculation could be
/// more intelligent, but this is a good starting point.
fn zoom_bin_factors(num_time: usize, num_chan: usize) -> (usize, usize) {
    let time_bin = if num_time >= 12 { 3 } else { 1 };
    let chan_bin = if num_chan >= 25 { 5 } else { 1 };
    (time_bin, chan_bin)
}

/// Parabolic sub-sample refinement of a 1-D transform peak. `index` is the
/// peak bin on an `n`-point FFT axis (wrapped to a signed coordinate), and
/// the refined coordinate is divided by `scale` to land in physical units.
fn peak_up(peak: [f64; 3], index: usize, n: usize, scale: f64) -> f64 {
    let mut i = index as f64;
    if index >= n / 2 {
        i -= n as f64;
    }

    let d = 2.0 * peak[1] - peak[0] - peak[2];
    let f = if d <= 0.0 {
        i
    } else {
        i + (peak[2] - peak[0]) / (2.0 * d)
    };

    f / scale
}

/// Refine a 2-D peak from its 3×3 neighbourhood by solving the local
/// quadratic model of the surface. Returns the pixel offsets from the
/// centre on both axes and the interpolated peak value.
fn peak_up_2d(peak: &[[f64; 3]; 3]) -> (f64, f64, f64) {
    let dzdj = (peak[2][1] - peak[0][1]) / 2.0;
    let dzdi = (peak[1][2] - peak[1][0]) / 2.0;
    let dzdjj = peak[2][1] + peak[0][1] - 2.0 * peak[1][1];
    let dzdii = peak[1][2] + peak[1][0] - 2.0 * peak[1][1];
    let dzdji = (peak[2][2] - peak[2][0] - peak[0][2] + peak[0][0]) / 4.0;

    let det = 1.0 / (dzdjj * dzdii - dzdji * dzdji);
    let dj = -(dzdii * dzdj - dzdji * dzdi) * det;
    let di = -(dzdjj * dzdi - dzdji * dzdj) * det;
    let value = peak[1][1]
        + 0.5 * (dzdjj * dj * dj + 2.0 * dzdji * dj * di + dzdii * di * di)
        + dzdj * dj
        + dzdi * di;

    (dj, di, value)
}
