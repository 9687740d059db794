// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::fs;
use std::path::PathBuf;

use approx::assert_abs_diff_eq;
use tempfile::TempDir;

use super::*;
use crate::context::{Antenna, CorrConfig, FreqSetup, IfBand, ObsContext, Scan, Source};
use crate::c64;

/// 84.375 s is 2^-10 days, so all window arithmetic in these tests is
/// exact in binary floating point.
const T_INT: f64 = 84.375;
const DT_DAYS: f64 = T_INT / 86400.0;
const NUM_TIME: usize = 4;
const NUM_CHAN: usize = 16;
/// First record timestamp; sits inside the test scan.
const MJD0: f64 = 59000.015625;

fn test_context(num_stokes: usize) -> ObsContext {
    ObsContext {
        obs_code: "TS001".to_string(),
        antennas: vec![
            Antenna {
                name: "AA".to_string(),
            },
            Antenna {
                name: "BB".to_string(),
            },
        ],
        sources: vec![
            Source {
                name: "J0555+3948".to_string(),
                fits_ids: vec![0],
            },
            Source {
                name: "J0927+3902".to_string(),
                fits_ids: vec![1],
            },
        ],
        freq_setups: vec![FreqSetup {
            ifs: vec![IfBand {
                freq: 8416.0,
                bw: 16.0,
                sideband: Sideband::Upper,
                pols: vec!['R', 'L'],
            }],
        }],
        configs: vec![CorrConfig {
            t_int: T_INT,
            freq_setup: 0,
            num_pol: 2,
        }],
        scans: vec![Scan {
            start_mjd: 59000.0,
            stop_mjd: 59000.5,
            config: 0,
            antennas: vec![0, 1],
        }],
        num_chan: NUM_CHAN,
        chan_bw: 16.0,
        num_stokes,
    }
}

fn opts() -> SnifferOpts {
    SnifferOpts {
        solution_interval: NUM_TIME as f64 * T_INT,
        ..SnifferOpts::default()
    }
}

fn filebase(dir: &TempDir) -> PathBuf {
    dir.path().join("job")
}

fn read(dir: &TempDir, ext: &str) -> String {
    fs::read_to_string(dir.path().join(format!("job.{ext}"))).unwrap()
}

/// Timestamp of time bin `k` of the first window.
fn bin_mjd(k: i64) -> f64 {
    MJD0 + k as f64 * DT_DAYS
}

/// A record's flat data array: per-Stokes weights, then interleaved
/// complex samples, every channel of every product set to `value`.
fn record_data(obs: &ObsContext, weights: [f32; 4], value: c64) -> Vec<f32> {
    let num_if = obs.num_if();
    let ns = obs.num_stokes;
    let stride = 2 * ns;
    let mut data = vec![0.0_f32; ns * num_if + stride * NUM_CHAN * num_if];
    for i in 0..num_if {
        for s in 0..ns {
            data[s + ns * i] = weights[s];
            for c in 0..NUM_CHAN {
                let off = ns * num_if + stride * NUM_CHAN * i + s * 2 + c * stride;
                data[off] = value.re as f32;
                data[off + 1] = value.im as f32;
            }
        }
    }
    data
}

fn rec<'a>(mjd: f64, baseline: i32, source_id: i32, data: &'a [f32]) -> VisRecord<'a> {
    VisRecord {
        source_id,
        mjd,
        baseline,
        sideband: Sideband::Upper,
        data,
    }
}

/// Cross-correlation baseline AA-BB, packed 1-based.
const BL_CROSS: i32 = 256 + 2;
/// Autocorrelation baseline AA-AA.
const BL_AUTO: i32 = 256 + 1;

#[test]
fn unresolved_source_is_skipped() {
    let obs = test_context(2);
    let dir = TempDir::new().unwrap();
    let mut sniffer = Sniffer::new(&obs, &filebase(&dir), opts()).unwrap();
    let data = record_data(&obs, [1.0; 4], c64::new(1.0, 0.0));

    assert_eq!(
        sniffer.feed(&rec(bin_mjd(0), BL_CROSS, 0, &data)).unwrap(),
        FeedOutcome::Skipped
    );
    assert_eq!(
        sniffer.feed(&rec(bin_mjd(0), BL_CROSS, 99, &data)).unwrap(),
        FeedOutcome::Skipped
    );
    assert_eq!(sniffer.num_records(), 0);
}

#[test]
fn records_accumulate_and_count() {
    let obs = test_context(2);
    let dir = TempDir::new().unwrap();
    let mut sniffer = Sniffer::new(&obs, &filebase(&dir), opts()).unwrap();
    let data = record_data(&obs, [1.0; 4], c64::new(1.0, 0.0));

    assert_eq!(
        sniffer.feed(&rec(bin_mjd(0), BL_CROSS, 1, &data)).unwrap(),
        FeedOutcome::Accepted(1)
    );
    assert_eq!(
        sniffer.feed(&rec(bin_mjd(1), BL_CROSS, 1, &data)).unwrap(),
        FeedOutcome::Accepted(2)
    );
    assert_eq!(sniffer.num_configs_used(), 1);
}

#[test]
fn window_edge_bin_is_silently_skipped() {
    let obs = test_context(2);
    let dir = TempDir::new().unwrap();
    let mut sniffer = Sniffer::new(&obs, &filebase(&dir), opts()).unwrap();
    let data = record_data(&obs, [1.0; 4], c64::new(1.0, 0.0));

    sniffer.feed(&rec(bin_mjd(0), BL_CROSS, 1, &data)).unwrap();
    // Exactly the window stop: bin index == the window length. Dropped
    // without counting as an anomaly.
    let stop = MJD0 + 3.5 * DT_DAYS;
    assert_eq!(
        sniffer.feed(&rec(stop, BL_CROSS, 1, &data)).unwrap(),
        FeedOutcome::Skipped
    );
    assert_eq!(sniffer.num_records(), 1);
}

#[test]
fn out_of_order_record_is_an_anomaly() {
    let obs = test_context(2);
    let dir = TempDir::new().unwrap();
    let mut sniffer = Sniffer::new(&obs, &filebase(&dir), opts()).unwrap();
    let data = record_data(&obs, [1.0; 4], c64::new(1.0, 0.0));

    sniffer.feed(&rec(bin_mjd(0), BL_CROSS, 1, &data)).unwrap();
    assert_eq!(
        sniffer
            .feed(&rec(bin_mjd(-2), BL_CROSS, 1, &data))
            .unwrap(),
        FeedOutcome::BadTimeBin
    );
    assert_eq!(sniffer.num_records(), 1);
}

#[test]
fn bad_baseline_is_skipped() {
    let obs = test_context(2);
    let dir = TempDir::new().unwrap();
    let mut sniffer = Sniffer::new(&obs, &filebase(&dir), opts()).unwrap();
    let data = record_data(&obs, [1.0; 4], c64::new(1.0, 0.0));

    // Antenna 7 doesn't exist.
    assert_eq!(
        sniffer
            .feed(&rec(bin_mjd(0), 7 * 256 + 1, 1, &data))
            .unwrap(),
        FeedOutcome::Skipped
    );
}

#[test]
fn fringe_report_for_a_flat_fringe() {
    let obs = test_context(2);
    let dir = TempDir::new().unwrap();
    let mut sniffer = Sniffer::new(&obs, &filebase(&dir), opts()).unwrap();
    let data = record_data(&obs, [1.0; 4], c64::new(1.0, 0.0));

    for k in 0..4 {
        sniffer.feed(&rec(bin_mjd(k), BL_CROSS, 1, &data)).unwrap();
    }
    // Past the window stop: dumps the completed window.
    sniffer.feed(&rec(bin_mjd(4), BL_CROSS, 1, &data)).unwrap();
    sniffer.finish().unwrap();

    let apd = read(&dir, "apd");
    let line = apd.lines().nth(1).unwrap();
    let fields: Vec<&str> = line.split_whitespace().collect();
    // day hour srcId srcName a1 a2 name1 name2 nBBC, then 4 fields per bbc.
    assert_eq!(fields[0], "59000");
    assert_eq!(fields[2], "1");
    assert_eq!(fields[3], "J0555+3948");
    assert_eq!(fields[8], "2");
    assert_eq!(fields.len(), 9 + 4 * 2);

    let delay: f64 = fields[9].parse().unwrap();
    let amp: f64 = fields[10].parse().unwrap();
    let phase: f64 = fields[11].parse().unwrap();
    let rate: f64 = fields[12].parse().unwrap();
    assert_abs_diff_eq!(delay, 0.0, epsilon = 1e-6);
    // A unit fringe with unit weights: the normalized amplitude is the
    // interpolated peak over (weight sum × channels) / 2.
    assert!(amp > 1.5 && amp < 2.5, "amp = {amp}");
    assert_abs_diff_eq!(phase, 0.0, epsilon = 1e-6);
    assert_abs_diff_eq!(rate, 0.0, epsilon = 1e-9);

    // The channel-resolved report exists and flagged the raw peak channel.
    let apc = read(&dir, "apc");
    let line = apc.lines().nth(1).unwrap();
    let fields: Vec<&str> = line.split_whitespace().collect();
    assert_eq!(fields.len(), 9 + 4 * 2);
    let spec_chan: i64 = fields[9].parse().unwrap();
    assert!(spec_chan >= 1);
}

#[test]
fn starved_channels_emit_zeros() {
    let obs = test_context(2);
    let dir = TempDir::new().unwrap();
    let mut sniffer = Sniffer::new(&obs, &filebase(&dir), opts()).unwrap();
    let data = record_data(&obs, [1.0; 4], c64::new(1.0, 0.0));

    // One record is fewer than half the window's bins.
    sniffer.feed(&rec(bin_mjd(0), BL_CROSS, 1, &data)).unwrap();
    // A source change forces the dump.
    sniffer.feed(&rec(bin_mjd(1), BL_CROSS, 2, &data)).unwrap();
    sniffer.finish().unwrap();

    let apd = read(&dir, "apd");
    let line = apd.lines().nth(1).unwrap();
    assert!(line.ends_with(" 0 0 0 0 0 0 0 0"), "line = {line}");
}

#[test]
fn weights_report_tracks_min_and_max() {
    let obs = test_context(2);
    let dir = TempDir::new().unwrap();
    let mut sniffer = Sniffer::new(&obs, &filebase(&dir), opts()).unwrap();

    let weights = [0.5, 0.25, 0.75, 0.5];
    for (k, w) in weights.into_iter().enumerate() {
        let data = record_data(&obs, [w; 4], c64::new(1.0, 0.0));
        sniffer
            .feed(&rec(bin_mjd(k as i64), BL_AUTO, 1, &data))
            .unwrap();
    }
    let data = record_data(&obs, [1.0; 4], c64::new(1.0, 0.0));
    sniffer.feed(&rec(bin_mjd(4), BL_AUTO, 1, &data)).unwrap();
    sniffer.finish().unwrap();

    let wts = read(&dir, "wts");
    let line = wts.lines().nth(1).unwrap();
    let fields: Vec<&str> = line.split_whitespace().collect();
    // day hour antId antName nBBC, then mean, min, max per bbc.
    assert_eq!(fields[0], "59000");
    assert_eq!(fields[3], "AA");
    assert_eq!(fields[4], "2");
    assert_eq!(fields.len(), 5 + 3 * 2);
    let mean: f64 = fields[5].parse().unwrap();
    let min: f64 = fields[7].parse().unwrap();
    let max: f64 = fields[9].parse().unwrap();
    assert_abs_diff_eq!(mean, 0.5);
    assert_abs_diff_eq!(min, 0.25);
    assert_abs_diff_eq!(max, 0.75);
}

#[test]
fn snapshot_respects_the_15_minute_gate() {
    let obs = test_context(2);
    let dir = TempDir::new().unwrap();
    let mut sniffer = Sniffer::new(&obs, &filebase(&dir), opts()).unwrap();
    let data = record_data(&obs, [1.0; 4], c64::new(1.0, 0.0));

    // Two fully-covered windows of source 1 back to back; the second one
    // falls inside the 15-minute gap and is suppressed. A third window on
    // source 2 has its own gate.
    for k in 0..8 {
        sniffer.feed(&rec(bin_mjd(k), BL_AUTO, 1, &data)).unwrap();
    }
    for k in 8..12 {
        sniffer.feed(&rec(bin_mjd(k), BL_AUTO, 2, &data)).unwrap();
    }
    sniffer.feed(&rec(bin_mjd(12), BL_AUTO, 2, &data)).unwrap();
    sniffer.finish().unwrap();

    let acb = read(&dir, "acb");
    let snapshots = acb.lines().filter(|l| l.starts_with("timerange:")).count();
    assert_eq!(snapshots, 2);
}

#[test]
fn snapshot_requires_75_percent_coverage() {
    let obs = test_context(2);
    let dir = TempDir::new().unwrap();
    let mut sniffer = Sniffer::new(&obs, &filebase(&dir), opts()).unwrap();
    let data = record_data(&obs, [1.0; 4], c64::new(1.0, 0.0));

    // 2 of 4 bins is below the 3-bin threshold.
    for k in 0..2 {
        sniffer.feed(&rec(bin_mjd(k), BL_AUTO, 1, &data)).unwrap();
    }
    sniffer.feed(&rec(bin_mjd(4), BL_AUTO, 1, &data)).unwrap();
    sniffer.finish().unwrap();

    let acb = read(&dir, "acb");
    assert_eq!(acb.lines().filter(|l| l.starts_with("timerange:")).count(), 0);

    // 3 of 4 bins passes.
    let dir = TempDir::new().unwrap();
    let mut sniffer = Sniffer::new(&obs, &filebase(&dir), opts()).unwrap();
    for k in 0..3 {
        sniffer.feed(&rec(bin_mjd(k), BL_AUTO, 1, &data)).unwrap();
    }
    sniffer.feed(&rec(bin_mjd(4), BL_AUTO, 1, &data)).unwrap();
    sniffer.finish().unwrap();

    let acb = read(&dir, "acb");
    assert_eq!(acb.lines().filter(|l| l.starts_with("timerange:")).count(), 1);
}

#[test]
fn ac_snapshot_is_real_valued() {
    let obs = test_context(2);
    let dir = TempDir::new().unwrap();
    let mut sniffer = Sniffer::new(&obs, &filebase(&dir), opts()).unwrap();
    let data = record_data(&obs, [1.0; 4], c64::new(3.0, 4.0));

    for k in 0..4 {
        sniffer.feed(&rec(bin_mjd(k), BL_AUTO, 1, &data)).unwrap();
    }
    sniffer.feed(&rec(bin_mjd(4), BL_AUTO, 1, &data)).unwrap();
    sniffer.finish().unwrap();

    let acb = read(&dir, "acb");
    let row = acb
        .lines()
        .find(|l| l.split_whitespace().count() == 4)
        .unwrap();
    let fields: Vec<&str> = row.split_whitespace().collect();
    // ant name chan value: only the real part of the mean spectrum.
    assert_eq!(fields[1], "AA");
    let value: f64 = fields[3].parse().unwrap();
    assert_abs_diff_eq!(value, 3.0, epsilon = 1e-4);
}

#[test]
fn xc_snapshot_amplitude_is_phase_invariant() {
    let obs = test_context(2);

    let amp_with_phase = |phase: f64| {
        let dir = TempDir::new().unwrap();
        let mut sniffer = Sniffer::new(&obs, &filebase(&dir), opts()).unwrap();
        let data = record_data(&obs, [1.0; 4], c64::from_polar(2.0, phase));
        for k in 0..4 {
            sniffer.feed(&rec(bin_mjd(k), BL_CROSS, 1, &data)).unwrap();
        }
        sniffer.feed(&rec(bin_mjd(4), BL_CROSS, 1, &data)).unwrap();
        sniffer.finish().unwrap();

        let xcb = read(&dir, "xcb");
        let row = xcb
            .lines()
            .find(|l| l.split_whitespace().count() == 7)
            .unwrap()
            .to_string();
        let fields: Vec<String> = row.split_whitespace().map(String::from).collect();
        fields[5].parse::<f64>().unwrap()
    };

    let a0 = amp_with_phase(0.0);
    let a1 = amp_with_phase(0.7);
    assert_abs_diff_eq!(a0, 2.0, epsilon = 1e-4);
    assert_abs_diff_eq!(a0, a1, epsilon = 1e-9);
}

#[test]
fn cross_pol_ratios_for_matched_hands() {
    let obs = test_context(4);
    let dir = TempDir::new().unwrap();
    let mut sniffer = Sniffer::new(&obs, &filebase(&dir), opts()).unwrap();
    let data = record_data(&obs, [0.6; 4], c64::new(1.0, 0.0));

    for k in 0..4 {
        sniffer.feed(&rec(bin_mjd(k), BL_CROSS, 1, &data)).unwrap();
    }
    sniffer.feed(&rec(bin_mjd(4), BL_CROSS, 1, &data)).unwrap();
    sniffer.finish().unwrap();

    let cpol = read(&dir, "cpol");
    let line = cpol.lines().nth(1).unwrap();
    let fields: Vec<&str> = line.split_whitespace().collect();
    // Matched RR/LL/RL/LR inputs: both hands normalize to 1.
    let r0: f64 = fields[fields.len() - 2].parse().unwrap();
    let r1: f64 = fields[fields.len() - 1].parse().unwrap();
    assert_abs_diff_eq!(r0, 1.0, epsilon = 1e-3);
    assert_abs_diff_eq!(r1, 1.0, epsilon = 1e-3);
}

#[test]
fn cross_pol_sentinel_without_cross_data() {
    let obs = test_context(4);
    let dir = TempDir::new().unwrap();
    let mut sniffer = Sniffer::new(&obs, &filebase(&dir), opts()).unwrap();
    // Parallel hands have weight; the cross hands carry none, so the
    // normalization cannot be formed.
    let data = record_data(&obs, [0.6, 0.6, 0.0, 0.0], c64::new(1.0, 0.0));

    for k in 0..4 {
        sniffer.feed(&rec(bin_mjd(k), BL_CROSS, 1, &data)).unwrap();
    }
    sniffer.feed(&rec(bin_mjd(4), BL_CROSS, 1, &data)).unwrap();
    sniffer.finish().unwrap();

    let cpol = read(&dir, "cpol");
    let line = cpol.lines().nth(1).unwrap();
    assert!(line.ends_with(" -100 -100"), "line = {line}");
}

#[test]
fn channels_log_written_once_per_setup() {
    let obs = test_context(2);
    let dir = TempDir::new().unwrap();
    let mut sniffer = Sniffer::new(&obs, &filebase(&dir), opts()).unwrap();
    let data = record_data(&obs, [1.0; 4], c64::new(1.0, 0.0));

    sniffer.feed(&rec(bin_mjd(0), BL_CROSS, 1, &data)).unwrap();
    sniffer.feed(&rec(bin_mjd(1), BL_CROSS, 1, &data)).unwrap();
    sniffer.finish().unwrap();

    let channels = read(&dir, "channels");
    let blocks = channels.lines().filter(|l| l.starts_with("MJD")).count();
    assert_eq!(blocks, 1);
    // One definition row per baseband channel.
    assert!(channels.contains("1 8416.000 16.000 U R"));
    assert!(channels.contains("2 8416.000 16.000 U L"));
}

#[test]
fn bandpass_written_at_teardown() {
    let obs = test_context(2);
    let dir = TempDir::new().unwrap();
    let mut sniffer = Sniffer::new(
        &obs,
        &filebase(&dir),
        SnifferOpts {
            write_bandpass: true,
            ..opts()
        },
    )
    .unwrap();
    let data = record_data(&obs, [1.0; 4], c64::new(1.0, 0.0));

    for k in 0..4 {
        sniffer.feed(&rec(bin_mjd(k), BL_CROSS, 1, &data)).unwrap();
    }
    sniffer.feed(&rec(bin_mjd(4), BL_CROSS, 1, &data)).unwrap();
    sniffer.finish().unwrap();

    let bandpass = read(&dir, "bandpass");
    assert!(bandpass.contains("Bandpass 0 1 AA BB"));
    // A flat unit fringe integrates to a flat bandpass scaled to unit RMS.
    assert!(bandpass.contains("8416.000000 1.000000 0.000000"));
}

#[test]
fn memory_cap_disables_construction() {
    let obs = test_context(2);
    let dir = TempDir::new().unwrap();
    let result = Sniffer::new(
        &obs,
        &filebase(&dir),
        SnifferOpts {
            memory_cap: 1,
            ..opts()
        },
    );
    assert!(matches!(result, Err(SnifferError::MemoryBudget { .. })));
}

#[test]
fn overlong_filebase_is_rejected() {
    let obs = test_context(2);
    let dir = TempDir::new().unwrap();
    let long = dir.path().join("x".repeat(300));
    assert!(matches!(
        Sniffer::new(&obs, &long, opts()),
        Err(SnifferError::FileNameTooLong(_))
    ));
}

#[test]
fn summary_log_is_written_at_construction() {
    let obs = test_context(2);
    let dir = TempDir::new().unwrap();
    let sniffer = Sniffer::new(&obs, &filebase(&dir), opts()).unwrap();
    assert!(sniffer.memory_need() > 0);
    drop(sniffer);

    let log = read(&dir, "log");
    assert!(log.contains("obscode:  TS001"));
    assert!(log.contains("nAntenna = 2"));
}
