// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Helper functions around time. All window bookkeeping uses the modified
//! Julian date; these helpers only matter at the reporting boundary.

use hifitime::Epoch;

/// Split an MJD into whole days and the hour of day, the form the report
/// columns want.
pub(crate) fn mjd_day_hour(mjd: f64) -> (i64, f64) {
    let day = mjd.floor();
    (day as i64, 24.0 * (mjd - day))
}

/// Render an MJD as an ISO-8601 UTC timestamp for the snapshot headers.
pub(crate) fn format_mjd(mjd: f64) -> String {
    let (y, mo, d, h, mi, s, _) = Epoch::from_mjd_utc(mjd).to_gregorian_utc();
    format!("{y:04}-{mo:02}-{d:02}T{h:02}:{mi:02}:{s:02}")
}
