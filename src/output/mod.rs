// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
The sniffer's output artifacts.

Every artifact is an append-only buffered text stream named
`<filebase>.<ext>`. The observation summary (`.log`) is written in full at
creation and closed immediately; the rest stay open for the engine's
lifetime. If any stream fails to open, the ones opened before it are
dropped and nothing is left reachable.
 */

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::context::ObsContext;
use crate::error::SnifferError;

/// Most filesystems cap a name component at 255 bytes; longer output names
/// abort construction rather than failing on the first write.
const MAX_NAME_LEN: usize = 255;

pub(crate) struct OutputSet {
    /// Baseband-channel definitions, one block per layout change.
    pub(crate) channels: BufWriter<File>,
    /// Fringe fits: amplitude, phase, delay, phase-rate.
    pub(crate) apd: BufWriter<File>,
    /// Channel-resolved fits: amplitude, phase, channel, phase-rate.
    pub(crate) apc: BufWriter<File>,
    /// Weight statistics (autocorrelations only).
    pub(crate) wts: BufWriter<File>,
    /// Window-averaged autocorrelation spectra.
    pub(crate) acb: BufWriter<File>,
    /// Window-averaged cross-correlation spectra.
    pub(crate) xcb: BufWriter<File>,
    /// Cross-polarization ratios; only with 4 Stokes products.
    pub(crate) cpol: Option<BufWriter<File>>,
    /// Integrated bandpass, written once at teardown; opt-in.
    pub(crate) bandpass: Option<BufWriter<File>>,
}

/// Write the observation summary (`.log`); it is complete before the rest
/// of the engine exists and closes immediately.
pub(crate) fn write_summary_log(filebase: &Path, obs: &ObsContext) -> Result<(), SnifferError> {
    let mut summary = open_stream(filebase, "log", None)?;
    obs.write_summary(&mut summary)?;
    summary.flush()?;
    Ok(())
}

impl OutputSet {
    pub(crate) fn create(
        filebase: &Path,
        obs: &ObsContext,
        write_bandpass: bool,
    ) -> Result<OutputSet, SnifferError> {
        let obscode_header = format!("obscode:  {}", obs.obs_code);
        Ok(OutputSet {
            channels: open_stream(filebase, "channels", Some(&obscode_header))?,
            apd: open_stream(filebase, "apd", Some(&obscode_header))?,
            apc: open_stream(filebase, "apc", Some(&obscode_header))?,
            wts: open_stream(
                filebase,
                "wts",
                Some(&format!("PLOTWT summary: {}", obs.obs_code)),
            )?,
            acb: open_stream(filebase, "acb", None)?,
            xcb: open_stream(filebase, "xcb", None)?,
            cpol: if obs.num_stokes == 4 {
                Some(open_stream(filebase, "cpol", Some(&obscode_header))?)
            } else {
                None
            },
            bandpass: if write_bandpass {
                Some(open_stream(filebase, "bandpass", Some(&obscode_header))?)
            } else {
                None
            },
        })
    }

    pub(crate) fn flush_all(&mut self) -> std::io::Result<()> {
        self.channels.flush()?;
        self.apd.flush()?;
        self.apc.flush()?;
        self.wts.flush()?;
        self.acb.flush()?;
        self.xcb.flush()?;
        if let Some(cpol) = self.cpol.as_mut() {
            cpol.flush()?;
        }
        if let Some(bandpass) = self.bandpass.as_mut() {
            bandpass.flush()?;
        }
        Ok(())
    }
}

fn open_stream(
    filebase: &Path,
    ext: &str,
    header: Option<&str>,
) -> Result<BufWriter<File>, SnifferError> {
    let path = with_ext(filebase, ext)?;
    let file = File::create(&path).map_err(|err| SnifferError::Create {
        path: path.display().to_string(),
        err,
    })?;
    let mut w = BufWriter::new(file);
    if let Some(header) = header {
        writeln!(w, "{header}")?;
    }
    Ok(w)
}

fn with_ext(filebase: &Path, ext: &str) -> Result<PathBuf, SnifferError> {
    let mut os = filebase.as_os_str().to_os_string();
    os.push(".");
    os.push(ext);
    let path = PathBuf::from(os);
    match path.file_name() {
        Some(name) if name.len() <= MAX_NAME_LEN => Ok(path),
        _ => Err(SnifferError::FileNameTooLong(path.display().to_string())),
    }
}
