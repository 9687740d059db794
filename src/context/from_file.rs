// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Loading the observation model from a file.

use std::{fs::File, io::Read, path::Path};

use log::debug;

use super::{ObsContext, ObsContextError};

impl ObsContext {
    /// Read and validate an observation model from a TOML file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<ObsContext, ObsContextError> {
        fn inner(path: &Path) -> Result<ObsContext, ObsContextError> {
            debug!("Attempting to parse observation model {} ...", path.display());
            let mut contents = String::new();
            let mut fh = File::open(path)?;
            fh.read_to_string(&mut contents)?;
            let context: ObsContext = match toml::from_str(&contents) {
                Ok(c) => c,
                Err(e) => {
                    return Err(ObsContextError::TomlDecode {
                        file: path.display().to_string(),
                        err: e.to_string(),
                    })
                }
            };
            context.validate()?;
            Ok(context)
        }
        inner(path.as_ref())
    }
}
