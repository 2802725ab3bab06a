//! CLI commands

use std::path::Path;

use strata_common::InstallConfig;
use strata_ignition::RootCa;

use crate::{Error, Result};

pub mod edit_ignition;
pub mod provision;
pub mod validate;

/// Read a file, naming it in the error
pub(crate) fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Write a file, naming it in the error
pub(crate) fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    std::fs::write(path, data).map_err(|source| Error::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Read and validate an install config
pub(crate) fn load_install_config(path: &Path) -> Result<InstallConfig> {
    let config = InstallConfig::from_yaml(&String::from_utf8_lossy(&read_file(path)?))?;
    config.validate()?;
    Ok(config)
}

/// Load the root CA that signs the machine-config server certificate
pub(crate) fn load_root_ca(cert: &Path, key: &Path) -> Result<RootCa> {
    let cert = read_file(cert)?;
    let key = read_file(key)?;
    Ok(RootCa::from_pem(
        &String::from_utf8_lossy(&cert),
        &String::from_utf8_lossy(&key),
    )?)
}
