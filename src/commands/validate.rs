//! Validate command

use std::path::PathBuf;

use clap::Args;

use strata_common::InstallConfig;

use super::load_install_config;
use crate::Result;

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to install-config.yaml
    pub install_config: PathBuf,
}

pub fn run(args: ValidateArgs) -> Result<()> {
    let config = load(&args)?;
    println!(
        "{}: valid ({} cluster {})",
        args.install_config.display(),
        config.platform.kind()?,
        config.cluster_domain()
    );
    Ok(())
}

fn load(args: &ValidateArgs) -> Result<InstallConfig> {
    load_install_config(&args.install_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("install-config.yaml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn accepts_a_complete_config() {
        let (_dir, path) = write(
            "metadata: {name: demo}\nbaseDomain: example.com\n\
             networking: {machineNetwork: [{cidr: 10.0.0.0/16}]}\n\
             controlPlane: {replicas: 3}\nplatform:\n  aws:\n    region: us-east-1\n",
        );
        let config = load(&ValidateArgs { install_config: path }).unwrap();
        assert_eq!(config.cluster_domain(), "demo.example.com");
    }

    #[test]
    fn reports_missing_base_domain() {
        let (_dir, path) = write(
            "metadata: {name: demo}\n\
             networking: {machineNetwork: [{cidr: 10.0.0.0/16}]}\n\
             controlPlane: {replicas: 3}\nplatform:\n  aws:\n    region: us-east-1\n",
        );
        let err = load(&ValidateArgs { install_config: path }).unwrap_err();
        assert!(err.to_string().contains("base domain must be set"));
    }

    #[test]
    fn names_a_missing_file() {
        let err = load(&ValidateArgs {
            install_config: PathBuf::from("/nonexistent/install-config.yaml"),
        })
        .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/install-config.yaml"));
    }
}
