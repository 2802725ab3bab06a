//! Ignition editing for load-balancer-aware bootstrap data
//!
//! Provisioning renders bootstrap and master Ignition before any cloud
//! resource exists. This crate patches facts discovered later (LB addresses,
//! install provenance) into those documents without disturbing anything else
//! they carry.

#![deny(missing_docs)]

pub mod config;
pub mod dataurl;
pub mod edit;
pub mod install_info;
pub mod lbconfig;
pub mod pki;

pub use config::{File, IgnitionConfig};
pub use edit::{edit_ignition, EditIgnitionInput, IgnitionOutput};
pub use install_info::{inject_install_info, InstallInfo};
pub use pki::{CertKeyPair, CertReissuer, PkiError, RootCa};
