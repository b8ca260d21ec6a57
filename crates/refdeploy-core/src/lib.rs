#![deny(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::module_name_repetitions
)]

//! Installing, updating and removing refs from remote content repositories
//! into an installation directory.

mod core;

pub mod config {
    pub use crate::core::config::*;
}

pub mod deploy {
    pub use crate::core::deploy::*;
}

pub mod deps {
    pub use crate::core::deps::*;
}

pub mod installer {
    pub use crate::core::installer::*;
}

pub mod locks {
    pub use crate::core::locks::*;
}

pub mod pull {
    pub use crate::core::pull::*;
}

pub mod remote {
    pub use crate::core::remote::*;
}

pub mod sandbox {
    pub use crate::core::sandbox::*;
}

pub mod summary {
    pub use crate::core::summary::*;
}

pub use crate::core::config::{CoreConfig, EnvSnapshot, Environment};
pub use crate::core::installation::{InstallOptions, Installation, Scope, UnusedOptions};
pub use crate::core::installer::{Installer, LocalInstaller, RemoteHelperInstaller, SystemHelper};
pub use crate::core::ref_file::RefFile;
pub use crate::core::remote::RemoteConfig;

pub use refdeploy_domain::{
    find_deploy_error, DeployData, DeployError, ErrorKind, Ref, RefKind, DEPLOY_VERSION_CURRENT,
};
