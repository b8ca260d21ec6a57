//! Internal implementation modules for `refdeploy-core`.
//!
//! Most callers should go through [`crate::Installation`] rather than
//! importing these modules directly.

pub mod config;
pub mod deploy;
pub mod deps;
pub(crate) mod fs;
pub mod installation;
pub mod installer;
pub mod locks;
pub mod pull;
pub mod ref_file;
pub mod remote;
pub mod sandbox;
pub mod summary;
