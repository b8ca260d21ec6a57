#![deny(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation
)]

//! Value types shared by the refdeploy crates.

pub mod deploy_data;
pub mod error;
pub mod keyfile;
pub mod metadata;
pub mod refs;
pub mod variant;

pub use deploy_data::{
    ContentRating, DeployData, DEPLOY_VERSION_ANY, DEPLOY_VERSION_CURRENT,
};
pub use error::{find_deploy_error, DeployError, ErrorKind, InstalledContext};
pub use keyfile::{parse_remote_group, remote_group, KeyFile, KeyFileError};
pub use metadata::{AppMetadata, ExtensionOf, ExtensionPoint};
pub use refs::{is_valid_checksum, CollectionRef, Ref, RefKind};
pub use variant::{VarDict, Variant, VariantError, VariantType};
