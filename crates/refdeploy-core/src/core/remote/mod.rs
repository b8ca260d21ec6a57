pub mod commit;
pub mod config;
pub mod filter;
pub mod oci;
pub mod sideload;
pub mod state;

pub use commit::load_ref_commit;
pub use config::{load_remotes, remote_names, RemoteConfig};
pub use filter::{FilterCache, RefFilter, RefGlobs};
pub use sideload::{discover_sideload_repos, sideload_dirs, SideloadRepo};
pub use state::{BuildMode, FetchFailure, RemoteState, ResolvedRef, StateContext};
