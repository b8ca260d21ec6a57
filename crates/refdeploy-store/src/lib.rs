#![deny(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::module_name_repetitions
)]

//! Content-addressed object store consumed by the deployment engine.

pub mod cancel;
pub mod commit;
pub mod content;
pub mod error;
pub mod fetch;
pub mod object;
pub mod repo;
pub mod sign;
pub mod tree;

pub use cancel::Cancellable;
pub use commit::{Commit, CommitState};
pub use content::{
    CheckoutOptions, CollectionPull, ContentStore, PruneOptions, PruneStats, PullFlags,
    PullOptions, PullSource, PullStats, TransactionStats,
};
pub use error::{StoreError, StoreResult};
pub use fetch::{is_local_uri, join_uri, Fetcher};
pub use object::{sha256_hex, ObjectType};
pub use repo::{root_dirmeta_checksum, FsRepo};
pub use sign::{
    decode_signatures, encode_signatures, has_signatures, Ed25519Signer, Ed25519Verifier,
    SignatureVerifier,
};
pub use tree::{EntryKind, Tree, TreeEntry};
