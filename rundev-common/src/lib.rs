//! Shared building blocks for the rundev client and daemon.
//!
//! The local proxy (`rundev`) and the remote daemon (`rundevd`) both depend
//! on this crate for:
//!
//! - the filesystem tree model and its 64-bit fingerprint ([`fsnode`]),
//! - the ordered tree diff ([`fsdiff`]),
//! - the gzip-compressed tar patch codec ([`archive`], [`unarchive`]),
//! - dockerignore-style exclusion rules ([`ignore`]),
//! - wire constants and shared protocol types ([`constants`], [`types`]).

pub mod archive;
pub mod constants;
pub mod error;
pub mod fsdiff;
pub mod fsnode;
pub mod ignore;
pub mod types;
pub mod unarchive;

pub use error::{Error, Result};
pub use fsdiff::{fs_diff, DiffKind, DiffOp};
pub use fsnode::{walk, FsNode};
pub use ignore::FileIgnores;
pub use types::{BuildCmd, Cmd, ProcError};
