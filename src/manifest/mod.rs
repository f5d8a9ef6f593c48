//! Build manifest and restore descriptor handling.
//!
//! The manifest formats are property lists: nested heterogeneous
//! dictionaries, arrays, and binary blobs. Parsing validates the fields
//! the pipeline depends on eagerly and keeps everything else as opaque
//! side dictionaries, so newer firmware bundles with extra keys keep
//! working.
//!
//! # Structure
//!
//! A build manifest enumerates one `BuildIdentity` per packaged
//! device/board variant; each identity maps component names (`OS`,
//! `Cryptex1,SystemOS`, ...) to archive entry references. The restore
//! descriptor (`Restore.plist`) carries the product version, build
//! version, and the supported product types.

mod build;
mod restore;
mod select;

pub use build::*;
pub use restore::*;
pub use select::*;
