//! IPSW container access.
//!
//! An IPSW is a zip-structured archive holding the build manifest, the
//! restore descriptor, and one or more disk-image entries. This module
//! provides random access to entry metadata without touching payloads,
//! and chunked streaming reads for the multi-gigabyte image members.

mod reader;

pub use reader::*;
