//! Root filesystem image location and extraction.
//!
//! A build identity references its root filesystem as an archive entry
//! plus decode parameters: the payload may be a plain tree container, a
//! block-compressed image, or an encrypted container wrapping either.
//! Extraction streams the entry in bounded chunks end to end; nothing
//! here ever buffers a whole image, and no OS-level mounting is involved.

mod block;
mod extract;
mod locate;
mod tree;

pub use block::*;
pub use extract::*;
pub use locate::*;
pub use tree::*;
