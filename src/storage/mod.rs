//! Storage module
//!
//! Output file layout and the verified-piece writer.

pub mod layout;
pub mod writer;

pub use layout::{FileEntry, FileLayout, Segment};
pub use writer::{OutputWriter, VerifiedPiece};
