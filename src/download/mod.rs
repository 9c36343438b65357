//! Download module
//!
//! Piece bookkeeping, work distribution and the session orchestrator.

pub mod distributor;
pub mod ledger;
pub mod orchestrator;

pub use distributor::{Assignment, PieceDistributor};
pub use ledger::{PieceLedger, PieceState, PieceStatus};
pub use orchestrator::{DownloadOutcome, Downloader};
