//! Terminal-state mirror and its content digests.

pub mod hashes;
mod terminal;

pub use hashes::StateHashes;
pub use terminal::TerminalState;
