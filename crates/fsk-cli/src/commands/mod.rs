//! Command handler modules for the fsk CLI.
//!
//! Command-specific logic lives in the submodules; `main.rs` only parses
//! arguments and prints.

pub mod audit;
pub mod dep;
