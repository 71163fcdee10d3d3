//! CLI subcommands.

pub mod config;
pub mod diff;
pub mod dylink;
pub mod probe;
