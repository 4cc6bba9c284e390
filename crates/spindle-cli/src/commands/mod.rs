//! Subcommand implementations.

pub mod fibers;
pub mod info;
pub mod pipe;
pub mod timers;
