//! Gantry daemon library
//!
//! This module exports the internal components of the daemon for testing purposes.

pub mod cli;
pub mod config;
pub mod host;
pub mod tenant;
