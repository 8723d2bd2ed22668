//! # strata
//!
//! Maintenance CLI for a Strata version database: configuration loading,
//! the remote capability provider and the command implementations.

pub mod cli;
pub mod config;
pub mod provider;
