//! Shared helpers.

pub mod bootstrap;
