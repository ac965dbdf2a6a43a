//! Pure utility functions.
//!
//! Process bootstrap and backoff policies shared by the connector and binaries.

pub mod bootstrap;
pub mod retry;
