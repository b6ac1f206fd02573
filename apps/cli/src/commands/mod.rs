//! Command implementations for the evoplan CLI.

pub mod catalog;
pub mod identity;
pub mod resolve;
pub mod types;

pub use types::{CatalogArgs, ResolveArgs};
