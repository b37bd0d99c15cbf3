//! Command-line interface module.
//!
//! This module provides the CLI functionality for:
//! - Registering model versions from local artifact files
//! - Listing the catalog
//! - Deleting versions

pub mod commands;
pub mod handlers;

pub use handlers::{handle_delete, handle_list, handle_register};
