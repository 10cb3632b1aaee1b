//! Data layer module
//!
//! Handles all data persistence:
//! - Actors (local and remote) with their public keys
//! - Local credentials
//! - WebFinger discovery records
//! - Follow edges
//! - Imported posts

mod database;
mod models;

pub use database::Database;
pub use models::*;
