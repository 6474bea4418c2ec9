//! # Sola Common Library
//!
//! Shared code for the Sola services:
//! - Error type used by store and configuration helpers
//! - TOML/ENV configuration resolution
//! - Database bootstrap and row models
//! - Search shard addressing

pub mod config;
pub mod db;
pub mod error;
pub mod shards;
pub mod time;

pub use error::{Error, Result};
pub use shards::ShardTarget;
