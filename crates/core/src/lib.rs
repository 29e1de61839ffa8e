//! Core types and shared functionality for pixcache.
//!
//! This crate provides:
//! - Cache key derivation (identifier -> filesystem-safe digest)
//! - Bounded in-memory LRU cache with injected size/removal/create hooks
//! - Journal-backed disk cache with crash recovery
//! - Unified error types
//! - Configuration structures

pub mod cache;
pub mod config;
pub mod error;

pub use cache::{DiskCache, Editor, MemoryCache, MemoryCacheBuilder, MemoryStats, Snapshot, derive_key};
pub use config::{AppConfig, ConfigError};
pub use error::Error;
