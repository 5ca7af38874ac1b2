// src/lib.rs

//! Entropy repository management
//!
//! Binary package repositories for a source-based distribution: per-branch
//! repository stores, branch switching, dependency resolution and QA checks,
//! preserved shared libraries, notice boards, differential repository
//! updates and cleanup of expired package files.
//!
//! # Architecture
//!
//! - Database-first: every store is an SQLite database with versioned schema
//! - Explicit context: operations receive a `RepositoryContext` holding the
//!   root directory, settings and per-repository locks
//! - Two-phase updates: fetch without locks, commit under an exclusive lock
//!   inside a single transaction

pub mod atom;
pub mod branch;
pub mod cleanup;
pub mod context;
pub mod db;
mod error;
pub mod lock;
pub mod notice;
pub mod preserved;
pub mod query;
pub mod repository;
pub mod resolver;
pub mod settings;
pub mod store;
pub mod version;

pub use context::RepositoryContext;
pub use error::{Error, Result};
