// src/lib.rs

//! hostpkg Package Manager
//!
//! Host-level package manager for its own `.hpkg` archives alongside the
//! operating system's native packages.
//!
//! # Architecture
//!
//! - Database-first: installed state, history and source indexes in SQLite
//! - Resolution: ranked candidates, enumerated by depth so the chosen
//!   solution disturbs installed packages as little as possible
//! - Transactions: install/upgrade/remove under a reentrant, crash-tolerant
//!   repository lock
//! - File-level tracking: SHA-256 hashes, file conflict detection, modified
//!   config files kept on removal

pub mod db;
mod error;
pub mod lock;
pub mod native;
pub mod packages;
pub mod platform;
pub mod repository;
pub mod resolver;
pub mod scripts;
pub mod services;
pub mod session;
pub mod transaction;
pub mod version;

pub use error::{Error, Result};
