// src/packages/mod.rs

//! Managed package support for hostpkg
//!
//! This module provides the package data model (metadata, requirements,
//! manifests), the `.hpkg` archive format, and the collaborator traits the
//! transaction engine drives.

pub mod archive;
pub mod metadata;
pub mod requirement;
pub mod traits;
pub mod unpack;

pub use metadata::{Manifest, Metadata};
pub use requirement::{Requirement, RequirementKind};
pub use traits::{ArchiveReader, Unpacker};
