//! # Temporary system image manager
//!
//! This crate installs a second, disposable system image next to the
//! running one: it carves out pinned image files on the data
//! filesystem, streams the image into them, describes their extents in
//! a partition table for first-stage boot, and removes everything again
//! without touching the real system and data partitions.
//!
//! The `gsid` binary (`crates/cli`) is a thin wrapper that delegates to
//! [`cli::run_from_iter`]; first-stage boot uses [`boot_status`].

pub mod boot_status;
pub mod cli;
pub mod config;
pub mod error;
pub mod fiemap;
pub mod fstab;
pub mod image;
pub mod install;
pub mod metadata;
pub mod platform;
pub mod progress;
pub mod service;
pub mod writer;

#[cfg(test)]
mod testutil;
