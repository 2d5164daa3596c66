//! Disk-backed B+tree index.
//!
//! The [`storage`] layer persists one tree per file. [`secondary`] builds
//! field indexes with duplicate keys on top of it, configured through
//! [`config`].

pub mod config;
pub mod secondary;
pub mod storage;
#[cfg(test)]
mod testing;
