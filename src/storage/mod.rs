//! On-disk layout of the daemon's state directory.

pub mod fs;

pub use fs::{Storage, STORAGE_DIR};
