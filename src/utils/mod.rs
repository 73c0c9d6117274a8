//! Shared helpers.

pub mod fs;

pub use fs::{atomic_write, copy_path, path_exists, remove_path};
