//! I/O layer: local filesystem helpers and the remote object store

pub mod keys;
pub mod local_fs;
pub mod object_store;

pub use keys::StorageUri;
pub use object_store::{ObjectStore, S3ObjectStore};
