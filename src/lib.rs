// ABOUTME: Kitchen Sync: minimal-traffic database synchronization by range hashing
// ABOUTME: Both ends partition tables by primary key and only ship rows whose hashes differ

pub mod client;
pub mod db_url;
pub mod errors;
pub mod helper;
pub mod launcher;
pub mod postgres;
pub mod protocol;
pub mod schema;
pub mod sqlite;
pub mod sync;

pub use errors::{Result, SyncError};
