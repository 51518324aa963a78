//! store-native: composition-time adapters for store-core.
//!
//! Provides the two concrete `FileSystem` implementations the product ships
//! with — direct native I/O (`NativeFs`) and host-callback I/O (`HostFs`
//! for embedded/mobile runtimes) — plus the persisted writer identity and
//! the `store-admin` maintenance binary.

pub mod host_fs;
pub mod identity;
pub mod native_fs;

pub use host_fs::{HostFs, HostFsBuilder};
pub use identity::{load_or_generate, StoredIdentity};
pub use native_fs::NativeFs;
