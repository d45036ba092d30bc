#![forbid(unsafe_code)]

pub mod catalog;
pub mod error;
pub mod gossip;
mod index;
mod poller;
pub mod registry;
pub mod request;
pub mod settings;
pub mod testing;
pub mod time;
pub mod version;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the registry surface at the crate root for convenience.
pub use crate::catalog::{CatalogError, SqlExecutor, SqlRow, SqlTxn, SqlValue};
pub use crate::gossip::{Gossip, GossipError};
pub use crate::registry::Registry;
pub use crate::request::{CollectedId, Request, RequestId};
pub use crate::settings::RegistrySettings;
pub use crate::time::{SystemWallClock, WallClockSource, WallTime};
pub use crate::version::{StaticVersionGate, VersionGate};
