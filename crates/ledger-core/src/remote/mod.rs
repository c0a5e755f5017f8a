//! Remote authority: client seam, error mapping and typed repository

mod client;
pub mod errors;
mod http;
mod memory;
mod repository;

pub use client::{OfflineRemote, RemoteClient, RemoteResult};
pub use errors::{ErrorKind, RemoteError, ERROR_CODES};
pub use http::HttpRemoteClient;
pub use memory::MemoryRemote;
pub use repository::{decode, RemoteRepository, WriteResponse};
