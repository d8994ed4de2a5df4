//! Registry error types

use thiserror::Error;

use super::key::ClientId;
use crate::upstream::UpstreamError;

/// Error type for registry operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Opening the upstream session failed; nothing was registered
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// The client already holds a session
    #[error("client {0} is already attached to a session")]
    AlreadyAttached(ClientId),

    /// The registry no longer hands out sessions
    #[error("registry is shutting down")]
    ShuttingDown,
}
