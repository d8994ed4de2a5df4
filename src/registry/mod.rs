//! Upstream session registry
//!
//! The registry decides which upstream session a client is served from.
//! With reuse enabled (the default) all clients asking for the same source
//! share one session, and therefore one upstream connection and one capture
//! thread.
//!
//! # Architecture
//!
//! ```text
//!                      Arc<SessionRegistry>
//!                 ┌────────────────────────────┐
//!                 │ shared: HashMap<SourceId,  │
//!                 │   { session, clients }     │
//!                 │ >                          │
//!                 │ private: HashMap<ClientId, │
//!                 │   session>                 │
//!                 └─────────────┬──────────────┘
//!                               │
//!          ┌────────────────────┼────────────────────┐
//!          ▼                    ▼                    ▼
//!     [client 1]           [client 2]           [client 3]
//!   get_or_create()      get_or_create()      get_or_create()
//!          │                    │                    │
//!          └──► UpstreamSession (cam1) ◄─┘           └──► UpstreamSession (cam2)
//! ```
//!
//! A session lives exactly as long as some client references it: the last
//! `release` closes it before returning.

pub mod config;
pub mod error;
pub mod key;
pub mod store;

pub use config::RegistryConfig;
pub use error::RegistryError;
pub use key::{ClientId, InvalidSourceId, SourceId};
pub use store::SessionRegistry;
