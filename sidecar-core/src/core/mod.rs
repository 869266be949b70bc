//! Core types for the sidecar
//!
//! - `errors`: the `SidecarError` taxonomy shared by every component
//! - `types`: channel keys, handles and the flat `ConnectionStatus`
//! - `connection_fsm`: typestate lifecycle of the upstream session

pub mod connection_fsm;
pub mod errors;
pub mod types;

// Re-export commonly used types
pub use connection_fsm::{ConnectionData, ConnectionState};
pub use errors::{SidecarError, SidecarResult};
pub use types::{ChannelKey, ChannelKind, ConnectionStatus, SubscriberHandle, UpstreamId};
