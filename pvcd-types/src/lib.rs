//! Cluster-wide value types and the typed codec between them and raw
//! coordination-store bytes.

pub mod codec;
mod state;

pub use codec::{decode, decode_list, encode, encode_list, CodecError};
pub use state::{DaemonState, DomainState, NodeDomainState, RouterState};

pub use uuid::Uuid;
