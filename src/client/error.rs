use std::io;

use thiserror::Error;

use crate::error::ServiceError;

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Failures of calls made to cluster nodes, by peers or by the game-facing client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to build HTTP client")]
    Builder {
        #[source]
        source: reqwest::Error,
    },
    /// Connection refused, timeout or an undecodable body.
    #[error("request to `{address}` failed")]
    Transport {
        address: String,
        #[source]
        source: reqwest::Error,
    },
    /// The node answered with an error status or `success: false`.
    #[error("`{address}` rejected the request ({status}): {message}")]
    Rejected {
        address: String,
        status: u16,
        message: String,
    },
    /// The change feed of `address` produced a frame that is not a feed message.
    #[error("malformed feed frame from `{address}`")]
    MalformedFrame {
        address: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no candidate node is configured")]
    NoCandidates,
    #[error("operation failed after {attempts} attempt(s)")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<ClientError>,
    },
    /// The local fallback host could not be started.
    #[error("fallback host failed")]
    Fallback(#[source] io::Error),
    /// The fallback host's own store failed while moving rows in or out of it.
    #[error("fallback store failed")]
    FallbackStore(#[source] ServiceError),
}

impl ClientError {
    /// Address of the node involved, when the error concerns a single node.
    pub fn address(&self) -> Option<&str> {
        match self {
            ClientError::Transport { address, .. }
            | ClientError::Rejected { address, .. }
            | ClientError::MalformedFrame { address, .. } => Some(address),
            _ => None,
        }
    }
}
