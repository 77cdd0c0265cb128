use n0_error::{AnyError, stack_error};

/// Errors surfaced by [`Client`](crate::Client) operations.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ClientError {
    /// The client was closed; every later operation reports this.
    #[error("relay client is closed")]
    Closed,

    /// No live connection and the operation does not connect on its own.
    #[error("not connected")]
    NotConnected,

    /// The relay URL scheme has no default port and none was supplied.
    #[error("invalid URL scheme {scheme:?}")]
    InvalidUrlScheme { scheme: String },

    /// The region callback reported the directory as unavailable.
    #[error("relay region not available")]
    RegionUnavailable,

    /// Establishing a connection failed somewhere between DNS and the relay
    /// handshake. Annotated with the calling operation and the dial target.
    #[error("{caller}: connect to {target} failed")]
    Connect {
        caller: &'static str,
        target: String,
        #[error(source)]
        source: AnyError,
    },

    /// A live connection failed mid-operation; the connection has been torn
    /// down and the next call will reconnect.
    #[error("relay connection failed")]
    Relay {
        #[error(source)]
        source: AnyError,
    },
}

impl ClientError {
    /// Whether this is the post-`Close` sentinel.
    pub fn is_closed(&self) -> bool {
        matches!(self, ClientError::Closed { .. })
    }
}
