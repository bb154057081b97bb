use thiserror::Error;

pub use color_eyre::eyre::eyre;

use crate::protocol::response::ErrorResponse;

pub type Result<T> = core::result::Result<T, Error>;

/// Driver-side (library) errors plus server errors mapped 1:1 from the wire.
///
/// Server errors arrive as an ERROR frame and are carried whole in
/// [`Error::Server`]; everything else originates inside the driver.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Server error: {0}")]
    Server(#[from] ErrorResponse),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad config: {0}")]
    BadConfig(String),

    #[error("Bad parameters: {0}")]
    BadParams(&'static str),

    #[error("No streams available on this connection")]
    NoStreams,

    #[error("Unable to initialize session: {0}")]
    UnableToInit(String),

    #[error("Unable to encode message: {0}")]
    MessageEncode(&'static str),

    #[error("Unable to resolve host: {0}")]
    HostResolution(String),

    #[error("Unexpected response from server: {0}")]
    UnexpectedResponse(&'static str),

    #[error("The request queue is full")]
    RequestQueueFull,

    #[error("No hosts available for the request (attempted: {attempted:?})")]
    NoHostsAvailable { attempted: Vec<String> },

    #[error("Error writing to socket")]
    WriteError,

    #[error("Unable to set keyspace {0:?}")]
    UnableToSetKeyspace(String),

    #[error("Request timed out")]
    RequestTimedOut,

    #[error("Unable to determine a common protocol version (server uses {0})")]
    UnableToDetermineProtocol(u8),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("The result has no paging state")]
    NoPagingState,

    #[error("Bound parameter {0} is unset")]
    ParameterUnset(usize),

    #[error("Malformed frame: {0}")]
    InvalidFrame(&'static str),

    #[error("Unexpected end of frame body")]
    UnexpectedEof,

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("A bug in zero-cql: {0}")]
    LibraryBug(color_eyre::Report),
}

impl Error {
    pub fn from_debug(err: impl std::fmt::Debug) -> Self {
        Self::LibraryBug(eyre!(format!("{:#?}", err)))
    }

    /// Errors that mean "this host/connection attempt failed, move on to the
    /// next host in the query plan" rather than "fail the request".
    pub(crate) fn is_host_level(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::NoStreams
                | Self::WriteError
                | Self::ConnectionClosed
                | Self::RequestQueueFull
        )
    }
}

impl From<core::convert::Infallible> for Error {
    fn from(err: core::convert::Infallible) -> Self {
        match err {}
    }
}
