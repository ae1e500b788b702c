//! Crate-wide error type, covering every protocol-level error kind named
//! by the component design: connect failures, IO, timeouts, peer close,
//! protocol violations, backpressure, and server handler-contract
//! violations.

use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("failed to connect: {0}")]
    Connect(#[source] std::io::Error),

    #[error("read error: {0}")]
    IoRead(#[source] std::io::Error),

    #[error("write error: {0}")]
    IoWrite(#[source] std::io::Error),

    #[error("read or write timeout exceeded")]
    Timeout,

    #[error("peer closed the connection")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("backpressure: {0}")]
    Backpressure(String),

    #[error("handler contract violation: {0}")]
    HandlerContract(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Closed
        } else {
            Error::IoRead(err)
        }
    }
}
