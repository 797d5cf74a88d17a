#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Framing(&'static str),

    #[error("sequence error: {0}")]
    Sequence(&'static str),

    #[error("high-priority queue is full")]
    QueueFull,

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("peer rejected: {0}")]
    PeerRejected(std::net::IpAddr),

    #[error("connection is not active")]
    NotActive,
}

pub type Result<T> = std::result::Result<T, Error>;
