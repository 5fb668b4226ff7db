#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),

    #[error("malformed message header")]
    BadHeader,

    #[error("malformed ack frame")]
    BadAck,

    #[error("product size {0} out of range")]
    SizeOutOfRange(u64),

    #[error("sequence number {0} out of range")]
    SeqnoOutOfRange(u32),

    #[error("sequence number {got} where {expected} was expected")]
    SeqnoMismatch { got: u32, expected: u32 },

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("first product did not carry a valid connection announcement")]
    BadAnnounce,

    #[error("network read timed out")]
    RecvTimeout,

    #[error("shutdown requested")]
    Shutdown,
}
