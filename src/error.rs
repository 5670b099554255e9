use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake with {addr} timed out")]
    HandshakeTimeout { addr: SocketAddr },

    #[error("connection is not established")]
    NotConnected,

    #[error("connection was reset by peer")]
    ConnectionReset,

    #[error("connection already closed")]
    Closed,

    #[error("send did not complete within the completion timeout ({acked}/{total} bytes acknowledged)")]
    SendIncomplete { acked: usize, total: usize },

    #[error("key exchange failed: {0}")]
    KeyExchange(&'static str),

    #[error("key exchange timed out")]
    KeyExchangeTimeout,

    #[error("packet too large for MTU ({len} > {mtu})")]
    PacketTooLarge { len: usize, mtu: usize },

    #[error("endpoint is already connected")]
    AlreadyConnected,
}

pub type Result<T> = std::result::Result<T, Error>;
