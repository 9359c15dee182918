use std::io;

/// Errors returned by the reactor.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying system call failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Listener could not be created or bound.
    #[error("bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: io::Error,
    },
    /// A loop thread could not be spawned or died before handing back
    /// its handle.
    #[error("loop thread setup: {0}")]
    LoopThread(String),
}
