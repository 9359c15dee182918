pub mod acceptor;
pub mod buffer;
pub mod channel;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod loop_thread;
pub mod metrics;
pub(crate) mod poller;
pub mod socket;
pub mod tcp_server;
pub mod timer;
pub mod tls;
pub mod wheel;

// Public API re-exports
pub use acceptor::Acceptor;
pub use buffer::Buffer;
pub use channel::Channel;
pub use connection::{ConnStatus, TcpConnection};
pub use error::Error;
pub use event_loop::{EventLoop, LoopHandle};
pub use loop_thread::{EventLoopThread, EventLoopThreadPool};
pub use socket::{Socket, listen_addr};
pub use tcp_server::TcpServer;
pub use timer::TimerId;
pub use tls::{TlsFilter, TlsState};
pub use wheel::{EntryHandle, TimingWheel};
