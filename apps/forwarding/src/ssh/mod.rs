//! SSH client side: sessions, connectors and the per-server pool.

mod pool;
mod session;

pub use pool::{ConnectionLease, SshPool};
pub use session::{
    ClientHandler, RemoteIo, RemoteStream, RusshConnector, RusshSession, SshConnector, SshSession,
};
