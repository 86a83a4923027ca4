//! SSH session management: the transport seam and the bounded session pool.

pub mod pool;
pub mod transport;

pub use pool::{SessionHandle, SessionPool};
pub use transport::{ExecError, ExecOutput, RemoteSession, SshTransport, Transport};
