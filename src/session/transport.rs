use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use crate::error::{ConnectReason, FleetError, Result};
use crate::registry::{AuthMaterial, Host};

/// libssh2 session error code for a blocking-operation timeout.
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

/// Raw result of one remote command execution.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Why a command execution failed at the transport level.
///
/// A normal non-zero exit is not an error here; it comes back in
/// `ExecOutput::exit_code`.
#[derive(Debug, Clone)]
pub enum ExecError {
    /// The configured timeout elapsed before the command finished. The
    /// channel is torn down, so the remote command is forcibly detached.
    TimedOut,
    /// The session broke mid-run; remote state is indeterminate.
    ConnectionLost(String),
}

/// A live command channel to one host, borrowed from the pool for the
/// duration of one attempt. Calls block; the executor runs them on a
/// blocking worker.
pub trait RemoteSession: Send {
    fn exec(&mut self, command: &str, timeout: Duration) -> std::result::Result<ExecOutput, ExecError>;

    /// Cheap liveness probe used before reusing a pooled session.
    fn is_healthy(&mut self) -> bool;
}

/// Connection establishment seam. The production implementation speaks SSH;
/// tests substitute an in-process fake.
pub trait Transport: Send + Sync {
    fn connect(&self, host: &Host, auth: &AuthMaterial) -> Result<Box<dyn RemoteSession>>;
}

/// SSH transport backed by libssh2.
#[derive(Debug, Clone, Copy)]
pub struct SshTransport {
    connect_timeout: Duration,
}

impl SshTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Transport for SshTransport {
    fn connect(&self, host: &Host, auth: &AuthMaterial) -> Result<Box<dyn RemoteSession>> {
        let addr = host
            .socket_addr()
            .to_socket_addrs()
            .map_err(|e| FleetError::Connect {
                host: host.id.clone(),
                reason: ConnectReason::Unreachable,
                detail: format!("address resolution failed: {e}"),
            })?
            .next()
            .ok_or_else(|| FleetError::Connect {
                host: host.id.clone(),
                reason: ConnectReason::Unreachable,
                detail: "address resolved to nothing".to_string(),
            })?;

        let stream =
            TcpStream::connect_timeout(&addr, self.connect_timeout).map_err(|e| {
                FleetError::Connect {
                    host: host.id.clone(),
                    reason: ConnectReason::Unreachable,
                    detail: e.to_string(),
                }
            })?;

        let mut session = ssh2::Session::new().map_err(|e| FleetError::Connect {
            host: host.id.clone(),
            reason: ConnectReason::Protocol,
            detail: e.to_string(),
        })?;
        session.set_tcp_stream(stream);
        session.set_timeout(self.connect_timeout.as_millis() as u32);
        session.handshake().map_err(|e| FleetError::Connect {
            host: host.id.clone(),
            reason: ConnectReason::Protocol,
            detail: format!("handshake failed: {e}"),
        })?;

        let auth_result = match auth {
            AuthMaterial::KeyFile { path, passphrase } => session.userauth_pubkey_file(
                &host.username,
                None,
                path,
                passphrase.as_deref(),
            ),
            AuthMaterial::Password(password) => {
                session.userauth_password(&host.username, password)
            }
        };

        if let Err(e) = auth_result {
            return Err(FleetError::Connect {
                host: host.id.clone(),
                reason: ConnectReason::AuthRejected,
                detail: e.to_string(),
            });
        }
        if !session.authenticated() {
            return Err(FleetError::Connect {
                host: host.id.clone(),
                reason: ConnectReason::AuthRejected,
                detail: "authentication incomplete".to_string(),
            });
        }

        tracing::debug!(host = %host.id, addr = %host.socket_addr(), "SSH session established");
        Ok(Box::new(SshSession { session }))
    }
}

struct SshSession {
    session: ssh2::Session,
}

impl SshSession {
    fn classify(err: &ssh2::Error) -> ExecError {
        match err.code() {
            ssh2::ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => ExecError::TimedOut,
            _ => ExecError::ConnectionLost(err.to_string()),
        }
    }

    fn classify_io(err: &std::io::Error) -> ExecError {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ExecError::TimedOut,
            _ => ExecError::ConnectionLost(err.to_string()),
        }
    }

    /// Re-arm the session timeout with the wall-clock budget left before
    /// `deadline`. The libssh2 timeout bounds one blocking call, not the
    /// whole command, so this runs before every call; a spent budget is a
    /// timeout even if each individual call kept returning in time.
    fn arm(&self, deadline: Instant) -> std::result::Result<(), ExecError> {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(ExecError::TimedOut);
        }
        self.session
            .set_timeout(left.as_millis().min(u32::MAX as u128) as u32);
        Ok(())
    }

    /// Read a stream to its end in chunks, checking the deadline between
    /// reads so a command that trickles output forever still times out.
    fn drain(
        &self,
        reader: &mut impl Read,
        deadline: Instant,
        out: &mut Vec<u8>,
    ) -> std::result::Result<(), ExecError> {
        let mut buf = [0u8; 32 * 1024];
        loop {
            self.arm(deadline)?;
            match reader.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) => return Err(Self::classify_io(&e)),
            }
        }
    }
}

impl RemoteSession for SshSession {
    fn exec(&mut self, command: &str, timeout: Duration) -> std::result::Result<ExecOutput, ExecError> {
        let deadline = Instant::now() + timeout;
        self.arm(deadline)?;

        let mut channel = self.session.channel_session().map_err(|e| Self::classify(&e))?;
        channel.exec(command).map_err(|e| Self::classify(&e))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        self.drain(&mut channel, deadline, &mut stdout)?;
        self.drain(&mut channel.stderr(), deadline, &mut stderr)?;

        // Returning TimedOut drops the channel and the executor discards
        // the session, so the remote command is forcibly detached.
        self.arm(deadline)?;
        channel.wait_close().map_err(|e| Self::classify(&e))?;
        let exit_code = channel.exit_status().map_err(|e| Self::classify(&e))?;

        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    fn is_healthy(&mut self) -> bool {
        self.session.authenticated() && self.session.keepalive_send().is_ok()
    }
}
