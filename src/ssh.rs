//! SSH access to runner VMs.
//!
//! Sessions are never pooled: every operation opens a fresh connection,
//! authenticates with the instance's private keyfile and closes. The
//! libssh2 work is blocking and runs under `spawn_blocking`; the async
//! surface takes owned parameters so per-runner tasks can fan out freely.

use ssh2::Session;
use std::io::Read;
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

pub const SSH_USER: &str = "ubuntu";
const SSH_PORT: u16 = 22;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SESSION_TIMEOUT_MS: u32 = 20_000;
const LIVENESS_COMMAND: &str = "echo hello";

#[derive(Debug, Error)]
pub enum SshError {
    #[error("instance has no usable address")]
    NoAddress,

    #[error("tcp connect failed")]
    Connect(#[source] std::io::Error),

    #[error("ssh protocol failure")]
    Protocol(#[from] ssh2::Error),

    #[error("ssh authentication failed")]
    Auth(#[source] ssh2::Error),

    /// The private keyfile is missing or unreadable. Unlike transport
    /// failures this cannot heal on retry.
    #[error("keyfile missing or unreadable: {path}")]
    Keyfile { path: PathBuf },

    #[error("remote command {command:?} exited with status {status}")]
    CommandFailed { command: String, status: i32 },

    #[error("remote file too large: {size} bytes (cap {cap})")]
    FileTooLarge { size: u64, cap: u64 },

    #[error("ssh worker task failed: {0}")]
    Task(String),
}

impl SshError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Keyfile { .. })
    }
}

#[derive(Clone, Debug)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

#[derive(Clone, Debug)]
pub struct SshClient {
    user: String,
    port: u16,
}

impl Default for SshClient {
    fn default() -> Self {
        Self {
            user: SSH_USER.to_string(),
            port: SSH_PORT,
        }
    }
}

impl SshClient {
    /// Open a session and run the trivial liveness command.
    #[instrument(skip(self, addresses, keyfile))]
    pub async fn probe(&self, addresses: Vec<String>, keyfile: PathBuf) -> Result<(), SshError> {
        let output = self
            .exec(addresses, keyfile, LIVENESS_COMMAND.to_string())
            .await?;
        if output.success() {
            Ok(())
        } else {
            Err(SshError::CommandFailed {
                command: LIVENESS_COMMAND.to_string(),
                status: output.status,
            })
        }
    }

    /// Run one command, trying each address in turn until a session opens.
    #[instrument(skip(self, addresses, keyfile), fields(command = %command))]
    pub async fn exec(
        &self,
        addresses: Vec<String>,
        keyfile: PathBuf,
        command: String,
    ) -> Result<CommandOutput, SshError> {
        let client = self.clone();
        tokio::task::spawn_blocking(move || {
            let session = client.open_any(&addresses, &keyfile)?;
            run_command(&session, &command)
        })
        .await
        .map_err(|e| SshError::Task(e.to_string()))?
    }

    /// Pull one remote file over SCP. A missing file is `None`; a file past
    /// `cap` is an error the caller treats as corrupt data.
    #[instrument(skip(self, addresses, keyfile), fields(remote = %remote.display()))]
    pub async fn read_file(
        &self,
        addresses: Vec<String>,
        keyfile: PathBuf,
        remote: PathBuf,
        cap: u64,
    ) -> Result<Option<Vec<u8>>, SshError> {
        let client = self.clone();
        tokio::task::spawn_blocking(move || {
            let session = client.open_any(&addresses, &keyfile)?;

            let (mut channel, stat) = match session.scp_recv(&remote) {
                Ok(pair) => pair,
                Err(e) => {
                    // SCP cannot distinguish "absent" from other remote
                    // failures; the pull is best-effort either way.
                    tracing::debug!(error = %e, remote = %remote.display(), "scp recv failed");
                    return Ok(None);
                }
            };

            if stat.size() > cap {
                return Err(SshError::FileTooLarge {
                    size: stat.size(),
                    cap,
                });
            }

            let mut contents = Vec::with_capacity(stat.size() as usize);
            channel.read_to_end(&mut contents).map_err(SshError::Connect)?;
            let _ = channel.send_eof();
            let _ = channel.wait_close();

            Ok(Some(contents))
        })
        .await
        .map_err(|e| SshError::Task(e.to_string()))?
    }

    fn open_any(&self, addresses: &[String], keyfile: &Path) -> Result<Session, SshError> {
        if !keyfile.exists() {
            return Err(SshError::Keyfile {
                path: keyfile.to_path_buf(),
            });
        }

        let mut last_error = SshError::NoAddress;
        for address in addresses {
            let Ok(ip) = address.parse::<IpAddr>() else {
                tracing::debug!(address, "skipping unparsable address");
                continue;
            };

            match self.open(SocketAddr::new(ip, self.port), keyfile) {
                Ok(session) => return Ok(session),
                Err(e) => {
                    tracing::debug!(error = %e, address, "ssh attempt failed");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    fn open(&self, addr: SocketAddr, keyfile: &Path) -> Result<Session, SshError> {
        let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(SshError::Connect)?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(SESSION_TIMEOUT_MS);
        session.handshake()?;

        session
            .userauth_pubkey_file(&self.user, None, keyfile, None)
            .map_err(SshError::Auth)?;

        Ok(session)
    }
}

fn run_command(session: &Session, command: &str) -> Result<CommandOutput, SshError> {
    let mut channel = session.channel_session()?;
    channel.exec(command)?;

    let mut stdout = String::new();
    channel
        .read_to_string(&mut stdout)
        .map_err(SshError::Connect)?;

    let mut stderr = String::new();
    channel
        .stderr()
        .read_to_string(&mut stderr)
        .map_err(SshError::Connect)?;

    channel.wait_close()?;
    let status = channel.exit_status()?;

    Ok(CommandOutput {
        status,
        stdout,
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyfile_errors_are_fatal() {
        let fatal = SshError::Keyfile {
            path: PathBuf::from("/nope"),
        };
        assert!(fatal.is_fatal());
        assert!(!SshError::NoAddress.is_fatal());
        assert!(
            !SshError::Connect(std::io::Error::new(std::io::ErrorKind::TimedOut, "t")).is_fatal()
        );
    }

    #[tokio::test]
    async fn missing_keyfile_short_circuits_before_any_connect() {
        let client = SshClient::default();
        let err = client
            .probe(vec!["192.0.2.1".into()], PathBuf::from("/no/such/key"))
            .await
            .unwrap_err();
        assert!(matches!(err, SshError::Keyfile { .. }));
    }

    #[test]
    fn command_output_success() {
        let ok = CommandOutput {
            status: 0,
            stdout: "hello\n".into(),
            stderr: String::new(),
        };
        assert!(ok.success());
        let bad = CommandOutput {
            status: 1,
            ..ok
        };
        assert!(!bad.success());
    }
}
