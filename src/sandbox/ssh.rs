//! SSH sandbox: commands run on a remote host over a fresh session per
//! command.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use russh::client;
use russh::ChannelMsg;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

use crate::client::Error;
use crate::sandbox::{join_command, shell_quote, Cmd, PipeReader, PipeWriter, Sandbox};

const PIPE_BUFFER: usize = 64 * 1024;

/// Executes commands on a remote host over ssh.
pub struct Ssh {
    host: String,
    port: u16,
    identity_file: Option<PathBuf>,
    extra_args: Vec<String>,
}

impl Ssh {
    /// Target `host` or `user@host`. Defaults to port 22 and the `USER`
    /// env var when no user is given.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            identity_file: None,
            extra_args: Vec::new(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Path to an unencrypted private key.
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Append raw ssh arguments. Not supported by this transport; commands
    /// built with extra args fail at session start.
    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.extra_args.extend(args);
        self
    }

    fn split_user_host(&self) -> (String, String) {
        match self.host.split_once('@') {
            Some((user, host)) => (user.to_string(), host.to_string()),
            None => (
                std::env::var("USER").unwrap_or_else(|_| "root".to_string()),
                self.host.clone(),
            ),
        }
    }
}

#[async_trait]
impl Sandbox for Ssh {
    fn command(&self, program: &str, args: &[String]) -> Box<dyn Cmd> {
        Box::new(SshCmd {
            host: self.host.clone(),
            user_host: self.split_user_host(),
            port: self.port,
            identity_file: self.identity_file.clone(),
            extra_args: self.extra_args.clone(),
            program: program.to_string(),
            args: args.to_vec(),
            dir: String::new(),
            tty: false,
            stdin: PipeSlot::default(),
            stdout: PipeSlot::default(),
            stderr: PipeSlot::default(),
            session: None,
            started: false,
            exit_code: -1,
        })
    }
}

#[derive(Default)]
struct PipeSlot {
    requested: bool,
    internal: Option<DuplexStream>,
}

impl PipeSlot {
    fn request(&mut self, name: &str, started: bool) -> Result<DuplexStream, Error> {
        if started {
            return Err(Error::Config(format!("{name} pipe requested after start")));
        }
        if self.requested {
            return Err(Error::Config(format!("{name} pipe already requested")));
        }
        self.requested = true;
        let (user, internal) = io::duplex(PIPE_BUFFER);
        self.internal = Some(internal);
        Ok(user)
    }
}

struct SshCmd {
    host: String,
    user_host: (String, String),
    port: u16,
    identity_file: Option<PathBuf>,
    extra_args: Vec<String>,
    program: String,
    args: Vec<String>,
    dir: String,
    tty: bool,
    stdin: PipeSlot,
    stdout: PipeSlot,
    stderr: PipeSlot,
    session: Option<JoinHandle<Option<u32>>>,
    started: bool,
    exit_code: i32,
}

impl SshCmd {
    fn command_string(&self) -> String {
        command_string(&self.program, &self.args, &self.dir)
    }
}

/// Flatten the command into a single shell line, changing directory first
/// when one is set.
fn command_string(program: &str, args: &[String], dir: &str) -> String {
    let command = join_command(program, args);
    if dir.is_empty() {
        command
    } else {
        format!("cd {} && {}", shell_quote(dir), command)
    }
}

struct AcceptAll;

#[async_trait]
impl client::Handler for AcceptAll {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

#[async_trait]
impl Cmd for SshCmd {
    fn set_dir(&mut self, dir: &str) {
        self.dir = dir.to_string();
    }

    fn set_tty(&mut self, tty: bool) {
        self.tty = tty;
    }

    fn stdin_pipe(&mut self) -> Result<PipeWriter, Error> {
        Ok(Box::new(self.stdin.request("stdin", self.started)?))
    }

    fn stdout_pipe(&mut self) -> Result<PipeReader, Error> {
        Ok(Box::new(self.stdout.request("stdout", self.started)?))
    }

    fn stderr_pipe(&mut self) -> Result<PipeReader, Error> {
        Ok(Box::new(self.stderr.request("stderr", self.started)?))
    }

    async fn start(&mut self) -> Result<(), Error> {
        if self.started {
            return Err(Error::Config("command already started".to_string()));
        }
        if !self.extra_args.is_empty() {
            return Err(Error::Config(
                "ssh: extra arguments are not supported".to_string(),
            ));
        }
        let Some(identity_file) = &self.identity_file else {
            return Err(Error::Config("ssh: identity file is required".to_string()));
        };

        let (user, host) = self.user_host.clone();

        let key = russh::keys::load_secret_key(identity_file, None).map_err(|err| {
            Error::Config(format!(
                "ssh: loading key {}: {err} (encrypted keys are not supported)",
                identity_file.display()
            ))
        })?;

        let config = Arc::new(client::Config::default());
        let mut session = client::connect(config, (host.as_str(), self.port), AcceptAll)
            .await
            .map_err(|err| Error::Provider(format!("ssh: dial {}:{}: {err}", self.host, self.port)))?;

        let key = russh::keys::key::PrivateKeyWithHashAlg::new(Arc::new(key), None)
            .map_err(|err| Error::Config(format!("ssh: key {}: {err}", identity_file.display())))?;
        let auth = session
            .authenticate_publickey(&user, key)
            .await
            .map_err(|err| Error::Provider(format!("ssh: authenticating: {err}")))?;
        if !auth {
            return Err(Error::Provider(format!(
                "ssh: authentication as {user:?} rejected"
            )));
        }

        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|err| Error::Provider(format!("ssh: opening session: {err}")))?;

        if self.tty {
            channel
                .request_pty(false, "xterm", 80, 40, 0, 0, &[])
                .await
                .map_err(|err| Error::Provider(format!("ssh: requesting pty: {err}")))?;
        }

        channel
            .exec(true, self.command_string())
            .await
            .map_err(|err| Error::Provider(format!("ssh: exec: {err}")))?;

        let mut stdin = self.stdin.internal.take();
        let mut stdout = self.stdout.internal.take();
        let mut stderr = self.stderr.internal.take();

        let pump = tokio::spawn(async move {
            // The session handle must outlive the channel pump.
            let _session = session;
            let mut exit_status: Option<u32> = None;
            let mut stdin_open = stdin.is_some();
            if !stdin_open {
                let _ = channel.eof().await;
            }
            let mut buffer = [0u8; 8192];

            loop {
                tokio::select! {
                    message = channel.wait() => match message {
                        Some(ChannelMsg::Data { ref data }) => {
                            if let Some(out) = stdout.as_mut() {
                                let _ = out.write_all(data).await;
                            }
                        }
                        Some(ChannelMsg::ExtendedData { ref data, ext: 1 }) => {
                            if let Some(err) = stderr.as_mut() {
                                let _ = err.write_all(data).await;
                            }
                        }
                        Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                            exit_status = Some(status);
                        }
                        Some(_) => {}
                        None => break,
                    },
                    read = read_from(&mut stdin, &mut buffer), if stdin_open => {
                        match read {
                            Ok(0) | Err(_) => {
                                stdin_open = false;
                                let _ = channel.eof().await;
                            }
                            Ok(n) => {
                                let _ = channel.data(&buffer[..n]).await;
                            }
                        }
                    }
                }
            }

            exit_status
        });

        self.session = Some(pump);
        self.started = true;
        Ok(())
    }

    async fn wait(&mut self) -> Result<(), Error> {
        let Some(pump) = self.session.take() else {
            return Err(Error::Config("command not started".to_string()));
        };

        let exit_status = pump
            .await
            .map_err(|err| Error::Provider(format!("ssh: session task: {err}")))?;

        match exit_status {
            Some(0) => {
                self.exit_code = 0;
                Ok(())
            }
            Some(code) => {
                self.exit_code = code as i32;
                Err(Error::CommandExit {
                    code: code as i32,
                    stderr: String::new(),
                })
            }
            None => {
                self.exit_code = -1;
                Err(Error::Cancelled)
            }
        }
    }

    fn exit_code(&self) -> i32 {
        self.exit_code
    }
}

async fn read_from(
    stream: &mut Option<DuplexStream>,
    buffer: &mut [u8],
) -> std::io::Result<usize> {
    match stream {
        Some(stream) => stream.read(buffer).await,
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_string_quotes_and_prefixes_dir() {
        let args = vec!["-la".to_string(), "my dir".to_string()];
        assert_eq!(
            command_string("ls", &args, "/srv/app"),
            "cd '/srv/app' && 'ls' '-la' 'my dir'"
        );
        assert_eq!(command_string("ls", &args, ""), "'ls' '-la' 'my dir'");
    }

    #[test]
    fn user_defaults_when_not_in_host() {
        let sandbox = Ssh::new("example.com");
        let (_, host) = sandbox.split_user_host();
        assert_eq!(host, "example.com");

        let sandbox = Ssh::new("admin@example.com");
        assert_eq!(
            sandbox.split_user_host(),
            ("admin".to_string(), "example.com".to_string())
        );
    }

    #[tokio::test]
    async fn extra_args_fail_at_start() {
        let sandbox = Ssh::new("example.com")
            .with_identity_file("/tmp/id_ed25519")
            .with_args(["-o".to_string(), "Compression=yes".to_string()]);
        let mut command = sandbox.command("true", &[]);
        let err = command.start().await.expect_err("fails");
        assert!(err.to_string().contains("not supported"));
    }

    #[tokio::test]
    async fn missing_identity_fails_at_start() {
        let sandbox = Ssh::new("example.com");
        let mut command = sandbox.command("true", &[]);
        let err = command.start().await.expect_err("fails");
        assert!(err.to_string().contains("identity file"));
    }
}
