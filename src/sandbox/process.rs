//! Shared subprocess machinery for the local and container back-ends.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{self, AsyncWriteExt, DuplexStream};
use tokio::process::{Child, Command};

use crate::client::Error;
use crate::sandbox::{Cmd, PipeReader, PipeWriter};

const PIPE_BUFFER: usize = 64 * 1024;

/// Requested settings for a command, handed to the back-end's prepare hook
/// at start time.
pub(crate) struct Settings {
    pub program: String,
    pub args: Vec<String>,
    pub dir: String,
    pub tty: bool,
}

/// Resolved invocation: the actual argv and working directory to spawn
/// with.
pub(crate) struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
}

type Prepare = Box<dyn Fn(&Settings) -> Result<Invocation, Error> + Send + Sync>;

/// A command executed as a host subprocess. The back-end supplies a
/// prepare hook that turns the requested settings into the concrete argv
/// (the container back-end wraps everything in `<runtime> exec …`).
pub(crate) struct ProcessCmd {
    settings: Settings,
    prepare: Prepare,
    stdin: PipeSlot,
    stdout: PipeSlot,
    stderr: PipeSlot,
    child: Option<Child>,
    started: bool,
    exit_code: i32,
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

impl ProcessCmd {
    pub(crate) fn new(
        program: &str,
        args: &[String],
        prepare: impl Fn(&Settings) -> Result<Invocation, Error> + Send + Sync + 'static,
    ) -> Self {
        Self {
            settings: Settings {
                program: program.to_string(),
                args: args.to_vec(),
                dir: String::new(),
                tty: false,
            },
            prepare: Box::new(prepare),
            stdin: PipeSlot::default(),
            stdout: PipeSlot::default(),
            stderr: PipeSlot::default(),
            child: None,
            started: false,
            exit_code: -1,
        }
    }
}

#[async_trait]
impl Cmd for ProcessCmd {
    fn set_dir(&mut self, dir: &str) {
        self.settings.dir = dir.to_string();
    }

    fn set_tty(&mut self, tty: bool) {
        self.settings.tty = tty;
    }

    fn stdin_pipe(&mut self) -> Result<PipeWriter, Error> {
        let user = self.stdin.request("stdin", self.started)?;
        Ok(Box::new(user))
    }

    fn stdout_pipe(&mut self) -> Result<PipeReader, Error> {
        let user = self.stdout.request("stdout", self.started)?;
        Ok(Box::new(user))
    }

    fn stderr_pipe(&mut self) -> Result<PipeReader, Error> {
        let user = self.stderr.request("stderr", self.started)?;
        Ok(Box::new(user))
    }

    async fn start(&mut self) -> Result<(), Error> {
        if self.started {
            return Err(Error::Config("command already started".to_string()));
        }

        let invocation = (self.prepare)(&self.settings)?;

        let mut command = Command::new(&invocation.program);
        command.args(&invocation.args);
        if let Some(dir) = &invocation.current_dir {
            command.current_dir(dir);
        }
        command.stdin(stdio_for(&self.stdin));
        command.stdout(stdio_for(&self.stdout));
        command.stderr(stdio_for(&self.stderr));
        command.kill_on_drop(true);

        let mut child = command.spawn()?;

        if let Some(mut internal) = self.stdin.internal.take() {
            if let Some(mut child_stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    let _ = io::copy(&mut internal, &mut child_stdin).await;
                    let _ = child_stdin.shutdown().await;
                });
            }
        }
        if let Some(mut internal) = self.stdout.internal.take() {
            if let Some(mut child_stdout) = child.stdout.take() {
                tokio::spawn(async move {
                    let _ = io::copy(&mut child_stdout, &mut internal).await;
                });
            }
        }
        if let Some(mut internal) = self.stderr.internal.take() {
            if let Some(mut child_stderr) = child.stderr.take() {
                tokio::spawn(async move {
                    let _ = io::copy(&mut child_stderr, &mut internal).await;
                });
            }
        }

        self.child = Some(child);
        self.started = true;
        Ok(())
    }

    async fn wait(&mut self) -> Result<(), Error> {
        let Some(child) = self.child.as_mut() else {
            return Err(Error::Config("command not started".to_string()));
        };

        let status = child.wait().await?;
        match status.code() {
            Some(0) => {
                self.exit_code = 0;
                Ok(())
            }
            Some(code) => {
                self.exit_code = code;
                Err(Error::CommandExit {
                    code,
                    stderr: String::new(),
                })
            }
            // Killed by signal: treated as cancellation.
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

fn stdio_for(slot: &PipeSlot) -> Stdio {
    if slot.requested {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}
