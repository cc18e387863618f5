//! Sandboxed command execution.
//!
//! A [`Sandbox`] builds [`Cmd`] handles with identical semantics across
//! three back-ends: the local host ([`local::Local`]), a container runtime
//! ([`container::Container`]), and a remote host over SSH ([`ssh::Ssh`]).
//! Tools never learn which back-end they run on.

pub mod container;
pub mod local;
mod process;
pub mod ssh;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::client::Error;

/// Buffered output of a completed command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exec {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

pub type PipeReader = Box<dyn AsyncRead + Send + Unpin>;
pub type PipeWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A command that can be configured, started and streamed.
///
/// Pipes must be requested before [`Cmd::start`], and each at most once.
/// [`Cmd::wait`] finalizes [`Cmd::exit_code`]: a non-zero exit surfaces as
/// [`Error::CommandExit`] with the code reflected, a killed command as
/// [`Error::Cancelled`] with exit code -1.
#[async_trait]
pub trait Cmd: Send {
    fn set_dir(&mut self, dir: &str);
    fn set_tty(&mut self, tty: bool);

    fn stdin_pipe(&mut self) -> Result<PipeWriter, Error>;
    fn stdout_pipe(&mut self) -> Result<PipeReader, Error>;
    fn stderr_pipe(&mut self) -> Result<PipeReader, Error>;

    async fn start(&mut self) -> Result<(), Error>;
    async fn wait(&mut self) -> Result<(), Error>;

    async fn run(&mut self) -> Result<(), Error> {
        self.start().await?;
        self.wait().await
    }

    fn exit_code(&self) -> i32;
}

/// An isolated environment that can execute commands.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Build a command handle. No I/O happens until it is started.
    fn command(&self, program: &str, args: &[String]) -> Box<dyn Cmd>;

    /// Run a command and buffer stdout/stderr along with its exit code.
    /// A clean non-zero exit is reported through `Exec::exit_code`, not as
    /// an error.
    async fn execute(&self, program: &str, args: &[String]) -> Result<Exec, Error> {
        collect(self.command(program, args)).await
    }
}

/// Run a command and buffer stdout/stderr while preserving the exit code.
pub async fn collect(mut command: Box<dyn Cmd>) -> Result<Exec, Error> {
    let mut stdout = command.stdout_pipe()?;
    let mut stderr = command.stderr_pipe()?;

    command.start().await?;

    let stdout_task = tokio::spawn(async move {
        let mut buffer = String::new();
        let _ = stdout.read_to_string(&mut buffer).await;
        buffer
    });
    let stderr_task = tokio::spawn(async move {
        let mut buffer = String::new();
        let _ = stderr.read_to_string(&mut buffer).await;
        buffer
    });

    let waited = command.wait().await;
    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    let result = Exec {
        stdout,
        stderr,
        exit_code: command.exit_code(),
    };

    match waited {
        Ok(()) => Ok(result),
        Err(Error::CommandExit { .. }) if result.exit_code >= 0 => Ok(result),
        Err(err) => Err(err),
    }
}

/// Quote a string for a POSIX shell: single-quote wrapping with embedded
/// single quotes escaped as `'"'"'`.
pub fn shell_quote(input: &str) -> String {
    if input.is_empty() {
        return "''".to_string();
    }
    format!("'{}'", input.replace('\'', r#"'"'"'"#))
}

/// Flatten a program and its arguments into one shell-quoted string.
pub fn join_command(program: &str, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(shell_quote(program));
    for arg in args {
        parts.push(shell_quote(arg));
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_plain() {
        assert_eq!(shell_quote("ls"), "'ls'");
        assert_eq!(shell_quote("two words"), "'two words'");
    }

    #[test]
    fn quote_empty() {
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn quote_embedded_single_quotes() {
        assert_eq!(shell_quote("it's"), r#"'it'"'"'s'"#);
        assert_eq!(shell_quote("''"), r#"''"'"''"'"''"#);
    }

    #[test]
    fn quote_round_trips_through_sh() {
        // quote(x) ∘ sh -c ∘ echo returns x
        for input in ["hello", "it's", "a\"b", "$HOME", "a b  c", "`id`", "\\n"] {
            let quoted = shell_quote(input);
            let output = std::process::Command::new("sh")
                .arg("-c")
                .arg(format!("printf %s {quoted}"))
                .output()
                .expect("runs sh");
            assert_eq!(String::from_utf8_lossy(&output.stdout), input, "input {input:?}");
        }
    }

    #[test]
    fn join_quotes_every_argument() {
        assert_eq!(
            join_command("echo", &["a".to_string(), "b c".to_string(), String::new()]),
            "'echo' 'a' 'b c' ''"
        );
    }
}
