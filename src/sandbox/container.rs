//! Container sandbox: commands run inside a container via podman or
//! docker.

use async_trait::async_trait;

use crate::client::Error;
use crate::env::lookup_path;
use crate::sandbox::process::{Invocation, ProcessCmd};
use crate::sandbox::{Cmd, Sandbox};

/// Executes commands inside a container runtime.
pub struct Container {
    runtime: String,
    target: Target,
    exec_args: Vec<String>,
}

#[derive(Clone)]
enum Target {
    /// `exec` into a running container.
    Running(String),
    /// `run --rm` a fresh container from an image.
    Image {
        image: String,
        volumes: Vec<(String, String)>,
    },
}

impl Container {
    /// Target a running container by name or id.
    pub fn new(container: impl Into<String>) -> Result<Self, Error> {
        Ok(Self {
            runtime: detect_runtime()?,
            target: Target::Running(container.into()),
            exec_args: Vec::new(),
        })
    }

    /// Run each command in a fresh container from the given image.
    pub fn image(image: impl Into<String>) -> Result<Self, Error> {
        Ok(Self {
            runtime: detect_runtime()?,
            target: Target::Image {
                image: image.into(),
                volumes: Vec::new(),
            },
            exec_args: Vec::new(),
        })
    }

    /// Override the runtime binary (`podman` or `docker`).
    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = runtime.into();
        self
    }

    /// Append raw args to the runtime invocation.
    pub fn with_exec_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.exec_args.extend(args);
        self
    }

    /// Mount a host path into image-mode containers.
    pub fn with_volume(mut self, host: impl Into<String>, guest: impl Into<String>) -> Self {
        if let Target::Image { volumes, .. } = &mut self.target {
            volumes.push((host.into(), guest.into()));
        }
        self
    }
}

#[async_trait]
impl Sandbox for Container {
    fn command(&self, program: &str, args: &[String]) -> Box<dyn Cmd> {
        let runtime = self.runtime.clone();
        let target = self.target.clone();
        let exec_args = self.exec_args.clone();

        Box::new(ProcessCmd::new(program, args, move |settings| {
            let mut argv = Vec::new();
            match &target {
                Target::Running(container) => {
                    argv.push("exec".to_string());
                    if settings.tty {
                        argv.push("-t".to_string());
                    }
                    if !settings.dir.is_empty() {
                        argv.push("-w".to_string());
                        argv.push(settings.dir.clone());
                    }
                    argv.extend(exec_args.iter().cloned());
                    argv.push(container.clone());
                }
                Target::Image { image, volumes } => {
                    argv.push("run".to_string());
                    argv.push("--rm".to_string());
                    argv.push("-i".to_string());
                    if settings.tty {
                        argv.push("-t".to_string());
                    }
                    if !settings.dir.is_empty() {
                        argv.push("-w".to_string());
                        argv.push(settings.dir.clone());
                    }
                    for (host, guest) in volumes {
                        argv.push("-v".to_string());
                        argv.push(format!("{host}:{guest}"));
                    }
                    argv.extend(exec_args.iter().cloned());
                    argv.push(image.clone());
                }
            }
            argv.push(settings.program.clone());
            argv.extend(settings.args.iter().cloned());

            Ok(Invocation {
                program: runtime.clone(),
                args: argv,
                current_dir: None,
            })
        }))
    }
}

fn detect_runtime() -> Result<String, Error> {
    if lookup_path("podman").is_some() {
        return Ok("podman".to_string());
    }
    if lookup_path("docker").is_some() {
        return Ok("docker".to_string());
    }
    Err(Error::Config(
        "container: unable to find podman or docker".to_string(),
    ))
}
