//! Local sandbox: commands run on the host, optionally jailed to a root
//! directory.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::client::Error;
use crate::sandbox::process::{Invocation, ProcessCmd};
use crate::sandbox::{Cmd, Sandbox};

/// Executes commands on the local machine.
pub struct Local {
    root: Option<PathBuf>,
}

impl Local {
    /// Unjailed: commands may run in any working directory.
    pub fn new() -> Self {
        Self { root: None }
    }

    /// Jailed: the resolved working directory must stay within `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }
}

impl Default for Local {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sandbox for Local {
    fn command(&self, program: &str, args: &[String]) -> Box<dyn Cmd> {
        let root = self.root.clone();
        Box::new(ProcessCmd::new(program, args, move |settings| {
            Ok(Invocation {
                program: settings.program.clone(),
                args: settings.args.clone(),
                current_dir: resolve_workdir(root.as_deref(), &settings.dir)?,
            })
        }))
    }
}

/// Resolve the working directory against the optional root jail.
fn resolve_workdir(root: Option<&Path>, dir: &str) -> Result<Option<PathBuf>, Error> {
    let Some(root) = root else {
        return Ok((!dir.is_empty()).then(|| PathBuf::from(dir)));
    };

    let root = normalize(&std::path::absolute(root)?);
    let workdir = if dir.is_empty() {
        root.clone()
    } else if Path::new(dir).is_absolute() {
        normalize(Path::new(dir))
    } else {
        normalize(&root.join(dir))
    };

    if !workdir.starts_with(&root) {
        return Err(Error::Config(format!(
            "local: working dir {dir:?} is outside of root {}",
            root.display()
        )));
    }

    Ok(Some(workdir))
}

/// Lexically normalize a path: strip `.` components and fold `..` into
/// their parent, without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(part) => normalized.push(part),
        }
    }
    normalized
}
