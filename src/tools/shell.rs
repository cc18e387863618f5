//! Shell tool: runs a command in a sandbox and returns its combined
//! output.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::Error;
use crate::sandbox::Sandbox;
use crate::tool::{func, Parameters, Property, Tool};

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

const DESCRIPTION: &str = "Runs a shell command and returns a combined output of stdout and stderr.
- The arguments to `shell` will be passed to execvp(). Most terminal commands should be prefixed with `sh -lc`.
- Always set the `workdir` param when using the shell function. By default the workdir is `.`.
- Do not use `cd` unless absolutely necessary.
";

#[derive(Debug, Deserialize)]
struct In {
    cmd: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    workdir: String,
    #[serde(default)]
    timeout_ms: u64,
}

#[derive(Debug, Serialize)]
struct Out {
    output: String,
}

/// Create the shell tool over the given sandbox.
pub fn new(sandbox: Arc<dyn Sandbox>) -> Arc<dyn Tool> {
    let parameters = Parameters::new()
        .property(
            "cmd",
            Property::string()
                .description("The name of the command to execute")
                .required(),
        )
        .property(
            "args",
            Property::array(Property::string())
                .description("The arguments to the command")
                .required(),
        )
        .property(
            "workdir",
            Property::string().description("The working directory to execute the command in"),
        )
        .property(
            "timeout_ms",
            Property::integer().description("The timeout for the command in milliseconds"),
        );

    func("shell", DESCRIPTION, parameters, move |input: In| {
        let sandbox = sandbox.clone();
        async move {
            let timeout = if input.timeout_ms > 0 {
                Duration::from_millis(input.timeout_ms)
            } else {
                DEFAULT_TIMEOUT
            };

            let mut command = sandbox.command(&input.cmd, &input.args);
            if !input.workdir.is_empty() {
                command.set_dir(&input.workdir);
            }

            let result = tokio::time::timeout(timeout, crate::sandbox::collect(command))
                .await
                .map_err(|_| Error::Cancelled)??;

            Ok(Out {
                output: format!("{}{}", result.stdout, result.stderr),
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::local::Local;

    fn shell() -> Arc<dyn Tool> {
        new(Arc::new(Local::new()))
    }

    #[tokio::test]
    async fn runs_and_combines_output() {
        let out = shell()
            .run(r#"{"cmd":"sh","args":["-lc","echo out; echo err >&2"]}"#)
            .await
            .expect("runs");
        let parsed: serde_json::Value = serde_json::from_str(&out).expect("json");
        let output = parsed["output"].as_str().expect("output");
        assert!(output.contains("out\n"));
        assert!(output.contains("err\n"));
    }

    #[tokio::test]
    async fn nonzero_exit_still_returns_output() {
        let out = shell()
            .run(r#"{"cmd":"sh","args":["-lc","echo boom >&2; exit 3"]}"#)
            .await
            .expect("runs");
        let parsed: serde_json::Value = serde_json::from_str(&out).expect("json");
        assert!(parsed["output"].as_str().expect("output").contains("boom"));
    }

    #[tokio::test]
    async fn times_out_as_cancellation() {
        let err = shell()
            .run(r#"{"cmd":"sh","args":["-lc","sleep 5"],"timeout_ms":50}"#)
            .await
            .expect_err("times out");
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn schema_declares_required_fields() {
        let schema = shell().schema();
        assert_eq!(schema.function.name, "shell");
        let value = serde_json::to_value(&schema.function.parameters).expect("json");
        assert_eq!(value["required"], serde_json::json!(["cmd", "args"]));
        assert_eq!(value["properties"]["args"]["items"]["type"], "string");
    }
}
