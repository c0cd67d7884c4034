//! External-program provider
//!
//! Runs `<command> [args...] apply|delete` with the request as JSON on
//! stdin. For `apply`, stdout must be a JSON object: the resource's
//! outputs. Exit code 75 (`EX_TEMPFAIL`) or stderr that looks like a
//! throttling or connectivity problem makes the failure transient.

use super::touches_immutable;
use declarative::{
    ApplyContext, ApplyRequest, Attributes, Operation, PropertyChange, Provider, ProviderConfig,
    ProviderError, ResolvedResource,
};
use regex::Regex;
use serde_json::json;
use std::io::{self, Write};
use std::process::{Command, Stdio};
use std::sync::LazyLock;
use std::thread;

/// `EX_TEMPFAIL` from sysexits.h
const EXIT_TEMPFAIL: i32 = 75;

static TRANSIENT_STDERR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)timed? ?out|connection (refused|reset)|rate limit|too many requests|temporarily unavailable|\b(429|502|503|504)\b",
    )
    .expect("transient stderr pattern is valid")
});

pub struct ExecProvider {
    name: String,
    command: String,
    args: Vec<String>,
    immutable: Vec<String>,
}

impl ExecProvider {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        immutable: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            immutable,
        }
    }

    /// Run one verb and return its stdout.
    fn invoke(&self, verb: &str, payload: &serde_json::Value) -> Result<String, ProviderError> {
        let display = format!("{} {verb}", self.command);
        log::debug!("{}: running {display}", self.name);

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .arg(verb)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ProviderError::permanent(format!("failed to execute {display}: {e}")))?;

        // Feed stdin while stdout drains so large requests cannot fill both pipes
        let request = payload.to_string();
        let stdin = child.stdin.take();
        let (written, output) = thread::scope(|scope| {
            let writer = scope.spawn(move || match stdin {
                Some(mut stdin) => match stdin.write_all(request.as_bytes()) {
                    Err(e) if e.kind() != io::ErrorKind::BrokenPipe => Err(e),
                    _ => Ok(()),
                },
                None => Ok(()),
            });
            let output = child.wait_with_output();
            (writer.join(), output)
        });

        let output = output
            .map_err(|e| ProviderError::permanent(format!("failed to wait for {display}: {e}")))?;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(ProviderError::permanent(format!(
                    "failed to write request to {display}: {e}"
                )));
            }
            Err(_) => {
                return Err(ProviderError::permanent(format!(
                    "writer for {display} panicked"
                )));
            }
        }

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("{display} exited with {}", output.status)
        } else {
            stderr
        };
        if output.status.code() == Some(EXIT_TEMPFAIL) || TRANSIENT_STDERR.is_match(&message) {
            Err(ProviderError::transient(message))
        } else {
            Err(ProviderError::permanent(message))
        }
    }
}

fn config_json(config: &ProviderConfig) -> serde_json::Value {
    config
        .iter()
        .map(|(k, v)| (k.to_string(), json!(v)))
        .collect::<serde_json::Map<_, _>>()
        .into()
}

impl Provider for ExecProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, request: &ApplyRequest, ctx: &ApplyContext) -> Result<Attributes, ProviderError> {
        ctx.check_cancelled()?;
        let (operation, prior) = match &request.operation {
            Operation::Create => ("create", serde_json::Value::Null),
            Operation::Update { prior } => (
                "update",
                json!({"inputs": prior.inputs, "outputs": prior.outputs}),
            ),
        };
        let payload = json!({
            "operation": operation,
            "resource": request.resource,
            "prior": prior,
            "config": config_json(ctx.config),
        });

        let stdout = self.invoke("apply", &payload)?;
        match serde_json::from_str(&stdout) {
            Ok(serde_json::Value::Object(outputs)) => Ok(outputs),
            Ok(_) => Err(ProviderError::permanent(format!(
                "{}: apply output for '{}' is not a JSON object",
                self.name, request.resource.name
            ))),
            Err(e) => Err(ProviderError::permanent(format!(
                "{}: invalid apply output for '{}': {e}",
                self.name, request.resource.name
            ))),
        }
    }

    fn delete(&self, resource: &ResolvedResource, ctx: &ApplyContext) -> Result<(), ProviderError> {
        ctx.check_cancelled()?;
        let payload = json!({
            "operation": "delete",
            "resource": resource,
            "config": config_json(ctx.config),
        });
        self.invoke("delete", &payload).map(|_| ())
    }

    fn requires_replacement(&self, _kind: &str, changes: &[PropertyChange]) -> bool {
        touches_immutable(&self.immutable, changes)
    }
}
