//! Platform tool invocation through configurable shell command templates
//!
//! Templates use `{name}` placeholders. Substituted values are wrapped in
//! single quotes so device ids and paths cannot break out of their argument.
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::error::{HubError, Result};

/// Escape a string for use inside single quotes: `'` becomes `'\''`
pub fn escape_single_quote(s: &str) -> String {
    s.replace('\'', r"'\''")
}

/// Values substituted into a template
#[derive(Debug, Clone, Default)]
pub struct CommandVars(HashMap<&'static str, String>);

impl CommandVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.0.insert(key, value.into());
        self
    }

    /// Replace every known `{key}` with its quoted value
    ///
    /// The template is scanned once; substituted text is never scanned
    /// again, so a value containing `{other}` stays literal.
    pub fn render(&self, template: &str) -> String {
        let mut rendered = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            rendered.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let value = after
                .find('}')
                .and_then(|close| self.0.get(&after[..close]).map(|v| (close, v)));
            match value {
                Some((close, value)) => {
                    rendered.push('\'');
                    rendered.push_str(&escape_single_quote(value));
                    rendered.push('\'');
                    rest = &after[close + 1..];
                }
                None => {
                    rendered.push('{');
                    rest = after;
                }
            }
        }
        rendered.push_str(rest);
        rendered
    }
}

fn shell(rendered: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(rendered).kill_on_drop(true);
    cmd
}

/// Run to completion and return stdout; non-zero exit is an error
pub async fn run(template: &str, vars: &CommandVars) -> Result<Vec<u8>> {
    run_with_input(template, vars, None).await
}

/// Like [`run`], writing `input` to the child's stdin first
pub async fn run_with_input(
    template: &str,
    vars: &CommandVars,
    input: Option<&[u8]>,
) -> Result<Vec<u8>> {
    let rendered = vars.render(template);
    debug!("Running: {}", rendered);

    let mut child = shell(&rendered)
        .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let (Some(data), Some(mut stdin)) = (input, child.stdin.take()) {
        stdin.write_all(data).await?;
        drop(stdin);
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(HubError::Command(format!(
            "`{}` exited with {}: {}",
            rendered, output.status, stderr
        )));
    }
    Ok(output.stdout)
}

/// Run and report whether it exited successfully
pub async fn succeeds(template: &str, vars: &CommandVars) -> Result<bool> {
    let rendered = vars.render(template);
    debug!("Checking: {}", rendered);

    let status = shell(&rendered)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    Ok(status.success())
}

/// Start a long-running command (e.g. a screen recorder)
pub fn spawn(template: &str, vars: &CommandVars) -> Result<Child> {
    let rendered = vars.render(template);
    debug!("Spawning: {}", rendered);

    Ok(shell(&rendered)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?)
}
