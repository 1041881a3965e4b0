use coffre_types::{CoffreError, Result};

use crate::platform::shell;

/// Context injected into hook commands as environment variables.
pub struct HookContext<'a> {
    pub job: &'a str,
    pub repository: &'a str,
    pub error: Option<&'a str>,
}

/// Run one hook command through the shell.
///
/// A non-zero exit is an error; callers decide whether that aborts the
/// operation (pre-hooks) or is merely logged (post- and fail-hooks).
pub fn run_hook(cmd: &str, ctx: &HookContext<'_>) -> Result<()> {
    tracing::info!(job = ctx.job, "running hook: {cmd}");

    let mut command = shell::command_for_script(cmd);
    command.env("COFFRE_JOB", ctx.job);
    command.env("COFFRE_REPOSITORY", ctx.repository);
    if let Some(error) = ctx.error {
        command.env("COFFRE_ERROR", error);
    }

    let output = command
        .output()
        .map_err(|e| CoffreError::Hook(format!("failed to execute '{cmd}': {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        return Err(CoffreError::Hook(format!(
            "'{cmd}' exited {code}: {}",
            stderr.trim()
        )));
    }
    Ok(())
}
