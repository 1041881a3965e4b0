use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use coffre_core::cached::daemon::{Cached, DEFAULT_TEARDOWN};
use coffre_core::config::parse_human_duration;
use coffre_core::platform::paths;
use coffre_types::{CoffreError, Result};

use crate::signal;

pub(crate) fn run(foreground: bool, log: Option<&str>, teardown: &str) -> Result<i32> {
    if std::env::var_os("COFFRE_AGENTLESS").is_some() {
        return Err(CoffreError::Config(
            "cached can not be started when COFFRE_AGENTLESS is set".into(),
        ));
    }

    let teardown = if teardown.is_empty() {
        DEFAULT_TEARDOWN
    } else {
        parse_human_duration(teardown)?
    };

    // Background by re-executing ourselves in a fresh session; REEXEC
    // tells the child not to daemonize again.
    if !foreground && std::env::var_os("REEXEC").is_none() {
        daemonize()?;
        return Ok(0);
    }

    let cache_dir = paths::cache_dir();
    std::fs::create_dir_all(&cache_dir)?;
    if std::env::var_os("REEXEC").is_some() {
        redirect_stderr_to_crash_log(&cache_dir);
    }

    let daemon = Cached::new(&cache_dir, teardown);
    match daemon.listen_and_serve(signal::shutdown_flag()) {
        Ok(()) => {
            tracing::info!("server gracefully stopped");
            Ok(0)
        }
        Err(e) => {
            tracing::error!("{e}");
            Ok(1)
        }
    }
}

fn daemonize() -> Result<()> {
    let exe = std::env::current_exe()
        .map_err(|e| CoffreError::Other(format!("failed to get executable: {e}")))?;
    let args: Vec<std::ffi::OsString> = std::env::args_os().skip(1).collect();

    let mut command = Command::new(exe);
    command
        .args(args)
        .env("REEXEC", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    unsafe {
        command.pre_exec(|| {
            // Detach from the controlling terminal and process group.
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    command
        .spawn()
        .map_err(|e| CoffreError::Other(format!("failed to start cached: {e}")))?;
    Ok(())
}

/// Once detached there is nowhere for a panic trace to go; keep it in a
/// known location under the cache directory.
fn redirect_stderr_to_crash_log(cache_dir: &std::path::Path) {
    let crash_log = cache_dir.join("crash-cached.log");
    if let Ok(file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&crash_log)
    {
        unsafe {
            libc::dup2(file.as_raw_fd(), libc::STDERR_FILENO);
        }
        // The fd stays open for the process lifetime.
        std::mem::forget(file);
    }
}
