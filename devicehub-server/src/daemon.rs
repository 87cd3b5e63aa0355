use anyhow::{anyhow, Result};
use daemonize::Daemonize;
use devicehub_core::config::config_dir;
use std::fs;
use std::path::PathBuf;
use tracing::info;

use crate::Role;

/// Path of the PID file for `role`
pub fn pid_file_path(role: Role) -> Result<PathBuf> {
    Ok(config_dir()?.join(format!("{}.pid", role)))
}

/// Path of the log file for `role`
pub fn log_file_path(role: Role) -> Result<PathBuf> {
    Ok(config_dir()?.join(format!("{}.log", role)))
}

/// Detach from the terminal, then start the runtime and run `role`
pub fn daemonize_and_run(role: Role, config: Option<PathBuf>, json_logs: bool) -> Result<()> {
    let pid_file = pid_file_path(role)?;
    let log_file = log_file_path(role)?;

    if is_running(role)? {
        return Err(anyhow!("devicehub {} is already running", role));
    }

    let stdout = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)?;
    let stderr = stdout.try_clone()?;

    let pid_file_display = pid_file.display().to_string();
    let log_file_display = log_file.display().to_string();

    let daemonize = Daemonize::new()
        .pid_file(pid_file)
        .working_directory("/tmp")
        .stdout(stdout)
        .stderr(stderr);

    match daemonize.start() {
        Ok(_) => {
            // tracing and the runtime must both be created in the child
            crate::init_logging(false, json_logs);

            info!("devicehub {} daemonized", role);
            info!("PID file: {}", pid_file_display);
            info!("Log file: {}", log_file_display);

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(crate::run(role, config))
        }
        Err(e) => Err(anyhow!("Failed to daemonize: {}", e)),
    }
}

/// Whether the PID file of `role` points at a live process
pub fn is_running(role: Role) -> Result<bool> {
    let pid_file = pid_file_path(role)?;

    if !pid_file.exists() {
        return Ok(false);
    }

    let pid_str = fs::read_to_string(&pid_file)?;
    let pid: i32 = pid_str
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid PID in {}", pid_file.display()))?;

    Ok(is_process_running(pid))
}

#[cfg(unix)]
fn is_process_running(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // signal 0 only checks that the process exists
    kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_running() {
        assert!(is_process_running(std::process::id() as i32));
    }
}
