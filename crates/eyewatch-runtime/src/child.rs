//! Tracker child-process plumbing: spawn, interrupt, output forwarding,
//! exit observation. Holds no lifecycle state; see `tracker`.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;

use eyewatch_core::DeviceId;

/// Program and leading arguments used to launch a tracker. The device id is
/// appended as the final argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for TrackerCommand {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            args: vec!["track_apps.py".to_string()],
        }
    }
}

/// How the child ended, as far as the OS tells us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitReport {
    fn from_status(status: &std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// A launched tracker. Dropping `kill` without sending leaves the child
/// running; sending on it forces termination.
pub(crate) struct SpawnedChild {
    pub pid: u32,
    pub kill: oneshot::Sender<()>,
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// Launch the tracker for `device`.
///
/// Output lines are forwarded to the log. `on_exit` runs exactly once when
/// the child terminates, for whatever reason.
pub(crate) fn spawn_tracker<F>(
    command: &TrackerCommand,
    device: &DeviceId,
    on_exit: F,
) -> std::io::Result<SpawnedChild>
where
    F: FnOnce(Option<ExitReport>) + Send + 'static,
{
    let mut std_cmd = std::process::Command::new(&command.program);
    std_cmd
        .args(&command.args)
        .arg(device.as_str())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // Own process group: a ctrl-c on the daemon's terminal must not reach
    // the tracker directly.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        std_cmd.process_group(0);
    }

    let mut cmd = Command::from(std_cmd);
    cmd.kill_on_drop(true);
    let mut child = cmd.spawn()?;
    let pid = child
        .id()
        .ok_or_else(|| std::io::Error::other("tracker exited before its pid was read"))?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, OutputStream::Stdout, device.clone(), pid));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, OutputStream::Stderr, device.clone(), pid));
    }

    let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
    let device_for_log = device.clone();
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            Ok(()) = &mut kill_rx => {
                if let Err(e) = child.start_kill() {
                    tracing::warn!(device = %device_for_log, pid, "kill failed: {e}");
                }
                child.wait().await
            }
        };

        let report = match status {
            Ok(status) => {
                let report = ExitReport::from_status(&status);
                tracing::info!(
                    device = %device_for_log,
                    pid,
                    code = ?report.code,
                    signal = ?report.signal,
                    "tracker exited"
                );
                Some(report)
            }
            Err(e) => {
                tracing::warn!(device = %device_for_log, pid, "waiting on tracker failed: {e}");
                None
            }
        };
        on_exit(report);
    });

    Ok(SpawnedChild { pid, kill: kill_tx })
}

/// Ask the process to stop (SIGINT).
#[cfg(unix)]
pub(crate) fn send_interrupt(pid: u32) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) takes plain integers and touches no memory we own.
    let rc = unsafe { libc::kill(pid, libc::SIGINT) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub(crate) fn send_interrupt(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "graceful interrupt is not supported on this platform",
    ))
}

async fn forward_lines<R>(reader: R, stream: OutputStream, device: DeviceId, pid: u32)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                match stream {
                    OutputStream::Stdout => {
                        tracing::info!(
                            target: "eyewatch::tracker",
                            device = %device,
                            pid,
                            "stdout: {line}"
                        );
                    }
                    OutputStream::Stderr => {
                        tracing::warn!(
                            target: "eyewatch::tracker",
                            device = %device,
                            pid,
                            "stderr: {line}"
                        );
                    }
                }
            }
            Err(e) => {
                tracing::debug!(device = %device, pid, "tracker {stream:?} read error: {e}");
                break;
            }
        }
    }
}
