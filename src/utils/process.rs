use std::ffi::OsStr;
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;

use crate::errors::{LauncherError, Result};

#[cfg(target_os = "windows")]
pub const CREATE_NO_WINDOW: u32 = 0x08000000;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[inline]
pub fn hide_console_window(command: &mut Command) {
    #[cfg(target_os = "windows")]
    {
        command.creation_flags(CREATE_NO_WINDOW);
    }
    #[cfg(not(target_os = "windows"))]
    {
        let _ = command;
    }
}

/// A command with no stdin and, on Windows, no console window.
pub fn command<S: AsRef<OsStr>>(program: S) -> Command {
    let mut command = Command::new(program);
    command.stdin(Stdio::null());
    hide_console_window(&mut command);
    command
}

#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Best single-line explanation of a failure, for logs and error values.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match self.code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

pub fn describe(command: &Command) -> String {
    let mut parts = vec![command.get_program().to_string_lossy().to_string()];
    parts.extend(command.get_args().map(|arg| arg.to_string_lossy().to_string()));
    parts.join(" ")
}

fn spawn_reader<R: Read + Send + 'static>(stream: Option<R>) -> Option<thread::JoinHandle<String>> {
    stream.map(|mut stream| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            let _ = stream.read_to_end(&mut buffer);
            String::from_utf8_lossy(&buffer).to_string()
        })
    })
}

/// Runs `command` to completion, killing it once `timeout` elapses.
pub fn run_with_timeout(command: &mut Command, timeout: Duration) -> Result<ProcessOutput> {
    let label = describe(command);
    tracing::debug!("running: {}", label);

    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                LauncherError::ToolMissing(label.clone())
            } else {
                LauncherError::Io(err)
            }
        })?;

    let stdout_reader = spawn_reader(child.stdout.take());
    let stderr_reader = spawn_reader(child.stderr.take());

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if started.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            tracing::warn!("{} timed out after {:?}", label, timeout);
            return Err(LauncherError::Timeout(label));
        }
        thread::sleep(POLL_INTERVAL);
    };

    let join = |reader: Option<thread::JoinHandle<String>>| {
        reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    };

    Ok(ProcessOutput {
        code: status.code(),
        stdout: join(stdout_reader),
        stderr: join(stderr_reader),
    })
}

/// Like [`run_with_timeout`] but a non-zero exit becomes an error.
pub fn run_checked(command: &mut Command, timeout: Duration, context: &str) -> Result<ProcessOutput> {
    let output = run_with_timeout(command, timeout)?;
    if output.success() {
        Ok(output)
    } else {
        Err(LauncherError::Process(format!(
            "{context}: {}",
            output.diagnostic()
        )))
    }
}

/// Runs `<program> --version` and returns the first output line on success.
pub fn probe_version(program: &OsStr, timeout: Duration) -> Option<String> {
    let mut cmd = command(program);
    cmd.arg("--version");
    let output = run_with_timeout(&mut cmd, timeout).ok()?;
    if !output.success() {
        return None;
    }
    // Older interpreters print their version on stderr.
    let text = if output.stdout.trim().is_empty() {
        output.stderr
    } else {
        output.stdout
    };
    text.lines().next().map(|line| line.trim().to_string())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn captures_output_and_exit_code() {
        let mut cmd = command("sh");
        cmd.args(["-c", "echo out; echo err 1>&2; exit 3"]);
        let output = run_with_timeout(&mut cmd, Duration::from_secs(10)).expect("run shell");

        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.diagnostic(), "err");
        assert!(!output.success());
    }

    #[test]
    fn kills_processes_that_exceed_the_timeout() {
        let mut cmd = command("sh");
        cmd.args(["-c", "sleep 5"]);
        let started = Instant::now();
        let result = run_with_timeout(&mut cmd, Duration::from_millis(200));

        assert!(matches!(result, Err(LauncherError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn missing_program_is_reported_as_missing_tool() {
        let mut cmd = command("definitely-not-a-real-binary-4f1c");
        let result = run_with_timeout(&mut cmd, Duration::from_secs(1));
        assert!(matches!(result, Err(LauncherError::ToolMissing(_))));
    }
}
