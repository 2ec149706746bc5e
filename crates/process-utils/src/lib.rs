//! Child-process helpers for spawning and describing worker processes.

use std::ffi::OsStr;
use std::process::ExitStatus;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` suited to a short-lived worker child.
///
/// All three standard streams are piped, the child never opens a console
/// window, and it is killed if the handle is dropped before it is reaped.
#[cfg(feature = "tokio")]
pub fn worker_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    use std::process::Stdio;

    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Describe how a child exited, e.g. `"exited with code 3"`.
///
/// On Unix a child killed by a signal has no exit code; the signal number is
/// reported instead.
pub fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exited with code {code}");
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("terminated by signal {signal}");
        }
    }

    "exited with an unknown status".to_string()
}
