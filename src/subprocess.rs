// ============================================
// RTA Builder - subprocess.rs
// ============================================
// Runs an external tool (7-Zip, oscdimg, PowerShell) while watching it.
//
//   - stdout is streamed, not buffered, so progress shows up live
//   - the stop flag is checked between output lines AND on a short timer,
//     so a tool that has gone quiet can still be stopped
//   - stderr is collected in the background and only reported on failure
//   - an optional idle timeout kills a tool that stops talking
//
// Tools redraw their progress with '\r' or backspaces instead of newlines
// (7-Zip's -bsp1 does this), so output is split on all three.
// ============================================

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::cancel::StopFlag;
use crate::error::{BuildError, Result};

/// How often the stop flag is checked while a tool is silent
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Hide the console window a child would otherwise open on Windows
#[cfg(windows)]
pub fn no_window(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    cmd.creation_flags(winapi::um::winbase::CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
pub fn no_window(_cmd: &mut Command) {}

/// Quote a value as a PowerShell single-quoted string literal
pub fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Run `cmd` to completion, feeding each output line to `on_line`.
///
/// Returns `CancelledByUser` if the stop flag was set (the child is killed),
/// and `SubprocessFailure` on a non-zero exit, with stderr as the detail.
pub fn run_monitored(
    tool: &str,
    mut cmd: Command,
    stop: &StopFlag,
    idle_timeout: Option<Duration>,
    mut on_line: impl FnMut(&str),
) -> Result<()> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    no_window(&mut cmd);

    debug!("Running: {:?}", cmd);
    let mut child = cmd.spawn().map_err(|e| BuildError::SubprocessFailure {
        tool: tool.to_string(),
        code: None,
        detail: format!("failed to start: {}", e),
    })?;

    let (tx, rx) = mpsc::channel::<String>();
    if let Some(stdout) = child.stdout.take() {
        thread::spawn(move || {
            read_segments(stdout, |segment| tx.send(segment).is_ok());
        });
    } else {
        drop(tx);
    }

    let stderr_reader = child.stderr.take().map(|mut stderr| {
        thread::spawn(move || {
            let mut text = String::new();
            let mut bytes = Vec::new();
            if stderr.read_to_end(&mut bytes).is_ok() {
                text = String::from_utf8_lossy(&bytes).into_owned();
            }
            text
        })
    });

    let mut last_output = Instant::now();
    loop {
        if stop.is_stopped() {
            kill(&mut child, tool);
            return Err(BuildError::CancelledByUser);
        }

        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(line) => {
                last_output = Instant::now();
                on_line(&line);
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Some(limit) = idle_timeout {
                    if last_output.elapsed() >= limit {
                        kill(&mut child, tool);
                        return Err(BuildError::SubprocessFailure {
                            tool: tool.to_string(),
                            code: None,
                            detail: format!("no output for {}s, terminated", limit.as_secs()),
                        });
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let status = child.wait().map_err(|e| BuildError::SubprocessFailure {
        tool: tool.to_string(),
        code: None,
        detail: format!("failed to wait for process: {}", e),
    })?;

    if status.success() {
        return Ok(());
    }

    let stderr = stderr_reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    let detail = match stderr.trim() {
        "" => "no error output".to_string(),
        text => text.to_string(),
    };
    Err(BuildError::SubprocessFailure {
        tool: tool.to_string(),
        code: status.code(),
        detail,
    })
}

fn kill(child: &mut Child, tool: &str) {
    warn!("Terminating {}", tool);
    if let Err(e) = child.kill() {
        debug!("kill({}) failed: {}", tool, e);
    }
    let _ = child.wait();
}

/// Read a stream and hand every non-empty segment (split on \n, \r and
/// backspace) to `emit`. Stops early if `emit` returns false.
pub fn read_segments(mut reader: impl Read, mut emit: impl FnMut(String) -> bool) {
    let mut buf = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();

    let mut flush = |pending: &mut Vec<u8>| -> bool {
        if pending.is_empty() {
            return true;
        }
        let text = String::from_utf8_lossy(pending).into_owned();
        pending.clear();
        if text.trim().is_empty() {
            true
        } else {
            emit(text)
        }
    };

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        };
        for &byte in &buf[..n] {
            if matches!(byte, b'\n' | b'\r' | 0x08) {
                if !flush(&mut pending) {
                    return;
                }
            } else {
                pending.push(byte);
            }
        }
    }
    flush(&mut pending);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segments_split_on_cr_lf_and_backspace() {
        let input: &[u8] = b"Extracting\r\n  5%\x08\x08\x08\x08 42%\rdone\n\n";
        let mut seen = Vec::new();
        read_segments(input, |s| {
            seen.push(s);
            true
        });
        assert_eq!(seen, vec!["Extracting", "  5%", " 42%", "done"]);
    }

    #[test]
    fn test_ps_quote_escapes_single_quotes() {
        assert_eq!(ps_quote(r"C:\it's\kali.iso"), r"'C:\it''s\kali.iso'");
    }

    #[cfg(unix)]
    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[cfg(unix)]
    #[test]
    fn test_streams_lines_and_reports_success() {
        let mut lines = Vec::new();
        let result = run_monitored(
            "sh",
            sh("echo one; echo '50% complete'; echo two"),
            &StopFlag::new(),
            None,
            |l| lines.push(l.to_string()),
        );
        assert!(result.is_ok());
        assert_eq!(lines, vec!["one", "50% complete", "two"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_nonzero_exit_carries_code_and_stderr() {
        let err = run_monitored("sh", sh("echo bad >&2; exit 137"), &StopFlag::new(), None, |_| {})
            .unwrap_err();
        match err {
            BuildError::SubprocessFailure { code, detail, .. } => {
                assert_eq!(code, Some(137));
                assert_eq!(detail, "bad");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_stop_kills_a_silent_tool() {
        let stop = StopFlag::new();
        let trigger = stop.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.request_stop();
        });

        let started = Instant::now();
        let err = run_monitored("sh", sh("sleep 30"), &stop, None, |_| {}).unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn test_stop_between_lines() {
        let stop = StopFlag::new();
        let mut seen = 0;
        let err = run_monitored(
            "sh",
            sh("echo a; sleep 1; echo b; sleep 1; echo c"),
            &stop,
            None,
            |_| {
                seen += 1;
                stop.request_stop();
            },
        )
        .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(seen, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_idle_timeout() {
        let err = run_monitored(
            "sh",
            sh("sleep 30"),
            &StopFlag::new(),
            Some(Duration::from_millis(300)),
            |_| {},
        )
        .unwrap_err();
        assert!(matches!(err, BuildError::SubprocessFailure { code: None, .. }));
    }

    #[test]
    fn test_missing_binary_is_a_subprocess_failure() {
        let cmd = Command::new("definitely-not-a-real-tool-rtabuilder");
        let err = run_monitored("ghost", cmd, &StopFlag::new(), None, |_| {}).unwrap_err();
        assert!(matches!(err, BuildError::SubprocessFailure { code: None, .. }));
    }
}
