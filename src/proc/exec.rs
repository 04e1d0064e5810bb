//! Child process spawning.
//!
//! Children are placed in their own process group so the whole group can be
//! signalled on stop. Console services instead get a fresh session with
//! /dev/console as the controlling terminal. Exec-setup failures carry a
//! stage tag identifying which step failed.

use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::{Child, Command};

/// The stage at which child setup failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStage {
    ArrangeFds,
    ReadEnvFile,
    Chdir,
    SetupStdio,
    SetRlimits,
    SetUidGid,
    OpenLogFile,
    DoExec,
}

impl fmt::Display for ExecStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecStage::ArrangeFds => "arranging file descriptors",
            ExecStage::ReadEnvFile => "reading environment file",
            ExecStage::Chdir => "changing directory",
            ExecStage::SetupStdio => "setting up standard input/output",
            ExecStage::SetRlimits => "setting resource limits",
            ExecStage::SetUidGid => "setting user/group ID",
            ExecStage::OpenLogFile => "opening log file",
            ExecStage::DoExec => "executing command",
        };
        f.write_str(s)
    }
}

/// A failure during child process setup or exec.
#[derive(Error, Debug)]
#[error("failed while {stage}: {source}")]
pub struct ExecError {
    pub stage: ExecStage,
    #[source]
    pub source: io::Error,
}

/// Where the child's stdout/stderr should go.
#[derive(Debug, Default)]
pub enum OutputMode {
    /// Discard output.
    #[default]
    Discard,
    /// Capture stdout and stderr through pipes (for the log buffer).
    Piped,
    /// Append output to a file.
    File(PathBuf),
    /// Run on /dev/console with a fresh session.
    Console,
}

/// Parameters for starting a child process.
#[derive(Debug, Default)]
pub struct ExecParams {
    /// Program and arguments.
    pub command: Vec<String>,
    /// Working directory.
    pub working_dir: Option<PathBuf>,
    /// Environment file with KEY=VALUE lines, applied on top of our own env.
    pub env_file: Option<PathBuf>,
    /// Credentials to run as (uid, gid); `None` keeps ours.
    pub run_as: Option<(u32, u32)>,
    /// Output destination.
    pub output: OutputMode,
}

/// A freshly spawned child: its PID plus the handle the monitor task owns.
#[derive(Debug)]
pub struct SpawnedChild {
    pub pid: i32,
    pub child: Child,
}

/// Spawns a child process according to `params`.
///
/// On success the child is running in its own process group (or session,
/// for console services) and the returned [`Child`] must be waited on by a
/// monitor task. Pipes are open on the child handle when
/// [`OutputMode::Piped`] was requested.
pub fn spawn_child(params: &ExecParams) -> Result<SpawnedChild, ExecError> {
    let program = params.command.first().ok_or_else(|| ExecError {
        stage: ExecStage::DoExec,
        source: io::Error::new(io::ErrorKind::InvalidInput, "empty command"),
    })?;

    let mut cmd = Command::new(program);
    cmd.args(&params.command[1..]);
    cmd.stdin(Stdio::null());
    cmd.kill_on_drop(false);

    if let Some(dir) = &params.working_dir {
        cmd.current_dir(dir);
    }

    if let Some(path) = &params.env_file {
        for (key, value) in read_env_file(path)? {
            cmd.env(key, value);
        }
    }

    if let Some((uid, gid)) = params.run_as {
        cmd.uid(uid);
        cmd.gid(gid);
    }

    let console = matches!(params.output, OutputMode::Console);
    match &params.output {
        OutputMode::Discard => {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }
        OutputMode::Piped => {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        }
        OutputMode::File(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| ExecError {
                    stage: ExecStage::OpenLogFile,
                    source: e,
                })?;
            let err_file = file.try_clone().map_err(|e| ExecError {
                stage: ExecStage::OpenLogFile,
                source: e,
            })?;
            cmd.stdout(Stdio::from(file));
            cmd.stderr(Stdio::from(err_file));
        }
        OutputMode::Console => {
            // The pre_exec hook below redirects fds 0-2 to /dev/console;
            // inherit ours as the fallback if the open fails in the child.
            cmd.stdin(Stdio::inherit());
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
        }
    }

    // Everything in pre_exec runs post-fork and must be async-signal-safe,
    // hence raw libc.
    unsafe {
        cmd.pre_exec(move || {
            if console {
                // New session with /dev/console as the controlling terminal.
                if libc::setsid() < 0 {
                    return Err(io::Error::last_os_error());
                }
                let path = b"/dev/console\0";
                let fd = libc::open(path.as_ptr() as *const libc::c_char, libc::O_RDWR);
                if fd >= 0 {
                    libc::dup2(fd, 0);
                    libc::dup2(fd, 1);
                    libc::dup2(fd, 2);
                    if fd > 2 {
                        libc::close(fd);
                    }
                    libc::ioctl(0, libc::TIOCSCTTY as libc::c_ulong, 0);
                }
            } else if libc::setpgid(0, 0) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|e| ExecError {
        stage: ExecStage::DoExec,
        source: e,
    })?;

    let pid = child.id().map(|p| p as i32).unwrap_or(0);
    Ok(SpawnedChild { pid, child })
}

/// Reads an environment file: KEY=VALUE lines, `#` comments, blanks ignored.
fn read_env_file(path: &Path) -> Result<Vec<(String, String)>, ExecError> {
    let content = std::fs::read_to_string(path).map_err(|e| ExecError {
        stage: ExecStage::ReadEnvFile,
        source: e,
    })?;

    let mut vars = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match trimmed.split_once('=') {
            Some((key, value)) => vars.push((key.trim().to_string(), value.trim().to_string())),
            None => {
                return Err(ExecError {
                    stage: ExecStage::ReadEnvFile,
                    source: io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("malformed line: {trimmed}"),
                    ),
                })
            }
        }
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn spawn_and_wait() {
        let params = ExecParams {
            command: vec!["true".into()],
            ..Default::default()
        };
        let mut spawned = spawn_child(&params).unwrap();
        assert!(spawned.pid > 0);
        let status = spawned.child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn spawn_missing_binary_fails_at_exec() {
        let params = ExecParams {
            command: vec!["/nonexistent/binary-xyz".into()],
            ..Default::default()
        };
        let err = spawn_child(&params).unwrap_err();
        assert_eq!(err.stage, ExecStage::DoExec);
    }

    #[test]
    fn empty_command_rejected() {
        let err = spawn_child(&ExecParams::default()).unwrap_err();
        assert_eq!(err.stage, ExecStage::DoExec);
    }

    #[tokio::test]
    async fn piped_output_is_captured() {
        let params = ExecParams {
            command: vec!["sh".into(), "-c".into(), "echo hello".into()],
            output: OutputMode::Piped,
            ..Default::default()
        };
        let mut spawned = spawn_child(&params).unwrap();
        let mut out = spawned.child.stdout.take().unwrap();
        let mut data = Vec::new();
        use tokio::io::AsyncReadExt;
        out.read_to_end(&mut data).await.unwrap();
        spawned.child.wait().await.unwrap();
        assert_eq!(data, b"hello\n");
    }

    #[test]
    fn env_file_parsing() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file, "FOO=bar").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "BAZ = qux ").unwrap();
        let vars = read_env_file(file.path()).unwrap();
        assert_eq!(
            vars,
            vec![
                ("FOO".to_string(), "bar".to_string()),
                ("BAZ".to_string(), "qux".to_string())
            ]
        );
    }

    #[test]
    fn env_file_malformed_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "NOT A VALID LINE").unwrap();
        let err = read_env_file(file.path()).unwrap_err();
        assert_eq!(err.stage, ExecStage::ReadEnvFile);
    }

    #[test]
    fn missing_env_file() {
        let err = read_env_file(Path::new("/nonexistent/env-file")).unwrap_err();
        assert_eq!(err.stage, ExecStage::ReadEnvFile);
    }
}
