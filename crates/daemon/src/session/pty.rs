//! PTY process management.
//!
//! A [`PtyProcess`] owns one shell running on a pseudo-terminal. Blocking PTY
//! I/O runs on dedicated threads that talk to async code through channels:
//!
//! - reader thread: PTY master -> bounded output channel, ends on EOF
//! - writer thread: input channel -> PTY master, ends when the channel closes
//! - waiter thread: reaps the child and publishes its exit code
//!
//! The bridge only ever sees the channel ends in [`PtyChannels`].

use std::io::{Read, Write};
use std::sync::{Mutex, PoisonError};
use std::thread;

use nexus_protocol::TerminalSize;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use super::launch::ShellLaunch;
use crate::files::SandboxError;
use super::registry::{InvalidTransition, RegistryError, SessionId};

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Failed to spawn the PTY.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to kill the session.
    #[error("failed to kill session: {0}")]
    KillFailed(String),

    /// The WebSocket connection failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// Registration failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The workspace refused the working directory.
    #[error(transparent)]
    Workspace(#[from] SandboxError),

    /// Illegal lifecycle transition.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Exit code reported when the child could not be waited on.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// Async ends of the PTY I/O threads.
pub struct PtyChannels {
    /// Raw output chunks in the order the PTY produced them. Closes when the
    /// reader thread stops.
    pub output: mpsc::Receiver<Vec<u8>>,

    /// Bytes to write to the PTY, in order. Dropping every sender stops the
    /// writer thread.
    pub input: mpsc::Sender<Vec<u8>>,

    /// `Some(code)` once the child has been reaped.
    pub exit: watch::Receiver<Option<i32>>,

    /// Completes when the writer thread has stopped.
    pub writer_done: oneshot::Receiver<()>,
}

/// A shell process attached to a pseudo-terminal.
pub struct PtyProcess {
    /// Owning session, for logging.
    id: SessionId,

    /// The PTY master handle.
    master: Mutex<Box<dyn MasterPty + Send>>,

    /// Signals the child without needing the `Child` (owned by the waiter).
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,

    /// Process ID.
    pid: Option<u32>,
}

impl PtyProcess {
    /// Spawns the shell described by `launch` on a new PTY of the given size.
    ///
    /// On success the child is running and all three I/O threads have been
    /// started. On failure nothing is left running.
    pub fn spawn(
        launch: &ShellLaunch,
        size: TerminalSize,
        id: &SessionId,
        channel_capacity: usize,
    ) -> Result<(Self, PtyChannels), SessionError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(pty_size(size))
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&launch.program);
        cmd.cwd(&launch.cwd);
        cmd.env("TERM", launch.term);

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(format!("{}: {e}", launch.program)))?;

        // Only the child may hold the slave, otherwise the reader never sees EOF
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let master = pair.master;

        let io = Self::start_io(master.as_ref(), id, channel_capacity);
        let (output, input, writer_done) = match io {
            Ok(io) => io,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        let exit = match Self::start_waiter(child, id) {
            Ok(exit) => exit,
            Err(e) => {
                let mut killer = killer;
                let _ = killer.kill();
                return Err(e);
            }
        };

        tracing::info!(
            session_id = %id,
            pid = ?pid,
            shell = %launch.program,
            cols = size.cols,
            rows = size.rows,
            "Spawned shell"
        );

        let process = Self {
            id: id.clone(),
            master: Mutex::new(master),
            killer: Mutex::new(killer),
            pid,
        };
        let channels = PtyChannels {
            output,
            input,
            exit,
            writer_done,
        };

        Ok((process, channels))
    }

    /// Starts the reader and writer threads.
    #[allow(clippy::type_complexity)]
    fn start_io(
        master: &(dyn MasterPty + Send),
        id: &SessionId,
        channel_capacity: usize,
    ) -> Result<
        (
            mpsc::Receiver<Vec<u8>>,
            mpsc::Sender<Vec<u8>>,
            oneshot::Receiver<()>,
        ),
        SessionError,
    > {
        let mut reader = master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let mut writer = master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(channel_capacity);
        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(channel_capacity);
        let (done_tx, done_rx) = oneshot::channel();

        let session_id = id.clone();
        thread::Builder::new()
            .name(format!("nexus-pty-reader-{}", short_id(id)))
            .spawn(move || {
                let mut buffer = [0u8; READ_BUFFER_SIZE];
                loop {
                    match reader.read(&mut buffer) {
                        Ok(0) => {
                            tracing::debug!(session_id = %session_id, "PTY EOF");
                            break;
                        }
                        Ok(n) => {
                            if output_tx.blocking_send(buffer[..n].to_vec()).is_err() {
                                tracing::debug!(session_id = %session_id, "Output receiver dropped");
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            // EIO is how Linux reports that the slave side closed
                            tracing::debug!(session_id = %session_id, error = %e, "PTY read ended");
                            break;
                        }
                    }
                }
            })?;

        let session_id = id.clone();
        thread::Builder::new()
            .name(format!("nexus-pty-writer-{}", short_id(id)))
            .spawn(move || {
                while let Some(data) = input_rx.blocking_recv() {
                    if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                        tracing::warn!(session_id = %session_id, error = %e, "Failed to write to PTY");
                        break;
                    }
                }
                drop(writer);
                let _ = done_tx.send(());
            })?;

        Ok((output_rx, input_tx, done_rx))
    }

    /// Starts the thread that reaps the child.
    fn start_waiter(
        mut child: Box<dyn Child + Send + Sync>,
        id: &SessionId,
    ) -> Result<watch::Receiver<Option<i32>>, SessionError> {
        let (exit_tx, exit_rx) = watch::channel(None);

        let session_id = id.clone();
        thread::Builder::new()
            .name(format!("nexus-pty-waiter-{}", short_id(id)))
            .spawn(move || {
                let code = match child.wait() {
                    Ok(status) => status.exit_code() as i32,
                    Err(e) => {
                        tracing::error!(session_id = %session_id, error = %e, "Failed to wait for shell");
                        UNKNOWN_EXIT_CODE
                    }
                };
                tracing::debug!(session_id = %session_id, exit_code = code, "Shell reaped");
                let _ = exit_tx.send(Some(code));
            })?;

        Ok(exit_rx)
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Resizes the PTY to the given dimensions.
    pub fn resize(&self, size: TerminalSize) -> Result<(), SessionError> {
        let master = self.master.lock().unwrap_or_else(PoisonError::into_inner);
        master
            .resize(pty_size(size))
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;

        tracing::debug!(
            session_id = %self.id,
            cols = size.cols,
            rows = size.rows,
            "Resized PTY"
        );

        Ok(())
    }

    /// Returns the window size as reported by the PTY itself.
    pub fn size(&self) -> Result<TerminalSize, SessionError> {
        let master = self.master.lock().unwrap_or_else(PoisonError::into_inner);
        let size = master
            .get_size()
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
        Ok(TerminalSize {
            cols: size.cols,
            rows: size.rows,
        })
    }

    /// Hangs up the shell's whole session, then kills the shell through the
    /// PTY layer. A process that is already gone is not an error.
    ///
    /// Only call this while the shell has not been reaped.
    pub fn terminate(&self) -> Result<(), SessionError> {
        self.hangup();

        let mut killer = self.killer.lock().unwrap_or_else(PoisonError::into_inner);
        match killer.kill() {
            Ok(()) => Ok(()),
            Err(e) if is_already_gone(&e) => Ok(()),
            Err(e) => Err(SessionError::KillFailed(e.to_string())),
        }
    }

    /// Sends SIGHUP to every process group in the shell's session.
    ///
    /// Background jobs run in groups of their own and outlive the shell
    /// unless they are hung up too. Safe after the shell has been reaped.
    pub fn hangup(&self) {
        #[cfg(unix)]
        self.signal_session(nix::sys::signal::Signal::SIGHUP);
    }

    /// Kills every process in the shell's session outright.
    pub fn force_kill(&self) -> Result<(), SessionError> {
        #[cfg(unix)]
        {
            self.signal_session(nix::sys::signal::Signal::SIGKILL);
            Ok(())
        }

        #[cfg(not(unix))]
        {
            let mut killer = self.killer.lock().unwrap_or_else(PoisonError::into_inner);
            killer
                .kill()
                .map_err(|e| SessionError::KillFailed(e.to_string()))
        }
    }

    #[cfg(unix)]
    fn signal_session(&self, signal: nix::sys::signal::Signal) {
        use nix::errno::Errno;
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        // The shell leads its own session, so its pid is also the session id
        let Some(pid) = self.pid else {
            return;
        };
        for group in session_groups(pid) {
            match killpg(Pid::from_raw(group), signal) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => tracing::debug!(
                    session_id = %self.id,
                    pgid = group,
                    signal = ?signal,
                    error = %e,
                    "Failed to signal process group"
                ),
            }
        }
    }
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Process groups in the session led by `leader`.
///
/// On Linux only groups that still have members are returned, so a recycled
/// pid is never signalled. Elsewhere the leader's own group is all we know.
#[cfg(unix)]
fn session_groups(leader: u32) -> Vec<i32> {
    let leader = leader as i32;

    #[cfg(target_os = "linux")]
    if let Ok(entries) = std::fs::read_dir("/proc") {
        let mut groups = Vec::new();
        for entry in entries.flatten() {
            let is_pid = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.bytes().all(|b| b.is_ascii_digit()));
            if !is_pid {
                continue;
            }
            // Processes can vanish between listing and reading
            let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
                continue;
            };
            if let Some((pgrp, session)) = parse_stat_ids(&stat) {
                if session == leader && !groups.contains(&pgrp) {
                    groups.push(pgrp);
                }
            }
        }
        return groups;
    }

    vec![leader]
}

/// Extracts `(pgrp, session)` from a `/proc/<pid>/stat` line.
#[cfg(target_os = "linux")]
fn parse_stat_ids(stat: &str) -> Option<(i32, i32)> {
    // The command name is parenthesized and may itself contain spaces or ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace().skip(2);
    let pgrp = fields.next()?.parse().ok()?;
    let session = fields.next()?.parse().ok()?;
    Some((pgrp, session))
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn is_already_gone(e: &std::io::Error) -> bool {
    #[cfg(unix)]
    if e.raw_os_error() == Some(nix::errno::Errno::ESRCH as i32) {
        return true;
    }
    e.kind() == std::io::ErrorKind::NotFound
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn sh() -> ShellLaunch {
        ShellLaunch {
            program: "/bin/sh".to_string(),
            cwd: std::env::temp_dir(),
            term: "xterm-color",
        }
    }

    async fn read_until(channels: &mut PtyChannels, needle: &str) -> String {
        let mut collected = String::new();
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), channels.output.recv()).await {
                Ok(Some(data)) => {
                    collected.push_str(&String::from_utf8_lossy(&data));
                    if collected.contains(needle) {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => continue,
            }
        }
        collected
    }

    async fn wait_exit(channels: &mut PtyChannels) -> Option<i32> {
        let result = timeout(
            Duration::from_secs(5),
            channels.exit.wait_for(Option::is_some),
        )
        .await
        .ok()?
        .ok()?;
        *result
    }

    #[tokio::test]
    async fn test_spawn_and_echo() {
        let id = "test-spawn".to_string();
        let (process, mut channels) =
            PtyProcess::spawn(&sh(), TerminalSize::default(), &id, 64).unwrap();
        assert!(process.pid().is_some());

        channels
            .input
            .send(b"echo nexus-marker-$((40+2))\n".to_vec())
            .await
            .unwrap();

        let output = read_until(&mut channels, "nexus-marker-42").await;
        assert!(output.contains("nexus-marker-42"), "output was: {output:?}");

        let _ = process.terminate();
        assert!(wait_exit(&mut channels).await.is_some());
    }

    #[tokio::test]
    async fn test_spawn_sets_term_and_cwd() {
        let dir = tempfile::TempDir::new().unwrap();
        let cwd = std::fs::canonicalize(dir.path()).unwrap();
        let launch = ShellLaunch {
            cwd: cwd.clone(),
            ..sh()
        };
        let id = "test-env".to_string();
        let (process, mut channels) =
            PtyProcess::spawn(&launch, TerminalSize::default(), &id, 64).unwrap();

        channels
            .input
            .send(b"echo \"T=$TERM\"; pwd\n".to_vec())
            .await
            .unwrap();

        let output = read_until(&mut channels, &cwd.display().to_string()).await;
        assert!(output.contains("T=xterm-color"), "output was: {output:?}");
        assert!(output.contains(&cwd.display().to_string()));

        let _ = process.terminate();
        let _ = wait_exit(&mut channels).await;
    }

    #[tokio::test]
    async fn test_exit_code_reported() {
        let id = "test-exit".to_string();
        let (_process, mut channels) =
            PtyProcess::spawn(&sh(), TerminalSize::default(), &id, 64).unwrap();

        channels.input.send(b"exit 3\n".to_vec()).await.unwrap();
        assert_eq!(wait_exit(&mut channels).await, Some(3));

        // Reader stops once the child is gone
        let closed = timeout(Duration::from_secs(5), async {
            while channels.output.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok());
    }

    #[tokio::test]
    async fn test_resize() {
        let id = "test-resize".to_string();
        let (process, mut channels) =
            PtyProcess::spawn(&sh(), TerminalSize::default(), &id, 64).unwrap();
        assert_eq!(process.size().unwrap(), TerminalSize::default());

        let size = TerminalSize { cols: 120, rows: 40 };
        process.resize(size).unwrap();
        assert_eq!(process.size().unwrap(), size);

        let _ = process.terminate();
        let _ = wait_exit(&mut channels).await;
    }

    #[tokio::test]
    async fn test_terminate_and_force_kill() {
        let id = "test-kill".to_string();
        let (process, mut channels) =
            PtyProcess::spawn(&sh(), TerminalSize::default(), &id, 64).unwrap();

        process.terminate().unwrap();
        assert!(wait_exit(&mut channels).await.is_some());

        // Signalling a reaped session is harmless
        process.hangup();
        assert!(process.force_kill().is_ok());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_hangup_reaches_background_jobs() {
        let id = "test-jobs".to_string();
        let (process, mut channels) =
            PtyProcess::spawn(&sh(), TerminalSize::default(), &id, 64).unwrap();

        channels
            .input
            .send(b"sleep 4243 & echo job-$!\n".to_vec())
            .await
            .unwrap();
        let job = job_pid(&read_until_job(&mut channels).await).expect("job pid not printed");
        assert!(process_running(job));

        channels.input.send(b"exit 0\n".to_vec()).await.unwrap();
        assert_eq!(wait_exit(&mut channels).await, Some(0));

        process.hangup();

        let closed = timeout(Duration::from_secs(5), async {
            while channels.output.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok(), "reader still blocked after hangup");
        for _ in 0..50 {
            if !process_running(job) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!process_running(job));
    }

    #[cfg(target_os = "linux")]
    async fn read_until_job(channels: &mut PtyChannels) -> String {
        let mut collected = String::new();
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), channels.output.recv()).await {
                Ok(Some(data)) => {
                    collected.push_str(&String::from_utf8_lossy(&data));
                    if job_pid(&collected).is_some() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => continue,
            }
        }
        collected
    }

    /// Pid printed as `job-<pid>`; the echoed command line reads `job-$!`.
    #[cfg(target_os = "linux")]
    fn job_pid(output: &str) -> Option<i32> {
        output.match_indices("job-").find_map(|(at, marker)| {
            let digits: String = output[at + marker.len()..]
                .chars()
                .take_while(char::is_ascii_digit)
                .collect();
            digits.parse().ok()
        })
    }

    /// Whether `pid` exists and is not a zombie waiting for its reaper.
    #[cfg(target_os = "linux")]
    fn process_running(pid: i32) -> bool {
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            return false;
        };
        stat.rfind(')')
            .and_then(|at| stat[at + 1..].split_whitespace().next())
            .is_some_and(|state| state != "Z")
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_parse_stat_ids() {
        let stat = "4242 (sleep) S 4200 4242 4200 34817 4242 4194304 0 0";
        assert_eq!(parse_stat_ids(stat), Some((4242, 4200)));

        let odd = "77 (a) b (c) R 1 70 60 0 -1";
        assert_eq!(parse_stat_ids(odd), Some((70, 60)));

        assert_eq!(parse_stat_ids("garbage"), None);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_session_groups() {
        let id = "test-groups".to_string();
        let (process, mut channels) =
            PtyProcess::spawn(&sh(), TerminalSize::default(), &id, 64).unwrap();
        let pid = process.pid().unwrap();

        assert!(session_groups(pid).contains(&(pid as i32)));

        process.terminate().unwrap();
        assert!(wait_exit(&mut channels).await.is_some());
        // Nothing left to signal once the session is empty
        assert!(session_groups(pid).is_empty());
    }

    #[tokio::test]
    async fn test_writer_stops_when_input_dropped() {
        let id = "test-writer".to_string();
        let (process, channels) =
            PtyProcess::spawn(&sh(), TerminalSize::default(), &id, 64).unwrap();
        let PtyChannels {
            input,
            writer_done,
            mut exit,
            ..
        } = channels;

        drop(input);
        assert!(timeout(Duration::from_secs(5), writer_done).await.is_ok());

        let _ = process.terminate();
        let _ = timeout(Duration::from_secs(5), exit.wait_for(Option::is_some)).await;
    }

    #[test]
    fn test_spawn_nonexistent_shell() {
        let launch = ShellLaunch {
            program: "/nonexistent/shell".to_string(),
            ..sh()
        };
        let id = "test-missing".to_string();
        let result = PtyProcess::spawn(&launch, TerminalSize::default(), &id, 64);
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }
}
