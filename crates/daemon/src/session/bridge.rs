//! Session bridge between one WebSocket connection and one shell.
//!
//! The bridge owns exactly one [`PtyProcess`] for the lifetime of the
//! connection. Two tasks pump data:
//!
//! ```text
//!   WebSocket stream ──► input task ──► writer thread ──► PTY
//!   WebSocket sink   ◄── output task ◄── reader thread ◄── PTY
//! ```
//!
//! Whichever task finishes first (peer closed, shell exited, server shutting
//! down) triggers a single teardown that stops the other task, reaps the
//! process, closes the connection and removes the registry entry.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use nexus_protocol::{ClientMessage, FrameCodec, OutputDecoder, ServerMessage, TerminalSize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use super::launch::ShellLaunchPolicy;
use super::pty::{PtyChannels, PtyProcess, SessionError, UNKNOWN_EXIT_CODE};
use super::registry::{new_session_id, SessionHandle, SessionId, SessionRegistry};
use super::state::SessionState;
use crate::config::Config;

type WsSink<S> = SplitSink<WebSocketStream<S>, Message>;
type WsSource<S> = SplitStream<WebSocketStream<S>>;

/// Per-session tunables.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// PTY size at spawn time.
    pub initial_size: TerminalSize,
    /// Capacity of the output and input channels.
    pub channel_capacity: usize,
    /// How long to keep forwarding output after the shell exits.
    pub exit_drain: Duration,
    /// Bound on each teardown wait.
    pub teardown_timeout: Duration,
    /// Largest inbound frame accepted.
    pub max_message_size: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl BridgeSettings {
    /// Builds settings from the daemon configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            initial_size: config.session.initial_size(),
            channel_capacity: config.session.output_channel_capacity,
            exit_drain: config.session.exit_drain(),
            teardown_timeout: config.session.teardown_timeout(),
            max_message_size: config.server.max_message_size,
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The shell could not be started or registered.
    SpawnFailed,
    /// The shell exited with this code.
    Exited(i32),
    /// The peer closed the connection or it failed.
    PeerClosed,
    /// The server is shutting down.
    Shutdown,
}

impl std::fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SpawnFailed => write!(f, "spawn failed"),
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::PeerClosed => write!(f, "peer closed"),
            Self::Shutdown => write!(f, "server shutdown"),
        }
    }
}

/// Summary returned once a session is fully closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub id: SessionId,
    /// Shell process id, if one was spawned.
    pub pid: Option<u32>,
    /// Lifecycle state the session ended in.
    pub state: SessionState,
    pub outcome: SessionOutcome,
}

/// Why the output task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputEnd {
    Exited(i32),
    SendFailed,
    Cancelled,
}

/// Why the input task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputEnd {
    PeerClosed,
    Cancelled,
}

/// What the output task hands back for teardown.
struct OutputTask<S> {
    sink: WsSink<S>,
    output: mpsc::Receiver<Vec<u8>>,
    end: OutputEnd,
}

/// Bridges one WebSocket connection to one freshly spawned shell.
pub struct SessionBridge {
    policy: Arc<ShellLaunchPolicy>,
    registry: Arc<SessionRegistry>,
    settings: BridgeSettings,
    codec: FrameCodec,
    cancel: CancellationToken,
    next_id: fn() -> SessionId,
}

impl SessionBridge {
    /// Creates a bridge whose session is cancelled along with `shutdown`.
    pub fn new(
        policy: Arc<ShellLaunchPolicy>,
        registry: Arc<SessionRegistry>,
        settings: BridgeSettings,
        shutdown: &CancellationToken,
    ) -> Self {
        let codec = FrameCodec::with_max_frame_size(settings.max_message_size);
        Self {
            policy,
            registry,
            settings,
            codec,
            cancel: shutdown.child_token(),
            next_id: new_session_id,
        }
    }

    /// Runs the session to completion.
    ///
    /// Returns only after the process is reaped, the connection is closed and
    /// the registry entry is gone.
    pub async fn run<S>(self, ws: WebSocketStream<S>) -> SessionReport
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = (self.next_id)();
        let (mut sink, stream) = ws.split();
        let shell = self.policy.shell().to_string();
        let handle = Arc::new(SessionHandle::new(
            id.clone(),
            None,
            &shell,
            self.settings.initial_size,
        ));

        tracing::info!(
            session_id = %id,
            shell = %shell,
            cwd = %self.policy.workspace().path().display(),
            "Starting session"
        );

        let (pty, channels) = match self.start(&handle).await {
            Ok(started) => started,
            Err(e) => {
                tracing::error!(session_id = %id, error = %e, "Failed to start session");
                if let Err(e) = handle.transition(SessionState::Closing) {
                    tracing::error!(session_id = %id, error = %e, "Unexpected session state");
                }
                self.reject(&mut sink, &id, &e).await;
                if let Err(e) = handle.transition(SessionState::Closed) {
                    tracing::error!(session_id = %id, error = %e, "Unexpected session state");
                }
                return SessionReport {
                    id,
                    pid: handle.pid(),
                    state: handle.state(),
                    outcome: SessionOutcome::SpawnFailed,
                };
            }
        };
        let pty = Arc::new(pty);

        if let Err(e) = handle.transition(SessionState::Active) {
            tracing::error!(session_id = %id, error = %e, "Unexpected session state");
        }

        let PtyChannels {
            output,
            input,
            exit,
            writer_done,
        } = channels;

        let greeting = ServerMessage::output(format!("Connected to {shell}\r\n"));
        if let Err(e) = send_frame(&mut sink, &greeting).await {
            // The input task will notice the dead connection right away
            tracing::debug!(session_id = %id, error = %e, "Failed to send greeting");
        }

        let output_task = tokio::spawn(pump_output(
            sink,
            output,
            exit.clone(),
            self.settings.exit_drain,
            self.cancel.clone(),
            id.clone(),
        ));
        let input_task = tokio::spawn(pump_input(
            stream,
            input,
            Arc::clone(&pty),
            Arc::clone(&handle),
            self.codec,
            self.cancel.clone(),
            id.clone(),
        ));

        let outcome = self
            .teardown(&id, &pty, &handle, exit, writer_done, output_task, input_task)
            .await;

        tracing::info!(session_id = %id, outcome = %outcome, "Session closed");
        SessionReport {
            id,
            pid: handle.pid(),
            state: handle.state(),
            outcome,
        }
    }

    /// Spawns the shell and registers the session.
    ///
    /// On failure nothing is left running and nothing is registered.
    async fn start(
        &self,
        handle: &Arc<SessionHandle>,
    ) -> Result<(PtyProcess, PtyChannels), SessionError> {
        let launch = self.policy.resolve()?;
        let (pty, mut channels) = PtyProcess::spawn(
            &launch,
            self.settings.initial_size,
            handle.id(),
            self.settings.channel_capacity,
        )?;
        if let Some(pid) = pty.pid() {
            handle.set_pid(pid);
        }

        if let Err(e) = self.registry.register(Arc::clone(handle)) {
            let _ = pty.force_kill();
            if timeout(self.settings.teardown_timeout, exit_code(&mut channels.exit))
                .await
                .is_err()
            {
                tracing::warn!(session_id = %handle.id(), "Shell not reaped after failed registration");
            }
            return Err(e.into());
        }

        Ok((pty, channels))
    }

    /// Sends the single error frame for a session that never started.
    async fn reject<S>(&self, sink: &mut WsSink<S>, id: &SessionId, error: &SessionError)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let message = ServerMessage::error(format!("Failed to start shell: {error}"));
        if let Err(e) = send_frame(sink, &message).await {
            tracing::debug!(session_id = %id, error = %e, "Could not deliver error frame");
        }
        let _ = timeout(self.settings.teardown_timeout, sink.close()).await;
    }

    /// Waits for either direction to stop, then stops the other, reaps the
    /// shell and releases the session.
    #[allow(clippy::too_many_arguments)]
    async fn teardown<S>(
        &self,
        id: &SessionId,
        pty: &PtyProcess,
        handle: &SessionHandle,
        mut exit: watch::Receiver<Option<i32>>,
        writer_done: tokio::sync::oneshot::Receiver<()>,
        mut output_task: JoinHandle<OutputTask<S>>,
        mut input_task: JoinHandle<InputEnd>,
    ) -> SessionOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let limit = self.settings.teardown_timeout;

        // Wait for the first direction to stop
        let (first_output, first_input) = tokio::select! {
            result = &mut output_task => (Some(result), None),
            result = &mut input_task => (None, Some(result)),
        };

        if let Err(e) = handle.transition(SessionState::Closing) {
            tracing::error!(session_id = %id, error = %e, "Unexpected session state");
        }
        self.cancel.cancel();

        let output_result = match first_output {
            Some(result) => result,
            None => join_bounded(id, "output", output_task, limit).await,
        };
        let input_result = match first_input {
            Some(result) => result,
            None => join_bounded(id, "input", input_task, limit).await,
        };

        let (sink, output_rx, output_end) = match output_result {
            Ok(task) => (Some(task.sink), Some(task.output), Some(task.end)),
            Err(e) => {
                tracing::error!(session_id = %id, error = %e, "Output task failed");
                (None, None, None)
            }
        };
        let input_end = input_result.ok();

        let outcome = match (output_end, input_end) {
            (Some(OutputEnd::Exited(code)), _) => SessionOutcome::Exited(code),
            (Some(OutputEnd::Cancelled), Some(InputEnd::Cancelled)) => SessionOutcome::Shutdown,
            _ => SessionOutcome::PeerClosed,
        };

        // Process: hang up the whole session, then kill if anything lingers.
        // Background jobs outlive a shell that exited on its own.
        let shell_running = exit.borrow().is_none();
        if shell_running {
            if let Err(e) = pty.terminate() {
                tracing::warn!(session_id = %id, error = %e, "Failed to terminate shell");
            }
        } else {
            pty.hangup();
        }
        match timeout(limit, exit_code(&mut exit)).await {
            Ok(code) => tracing::debug!(session_id = %id, exit_code = code, "Shell stopped"),
            Err(_) => {
                tracing::warn!(session_id = %id, "Shell ignored hangup, killing");
                if let Err(e) = pty.force_kill() {
                    tracing::error!(session_id = %id, error = %e, "Failed to kill shell");
                }
                if timeout(limit, exit_code(&mut exit)).await.is_err() {
                    tracing::error!(session_id = %id, pid = ?pty.pid(), "Shell could not be reaped");
                }
            }
        }

        // Reader: runs until every holder of the terminal is gone
        if let Some(mut output_rx) = output_rx {
            if timeout(limit, drain(&mut output_rx)).await.is_err() {
                tracing::warn!(session_id = %id, "Session processes ignored hangup, killing");
                if let Err(e) = pty.force_kill() {
                    tracing::error!(session_id = %id, error = %e, "Failed to kill session");
                }
                if timeout(limit, drain(&mut output_rx)).await.is_err() {
                    tracing::error!(session_id = %id, "PTY reader did not stop in time");
                }
            }
        }

        // Writer: the input sender was dropped with the input task
        if timeout(limit, writer_done).await.is_err() {
            tracing::warn!(session_id = %id, "PTY writer did not stop in time");
        }

        if let Some(mut sink) = sink {
            if let Ok(Err(e)) = timeout(limit, sink.close()).await {
                tracing::debug!(session_id = %id, error = %e, "Close handshake failed");
            }
        }

        self.registry.unregister(id);
        if let Err(e) = handle.transition(SessionState::Closed) {
            tracing::error!(session_id = %id, error = %e, "Unexpected session state");
        }

        outcome
    }
}

/// Discards output until the reader thread stops.
async fn drain(output: &mut mpsc::Receiver<Vec<u8>>) {
    while output.recv().await.is_some() {}
}

/// Awaits a task, aborting it if it does not finish in time.
async fn join_bounded<T>(
    id: &SessionId,
    name: &str,
    mut task: JoinHandle<T>,
    limit: Duration,
) -> Result<T, tokio::task::JoinError> {
    match timeout(limit, &mut task).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(session_id = %id, task = name, "Task did not stop in time, aborting");
            task.abort();
            task.await
        }
    }
}

/// Forwards PTY output to the peer until the shell exits or the session is
/// cancelled.
async fn pump_output<S>(
    mut sink: WsSink<S>,
    mut output: mpsc::Receiver<Vec<u8>>,
    mut exit: watch::Receiver<Option<i32>>,
    drain: Duration,
    cancel: CancellationToken,
    id: SessionId,
) -> OutputTask<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut decoder = OutputDecoder::new();

    let end = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break OutputEnd::Cancelled,
            chunk = output.recv() => match chunk {
                Some(bytes) => {
                    if let Err(e) = send_output(&mut sink, &mut decoder, &bytes).await {
                        tracing::debug!(session_id = %id, error = %e, "Failed to send output");
                        break OutputEnd::SendFailed;
                    }
                }
                None => {
                    // Reader hit EOF; the exit status follows shortly
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break OutputEnd::Cancelled,
                        code = exit_code(&mut exit) => {
                            break finish(&mut sink, &mut output, &mut decoder, code, Duration::ZERO, &id).await;
                        }
                    }
                }
            },
            code = exit_code(&mut exit) => {
                break finish(&mut sink, &mut output, &mut decoder, code, drain, &id).await;
            }
        }
    };

    OutputTask { sink, output, end }
}

/// Flushes trailing output and sends the single exit frame.
async fn finish<S>(
    sink: &mut WsSink<S>,
    output: &mut mpsc::Receiver<Vec<u8>>,
    decoder: &mut OutputDecoder,
    code: i32,
    drain: Duration,
    id: &SessionId,
) -> OutputEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = Instant::now() + drain;
    loop {
        match tokio::time::timeout_at(deadline, output.recv()).await {
            Ok(Some(bytes)) => {
                if send_output(sink, decoder, &bytes).await.is_err() {
                    return OutputEnd::SendFailed;
                }
            }
            Ok(None) | Err(_) => break,
        }
    }

    if decoder.pending_len() > 0 {
        tracing::debug!(
            session_id = %id,
            bytes = decoder.pending_len(),
            "Flushing incomplete UTF-8 sequence"
        );
    }
    let rest = decoder.finish();
    if !rest.is_empty() && send_frame(sink, &ServerMessage::output(rest)).await.is_err() {
        return OutputEnd::SendFailed;
    }

    tracing::info!(session_id = %id, exit_code = code, "Shell exited");
    if let Err(e) = send_frame(sink, &ServerMessage::exit(code)).await {
        tracing::debug!(session_id = %id, error = %e, "Failed to send exit frame");
        return OutputEnd::SendFailed;
    }
    OutputEnd::Exited(code)
}

/// Reads client frames and applies them to the PTY until the peer goes away
/// or the session is cancelled.
async fn pump_input<S>(
    mut stream: WsSource<S>,
    input: mpsc::Sender<Vec<u8>>,
    pty: Arc<PtyProcess>,
    handle: Arc<SessionHandle>,
    codec: FrameCodec,
    cancel: CancellationToken,
    id: SessionId,
) -> InputEnd
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => return InputEnd::Cancelled,
            message = stream.next() => message,
        };

        let decoded = match message {
            Some(Ok(Message::Text(text))) => codec.decode_client(&text),
            Some(Ok(Message::Binary(bytes))) => codec.decode_client_bytes(&bytes),
            Some(Ok(Message::Close(frame))) => {
                tracing::debug!(session_id = %id, frame = ?frame, "Peer closed connection");
                return InputEnd::PeerClosed;
            }
            // Ping/pong are answered by the transport
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!(session_id = %id, error = %e, "Connection error");
                return InputEnd::PeerClosed;
            }
            None => {
                tracing::debug!(session_id = %id, "Connection ended");
                return InputEnd::PeerClosed;
            }
        };

        match decoded {
            Ok(Some(ClientMessage::Input { data })) => {
                tracing::trace!(session_id = %id, bytes = data.len(), "Input");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return InputEnd::Cancelled,
                    sent = input.send(data.into_bytes()) => {
                        if sent.is_err() {
                            tracing::debug!(session_id = %id, "PTY writer stopped, dropping input");
                        }
                    }
                }
            }
            Ok(Some(ClientMessage::Resize(size))) => match pty.resize(size) {
                // Record what the terminal actually took
                Ok(()) => handle.set_size(pty.size().unwrap_or(size)),
                Err(e) => {
                    tracing::warn!(session_id = %id, error = %e, "Failed to resize PTY");
                }
            },
            Ok(None) => {
                tracing::trace!(session_id = %id, "Ignoring frame of unknown type");
            }
            Err(e) => {
                tracing::debug!(session_id = %id, error = %e, "Dropping malformed frame");
            }
        }
    }
}

async fn send_output<S>(
    sink: &mut WsSink<S>,
    decoder: &mut OutputDecoder,
    bytes: &[u8],
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let text = decoder.push(bytes);
    if text.is_empty() {
        return Ok(());
    }
    send_frame(sink, &ServerMessage::output(text)).await
}

async fn send_frame<S>(sink: &mut WsSink<S>, message: &ServerMessage) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Outbound frames are bounded by the PTY read size, not the inbound limit
    let text = FrameCodec::new()
        .encode(message)
        .map_err(|e| SessionError::Connection(e.to_string()))?;
    sink.send(Message::Text(text))
        .await
        .map_err(|e| SessionError::Connection(e.to_string()))
}

/// Waits for the reaped exit code.
async fn exit_code(exit: &mut watch::Receiver<Option<i32>>) -> i32 {
    if let Ok(code) = exit.wait_for(Option::is_some).await {
        return (*code).unwrap_or(UNKNOWN_EXIT_CODE);
    }
    // Waiter thread is gone; use whatever it left behind
    let code = *exit.borrow();
    code.unwrap_or(UNKNOWN_EXIT_CODE)
}
