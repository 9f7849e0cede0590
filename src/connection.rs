//! Robot connection session
//!
//! A [`Connection`] owns one TCP socket, its outbound write queue, its inbound
//! parse buffer and the protocol translator bound to it. It runs as a task on
//! the event loop; everything else talks to it through [`SessionCommand`]s and
//! observes it through the shared [`ConnectionShared`] state.

use crate::command::{CommandBatch, ConnectionId, ResultEvent};
use crate::telemetry::{now_seconds, TelemetrySnapshot};
use crate::translator::{Decoded, ProtocolTranslator};
use crate::DriverError;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

/// Inbound bytes kept without a complete frame before the buffer is discarded
const MAX_UNFRAMED_BYTES: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Live,
    Retiring,
    Closed,
    Faulted,
}

impl ConnectionState {
    /// Whether new command batches may be routed to a connection in this state
    pub fn is_routable(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Live)
    }

    fn can_enter(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (Retiring, Closed) => true,
            (Retiring, _) => false,
            (Faulted, Live) => false,
            (current, next) => current != next,
        }
    }
}

/// State readable from any thread, written by the session and the registry
#[derive(Debug)]
pub struct ConnectionShared {
    state: watch::Sender<ConnectionState>,
    telemetry: watch::Sender<Option<TelemetrySnapshot>>,
}

impl ConnectionShared {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (telemetry, _) = watch::channel(None);
        Self { state, telemetry }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Latest snapshot, if the connection is live and has decoded one
    pub fn latest_telemetry(&self) -> Option<TelemetrySnapshot> {
        self.telemetry.borrow().clone()
    }

    /// Apply a lifecycle transition. Illegal transitions are ignored and
    /// return `false`; leaving `Live` discards the last snapshot.
    pub(crate) fn set_state(&self, next: ConnectionState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if current.can_enter(next) {
                *current = next;
                true
            } else {
                false
            }
        });

        if changed && next != ConnectionState::Live {
            self.telemetry.send_replace(None);
        }
        changed
    }

    pub(crate) fn store_telemetry(&self, snapshot: TelemetrySnapshot) {
        if self.state() == ConnectionState::Live {
            self.telemetry.send_replace(Some(snapshot));
        }
    }
}

impl Default for ConnectionShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Messages delivered to a session on the event loop
#[derive(Debug)]
pub enum SessionCommand {
    Enqueue(CommandBatch),
    Reconnect,
    Close,
}

/// Why a socket-driving phase ended
enum SessionExit {
    Closed,
    Fault(DriverError),
}

enum ConnectOutcome {
    Connected(TcpStream),
    Failed(DriverError),
    Closed,
}

/// Frame being written, with how many bytes already went out
type PendingWrite = Option<(Vec<u8>, usize)>;

async fn write_pending(writer: &mut OwnedWriteHalf, pending: &PendingWrite) -> io::Result<usize> {
    match pending {
        Some((frame, offset)) => writer.write(&frame[*offset..]).await,
        None => std::future::pending().await,
    }
}

fn fault(reason: String) -> DriverError {
    DriverError::ConnectionFault(reason)
}

/// One robot controller session
pub struct Connection {
    id: ConnectionId,
    namespace: String,
    host: String,
    port: u16,
    joint_names: Vec<String>,
    translator: Box<dyn ProtocolTranslator>,
    shared: Arc<ConnectionShared>,
    results: broadcast::Sender<ResultEvent>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    outbound: VecDeque<Vec<u8>>,
    inbound: Vec<u8>,
}

/// Sending side of a session's command channel
pub type SessionSender = mpsc::UnboundedSender<SessionCommand>;

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ConnectionId,
        namespace: String,
        host: String,
        port: u16,
        joint_names: Vec<String>,
        translator: Box<dyn ProtocolTranslator>,
        shared: Arc<ConnectionShared>,
        results: broadcast::Sender<ResultEvent>,
    ) -> (Self, SessionSender) {
        let (sender, commands) = mpsc::unbounded_channel();
        let connection = Self {
            id,
            namespace,
            host,
            port,
            joint_names,
            translator,
            shared,
            results,
            commands,
            outbound: VecDeque::new(),
            inbound: Vec::new(),
        };
        (connection, sender)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Run the session until it is closed. Must be spawned on the event loop.
    pub async fn run(mut self) {
        info!(
            "Connection {} ({}) starting: {}:{} via {}",
            self.id,
            self.namespace,
            self.host,
            self.port,
            self.translator.name()
        );

        loop {
            self.shared.set_state(ConnectionState::Connecting);

            let exit = match self.connect().await {
                ConnectOutcome::Connected(stream) => {
                    if self.shared.set_state(ConnectionState::Live) {
                        info!("Connection {} live at {}:{}", self.id, self.host, self.port);
                        self.drive(stream).await
                    } else {
                        // Retired while dialing: deliver what was accepted, then close
                        self.accept_until_close();
                        let (_reader, mut writer) = stream.into_split();
                        self.drain(&mut writer, None).await;
                        SessionExit::Closed
                    }
                }
                ConnectOutcome::Failed(error) => SessionExit::Fault(error),
                ConnectOutcome::Closed => SessionExit::Closed,
            };

            match exit {
                SessionExit::Closed => break,
                SessionExit::Fault(error) => {
                    self.enter_fault(&error);
                    if !self.wait_for_reconnect().await {
                        break;
                    }
                    info!("Connection {} reconnecting", self.id);
                }
            }
        }

        self.shared.set_state(ConnectionState::Closed);
        info!("Connection {} closed", self.id);
    }

    /// Dial the controller while still accepting queued commands
    async fn connect(&mut self) -> ConnectOutcome {
        let dial = TcpStream::connect((self.host.clone(), self.port));
        tokio::pin!(dial);

        loop {
            tokio::select! {
                result = &mut dial => {
                    return match result {
                        Ok(stream) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!("Connection {}: set_nodelay failed: {}", self.id, e);
                            }
                            ConnectOutcome::Connected(stream)
                        }
                        Err(e) => ConnectOutcome::Failed(fault(format!(
                            "failed to connect to {}:{}: {}", self.host, self.port, e
                        ))),
                    };
                }
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Enqueue(batch)) => self.enqueue(batch),
                    Some(SessionCommand::Reconnect) => debug!("Connection {} already connecting", self.id),
                    Some(SessionCommand::Close) | None => return ConnectOutcome::Closed,
                },
            }
        }
    }

    /// Pump the socket until closed or faulted.
    ///
    /// Writes are one branch of the select, so a slow reader on the far end
    /// never stops inbound telemetry or session commands.
    async fn drive(&mut self, stream: TcpStream) -> SessionExit {
        let (mut reader, mut writer) = stream.into_split();
        let mut chunk = [0u8; READ_CHUNK];
        let mut pending: PendingWrite = None;

        loop {
            if pending.is_none() {
                pending = self.outbound.pop_front().map(|frame| (frame, 0));
            }
            let writing = pending.is_some();

            tokio::select! {
                written = write_pending(&mut writer, &pending), if writing => match written {
                    Ok(0) => return SessionExit::Fault(fault("write returned zero bytes".to_string())),
                    Ok(n) => {
                        if let Some((frame, offset)) = pending.as_mut() {
                            *offset += n;
                            if *offset >= frame.len() {
                                pending = None;
                            }
                        }
                    }
                    Err(e) => return SessionExit::Fault(fault(format!("write failed: {}", e))),
                },
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Enqueue(batch)) => self.enqueue(batch),
                    Some(SessionCommand::Reconnect) => debug!("Connection {} already live", self.id),
                    Some(SessionCommand::Close) | None => {
                        self.drain(&mut writer, pending.take()).await;
                        return SessionExit::Closed;
                    }
                },
                read = reader.read(&mut chunk) => match read {
                    Ok(0) => return SessionExit::Fault(fault("connection closed by peer".to_string())),
                    Ok(n) => {
                        self.inbound.extend_from_slice(&chunk[..n]);
                        self.process_inbound();
                    }
                    Err(e) => return SessionExit::Fault(fault(format!("read failed: {}", e))),
                },
            }
        }
    }

    /// Queue batches that were posted ahead of `Close` without waiting
    fn accept_until_close(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                SessionCommand::Enqueue(batch) => self.enqueue(batch),
                SessionCommand::Reconnect => {}
                SessionCommand::Close => break,
            }
        }
    }

    /// Write out everything already accepted, then release the socket
    async fn drain(&mut self, writer: &mut OwnedWriteHalf, pending: PendingWrite) {
        if let Some((frame, offset)) = pending {
            if writer.write_all(&frame[offset..]).await.is_err() {
                self.outbound.clear();
            }
        }
        while let Some(frame) = self.outbound.pop_front() {
            if let Err(e) = writer.write_all(&frame).await {
                debug!("Connection {}: drain stopped: {}", self.id, e);
                self.outbound.clear();
                break;
            }
        }
        let _ = writer.shutdown().await;
    }

    /// Encode a batch onto the write queue. The batch is all-or-nothing.
    ///
    /// Routing decisions belong to the registry; anything that reaches the
    /// session ahead of `Close` is queued and flushed.
    fn enqueue(&mut self, batch: CommandBatch) {
        let mut frames = Vec::with_capacity(batch.commands.len());
        for command in &batch.commands {
            match self.translator.encode(command) {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    warn!(
                        "Connection {}: dropping batch, command '{}' failed to encode: {}",
                        self.id, command.command_type, e
                    );
                    return;
                }
            }
        }

        debug!("Connection {}: queued {} frames", self.id, frames.len());
        self.outbound.extend(frames);
    }

    fn process_inbound(&mut self) {
        while let Some(len) = self.translator.frame_len(&self.inbound) {
            if len == 0 || len > self.inbound.len() {
                break;
            }
            let frame: Vec<u8> = self.inbound.drain(..len).collect();

            match self.translator.decode(&frame) {
                Ok(Decoded::JointPositions(positions)) => {
                    if positions.len() != self.joint_names.len() {
                        debug!(
                            "Connection {}: {} positions for {} joints",
                            self.id,
                            positions.len(),
                            self.joint_names.len()
                        );
                    }
                    let snapshot = TelemetrySnapshot::aligned(
                        self.id,
                        &self.namespace,
                        &self.joint_names,
                        &positions,
                        now_seconds(),
                    );
                    self.shared.store_telemetry(snapshot);
                }
                Ok(Decoded::Result(result)) => {
                    debug!(
                        "Connection {}: result for command {} (code {})",
                        self.id, result.command_id, result.result_code
                    );
                    // No subscribers is fine
                    let _ = self.results.send(ResultEvent {
                        connection_id: self.id,
                        namespace: self.namespace.clone(),
                        result,
                    });
                }
                Ok(Decoded::Ignored) => {}
                Err(e) => warn!("Connection {}: undecodable frame skipped: {}", self.id, e),
            }
        }

        if self.inbound.len() > MAX_UNFRAMED_BYTES {
            warn!(
                "Connection {}: discarding {} unframed bytes",
                self.id,
                self.inbound.len()
            );
            self.inbound.clear();
        }
    }

    fn enter_fault(&mut self, error: &DriverError) {
        warn!("Connection {}: {}", self.id, error);
        self.shared.set_state(ConnectionState::Faulted);

        if !self.outbound.is_empty() {
            warn!(
                "Connection {}: dropping {} unsent frames",
                self.id,
                self.outbound.len()
            );
        }
        self.outbound.clear();
        self.inbound.clear();
    }

    /// Park in `Faulted` until an operator reconnect (`true`) or close (`false`)
    async fn wait_for_reconnect(&mut self) -> bool {
        loop {
            match self.commands.recv().await {
                Some(SessionCommand::Reconnect) => return true,
                Some(SessionCommand::Enqueue(batch)) => warn!(
                    "Connection {}: dropping batch of {} commands while faulted",
                    self.id,
                    batch.commands.len()
                ),
                Some(SessionCommand::Close) | None => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let shared = ConnectionShared::new();
        assert_eq!(shared.state(), ConnectionState::Connecting);

        assert!(shared.set_state(ConnectionState::Live));
        assert!(shared.set_state(ConnectionState::Faulted));
        // Only reconnection leaves Faulted
        assert!(!shared.set_state(ConnectionState::Live));
        assert!(shared.set_state(ConnectionState::Connecting));
        assert!(shared.set_state(ConnectionState::Retiring));
        assert!(!shared.set_state(ConnectionState::Connecting));
        assert!(!shared.set_state(ConnectionState::Live));
        assert!(shared.set_state(ConnectionState::Closed));
        assert!(!shared.set_state(ConnectionState::Connecting));
        assert_eq!(shared.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_telemetry_only_kept_while_live() {
        let shared = ConnectionShared::new();
        let snapshot = TelemetrySnapshot::aligned(ConnectionId(1), "r", &["j".to_string()], &[0.5], 1.0);

        shared.store_telemetry(snapshot.clone());
        assert!(shared.latest_telemetry().is_none());

        shared.set_state(ConnectionState::Live);
        shared.store_telemetry(snapshot.clone());
        assert_eq!(shared.latest_telemetry(), Some(snapshot));

        shared.set_state(ConnectionState::Faulted);
        assert!(shared.latest_telemetry().is_none());
    }

    #[test]
    fn test_routable_states() {
        assert!(ConnectionState::Connecting.is_routable());
        assert!(ConnectionState::Live.is_routable());
        assert!(!ConnectionState::Faulted.is_routable());
        assert!(!ConnectionState::Retiring.is_routable());
        assert!(!ConnectionState::Closed.is_routable());
    }

    #[tokio::test]
    async fn test_reads_continue_while_write_backlog_is_stuck() {
        use crate::command::Command;
        use crate::router::CommandRouter;
        use crate::test_support::{eventually, test_registry, wait_for_state, FakeController};

        let (_runtime, registry) = test_registry();
        let router = CommandRouter::new(Arc::clone(&registry));
        let controller = FakeController::bind().await;

        let id = registry
            .add(&controller.config("rmi_text::TextCommandRegister", 1))
            .unwrap();
        let record = registry.get(id).unwrap();
        // Never read from, so the driver's writes back up
        let mut stream = controller.accept().await;
        assert!(wait_for_state(&record, ConnectionState::Live).await);

        // Far more than loopback socket buffers hold
        let pose: Vec<f64> = (0..500).map(|i| i as f64 + 0.123456).collect();
        let commands = (0..4000)
            .map(|_| Command::new("PTP").with_pose("JOINTS", pose.clone()))
            .collect();
        router.route(CommandBatch::new(id, commands)).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        stream.write_all(b"joints 0.75\n").await.unwrap();
        assert!(eventually(|| record.latest_telemetry().is_some()).await);
        assert_eq!(record.latest_telemetry().unwrap().position("j1"), Some(0.75));
    }
}
