//! Shared event loop for all connection I/O
//!
//! A single current-thread tokio runtime, running on one dedicated OS thread,
//! drives every connection session. Work is handed in from other threads with
//! [`LoopHandle::post`]; posted tasks run on the loop thread in the order
//! they were posted.

use crate::command::{CommandBatch, ConnectionId};
use crate::connection::{Connection, ConnectionShared, ConnectionState, SessionCommand, SessionSender};
use crate::{DriverError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long retiring sessions may keep flushing once the loop is stopping
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Unit of work executed on the loop thread
pub type Task = Box<dyn FnOnce(&mut LoopContext) + Send + 'static>;

enum LoopMessage {
    Task(Task),
    Stop,
}

/// Cloneable, thread-safe entry point into the loop
#[derive(Clone)]
pub struct LoopHandle {
    sender: mpsc::UnboundedSender<LoopMessage>,
}

impl LoopHandle {
    /// Queue `task` for execution on the loop thread
    pub fn post<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&mut LoopContext) + Send + 'static,
    {
        self.sender
            .send(LoopMessage::Task(Box::new(task)))
            .map_err(|_| DriverError::EventLoopStopped)
    }

    /// Ask the loop to return once every task posted so far has run.
    /// Safe to call from any thread, any number of times.
    pub fn stop(&self) {
        let _ = self.sender.send(LoopMessage::Stop);
    }

    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}

struct SessionEntry {
    sender: SessionSender,
    shared: Arc<ConnectionShared>,
    task: JoinHandle<()>,
}

/// Loop-thread state handed to every posted task
#[derive(Default)]
pub struct LoopContext {
    sessions: HashMap<ConnectionId, SessionEntry>,
    /// Detached sessions still draining their queue
    closing: Vec<SessionEntry>,
}

impl LoopContext {
    /// Start driving a session on this loop
    pub fn attach(&mut self, connection: Connection, sender: SessionSender, shared: Arc<ConnectionShared>) {
        let id = connection.id();
        let task = tokio::spawn(connection.run());
        if let Some(previous) = self.sessions.insert(id, SessionEntry { sender, shared, task }) {
            warn!("Connection {} attached twice; aborting previous session", id);
            previous.task.abort();
        }
        debug!("Connection {} attached ({} sessions)", id, self.sessions.len());
    }

    /// Hand a batch to a session's write path. Returns `false` when there is no such session.
    pub fn enqueue(&mut self, id: ConnectionId, batch: CommandBatch) -> bool {
        self.send(id, SessionCommand::Enqueue(batch))
    }

    pub fn reconnect(&mut self, id: ConnectionId) -> bool {
        self.send(id, SessionCommand::Reconnect)
    }

    /// Detach a session and let it drain and close its socket
    pub fn close(&mut self, id: ConnectionId) -> bool {
        self.closing.retain(|entry| !entry.task.is_finished());
        match self.sessions.remove(&id) {
            Some(entry) => {
                if entry.sender.send(SessionCommand::Close).is_err() {
                    entry.shared.set_state(ConnectionState::Closed);
                } else {
                    self.closing.push(entry);
                }
                true
            }
            None => false,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn send(&mut self, id: ConnectionId, command: SessionCommand) -> bool {
        match self.sessions.get(&id) {
            Some(entry) => entry.sender.send(command).is_ok(),
            None => {
                warn!("No session for connection {}", id);
                false
            }
        }
    }

    async fn shutdown(&mut self) {
        for (id, entry) in self.sessions.drain() {
            entry.task.abort();
            entry.shared.set_state(ConnectionState::Closed);
            debug!("Connection {} aborted by loop shutdown", id);
        }

        for mut entry in self.closing.drain(..) {
            if tokio::time::timeout(CLOSE_GRACE, &mut entry.task).await.is_err() {
                entry.task.abort();
            }
            entry.shared.set_state(ConnectionState::Closed);
        }
    }
}

/// The loop itself; consumed by [`EventLoop::run`]
pub struct EventLoop {
    receiver: mpsc::UnboundedReceiver<LoopMessage>,
    context: LoopContext,
}

impl EventLoop {
    pub fn new() -> (Self, LoopHandle) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let event_loop = Self {
            receiver,
            context: LoopContext::default(),
        };
        (event_loop, LoopHandle { sender })
    }

    /// Block the calling thread until [`LoopHandle::stop`] is processed
    pub fn run(self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        runtime.block_on(self.process());
        Ok(())
    }

    async fn process(mut self) {
        info!("Event loop running");

        while let Some(message) = self.receiver.recv().await {
            match message {
                LoopMessage::Task(task) => task(&mut self.context),
                LoopMessage::Stop => break,
            }
        }

        self.receiver.close();
        self.context.shutdown().await;
        info!("Event loop stopped");
    }
}

/// Owns the dedicated loop thread
pub struct EventLoopRuntime {
    handle: LoopHandle,
    thread: Option<std::thread::JoinHandle<Result<()>>>,
}

impl EventLoopRuntime {
    /// Spawn the loop thread
    pub fn start() -> Result<Self> {
        let (event_loop, handle) = EventLoop::new();
        let thread = std::thread::Builder::new()
            .name("rmid-io".to_string())
            .spawn(move || event_loop.run())?;

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    pub fn post<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&mut LoopContext) + Send + 'static,
    {
        self.handle.post(task)
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Stop the loop and wait for its thread to exit
    pub fn shutdown(&mut self) {
        self.handle.stop();
        if let Some(thread) = self.thread.take() {
            match thread.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Event loop failed: {}", e),
                Err(_) => error!("Event loop thread panicked"),
            }
        }
    }
}

impl Drop for EventLoopRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
