//! Shared fixtures for socket-level tests

use crate::config::ConnectionConfig;
use crate::connection::ConnectionState;
use crate::event_loop::EventLoopRuntime;
use crate::registry::{ConnectionRecord, ConnectionRegistry};
use crate::translator::TranslatorCatalog;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

pub(crate) const WAIT: Duration = Duration::from_secs(5);

pub(crate) fn joints(count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("j{}", i)).collect()
}

pub(crate) fn test_registry() -> (EventLoopRuntime, Arc<ConnectionRegistry>) {
    let runtime = EventLoopRuntime::start().unwrap();
    let registry = Arc::new(ConnectionRegistry::new(
        Arc::new(TranslatorCatalog::with_builtins()),
        runtime.handle(),
    ));
    (runtime, registry)
}

pub(crate) async fn wait_for_state(record: &ConnectionRecord, state: ConnectionState) -> bool {
    let mut receiver = record.subscribe_state();
    let reached = tokio::time::timeout(WAIT, receiver.wait_for(|current| *current == state)).await;
    matches!(reached, Ok(Ok(_)))
}

/// Poll `condition` every few milliseconds until it holds or the wait expires
pub(crate) async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Local listener standing in for a robot controller
pub(crate) struct FakeController {
    listener: TcpListener,
    port: u16,
}

impl FakeController {
    pub(crate) async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self { listener, port }
    }

    /// A port that was free a moment ago and has nothing listening on it
    pub(crate) async fn unused_port() -> u16 {
        Self::bind().await.port
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn config(&self, lookup_name: &str, joint_count: usize) -> ConnectionConfig {
        ConnectionConfig::new("127.0.0.1", self.port as u32, lookup_name, joints(joint_count))
    }

    pub(crate) async fn accept(&self) -> TcpStream {
        let (stream, _) = tokio::time::timeout(WAIT, self.listener.accept())
            .await
            .expect("timed out waiting for driver to connect")
            .unwrap();
        stream
    }
}
