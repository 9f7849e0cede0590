//! Connection registry
//!
//! Maps [`ConnectionId`]s to connection records. Structural changes (add,
//! remove) are serialized behind one short-held mutex; readers take a
//! point-in-time snapshot of the records before iterating. A record is only
//! inserted once its translator is bound and its session is handed to the
//! event loop.

use crate::command::{BatchTarget, ConnectionId, ResultEvent};
use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionShared, ConnectionState};
use crate::event_loop::LoopHandle;
use crate::telemetry::TelemetrySnapshot;
use crate::translator::TranslatorCatalog;
use crate::{DriverError, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Result events buffered per subscriber before the oldest are dropped
const RESULT_CHANNEL_CAPACITY: usize = 256;

/// Registry view of one connection
#[derive(Debug)]
pub struct ConnectionRecord {
    id: ConnectionId,
    namespace: String,
    host: String,
    port: u16,
    translator: String,
    joint_names: Vec<String>,
    shared: Arc<ConnectionShared>,
}

impl ConnectionRecord {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `package/lookup_name` of the bound translator
    pub fn translator(&self) -> &str {
        &self.translator
    }

    pub fn joint_names(&self) -> &[String] {
        &self.joint_names
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.subscribe_state()
    }

    pub fn latest_telemetry(&self) -> Option<TelemetrySnapshot> {
        self.shared.latest_telemetry()
    }
}

#[derive(Default)]
struct RegistryInner {
    live: BTreeMap<ConnectionId, Arc<ConnectionRecord>>,
    /// Removed records whose sessions have not confirmed closure yet
    pending_close: HashMap<ConnectionId, Arc<ConnectionRecord>>,
    next_id: u32,
}

impl RegistryInner {
    fn reap_closed(&mut self) {
        self.pending_close
            .retain(|_, record| record.state() != ConnectionState::Closed);
    }
}

pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
    catalog: Arc<TranslatorCatalog>,
    event_loop: LoopHandle,
    results: broadcast::Sender<ResultEvent>,
}

impl ConnectionRegistry {
    pub fn new(catalog: Arc<TranslatorCatalog>, event_loop: LoopHandle) -> Self {
        let (results, _) = broadcast::channel(RESULT_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(RegistryInner::default()),
            catalog,
            event_loop,
            results,
        }
    }

    /// Create a connection, bind its translator and start its session.
    ///
    /// Failures leave the registry untouched and do not consume an id.
    pub fn add(&self, config: &ConnectionConfig) -> Result<ConnectionId> {
        let port = config.validate()?;
        if let Some(namespace) = &config.namespace {
            if namespace.trim().is_empty() || namespace.contains(char::is_whitespace) {
                return Err(DriverError::Configuration(format!(
                    "invalid namespace '{}'",
                    namespace
                )));
            }
        }

        let translator = self
            .catalog
            .load(&config.plugin_package, &config.plugin_lookup_name)?;
        let translator_name = format!("{}/{}", config.plugin_package, config.plugin_lookup_name);

        let mut inner = self.inner.lock();
        inner.reap_closed();

        let id = ConnectionId(inner.next_id);
        let namespace = config
            .namespace
            .clone()
            .unwrap_or_else(|| format!("robot{}", id));

        if inner.live.values().any(|record| record.namespace == namespace) {
            return Err(DriverError::Configuration(format!(
                "namespace '{}' is already in use",
                namespace
            )));
        }

        let shared = Arc::new(ConnectionShared::new());
        let (connection, sender) = Connection::new(
            id,
            namespace.clone(),
            config.host.clone(),
            port,
            config.joints.clone(),
            translator,
            Arc::clone(&shared),
            self.results.clone(),
        );

        // Posted under the lock so no routed batch can reach the loop before the session
        let session_shared = Arc::clone(&shared);
        self.event_loop
            .post(move |ctx| ctx.attach(connection, sender, session_shared))?;

        inner.next_id += 1;
        inner.live.insert(
            id,
            Arc::new(ConnectionRecord {
                id,
                namespace: namespace.clone(),
                host: config.host.clone(),
                port,
                translator: translator_name.clone(),
                joint_names: config.joints.clone(),
                shared,
            }),
        );
        drop(inner);

        info!(
            "Added connection {} ({}) -> {}:{} using {}",
            id, namespace, config.host, port, translator_name
        );
        Ok(id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionRecord>> {
        self.inner.lock().live.get(&id).cloned()
    }

    pub fn find(&self, namespace: &str) -> Option<Arc<ConnectionRecord>> {
        self.inner
            .lock()
            .live
            .values()
            .find(|record| record.namespace == namespace)
            .cloned()
    }

    pub fn resolve(&self, target: &BatchTarget) -> Option<Arc<ConnectionRecord>> {
        match target {
            BatchTarget::Id(id) => self.get(*id),
            BatchTarget::Namespace(namespace) => self.find(namespace),
        }
    }

    /// Run `action` on the live record for `target` while the registry lock
    /// is held, so nothing it posts can be overtaken by a concurrent
    /// [`remove`](Self::remove). `action` must not call back into the registry.
    pub(crate) fn with_target<R, F>(&self, target: &BatchTarget, action: F) -> Result<R>
    where
        F: FnOnce(&ConnectionRecord) -> Result<R>,
    {
        let inner = self.inner.lock();
        let record = match target {
            BatchTarget::Id(id) => inner.live.get(id),
            BatchTarget::Namespace(namespace) => {
                inner.live.values().find(|record| &record.namespace == namespace)
            }
        }
        .ok_or_else(|| DriverError::UnknownTarget(target.to_string()))?;
        action(record)
    }

    /// Retire a connection. The session drains its queued writes on the loop
    /// before the socket is released; until then the record sits in the
    /// pending-close list.
    pub fn remove(&self, id: ConnectionId) -> Result<()> {
        let record = {
            let mut inner = self.inner.lock();
            inner.reap_closed();

            let record = inner
                .live
                .remove(&id)
                .ok_or_else(|| DriverError::UnknownTarget(format!("#{}", id)))?;
            record.shared.set_state(ConnectionState::Retiring);
            inner.pending_close.insert(id, Arc::clone(&record));
            record
        };

        let shared = Arc::clone(&record.shared);
        let posted = self.event_loop.post(move |ctx| {
            if !ctx.close(id) {
                shared.set_state(ConnectionState::Closed);
            }
        });
        if posted.is_err() {
            // Loop already gone, nothing left to drain
            record.shared.set_state(ConnectionState::Closed);
        }

        info!("Removed connection {} ({})", id, record.namespace);
        Ok(())
    }

    /// Operator-triggered reconnection of a faulted connection
    pub fn reconnect(&self, id: ConnectionId) -> Result<()> {
        let record = self
            .get(id)
            .ok_or_else(|| DriverError::UnknownTarget(format!("#{}", id)))?;

        match record.state() {
            ConnectionState::Faulted => {
                self.event_loop.post(move |ctx| {
                    if !ctx.reconnect(id) {
                        warn!("Reconnect for connection {} found no session", id);
                    }
                })?;
                info!("Reconnect requested for connection {}", id);
            }
            state => debug!("Connection {} is {:?}, reconnect ignored", id, state),
        }
        Ok(())
    }

    /// Point-in-time copy of all registered records, ordered by id
    pub fn snapshot(&self) -> Vec<Arc<ConnectionRecord>> {
        self.inner.lock().live.values().cloned().collect()
    }

    /// Visit every record without holding the registry lock
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&ConnectionRecord),
    {
        for record in self.snapshot() {
            visitor(&record);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removed connections still draining
    pub fn pending_close_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.reap_closed();
        inner.pending_close.len()
    }

    pub fn subscribe_results(&self) -> broadcast::Receiver<ResultEvent> {
        self.results.subscribe()
    }

    pub(crate) fn event_loop(&self) -> &LoopHandle {
        &self.event_loop
    }
}
