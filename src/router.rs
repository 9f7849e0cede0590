//! Command routing
//!
//! Resolves a batch's target in the registry and posts the enqueue onto the
//! event loop, so each connection's write queue is only ever touched from the
//! loop thread. Posted tasks run FIFO, which keeps batches for one target in
//! submission order.

use crate::command::{CommandBatch, ConnectionId};
use crate::event_loop::LoopHandle;
use crate::registry::ConnectionRegistry;
use crate::{DriverError, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Acknowledgement that a batch was handed to its connection's write path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    pub connection_id: ConnectionId,
    pub commands: usize,
}

#[derive(Clone)]
pub struct CommandRouter {
    registry: Arc<ConnectionRegistry>,
    event_loop: LoopHandle,
}

impl CommandRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        let event_loop = registry.event_loop().clone();
        Self {
            registry,
            event_loop,
        }
    }

    /// Route one batch. Unknown, retiring or faulted targets are rejected and
    /// the batch is dropped.
    ///
    /// The enqueue is posted while the registry lock is held, so an accepted
    /// batch is always ahead of its target's close on the loop.
    pub fn route(&self, batch: CommandBatch) -> Result<Accepted> {
        let target = batch.target.clone();
        let accepted = self.registry.with_target(&target, |record| {
            let state = record.state();
            if !state.is_routable() {
                return Err(DriverError::UnknownTarget(format!("{} ({:?})", target, state)));
            }

            let accepted = Accepted {
                connection_id: record.id(),
                commands: batch.commands.len(),
            };
            let id = accepted.connection_id;
            self.event_loop.post(move |ctx| {
                let count = batch.commands.len();
                if !ctx.enqueue(id, batch) {
                    warn!("Batch of {} commands for connection {} dropped", count, id);
                }
            })?;
            Ok(accepted)
        })?;

        debug!(
            "Routed {} commands to connection {}",
            accepted.commands, accepted.connection_id
        );
        Ok(accepted)
    }
}
