//! Message Dispatcher.
//!
//! The lock manager only needs one thing from the network: deliver a
//! [`Message`] to a node, reliably and in send order per sender/receiver
//! pair. [`Dispatcher`] is that contract. [`LocalNetwork`] implements it
//! in-process over crossbeam channels, one inbox per node, with frames going
//! through the wire codec exactly as they would on a socket.

use crate::error::{DlmError, Result};
use crate::lock::NodeId;
use crate::registry::locked;
use crate::wire::Message;
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Outbound side of the transport.
pub trait Dispatcher: Send + Sync {
    fn send(&self, from: NodeId, to: NodeId, message: &Message) -> Result<()>;
}

/// Inbound side: whatever consumes a node's inbox.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, from: NodeId, message: Message);
}

/// One encoded frame in flight.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: NodeId,
    pub frame: Bytes,
}

/// In-process transport connecting the nodes of one cluster.
///
/// Counts frames that have been sent but not yet handled, so a driver can
/// wait for the cluster to go quiet.
#[derive(Debug, Default)]
pub struct LocalNetwork {
    links: Mutex<HashMap<NodeId, Sender<Envelope>>>,
    in_flight: Arc<AtomicUsize>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach `node` and return its inbox. Re-registering replaces the old inbox.
    pub fn register(&self, node: NodeId) -> Receiver<Envelope> {
        let (tx, rx) = unbounded();
        locked(&self.links).insert(node, tx);
        rx
    }

    /// Register `node` and drain its inbox on a dedicated thread, decoding
    /// each frame and handing it to `handler`. The thread ends once the node
    /// is disconnected and its inbox is empty.
    pub fn attach(
        &self,
        node: NodeId,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<JoinHandle<()>> {
        let inbox = self.register(node);
        let in_flight = self.in_flight.clone();
        thread::Builder::new()
            .name(format!("dlm-pump-{}", node))
            .spawn(move || {
                for envelope in inbox.iter() {
                    match Message::decode(&envelope.frame) {
                        Ok(message) => {
                            debug!(
                                "node {}: {} for {} from node {}",
                                node,
                                message.kind(),
                                message.resource_name(),
                                envelope.from
                            );
                            handler.handle_message(envelope.from, message)
                        }
                        Err(e) => warn!(
                            "node {}: dropping malformed frame from node {}: {}",
                            node, envelope.from, e
                        ),
                    }
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }
                debug!("node {}: inbox closed, pump exiting", node);
            })
            .map_err(|e| {
                DlmError::Transport(format!("failed to spawn pump for node {}: {}", node, e))
            })
    }

    /// Detach `node`: sends to or from it fail, and its pump stops once the
    /// inbox drains.
    pub fn disconnect(&self, node: NodeId) {
        if locked(&self.links).remove(&node).is_some() {
            debug!("network: node {} disconnected", node);
        }
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        locked(&self.links).contains_key(&node)
    }

    /// Wait until every sent frame has been handled, including frames sent
    /// while handling others. Returns `false` if `limit` elapses first.
    pub fn wait_idle(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

impl Dispatcher for LocalNetwork {
    fn send(&self, from: NodeId, to: NodeId, message: &Message) -> Result<()> {
        let frame = message.encode()?;
        let link = {
            let links = locked(&self.links);
            if !links.contains_key(&from) {
                return Err(DlmError::Transport(format!("node {} is not connected", from)));
            }
            links.get(&to).cloned()
        };
        let Some(link) = link else {
            return Err(DlmError::Transport(format!("node {} is not connected", to)));
        };
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        link.send(Envelope { from, frame }).map_err(|_| {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            DlmError::Transport(format!("inbox of node {} is closed", to))
        })
    }
}
