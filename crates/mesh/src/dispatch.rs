//! Kind-based dispatch of received packets to registered consumers.

use crate::bundle::CourierPacket;
use lifeline_core::MessageKind;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Consumer callback for one message kind.
pub type MessageHandler = Arc<dyn Fn(&CourierPacket) + Send + Sync>;

/// Registration table of handlers by kind.
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: HashMap<MessageKind, Vec<MessageHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: MessageKind, handler: MessageHandler) {
        self.handlers.entry(kind).or_default().push(handler);
    }

    /// Call every handler registered for the packet's kind. Returns how many
    /// ran; unknown kinds are a no-op.
    pub fn dispatch(&self, packet: &CourierPacket) -> usize {
        match self.handlers.get(&packet.kind) {
            Some(handlers) => {
                for handler in handlers {
                    handler(packet);
                }
                handlers.len()
            }
            None => {
                trace!(kind = %packet.kind, id = %packet.id, "No handler for kind");
                0
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&str> = self.handlers.keys().map(MessageKind::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("Dispatcher").field("kinds", &kinds).finish()
    }
}
