use crate::core::packet::Packet;
use crate::error::{constants, ProtocolError, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

type HandlerFn = dyn Fn(&Packet) -> Result<Option<Packet>> + Send + Sync + 'static;

/// Routes inbound packets by type id to collaborator handlers.
///
/// A handler may return a reply, which the session queues behind anything
/// already outbound. Cloning shares the registry.
#[derive(Clone)]
pub struct Dispatcher {
    handlers: Arc<RwLock<HashMap<u16, Box<HandlerFn>>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.handlers.read().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("Dispatcher").field("handlers", &count).finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register (or replace) the handler for a packet type.
    pub fn register<F>(&self, type_id: u16, handler: F) -> Result<()>
    where
        F: Fn(&Packet) -> Result<Option<Packet>> + Send + Sync + 'static,
    {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string()))?;

        handlers.insert(type_id, Box::new(handler));
        Ok(())
    }

    pub fn unregister(&self, type_id: u16) -> Result<bool> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string()))?;
        Ok(handlers.remove(&type_id).is_some())
    }

    pub fn is_registered(&self, type_id: u16) -> bool {
        self.handlers
            .read()
            .map(|handlers| handlers.contains_key(&type_id))
            .unwrap_or(false)
    }

    /// Run the handler for `packet.type_id`.
    ///
    /// # Errors
    /// `UnexpectedMessage` when nothing is registered for the type, or
    /// whatever the handler itself returns.
    pub fn dispatch(&self, packet: &Packet) -> Result<Option<Packet>> {
        let handlers = self
            .handlers
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_READ_LOCK.to_string()))?;

        handlers
            .get(&packet.type_id)
            .ok_or(ProtocolError::UnexpectedMessage(packet.type_id))
            .and_then(|handler| handler(packet))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::attribute::AttributeValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_routes_by_type_and_returns_reply() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        dispatcher
            .register(0x0040, move |packet| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Some(Packet::new(0x0041).with(
                    "n",
                    AttributeValue::Int32(packet.attributes.len() as u32),
                )))
            })
            .unwrap();

        let reply = dispatcher.dispatch(&Packet::new(0x0040)).unwrap().unwrap();
        assert_eq!(reply.type_id, 0x0041);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregistered_type() {
        let dispatcher = Dispatcher::new();
        assert!(matches!(
            dispatcher.dispatch(&Packet::new(0x0050)),
            Err(ProtocolError::UnexpectedMessage(0x0050))
        ));

        dispatcher.register(0x0050, |_| Ok(None)).unwrap();
        assert!(dispatcher.is_registered(0x0050));
        assert!(dispatcher.unregister(0x0050).unwrap());
        assert!(!dispatcher.is_registered(0x0050));
    }

    #[test]
    fn test_clones_share_registry() {
        let dispatcher = Dispatcher::new();
        let shared = dispatcher.clone();
        shared.register(0x0060, |_| Ok(None)).unwrap();
        assert!(dispatcher.is_registered(0x0060));
    }
}
