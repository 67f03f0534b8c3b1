//! Message dispatch table.
//!
//! A [`ProtocolHandlerRegistry`] maps a message id to the handler that runs when
//! such a message arrives. Handlers are generic over a context `C`, the state the
//! owning event loop hands them (usually a session that wraps the network, so a
//! handler can reply, broadcast or request a disconnect).
//!
//! Registration happens once at startup. Dispatch is synchronous on the event
//! loop thread, so handlers must not block.
use std::{collections::HashMap, rc::Rc};

use log::warn;
use thiserror::Error;

use super::message::{ProtocolId, ProtocolMessage};
use crate::network::ClientId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a handler for message id {0} is already registered")]
    AlreadyRegistered(ProtocolId),
}

pub trait ProtocolHandler<C> {
    fn execute(&self, ctx: &mut C, client_id: ClientId, msg: &ProtocolMessage);
}

impl<C, F> ProtocolHandler<C> for F
where
    F: Fn(&mut C, ClientId, &ProtocolMessage),
{
    fn execute(&self, ctx: &mut C, client_id: ClientId, msg: &ProtocolMessage) {
        self(ctx, client_id, msg)
    }
}

/// Accepts a message and does nothing with it.
///
/// Registered for ids a role deliberately ignores, so they do not show up as
/// unhandled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopHandler;

impl<C> ProtocolHandler<C> for NopHandler {
    fn execute(&self, _ctx: &mut C, _client_id: ClientId, _msg: &ProtocolMessage) {}
}

pub struct ProtocolHandlerRegistry<C> {
    handlers: HashMap<ProtocolId, Rc<dyn ProtocolHandler<C>>>,
}

impl<C> ProtocolHandlerRegistry<C> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registers `handler` for `id`. One handler may serve several ids.
    pub fn register(
        &mut self,
        id: ProtocolId,
        handler: Rc<dyn ProtocolHandler<C>>,
    ) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }
        self.handlers.insert(id, handler);
        Ok(())
    }

    /// Registers the same handler for every id in `ids`.
    pub fn register_all(
        &mut self,
        ids: &[ProtocolId],
        handler: Rc<dyn ProtocolHandler<C>>,
    ) -> Result<(), RegistryError> {
        for id in ids {
            self.register(*id, Rc::clone(&handler))?;
        }
        Ok(())
    }

    pub fn unregister(&mut self, id: ProtocolId) -> Option<Rc<dyn ProtocolHandler<C>>> {
        self.handlers.remove(&id)
    }

    pub fn handler(&self, id: ProtocolId) -> Option<&Rc<dyn ProtocolHandler<C>>> {
        self.handlers.get(&id)
    }

    pub fn is_registered(&self, id: ProtocolId) -> bool {
        self.handlers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    /// Runs the handler registered for `msg`. Returns `false` if there is none.
    pub fn dispatch(&self, ctx: &mut C, client_id: ClientId, msg: &ProtocolMessage) -> bool {
        match self.handlers.get(&msg.id()) {
            Some(handler) => {
                handler.execute(ctx, client_id, msg);
                true
            }
            None => {
                warn!("no handler for message type {} ({})", msg.id(), msg.name());
                false
            }
        }
    }
}

impl<C> Default for ProtocolHandlerRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::ids;

    #[derive(Default)]
    struct Seen {
        messages: Vec<(ClientId, ProtocolId)>,
    }

    fn record(seen: &mut Seen, client_id: ClientId, msg: &ProtocolMessage) {
        seen.messages.push((client_id, msg.id()));
    }

    #[test]
    fn dispatch_runs_registered_handler() {
        let mut registry = ProtocolHandlerRegistry::<Seen>::new();
        registry.register(ids::PING, Rc::new(record)).unwrap();
        let mut seen = Seen::default();

        assert!(registry.dispatch(&mut seen, ClientId::default(), &ProtocolMessage::Ping));
        assert_eq!(seen.messages, vec![(ClientId::default(), ids::PING)]);
    }

    #[test]
    fn dispatch_without_handler_reports_false() {
        let registry = ProtocolHandlerRegistry::<Seen>::new();
        let mut seen = Seen::default();

        assert!(!registry.dispatch(
            &mut seen,
            ClientId::default(),
            &ProtocolMessage::SceneStateRequest
        ));
        assert!(seen.messages.is_empty());
    }

    #[test]
    fn one_handler_per_id() {
        let mut registry = ProtocolHandlerRegistry::<Seen>::new();
        registry.register(ids::PING, Rc::new(NopHandler)).unwrap();

        assert_eq!(
            registry.register(ids::PING, Rc::new(record)),
            Err(RegistryError::AlreadyRegistered(ids::PING))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn shared_handler_for_many_ids() {
        let mut registry = ProtocolHandlerRegistry::<Seen>::new();
        registry
            .register_all(&ids::SCENE_CHANGES, Rc::new(record))
            .unwrap();
        let mut seen = Seen::default();

        let msg = ProtocolMessage::NodeRemoved {
            node_uuid: "a".to_string(),
        };
        registry.dispatch(&mut seen, ClientId::default(), &msg);

        assert_eq!(registry.len(), ids::SCENE_CHANGES.len());
        assert_eq!(seen.messages.len(), 1);
    }

    #[test]
    fn nop_handler_swallows() {
        let mut registry = ProtocolHandlerRegistry::<Seen>::new();
        registry.register(ids::COMMAND, Rc::new(NopHandler)).unwrap();
        registry.unregister(ids::PING);

        assert!(registry.is_registered(ids::COMMAND));
        assert!(!registry.is_registered(ids::PING));
    }
}
