//! Protocol definitions and the registry they are recorded in

use crate::channel::Channel;
use crate::encoding::{Encoding, Value};
use parking_lot::RwLock;
use slashtag_core::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Handler invoked for every inbound message of one kind.
///
/// Errors and panics are contained to the channel that raised them.
pub type MessageHandler = Arc<dyn Fn(&Channel, Value) -> anyhow::Result<()> + Send + Sync>;

/// One message kind of a protocol
#[derive(Clone)]
pub struct MessageSpec {
    pub encoding: Encoding,
    pub handler: Option<MessageHandler>,
}

impl fmt::Debug for MessageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSpec")
            .field("encoding", &self.encoding)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// A named protocol: ordered message kinds, each with an encoding and an
/// optional inbound handler. Ordinals are declaration order.
#[derive(Clone, Debug)]
pub struct ProtocolDefinition {
    name: String,
    messages: Vec<MessageSpec>,
}

impl ProtocolDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            messages: Vec::new(),
        }
    }

    /// Append a message kind with an inbound handler.
    pub fn message<F>(mut self, encoding: Encoding, handler: F) -> Self
    where
        F: Fn(&Channel, Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.messages.push(MessageSpec {
            encoding,
            handler: Some(Arc::new(handler)),
        });
        self
    }

    /// Append a send-only message kind; inbound messages of it are dropped.
    pub fn send_only(mut self, encoding: Encoding) -> Self {
        self.messages.push(MessageSpec {
            encoding,
            handler: None,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn messages(&self) -> &[MessageSpec] {
        &self.messages
    }
}

/// Registered protocols, keyed by unique name
#[derive(Debug, Default)]
pub struct ProtocolRegistry {
    protocols: RwLock<BTreeMap<String, Arc<ProtocolDefinition>>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a definition; names are unique.
    pub fn register(&self, definition: ProtocolDefinition) -> Result<Arc<ProtocolDefinition>> {
        let mut protocols = self.protocols.write();
        if protocols.contains_key(definition.name()) {
            return Err(Error::DuplicateProtocol(definition.name().to_string()));
        }
        let definition = Arc::new(definition);
        protocols.insert(definition.name().to_string(), definition.clone());
        Ok(definition)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProtocolDefinition>> {
        self.protocols.read().get(name).cloned()
    }

    /// All registered definitions, in name order
    pub fn all(&self) -> Vec<Arc<ProtocolDefinition>> {
        self.protocols.read().values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.protocols.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_rejected() {
        let registry = ProtocolRegistry::new();
        registry
            .register(ProtocolDefinition::new("foo").send_only(Encoding::String))
            .unwrap();

        let result = registry.register(ProtocolDefinition::new("foo"));
        assert!(matches!(result, Err(Error::DuplicateProtocol(name)) if name == "foo"));
    }

    #[test]
    fn test_message_order_is_declaration_order() {
        let def = ProtocolDefinition::new("chat")
            .message(Encoding::String, |_, _| Ok(()))
            .send_only(Encoding::Uint)
            .message(Encoding::Json, |_, _| Ok(()));

        let encodings: Vec<_> = def.messages().iter().map(|m| m.encoding).collect();
        assert_eq!(encodings, vec![Encoding::String, Encoding::Uint, Encoding::Json]);
        assert!(def.messages()[1].handler.is_none());
    }

    #[test]
    fn test_lookup() {
        let registry = ProtocolRegistry::new();
        registry.register(ProtocolDefinition::new("b")).unwrap();
        registry.register(ProtocolDefinition::new("a")).unwrap();

        assert!(registry.get("a").is_some());
        assert!(registry.get("c").is_none());
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
    }
}
