//! Method Dispatch Table
//!
//! Each actor publishes the methods it can be called with. The table is the
//! authority on whether a call is a modify call (journaled, moves the stub to
//! Modified) and on what shape of reply a method produces.

use crate::messages::MessageKind;
use crate::{ActorError, Result};
use std::collections::HashMap;
use std::fmt;

/// How many values a method produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnArity {
    /// Fire-and-forget; a query still receives `null`
    None,
    /// Exactly one value
    One,
    /// Zero or more sequenced values; callable only as a stream
    Many,
}

/// Static description of one callable method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: String,
    pub arity: usize,
    pub modify: bool,
    pub returns: ReturnArity,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>, arity: usize, modify: bool, returns: ReturnArity) -> Self {
        Self {
            name: name.into(),
            arity,
            modify,
            returns,
        }
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}{}",
            self.name,
            self.arity,
            if self.modify { " (modify)" } else { "" }
        )
    }
}

/// Per-actor table of callable methods
#[derive(Debug, Clone, Default)]
pub struct MethodTable {
    methods: HashMap<String, MethodDescriptor>,
}

impl MethodTable {
    pub fn builder() -> MethodTableBuilder {
        MethodTableBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.get(name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Look up a method and check the call against its descriptor.
    ///
    /// Replayed records resolve like sends: their recorded shape was already
    /// checked when they were first dispatched.
    pub fn resolve(
        &self,
        address: &str,
        name: &str,
        argc: usize,
        kind: &MessageKind,
    ) -> Result<&MethodDescriptor> {
        let descriptor = self
            .methods
            .get(name)
            .ok_or_else(|| ActorError::method_not_found(address, name))?;

        if descriptor.arity != argc {
            return Err(ActorError::invalid_arguments(
                name,
                format!("expected {} arguments, got {}", descriptor.arity, argc),
            ));
        }

        match (kind, descriptor.returns) {
            (MessageKind::Stream(_), ReturnArity::Many) => Ok(descriptor),
            (MessageKind::Stream(_), _) => Err(ActorError::invalid_arguments(
                name,
                "method does not produce a stream",
            )),
            (_, ReturnArity::Many) => Err(ActorError::invalid_arguments(
                name,
                "stream method must be called as a stream",
            )),
            _ => Ok(descriptor),
        }
    }
}

/// Builder for [`MethodTable`]
#[derive(Debug, Default)]
pub struct MethodTableBuilder {
    methods: HashMap<String, MethodDescriptor>,
}

impl MethodTableBuilder {
    fn add(mut self, descriptor: MethodDescriptor) -> Self {
        self.methods.insert(descriptor.name.clone(), descriptor);
        self
    }

    /// Read-only method returning nothing
    pub fn send(self, name: impl Into<String>, arity: usize) -> Self {
        self.add(MethodDescriptor::new(name, arity, false, ReturnArity::None))
    }

    /// Read-only method returning one value
    pub fn query(self, name: impl Into<String>, arity: usize) -> Self {
        self.add(MethodDescriptor::new(name, arity, false, ReturnArity::One))
    }

    /// State-changing method returning one value
    pub fn modify(self, name: impl Into<String>, arity: usize) -> Self {
        self.add(MethodDescriptor::new(name, arity, true, ReturnArity::One))
    }

    /// State-changing method returning nothing
    pub fn modify_send(self, name: impl Into<String>, arity: usize) -> Self {
        self.add(MethodDescriptor::new(name, arity, true, ReturnArity::None))
    }

    /// Read-only method producing a stream
    pub fn stream(self, name: impl Into<String>, arity: usize) -> Self {
        self.add(MethodDescriptor::new(name, arity, false, ReturnArity::Many))
    }

    pub fn build(self) -> MethodTable {
        MethodTable {
            methods: self.methods,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryRegistry;

    fn table() -> MethodTable {
        MethodTable::builder()
            .modify("increment", 1)
            .query("get", 0)
            .stream("range", 2)
            .build()
    }

    #[test]
    fn test_resolve_flags_modify() {
        let table = table();
        let desc = table.resolve("c", "increment", 1, &MessageKind::Send).unwrap();
        assert!(desc.modify);
        assert_eq!(desc.to_string(), "increment/1 (modify)");

        let desc = table.resolve("c", "get", 0, &MessageKind::Send).unwrap();
        assert!(!desc.modify);
    }

    #[test]
    fn test_unknown_method_and_arity() {
        let table = table();
        assert!(matches!(
            table.resolve("c", "reset", 0, &MessageKind::Send),
            Err(ActorError::MethodNotFound { .. })
        ));
        assert!(matches!(
            table.resolve("c", "increment", 2, &MessageKind::Send),
            Err(ActorError::InvalidArguments { .. })
        ));
    }

    #[tokio::test]
    async fn test_stream_shape_checked() {
        let table = table();
        let registry = QueryRegistry::new();

        let (reply, _stream) = registry.register_stream("t", None);
        let kind = MessageKind::Stream(reply);
        assert!(table.resolve("c", "range", 2, &kind).is_ok());
        assert!(table.resolve("c", "get", 0, &kind).is_err());

        let (reply, _pending) = registry.register_query("t", None);
        let kind = MessageKind::Query(reply);
        assert!(matches!(
            table.resolve("c", "range", 2, &kind),
            Err(ActorError::InvalidArguments { .. })
        ));
    }
}
