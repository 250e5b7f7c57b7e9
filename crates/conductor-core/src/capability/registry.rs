//! Capability registry
//!
//! Explicitly constructed and passed by reference to the resolver, plan
//! builder and execution engine. Declaration order is preserved; it breaks
//! classification ties.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use super::{Capability, CapabilityDescriptor, IdentityKind};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("capability '{0}' is already registered")]
    Duplicate(String),

    #[error("capability '{0}' is not registered")]
    Unknown(String),
}

#[derive(Default)]
pub struct CapabilityRegistry {
    descriptors: Vec<Arc<CapabilityDescriptor>>,
    index: HashMap<String, usize>,
    handlers: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a capability without a handler
    pub fn declare(&mut self, descriptor: CapabilityDescriptor) -> Result<(), RegistryError> {
        if self.index.contains_key(&descriptor.name) {
            return Err(RegistryError::Duplicate(descriptor.name));
        }
        self.index
            .insert(descriptor.name.clone(), self.descriptors.len());
        self.descriptors.push(Arc::new(descriptor));
        Ok(())
    }

    /// Declare a capability and bind its handler
    pub fn register(
        &mut self,
        descriptor: CapabilityDescriptor,
        handler: Arc<dyn Capability>,
    ) -> Result<(), RegistryError> {
        let name = descriptor.name.clone();
        self.declare(descriptor)?;
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Bind (or rebind) the handler of a declared capability
    pub fn bind(&mut self, name: &str, handler: Arc<dyn Capability>) -> Result<(), RegistryError> {
        if !self.index.contains_key(name) {
            return Err(RegistryError::Unknown(name.to_string()));
        }
        self.handlers.insert(name.to_string(), handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<CapabilityDescriptor>> {
        self.index.get(name).map(|i| self.descriptors[*i].clone())
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Declaration index, used for tie-breaking
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Descriptors in declaration order
    pub fn descriptors(&self) -> &[Arc<CapabilityDescriptor>] {
        &self.descriptors
    }

    pub fn names(&self) -> Vec<&str> {
        self.descriptors.iter().map(|d| d.name.as_str()).collect()
    }

    /// First declared capability resolving identities of `kind`
    pub fn identity_provider_for(&self, kind: IdentityKind) -> Option<Arc<CapabilityDescriptor>> {
        self.descriptors
            .iter()
            .find(|d| d.identity_provider.as_ref().map(|p| p.kind) == Some(kind))
            .cloned()
    }

    /// Declared capabilities with no bound handler
    pub fn unbound(&self) -> Vec<&str> {
        self.descriptors
            .iter()
            .filter(|d| !self.handlers.contains_key(&d.name))
            .map(|d| d.name.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("capabilities", &self.names())
            .field("bound", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityError, ExecutionContext};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Echo;

    #[async_trait]
    impl Capability for Echo {
        async fn invoke(
            &self,
            params: Value,
            _ctx: ExecutionContext,
        ) -> Result<Value, CapabilityError> {
            Ok(json!({ "echo": params }))
        }
    }

    #[test]
    fn test_declaration_order_and_duplicates() {
        let mut registry = CapabilityRegistry::new();
        registry
            .register(CapabilityDescriptor::new("b"), Arc::new(Echo))
            .unwrap();
        registry.declare(CapabilityDescriptor::new("a")).unwrap();

        assert_eq!(registry.names(), vec!["b", "a"]);
        assert_eq!(registry.position("a"), Some(1));
        assert_eq!(
            registry.declare(CapabilityDescriptor::new("a")),
            Err(RegistryError::Duplicate("a".into()))
        );
        assert_eq!(registry.unbound(), vec!["a"]);
        assert!(registry.handler("b").is_some());
    }

    #[test]
    fn test_bind_requires_declaration() {
        let mut registry = CapabilityRegistry::new();
        assert_eq!(
            registry.bind("ghost", Arc::new(Echo)).unwrap_err(),
            RegistryError::Unknown("ghost".into())
        );
    }

    #[test]
    fn test_identity_provider_lookup() {
        let mut registry = CapabilityRegistry::new();
        registry
            .declare(CapabilityDescriptor::new("web_search"))
            .unwrap();
        registry
            .declare(CapabilityDescriptor::new("resolve_contact").with_identity_provider(
                IdentityKind::Email,
                "query",
                "email",
            ))
            .unwrap();
        let provider = registry.identity_provider_for(IdentityKind::Email).unwrap();
        assert_eq!(provider.name, "resolve_contact");
        assert!(registry.identity_provider_for(IdentityKind::Phone).is_none());
    }
}
