use std::collections::HashSet;
use std::sync::Arc;

use userenv_shared::errors::{UserEnvError, UserEnvResult};

use super::{ComponentDescriptor, StackComponent};

/// All components this process knows about, built once at startup.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    components: Vec<Arc<dyn StackComponent>>,
}

impl ComponentRegistry {
    pub fn new(components: Vec<Arc<dyn StackComponent>>) -> Self {
        Self { components }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StackComponent>> {
        self.components
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.components.iter().map(|c| c.name().to_string()).collect()
    }

    pub fn descriptors(&self) -> Vec<ComponentDescriptor> {
        self.components.iter().map(|c| c.descriptor()).collect()
    }

    /// Looks up each stack name, preserving the requested order.
    pub fn resolve(&self, stacks: &[String]) -> UserEnvResult<Vec<Arc<dyn StackComponent>>> {
        let mut seen = HashSet::new();
        stacks
            .iter()
            .map(|name| {
                if !seen.insert(name.as_str()) {
                    return Err(UserEnvError::InvalidConfig(format!(
                        "stack '{}' listed more than once",
                        name
                    )));
                }
                self.get(name).ok_or_else(|| {
                    UserEnvError::InvalidConfig(format!(
                        "unknown stack '{}' (known: {})",
                        name,
                        self.names().join(", ")
                    ))
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("components", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::StatusMap;
    use crate::storage::ObjectStorageConfig;
    use async_trait::async_trait;

    struct Named(&'static str);

    #[async_trait]
    impl StackComponent for Named {
        fn name(&self) -> &str {
            self.0
        }
        async fn setup(&self, _storage: &ObjectStorageConfig) -> UserEnvResult<()> {
            Ok(())
        }
        async fn cleanup(&self) -> UserEnvResult<()> {
            Ok(())
        }
        fn status(&self) -> StatusMap {
            StatusMap::new()
        }
    }

    fn registry() -> ComponentRegistry {
        ComponentRegistry::new(vec![
            Arc::new(Named("leaser")),
            Arc::new(Named("db")),
            Arc::new(Named("filesystem")),
        ])
    }

    #[test]
    fn test_resolve_keeps_requested_order() {
        let resolved = registry()
            .resolve(&["db".to_string(), "leaser".to_string()])
            .unwrap();
        let names: Vec<&str> = resolved.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["db", "leaser"]);
    }

    #[test]
    fn test_resolve_unknown() {
        match registry().resolve(&["invalid_stack".to_string()]) {
            Err(UserEnvError::InvalidConfig(msg)) => assert!(msg.contains("invalid_stack")),
            other => panic!("unexpected: {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn test_resolve_duplicate() {
        assert!(
            registry()
                .resolve(&["db".to_string(), "db".to_string()])
                .is_err()
        );
    }

    #[test]
    fn test_descriptors_default_capabilities() {
        let descriptors = registry().descriptors();
        assert_eq!(descriptors.len(), 3);
        assert!(descriptors.iter().all(|d| !d.checkpoint && !d.lease));
    }
}
