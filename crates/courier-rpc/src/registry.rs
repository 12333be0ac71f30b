//! ---
//! courier_section: "04-rpc-correlation"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Request/reply correlation over durable queues."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{HandlerError, RegistryError, RpcError};

/// Service-side implementation of one or more actions.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Handle `action` with its JSON payload.
    async fn handle(&self, action: &str, payload: Value) -> Result<Value, HandlerError>;
}

#[async_trait]
impl<F, Fut> ActionHandler for F
where
    F: Fn(String, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, action: &str, payload: Value) -> Result<Value, HandlerError> {
        (self)(action.to_owned(), payload).await
    }
}

/// Shared handler pointer stored by the registry.
pub type HandlerPtr = Arc<dyn ActionHandler>;

/// Collects handlers during service startup.
#[derive(Default)]
pub struct ActionRegistryBuilder {
    handlers: HashMap<String, HandlerPtr>,
}

impl ActionRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Registering the same action twice is an error.
    pub fn register<H>(&mut self, action: impl Into<String>, handler: H) -> Result<&mut Self, RegistryError>
    where
        H: ActionHandler + 'static,
    {
        self.register_shared(action, Arc::new(handler))
    }

    /// Register an already shared handler, e.g. one object serving several actions.
    pub fn register_shared(
        &mut self,
        action: impl Into<String>,
        handler: HandlerPtr,
    ) -> Result<&mut Self, RegistryError> {
        let action = action.into();
        if action.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.handlers.contains_key(&action) {
            return Err(RegistryError::Duplicate(action));
        }
        self.handlers.insert(action, handler);
        Ok(self)
    }

    /// Freeze the registry.
    pub fn build(self) -> ActionRegistry {
        ActionRegistry {
            handlers: Arc::new(self.handlers),
        }
    }
}

/// Immutable action-name to handler table. Cheap to clone.
#[derive(Clone)]
pub struct ActionRegistry {
    handlers: Arc<HashMap<String, HandlerPtr>>,
}

impl ActionRegistry {
    pub fn builder() -> ActionRegistryBuilder {
        ActionRegistryBuilder::new()
    }

    /// Look up the handler for `action`.
    pub fn resolve(&self, action: &str) -> Result<HandlerPtr, RpcError> {
        self.handlers
            .get(action)
            .cloned()
            .ok_or_else(|| RpcError::NoSuchAction(action.to_owned()))
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    /// Registered action names, sorted.
    pub fn actions(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.actions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn echo(_action: String, payload: Value) -> Result<Value, HandlerError> {
        Ok(payload)
    }

    struct UserService;

    #[async_trait]
    impl ActionHandler for UserService {
        async fn handle(&self, action: &str, payload: Value) -> Result<Value, HandlerError> {
            match action {
                "user/signin" => Ok(json!({ "user": payload, "token": "t" })),
                other => Err(HandlerError::domain(format!("unsupported action {other}"))),
            }
        }
    }

    #[tokio::test]
    async fn resolves_registered_handlers() {
        let users: HandlerPtr = Arc::new(UserService);
        let mut builder = ActionRegistry::builder();
        builder
            .register("system/echo", echo)
            .unwrap()
            .register_shared("user/signin", users.clone())
            .unwrap()
            .register_shared("user/signup", users)
            .unwrap();
        let registry = builder.build();

        assert_eq!(registry.actions(), vec!["system/echo", "user/signin", "user/signup"]);
        let handler = registry.resolve("user/signin").unwrap();
        let reply = handler.handle("user/signin", json!({ "email": "a@b.com" })).await.unwrap();
        assert_eq!(reply["token"], "t");

        let echo = registry.resolve("system/echo").unwrap();
        assert_eq!(echo.handle("system/echo", json!(7)).await.unwrap(), json!(7));
    }

    #[test]
    fn duplicate_registration_fails_fast() {
        let mut builder = ActionRegistry::builder();
        builder.register("system/echo", echo).unwrap();
        assert_eq!(
            builder.register("system/echo", echo).err(),
            Some(RegistryError::Duplicate("system/echo".into()))
        );
        assert_eq!(
            builder.register("  ", echo).err(),
            Some(RegistryError::EmptyName)
        );
    }

    #[test]
    fn unknown_actions_are_not_found() {
        let registry = ActionRegistry::builder().build();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.resolve("does/not-exist"),
            Err(RpcError::NoSuchAction(name)) if name == "does/not-exist"
        ));
    }
}
