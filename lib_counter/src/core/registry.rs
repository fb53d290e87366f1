//! # Registry
//!
//! The ordered list of `(subscription name, handler)` pairs the bus connector
//! must keep alive. Recovery replays it front to back, so registration order
//! is preserved across reconnects.
//!
//! The list sits behind an async mutex. Whoever holds the guard (a `register`
//! call binding one subscription, or the supervisor replaying all of them) is
//! the only one touching subscriptions, so a registration racing a recovery
//! is realized exactly once.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use crate::core::connector::MessageHandler;

/// One named subscription and its processing function.
#[derive(Clone)]
pub struct Registration {
    /// Subscription (queue / consumer group) name.
    pub name: String,
    /// Invoked once per delivery.
    pub handler: Arc<dyn MessageHandler>,
}

impl Registration {
    /// Pairs a subscription name with its handler.
    pub fn new(name: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Registration list owned by one connector for its lifetime.
#[derive(Default)]
pub struct Registry {
    entries: Mutex<Vec<Registration>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes exclusive access to the list.
    pub async fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            entries: self.entries.lock().await,
        }
    }

    /// Registered names, in registration order.
    pub async fn names(&self) -> Vec<String> {
        self.entries.lock().await.iter().map(|r| r.name.clone()).collect()
    }
}

/// Exclusive view of the registration list.
pub struct RegistryGuard<'a> {
    entries: MutexGuard<'a, Vec<Registration>>,
}

impl RegistryGuard<'_> {
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|r| r.name == name)
    }

    /// Appends at the end; replay order follows.
    pub fn push(&mut self, registration: Registration) {
        self.entries.push(registration);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Registration> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
