//! Handler registry keyed by `(origin plugin, action)`.

use crate::bus::MessageContext;
use crate::error::LinkError;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// A registered message handler.
pub type LinkHandler = Arc<dyn Fn(&MessageContext<'_>) -> Result<(), LinkError> + Send + Sync>;

/// Registry key. Plugin names compare case-insensitively, actions exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerKey {
    plugin: String,
    action: String,
}

impl HandlerKey {
    pub fn new(plugin: &str, action: &str) -> Self {
        Self {
            plugin: plugin.to_lowercase(),
            action: action.to_string(),
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn action(&self) -> &str {
        &self.action
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.plugin, self.action)
    }
}

/// At most one handler per key; the last registration wins.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<HandlerKey, LinkHandler>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler`, replacing any previous handler for the same key.
    pub fn register(&self, plugin: &str, action: &str, handler: LinkHandler) {
        let key = HandlerKey::new(plugin, action);
        if self.handlers.insert(key.clone(), handler).is_some() {
            debug!("🔁 Replaced link handler for {}", key);
        } else {
            info!("📝 Registered link handler for {}", key);
        }
    }

    /// Removes one handler. Returns whether it existed.
    pub fn unregister(&self, plugin: &str, action: &str) -> bool {
        self.handlers.remove(&HandlerKey::new(plugin, action)).is_some()
    }

    /// Removes every handler of a plugin. Returns how many were removed.
    pub fn unregister_plugin(&self, plugin: &str) -> usize {
        let plugin = plugin.to_lowercase();
        // Counted inside retain: concurrent registrations change len() meanwhile.
        let mut removed = 0;
        self.handlers.retain(|key, _| {
            let keep = key.plugin != plugin;
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            info!("🗑️ Removed {} link handlers for plugin {}", removed, plugin);
        }
        removed
    }

    /// Looks up a handler; the returned clone outlives the map guard.
    pub fn lookup(&self, plugin: &str, action: &str) -> Option<LinkHandler> {
        self.handlers
            .get(&HandlerKey::new(plugin, action))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered keys, sorted for stable output.
    pub fn keys(&self) -> Vec<HandlerKey> {
        let mut keys: Vec<_> = self.handlers.iter().map(|entry| entry.key().clone()).collect();
        keys.sort_by(|a, b| (&a.plugin, &a.action).cmp(&(&b.plugin, &b.action)));
        keys
    }
}
