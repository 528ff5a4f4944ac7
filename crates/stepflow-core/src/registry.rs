// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Adapter registry.
//!
//! Maps action strings to adapters. Resolution tries the adapter named
//! after the action's namespace first; when that adapter does not claim
//! the action, every registered adapter is scanned in registration order
//! and the first claimant wins. The registry is populated before the
//! engine starts and read-only afterwards.

use crate::adapter::Adapter;
use crate::error::{EngineError, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

/// Registry owning adapter instances for the engine's lifetime.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: DashMap<String, Arc<dyn Adapter>>,
    order: RwLock<Vec<String>>,
}

impl AdapterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter; refuses duplicate names.
    pub fn register(&self, adapter: Arc<dyn Adapter>) -> Result<()> {
        let name = adapter.name().to_string();
        if self.adapters.contains_key(&name) {
            return Err(EngineError::AdapterFailed {
                adapter: name.clone(),
                action: "register".to_string(),
                message: format!("adapter '{name}' is already registered"),
                code: Some("DUPLICATE_ADAPTER".to_string()),
            });
        }
        info!(adapter = %name, version = %adapter.version(), "Registered adapter");
        self.adapters.insert(name.clone(), adapter);
        self.order.write().push(name);
        Ok(())
    }

    /// Names of all registered adapters, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.order.read().clone()
    }

    /// Looks up an adapter by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(name).map(|entry| entry.value().clone())
    }

    /// Resolves the adapter for an action string.
    pub fn resolve(&self, action: &str) -> Result<Arc<dyn Adapter>> {
        let namespace = action.split('.').next().unwrap_or(action);
        if let Some(adapter) = self.get(namespace) {
            if adapter.supports(action) {
                return Ok(adapter);
            }
        }
        for name in self.order.read().iter() {
            if let Some(adapter) = self.get(name) {
                if adapter.supports(action) {
                    debug!(adapter = %name, action = %action, "Resolved action via scan");
                    return Ok(adapter);
                }
            }
        }
        Err(EngineError::UnknownAdapter {
            action: action.to_string(),
            registered: self.names(),
        })
    }

    /// Runs every adapter's `initialize` hook, in registration order.
    pub async fn initialize_all(&self) -> Result<()> {
        for name in self.names() {
            if let Some(adapter) = self.get(&name) {
                adapter.initialize().await?;
            }
        }
        Ok(())
    }

    /// Runs every adapter's `cleanup` hook, in registration order.
    pub async fn cleanup_all(&self) -> Result<()> {
        for name in self.names() {
            if let Some(adapter) = self.get(&name) {
                adapter.cleanup().await?;
            }
        }
        Ok(())
    }
}
