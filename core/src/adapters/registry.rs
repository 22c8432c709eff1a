//! Thread-safe global registry for provider adapters.
//!
//! Built-in adapters are registered on first access; custom adapters can be
//! registered at runtime and replace same-named entries.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::RwLock;

use super::ProviderAdapter;
use crate::error::GatewayErr;
use crate::error::Result;

static ADAPTER_REGISTRY: LazyLock<AdapterRegistry> = LazyLock::new(|| {
    let registry = AdapterRegistry::new();

    registry.register(Arc::new(super::AnthropicAdapter::new()));
    registry.register(Arc::new(super::OpenAiChatAdapter::new()));
    registry.register(Arc::new(super::OpenAiResponsesAdapter::new()));
    registry.register(Arc::new(super::GeminiAdapter::new()));

    registry
});

struct AdapterRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn ProviderAdapter>>>,
}

impl AdapterRegistry {
    fn new() -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, adapter: Arc<dyn ProviderAdapter>) {
        let name = adapter.name().to_string();
        self.adapters
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name, adapter);
    }

    fn get(&self, name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    fn list(&self) -> Vec<String> {
        self.adapters
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

/// Register a custom adapter, replacing any same-named entry.
pub fn register_adapter(adapter: Arc<dyn ProviderAdapter>) {
    ADAPTER_REGISTRY.register(adapter);
}

/// Get an adapter by name.
pub fn get_adapter(name: &str) -> Result<Arc<dyn ProviderAdapter>> {
    ADAPTER_REGISTRY
        .get(name)
        .ok_or_else(|| GatewayErr::UnknownAdapter(name.to_string()))
}

/// Names of all registered adapters.
pub fn list_adapters() -> Vec<String> {
    ADAPTER_REGISTRY.list()
}
