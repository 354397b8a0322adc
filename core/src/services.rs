//! Service registry.
//!
//! A service maps a server port to a display name, color, and notes. The
//! mapping is purely descriptive: it drives UI grouping and statistics and
//! tags finalized connections with their service port.

use crate::error::CoreError;
use crate::storage::{collections, DocumentStore, Filter};

use std::sync::{Arc, RwLock};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A described service port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub port: u16,
    pub name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub notes: String,
}

/// Document shape for persisted services. Deletion is a tombstone because
/// the store contract has no delete operation.
#[derive(Debug, Serialize, Deserialize)]
struct ServiceDoc {
    id: String,
    #[serde(flatten)]
    service: Service,
    #[serde(default)]
    deleted: bool,
}

/// CRUD over the port -> [Service] mapping, persisted to storage.
pub struct ServiceRegistry {
    services: RwLock<IndexMap<u16, Service>>,
    storage: Arc<dyn DocumentStore>,
}

impl ServiceRegistry {
    /// Loads persisted services, skipping tombstoned entries.
    pub fn load(storage: Arc<dyn DocumentStore>) -> Result<Self, CoreError> {
        let docs = storage
            .find(collections::SERVICES, &Filter::all(), None, 0, 0)
            .map_err(CoreError::storage)?;
        let mut services = IndexMap::new();
        for doc in docs {
            match serde_json::from_value::<ServiceDoc>(doc) {
                Ok(doc) if !doc.deleted => {
                    services.insert(doc.service.port, doc.service);
                }
                Ok(_) => {}
                Err(e) => log::error!("Skipping undecodable service document: {}", e),
            }
        }
        log::info!("Loaded {} services", services.len());
        Ok(ServiceRegistry {
            services: RwLock::new(services),
            storage,
        })
    }

    /// Point-in-time snapshot of all services.
    pub fn get_services(&self) -> Vec<Service> {
        self.services.read().unwrap().values().cloned().collect()
    }

    /// Returns the service configured for `port`, if any.
    pub fn get_service(&self, port: u16) -> Option<Service> {
        self.services.read().unwrap().get(&port).cloned()
    }

    /// Returns `true` if a service is configured for `port`.
    pub fn is_registered(&self, port: u16) -> bool {
        self.services.read().unwrap().contains_key(&port)
    }

    /// Creates or replaces the service at its port.
    pub fn set_service(&self, service: Service) -> Result<Service, CoreError> {
        let mut services = self.services.write().unwrap();
        let id = service.port.to_string();
        let doc = ServiceDoc {
            id: id.clone(),
            service: service.clone(),
            deleted: false,
        };
        let value = serde_json::to_value(&doc).map_err(CoreError::storage)?;
        let existed = self
            .storage
            .update(collections::SERVICES, &id, value.clone())
            .map_err(CoreError::storage)?;
        if !existed {
            self.storage
                .insert(collections::SERVICES, value)
                .map_err(CoreError::storage)?;
        }
        services.insert(service.port, service.clone());
        log::info!("Set service {:?} on port {}", service.name, service.port);
        Ok(service)
    }

    /// Removes the service at `port` (tombstoned in storage).
    pub fn delete_service(&self, port: u16) -> Result<(), CoreError> {
        let mut services = self.services.write().unwrap();
        if services.shift_remove(&port).is_none() {
            return Err(CoreError::ServiceNotFound(port));
        }
        self.storage
            .update(
                collections::SERVICES,
                &port.to_string(),
                serde_json::json!({ "deleted": true }),
            )
            .map_err(CoreError::storage)?;
        log::info!("Deleted service on port {}", port);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn registry() -> ServiceRegistry {
        ServiceRegistry::load(Arc::new(MemoryStore::new())).unwrap()
    }

    fn http() -> Service {
        Service {
            port: 80,
            name: "http".to_string(),
            color: "#3949ab".to_string(),
            notes: String::new(),
        }
    }

    #[test]
    fn core_service_set_and_get() {
        let registry = registry();
        registry.set_service(http()).unwrap();
        assert!(registry.is_registered(80));
        assert_eq!(registry.get_service(80).unwrap().name, "http");
    }

    #[test]
    fn core_service_delete_tombstones() {
        let storage: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let registry = ServiceRegistry::load(Arc::clone(&storage)).unwrap();
        registry.set_service(http()).unwrap();
        registry.delete_service(80).unwrap();
        assert!(!registry.is_registered(80));
        assert!(matches!(
            registry.delete_service(80),
            Err(CoreError::ServiceNotFound(80))
        ));

        // deleted services stay gone across reload
        let reloaded = ServiceRegistry::load(storage).unwrap();
        assert!(!reloaded.is_registered(80));
    }
}
