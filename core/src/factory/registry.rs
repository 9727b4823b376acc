use std::sync::{Arc, Mutex};

use log::info;

/// Registry handle shared between replication systems once sealed.
pub type SharedFactoryRegistry = Arc<Mutex<FactoryRegistry>>;

use super::error::FactoryError;
use super::{FactoryId, ObjectFactory};

struct RegisteredFactory {
    type_key: &'static str,
    factory: Box<dyn ObjectFactory>,
}

// FactoryRegistry
/// Fixed dispatch table of object-kind strategies. Factories are registered
/// at startup, then the registry is sealed (by [`Self::into_shared`]) and
/// resolved by numeric id from then on; no name lookups happen on the hot
/// path. Registration after sealing is rejected outright.
pub struct FactoryRegistry {
    factories: Vec<RegisteredFactory>,
    sealed: bool,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
            sealed: false,
        }
    }

    pub fn register_factory(
        &mut self,
        factory: Box<dyn ObjectFactory>,
    ) -> Result<FactoryId, FactoryError> {
        let type_key = factory.type_key();
        if self.sealed {
            return Err(FactoryError::RegistrySealed { type_key });
        }
        if self
            .factories
            .iter()
            .any(|registered| registered.type_key == type_key)
        {
            return Err(FactoryError::DuplicateTypeKey { type_key });
        }

        let id = FactoryId::from_u8(self.factories.len() as u8);
        info!("FactoryRegistry: registered factory {} as {:?}", type_key, id);
        self.factories.push(RegisteredFactory { type_key, factory });
        Ok(id)
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Seals the registry and makes it shareable across replication systems.
    pub fn into_shared(mut self) -> SharedFactoryRegistry {
        self.seal();
        Arc::new(Mutex::new(self))
    }

    pub fn get_mut(&mut self, id: FactoryId) -> Option<&mut dyn ObjectFactory> {
        // match, not map: the closure form fails lifetime inference on the
        // &mut dyn reborrow
        match self.factories.get_mut(id.to_u8() as usize) {
            Some(registered) => Some(registered.factory.as_mut()),
            None => None,
        }
    }

    pub fn get(&self, id: FactoryId) -> Option<&dyn ObjectFactory> {
        self.factories
            .get(id.to_u8() as usize)
            .map(|registered| registered.factory.as_ref())
    }

    pub fn type_key_of(&self, id: FactoryId) -> Option<&'static str> {
        self.factories
            .get(id.to_u8() as usize)
            .map(|registered| registered.type_key)
    }

    pub fn id_for_type_key(&self, type_key: &str) -> Option<FactoryId> {
        self.factories
            .iter()
            .position(|registered| registered.type_key == type_key)
            .map(|position| FactoryId::from_u8(position as u8))
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl Default for FactoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}
