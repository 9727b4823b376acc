use std::any::Any;
use std::sync::{Arc, Mutex};

use mirror_core::{
    CreationHeader, DestroyContext, DestroyReason, FactoryError, HeaderContext, HeaderReader,
    HeaderWriter, Instantiation, InstantiationContext, InstanceId, ObjectFactory, ObjectHandle,
    ProtocolId,
};

pub const TEST_TYPE_KEY: &str = "test_object";

/// Deterministic schema fingerprint, shared between the factory and the
/// schema service so the happy path always agrees.
pub fn test_protocol_id(type_key: &str) -> ProtocolId {
    type_key
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |hash, byte| {
            (hash ^ byte as u64).wrapping_mul(0x0000_0100_0000_01b3)
        })
}

#[derive(Debug)]
pub struct TestHeader {
    pub protocol_id: ProtocolId,
    pub seed: u64,
}

impl CreationHeader for TestHeader {
    fn protocol_id(&self) -> ProtocolId {
        self.protocol_id
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Everything the factory was asked to do, observable from the test after
/// the registry has been sealed and shared.
#[derive(Default)]
pub struct FactoryEvents {
    pub instantiated: Vec<(InstanceId, ObjectHandle)>,
    pub post_initialized: Vec<InstanceId>,
    pub destroyed: Vec<(InstanceId, DestroyReason)>,
    pub sub_objects_destroyed: Vec<(InstanceId, InstanceId)>,
}

pub type SharedFactoryEvents = Arc<Mutex<FactoryEvents>>;

// TestObjectFactory
pub struct TestObjectFactory {
    type_key: &'static str,
    next_remote_instance: u64,
    events: SharedFactoryEvents,
}

impl TestObjectFactory {
    pub fn new(type_key: &'static str, events: SharedFactoryEvents) -> Self {
        Self {
            type_key,
            next_remote_instance: 0,
            events,
        }
    }
}

impl ObjectFactory for TestObjectFactory {
    fn type_key(&self) -> &'static str {
        self.type_key
    }

    fn create_header(&self, ctx: &HeaderContext) -> Result<Box<dyn CreationHeader>, FactoryError> {
        Ok(Box::new(TestHeader {
            protocol_id: ctx.protocol_id,
            seed: ctx.instance.to_u64(),
        }))
    }

    fn write_header(
        &self,
        header: &dyn CreationHeader,
        writer: &mut dyn HeaderWriter,
    ) -> Result<(), FactoryError> {
        let header = header
            .as_any()
            .downcast_ref::<TestHeader>()
            .ok_or_else(|| FactoryError::HeaderCreationFailed {
                reason: "unexpected header type".to_string(),
            })?;
        writer.write_u64(header.protocol_id)?;
        writer.write_u64(header.seed)?;
        Ok(())
    }

    fn read_header(
        &self,
        reader: &mut dyn HeaderReader,
    ) -> Result<Box<dyn CreationHeader>, FactoryError> {
        Ok(Box::new(TestHeader {
            protocol_id: reader.read_u64()?,
            seed: reader.read_u64()?,
        }))
    }

    fn instantiate_from_header(
        &mut self,
        ctx: &InstantiationContext,
        header: &dyn CreationHeader,
    ) -> Result<Instantiation, FactoryError> {
        let header = header
            .as_any()
            .downcast_ref::<TestHeader>()
            .ok_or_else(|| FactoryError::InstantiationFailed {
                declared: 0,
                reason: "unexpected header type".to_string(),
            })?;
        self.next_remote_instance += 1;
        // remote mirrors live in their own id range, derived from the seed
        let instance =
            InstanceId::from_u64(0x4000_0000_0000_0000 | (header.seed << 16) | self.next_remote_instance);
        self.events
            .lock()
            .unwrap()
            .instantiated
            .push((instance, ctx.handle));
        Ok(Instantiation {
            instance,
            needs_post_init: true,
        })
    }

    fn post_init(&mut self, _ctx: &InstantiationContext, instance: InstanceId) {
        self.events.lock().unwrap().post_initialized.push(instance);
    }

    fn destroy_instance(&mut self, ctx: &DestroyContext) {
        self.events
            .lock()
            .unwrap()
            .destroyed
            .push((ctx.instance, ctx.reason));
    }

    fn sub_object_destroyed_from_replication(&mut self, root: InstanceId, ctx: &DestroyContext) {
        self.events
            .lock()
            .unwrap()
            .sub_objects_destroyed
            .push((root, ctx.instance));
    }
}
