mod error;
mod registry;

pub use error::FactoryError;
pub use registry::{FactoryRegistry, SharedFactoryRegistry};

use std::any::Any;
use std::fmt::Debug;

use crate::handle::ObjectHandle;
use crate::services::{HeaderReader, HeaderWriter};
use crate::types::{InstanceId, PeerId, ProtocolId};

// FactoryId
/// Numeric id a factory is resolved by on the hot path. Assigned at
/// registration time, before any replication system exists.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub struct FactoryId(u8);

impl FactoryId {
    pub fn from_u8(value: u8) -> Self {
        FactoryId(value)
    }

    pub fn to_u8(&self) -> u8 {
        self.0
    }
}

// CreationHeader
/// The minimal self-describing payload a remote peer needs to construct a
/// local mirror before any replicated field arrives (archetype identity,
/// child counts, and the like). Concrete layout belongs to the factory.
pub trait CreationHeader: Any + Send + Debug {
    /// Protocol identifier of the schema the sender serialized with.
    fn protocol_id(&self) -> ProtocolId;

    fn as_any(&self) -> &dyn Any;
}

pub struct HeaderContext {
    pub handle: ObjectHandle,
    pub instance: InstanceId,
    pub protocol_id: ProtocolId,
}

pub struct InstantiationContext {
    pub handle: ObjectHandle,
    pub peer: PeerId,
}

/// Result of instantiating a remote mirror from a header.
pub struct Instantiation {
    pub instance: InstanceId,
    pub needs_post_init: bool,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum DestroyReason {
    Destroy,
    TearOff,
    /// End replication but leave the instance alive.
    DoNotDestroy,
}

pub struct DestroyContext {
    pub instance: InstanceId,
    /// Set when the destroyed object is a subobject; the owning root's
    /// instance, so the factory can notify it.
    pub root_instance: Option<InstanceId>,
    pub reason: DestroyReason,
}

/// Optional spatial hint for downstream prioritization.
#[derive(Debug, Clone, Copy)]
pub struct WorldInfo {
    pub position: [f32; 3],
    pub cull_distance: f32,
}

// ObjectFactory
/// Pluggable strategy that knows how to construct and destroy a concrete
/// remote mirror of an object, and to serialize the creation header needed
/// to do so. Implemented externally per object kind; registered before any
/// replication system starts.
pub trait ObjectFactory: Send {
    /// Stable key the schema service computes protocol ids from.
    fn type_key(&self) -> &'static str;

    fn create_header(&self, ctx: &HeaderContext) -> Result<Box<dyn CreationHeader>, FactoryError>;

    fn write_header(
        &self,
        header: &dyn CreationHeader,
        writer: &mut dyn HeaderWriter,
    ) -> Result<(), FactoryError>;

    fn read_header(
        &self,
        reader: &mut dyn HeaderReader,
    ) -> Result<Box<dyn CreationHeader>, FactoryError>;

    fn instantiate_from_header(
        &mut self,
        ctx: &InstantiationContext,
        header: &dyn CreationHeader,
    ) -> Result<Instantiation, FactoryError>;

    /// Called after instantiation when the factory asked for it.
    fn post_init(&mut self, _ctx: &InstantiationContext, _instance: InstanceId) {}

    fn destroy_instance(&mut self, ctx: &DestroyContext);

    /// Optional spatial hint; None when the object has no world presence.
    fn world_info(&self, _instance: InstanceId) -> Option<WorldInfo> {
        None
    }

    /// Notification hooks fired on a root's factory when one of its
    /// subobjects is created or destroyed through replication.
    fn sub_object_created_from_replication(&mut self, _root: InstanceId, _sub_object: InstanceId) {}

    fn sub_object_destroyed_from_replication(&mut self, _root: InstanceId, _ctx: &DestroyContext) {}
}
