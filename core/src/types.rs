pub type Tick = u16;
pub type PeerId = u32;
pub type ProtocolId = u64;

/// Dense array index assigned on registration. Index 0 is reserved as
/// "invalid"; a freed index may be recycled once its record is fully
/// destroyed and no peer still references it.
pub type InternalIndex = u32;

pub const INVALID_INTERNAL_INDEX: InternalIndex = 0;

// InstanceId
/// Opaque key for an in-memory object instance owned by the host
/// application. The replication engine never dereferences instances
/// directly; it hands the key back through the collaborator traits.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub struct InstanceId(u64);

impl InstanceId {
    pub fn from_u64(value: u64) -> Self {
        InstanceId(value)
    }

    pub fn to_u64(&self) -> u64 {
        self.0
    }
}
