use crate::factory::FactoryId;
use crate::types::{InstanceId, InternalIndex, ProtocolId, INVALID_INTERNAL_INDEX};

use super::object_handle::ObjectHandle;

// LifecycleState
/// Replication lifecycle of a single record. `Active` is the steady state;
/// everything after it belongs to the end-replication state machine.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum LifecycleState {
    Active,
    /// Tear-off path: the closing sample has already been taken.
    FinalSampleTaken,
    /// Flush path: the closing sample is queued for the next poll pass.
    FinalSampleQueued,
    /// No longer polled or scoped; peers may still hold a reference.
    DetachedLocally,
    /// Detached, waiting for every referencing peer to acknowledge.
    PendingPeerAck,
    Destroyed,
}

impl LifecycleState {
    /// Records past this point no longer accept state changes.
    pub fn has_detached(&self) -> bool {
        matches!(
            self,
            LifecycleState::DetachedLocally
                | LifecycleState::PendingPeerAck
                | LifecycleState::Destroyed
        )
    }

    pub fn accepts_polling(&self) -> bool {
        matches!(
            self,
            LifecycleState::Active
                | LifecycleState::FinalSampleTaken
                | LifecycleState::FinalSampleQueued
        )
    }
}

// DependentSchedulingHint
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum DependentSchedulingHint {
    Default,
    /// The dependent must be serialized before its parent on creation.
    ScheduleBeforeParent,
    /// The dependent is only scoped to a peer while the parent is.
    ParentMustBeRelevant,
}

#[derive(Clone, Copy, Debug)]
pub struct DependentRelation {
    pub index: InternalIndex,
    pub hint: DependentSchedulingHint,
}

// ObjectRecord
/// Per-InternalIndex bookkeeping for one replicated object.
#[derive(Debug)]
pub struct ObjectRecord {
    pub handle: ObjectHandle,
    pub instance: InstanceId,
    pub protocol_id: ProtocolId,
    pub factory_id: FactoryId,
    /// Owning root's index; INVALID_INTERNAL_INDEX if this record is a root.
    pub root_index: InternalIndex,
    pub lifecycle: LifecycleState,
    pub needs_pre_update: bool,
    /// Destroy the remote instance when the owning root ends replication.
    pub destroy_with_owner: bool,
    pub torn_off: bool,
    pub pending_end_replication: bool,
    /// Ordered children; only populated on roots. Order is the remote
    /// construction order.
    pub sub_objects: Vec<InternalIndex>,
    /// Objects whose scheduling/visibility is gated by this record.
    pub dependents: Vec<DependentRelation>,
    /// Parents this record depends on, with the hint they were added with.
    pub dependent_on: Vec<DependentRelation>,
}

impl ObjectRecord {
    pub fn new(
        handle: ObjectHandle,
        instance: InstanceId,
        protocol_id: ProtocolId,
        factory_id: FactoryId,
    ) -> Self {
        Self {
            handle,
            instance,
            protocol_id,
            factory_id,
            root_index: INVALID_INTERNAL_INDEX,
            lifecycle: LifecycleState::Active,
            needs_pre_update: false,
            destroy_with_owner: true,
            torn_off: false,
            pending_end_replication: false,
            sub_objects: Vec::new(),
            dependents: Vec::new(),
            dependent_on: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.root_index == INVALID_INTERNAL_INDEX
    }

    pub fn is_sub_object(&self) -> bool {
        !self.is_root()
    }
}
