use std::collections::HashMap;

use log::warn;

use crate::bitset::IndexBitset;
use crate::factory::FactoryId;
use crate::types::{InstanceId, InternalIndex, ProtocolId, INVALID_INTERNAL_INDEX};

use super::error::HandleError;
use super::object_handle::{ObjectHandle, ObjectHandleAllocator};
use super::record::{
    DependentRelation, DependentSchedulingHint, LifecycleState, ObjectRecord,
};

// SubObjectInsertionOrder
/// Where a new subobject lands in its root's ordered child list. The list
/// order is the remote construction order, so authoring intent survives the
/// wire.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum SubObjectInsertionOrder {
    /// Append after the existing siblings.
    None,
    /// The subobject must be created before its siblings on the remote side.
    InsertAtStart,
    /// Interleave directly after the named sibling.
    ReplicateWith(ObjectHandle),
}

pub struct RegisterParams {
    pub instance: InstanceId,
    pub protocol_id: ProtocolId,
    pub factory_id: FactoryId,
    /// Pre-assigned deterministic handle, if the object is statically known
    /// on all peers. Dynamic objects get a fresh handle from the allocator.
    pub static_handle: Option<ObjectHandle>,
    pub needs_pre_update: bool,
}

// HandleRegistry
/// Owns the mapping between stable ObjectHandles and dense InternalIndices,
/// plus the three relations over that index space: parent-of (root and
/// ordered subobjects), depends-on, and the status bitsets the scheduler
/// reads. Index 0 is reserved invalid.
pub struct HandleRegistry {
    records: Vec<Option<ObjectRecord>>,
    handle_to_index: HashMap<ObjectHandle, InternalIndex>,
    instance_to_index: HashMap<InstanceId, InternalIndex>,
    free_indices: Vec<InternalIndex>,
    allocator: ObjectHandleAllocator,

    assigned: IndexBitset,
    sub_object_bits: IndexBitset,
    with_dependents: IndexBitset,
    want_to_be_dormant: IndexBitset,
    dormant_pending_flush: IndexBitset,
    needs_pre_update_bits: IndexBitset,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            // slot 0 stays empty forever
            records: vec![None],
            handle_to_index: HashMap::new(),
            instance_to_index: HashMap::new(),
            free_indices: Vec::new(),
            allocator: ObjectHandleAllocator::new(),
            assigned: IndexBitset::new(),
            sub_object_bits: IndexBitset::new(),
            with_dependents: IndexBitset::new(),
            want_to_be_dormant: IndexBitset::new(),
            dormant_pending_flush: IndexBitset::new(),
            needs_pre_update_bits: IndexBitset::new(),
        }
    }

    /// One past the highest index ever assigned. Bitsets snapshotted against
    /// this ceiling cannot be invalidated by registrations later in the tick.
    pub fn index_ceiling(&self) -> u32 {
        self.records.len() as u32
    }

    // Registration

    /// Registers an instance for replication. Registering the same instance
    /// twice is idempotent and returns the existing assignment.
    pub fn register(
        &mut self,
        params: RegisterParams,
    ) -> Result<(ObjectHandle, InternalIndex), HandleError> {
        if let Some(existing) = self.instance_to_index.get(&params.instance) {
            let record = self.records[*existing as usize]
                .as_ref()
                .expect("instance map points at live record");
            return Ok((record.handle, *existing));
        }

        let handle = match params.static_handle {
            Some(static_handle) => {
                if self.handle_to_index.contains_key(&static_handle) {
                    return Err(HandleError::StaticHandleCollision {
                        handle: static_handle,
                    });
                }
                static_handle
            }
            None => self.allocator.allocate_dynamic_handle(),
        };

        let index = match self.free_indices.pop() {
            Some(recycled) => recycled,
            None => {
                self.records.push(None);
                (self.records.len() - 1) as InternalIndex
            }
        };

        let mut record = ObjectRecord::new(
            handle,
            params.instance,
            params.protocol_id,
            params.factory_id,
        );
        record.needs_pre_update = params.needs_pre_update;

        self.records[index as usize] = Some(record);
        self.handle_to_index.insert(handle, index);
        self.instance_to_index.insert(params.instance, index);
        self.assigned.set_bit(index);
        if params.needs_pre_update {
            self.needs_pre_update_bits.set_bit(index);
        }

        Ok((handle, index))
    }

    /// Allocates a deterministic handle for callers that register static
    /// objects through [`RegisterParams::static_handle`].
    pub fn allocate_static_handle(&mut self) -> ObjectHandle {
        self.allocator.allocate_static_handle()
    }

    // Lookup

    pub fn lookup(&self, handle: ObjectHandle) -> Option<InternalIndex> {
        self.handle_to_index.get(&handle).copied()
    }

    pub fn index_of_instance(&self, instance: InstanceId) -> Option<InternalIndex> {
        self.instance_to_index.get(&instance).copied()
    }

    pub fn record(&self, index: InternalIndex) -> Option<&ObjectRecord> {
        self.records.get(index as usize)?.as_ref()
    }

    pub fn record_mut(&mut self, index: InternalIndex) -> Option<&mut ObjectRecord> {
        self.records.get_mut(index as usize)?.as_mut()
    }

    pub fn handle_of(&self, index: InternalIndex) -> Option<ObjectHandle> {
        self.record(index).map(|record| record.handle)
    }

    pub fn root_index_of(&self, index: InternalIndex) -> InternalIndex {
        self.record(index)
            .map(|record| record.root_index)
            .unwrap_or(INVALID_INTERNAL_INDEX)
    }

    pub fn sub_objects(&self, index: InternalIndex) -> &[InternalIndex] {
        self.record(index)
            .map(|record| record.sub_objects.as_slice())
            .unwrap_or(&[])
    }

    // Subobject relation

    /// Attaches `sub_object` to `root`. Re-attaching under the same root is
    /// idempotent; under a different root it is an error.
    pub fn add_sub_object(
        &mut self,
        root: ObjectHandle,
        sub_object: ObjectHandle,
        insertion_order: SubObjectInsertionOrder,
        destroy_with_owner: bool,
    ) -> Result<(), HandleError> {
        if root == sub_object {
            return Err(HandleError::SelfRelation { handle: root });
        }

        let root_index = match self.lookup(root) {
            Some(index) if self.record(index).is_some_and(|r| r.lifecycle == LifecycleState::Active) => index,
            _ => {
                return Err(HandleError::InvalidOwner {
                    owner: root,
                    sub_object,
                })
            }
        };
        let sub_index = match self.lookup(sub_object) {
            Some(index) => index,
            None => {
                return Err(HandleError::InvalidOwner {
                    owner: root,
                    sub_object,
                })
            }
        };

        let existing_root = self.root_index_of(sub_index);
        if existing_root != INVALID_INTERNAL_INDEX {
            if existing_root == root_index {
                return Ok(());
            }
            let existing_root_handle = self
                .handle_of(existing_root)
                .unwrap_or(ObjectHandle::INVALID);
            return Err(HandleError::SubObjectOfOtherRoot {
                sub_object,
                existing_root: existing_root_handle,
                requested_root: root,
            });
        }

        let position = {
            let siblings = &self
                .records[root_index as usize]
                .as_ref()
                .expect("root record checked above")
                .sub_objects;
            match insertion_order {
                SubObjectInsertionOrder::None => siblings.len(),
                SubObjectInsertionOrder::InsertAtStart => 0,
                SubObjectInsertionOrder::ReplicateWith(sibling) => {
                    match self
                        .lookup(sibling)
                        .and_then(|sibling_index| {
                            siblings.iter().position(|entry| *entry == sibling_index)
                        }) {
                        Some(found) => found + 1,
                        None => {
                            warn!(
                                "add_sub_object: ReplicateWith sibling {:?} not found under {:?}, appending {:?}",
                                sibling, root, sub_object
                            );
                            siblings.len()
                        }
                    }
                }
            }
        };

        {
            let root_record = self.records[root_index as usize]
                .as_mut()
                .expect("root record checked above");
            root_record.sub_objects.insert(position, sub_index);
        }
        {
            let sub_record = self.records[sub_index as usize]
                .as_mut()
                .expect("sub record checked above");
            sub_record.root_index = root_index;
            sub_record.destroy_with_owner = destroy_with_owner;
        }
        self.sub_object_bits.set_bit(sub_index);

        // new subobjects inherit the root's pending dormancy
        let root_dormant = self.want_to_be_dormant.get_bit(root_index);
        if root_dormant {
            self.want_to_be_dormant.set_bit(sub_index);
        } else {
            self.want_to_be_dormant.clear_bit(sub_index);
        }

        Ok(())
    }

    pub fn remove_sub_object(&mut self, sub_index: InternalIndex) {
        let root_index = self.root_index_of(sub_index);
        if root_index != INVALID_INTERNAL_INDEX {
            if let Some(root_record) = self.records[root_index as usize].as_mut() {
                root_record.sub_objects.retain(|entry| *entry != sub_index);
            }
        }
        if let Some(sub_record) = self.records[sub_index as usize].as_mut() {
            sub_record.root_index = INVALID_INTERNAL_INDEX;
        }
        self.sub_object_bits.clear_bit(sub_index);
    }

    // Dependent relation

    pub fn add_dependent(
        &mut self,
        parent: ObjectHandle,
        dependent: ObjectHandle,
        hint: DependentSchedulingHint,
    ) -> Result<(), HandleError> {
        if parent == dependent {
            return Err(HandleError::SelfRelation { handle: parent });
        }
        let (Some(parent_index), Some(dependent_index)) =
            (self.lookup(parent), self.lookup(dependent))
        else {
            return Err(HandleError::InvalidDependentRelation { parent, dependent });
        };

        let parent_record = self.records[parent_index as usize]
            .as_mut()
            .expect("handle map points at live record");
        if parent_record
            .dependents
            .iter()
            .any(|relation| relation.index == dependent_index)
        {
            return Ok(());
        }
        parent_record.dependents.push(DependentRelation {
            index: dependent_index,
            hint,
        });

        let dependent_record = self.records[dependent_index as usize]
            .as_mut()
            .expect("handle map points at live record");
        dependent_record.dependent_on.push(DependentRelation {
            index: parent_index,
            hint,
        });

        self.with_dependents.set_bit(parent_index);
        Ok(())
    }

    pub fn remove_dependent(&mut self, parent: ObjectHandle, dependent: ObjectHandle) {
        let (Some(parent_index), Some(dependent_index)) =
            (self.lookup(parent), self.lookup(dependent))
        else {
            return;
        };
        if let Some(parent_record) = self.records[parent_index as usize].as_mut() {
            parent_record
                .dependents
                .retain(|relation| relation.index != dependent_index);
            if parent_record.dependents.is_empty() {
                self.with_dependents.clear_bit(parent_index);
            }
        }
        if let Some(dependent_record) = self.records[dependent_index as usize].as_mut() {
            dependent_record
                .dependent_on
                .retain(|relation| relation.index != parent_index);
        }
    }

    /// Walks the dependency graph below `index`. Cycles are not expected in
    /// this relation; the walk mirrors how the poll list is expanded.
    pub fn for_all_dependents_recursive(
        &self,
        index: InternalIndex,
        func: &mut impl FnMut(InternalIndex),
    ) {
        let Some(record) = self.record(index) else {
            return;
        };
        for relation in &record.dependents {
            func(relation.index);
            self.for_all_dependents_recursive(relation.index, func);
        }
    }

    // Dormancy

    pub fn set_want_to_be_dormant(&mut self, index: InternalIndex, dormant: bool) {
        if self.record(index).is_none() {
            return;
        }
        if dormant {
            self.want_to_be_dormant.set_bit(index);
        } else {
            self.want_to_be_dormant.clear_bit(index);
            self.dormant_pending_flush.clear_bit(index);
        }
    }

    /// One-shot request to poll a dormant object despite its dormancy. The
    /// bit is cleared by the bridge once the object was in scope for a tick.
    pub fn request_dormancy_flush(&mut self, index: InternalIndex) {
        if self.record(index).is_some() && self.want_to_be_dormant.get_bit(index) {
            self.dormant_pending_flush.set_bit(index);
        }
    }

    // Bitset views

    pub fn assigned_bits(&self) -> &IndexBitset {
        &self.assigned
    }

    pub fn sub_object_bits(&self) -> &IndexBitset {
        &self.sub_object_bits
    }

    pub fn with_dependents_bits(&self) -> &IndexBitset {
        &self.with_dependents
    }

    pub fn want_to_be_dormant_bits(&self) -> &IndexBitset {
        &self.want_to_be_dormant
    }

    pub fn dormant_pending_flush_bits(&self) -> &IndexBitset {
        &self.dormant_pending_flush
    }

    pub fn clear_dormancy_flush_requests(&mut self, served: &IndexBitset) {
        self.dormant_pending_flush.and_not(served);
    }

    pub fn needs_pre_update_bits(&self) -> &IndexBitset {
        &self.needs_pre_update_bits
    }

    // Teardown

    /// Releases an index for reuse. The caller drives the lifecycle state
    /// machine; this only unlinks relations and frees the slot.
    pub fn free_index(&mut self, index: InternalIndex) {
        let Some(record) = self.records.get_mut(index as usize).and_then(Option::take) else {
            return;
        };

        self.handle_to_index.remove(&record.handle);
        self.instance_to_index.remove(&record.instance);

        // unlink from the owning root, if any
        if record.root_index != INVALID_INTERNAL_INDEX {
            if let Some(root_record) = self.records[record.root_index as usize].as_mut() {
                root_record.sub_objects.retain(|entry| *entry != index);
            }
        }
        // orphan any children still alive (e.g. awaiting peer acks), so a
        // recycled slot is never mistaken for their root
        for sub_index in &record.sub_objects {
            if let Some(sub_record) = self.records[*sub_index as usize].as_mut() {
                sub_record.root_index = INVALID_INTERNAL_INDEX;
            }
            self.sub_object_bits.clear_bit(*sub_index);
        }
        // unlink dependency edges in both directions
        for relation in &record.dependents {
            if let Some(dependent_record) = self.records[relation.index as usize].as_mut() {
                dependent_record
                    .dependent_on
                    .retain(|entry| entry.index != index);
            }
        }
        for relation in &record.dependent_on {
            if let Some(parent_record) = self.records[relation.index as usize].as_mut() {
                parent_record
                    .dependents
                    .retain(|entry| entry.index != index);
                if parent_record.dependents.is_empty() {
                    self.with_dependents.clear_bit(relation.index);
                }
            }
        }

        self.assigned.clear_bit(index);
        self.sub_object_bits.clear_bit(index);
        self.with_dependents.clear_bit(index);
        self.want_to_be_dormant.clear_bit(index);
        self.dormant_pending_flush.clear_bit(index);
        self.needs_pre_update_bits.clear_bit(index);
        self.free_indices.push(index);
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
