mod error;
mod lifecycle;
mod scope;

pub use error::BridgeError;
pub use lifecycle::{EndReplicationFlags, EndReplicationMode, PendingEndReplication};
pub use scope::{PeerScope, PeerScopes};

use std::collections::HashMap;

use log::{error, info, warn};

use crate::bitset::IndexBitset;
use crate::dirty::{DirtyTracker, GlobalDirtyPoller, GlobalDirtyRegistry};
use crate::factory::{
    DestroyContext, DestroyReason, FactoryId, HeaderContext, Instantiation,
    InstantiationContext, SharedFactoryRegistry,
};
use crate::handle::{
    DependentSchedulingHint, HandleRegistry, LifecycleState, ObjectHandle, RegisterParams,
    SubObjectInsertionOrder,
};
use crate::poll::PollFrequencyLimiter;
use crate::services::{
    HeaderReader, HeaderWriter, InstanceHost, QuantizedState, SchemaService, StateQuantizer,
    TransportSink,
};
use crate::types::{InstanceId, InternalIndex, PeerId, ProtocolId, INVALID_INTERNAL_INDEX};

/// Per-object pre-sample hook, invoked in batches for cache efficiency.
/// Hooks may request new subobjects through the collector; the bridge
/// applies those requests before dirtiness is finalized, so creation and
/// first state delivery land in the same tick.
pub type PreUpdateFn = Box<dyn FnMut(&[InstanceId], &mut SubObjectRequests)>;

/// Per-connection error callback, fired for recoverable per-object errors
/// such as protocol mismatches.
pub type PeerErrorCallback = Box<dyn FnMut(PeerId, &BridgeError)>;

// ReplicationBridgeConfig
pub struct ReplicationBridgeConfig {
    pub use_frequency_based_polling: bool,
    pub use_dormancy_to_filter_polling: bool,
    pub enable_force_update: bool,
    /// Allows a hard Destroy to override an object already pending
    /// tear-off/flush acknowledgement.
    pub allow_destroy_override: bool,
    pub pre_update_batch_size: usize,
}

impl Default for ReplicationBridgeConfig {
    fn default() -> Self {
        Self {
            use_frequency_based_polling: true,
            use_dormancy_to_filter_polling: true,
            enable_force_update: true,
            allow_destroy_override: false,
            pre_update_batch_size: 128,
        }
    }
}

// Spawn parameter blocks

pub struct RootSpawnParams {
    pub instance: InstanceId,
    pub protocol_id: ProtocolId,
    pub factory_id: FactoryId,
    /// Deterministic handle for statically-known objects; None spawns a
    /// dynamic handle.
    pub static_handle: Option<ObjectHandle>,
    pub needs_pre_update: bool,
    /// Frames between forced samples; 0 samples every dirty tick.
    pub poll_period: u16,
}

pub struct SubObjectSpawnParams {
    pub instance: InstanceId,
    pub protocol_id: ProtocolId,
    pub factory_id: FactoryId,
    pub insertion_order: SubObjectInsertionOrder,
    pub destroy_with_owner: bool,
    pub needs_pre_update: bool,
}

/// Collector handed to pre-update hooks for spawning subobjects mid-tick.
#[derive(Default)]
pub struct SubObjectRequests {
    requests: Vec<(ObjectHandle, SubObjectSpawnParams)>,
}

impl SubObjectRequests {
    pub fn new() -> Self {
        Self {
            requests: Vec::new(),
        }
    }

    pub fn spawn(&mut self, root: ObjectHandle, params: SubObjectSpawnParams) {
        self.requests.push((root, params));
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

// ReplicationBridge
/// Orchestrates one replication tick: build the poll list, run pre-update
/// hooks, finalize dirtiness, reconcile subobjects created mid-tick into
/// per-peer scope, sample and quantize object state, and hand the result to
/// the transport seam. Also owns the lifecycle state machine for ending
/// replication with Destroy / TearOff / Flush semantics.
pub struct ReplicationBridge {
    config: ReplicationBridgeConfig,
    registry: HandleRegistry,
    dirty: DirtyTracker,
    global_dirty: GlobalDirtyRegistry,
    global_poller: GlobalDirtyPoller,
    limiter: PollFrequencyLimiter,
    factories: SharedFactoryRegistry,
    scopes: PeerScopes,
    /// Change-mask cache: the latest quantized state per internal index.
    quantized_cache: Vec<Option<QuantizedState>>,
    pre_update_fn: Option<PreUpdateFn>,
    peer_error_callback: Option<PeerErrorCallback>,
    /// Stop requests deferred because they arrived mid-tick.
    pending_end: Vec<PendingEndReplication>,
    /// Flush-mode teardowns waiting for their closing sample.
    flush_queue: HashMap<InternalIndex, EndReplicationFlags>,
    /// Assigned-index snapshot taken when the tick starts; anything assigned
    /// afterwards is a mid-tick creation to reconcile.
    scopable_snapshot: IndexBitset,
    in_send_update: bool,
    receiving: bool,
}

impl ReplicationBridge {
    pub fn new(
        config: ReplicationBridgeConfig,
        factories: SharedFactoryRegistry,
        global_dirty: &GlobalDirtyRegistry,
    ) -> Result<Self, BridgeError> {
        {
            let guard = factories
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !guard.is_sealed() {
                return Err(BridgeError::FactoryRegistryNotSealed);
            }
        }
        let global_poller = global_dirty.register_poller()?;

        Ok(Self {
            config,
            registry: HandleRegistry::new(),
            dirty: DirtyTracker::new(),
            global_dirty: global_dirty.clone(),
            global_poller,
            limiter: PollFrequencyLimiter::new(),
            factories,
            scopes: PeerScopes::new(),
            quantized_cache: Vec::new(),
            pre_update_fn: None,
            peer_error_callback: None,
            pending_end: Vec::new(),
            flush_queue: HashMap::new(),
            scopable_snapshot: IndexBitset::new(),
            in_send_update: false,
            receiving: false,
        })
    }

    pub fn set_pre_update_fn(&mut self, func: PreUpdateFn) {
        self.pre_update_fn = Some(func);
    }

    pub fn set_peer_error_callback(&mut self, callback: PeerErrorCallback) {
        self.peer_error_callback = Some(callback);
    }

    pub fn global_dirty(&self) -> &GlobalDirtyRegistry {
        &self.global_dirty
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    // StartReplicating

    pub fn start_replicating_root(
        &mut self,
        params: RootSpawnParams,
    ) -> Result<ObjectHandle, BridgeError> {
        if self.in_send_update {
            return Err(BridgeError::StartBlockedDuringSendUpdate);
        }

        let fresh = self.registry.index_of_instance(params.instance).is_none();
        let (handle, index) = self.registry.register(RegisterParams {
            instance: params.instance,
            protocol_id: params.protocol_id,
            factory_id: params.factory_id,
            static_handle: params.static_handle,
            needs_pre_update: params.needs_pre_update,
        })?;
        if fresh {
            self.on_index_assigned(index);
        }
        self.limiter.set_poll_period(index, params.poll_period);

        info!(
            "start_replicating_root: {:?} at index {} (period {})",
            handle, index, params.poll_period
        );
        Ok(handle)
    }

    pub fn start_replicating_sub_object(
        &mut self,
        root: ObjectHandle,
        params: SubObjectSpawnParams,
    ) -> Result<ObjectHandle, BridgeError> {
        let fresh = self.registry.index_of_instance(params.instance).is_none();
        let (handle, index) = self.registry.register(RegisterParams {
            instance: params.instance,
            protocol_id: params.protocol_id,
            factory_id: params.factory_id,
            static_handle: None,
            needs_pre_update: params.needs_pre_update,
        })?;
        if fresh {
            self.on_index_assigned(index);
        }

        if let Err(err) = self.registry.add_sub_object(
            root,
            handle,
            params.insertion_order,
            params.destroy_with_owner,
        ) {
            // roll a fresh registration back so no orphan root survives
            if fresh {
                self.registry.free_index(index);
            }
            return Err(err.into());
        }

        let root_index = self
            .registry
            .lookup(root)
            .expect("add_sub_object succeeded, root must be live");
        self.limiter.set_poll_with_object(root_index, index);
        // fresh subobjects carry their full creation state
        self.dirty.mark_dirty(index);

        info!(
            "start_replicating_sub_object: {:?} under {:?} at index {}",
            handle, root, index
        );
        Ok(handle)
    }

    fn on_index_assigned(&mut self, index: InternalIndex) {
        let ceiling = self.registry.index_ceiling();
        self.limiter.on_index_ceiling_increased(ceiling);
        if self.quantized_cache.len() < ceiling as usize {
            self.quantized_cache.resize_with(ceiling as usize, || None);
        }
        // a recycled slot must not inherit the previous tenant's state
        self.dirty.clear_index(index);
        self.quantized_cache[index as usize] = None;
    }

    // Relations and scheduling knobs

    pub fn add_dependent_object(
        &mut self,
        parent: ObjectHandle,
        dependent: ObjectHandle,
        hint: DependentSchedulingHint,
    ) -> Result<(), BridgeError> {
        self.registry.add_dependent(parent, dependent, hint)?;
        Ok(())
    }

    /// Dependent whose scope membership requires the parent to be relevant
    /// to the peer.
    pub fn add_dependent_object_with_parent_relevancy(
        &mut self,
        parent: ObjectHandle,
        dependent: ObjectHandle,
    ) -> Result<(), BridgeError> {
        self.add_dependent_object(
            parent,
            dependent,
            DependentSchedulingHint::ParentMustBeRelevant,
        )
    }

    pub fn remove_dependent_object(&mut self, parent: ObjectHandle, dependent: ObjectHandle) {
        self.registry.remove_dependent(parent, dependent);
    }

    pub fn set_poll_period(&mut self, handle: ObjectHandle, frames: u16) {
        if let Some(index) = self.registry.lookup(handle) {
            self.limiter.set_poll_period(index, frames);
        }
    }

    pub fn mark_dirty(&mut self, handle: ObjectHandle) {
        if let Some(index) = self.registry.lookup(handle) {
            self.dirty.mark_dirty(index);
        }
    }

    pub fn force_update(&mut self, handle: ObjectHandle) {
        if let Some(index) = self.registry.lookup(handle) {
            self.dirty.force_update(index);
        }
    }

    pub fn set_dormant(&mut self, handle: ObjectHandle, dormant: bool) {
        if let Some(index) = self.registry.lookup(handle) {
            self.registry.set_want_to_be_dormant(index, dormant);
            for sub_index in self.registry.sub_objects(index).to_vec() {
                self.registry.set_want_to_be_dormant(sub_index, dormant);
            }
        }
    }

    /// One-shot request to deliver a dormant object's pending state.
    pub fn flush_dormancy(&mut self, handle: ObjectHandle) {
        if let Some(index) = self.registry.lookup(handle) {
            self.registry.request_dormancy_flush(index);
            for sub_index in self.registry.sub_objects(index).to_vec() {
                self.registry.request_dormancy_flush(sub_index);
            }
        }
    }

    // Peers

    pub fn add_peer(&mut self, peer: PeerId) {
        self.scopes.add_peer(peer);
    }

    pub fn remove_peer(&mut self, peer: PeerId) {
        let Some(removed) = self.scopes.remove_peer(peer) else {
            return;
        };
        // a departing peer implicitly acknowledges everything it still held
        let mut orphaned: Vec<InternalIndex> = Vec::new();
        removed.pending_ack_bits().for_each_set_bit(|index| {
            orphaned.push(index);
        });
        for index in orphaned {
            if !self.scopes.index_has_pending_refs(index)
                && self
                    .registry
                    .record(index)
                    .is_some_and(|record| record.lifecycle == LifecycleState::PendingPeerAck)
            {
                self.finalize_destroy(index);
            }
        }
    }

    /// Downstream filtering hands the bridge the roots each peer should see;
    /// subobject expansion and dependent gating happen here.
    pub fn set_peer_scope(&mut self, peer: PeerId, roots: &[ObjectHandle]) {
        self.scopes.set_scope_roots(peer, roots, &self.registry);
    }

    pub fn peer_has_in_scope(&self, peer: PeerId, handle: ObjectHandle) -> bool {
        let Some(index) = self.registry.lookup(handle) else {
            return false;
        };
        self.scopes
            .peer(peer)
            .is_some_and(|scope| scope.contains(index))
    }

    // Tick pipeline

    /// Runs one full send-side tick.
    pub fn pre_send_update(
        &mut self,
        quantizer: &mut dyn StateQuantizer,
        transport: &mut dyn TransportSink,
    ) -> Result<(), BridgeError> {
        self.update_handles_pending_end_replication(quantizer);

        self.in_send_update = true;
        self.dirty.absorb_global(&self.global_poller);

        // Snapshot before pre-update hooks run: objects created during the
        // hooks must not retroactively alter the list being iterated.
        let ceiling = self.registry.index_ceiling();
        self.scopable_snapshot.copy_from(self.registry.assigned_bits());

        let mut poll_list = IndexBitset::with_bit_capacity(ceiling);
        self.build_poll_list(&mut poll_list);

        self.run_pre_update(&poll_list);
        poll_list.truncate_bits(ceiling);

        self.dirty.update_and_lock();

        self.reconcile_new_sub_objects(&mut poll_list);

        let sampled = self.poll_and_quantize(&poll_list, quantizer);

        let send_peers = self.scopes.peers_needing_send_pass(&sampled);
        if !send_peers.is_empty() {
            transport.queue_send_pass(&send_peers);
        }

        self.dirty.reconcile(&sampled);
        self.finalize_flush_samples(&sampled);

        self.in_send_update = false;
        Ok(())
    }

    /// Out-of-band poll of a single handle, e.g. "flush now before
    /// destroying".
    pub fn pre_send_update_single_handle(
        &mut self,
        handle: ObjectHandle,
        quantizer: &mut dyn StateQuantizer,
    ) -> Result<(), BridgeError> {
        let Some(index) = self.registry.lookup(handle) else {
            return Ok(());
        };
        self.run_pre_update_single(index);
        // a failed sample keeps its marks for the next pass
        if self.quantize_single(index, quantizer) {
            self.dirty.clear_index(index);
        }
        Ok(())
    }

    fn build_poll_list(&mut self, out: &mut IndexBitset) {
        let Self {
            config,
            registry,
            dirty,
            limiter,
            scopes,
            ..
        } = self;

        let mut relevant = IndexBitset::with_bit_capacity(registry.index_ceiling());
        scopes.relevant_union(&mut relevant);
        relevant.and(registry.assigned_bits());

        // Marks from this frame and marks carried over from filtered ticks
        // are equally eligible for sampling.
        let mut pending_dirty = IndexBitset::with_bit_capacity(relevant.bit_capacity());
        pending_dirty.copy_from(dirty.dirty_this_frame_bits());
        pending_dirty.or(dirty.accumulated_bits());

        if config.use_frequency_based_polling {
            let no_forced = IndexBitset::new();
            let forced: &IndexBitset = if config.enable_force_update {
                dirty.force_update_bits()
            } else {
                &no_forced
            };
            limiter.update(&relevant, &pending_dirty, forced, out);
        } else {
            out.copy_from(&relevant);
        }

        // Mask off objects pending dormancy; flush requests override for one
        // tick and schedule like a forced update so groups stay intact.
        if config.use_dormancy_to_filter_polling {
            out.and_not(registry.want_to_be_dormant_bits());

            let mut served = IndexBitset::new();
            let force_bits = dirty.force_update_bits_mut();
            registry
                .dormant_pending_flush_bits()
                .for_each_set_bit_and(&relevant, |index| {
                    out.set_bit(index);
                    force_bits.set_bit(index);
                    served.set_bit(index);
                });
            // only requests that were actually in scope this tick are served
            registry.clear_dormancy_flush_requests(&served);
        }

        // Owners and subobjects must be serialized atomically within one
        // tick, so propagate selection through the group both ways, then
        // expand through the dependency graph.

        // a selected subobject pulls the owning root into the same pass
        let selected_subs = out.clone();
        selected_subs.for_each_set_bit_and(registry.sub_object_bits(), |index| {
            let root = registry.root_index_of(index);
            if root != INVALID_INTERNAL_INDEX {
                out.set_bit(root);
            }
        });

        // an object about to be sampled drags its recursive dependents along
        let with_dependents_snapshot = out.clone();
        with_dependents_snapshot.for_each_set_bit_and(
            registry.with_dependents_bits(),
            |index| {
                registry.for_all_dependents_recursive(index, &mut |dependent| {
                    out.set_bit(dependent);
                });
            },
        );

        // selected roots force all their subobjects into the same pass
        let root_snapshot = out.clone();
        root_snapshot.for_each_set_bit_and_not(registry.sub_object_bits(), |index| {
            for sub_index in registry.sub_objects(index) {
                out.set_bit(*sub_index);
            }
        });
    }

    fn run_pre_update(&mut self, poll_list: &IndexBitset) {
        let Some(mut hook) = self.pre_update_fn.take() else {
            return;
        };

        let mut requests = SubObjectRequests::new();
        let batch_size = self.config.pre_update_batch_size.max(1);
        let mut batch: Vec<InstanceId> = Vec::with_capacity(batch_size);

        // The hook pass iterates a snapshot: spawn requests are collected
        // and applied afterwards, so the bitsets cannot shift underneath.
        let with_hooks = self.registry.needs_pre_update_bits().clone();
        poll_list.for_each_set_bit_and(&with_hooks, |index| {
            if let Some(record) = self.registry.record(index) {
                batch.push(record.instance);
            }
            if batch.len() == batch_size {
                hook(&batch, &mut requests);
                batch.clear();
            }
        });
        if !batch.is_empty() {
            hook(&batch, &mut requests);
        }

        self.pre_update_fn = Some(hook);
        self.apply_sub_object_requests(requests);
    }

    fn run_pre_update_single(&mut self, index: InternalIndex) {
        let Some(mut hook) = self.pre_update_fn.take() else {
            return;
        };
        let mut requests = SubObjectRequests::new();
        if let Some(record) = self.registry.record(index) {
            if record.needs_pre_update {
                hook(&[record.instance], &mut requests);
            }
        }
        self.pre_update_fn = Some(hook);
        self.apply_sub_object_requests(requests);
    }

    fn apply_sub_object_requests(&mut self, requests: SubObjectRequests) {
        for (root, params) in requests.requests {
            if let Err(err) = self.start_replicating_sub_object(root, params) {
                warn!("pre-update subobject spawn under {:?} failed: {}", root, err);
            }
        }
    }

    fn reconcile_new_sub_objects(&mut self, poll_list: &mut IndexBitset) {
        let mut created: Vec<InternalIndex> = Vec::new();
        self.registry
            .assigned_bits()
            .for_each_set_bit_and_not(&self.scopable_snapshot, |index| {
                created.push(index);
            });

        for index in created {
            let Some(record) = self.registry.record(index) else {
                continue;
            };
            if record.is_root() {
                error!(
                    "object {:?} (index {}) was created as a root after the tick started; only subobjects may appear mid-tick",
                    record.handle, index
                );
                debug_assert!(false, "root created mid-tick");
                continue;
            }
            let root_index = record.root_index;
            poll_list.set_bit(index);
            // creation and first state delivery happen in the same tick
            self.scopes
                .add_sub_object_where_root_in_scope(root_index, index);
        }
    }

    fn poll_and_quantize(
        &mut self,
        poll_list: &IndexBitset,
        quantizer: &mut dyn StateQuantizer,
    ) -> IndexBitset {
        let mut sampled = IndexBitset::with_bit_capacity(self.registry.index_ceiling());

        let mut indices: Vec<InternalIndex> = Vec::new();
        poll_list.for_each_set_bit_and(self.registry.assigned_bits(), |index| {
            indices.push(index);
        });

        for index in indices {
            if self.quantize_single(index, quantizer) {
                sampled.set_bit(index);
            }
        }
        sampled
    }

    fn quantize_single(
        &mut self,
        index: InternalIndex,
        quantizer: &mut dyn StateQuantizer,
    ) -> bool {
        let Some(record) = self.registry.record(index) else {
            return false;
        };
        if !record.lifecycle.accepts_polling() {
            return false;
        }
        let instance = record.instance;
        let handle = record.handle;
        match quantizer.quantize_state(instance, handle) {
            Ok(state) => {
                if self.quantized_cache.len() <= index as usize {
                    self.quantized_cache.resize_with(index as usize + 1, || None);
                }
                self.quantized_cache[index as usize] = Some(state);
                true
            }
            Err(err) => {
                // isolated to this object, never aborts the tick
                warn!("quantize failed for {:?}: {}", handle, err);
                false
            }
        }
    }

    /// Flush-mode teardowns detach once their closing sample was taken, or
    /// once the last peer that could have received it left scope.
    fn finalize_flush_samples(&mut self, sampled: &IndexBitset) {
        let due: Vec<InternalIndex> = self
            .flush_queue
            .keys()
            .copied()
            .filter(|index| sampled.get_bit(*index) || !self.scopes.index_in_any_scope(*index))
            .collect();
        for index in due {
            self.flush_queue.remove(&index);
            self.detach_locally(index);
        }
    }

    pub fn quantized_state(&self, handle: ObjectHandle) -> Option<&QuantizedState> {
        let index = self.registry.lookup(handle)?;
        self.quantized_cache.get(index as usize)?.as_ref()
    }

    // Lifecycle: StopReplicating and friends

    /// Ends replication for `handle`. Requests arriving while the system is
    /// mid-tick are queued and deferred until the current pass completes.
    /// Calling this on an already-destroyed object is a no-op.
    pub fn stop_replicating(
        &mut self,
        handle: ObjectHandle,
        flags: EndReplicationFlags,
        quantizer: &mut dyn StateQuantizer,
    ) -> Result<(), BridgeError> {
        if self.receiving || self.in_send_update {
            self.pending_end.push(PendingEndReplication { handle, flags });
            return Ok(());
        }
        self.stop_replicating_internal(handle, flags, quantizer);
        Ok(())
    }

    /// Drains stop requests deferred from mid-tick. Called at the start of
    /// every tick and after each receive pass.
    pub fn update_handles_pending_end_replication(&mut self, quantizer: &mut dyn StateQuantizer) {
        let pending = std::mem::take(&mut self.pending_end);
        for entry in pending {
            self.stop_replicating_internal(entry.handle, entry.flags, quantizer);
        }
    }

    pub fn begin_receive_update(&mut self) {
        self.receiving = true;
    }

    pub fn end_receive_update(&mut self, quantizer: &mut dyn StateQuantizer) {
        self.receiving = false;
        self.update_handles_pending_end_replication(quantizer);
    }

    fn stop_replicating_internal(
        &mut self,
        handle: ObjectHandle,
        flags: EndReplicationFlags,
        quantizer: &mut dyn StateQuantizer,
    ) {
        let Some(index) = self.registry.lookup(handle) else {
            // already fully destroyed, or never replicated: no-op
            return;
        };
        let Some(record) = self.registry.record(index) else {
            return;
        };

        match record.lifecycle {
            LifecycleState::Destroyed => {}
            LifecycleState::DetachedLocally
            | LifecycleState::PendingPeerAck
            | LifecycleState::FinalSampleTaken
            | LifecycleState::FinalSampleQueued => {
                // second stop on a teardown in flight: no-op unless policy
                // allows escalating to a hard destroy
                if self.config.allow_destroy_override
                    && flags.mode == EndReplicationMode::Destroy
                    && !flags.flush
                {
                    info!("stop_replicating: overriding pending teardown of {:?} with destroy", handle);
                    self.flush_queue.remove(&index);
                    self.finalize_destroy(index);
                }
            }
            LifecycleState::Active => {
                self.end_replication_cascade(index, flags, quantizer);
            }
        }
    }

    fn end_replication_cascade(
        &mut self,
        index: InternalIndex,
        flags: EndReplicationFlags,
        quantizer: &mut dyn StateQuantizer,
    ) {
        // Children first, so their teardown is scoped while the root still
        // exists. DoNotDestroy never reaches dynamically-spawned children.
        let children: Vec<(ObjectHandle, EndReplicationFlags)> = self
            .registry
            .sub_objects(index)
            .iter()
            .filter_map(|sub_index| {
                let sub_record = self.registry.record(*sub_index)?;
                Some((
                    sub_record.handle,
                    flags.for_sub_object(
                        sub_record.destroy_with_owner,
                        sub_record.handle.is_dynamic(),
                    ),
                ))
            })
            .collect();
        for (sub_handle, sub_flags) in children {
            self.stop_replicating_internal(sub_handle, sub_flags, quantizer);
        }

        let has_audience = self.scopes.index_in_any_scope(index);
        let Some(record) = self.registry.record_mut(index) else {
            return;
        };
        record.pending_end_replication = true;
        let handle = record.handle;

        match (flags.mode, flags.flush) {
            (EndReplicationMode::TearOff, _) => {
                // final sample is taken immediately, then the object detaches
                record.torn_off = true;
                record.lifecycle = LifecycleState::FinalSampleTaken;
                self.quantize_single(index, quantizer);
                info!("stop_replicating: tear-off {:?}", handle);
                self.detach_locally(index);
            }
            (EndReplicationMode::Destroy, true) if has_audience => {
                // flush: deliver pending state before detaching
                record.lifecycle = LifecycleState::FinalSampleQueued;
                self.flush_queue.insert(index, flags);
                self.dirty.force_update(index);
                info!("stop_replicating: flush queued for {:?}", handle);
            }
            (EndReplicationMode::Destroy, true) => {
                // no peer can receive the closing sample; detach right away
                info!("stop_replicating: flush for {:?} has no recipients", handle);
                self.detach_locally(index);
            }
            (EndReplicationMode::Destroy, false) | (EndReplicationMode::DoNotDestroy, _) => {
                info!("stop_replicating: detach {:?} ({:?})", handle, flags.mode);
                self.detach_locally(index);
            }
        }
    }

    fn detach_locally(&mut self, index: InternalIndex) {
        if let Some(record) = self.registry.record_mut(index) {
            record.lifecycle = LifecycleState::DetachedLocally;
        }
        let any_refs = self.scopes.begin_tear_down(index);
        if any_refs {
            if let Some(record) = self.registry.record_mut(index) {
                record.lifecycle = LifecycleState::PendingPeerAck;
            }
        } else {
            self.finalize_destroy(index);
        }
    }

    /// A peer's reliable layer confirmed it processed the teardown.
    pub fn on_peer_ack(&mut self, peer: PeerId, handle: ObjectHandle) {
        let Some(index) = self.registry.lookup(handle) else {
            return;
        };
        let all_clear = self.scopes.acknowledge(peer, index);
        if all_clear
            && self
                .registry
                .record(index)
                .is_some_and(|record| record.lifecycle == LifecycleState::PendingPeerAck)
        {
            self.finalize_destroy(index);
        }
    }

    fn finalize_destroy(&mut self, index: InternalIndex) {
        let handle = self.registry.handle_of(index);
        if let Some(record) = self.registry.record_mut(index) {
            record.lifecycle = LifecycleState::Destroyed;
        }
        // children that outlive this root fall back to their own schedule
        for sub_index in self.registry.sub_objects(index).to_vec() {
            self.limiter.clear_poll_with(sub_index);
        }
        self.dirty.clear_index(index);
        self.limiter.clear_index(index);
        self.flush_queue.remove(&index);
        if let Some(slot) = self.quantized_cache.get_mut(index as usize) {
            *slot = None;
        }
        self.scopes.remove_index(index);
        self.registry.free_index(index);
        if let Some(handle) = handle {
            info!("finalize_destroy: {:?} (index {})", handle, index);
        }
    }

    pub fn is_replicating(&self, handle: ObjectHandle) -> bool {
        self.registry.lookup(handle).is_some()
    }

    pub fn lifecycle_of(&self, handle: ObjectHandle) -> Option<LifecycleState> {
        let index = self.registry.lookup(handle)?;
        self.registry.record(index).map(|record| record.lifecycle)
    }

    // Garbage-collection sweep

    /// Detects instances destroyed by the host without going through
    /// [`Self::stop_replicating`] and force-walks them through Destroy.
    /// Peers still holding a live reference must be told, so this is never
    /// silently ignored.
    pub fn prune_stale_objects(
        &mut self,
        host: &dyn InstanceHost,
        quantizer: &mut dyn StateQuantizer,
    ) {
        let mut stale: Vec<ObjectHandle> = Vec::new();
        let assigned = self.registry.assigned_bits().clone();
        assigned.for_each_set_bit(|index| {
            let Some(record) = self.registry.record(index) else {
                return;
            };
            if host.is_alive(record.instance) {
                return;
            }
            warn!(
                "prune_stale_objects: instance {:?} replicated as {:?} was destroyed without notifying the replication system",
                record.instance, record.handle
            );
            if host.is_bound(record.instance) {
                // unbinding a bound instance would corrupt shared
                // change-mask state; cannot be safely cleaned up here
                error!(
                    "prune_stale_objects: stale instance {:?} ({:?}) is still bound",
                    record.instance, record.handle
                );
                debug_assert!(false, "bound instance destroyed without ending replication");
                return;
            }
            stale.push(record.handle);
        });

        for handle in stale {
            self.stop_replicating_internal(handle, EndReplicationFlags::destroy(), quantizer);
        }
    }

    // Creation headers and the receive-side path

    /// Builds and writes the creation header for a replicated object so a
    /// remote peer can construct its mirror.
    pub fn write_creation_header(
        &self,
        handle: ObjectHandle,
        writer: &mut dyn HeaderWriter,
    ) -> Result<(), BridgeError> {
        let Some(index) = self.registry.lookup(handle) else {
            return Err(BridgeError::NotReplicating { handle });
        };
        let record = self
            .registry
            .record(index)
            .ok_or(BridgeError::NotReplicating { handle })?;

        let factories = self
            .factories
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let factory = factories
            .get(record.factory_id)
            .ok_or(crate::factory::FactoryError::UnknownFactory {
                id: record.factory_id,
            })?;
        let header = factory.create_header(&HeaderContext {
            handle,
            instance: record.instance,
            protocol_id: record.protocol_id,
        })?;
        factory.write_header(header.as_ref(), writer)?;
        Ok(())
    }

    /// Receive-side: reads a creation header and instantiates a local
    /// mirror. A protocol mismatch between the declared and locally computed
    /// schema id refuses creation and notifies the peer; the session
    /// continues for all other objects.
    pub fn read_and_instantiate(
        &mut self,
        peer: PeerId,
        handle: ObjectHandle,
        factory_id: FactoryId,
        reader: &mut dyn HeaderReader,
        schema: &dyn SchemaService,
    ) -> Result<Instantiation, BridgeError> {
        let (header, type_key) = {
            let mut factories = self
                .factories
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let factory = factories
                .get_mut(factory_id)
                .ok_or(crate::factory::FactoryError::UnknownFactory { id: factory_id })?;
            let header = factory.read_header(reader)?;
            (header, factory.type_key())
        };

        let declared = header.protocol_id();
        let computed = schema.compute_protocol_id(type_key);
        if declared != computed {
            let err = BridgeError::ProtocolMismatch {
                peer,
                type_key,
                declared,
                computed,
            };
            error!("{err}");
            if let Some(callback) = self.peer_error_callback.as_mut() {
                callback(peer, &err);
            }
            return Err(err);
        }

        let ctx = InstantiationContext { handle, peer };
        let mut factories = self
            .factories
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let factory = factories
            .get_mut(factory_id)
            .ok_or(crate::factory::FactoryError::UnknownFactory { id: factory_id })?;
        let instantiation = factory.instantiate_from_header(&ctx, header.as_ref())?;
        if instantiation.needs_post_init {
            factory.post_init(&ctx, instantiation.instance);
        }
        Ok(instantiation)
    }

    /// Receive-side teardown of a local mirror: notifies the root's factory
    /// if the object is a subobject, asks the object's own factory to
    /// destroy the instance, then drops the record.
    pub fn destroy_remote(&mut self, handle: ObjectHandle, reason: DestroyReason) {
        let Some(index) = self.registry.lookup(handle) else {
            return;
        };
        let Some(record) = self.registry.record(index) else {
            return;
        };
        let instance = record.instance;
        let factory_id = record.factory_id;
        let root_index = record.root_index;
        let root_info = if root_index != INVALID_INTERNAL_INDEX {
            self.registry
                .record(root_index)
                .map(|root| (root.instance, root.factory_id))
        } else {
            None
        };

        if reason != DestroyReason::DoNotDestroy {
            let ctx = DestroyContext {
                instance,
                root_instance: root_info.map(|(root_instance, _)| root_instance),
                reason,
            };
            let mut factories = self
                .factories
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some((root_instance, root_factory_id)) = root_info {
                if let Some(root_factory) = factories.get_mut(root_factory_id) {
                    root_factory.sub_object_destroyed_from_replication(root_instance, &ctx);
                }
            }
            if let Some(factory) = factories.get_mut(factory_id) {
                factory.destroy_instance(&ctx);
            } else {
                error!("destroy_remote: unknown factory {:?} for {:?}", factory_id, handle);
            }
        }

        self.finalize_destroy(index);
    }
}
