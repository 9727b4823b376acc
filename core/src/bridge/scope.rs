use std::collections::HashMap;

use log::warn;

use crate::bitset::IndexBitset;
use crate::handle::{DependentSchedulingHint, HandleRegistry, ObjectHandle};
use crate::types::{InternalIndex, PeerId};

// PeerScope
/// One remote peer's view: the set of objects it is currently eligible to
/// receive updates for, plus the tear-down references it has not yet
/// acknowledged.
pub struct PeerScope {
    in_scope: IndexBitset,
    pending_ack: IndexBitset,
}

impl PeerScope {
    fn new() -> Self {
        Self {
            in_scope: IndexBitset::new(),
            pending_ack: IndexBitset::new(),
        }
    }

    pub fn contains(&self, index: InternalIndex) -> bool {
        self.in_scope.get_bit(index)
    }

    pub fn has_pending_ack(&self, index: InternalIndex) -> bool {
        self.pending_ack.get_bit(index)
    }

    pub fn in_scope_bits(&self) -> &IndexBitset {
        &self.in_scope
    }

    pub fn pending_ack_bits(&self) -> &IndexBitset {
        &self.pending_ack
    }
}

// PeerScopes
/// Scope bookkeeping for every connected peer. Downstream filtering decides
/// which roots a peer wants; this expands roots to their subobjects, gates
/// dependents whose parent must be relevant, and tracks outstanding
/// tear-down references until every peer has acknowledged.
pub struct PeerScopes {
    peers: HashMap<PeerId, PeerScope>,
}

impl PeerScopes {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    pub fn add_peer(&mut self, peer: PeerId) {
        self.peers.entry(peer).or_insert_with(PeerScope::new);
    }

    pub fn remove_peer(&mut self, peer: PeerId) -> Option<PeerScope> {
        self.peers.remove(&peer)
    }

    pub fn has_peer(&self, peer: PeerId) -> bool {
        self.peers.contains_key(&peer)
    }

    pub fn peer(&self, peer: PeerId) -> Option<&PeerScope> {
        self.peers.get(&peer)
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers.keys().copied()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Replaces a peer's scope with the given roots, expanded to their
    /// subobjects. Dependents flagged ParentMustBeRelevant are masked out
    /// while none of their parents made the cut.
    pub fn set_scope_roots(
        &mut self,
        peer: PeerId,
        roots: &[ObjectHandle],
        registry: &HandleRegistry,
    ) {
        let Some(scope) = self.peers.get_mut(&peer) else {
            warn!("set_scope_roots: unknown peer {peer}");
            return;
        };

        let mut desired = IndexBitset::with_bit_capacity(registry.index_ceiling());
        for root in roots {
            let Some(index) = registry.lookup(*root) else {
                continue;
            };
            let Some(record) = registry.record(index) else {
                continue;
            };
            if record.lifecycle.has_detached() {
                continue;
            }
            desired.set_bit(index);
            for sub_index in registry.sub_objects(index) {
                if registry
                    .record(*sub_index)
                    .is_some_and(|sub| !sub.lifecycle.has_detached())
                {
                    desired.set_bit(*sub_index);
                }
            }
        }

        // Gate dependents whose parent must be relevant. Removing one
        // dependent can invalidate another further down a chain, so iterate
        // to a fixpoint.
        loop {
            let mut removed_any = false;
            let snapshot = desired.clone();
            snapshot.for_each_set_bit(|index| {
                let Some(record) = registry.record(index) else {
                    return;
                };
                let gated = record
                    .dependent_on
                    .iter()
                    .filter(|relation| relation.hint == DependentSchedulingHint::ParentMustBeRelevant)
                    .collect::<Vec<_>>();
                if gated.is_empty() {
                    return;
                }
                let any_parent_in_scope = gated
                    .iter()
                    .any(|relation| desired.get_bit(relation.index));
                if !any_parent_in_scope {
                    desired.clear_bit(index);
                    removed_any = true;
                }
            });
            if !removed_any {
                break;
            }
        }

        scope.in_scope = desired;
    }

    /// Adds one subobject to every peer that already has its root in scope.
    /// Used when a subobject appears mid-tick so creation and first state
    /// delivery happen in the same tick.
    pub fn add_sub_object_where_root_in_scope(
        &mut self,
        root_index: InternalIndex,
        sub_index: InternalIndex,
    ) {
        for scope in self.peers.values_mut() {
            if scope.in_scope.get_bit(root_index) {
                scope.in_scope.set_bit(sub_index);
            }
        }
    }

    /// ORs every peer's in-scope set into `out`.
    pub fn relevant_union(&self, out: &mut IndexBitset) {
        for scope in self.peers.values() {
            out.or(&scope.in_scope);
        }
    }

    /// Moves an index out of every peer's scope into that peer's
    /// pending-ack set. Returns true if any peer still held it.
    pub fn begin_tear_down(&mut self, index: InternalIndex) -> bool {
        let mut any_refs = false;
        for scope in self.peers.values_mut() {
            if scope.in_scope.get_bit(index) {
                scope.in_scope.clear_bit(index);
                scope.pending_ack.set_bit(index);
                any_refs = true;
            }
        }
        any_refs
    }

    /// Records one peer's acknowledgement. Returns true when no peer holds
    /// an outstanding reference anymore.
    pub fn acknowledge(&mut self, peer: PeerId, index: InternalIndex) -> bool {
        if let Some(scope) = self.peers.get_mut(&peer) {
            scope.pending_ack.clear_bit(index);
        }
        !self.index_has_pending_refs(index)
    }

    /// True while at least one peer has the index in scope.
    pub fn index_in_any_scope(&self, index: InternalIndex) -> bool {
        self.peers
            .values()
            .any(|scope| scope.in_scope.get_bit(index))
    }

    pub fn index_has_pending_refs(&self, index: InternalIndex) -> bool {
        self.peers
            .values()
            .any(|scope| scope.pending_ack.get_bit(index))
    }

    /// Drops every trace of an index, scope and pending references alike.
    pub fn remove_index(&mut self, index: InternalIndex) {
        for scope in self.peers.values_mut() {
            scope.in_scope.clear_bit(index);
            scope.pending_ack.clear_bit(index);
        }
    }

    /// Peers whose scope intersects the sampled set and therefore need a
    /// send pass this tick.
    pub fn peers_needing_send_pass(&self, sampled: &IndexBitset) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, scope)| scope.in_scope.intersects(sampled))
            .map(|(peer, _)| *peer)
            .collect();
        peers.sort_unstable();
        peers
    }
}

impl Default for PeerScopes {
    fn default() -> Self {
        Self::new()
    }
}
