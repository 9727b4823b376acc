//! # Mirror Core
//! Server-authoritative object replication engine. Maps externally stable
//! object handles onto a dense internal index space, tracks dirtiness locally
//! and across threads, schedules polling by per-object frequency, and drives
//! the replication lifecycle from creation headers through teardown
//! acknowledgement. Serialization, transport and the host world stay behind
//! collaborator traits.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

mod bitset;
mod bridge;
mod dirty;
mod factory;
mod handle;
mod poll;
mod services;
mod types;

pub use bitset::IndexBitset;
pub use bridge::{
    BridgeError, EndReplicationFlags, EndReplicationMode, PeerErrorCallback, PeerScope,
    PeerScopes, PendingEndReplication, PreUpdateFn, ReplicationBridge, ReplicationBridgeConfig,
    RootSpawnParams, SubObjectRequests, SubObjectSpawnParams,
};
pub use dirty::{DirtyTracker, GlobalDirtyError, GlobalDirtyPoller, GlobalDirtyRegistry};
pub use factory::{
    CreationHeader, DestroyContext, DestroyReason, FactoryError, FactoryId, FactoryRegistry,
    HeaderContext, Instantiation, InstantiationContext, ObjectFactory, SharedFactoryRegistry,
    WorldInfo,
};
pub use handle::{
    DependentRelation, DependentSchedulingHint, HandleError, HandleRegistry, LifecycleState,
    ObjectHandle, ObjectHandleAllocator, ObjectRecord, RegisterParams, SubObjectInsertionOrder,
};
pub use poll::PollFrequencyLimiter;
pub use services::{
    HeaderReader, HeaderWriter, InstanceHost, QuantizedState, SchemaService, SerializationError,
    StateQuantizer, TransportSink,
};
pub use types::{
    InstanceId, InternalIndex, PeerId, ProtocolId, Tick, INVALID_INTERNAL_INDEX,
};
