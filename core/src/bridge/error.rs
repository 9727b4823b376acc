use thiserror::Error;

use crate::dirty::GlobalDirtyError;
use crate::factory::FactoryError;
use crate::handle::{HandleError, ObjectHandle};
use crate::services::SerializationError;
use crate::types::{PeerId, ProtocolId};

#[derive(Debug, Error)]
pub enum BridgeError {
    /// The receiver's computed schema id disagrees with the sender's
    /// declared id. Fatal to that object's instantiation, non-fatal to the
    /// session; the object is refused creation and the peer is notified.
    #[error("Protocol mismatch for type {type_key} from peer {peer}: declared {declared:#x}, computed {computed:#x}")]
    ProtocolMismatch {
        peer: PeerId,
        type_key: &'static str,
        declared: ProtocolId,
        computed: ProtocolId,
    },

    /// Root objects cannot start replicating during the send update; only
    /// pre-update hooks may create subobjects then.
    #[error("Cannot start replicating a root object during the send update")]
    StartBlockedDuringSendUpdate,

    /// Replication systems require a sealed factory registry; registration
    /// is only legal before any system exists.
    #[error("Factory registry must be sealed before creating a replication system")]
    FactoryRegistryNotSealed,

    #[error("Unknown peer {peer}")]
    UnknownPeer { peer: PeerId },

    #[error("Object {handle:?} is not replicating")]
    NotReplicating { handle: ObjectHandle },

    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error(transparent)]
    Factory(#[from] FactoryError),

    #[error(transparent)]
    GlobalDirty(#[from] GlobalDirtyError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),
}
