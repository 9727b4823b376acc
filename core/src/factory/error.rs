use thiserror::Error;

use crate::services::SerializationError;
use crate::types::ProtocolId;

use super::FactoryId;

#[derive(Debug, Error)]
pub enum FactoryError {
    /// Factory registration is only legal before any replication system
    /// exists. Hard precondition, not recoverable.
    #[error("Cannot register factory {type_key} - the registry is sealed")]
    RegistrySealed { type_key: &'static str },

    /// Two factories cannot claim the same type key.
    #[error("Factory type key {type_key} is already registered")]
    DuplicateTypeKey { type_key: &'static str },

    /// A record referenced a factory id the registry does not know.
    #[error("Unknown factory id {id:?}")]
    UnknownFactory { id: FactoryId },

    /// The factory could not build a creation header for the object.
    #[error("Failed to create header: {reason}")]
    HeaderCreationFailed { reason: String },

    /// The factory refused to instantiate a mirror from the header.
    #[error("Failed to instantiate from header (declared protocol {declared:#x}): {reason}")]
    InstantiationFailed {
        declared: ProtocolId,
        reason: String,
    },

    #[error(transparent)]
    Serialization(#[from] SerializationError),
}
