use thiserror::Error;

use crate::types::{InstanceId, PeerId, ProtocolId};

/// Failure inside a collaborator service (serialization, quantization).
/// Always isolated to the object being processed, never fatal to the tick.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct SerializationError(pub String);

// QuantizedState
/// Transmission-ready snapshot of one object's state: a per-field change
/// mask plus the quantized payload. Produced by the serialization service;
/// this crate treats both parts as opaque.
#[derive(Debug, Clone, Default)]
pub struct QuantizedState {
    pub change_mask: Vec<u64>,
    pub payload: Vec<u8>,
}

// StateQuantizer
/// Serialization service seam: samples live instance state into a
/// [`QuantizedState`]. Implemented outside this crate.
pub trait StateQuantizer {
    fn quantize_state(
        &mut self,
        instance: InstanceId,
        handle: crate::handle::ObjectHandle,
    ) -> Result<QuantizedState, SerializationError>;
}

// Header io
/// Byte sink the factories write creation headers through. The bit-level
/// wire format lives behind this seam.
pub trait HeaderWriter {
    fn write_u64(&mut self, value: u64) -> Result<(), SerializationError>;
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), SerializationError>;
}

pub trait HeaderReader {
    fn read_u64(&mut self) -> Result<u64, SerializationError>;
    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, SerializationError>;
}

// TransportSink
/// Connection-layer seam. After the poll pass the bridge reports which peers
/// need a send pass; framing and sockets live downstream.
pub trait TransportSink {
    fn queue_send_pass(&mut self, peers: &[PeerId]);
}

// SchemaService
/// Reflection seam: computes the protocol identifier (schema fingerprint)
/// for a registered type. The bridge only compares these ids.
pub trait SchemaService {
    fn compute_protocol_id(&self, type_key: &str) -> ProtocolId;
}

// InstanceHost
/// Host-application seam used by the garbage-collection sweep to detect
/// instances that vanished without ending replication.
pub trait InstanceHost {
    fn is_alive(&self, instance: InstanceId) -> bool;
    /// Whether the instance still actively participates in dirty tracking.
    /// A stale *bound* instance cannot be safely cleaned up.
    fn is_bound(&self, instance: InstanceId) -> bool;
}
