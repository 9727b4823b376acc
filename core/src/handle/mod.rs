mod error;
mod object_handle;
mod record;
mod registry;

pub use error::HandleError;
pub use object_handle::{ObjectHandle, ObjectHandleAllocator};
pub use record::{
    DependentRelation, DependentSchedulingHint, LifecycleState, ObjectRecord,
};
pub use registry::{HandleRegistry, RegisterParams, SubObjectInsertionOrder};
