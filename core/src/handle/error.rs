use thiserror::Error;

use super::object_handle::ObjectHandle;

/// Errors raised by the Handle Registry.
///
/// Lookups of handles that no longer map to a live record are deliberately
/// not errors - public entry points treat them as no-ops. These variants
/// cover genuine caller mistakes.
#[derive(Debug, Clone, Error)]
pub enum HandleError {
    /// Tried to attach a subobject to a root that is not replicating.
    #[error("Cannot add subobject {sub_object:?} - owner {owner:?} is not replicating")]
    InvalidOwner {
        owner: ObjectHandle,
        sub_object: ObjectHandle,
    },

    /// Tried to attach an already-replicating subobject to a different root.
    #[error("Subobject {sub_object:?} already belongs to root {existing_root:?}, cannot move it to {requested_root:?}")]
    SubObjectOfOtherRoot {
        sub_object: ObjectHandle,
        existing_root: ObjectHandle,
        requested_root: ObjectHandle,
    },

    /// A subobject cannot own itself, nor can an object depend on itself.
    #[error("Object {handle:?} cannot be related to itself")]
    SelfRelation { handle: ObjectHandle },

    /// Tried to add a dependent relation where either side is not replicating.
    #[error("Cannot add dependent {dependent:?} to parent {parent:?} - both must be replicating")]
    InvalidDependentRelation {
        parent: ObjectHandle,
        dependent: ObjectHandle,
    },

    /// A static handle registered by the caller collided with a live record
    /// for a different instance.
    #[error("Static handle {handle:?} is already bound to another instance")]
    StaticHandleCollision { handle: ObjectHandle },
}
