use crate::handle::ObjectHandle;

// EndReplicationMode
/// What happens to the remote mirror when replication ends.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum EndReplicationMode {
    /// Destroy the remote mirror.
    Destroy,
    /// Stop authoritative replication but let the remote mirror persist.
    TearOff,
    /// End replication without touching the remote instance. Never
    /// propagated to dynamically-spawned children - those cannot be
    /// deterministically reconstructed later, so they are always destroyed.
    DoNotDestroy,
}

// EndReplicationFlags
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct EndReplicationFlags {
    pub mode: EndReplicationMode,
    /// Deliver all pending state before detaching.
    pub flush: bool,
}

impl EndReplicationFlags {
    pub fn destroy() -> Self {
        Self {
            mode: EndReplicationMode::Destroy,
            flush: false,
        }
    }

    pub fn tear_off() -> Self {
        Self {
            mode: EndReplicationMode::TearOff,
            flush: false,
        }
    }

    pub fn flush() -> Self {
        Self {
            mode: EndReplicationMode::Destroy,
            flush: true,
        }
    }

    pub fn do_not_destroy() -> Self {
        Self {
            mode: EndReplicationMode::DoNotDestroy,
            flush: false,
        }
    }

    /// Cascade policy for a child of an object ending replication with
    /// these flags: destroy-with-owner children inherit the root's policy,
    /// except that DoNotDestroy never reaches dynamic children.
    pub fn for_sub_object(&self, destroy_with_owner: bool, is_dynamic: bool) -> Self {
        let mut flags = *self;
        if !destroy_with_owner {
            flags.mode = EndReplicationMode::DoNotDestroy;
        }
        if flags.mode == EndReplicationMode::DoNotDestroy && is_dynamic {
            flags.mode = EndReplicationMode::Destroy;
        }
        flags
    }
}

/// A stop-replication request that arrived while the system was mid-tick
/// (for example processing incoming data). Deferred so an instance the
/// receive pass is still applying state to is not detached under it.
#[derive(Clone, Copy, Debug)]
pub struct PendingEndReplication {
    pub handle: ObjectHandle,
    pub flags: EndReplicationFlags,
}
