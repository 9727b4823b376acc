// ObjectHandle
/// Externally stable identifier for a replicated object. Handles are
/// server-assigned and never reused for a different object. The low bit
/// encodes origin: odd handles are static (deterministically assigned,
/// reconstructible on a remote peer), even handles are dynamic
/// (runtime-spawned). Handle 0 is invalid.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, PartialOrd, Ord)]
pub struct ObjectHandle(u64);

impl ObjectHandle {
    pub const INVALID: ObjectHandle = ObjectHandle(0);

    pub fn from_u64(value: u64) -> Self {
        ObjectHandle(value)
    }

    pub fn to_u64(&self) -> u64 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    pub fn is_static(&self) -> bool {
        self.0 & 1 == 1
    }

    pub fn is_dynamic(&self) -> bool {
        self.is_valid() && self.0 & 1 == 0
    }
}

// ObjectHandleAllocator
/// Hands out handles in two disjoint monotonic sequences so that a handle's
/// origin survives in its value.
pub struct ObjectHandleAllocator {
    next_static: u64,
    next_dynamic: u64,
}

impl ObjectHandleAllocator {
    pub fn new() -> Self {
        Self {
            next_static: 1,
            next_dynamic: 2,
        }
    }

    pub fn allocate_static_handle(&mut self) -> ObjectHandle {
        let handle = ObjectHandle(self.next_static);
        self.next_static += 2;
        handle
    }

    pub fn allocate_dynamic_handle(&mut self) -> ObjectHandle {
        let handle = ObjectHandle(self.next_dynamic);
        self.next_dynamic += 2;
        handle
    }
}

impl Default for ObjectHandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}
