//! A simple implementation of a UID used as a unique key for parameters.

/// An id used to associate optimizer state with parameter buffers.
///
/// Ids are process-unique and stable for the lifetime of the buffer they
/// were minted for; cloning a handle preserves its id.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
pub struct UniqueId(pub(crate) u64);

/// Generate a [UniqueId].
pub(crate) fn unique_id() -> UniqueId {
    static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    UniqueId(COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
}

impl std::ops::Deref for UniqueId {
    type Target = u64;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Something that has a [UniqueId].
pub trait HasUniqueId {
    fn id(&self) -> UniqueId;
}
