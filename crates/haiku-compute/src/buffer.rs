//! Buffer handles
//!
//! Backends own buffer memory. Everyone else holds a [`BufferId`], a plain
//! index that can be copied into as many invocations as needed.

use std::fmt;

/// Handle to a backend-owned buffer of `f32` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u32);

impl BufferId {
    /// Create a handle from a slot index
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Slot index in the owning backend
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// Slot table shared by the backends
///
/// Released slots are recycled so that repeated initialization does not
/// grow the table.
#[derive(Debug)]
pub(crate) struct Slots<T> {
    entries: Vec<Option<T>>,
    free: Vec<u32>,
}

impl<T> Slots<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> BufferId {
        match self.free.pop() {
            Some(index) => {
                self.entries[index as usize] = Some(value);
                BufferId(index)
            }
            None => {
                self.entries.push(Some(value));
                BufferId((self.entries.len() - 1) as u32)
            }
        }
    }

    pub(crate) fn remove(&mut self, id: BufferId) -> Option<T> {
        let value = self.entries.get_mut(id.index())?.take()?;
        self.free.push(id.0);
        Some(value)
    }

    pub(crate) fn get(&self, id: BufferId) -> Option<&T> {
        self.entries.get(id.index()).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, id: BufferId) -> Option<&mut T> {
        self.entries.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub(crate) fn live(&self) -> usize {
        self.entries.len() - self.free.len()
    }
}
