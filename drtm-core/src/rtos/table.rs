use super::thread::{Thread, ThreadId, ThreadRecord};
use crate::error::{DrtmError, DrtmResult};
use std::collections::{HashMap, TryReserveError};

/// Threads of one snapshot in list order, indexed by id and by backing address.
#[derive(Debug, Clone, Default)]
pub struct ThreadTable {
    threads: Vec<Thread>,
    by_id: HashMap<ThreadId, usize>,
    by_address: HashMap<u64, usize>,
}

impl ThreadTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve room for `count` threads up front so that building the table
    /// either fails here or not at all.
    pub(crate) fn try_with_capacity(count: usize) -> DrtmResult<Self> {
        let oom = |e: TryReserveError| {
            DrtmError::OutOfMemory(format!("thread table for {count} threads: {e}"))
        };
        let mut table = Self::new();
        table.threads.try_reserve_exact(count).map_err(oom)?;
        table.by_id.try_reserve(count).map_err(oom)?;
        table.by_address.try_reserve(count).map_err(oom)?;
        Ok(table)
    }

    pub(crate) fn push(&mut self, thread: Thread) -> DrtmResult<()> {
        let position = self.threads.len();
        if self.by_id.insert(thread.id(), position).is_some() {
            return Err(DrtmError::CorruptedThreadList(format!(
                "thread id {} assigned twice",
                thread.id()
            )));
        }
        if self.by_address.insert(thread.address(), position).is_some() {
            return Err(DrtmError::CorruptedThreadList(format!(
                "thread 0x{:08X} listed twice",
                thread.address()
            )));
        }
        self.threads.push(thread);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Thread at list position `index`.
    pub fn get(&self, index: usize) -> Option<&Thread> {
        self.threads.get(index)
    }

    pub fn by_id(&self, id: ThreadId) -> Option<&Thread> {
        self.by_id.get(&id).map(|&i| &self.threads[i])
    }

    pub(crate) fn by_id_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        let index = *self.by_id.get(&id)?;
        self.threads.get_mut(index)
    }

    pub fn by_address(&self, address: u64) -> Option<&Thread> {
        self.by_address.get(&address).map(|&i| &self.threads[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Thread> {
        self.threads.iter()
    }
}

/// Hands out thread ids. Never reuses one within an engine's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdAllocator {
    next: u32,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mint(&mut self) -> DrtmResult<ThreadId> {
        let id = ThreadId::new(self.next)
            .ok_or_else(|| DrtmError::OutOfMemory("thread id space exhausted".into()))?;
        self.next = self
            .next
            .checked_add(1)
            .ok_or_else(|| DrtmError::OutOfMemory("thread id space exhausted".into()))?;
        Ok(id)
    }

    /// Id the next call to [`Self::mint`] returns.
    pub const fn peek(&self) -> u32 {
        self.next
    }
}

/// Id for a freshly walked record: the previous id when the same thread still
/// sits at the same address, a new one otherwise.
pub(crate) fn assign_identity(
    previous: &ThreadTable,
    record: &ThreadRecord,
    ids: &mut IdAllocator,
) -> DrtmResult<ThreadId> {
    match previous.by_address(record.address) {
        Some(old) if old.fingerprint() == record.fingerprint() => Ok(old.id()),
        Some(old) => {
            log::debug!(
                "Backing struct 0x{:08X} reused, retiring thread {}",
                record.address,
                old.id()
            );
            ids.mint()
        }
        None => ids.mint(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtos::thread::ThreadState;

    fn record(address: u64, name: &str) -> ThreadRecord {
        ThreadRecord {
            address,
            state: ThreadState::Ready,
            stack_pointer: 0x2000_8000,
            name: Some(name.to_string()),
            rtos_id: Some(7),
            priority: None,
        }
    }

    fn table_of(ids: &mut IdAllocator, records: &[ThreadRecord]) -> ThreadTable {
        let mut table = ThreadTable::try_with_capacity(records.len()).unwrap();
        for r in records {
            table.push(Thread::from_record(ids.mint().unwrap(), r.clone())).unwrap();
        }
        table
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.mint().unwrap().get(), 1);
        assert_eq!(ids.mint().unwrap().get(), 2);
        assert_eq!(ids.peek(), 3);
    }

    #[test]
    fn test_lookup_by_id_and_address() {
        let mut ids = IdAllocator::new();
        let table = table_of(&mut ids, &[record(0x100, "a"), record(0x200, "b")]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(1).map(Thread::address), Some(0x200));
        let b = ThreadId::new(2).unwrap();
        assert_eq!(table.by_id(b).and_then(Thread::name), Some("b"));
        assert_eq!(table.by_address(0x100).map(Thread::id), ThreadId::new(1));
        assert!(table.by_address(0x300).is_none());
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let mut ids = IdAllocator::new();
        let mut table = table_of(&mut ids, &[record(0x100, "a")]);
        let dup = Thread::from_record(ids.mint().unwrap(), record(0x100, "a"));
        assert!(matches!(table.push(dup), Err(DrtmError::CorruptedThreadList(_))));
    }

    #[test]
    fn test_identity_survives_when_fingerprint_matches() {
        let mut ids = IdAllocator::new();
        let previous = table_of(&mut ids, &[record(0x100, "a")]);

        let same = record(0x100, "a");
        assert_eq!(assign_identity(&previous, &same, &mut ids).unwrap().get(), 1);

        // Same struct, new occupant.
        let reused = record(0x100, "other");
        assert_eq!(assign_identity(&previous, &reused, &mut ids).unwrap().get(), 2);

        let fresh = record(0x400, "a");
        assert_eq!(assign_identity(&previous, &fresh, &mut ids).unwrap().get(), 3);
    }
}
