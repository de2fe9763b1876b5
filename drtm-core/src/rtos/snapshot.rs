//! Thread-list snapshots.
//!
//! A snapshot is built off to the side from one walk of the target's thread
//! list and only replaces the published one once the walk has fully
//! succeeded, so a failed refresh never leaves a half-updated thread view.

use super::metadata::{block_u32, LayoutMetadata};
use super::table::{assign_identity, IdAllocator, ThreadTable};
use super::thread::{Thread, ThreadId, ThreadRecord, ThreadState};
use crate::config::EngineConfig;
use crate::error::{DrtmError, DrtmResult};
use crate::target::{TargetCapability, TargetExt};
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    /// Bumped on every successful refresh.
    generation: u64,
    current: Option<ThreadId>,
    #[serde(serialize_with = "serialize_threads")]
    threads: ThreadTable,
}

fn serialize_threads<S: serde::Serializer>(table: &ThreadTable, s: S) -> Result<S::Ok, S::Error> {
    s.collect_seq(table.iter())
}

impl Snapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Thread that was running when the target halted.
    pub const fn current(&self) -> Option<ThreadId> {
        self.current
    }

    pub const fn threads(&self) -> &ThreadTable {
        &self.threads
    }

    pub(crate) fn threads_mut(&mut self) -> &mut ThreadTable {
        &mut self.threads
    }
}

/// Everything one refresh pass needs besides the previous snapshot.
pub(crate) struct Walker<'a, T: ?Sized> {
    pub target: &'a mut T,
    pub layout: &'a LayoutMetadata,
    pub config: &'a EngineConfig,
    /// Host buffer: one backing struct followed by one name.
    pub scratch: &'a mut [u8],
}

impl<T> Walker<'_, T>
where
    T: TargetCapability + ?Sized,
{
    /// Walk the list and build the successor of `previous`.
    ///
    /// New ids are drawn from `ids`; the caller decides whether to keep them.
    pub fn build(self, previous: &Snapshot, ids: &mut IdAllocator) -> DrtmResult<Snapshot> {
        let generation = previous.generation + 1;

        if let Some(address) = self.layout.scheduler_started_address {
            if self.target.read_u8(address)? == 0 {
                log::debug!("Scheduler not started, no threads");
                return Ok(Snapshot { generation, ..Snapshot::default() });
            }
        }

        let current_address = self.target.read_pointer(self.layout.current_thread_address)?;
        let head = self.target.read_pointer(self.layout.thread_list_head_address)?;
        let records = self.walk(head)?;

        let mut threads = ThreadTable::try_with_capacity(records.len())?;
        let mut current = None;
        for mut record in records {
            let id = assign_identity(&previous.threads, &record, ids)?;
            if record.address == current_address {
                record.state = ThreadState::Running;
                current = Some(id);
            }
            threads.push(Thread::from_record(id, record))?;
        }
        if current.is_none() && current_address != 0 {
            log::warn!("Current thread 0x{current_address:08X} is not in the thread list");
        }

        Ok(Snapshot { generation, current, threads })
    }

    fn walk(self, head: u64) -> DrtmResult<Vec<ThreadRecord>> {
        let Self { target, layout, config, scratch } = self;
        let size = layout.struct_size as usize;
        if scratch.len() < size {
            return Err(DrtmError::OutOfMemory(format!(
                "scratch of {} bytes cannot hold a {size}-byte struct",
                scratch.len()
            )));
        }
        let (block, rest) = scratch.split_at_mut(size);
        let name_len = config.max_name_len.min(rest.len());
        let name_buf = &mut rest[..name_len];

        let mut visited = HashSet::new();
        let mut records = Vec::new();
        let mut next = layout.entry_address(head)?;
        while let Some(address) = next {
            if !visited.insert(address) {
                return Err(DrtmError::CorruptedThreadList(format!(
                    "thread 0x{address:08X} reached twice"
                )));
            }
            if records.len() == config.max_threads {
                return Err(DrtmError::CorruptedThreadList(format!(
                    "more than {} threads",
                    config.max_threads
                )));
            }

            target.read_exact(address, block)?;
            let record = ThreadRecord::decode(&mut *target, layout, address, block, name_buf);
            log::debug!("Thread 0x{address:08X}: {:?} {:?}", record.name, record.state);
            records.push(record);

            next = layout.entry_address(u64::from(block_u32(block, layout.next_offset)))?;
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::{DemoKernel, CURRENT_THREAD_ADDRESS, SCHEDULER_STARTED_ADDRESS};
    use crate::target::MemoryImage;

    fn build(
        image: &mut MemoryImage,
        layout: &LayoutMetadata,
        previous: &Snapshot,
    ) -> DrtmResult<Snapshot> {
        let config = EngineConfig::default();
        let mut scratch = vec![0u8; config.scratch_len().unwrap()];
        let mut ids = IdAllocator::new();
        Walker { target: image, layout, config: &config, scratch: &mut scratch }
            .build(previous, &mut ids)
    }

    #[test]
    fn test_walk_demo_list() {
        let mut kernel = DemoKernel::new();
        kernel.spawn("idle", ThreadState::Ready, 0);
        let main = kernel.spawn("main", ThreadState::Ready, 5);
        kernel.set_current(main);
        let mut image = kernel.build().unwrap();

        let snapshot = build(&mut image, kernel.layout(), &Snapshot::empty()).unwrap();
        assert_eq!(snapshot.generation(), 1);
        assert_eq!(snapshot.threads().len(), 2);
        let names: Vec<_> = snapshot.threads().iter().filter_map(Thread::name).collect();
        assert_eq!(names, ["idle", "main"]);

        let current = snapshot.current().unwrap();
        let running = snapshot.threads().by_id(current).unwrap();
        assert_eq!(running.name(), Some("main"));
        assert_eq!(running.state(), ThreadState::Running);
    }

    #[test]
    fn test_scheduler_not_started() {
        let mut kernel = DemoKernel::new();
        kernel.spawn("idle", ThreadState::Ready, 0);
        let mut image = kernel.build().unwrap();
        image.write(SCHEDULER_STARTED_ADDRESS, &[0]).unwrap();

        let snapshot = build(&mut image, kernel.layout(), &Snapshot::empty()).unwrap();
        assert!(snapshot.threads().is_empty());
        assert_eq!(snapshot.current(), None);
    }

    #[test]
    fn test_cycle_detected() {
        let mut kernel = DemoKernel::new();
        kernel.spawn("a", ThreadState::Ready, 0);
        kernel.spawn("b", ThreadState::Ready, 0);
        let mut image = kernel.build().unwrap();
        let layout = kernel.layout().clone();

        // b -> a
        let b = DemoKernel::thread_address(1);
        let a = DemoKernel::thread_address(0) as u32;
        image.write_u32(b + u64::from(layout.next_offset), a).unwrap();

        assert!(matches!(
            build(&mut image, &layout, &Snapshot::empty()),
            Err(DrtmError::CorruptedThreadList(_))
        ));
    }

    #[test]
    fn test_unreadable_node() {
        let mut kernel = DemoKernel::new();
        kernel.spawn("a", ThreadState::Ready, 0);
        let mut image = kernel.build().unwrap();
        let layout = kernel.layout().clone();

        let a = DemoKernel::thread_address(0);
        image.write_u32(a + u64::from(layout.next_offset), 0x6000_0000).unwrap();

        assert_eq!(
            build(&mut image, &layout, &Snapshot::empty()).unwrap_err(),
            DrtmError::TargetUnreachable { address: 0x6000_0000 }
        );
    }

    #[test]
    fn test_current_outside_list_is_not_fatal() {
        let mut kernel = DemoKernel::new();
        kernel.spawn("a", ThreadState::Blocked, 0);
        let mut image = kernel.build().unwrap();
        image.write_u32(CURRENT_THREAD_ADDRESS, 0x2000_F000).unwrap();

        let snapshot = build(&mut image, kernel.layout(), &Snapshot::empty()).unwrap();
        assert_eq!(snapshot.current(), None);
        assert_eq!(snapshot.threads().get(0).map(Thread::state), Some(ThreadState::Blocked));
    }

    #[test]
    fn test_serializes_thread_list() {
        let mut kernel = DemoKernel::new();
        kernel.spawn("idle", ThreadState::Ready, 0);
        let mut image = kernel.build().unwrap();
        let snapshot = build(&mut image, kernel.layout(), &Snapshot::empty()).unwrap();

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["generation"], 1);
        assert_eq!(json["threads"][0]["name"], "idle");
        assert_eq!(json["threads"][0]["state"], "ready");
    }
}
