//! Deferred frees: blocks released once the GPU has retired a timestamp.

use std::collections::VecDeque;

use crate::gsl::Pid;
use crate::gsl::memory::MemDesc;
use crate::utils::{timestamp_cmp, timestamp_passed};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemQueueEntry {
    pub timestamp: u32,
    pub desc: MemDesc,
    pub pid: Pid,
}

/// Ordered by timestamp, oldest first.
#[derive(Debug, Default)]
pub struct MemQueue {
    entries: VecDeque<MemQueueEntry>,
}

impl MemQueue {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queues `desc` to be freed once `timestamp` retires.
    pub fn push(&mut self, timestamp: u32, desc: MemDesc, pid: Pid) {
        let entry = MemQueueEntry {
            timestamp,
            desc,
            pid,
        };
        // Requests almost always arrive in order; keep the queue sorted when they don't.
        let pos = self
            .entries
            .iter()
            .rposition(|e| timestamp_cmp(e.timestamp, timestamp).is_le())
            .map_or(0, |i| i + 1);
        self.entries.insert(pos, entry);
    }

    /// Removes every entry whose timestamp has retired.
    pub fn drain_retired(&mut self, retired: u32) -> Vec<MemQueueEntry> {
        let mut out = Vec::new();
        while let Some(front) = self.entries.front() {
            if !timestamp_passed(retired, front.timestamp) {
                break;
            }
            out.extend(self.entries.pop_front());
        }
        out
    }

    /// Removes everything regardless of timestamp.
    pub fn drain_all(&mut self) -> Vec<MemQueueEntry> {
        self.entries.drain(..).collect()
    }

    /// Removes every entry queued by `pid`.
    pub fn take_for(&mut self, pid: Pid) -> Vec<MemQueueEntry> {
        let (taken, kept): (Vec<_>, Vec<_>) = self.entries.drain(..).partition(|e| e.pid == pid);
        self.entries = kept.into();
        taken
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemQueueEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(gpuaddr: u32) -> MemDesc {
        MemDesc {
            gpuaddr,
            size: 4096,
            ..MemDesc::default()
        }
    }

    #[test]
    fn test_drains_in_timestamp_order() {
        let mut q = MemQueue::new();
        q.push(3, desc(0x1000), 1);
        q.push(5, desc(0x2000), 1);
        q.push(4, desc(0x3000), 2);

        let freed = q.drain_retired(4);
        let addrs: Vec<u32> = freed.iter().map(|e| e.desc.gpuaddr).collect();
        assert_eq!(addrs, vec![0x1000, 0x3000]);
        assert_eq!(q.len(), 1);
        assert!(q.drain_retired(4).is_empty());
        assert_eq!(q.drain_retired(5).len(), 1);
    }

    #[test]
    fn test_take_for_keeps_order_of_others() {
        let mut q = MemQueue::new();
        q.push(1, desc(0x1000), 1);
        q.push(2, desc(0x2000), 2);
        q.push(3, desc(0x3000), 1);
        q.push(4, desc(0x4000), 2);

        let taken = q.take_for(1);
        assert_eq!(taken.len(), 2);
        let left: Vec<u32> = q.iter().map(|e| e.timestamp).collect();
        assert_eq!(left, vec![2, 4]);
    }

    #[test]
    fn test_wrapped_timestamps() {
        let mut q = MemQueue::new();
        q.push(0xffff_fffe, desc(0x1000), 1);
        q.push(1, desc(0x2000), 1);
        assert_eq!(q.drain_retired(0xffff_ffff).len(), 1);
        assert_eq!(q.drain_retired(2).len(), 1);
    }
}
