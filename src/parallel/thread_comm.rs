//! Thread-backed communicator.
//!
//! `ThreadComm` runs a group of ranks as threads of the current process.
//! Ranks exchange data through a shared `size × size` slot matrix guarded by
//! a barrier, which gives collectives the same blocking semantics as their
//! MPI counterparts: a rank entering `all_to_all_v` waits until every rank
//! of its group has posted its buffers.
//!
//! # Example
//! ```
//! use multifront::parallel::{Comm, ThreadComm};
//! let sums = ThreadComm::run(3, |comm| comm.all_reduce(comm.rank() as f64).unwrap());
//! assert_eq!(sums, vec![3.0; 3]);
//! ```

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, Barrier};

use parking_lot::Mutex;

use super::{Comm, check_range, check_send_count};
use crate::error::MfError;

struct Group {
    size: usize,
    barrier: Barrier,
    /// `slots[src * size + dst]`
    slots: Vec<Mutex<Vec<f64>>>,
    /// Pending sub-groups keyed by (split sequence number, begin, end), with
    /// the number of members that still have to pick them up.
    splits: Mutex<HashMap<(u64, usize, usize), (Arc<Group>, usize)>>,
}

impl Group {
    fn new(size: usize) -> Arc<Self> {
        Arc::new(Group {
            size,
            barrier: Barrier::new(size),
            slots: (0..size * size).map(|_| Mutex::new(Vec::new())).collect(),
            splits: Mutex::new(HashMap::new()),
        })
    }
}

pub struct ThreadComm {
    group: Arc<Group>,
    rank: usize,
    /// Number of `sub_comm` calls issued on this communicator by this rank.
    splits: Cell<u64>,
}

impl ThreadComm {
    /// One communicator per rank of a fresh group of `size` ranks.
    pub fn universe(size: usize) -> Vec<ThreadComm> {
        let group = Group::new(size.max(1));
        (0..group.size)
            .map(|rank| ThreadComm {
                group: Arc::clone(&group),
                rank,
                splits: Cell::new(0),
            })
            .collect()
    }

    /// Run `f` on `size` ranks, one thread each, and collect the results in
    /// rank order.
    pub fn run<R, F>(size: usize, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(ThreadComm) -> R + Sync,
    {
        let comms = ThreadComm::universe(size);
        std::thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    let f = &f;
                    s.spawn(move || f(comm))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(r) => r,
                    Err(e) => std::panic::resume_unwind(e),
                })
                .collect()
        })
    }
}

impl Comm for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.group.size
    }

    fn barrier(&self) {
        self.group.barrier.wait();
    }

    fn all_to_all_v(&self, sbuf: Vec<Vec<f64>>) -> Result<Vec<Vec<f64>>, MfError> {
        let p = self.group.size;
        check_send_count(&sbuf, p)?;
        for (dst, buf) in sbuf.into_iter().enumerate() {
            *self.group.slots[self.rank * p + dst].lock() = buf;
        }
        self.group.barrier.wait();
        let rbuf = (0..p)
            .map(|src| std::mem::take(&mut *self.group.slots[src * p + self.rank].lock()))
            .collect();
        // slots may only be reused once every rank has drained its column
        self.group.barrier.wait();
        Ok(rbuf)
    }

    fn sub_comm(&self, begin: usize, end: usize) -> Result<Option<Self>, MfError> {
        check_range(begin, end, self.group.size)?;
        let seq = self.splits.get();
        self.splits.set(seq + 1);
        if self.rank < begin || self.rank >= end {
            return Ok(None);
        }
        let key = (seq, begin, end);
        let mut pending = self.group.splits.lock();
        let entry = pending
            .entry(key)
            .or_insert_with(|| (Group::new(end - begin), end - begin));
        let group = Arc::clone(&entry.0);
        entry.1 -= 1;
        if entry.1 == 0 {
            pending.remove(&key);
        }
        Ok(Some(ThreadComm {
            group,
            rank: self.rank - begin,
            splits: Cell::new(0),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_to_all_delivers_personalized_buffers() {
        let out = ThreadComm::run(4, |comm| {
            let me = comm.rank();
            let sbuf = (0..comm.size())
                .map(|d| vec![(10 * me + d) as f64; d])
                .collect();
            comm.all_to_all_v(sbuf).unwrap()
        });
        for (me, rbuf) in out.iter().enumerate() {
            for (src, buf) in rbuf.iter().enumerate() {
                assert_eq!(buf, &vec![(10 * src + me) as f64; me]);
            }
        }
    }

    #[test]
    fn sub_comm_renumbers_contiguous_ranks() {
        let out = ThreadComm::run(5, |comm| {
            let left = comm.sub_comm(0, 2).unwrap();
            let right = comm.sub_comm(2, 5).unwrap();
            let l = left.map(|c| (c.rank(), c.size(), c.all_reduce(1.0).unwrap()));
            let r = right.map(|c| (c.rank(), c.size(), c.all_reduce(1.0).unwrap()));
            (l, r)
        });
        assert_eq!(out[0], (Some((0, 2, 2.0)), None));
        assert_eq!(out[1], (Some((1, 2, 2.0)), None));
        assert_eq!(out[2], (None, Some((0, 3, 3.0))));
        assert_eq!(out[4], (None, Some((2, 3, 3.0))));
    }

    #[test]
    fn wrong_buffer_count_is_an_error() {
        let comms = ThreadComm::universe(1);
        assert!(comms[0].all_to_all_v(vec![vec![], vec![]]).is_err());
    }
}
