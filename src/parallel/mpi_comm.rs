//! MPI-based parallel communication module.
//!
//! This module provides an implementation of the `Comm` trait using the MPI (Message Passing Interface)
//! backend for distributed-memory parallelism. Subtree communicators of the front tree are obtained
//! with `MPI_Comm_split`, and the extend-add rounds map to one `MPI_Alltoallv` each (preceded by the
//! exchange of the per-rank counts). The implementation is only available when the `mpi` feature is enabled.
//!
//! # Usage
//!
//! - The caller owns the `Universe` returned by `mpi::initialize()` and keeps it alive for as long as any
//!   `MpiComm` exists; dropping it finalizes MPI.
//! - `MpiComm::world` wraps the world communicator; sub-communicators are freed when dropped.
//!
//! # References
//! - [MPI Standard](https://www.mpi-forum.org/)
//!
//! # Example
//! ```no_run
//! # #[cfg(feature = "mpi")] {
//! use multifront::parallel::{Comm, MpiComm};
//! let universe = mpi::initialize().unwrap();
//! let comm = MpiComm::world(&universe);
//! println!("Rank: {} / {}", comm.rank(), comm.size());
//! comm.barrier();
//! # }
//! ```

use mpi::collective::SystemOperation;
use mpi::datatype::{Partition, PartitionMut};
use mpi::environment::Universe;
use mpi::topology::{Color, SimpleCommunicator};
use mpi::traits::*;
use mpi::Count;

use super::{Comm, check_range, check_send_count};
use crate::error::MfError;

/// MPI communicator wrapper for distributed parallelism.
pub struct MpiComm {
    /// The wrapped communicator (world or a subtree split of it).
    pub comm: SimpleCommunicator,
    /// The rank (ID) of this process within the communicator.
    pub rank: usize,
    /// The total number of processes in the communicator.
    pub size: usize,
}

impl MpiComm {
    /// Wraps the world communicator of an initialized universe.
    pub fn world(universe: &Universe) -> Self {
        Self::from_communicator(universe.world())
    }

    pub fn from_communicator(comm: SimpleCommunicator) -> Self {
        let rank = comm.rank() as usize;
        let size = comm.size() as usize;
        MpiComm { comm, rank, size }
    }
}

fn to_count(n: usize) -> Result<Count, MfError> {
    Count::try_from(n).map_err(|_| MfError::Comm(format!("buffer of {} values exceeds the MPI count range", n)))
}

fn displacements(counts: &[Count]) -> Vec<Count> {
    counts
        .iter()
        .scan(0, |acc, &c| {
            let d = *acc;
            *acc += c;
            Some(d)
        })
        .collect()
}

impl Comm for MpiComm {
    /// Returns the rank (ID) of this process.
    fn rank(&self) -> usize {
        self.rank
    }
    /// Returns the total number of processes in the communicator.
    fn size(&self) -> usize {
        self.size
    }
    /// Synchronizes all processes at a barrier.
    fn barrier(&self) {
        self.comm.barrier();
    }

    /// Exchanges the per-destination counts, then the payloads in a single
    /// `MPI_Alltoallv`.
    fn all_to_all_v(&self, sbuf: Vec<Vec<f64>>) -> Result<Vec<Vec<f64>>, MfError> {
        check_send_count(&sbuf, self.size)?;
        let scounts = sbuf
            .iter()
            .map(|b| to_count(b.len()))
            .collect::<Result<Vec<_>, _>>()?;
        let mut rcounts: Vec<Count> = vec![0; self.size];
        self.comm.all_to_all_into(&scounts[..], &mut rcounts[..]);
        if rcounts.iter().any(|&c| c < 0) {
            return Err(MfError::Comm("negative receive count".to_string()));
        }
        let sdispls = displacements(&scounts);
        let rdispls = displacements(&rcounts);
        let flat: Vec<f64> = sbuf.into_iter().flatten().collect();
        let total: usize = rcounts.iter().map(|&c| c as usize).sum();
        let mut rflat = vec![0.0f64; total];
        {
            let send = Partition::new(&flat[..], &scounts[..], &sdispls[..]);
            let mut recv = PartitionMut::new(&mut rflat[..], &rcounts[..], &rdispls[..]);
            self.comm.all_to_all_varcount_into(&send, &mut recv);
        }
        Ok(rcounts
            .iter()
            .zip(&rdispls)
            .map(|(&c, &d)| rflat[d as usize..(d + c) as usize].to_vec())
            .collect())
    }

    /// `MPI_Comm_split` with color 0 for members of the range.
    fn sub_comm(&self, begin: usize, end: usize) -> Result<Option<Self>, MfError> {
        check_range(begin, end, self.size)?;
        let color = if (begin..end).contains(&self.rank) {
            Color::with_value(0)
        } else {
            Color::undefined()
        };
        Ok(self
            .comm
            .split_by_color(color)
            .map(MpiComm::from_communicator))
    }

    /// Performs an all-reduce sum operation across all processes.
    fn all_reduce_vec(&self, x: &mut [f64]) -> Result<(), MfError> {
        let send = x.to_vec();
        self.comm
            .all_reduce_into(&send[..], x, SystemOperation::sum());
        Ok(())
    }
}
