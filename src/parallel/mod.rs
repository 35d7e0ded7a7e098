//! Communicators and process grids.
//!
//! The multifrontal engine talks to its peers only through the [`Comm`]
//! trait: a group of ranks that can exchange personalized buffers
//! (`all_to_all_v`), reduce values and split off contiguous sub-groups.
//! Three backends implement it:
//!
//! - [`SerialComm`]: a single rank, every collective is local.
//! - [`ThreadComm`]: several ranks living as threads of one process.
//! - `MpiComm`: MPI ranks, behind the `mpi` feature.
//!
//! Every collective must be issued by all ranks of the group in the same
//! order; a rank that has nothing to contribute still makes the call.

use crate::error::MfError;

pub trait Comm: Sized {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    fn barrier(&self);

    /// Personalized all-to-all: `sbuf[d]` goes to rank `d`, the result holds
    /// in slot `s` what rank `s` sent to this rank.
    fn all_to_all_v(&self, sbuf: Vec<Vec<f64>>) -> Result<Vec<Vec<f64>>, MfError>;

    /// Collective split: ranks `[begin, end)` receive a communicator in which
    /// rank `begin + k` becomes rank `k`; all other ranks receive `None`.
    fn sub_comm(&self, begin: usize, end: usize) -> Result<Option<Self>, MfError>;

    /// Element-wise sum over all ranks, reduced in rank order.
    fn all_reduce_vec(&self, x: &mut [f64]) -> Result<(), MfError> {
        let p = self.size();
        let rbuf = self.all_to_all_v(vec![x.to_vec(); p])?;
        x.iter_mut().for_each(|xi| *xi = 0.0);
        for (src, buf) in rbuf.iter().enumerate() {
            if buf.len() != x.len() {
                return Err(MfError::Comm(format!(
                    "all_reduce: rank {} contributed {} values, expected {}",
                    src,
                    buf.len(),
                    x.len()
                )));
            }
            for (xi, v) in x.iter_mut().zip(buf) {
                *xi += *v;
            }
        }
        Ok(())
    }

    fn all_reduce(&self, x: f64) -> Result<f64, MfError> {
        let mut v = [x];
        self.all_reduce_vec(&mut v)?;
        Ok(v[0])
    }
}

pub(crate) fn check_send_count(sbuf: &[Vec<f64>], size: usize) -> Result<(), MfError> {
    if sbuf.len() != size {
        return Err(MfError::Comm(format!(
            "all_to_all_v: {} send buffers for a group of {} ranks",
            sbuf.len(),
            size
        )));
    }
    Ok(())
}

/// Validate a sub-communicator range against the group size.
pub(crate) fn check_range(begin: usize, end: usize, size: usize) -> Result<(), MfError> {
    if begin >= end || end > size {
        return Err(MfError::Comm(format!(
            "invalid rank range [{}, {}) for a group of {} ranks",
            begin, end, size
        )));
    }
    Ok(())
}

/// Single-rank communicator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialComm;

impl SerialComm {
    pub fn new() -> Self {
        SerialComm
    }
}

impl Comm for SerialComm {
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn barrier(&self) {}
    fn all_to_all_v(&self, sbuf: Vec<Vec<f64>>) -> Result<Vec<Vec<f64>>, MfError> {
        check_send_count(&sbuf, 1)?;
        Ok(sbuf)
    }
    fn sub_comm(&self, begin: usize, end: usize) -> Result<Option<Self>, MfError> {
        check_range(begin, end, 1)?;
        Ok(Some(SerialComm))
    }
    fn all_reduce_vec(&self, _x: &mut [f64]) -> Result<(), MfError> {
        Ok(())
    }
}

pub mod grid;
pub use grid::{GridShape, ProcessGrid};

pub mod thread_comm;
pub use thread_comm::ThreadComm;

#[cfg(feature = "mpi")]
pub mod mpi_comm;
#[cfg(feature = "mpi")]
pub use mpi_comm::MpiComm;
