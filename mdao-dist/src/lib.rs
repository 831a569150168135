#![doc=include_str!( "../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
#![deny(clippy::all)]

use std::{any::Any, fmt::Debug, sync::Arc};

pub mod partition;
mod serial;
#[cfg(feature = "threads")]
mod threaded;

pub use serial::SerialBackend;
#[cfg(feature = "threads")]
pub use threaded::{run_spmd, ThreadBackend, ThreadWorld};

/// A type-erased message exchanged between ranks.
pub type Payload = Box<dyn Any + Send>;

#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("Rank {rank} timed out waiting for collective #{seq} from rank {peer}")]
    Timeout { rank: usize, peer: usize, seq: u64 },

    #[error("Rank {0} has disconnected from the communicator")]
    Disconnected(usize),

    #[error("Collective payload type mismatch on rank {rank}: expected {expected}")]
    TypeMismatch { rank: usize, expected: &'static str },

    #[error("Collective called with {found} contributions, expected {expected}")]
    ContributionCount { found: usize, expected: usize },

    #[error("Buffer of length {found} does not match the declared size {expected} of rank {rank}")]
    SizeMismatch {
        rank: usize,
        found: usize,
        expected: usize,
    },

    #[error("Root rank {root} is out of range for a communicator of size {size}")]
    InvalidRoot { root: usize, size: usize },

    #[error("Root rank {0} did not provide a value to broadcast")]
    MissingRootValue(usize),
}

/// Reduction operators for [`Comm::all_reduce`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Min,
    Max,
}

impl ReduceOp {
    fn fold(self, acc: f64, value: f64) -> f64 {
        match self {
            ReduceOp::Sum => acc + value,
            ReduceOp::Min => acc.min(value),
            ReduceOp::Max => acc.max(value),
        }
    }
}

/// The primitive operations a backend has to provide.
///
/// Every typed collective on [`Comm`] is expressed in terms of [`Backend::all_to_all`], so a new
/// backend only needs to move one payload between every pair of ranks.
pub trait Backend: Send + Sync + Debug {
    /// Rank of the calling process within this communicator.
    fn rank(&self) -> usize;

    /// Number of ranks in this communicator.
    fn size(&self) -> usize;

    /// Whether the backend can actually hold data partitioned across ranks.
    fn is_distributed(&self) -> bool;

    /// Send `outgoing[j]` to rank `j` and return the payloads received from every rank, ordered by
    /// source rank. Blocks until all payloads have arrived.
    fn all_to_all(&self, outgoing: Vec<Payload>) -> Result<Vec<Payload>, CommError>;

    /// Collectively split this communicator. Ranks passing the same `color` end up in the same
    /// new communicator, ordered by their rank in `self`. Ranks passing `None` get `None` back.
    fn split(&self, color: Option<u32>) -> Result<Option<Arc<dyn Backend>>, CommError>;
}

/// A handle to a communicator.
///
/// Cloning is cheap; clones refer to the same communicator and share its collective sequence.
#[derive(Clone, Debug)]
pub struct Comm {
    backend: Arc<dyn Backend>,
}

impl Comm {
    /// A single-rank communicator.
    pub fn serial() -> Self {
        Self::from_backend(Arc::new(SerialBackend))
    }

    pub fn from_backend(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn rank(&self) -> usize {
        self.backend.rank()
    }

    pub fn size(&self) -> usize {
        self.backend.size()
    }

    pub fn is_distributed(&self) -> bool {
        self.backend.is_distributed()
    }

    /// Gather one value from every rank.
    pub fn all_gather<T>(&self, value: T) -> Result<Vec<T>, CommError>
    where
        T: Clone + Send + 'static,
    {
        let outgoing = (0..self.size())
            .map(|_| Box::new(value.clone()) as Payload)
            .collect();
        self.backend
            .all_to_all(outgoing)?
            .into_iter()
            .map(|payload| self.downcast::<T>(payload))
            .collect()
    }

    /// Gather differently-sized local buffers into one flat buffer.
    ///
    /// `sizes[r]` is the number of elements rank `r` contributes and `offsets[r]` where they land
    /// in the result. The local buffer must match `sizes[self.rank()]`.
    pub fn all_gather_variable<T>(
        &self,
        local: &[T],
        sizes: &[usize],
        offsets: &[usize],
    ) -> Result<Vec<T>, CommError>
    where
        T: Copy + Default + Send + 'static,
    {
        let rank = self.rank();
        if sizes.len() != self.size() || offsets.len() != self.size() {
            return Err(CommError::ContributionCount {
                found: sizes.len().min(offsets.len()),
                expected: self.size(),
            });
        }
        if local.len() != sizes[rank] {
            return Err(CommError::SizeMismatch {
                rank,
                found: local.len(),
                expected: sizes[rank],
            });
        }

        let total = sizes
            .iter()
            .zip(offsets)
            .map(|(size, offset)| size + offset)
            .max()
            .unwrap_or(0);
        let mut flat = vec![T::default(); total];

        let parts = self.all_gather(local.to_vec())?;
        for (source, part) in parts.iter().enumerate() {
            if part.len() != sizes[source] {
                return Err(CommError::SizeMismatch {
                    rank: source,
                    found: part.len(),
                    expected: sizes[source],
                });
            }
            flat[offsets[source]..offsets[source] + part.len()].copy_from_slice(part);
        }

        Ok(flat)
    }

    /// Element-wise reduction of equally-sized buffers.
    ///
    /// Contributions are folded in rank order, so every rank obtains a bit-identical result.
    pub fn all_reduce(&self, local: &[f64], op: ReduceOp) -> Result<Vec<f64>, CommError> {
        let parts = self.all_gather(local.to_vec())?;
        let mut parts = parts.into_iter().enumerate();
        let Some((_, mut acc)) = parts.next() else {
            return Ok(Vec::new());
        };
        for (source, part) in parts {
            if part.len() != acc.len() {
                return Err(CommError::SizeMismatch {
                    rank: source,
                    found: part.len(),
                    expected: acc.len(),
                });
            }
            acc.iter_mut()
                .zip(&part)
                .for_each(|(a, v)| *a = op.fold(*a, *v));
        }
        Ok(acc)
    }

    pub fn all_reduce_scalar(&self, local: f64, op: ReduceOp) -> Result<f64, CommError> {
        Ok(self.all_reduce(&[local], op)?[0])
    }

    /// Distribute the value held by `root` to every rank. Non-root ranks pass `None`.
    pub fn broadcast<T>(&self, root: usize, value: Option<T>) -> Result<T, CommError>
    where
        T: Clone + Send + 'static,
    {
        let size = self.size();
        if root >= size {
            return Err(CommError::InvalidRoot { root, size });
        }
        let mut gathered = self.all_gather(value)?;
        gathered
            .swap_remove(root)
            .ok_or(CommError::MissingRootValue(root))
    }

    pub fn barrier(&self) -> Result<(), CommError> {
        self.all_gather(()).map(|_| ())
    }

    /// Collectively create a sub-communicator. See [`Backend::split`].
    pub fn split(&self, color: Option<u32>) -> Result<Option<Comm>, CommError> {
        Ok(self.backend.split(color)?.map(Comm::from_backend))
    }

    fn downcast<T: 'static>(&self, payload: Payload) -> Result<T, CommError> {
        payload
            .downcast::<T>()
            .map(|value| *value)
            .map_err(|_| CommError::TypeMismatch {
                rank: self.rank(),
                expected: std::any::type_name::<T>(),
            })
    }
}

impl Default for Comm {
    fn default() -> Self {
        Self::serial()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_collectives() {
        let comm = Comm::serial();
        assert_eq!(comm.rank(), 0);
        assert_eq!(comm.size(), 1);
        assert!(!comm.is_distributed());

        assert_eq!(comm.all_gather(7_usize).unwrap(), vec![7]);
        assert_eq!(
            comm.all_gather_variable(&[1.0, 2.0], &[2], &[0]).unwrap(),
            vec![1.0, 2.0]
        );
        assert_eq!(
            comm.all_reduce(&[1.0, -2.0], ReduceOp::Max).unwrap(),
            vec![1.0, -2.0]
        );
        assert_eq!(comm.broadcast(0, Some("x".to_string())).unwrap(), "x");
        assert!(comm.split(None).unwrap().is_none());
        assert_eq!(comm.split(Some(3)).unwrap().unwrap().size(), 1);
    }

    #[test]
    fn test_gather_variable_size_mismatch() {
        let comm = Comm::serial();
        let err = comm.all_gather_variable(&[1.0, 2.0], &[3], &[0]).unwrap_err();
        assert!(matches!(
            err,
            CommError::SizeMismatch {
                rank: 0,
                found: 2,
                expected: 3
            }
        ));
    }

    #[test]
    fn test_broadcast_invalid_root() {
        let comm = Comm::serial();
        assert!(matches!(
            comm.broadcast(1, Some(1.0)),
            Err(CommError::InvalidRoot { root: 1, size: 1 })
        ));
    }
}
