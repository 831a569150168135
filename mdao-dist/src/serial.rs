use std::sync::Arc;

use crate::{Backend, CommError, Payload};

/// The single-rank backend.
///
/// Collectives are identities; no data ever leaves the calling thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialBackend;

impl Backend for SerialBackend {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn is_distributed(&self) -> bool {
        false
    }

    fn all_to_all(&self, outgoing: Vec<Payload>) -> Result<Vec<Payload>, CommError> {
        if outgoing.len() != 1 {
            return Err(CommError::ContributionCount {
                found: outgoing.len(),
                expected: 1,
            });
        }
        Ok(outgoing)
    }

    fn split(&self, color: Option<u32>) -> Result<Option<Arc<dyn Backend>>, CommError> {
        Ok(color.map(|_| Arc::new(SerialBackend) as Arc<dyn Backend>))
    }
}
