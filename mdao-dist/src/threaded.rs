use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::{Backend, Comm, CommError, Payload};

/// Identifies a communicator; derived from the parent context on every split.
type ContextId = Arc<[u64]>;

type MessageKey = (ContextId, u64, usize);

struct Envelope {
    context: ContextId,
    seq: u64,
    /// Rank of the sender within the communicator identified by `context`.
    source: usize,
    payload: Payload,
}

/// The receiving end of one rank, shared by every communicator that rank belongs to.
struct Mailbox {
    world_rank: usize,
    receiver: Receiver<Envelope>,
    /// Messages that arrived before the collective they belong to was entered.
    pending: Mutex<HashMap<MessageKey, Payload>>,
    timeout: Duration,
}

impl Mailbox {
    fn receive(
        &self,
        context: &ContextId,
        seq: u64,
        source: usize,
        source_world: usize,
    ) -> Result<Payload, CommError> {
        let key = (context.clone(), seq, source);
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(payload) = pending.remove(&key) {
            return Ok(payload);
        }

        loop {
            match self.receiver.recv_timeout(self.timeout) {
                Ok(envelope) => {
                    if envelope.context == key.0
                        && envelope.seq == seq
                        && envelope.source == source
                    {
                        return Ok(envelope.payload);
                    }
                    pending.insert(
                        (envelope.context, envelope.seq, envelope.source),
                        envelope.payload,
                    );
                }
                Err(RecvTimeoutError::Timeout) => {
                    // Collectives up to `seq` on this context will never be entered again.
                    pending.retain(|(ctx, s, _), _| ctx != context || *s > seq);
                    return Err(CommError::Timeout {
                        rank: self.world_rank,
                        peer: source_world,
                        seq,
                    })
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(CommError::Disconnected(source_world))
                }
            }
        }
    }
}

/// A rank of a [`ThreadWorld`], or of a communicator split from one.
pub struct ThreadBackend {
    mailbox: Arc<Mailbox>,
    /// One sender per world rank.
    senders: Arc<[Sender<Envelope>]>,
    /// World ranks of the members of this communicator, in communicator rank order.
    members: Arc<[usize]>,
    rank: usize,
    context: ContextId,
    seq: AtomicU64,
}

impl fmt::Debug for ThreadBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadBackend")
            .field("rank", &self.rank)
            .field("members", &self.members)
            .field("context", &self.context)
            .finish()
    }
}

impl ThreadBackend {
    fn exchange(&self, outgoing: Vec<Payload>) -> Result<(u64, Vec<Payload>), CommError> {
        let size = self.members.len();
        if outgoing.len() != size {
            return Err(CommError::ContributionCount {
                found: outgoing.len(),
                expected: size,
            });
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        log::trace!(
            "Rank {} entering collective #{seq} on context {:?}",
            self.mailbox.world_rank,
            self.context
        );

        let mut own = None;
        for (dest, payload) in outgoing.into_iter().enumerate() {
            if dest == self.rank {
                own = Some(payload);
                continue;
            }
            let dest_world = self.members[dest];
            self.senders[dest_world]
                .send(Envelope {
                    context: self.context.clone(),
                    seq,
                    source: self.rank,
                    payload,
                })
                .map_err(|_| CommError::Disconnected(dest_world))?;
        }

        let mut incoming = Vec::with_capacity(size);
        for source in 0..size {
            if source == self.rank {
                incoming.push(own.take().ok_or(CommError::ContributionCount {
                    found: 0,
                    expected: size,
                })?);
            } else {
                incoming.push(self.mailbox.receive(
                    &self.context,
                    seq,
                    source,
                    self.members[source],
                )?);
            }
        }

        Ok((seq, incoming))
    }
}

impl Backend for ThreadBackend {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.members.len()
    }

    fn is_distributed(&self) -> bool {
        true
    }

    fn all_to_all(&self, outgoing: Vec<Payload>) -> Result<Vec<Payload>, CommError> {
        self.exchange(outgoing).map(|(_, incoming)| incoming)
    }

    fn split(&self, color: Option<u32>) -> Result<Option<Arc<dyn Backend>>, CommError> {
        let outgoing = (0..self.members.len())
            .map(|_| Box::new(color) as Payload)
            .collect();
        let (seq, incoming) = self.exchange(outgoing)?;

        let colors = incoming
            .into_iter()
            .map(|payload| {
                payload
                    .downcast::<Option<u32>>()
                    .map(|color| *color)
                    .map_err(|_| CommError::TypeMismatch {
                        rank: self.rank,
                        expected: "Option<u32>",
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let Some(color) = color else {
            return Ok(None);
        };

        let (members, rank) = colors
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == Some(color))
            .enumerate()
            .fold(
                (Vec::new(), 0),
                |(mut members, rank), (new_rank, (parent_rank, _))| {
                    members.push(self.members[parent_rank]);
                    let rank = if parent_rank == self.rank {
                        new_rank
                    } else {
                        rank
                    };
                    (members, rank)
                },
            );

        let context = self
            .context
            .iter()
            .copied()
            .chain([seq, color as u64])
            .collect::<ContextId>();

        Ok(Some(Arc::new(ThreadBackend {
            mailbox: self.mailbox.clone(),
            senders: self.senders.clone(),
            members: members.into(),
            rank,
            context,
            seq: AtomicU64::new(0),
        })))
    }
}

/// Builder for a set of ranks that communicate over in-process channels.
#[derive(Clone, Debug)]
pub struct ThreadWorld {
    size: usize,
    timeout: Duration,
}

impl ThreadWorld {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(size: usize) -> Self {
        Self {
            size,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// How long a rank waits for a peer inside a collective before giving up.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Create one world communicator per rank.
    pub fn build(&self) -> Vec<Comm> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..self.size).map(|_| unbounded()).unzip();
        let senders: Arc<[Sender<Envelope>]> = senders.into();
        let members: Arc<[usize]> = (0..self.size).collect();
        let context: ContextId = Arc::new([0]);

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| {
                Comm::from_backend(Arc::new(ThreadBackend {
                    mailbox: Arc::new(Mailbox {
                        world_rank: rank,
                        receiver,
                        pending: Mutex::new(HashMap::new()),
                        timeout: self.timeout,
                    }),
                    senders: senders.clone(),
                    members: members.clone(),
                    rank,
                    context: context.clone(),
                    seq: AtomicU64::new(0),
                }))
            })
            .collect()
    }

    /// Run `f` once per rank, each on its own thread, and return the results in rank order.
    ///
    /// A panic on any rank is re-raised on the calling thread once every rank has finished.
    pub fn run<T, F>(&self, f: F) -> Vec<T>
    where
        F: Fn(Comm) -> T + Sync,
        T: Send,
    {
        let comms = self.build();
        let f = &f;
        thread::scope(|scope| {
            let handles = comms
                .into_iter()
                .map(|comm| scope.spawn(move || f(comm)))
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
                })
                .collect()
        })
    }
}

/// Run `f` on `size` ranks with the default timeout. See [`ThreadWorld::run`].
pub fn run_spmd<T, F>(size: usize, f: F) -> Vec<T>
where
    F: Fn(Comm) -> T + Sync,
    T: Send,
{
    ThreadWorld::new(size).run(f)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::{partition::evenly_distrib_idxs, ReduceOp};

    #[test]
    fn test_timeout_evicts_stale_messages() {
        let (sender, receiver) = unbounded();
        let mailbox = Mailbox {
            world_rank: 0,
            receiver,
            pending: Mutex::new(HashMap::new()),
            timeout: Duration::from_millis(10),
        };
        let context: ContextId = Arc::new([0]);
        let other: ContextId = Arc::new([0, 1]);
        for (context, seq, source) in [(&context, 0, 0), (&context, 1, 1), (&other, 0, 1)] {
            let envelope = Envelope {
                context: context.clone(),
                seq,
                source,
                payload: Box::new(()),
            };
            sender.send(envelope).unwrap();
        }

        let result = mailbox.receive(&context, 0, 1, 1);
        assert!(matches!(result, Err(CommError::Timeout { seq: 0, .. })));

        let pending = mailbox.pending.lock().unwrap();
        let mut keys = pending.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        assert_eq!(keys, vec![(context.clone(), 1, 1), (other.clone(), 0, 1)]);
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(4)]
    fn test_all_gather(#[case] size: usize) {
        let gathered = run_spmd(size, |comm| comm.all_gather(comm.rank() * 10).unwrap());
        let expected = (0..size).map(|r| r * 10).collect::<Vec<_>>();
        assert!(gathered.iter().all(|g| *g == expected));
    }

    #[test_log::test]
    fn test_all_gather_variable() {
        let results = run_spmd(3, |comm| {
            let (sizes, offsets) = evenly_distrib_idxs(comm.size(), 8);
            let local = (offsets[comm.rank()]..offsets[comm.rank()] + sizes[comm.rank()])
                .map(|i| i as f64)
                .collect::<Vec<_>>();
            comm.all_gather_variable(&local, &sizes, &offsets).unwrap()
        });
        for result in results {
            assert_eq!(result, (0..8).map(|i| i as f64).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_all_reduce() {
        let results = run_spmd(3, |comm| {
            let r = comm.rank() as f64;
            (
                comm.all_reduce(&[r, -r], ReduceOp::Sum).unwrap(),
                comm.all_reduce_scalar(r, ReduceOp::Max).unwrap(),
                comm.all_reduce_scalar(r, ReduceOp::Min).unwrap(),
            )
        });
        for (sum, max, min) in results {
            assert_eq!(sum, vec![3.0, -3.0]);
            assert_eq!(max, 2.0);
            assert_eq!(min, 0.0);
        }
    }

    #[test]
    fn test_broadcast() {
        let results = run_spmd(2, |comm| {
            let value = (comm.rank() == 1).then(|| vec![1.5, 2.5]);
            comm.broadcast(1, value).unwrap()
        });
        assert_eq!(results, vec![vec![1.5, 2.5], vec![1.5, 2.5]]);
    }

    #[test_log::test]
    fn test_split_subsets() {
        // Ranks 0..3 form one communicator, rank 3 opts out; the sub-communicator is then used
        // interleaved with the parent.
        let results = run_spmd(4, |comm| {
            let color = (comm.rank() < 3).then_some(0);
            let sub = comm.split(color).unwrap();
            let sub_sum = sub
                .as_ref()
                .map(|sub| sub.all_reduce_scalar(1.0, ReduceOp::Sum).unwrap());
            let world_sum = comm.all_reduce_scalar(1.0, ReduceOp::Sum).unwrap();
            (sub.map(|s| (s.rank(), s.size())), sub_sum, world_sum)
        });

        assert_eq!(results[0], (Some((0, 3)), Some(3.0), 4.0));
        assert_eq!(results[2], (Some((2, 3)), Some(3.0), 4.0));
        assert_eq!(results[3], (None, None, 4.0));
    }

    #[test]
    fn test_split_by_parity() {
        let results = run_spmd(4, |comm| {
            let sub = comm.split(Some(comm.rank() as u32 % 2)).unwrap().unwrap();
            sub.all_gather(comm.rank()).unwrap()
        });
        assert_eq!(results[0], vec![0, 2]);
        assert_eq!(results[1], vec![1, 3]);
        assert_eq!(results[3], vec![1, 3]);
    }

    #[test]
    fn test_mismatched_collectives_fail() {
        let results = ThreadWorld::new(2)
            .with_timeout(Duration::from_millis(200))
            .run(|comm| {
                if comm.rank() == 0 {
                    comm.all_gather(1.0).map(|_| ())
                } else {
                    Ok(())
                }
            });
        assert!(matches!(
            results[0],
            Err(CommError::Timeout { .. }) | Err(CommError::Disconnected(_))
        ));
        assert!(results[1].is_ok());
    }

    #[test]
    fn test_type_mismatch() {
        let results = run_spmd(2, |comm| {
            if comm.rank() == 0 {
                comm.all_gather(1.0_f64).map(|_| ())
            } else {
                comm.all_gather(1_u8).map(|_| ())
            }
        });
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(CommError::TypeMismatch { .. }))));
    }
}
