//! Data transfers along connections.
//!
//! A [`TransferPlan`] is resolved once per connection at setup from what every rank knows about
//! both endpoints. Forward transfers copy source values into the destination input; reverse
//! transfers accumulate the destination's derivative back into the source.

use std::ops::Range;

use itertools::Itertools;
use mdao_dist::{partition::offsets_from_sizes, Comm, CommError, ReduceOp};

use crate::{vector::VarId, SetupError};

/// How the entries of an endpoint are spread over the ranks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Distribution {
    /// Every active rank holds the same entries.
    Replicated,
    /// Every rank holds one contiguous run of entries and no entry is held twice.
    Contiguous,
    /// Ranks hold disjoint, arbitrarily ordered entries.
    Arbitrary,
    /// Some entry is held by more than one rank.
    Overlapping,
}

/// One rank's view of a connection, gathered from every rank at setup.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RankEndpoints {
    pub src_active: bool,
    pub src_size: usize,
    pub dst_active: bool,
    pub dst_size: usize,
    pub src_indices: Option<Vec<i64>>,
}

/// The parts of a connection every rank agrees on.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Endpoints<'a> {
    pub src: &'a str,
    pub dst: &'a str,
    pub src_distributed: bool,
    pub dst_distributed: bool,
}

#[derive(Clone, Debug, PartialEq)]
enum Forward {
    /// Every destination entry is found in the local source buffer.
    Local {
        indices: Vec<usize>,
        run: Option<usize>,
    },
    /// Assemble the global source first.
    Gather {
        sizes: Vec<usize>,
        offsets: Vec<usize>,
        contribute: bool,
        indices: Vec<usize>,
        run: Option<usize>,
    },
}

#[derive(Clone, Debug, PartialEq)]
enum Reverse {
    Local {
        indices: Vec<usize>,
    },
    /// Sum the contributions of all ranks into a global buffer, then keep the local source range.
    Reduce {
        len: usize,
        contribute: bool,
        indices: Vec<usize>,
        take: Range<usize>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransferPlan {
    src_distribution: Distribution,
    dst_distribution: Distribution,
    forward: Forward,
    reverse: Reverse,
}

impl TransferPlan {
    /// Resolve the plan for `rank`.
    pub(crate) fn build(
        rank: usize,
        ends: Endpoints<'_>,
        ranks: &[RankEndpoints],
    ) -> Result<Self, SetupError> {
        let src_owner = ranks
            .iter()
            .position(|r| r.src_active)
            .ok_or_else(|| SetupError::InconsistentDeclaration(ends.src.to_owned()))?;

        let sizes = if ends.src_distributed {
            ranks
                .iter()
                .map(|r| if r.src_active { r.src_size } else { 0 })
                .collect::<Vec<_>>()
        } else {
            let len = ranks[src_owner].src_size;
            if ranks.iter().any(|r| r.src_active && r.src_size != len) {
                return Err(SetupError::InconsistentDeclaration(ends.src.to_owned()));
            }
            (0..ranks.len())
                .map(|r| if r == src_owner { len } else { 0 })
                .collect()
        };
        let offsets = offsets_from_sizes(&sizes);
        let len = sizes.iter().sum::<usize>();

        let parts = ranks
            .iter()
            .enumerate()
            .map(|(q, r)| global_indices(ends, r, len, offsets[q]..offsets[q] + sizes[q]))
            .collect::<Result<Vec<_>, _>>()?;

        let active_parts = ranks
            .iter()
            .zip(&parts)
            .filter(|(r, _)| r.dst_active)
            .map(|(_, part)| part.as_slice())
            .collect::<Vec<_>>();
        let dst_distribution = if !ends.dst_distributed && active_parts.iter().all_equal() {
            Distribution::Replicated
        } else {
            classify(&active_parts)
        };
        let src_distribution = if ends.src_distributed {
            Distribution::Contiguous
        } else {
            Distribution::Replicated
        };

        let within_own = |q: usize| {
            let own = offsets[q]..offsets[q] + sizes[q];
            ranks[q].src_active
                && (!ends.src_distributed || parts[q].iter().all(|i| own.contains(i)))
        };
        let local = (0..ranks.len())
            .filter(|q| ranks[*q].dst_active)
            .all(within_own);

        let part = &parts[rank];
        let forward = if local {
            let base = if ends.src_distributed { offsets[rank] } else { 0 };
            let indices = part.iter().map(|i| i - base).collect::<Vec<_>>();
            Forward::Local {
                run: contiguous_start(&indices),
                indices,
            }
        } else {
            Forward::Gather {
                sizes: sizes.clone(),
                offsets: offsets.clone(),
                contribute: sizes[rank] > 0,
                run: contiguous_start(part),
                indices: part.clone(),
            }
        };

        let same_ranks = ranks.iter().all(|r| r.src_active == r.dst_active);
        let reverse = match &forward {
            Forward::Local { indices, .. }
                if ends.src_distributed
                    || (dst_distribution == Distribution::Replicated && same_ranks) =>
            {
                Reverse::Local {
                    indices: indices.clone(),
                }
            }
            _ => {
                let dst_owner = ranks.iter().position(|r| r.dst_active);
                let take = match (ranks[rank].src_active, ends.src_distributed) {
                    (false, _) => 0..0,
                    (true, true) => offsets[rank]..offsets[rank] + sizes[rank],
                    (true, false) => 0..len,
                };
                Reverse::Reduce {
                    len,
                    contribute: ranks[rank].dst_active
                        && (dst_distribution != Distribution::Replicated
                            || dst_owner == Some(rank)),
                    indices: part.clone(),
                    take,
                }
            }
        };

        Ok(Self {
            src_distribution,
            dst_distribution,
            forward,
            reverse,
        })
    }

    pub fn src_distribution(&self) -> Distribution {
        self.src_distribution
    }

    pub fn dst_distribution(&self) -> Distribution {
        self.dst_distribution
    }

    /// Whether the forward transfer runs without communication.
    pub fn is_local(&self) -> bool {
        matches!(self.forward, Forward::Local { .. })
    }

    /// Overwrite `dst` with the source entries it reads.
    pub(crate) fn forward(
        &self,
        comm: &Comm,
        src: &[f64],
        dst: &mut [f64],
    ) -> Result<(), CommError> {
        match &self.forward {
            Forward::Local { indices, run } => select(src, indices, *run, dst),
            Forward::Gather {
                sizes,
                offsets,
                contribute,
                indices,
                run,
            } => {
                let local = if *contribute { src } else { &[] };
                let global = comm.all_gather_variable(local, sizes, offsets)?;
                select(&global, indices, *run, dst);
            }
        }
        Ok(())
    }

    /// Add the derivative held by the destination to the source entries it was read from.
    /// Entries read more than once accumulate every contribution.
    pub(crate) fn reverse(
        &self,
        comm: &Comm,
        dst: &[f64],
        src: &mut [f64],
    ) -> Result<(), CommError> {
        match &self.reverse {
            Reverse::Local { indices } => scatter_add(dst, indices, src),
            Reverse::Reduce {
                len,
                contribute,
                indices,
                take,
            } => {
                let mut global = vec![0.0; *len];
                if *contribute {
                    scatter_add(dst, indices, &mut global);
                }
                let global = comm.all_reduce(&global, ReduceOp::Sum)?;
                src.iter_mut()
                    .zip(&global[take.clone()])
                    .for_each(|(s, g)| *s += g);
            }
        }
        Ok(())
    }
}

/// Where a variable lives, relative to the group owning a transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Locator {
    /// Subsystem indices down to the component; never empty.
    pub path: Vec<usize>,
    pub var: VarId,
}

impl Locator {
    pub fn child(&self) -> usize {
        self.path[0]
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Transfer {
    pub src: Locator,
    pub dst: Locator,
    pub plan: TransferPlan,
}

/// Classify how disjoint and ordered a set of per-rank index lists is.
pub(crate) fn classify(parts: &[&[usize]]) -> Distribution {
    let overlapping = parts
        .iter()
        .flat_map(|part| part.iter().unique())
        .duplicates()
        .next()
        .is_some();
    if overlapping {
        Distribution::Overlapping
    } else if parts
        .iter()
        .all(|part| part.is_empty() || contiguous_start(part).is_some())
    {
        Distribution::Contiguous
    } else {
        Distribution::Arbitrary
    }
}

/// Global source indices one rank's destination reads, with negative indices resolved.
fn global_indices(
    ends: Endpoints<'_>,
    rank: &RankEndpoints,
    len: usize,
    own: Range<usize>,
) -> Result<Vec<usize>, SetupError> {
    if !rank.dst_active {
        return Ok(Vec::new());
    }
    let indices = match &rank.src_indices {
        Some(raw) => raw
            .iter()
            .map(|&index| {
                let resolved = if index < 0 { index + len as i64 } else { index };
                usize::try_from(resolved)
                    .ok()
                    .filter(|i| *i < len)
                    .ok_or_else(|| SetupError::SourceIndexOutOfRange {
                        variable: ends.dst.to_owned(),
                        index,
                        len,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?,
        None if ends.src_distributed && ends.dst_distributed => own.collect(),
        None => (0..len).collect(),
    };
    if indices.len() != rank.dst_size {
        return Err(SetupError::ShapeMismatch {
            variable: ends.dst.to_owned(),
            expected: indices.len(),
            found: rank.dst_size,
        });
    }
    Ok(indices)
}

fn contiguous_start(indices: &[usize]) -> Option<usize> {
    let first = *indices.first()?;
    indices
        .iter()
        .tuple_windows()
        .all(|(a, b)| *b == a + 1)
        .then_some(first)
}

fn select(src: &[f64], indices: &[usize], run: Option<usize>, dst: &mut [f64]) {
    match run {
        Some(start) => dst.copy_from_slice(&src[start..start + dst.len()]),
        None => dst
            .iter_mut()
            .zip(indices)
            .for_each(|(d, i)| *d = src[*i]),
    }
}

fn scatter_add(values: &[f64], indices: &[usize], target: &mut [f64]) {
    for (value, i) in values.iter().zip(indices) {
        target[*i] += value;
    }
}

#[cfg(test)]
mod tests {
    use mdao_dist::partition::{evenly_distrib_idxs, take_nth};
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;

    const REPLICATED: Endpoints<'static> = Endpoints {
        src: "A.y",
        dst: "B.x",
        src_distributed: false,
        dst_distributed: false,
    };

    fn rank(size: usize, dst_size: usize, src_indices: Option<Vec<i64>>) -> RankEndpoints {
        RankEndpoints {
            src_active: true,
            src_size: size,
            dst_active: true,
            dst_size,
            src_indices,
        }
    }

    fn indices(range: Range<usize>) -> Option<Vec<i64>> {
        Some(range.map(|i| i as i64).collect())
    }

    #[test]
    fn test_replicated_to_replicated() {
        let ranks = vec![rank(4, 4, None), rank(4, 4, None)];
        let plan = TransferPlan::build(1, REPLICATED, &ranks).unwrap();
        assert_eq!(plan.src_distribution(), Distribution::Replicated);
        assert_eq!(plan.dst_distribution(), Distribution::Replicated);
        assert_eq!(
            plan.forward,
            Forward::Local {
                indices: vec![0, 1, 2, 3],
                run: Some(0)
            }
        );
        assert!(matches!(plan.reverse, Reverse::Local { .. }));
    }

    #[test]
    fn test_replicated_to_partitioned() {
        let ends = Endpoints {
            dst_distributed: true,
            ..REPLICATED
        };
        let ranks = vec![rank(11, 6, indices(0..6)), rank(11, 5, indices(6..11))];

        let plan = TransferPlan::build(1, ends, &ranks).unwrap();
        assert_eq!(plan.dst_distribution(), Distribution::Contiguous);
        assert_eq!(
            plan.forward,
            Forward::Local {
                indices: (6..11).collect(),
                run: Some(6)
            }
        );
        // Both ranks contribute to the replicated source's derivative.
        assert_eq!(
            plan.reverse,
            Reverse::Reduce {
                len: 11,
                contribute: true,
                indices: (6..11).collect(),
                take: 0..11
            }
        );
    }

    #[test]
    fn test_partitioned_to_replicated() {
        let ends = Endpoints {
            src_distributed: true,
            ..REPLICATED
        };
        let ranks = vec![rank(6, 11, None), rank(5, 11, None)];

        let plan = TransferPlan::build(1, ends, &ranks).unwrap();
        assert_eq!(plan.src_distribution(), Distribution::Contiguous);
        assert_eq!(plan.dst_distribution(), Distribution::Replicated);
        assert_eq!(
            plan.forward,
            Forward::Gather {
                sizes: vec![6, 5],
                offsets: vec![0, 6],
                contribute: true,
                indices: (0..11).collect(),
                run: Some(0),
            }
        );
        // Replicated derivatives are only counted once.
        assert_eq!(
            plan.reverse,
            Reverse::Reduce {
                len: 11,
                contribute: false,
                indices: (0..11).collect(),
                take: 6..11
            }
        );
    }

    #[test]
    fn test_partitioned_to_partitioned_defaults_to_rank_slice() {
        let ends = Endpoints {
            src_distributed: true,
            dst_distributed: true,
            ..REPLICATED
        };
        let ranks = vec![rank(6, 6, None), rank(5, 5, None)];

        let plan = TransferPlan::build(1, ends, &ranks).unwrap();
        assert!(plan.is_local());
        assert_eq!(
            plan.forward,
            Forward::Local {
                indices: (0..5).collect(),
                run: Some(0)
            }
        );
        assert_eq!(
            plan.reverse,
            Reverse::Local {
                indices: (0..5).collect()
            }
        );
    }

    #[rstest]
    #[case::contiguous(vec![vec![0, 1, 2], vec![3, 4]], Distribution::Contiguous)]
    #[case::strided(vec![vec![0, 2, 4], vec![1, 3]], Distribution::Arbitrary)]
    #[case::reversed(vec![vec![2, 1, 0], vec![3, 4]], Distribution::Arbitrary)]
    #[case::overlapping(vec![(0..8).collect(), (4..11).collect()], Distribution::Overlapping)]
    #[case::repeated_within_rank(vec![vec![0, 0], vec![1]], Distribution::Arbitrary)]
    #[case::empty_rank(vec![vec![0, 1], vec![]], Distribution::Contiguous)]
    fn test_classify(#[case] parts: Vec<Vec<usize>>, #[case] expected: Distribution) {
        let parts = parts.iter().map(Vec::as_slice).collect::<Vec<_>>();
        assert_eq!(classify(&parts), expected);
    }

    #[test]
    fn test_negative_indices() {
        let ranks = vec![rank(5, 3, Some(vec![0, 1, 2])), rank(5, 2, Some(vec![3, -1]))];
        let plan = TransferPlan::build(1, REPLICATED, &ranks).unwrap();
        assert_eq!(plan.dst_distribution(), Distribution::Contiguous);
        assert_eq!(
            plan.forward,
            Forward::Local {
                indices: vec![3, 4],
                run: Some(3)
            }
        );
    }

    #[rstest]
    #[case::too_large(5)]
    #[case::too_negative(-6)]
    fn test_index_out_of_range(#[case] index: i64) {
        let ranks = vec![rank(5, 1, Some(vec![index]))];
        assert_eq!(
            TransferPlan::build(0, REPLICATED, &ranks),
            Err(SetupError::SourceIndexOutOfRange {
                variable: "B.x".to_owned(),
                index,
                len: 5
            })
        );
    }

    #[test]
    fn test_size_mismatch() {
        let ranks = vec![rank(5, 4, None)];
        assert_eq!(
            TransferPlan::build(0, REPLICATED, &ranks),
            Err(SetupError::ShapeMismatch {
                variable: "B.x".to_owned(),
                expected: 5,
                found: 4
            })
        );
    }

    #[test]
    fn test_inactive_destination_rank() {
        let mut idle = rank(4, 0, None);
        idle.dst_active = false;
        let ranks = vec![rank(4, 4, None), idle];

        let plan = TransferPlan::build(1, REPLICATED, &ranks).unwrap();
        assert_eq!(plan.dst_distribution(), Distribution::Replicated);
        assert_eq!(
            plan.forward,
            Forward::Local {
                indices: vec![],
                run: None
            }
        );
        assert!(matches!(plan.reverse, Reverse::Reduce { contribute: false, .. }));
    }

    #[test]
    fn test_local_execution() {
        let comm = Comm::serial();
        let ranks = vec![rank(4, 3, Some(vec![3, 1, 1]))];
        let plan = TransferPlan::build(0, REPLICATED, &ranks).unwrap();

        let mut dst = [0.0; 3];
        plan.forward(&comm, &[10.0, 11.0, 12.0, 13.0], &mut dst).unwrap();
        assert_eq!(dst, [13.0, 11.0, 11.0]);

        let mut src = [1.0; 4];
        plan.reverse(&comm, &[1.0, 2.0, 3.0], &mut src).unwrap();
        assert_eq!(src, [1.0, 6.0, 1.0, 2.0]);
    }

    #[cfg(feature = "threads")]
    #[test]
    fn test_overlapping_reverse_accumulates() {
        use mdao_dist::run_spmd;

        let ends = Endpoints {
            dst_distributed: true,
            ..REPLICATED
        };
        let ranks = vec![rank(11, 8, indices(0..8)), rank(11, 7, indices(4..11))];

        let results = run_spmd(2, |comm| {
            let plan = TransferPlan::build(comm.rank(), ends, &ranks).unwrap();
            assert_eq!(plan.dst_distribution(), Distribution::Overlapping);

            let src = (0..11).map(f64::from).collect::<Vec<_>>();
            let mut dst = vec![0.0; ranks[comm.rank()].dst_size];
            plan.forward(&comm, &src, &mut dst).unwrap();

            let seeds = vec![1.0; dst.len()];
            let mut d_src = vec![0.0; 11];
            plan.reverse(&comm, &seeds, &mut d_src).unwrap();
            (dst, d_src)
        });

        assert_eq!(results[0].0, (0..8).map(f64::from).collect::<Vec<_>>());
        assert_eq!(results[1].0, (4..11).map(f64::from).collect::<Vec<_>>());
        let expected = [1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0, 1.0, 1.0, 1.0];
        assert_eq!(results[0].1, expected);
        assert_eq!(results[1].1, expected);
    }

    #[cfg(feature = "threads")]
    #[test]
    fn test_gather_from_partitioned_source() {
        use mdao_dist::run_spmd;

        let ends = Endpoints {
            src_distributed: true,
            dst_distributed: true,
            ..REPLICATED
        };
        // Strided destination: every rank reads entries held by the other one.
        let ranks = vec![
            rank(6, 6, Some(take_nth(0, 2, 0..11).map(|i| i as i64).collect())),
            rank(5, 5, Some(take_nth(1, 2, 0..11).map(|i| i as i64).collect())),
        ];

        let results = run_spmd(2, |comm| {
            let plan = TransferPlan::build(comm.rank(), ends, &ranks).unwrap();
            assert_eq!(plan.dst_distribution(), Distribution::Arbitrary);
            assert!(!plan.is_local());

            let (sizes, offsets) = evenly_distrib_idxs(2, 11);
            let own = offsets[comm.rank()]..offsets[comm.rank()] + sizes[comm.rank()];
            let src = own.map(|i| i as f64).collect::<Vec<_>>();
            let mut dst = vec![0.0; ranks[comm.rank()].dst_size];
            plan.forward(&comm, &src, &mut dst).unwrap();
            dst
        });

        assert_eq!(results[0], vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0]);
        assert_eq!(results[1], vec![1.0, 3.0, 5.0, 7.0, 9.0]);
    }

    proptest! {
        #[test]
        fn even_partitions_are_complete(n in 1usize..8, len in 0usize..64) {
            let ends = Endpoints { dst_distributed: true, ..REPLICATED };
            let (sizes, offsets) = evenly_distrib_idxs(n, len);
            let ranks = sizes
                .iter()
                .zip(&offsets)
                .map(|(size, offset)| rank(len, *size, indices(*offset..offset + size)))
                .collect::<Vec<_>>();

            let mut covered = vec![0u32; len];
            for r in 0..n {
                let plan = TransferPlan::build(r, ends, &ranks).unwrap();
                prop_assert!(plan.is_local());
                prop_assert_eq!(plan.dst_distribution(), Distribution::Contiguous);
                if let Forward::Local { indices, .. } = &plan.forward {
                    indices.iter().for_each(|i| covered[*i] += 1);
                }
            }
            prop_assert!(covered.iter().all(|c| *c == 1));
        }
    }
}
