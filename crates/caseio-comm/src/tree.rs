//! Communication tree topology
//!
//! The schedule is a pure function of `(rank_count, rank, root)`: small
//! runs relay along a linear chain, larger runs use a balanced
//! `fanout`-ary tree so broadcast depth stays logarithmic. Ranks are
//! rotated so that `root` always sits at the top.

use caseio_common::config::CommConfig;
use caseio_common::{Error, Rank, RankInfo, Result};

/// Shape of the relay schedule
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Topology {
    /// Rank `i` receives from `i - 1`
    Linear,
    /// Rank `i` receives from `(i - 1) / fanout`
    Tree { fanout: u32 },
}

/// Selects a topology for a run and lays ranks out on it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommunicationTree {
    /// Rank counts below this use a linear chain
    threshold: u32,
    /// Children per interior node of the tree topology
    fanout: u32,
}

impl CommunicationTree {
    /// Create a schedule; a zero fanout is treated as 1
    #[must_use]
    pub fn new(threshold: u32, fanout: u32) -> Self {
        Self {
            threshold,
            fanout: fanout.max(1),
        }
    }

    /// Schedule described by a communication config
    #[must_use]
    pub fn from_config(config: &CommConfig) -> Self {
        Self::new(config.tree_threshold, config.fanout)
    }

    /// Topology used for a run of `rank_count` ranks
    #[must_use]
    pub fn topology(&self, rank_count: u32) -> Topology {
        if rank_count < self.threshold {
            Topology::Linear
        } else {
            Topology::Tree {
                fanout: self.fanout,
            }
        }
    }

    /// Position of `rank` when `root` starts the collective
    pub fn build(&self, rank_count: u32, rank: Rank, root: Rank) -> Result<RankInfo> {
        if rank.get() >= rank_count || root.get() >= rank_count {
            return Err(Error::invalid_argument(format!(
                "rank {rank} / root {root} outside run of {rank_count} ranks"
            )));
        }
        Ok(layout(rank_count, rank, root, self.topology(rank_count)))
    }
}

impl Default for CommunicationTree {
    fn default() -> Self {
        Self::from_config(&CommConfig::default())
    }
}

/// Lay out one rank on a topology
///
/// Callers must pass `rank < rank_count` and `root < rank_count`.
#[must_use]
pub fn layout(rank_count: u32, rank: Rank, root: Rank, topology: Topology) -> RankInfo {
    let n = u64::from(rank_count);
    let root = u64::from(root.get());
    let virt = (u64::from(rank.get()) + n - root) % n;
    let real = |v: u64| Rank::new(((v + root) % n) as u32);

    let (parent, children) = match topology {
        Topology::Linear => {
            let parent = virt.checked_sub(1);
            let children = (virt + 1 < n).then_some(virt + 1).into_iter().collect::<Vec<_>>();
            (parent, children)
        }
        Topology::Tree { fanout } => {
            let k = u64::from(fanout.max(1));
            let parent = (virt > 0).then(|| (virt - 1) / k);
            let first = virt * k + 1;
            let children = (first..first + k).take_while(|c| *c < n).collect::<Vec<_>>();
            (parent, children)
        }
    };

    RankInfo {
        rank,
        rank_count,
        parent: parent.map(real),
        children: children.into_iter().map(real).collect(),
    }
}

/// Number of relay hops from the root to the deepest rank
#[must_use]
pub fn depth(rank_count: u32, topology: Topology) -> u32 {
    if rank_count <= 1 {
        return 0;
    }
    match topology {
        Topology::Linear => rank_count - 1,
        Topology::Tree { fanout } => {
            let k = u64::from(fanout.max(1));
            let mut virt = u64::from(rank_count) - 1;
            let mut hops = 0;
            while virt > 0 {
                virt = (virt - 1) / k;
                hops += 1;
            }
            hops
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn all_ranks(n: u32, root: u32, topology: Topology) -> Vec<RankInfo> {
        (0..n)
            .map(|r| layout(n, Rank::new(r), Rank::new(root), topology))
            .collect()
    }

    #[test]
    fn test_linear_chain() {
        let infos = all_ranks(4, 0, Topology::Linear);
        assert_eq!(infos[0].parent, None);
        assert_eq!(infos[0].children, vec![Rank::new(1)]);
        assert_eq!(infos[2].parent, Some(Rank::new(1)));
        assert_eq!(infos[2].children, vec![Rank::new(3)]);
        assert!(infos[3].is_leaf());
    }

    #[test]
    fn test_linear_chain_rotated_root() {
        let infos = all_ranks(4, 2, Topology::Linear);
        assert!(infos[2].is_root());
        assert_eq!(infos[3].parent, Some(Rank::new(2)));
        assert_eq!(infos[0].parent, Some(Rank::new(3)));
        assert_eq!(infos[1].parent, Some(Rank::new(0)));
        assert!(infos[1].is_leaf());
    }

    #[test]
    fn test_tree_children_order() {
        let infos = all_ranks(7, 0, Topology::Tree { fanout: 2 });
        assert_eq!(infos[0].children, vec![Rank::new(1), Rank::new(2)]);
        assert_eq!(infos[1].children, vec![Rank::new(3), Rank::new(4)]);
        assert_eq!(infos[2].children, vec![Rank::new(5), Rank::new(6)]);
        assert_eq!(infos[6].parent, Some(Rank::new(2)));
    }

    #[test]
    fn test_every_rank_reached_once() {
        for topology in [
            Topology::Linear,
            Topology::Tree { fanout: 2 },
            Topology::Tree { fanout: 3 },
        ] {
            for n in [1u32, 2, 3, 7, 16, 100] {
                for root in [0, n / 2, n - 1] {
                    let infos = all_ranks(n, root, topology);
                    let mut seen = HashSet::new();
                    for info in &infos {
                        for child in &info.children {
                            assert!(seen.insert(*child), "{child} reached twice");
                            assert_eq!(infos[child.index()].parent, Some(info.rank));
                        }
                    }
                    assert_eq!(seen.len() as u32, n - 1);
                    assert!(!seen.contains(&Rank::new(root)));
                    assert_eq!(infos.iter().filter(|i| i.is_root()).count(), 1);
                }
            }
        }
    }

    #[test]
    fn test_topology_threshold() {
        let tree = CommunicationTree::new(16, 2);
        assert_eq!(tree.topology(15), Topology::Linear);
        assert_eq!(tree.topology(16), Topology::Tree { fanout: 2 });
        assert_eq!(CommunicationTree::new(0, 0).topology(1), Topology::Tree { fanout: 1 });
    }

    #[test]
    fn test_tree_depth_is_logarithmic() {
        let tree = Topology::Tree { fanout: 2 };
        assert_eq!(depth(1, tree), 0);
        assert_eq!(depth(3, tree), 1);
        assert_eq!(depth(7, tree), 2);
        assert_eq!(depth(100, tree), 6);
        assert_eq!(depth(1024, tree), 10);
        assert_eq!(depth(100, Topology::Linear), 99);
    }

    #[test]
    fn test_build_rejects_out_of_range() {
        let tree = CommunicationTree::default();
        assert!(tree.build(4, Rank::new(4), Rank::MASTER).is_err());
        assert!(tree.build(4, Rank::new(1), Rank::new(9)).is_err());
        let info = tree.build(4, Rank::new(1), Rank::MASTER).unwrap();
        assert_eq!(info.rank_count, 4);
    }
}
