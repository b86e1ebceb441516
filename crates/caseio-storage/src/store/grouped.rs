//! Ranks grouped into `processors<N>(a-b)` block containers

use super::{CaseStore, SlotOwner, StoreContext};
use crate::object::StoredObject;
use crate::processor::group_dir_name;
use crate::resolver::{PathResolver, ResolveOptions};
use crate::store::read::pack_container;
use bytes::Bytes;
use caseio_comm::Transport;
use caseio_common::config::IoStrategy;
use caseio_common::{DecomposedDirectoryGroup, ObjectIdentity, Rank, Result};
use tracing::debug;

/// Split `rank_count` ranks into consecutive groups of `group_size`
///
/// A zero group size puts every rank into one group; the last group may
/// be short.
#[must_use]
pub fn rank_groups(rank_count: u32, group_size: u32) -> Vec<DecomposedDirectoryGroup> {
    let size = if group_size == 0 {
        rank_count
    } else {
        group_size.min(rank_count)
    };
    if size == 0 {
        return Vec::new();
    }

    (0..rank_count)
        .step_by(size as usize)
        .map(|start| {
            let group_size = size.min(rank_count - start);
            DecomposedDirectoryGroup {
                name: group_dir_name(rank_count, Rank::new(start), group_size),
                group_start: Rank::new(start),
                group_size,
                total: Some(rank_count),
            }
        })
        .collect()
}

/// Store where each rank group shares one container file
pub struct GroupedStore<T: Transport> {
    ctx: StoreContext<T>,
    groups: Vec<DecomposedDirectoryGroup>,
}

impl<T: Transport> GroupedStore<T> {
    pub(crate) fn new(ctx: StoreContext<T>, group_size: u32) -> Self {
        let groups = rank_groups(ctx.size(), group_size);
        Self { ctx, groups }
    }

    /// Groups containers are written for
    pub fn groups(&self) -> &[DecomposedDirectoryGroup] {
        &self.groups
    }

    fn write_groups<F>(&self, id: &ObjectIdentity, mut blocks_for: F) -> Result<()>
    where
        F: FnMut(&DecomposedDirectoryGroup) -> Vec<Bytes>,
    {
        for group in &self.groups {
            let path = self.ctx.resolver.group_object_path(id, group);
            let blocks = blocks_for(group);
            debug!(path = %path.display(), ranks = blocks.len(), "Packing group container");
            let container = pack_container(group.group_start, &blocks, self.ctx.size())?;
            self.ctx.write_file(&path, &container)?;
        }
        Ok(())
    }
}

impl<T: Transport> CaseStore for GroupedStore<T> {
    fn strategy(&self) -> IoStrategy {
        IoStrategy::Grouped
    }

    fn rank(&self) -> Rank {
        self.ctx.rank()
    }

    fn resolver(&self) -> &PathResolver {
        &self.ctx.resolver
    }

    fn options(&self) -> &ResolveOptions {
        &self.ctx.options
    }

    fn read_master_only(&self, id: &ObjectIdentity, class: Option<&str>) -> Result<StoredObject> {
        self.ctx.master_read(id, class, SlotOwner::Master)
    }

    fn read_per_rank(&self, id: &ObjectIdentity, class: Option<&str>) -> Result<StoredObject> {
        self.ctx.local_read(id, class)
    }

    /// Every slot of every group receives the master's object
    fn write_master_only(&self, id: &ObjectIdentity, object: &StoredObject) -> Result<()> {
        let result = self.ctx.master_write(|| {
            let encoded = object.encode()?;
            self.write_groups(id, |group| vec![encoded.clone(); group.group_size as usize])
        });
        self.ctx.invalidate(id);
        result
    }

    fn write_per_rank(&self, id: &ObjectIdentity, object: &StoredObject) -> Result<()> {
        let result = self.ctx.gather_write(object, |blocks| {
            self.write_groups(id, |group| {
                let start = group.group_start.index();
                blocks[start..start + group.group_size as usize].to_vec()
            })
        });
        self.ctx.invalidate(id);
        result
    }
}
