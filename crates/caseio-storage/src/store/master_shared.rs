//! A single undecomposed copy, read and written by the master

use super::{CaseStore, SlotOwner, StoreContext};
use crate::object::StoredObject;
use crate::resolver::{PathResolver, ResolveOptions};
use crate::store::read::pack_container;
use caseio_comm::Transport;
use caseio_common::config::IoStrategy;
use caseio_common::{ObjectIdentity, Rank, Result};
use tracing::debug;

/// Store where only the master touches the filesystem
///
/// Per-rank data lives in one container at the undecomposed path with a
/// slot per rank.
pub struct MasterSharedStore<T: Transport> {
    ctx: StoreContext<T>,
}

impl<T: Transport> MasterSharedStore<T> {
    pub(crate) fn new(ctx: StoreContext<T>) -> Self {
        Self { ctx }
    }
}

impl<T: Transport> CaseStore for MasterSharedStore<T> {
    fn strategy(&self) -> IoStrategy {
        IoStrategy::MasterShared
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
        self.ctx.master_read(id, class, SlotOwner::Each)
    }

    fn write_master_only(&self, id: &ObjectIdentity, object: &StoredObject) -> Result<()> {
        let path = self.ctx.resolver.global_object_path(id);
        let result = self.ctx.master_write(|| self.ctx.write_file(&path, object));
        self.ctx.invalidate(id);
        result
    }

    fn write_per_rank(&self, id: &ObjectIdentity, object: &StoredObject) -> Result<()> {
        let path = self.ctx.resolver.global_object_path(id);
        let total = self.ctx.size();
        let result = self.ctx.gather_write(object, |blocks| {
            debug!(path = %path.display(), ranks = blocks.len(), "Packing shared container");
            let container = pack_container(Rank::new(0), &blocks, total)?;
            self.ctx.write_file(&path, &container)
        });
        self.ctx.invalidate(id);
        result
    }
}
