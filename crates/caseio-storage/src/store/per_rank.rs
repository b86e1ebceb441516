//! One `processor<rank>` directory per rank

use super::{CaseStore, SlotOwner, StoreContext};
use crate::object::StoredObject;
use crate::resolver::{PathResolver, ResolveOptions};
use caseio_comm::Transport;
use caseio_common::config::IoStrategy;
use caseio_common::{ObjectIdentity, Rank, Result};

/// Store where every rank owns its directory
pub struct PerRankStore<T: Transport> {
    ctx: StoreContext<T>,
}

impl<T: Transport> PerRankStore<T> {
    pub(crate) fn new(ctx: StoreContext<T>) -> Self {
        Self { ctx }
    }
}

impl<T: Transport> CaseStore for PerRankStore<T> {
    fn strategy(&self) -> IoStrategy {
        IoStrategy::PerRank
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

    fn write_master_only(&self, id: &ObjectIdentity, object: &StoredObject) -> Result<()> {
        let path = self.ctx.resolver.object_path(id);
        let result = self.ctx.master_write(|| self.ctx.write_file(&path, object));
        self.ctx.invalidate(id);
        result
    }

    fn write_per_rank(&self, id: &ObjectIdentity, object: &StoredObject) -> Result<()> {
        let path = self.ctx.resolver.object_path(id);
        let result = self.ctx.write_file(&path, object);
        self.ctx.invalidate(id);
        result
    }
}
