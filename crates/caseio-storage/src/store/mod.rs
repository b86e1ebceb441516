//! Object store strategies
//!
//! Each strategy is a [`CaseStore`] implementation chosen when the case
//! is opened:
//!
//! | Strategy        | Read location                | Per-rank write                    |
//! |-----------------|------------------------------|-----------------------------------|
//! | `per-rank`      | `processor<rank>`            | every rank writes its own file    |
//! | `master-shared` | undecomposed root            | master writes one container       |
//! | `grouped`       | `processors<N>(a-b)`         | master writes one container/group |
//!
//! Master-only operations touch the filesystem on the master rank alone
//! and share the outcome with a collective, so every rank sees the same
//! success or failure.

mod grouped;
mod master_shared;
mod per_rank;
mod read;

pub use grouped::GroupedStore;
pub use master_shared::MasterSharedStore;
pub use per_rank::PerRankStore;
pub use read::ReadStage;

use crate::dir_cache::DirectoryCache;
use crate::object::StoredObject;
use crate::resolver::{PathResolver, ResolveOptions};
use bytes::Bytes;
use caseio_comm::{Communicator, Transport};
use caseio_common::config::IoStrategy;
use caseio_common::{CaseLayout, Config, Error, ObjectIdentity, Rank, Result};
use read::{ReadTrace, load_object, read_object, unwrap_for_rank, write_object_file};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Reads and writes objects of one case for one rank
pub trait CaseStore: Send {
    /// Strategy this store implements
    fn strategy(&self) -> IoStrategy;

    /// This rank
    fn rank(&self) -> Rank;

    /// Resolver used for local lookups
    fn resolver(&self) -> &PathResolver;

    /// Lookup options from the resolver configuration
    fn options(&self) -> &ResolveOptions;

    /// Locate an object without reading it
    fn resolve(&self, id: &ObjectIdentity) -> Option<PathBuf> {
        self.resolver().resolve(id, self.options())
    }

    /// Master reads, every rank receives the same object
    fn read_master_only(&self, id: &ObjectIdentity, class: Option<&str>) -> Result<StoredObject>;

    /// Every rank receives its own object
    fn read_per_rank(&self, id: &ObjectIdentity, class: Option<&str>) -> Result<StoredObject>;

    /// Master writes the object; every rank learns the outcome
    fn write_master_only(&self, id: &ObjectIdentity, object: &StoredObject) -> Result<()>;

    /// Every rank contributes its own object
    fn write_per_rank(&self, id: &ObjectIdentity, object: &StoredObject) -> Result<()>;

    /// Rank-local directory cache
    fn directory_cache(&self) -> &Arc<DirectoryCache> {
        self.resolver().directory_cache()
    }
}

/// Open a store for `layout` using `config.io.strategy`
pub fn open_store<T: Transport + 'static>(
    layout: CaseLayout,
    comm: Communicator<T>,
    config: &Config,
) -> Result<Box<dyn CaseStore>> {
    config.validate()?;
    let master = config.io.master();
    if master.get() >= comm.size() {
        return Err(Error::configuration(format!(
            "master rank {master} outside run of {} ranks",
            comm.size()
        )));
    }
    if layout.decomposed && layout.rank_count != comm.size() {
        return Err(Error::configuration(format!(
            "case decomposed for {} ranks, run has {}",
            layout.rank_count,
            comm.size()
        )));
    }

    info!(
        rank = %comm.rank(),
        strategy = config.io.strategy.as_str(),
        root = %layout.root.display(),
        "Opening case store"
    );
    let options = ResolveOptions::from_config(&config.resolver);
    let store: Box<dyn CaseStore> = match config.io.strategy {
        IoStrategy::PerRank => Box::new(PerRankStore::new(StoreContext::new(
            layout, comm, options, master,
        ))),
        IoStrategy::MasterShared => Box::new(MasterSharedStore::new(StoreContext::new(
            layout.as_undecomposed(),
            comm,
            options,
            master,
        ))),
        IoStrategy::Grouped => {
            let layout = CaseLayout {
                decomposed: true,
                rank_count: comm.size(),
                ..layout
            };
            Box::new(GroupedStore::new(
                StoreContext::new(layout, comm, options, master),
                config.io.group_size,
            ))
        }
    };
    Ok(store)
}

/// Which rank's slot a master-only read returns from a container
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SlotOwner {
    /// The master extracts its own slot and every rank gets that object
    Master,
    /// Every rank extracts its own slot from the broadcast container
    Each,
}

/// What the master broadcasts after a master-only read
#[derive(Debug, Serialize, Deserialize)]
enum MasterReply {
    Object { path: PathBuf, encoded: Vec<u8> },
    Failed(String),
}

/// State shared by every strategy
pub(crate) struct StoreContext<T: Transport> {
    pub(crate) resolver: PathResolver,
    pub(crate) comm: Communicator<T>,
    pub(crate) options: ResolveOptions,
    pub(crate) master: Rank,
}

impl<T: Transport> StoreContext<T> {
    pub(crate) fn new(
        layout: CaseLayout,
        comm: Communicator<T>,
        options: ResolveOptions,
        master: Rank,
    ) -> Self {
        Self {
            resolver: PathResolver::new(layout, comm.rank()),
            comm,
            options,
            master,
        }
    }

    pub(crate) fn rank(&self) -> Rank {
        self.comm.rank()
    }

    pub(crate) fn is_master(&self) -> bool {
        self.rank() == self.master
    }

    pub(crate) fn size(&self) -> u32 {
        self.comm.size()
    }

    fn root(&self) -> &Path {
        &self.resolver.layout().root
    }

    /// Resolve on this rank, `PathNotFound` carrying the composed path on a miss
    pub(crate) fn locate(&self, id: &ObjectIdentity) -> Result<PathBuf> {
        self.resolver
            .resolve(id, &self.options)
            .ok_or_else(|| Error::not_found(self.resolver.object_path(id)))
    }

    /// Independent read on this rank
    pub(crate) fn local_read(
        &self,
        id: &ObjectIdentity,
        class: Option<&str>,
    ) -> Result<StoredObject> {
        let mut trace = ReadTrace::start(self.rank(), id);
        let result = self
            .locate(id)
            .and_then(|path| read_object(self.root(), &path, self.rank(), class, &mut trace));
        trace.finish(result)
    }

    /// Read on the master only and broadcast the outcome
    pub(crate) fn master_read(
        &self,
        id: &ObjectIdentity,
        class: Option<&str>,
        slots: SlotOwner,
    ) -> Result<StoredObject> {
        if self.is_master() {
            let mut trace = ReadTrace::start(self.rank(), id);
            let loaded = self.locate(id).and_then(|path| {
                let outer = load_object(&path, None, &mut trace)?;
                let shared = match slots {
                    SlotOwner::Master => unwrap_for_rank(self.root(), &path, outer, self.rank())?,
                    SlotOwner::Each => outer,
                };
                Ok((path, shared))
            });
            let loaded = trace.finish(loaded);

            let reply = match &loaded {
                Ok((path, object)) => object.encode().map(|encoded| MasterReply::Object {
                    path: path.clone(),
                    encoded: encoded.to_vec(),
                }),
                Err(e) => Ok(MasterReply::Failed(e.to_string())),
            };
            let payload = reply
                .and_then(|reply| Ok(bincode::serialize(&reply)?))
                .map(Bytes::from)
                .ok();
            self.comm.broadcast(payload, self.master)?;

            let (path, shared) = loaded?;
            return self.finish_shared(&path, shared, class, slots);
        }

        let payload = self.comm.broadcast(None, self.master)?;
        let reply: MasterReply = bincode::deserialize(&payload)?;
        match reply {
            MasterReply::Object { path, encoded } => {
                let shared = StoredObject::decode(&path, Bytes::from(encoded))?;
                self.finish_shared(&path, shared, class, slots)
            }
            MasterReply::Failed(reason) => Err(Error::RemoteFailure {
                root: self.master,
                reason,
            }),
        }
    }

    fn finish_shared(
        &self,
        path: &Path,
        shared: StoredObject,
        class: Option<&str>,
        slots: SlotOwner,
    ) -> Result<StoredObject> {
        let object = match slots {
            SlotOwner::Master => shared,
            SlotOwner::Each => unwrap_for_rank(self.root(), path, shared, self.rank())?,
        };
        object.expect_class(path, class)?;
        Ok(object)
    }

    /// Run `write` on the master only; every rank returns its outcome
    pub(crate) fn master_write<F>(&self, write: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let local = if self.is_master() { write() } else { Ok(()) };
        self.share_outcome(local)
    }

    /// Gather every rank's encoded object to the master, which runs `write`
    /// on them in rank order
    ///
    /// Ranks first agree that every object encoded; if any failed, nothing
    /// is gathered and the file on disk is left untouched.
    pub(crate) fn gather_write<F>(&self, object: &StoredObject, write: F) -> Result<()>
    where
        F: FnOnce(Vec<Bytes>) -> Result<()>,
    {
        let local = match object.encode() {
            Ok(encoded) => {
                self.share_outcome(Ok(()))?;
                encoded
            }
            Err(e) => return self.share_outcome(Err(e)),
        };
        let outcome = match self.comm.gather_blocks(local, self.master)? {
            Some(blocks) => write(blocks),
            None => Ok(()),
        };
        self.share_outcome(outcome)
    }

    fn share_outcome(&self, local: Result<()>) -> Result<()> {
        if let Err(e) = &local {
            warn!(rank = %self.rank(), error = %e, "Write failed");
        }
        let ok = self.comm.agree(local.is_ok(), self.master)?;
        match local {
            Err(e) => Err(e),
            Ok(()) if ok => Ok(()),
            Ok(()) => Err(Error::RemoteFailure {
                root: self.master,
                reason: "write failed on another rank".to_string(),
            }),
        }
    }

    /// Write `object` at `path` on this rank
    pub(crate) fn write_file(&self, path: &Path, object: &StoredObject) -> Result<()> {
        write_object_file(path, object)
    }

    /// Forget the cached listing of an instance after a write
    pub(crate) fn invalidate(&self, id: &ObjectIdentity) {
        let dir = self.resolver.layout().instance_dir(&id.instance);
        self.resolver.directory_cache().clear(&dir);
    }
}
