//! Multi-rank store tests; every rank runs on its own thread over an
//! in-process transport.

use bytes::Bytes;
use caseio_comm::{Communicator, LocalTransport};
use caseio_common::config::{CommConfig, IoStrategy};
use caseio_common::{CaseLayout, Config, Error, ObjectIdentity, Rank};
use caseio_storage::{CaseStore, StoredObject, open_store};
use rand::Rng;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn run_ranks<R, F>(n: u32, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(Communicator<LocalTransport>) -> R + Sync,
{
    let config = CommConfig::default();
    std::thread::scope(|s| {
        let handles: Vec<_> = LocalTransport::mesh(n)
            .into_iter()
            .map(|transport| {
                let (f, config) = (&f, &config);
                s.spawn(move || f(Communicator::new(transport, config)))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

fn config(strategy: IoStrategy, group_size: u32) -> Config {
    let mut config = Config::default();
    config.io.strategy = strategy;
    config.io.group_size = group_size;
    config
}

fn open(
    layout: &CaseLayout,
    comm: Communicator<LocalTransport>,
    config: &Config,
) -> Box<dyn CaseStore> {
    open_store(layout.clone(), comm, config).unwrap()
}

fn put(path: &Path, object: &StoredObject) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, object.encode().unwrap()).unwrap();
}

fn velocity(rank: u32) -> StoredObject {
    StoredObject::new("volVectorField", Bytes::from(format!("velocity of rank {rank}")))
}

/// Four ranks, `processor0..3` under instance `1`, instants 0, 1, 2
fn four_rank_case() -> (TempDir, CaseLayout) {
    let temp = TempDir::new().unwrap();
    for instant in ["0", "1", "2"] {
        fs::create_dir_all(temp.path().join(instant)).unwrap();
    }
    for rank in 0..4 {
        put(&temp.path().join(format!("1/processor{rank}/U")), &velocity(rank));
    }
    let layout = CaseLayout::decomposed(temp.path(), 4).with_instants(["0", "1", "2"]);
    (temp, layout)
}

#[test]
fn test_master_only_read_touches_master_cache_only() {
    let (temp, layout) = four_rank_case();
    let instance_dir = temp.path().join("1");
    let config = Config::default();

    let results = run_ranks(4, |comm| {
        let store = open(&layout, comm, &config);
        let object = store
            .read_master_only(&ObjectIdentity::new("1", "U"), Some("volVectorField"))
            .unwrap();
        let listing = store.directory_cache().peek(&instance_dir);
        (
            object,
            listing.is_some_and(|l| l.contains_name("processor0")),
            store.directory_cache().is_empty(),
        )
    });

    for (rank, (object, has_listing, cache_empty)) in results.iter().enumerate() {
        assert_eq!(object, &velocity(0));
        if rank == 0 {
            assert!(has_listing);
        } else {
            assert!(!has_listing);
            assert!(cache_empty, "rank {rank} listed a directory");
        }
    }
}

#[test]
fn test_per_rank_read() {
    let (_temp, layout) = four_rank_case();
    let config = Config::default();

    let results = run_ranks(4, |comm| {
        let store = open(&layout, comm, &config);
        let rank = store.rank().get();
        let object = store
            .read_per_rank(&ObjectIdentity::new("1", "U"), None)
            .unwrap();
        (rank, object)
    });

    for (rank, object) in results {
        assert_eq!(object, velocity(rank));
    }
}

#[test]
fn test_master_miss_fails_every_rank() {
    let (_temp, layout) = four_rank_case();
    let config = Config::default();

    let results = run_ranks(4, |comm| {
        let store = open(&layout, comm, &config);
        store.read_master_only(&ObjectIdentity::new("1", "p"), None)
    });

    for (rank, result) in results.into_iter().enumerate() {
        let err = result.unwrap_err();
        if rank == 0 {
            assert!(err.is_not_found(), "{err}");
        } else {
            assert!(
                matches!(err, Error::RemoteFailure { root, .. } if root == Rank::MASTER),
                "{err}"
            );
        }
    }
}

#[test]
fn test_header_mismatch_seen_everywhere() {
    let (_temp, layout) = four_rank_case();
    let config = Config::default();

    let results = run_ranks(4, |comm| {
        let store = open(&layout, comm, &config);
        store.read_master_only(&ObjectIdentity::new("1", "U"), Some("volScalarField"))
    });

    for result in results {
        assert!(matches!(result.unwrap_err(), Error::HeaderMismatch { .. }));
    }
}

#[test]
fn test_close_time_through_store() {
    let (_temp, layout) = four_rank_case();
    let config = Config::default();

    let results = run_ranks(4, |comm| {
        let store = open(&layout, comm, &config);
        store.read_per_rank(&ObjectIdentity::new("1.0000000001", "U"), None)
    });

    for (rank, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), velocity(rank as u32));
    }
}

#[test]
fn test_per_rank_write_then_read() {
    let temp = TempDir::new().unwrap();
    let layout = CaseLayout::decomposed(temp.path(), 3);
    let config = Config::default();

    let results = run_ranks(3, |comm| {
        let store = open(&layout, comm, &config);
        let mut payload = vec![0u8; 256];
        rand::thread_rng().fill(&mut payload[..]);
        let object = StoredObject::new("scalarList", payload);

        let id = ObjectIdentity::new("0.5", "phi");
        store.write_per_rank(&id, &object).unwrap();
        (object, store.read_per_rank(&id, Some("scalarList")).unwrap())
    });

    for (written, read) in results {
        assert_eq!(written, read);
    }
    for rank in 0..3 {
        assert!(temp.path().join(format!("0.5/processor{rank}/phi")).is_file());
    }
}

#[test]
fn test_grouped_write_then_read() {
    let temp = TempDir::new().unwrap();
    let layout = CaseLayout::decomposed(temp.path(), 6);
    let config = config(IoStrategy::Grouped, 4);

    let results = run_ranks(6, |comm| {
        let store = open(&layout, comm, &config);
        let rank = store.rank().get();
        let id = ObjectIdentity::new("1", "U").with_region("fluid");
        store.write_per_rank(&id, &velocity(rank)).unwrap();
        (rank, store.read_per_rank(&id, Some("volVectorField")).unwrap())
    });

    for (rank, object) in results {
        assert_eq!(object, velocity(rank));
    }
    assert!(temp.path().join("1/processors6(0-3)/fluid/U").is_file());
    assert!(temp.path().join("1/processors6(4-5)/fluid/U").is_file());
}

#[test]
fn test_grouped_master_write_replicated() {
    let temp = TempDir::new().unwrap();
    let layout = CaseLayout::decomposed(temp.path(), 5);
    let config = config(IoStrategy::Grouped, 2);
    let shared = StoredObject::new("dictionary", Bytes::from_static(b"deltaT 0.001;"))
        .with_note("controlDict");

    let results = run_ranks(5, |comm| {
        let store = open(&layout, comm, &config);
        let id = ObjectIdentity::new("0", "controlDict");
        store.write_master_only(&id, &shared).unwrap();
        (
            store.read_per_rank(&id, Some("dictionary")).unwrap(),
            store.read_master_only(&id, Some("dictionary")).unwrap(),
        )
    });

    for (per_rank, master_only) in results {
        assert_eq!(per_rank, shared);
        assert_eq!(master_only, shared);
    }
}

#[test]
fn test_master_shared_container() {
    let temp = TempDir::new().unwrap();
    let layout = CaseLayout::decomposed(temp.path(), 3);
    let config = config(IoStrategy::MasterShared, 0);

    let results = run_ranks(3, |comm| {
        let store = open(&layout, comm, &config);
        let rank = store.rank().get();
        let id = ObjectIdentity::new("2", "U");
        store.write_per_rank(&id, &velocity(rank)).unwrap();
        (rank, store.read_per_rank(&id, None).unwrap())
    });

    for (rank, object) in results {
        assert_eq!(object, velocity(rank));
    }
    assert!(temp.path().join("2/U").is_file());
    assert!(!temp.path().join("2/processor0").exists());
}

#[test]
fn test_failed_gathered_write_keeps_previous_container() {
    let temp = TempDir::new().unwrap();
    let layout = CaseLayout::decomposed(temp.path(), 3);
    let config = config(IoStrategy::MasterShared, 0);
    let id = ObjectIdentity::new("2", "U");

    let results = run_ranks(3, |comm| {
        let store = open(&layout, comm, &config);
        let rank = store.rank().get();
        store.write_per_rank(&id, &velocity(rank)).unwrap();

        // A class name too long for the object header fails to encode on rank 1
        let class = if rank == 1 { "x".repeat(70_000) } else { "volVectorField".to_string() };
        let second = StoredObject::new(class, Bytes::from(format!("rewrite of rank {rank}")));
        let failed = store.write_per_rank(&id, &second);
        (rank, failed, store.read_per_rank(&id, Some("volVectorField")))
    });

    for (rank, failed, read) in results {
        let err = failed.unwrap_err();
        if rank == 1 {
            assert!(matches!(err, Error::InvalidArgument(_)), "{err}");
        } else {
            assert!(matches!(err, Error::RemoteFailure { .. }), "rank {rank}: {err}");
        }
        assert_eq!(read.unwrap(), velocity(rank));
    }
}

#[test]
fn test_master_shared_uniform_object() {
    let temp = TempDir::new().unwrap();
    let layout = CaseLayout::decomposed(temp.path(), 4);
    let config = config(IoStrategy::MasterShared, 0);
    let object = StoredObject::new("dictionary", Bytes::from_static(b"nu 1e-05;"));

    let results = run_ranks(4, |comm| {
        let store = open(&layout, comm, &config);
        let id = ObjectIdentity::new("constant", "transportProperties");
        store.write_master_only(&id, &object).unwrap();
        store.read_master_only(&id, Some("dictionary"))
    });

    for result in results {
        assert_eq!(result.unwrap(), object);
    }
    assert!(temp.path().join("constant/transportProperties").is_file());
}

#[test]
fn test_master_write_failure_reported_everywhere() {
    let temp = TempDir::new().unwrap();
    // A regular file where the instance directory should be
    fs::write(temp.path().join("3"), b"blocker").unwrap();
    let layout = CaseLayout::decomposed(temp.path(), 3);
    let config = config(IoStrategy::MasterShared, 0);

    let results = run_ranks(3, |comm| {
        let store = open(&layout, comm, &config);
        let object = StoredObject::new("dictionary", Bytes::new());
        store.write_master_only(&ObjectIdentity::new("3", "dict"), &object)
    });

    for (rank, result) in results.into_iter().enumerate() {
        let err = result.unwrap_err();
        if rank != 0 {
            assert!(matches!(err, Error::RemoteFailure { .. }), "{err}");
        }
    }
}

#[test]
fn test_open_store_rejects_mismatched_run() {
    let temp = TempDir::new().unwrap();
    let layout = CaseLayout::decomposed(temp.path(), 4);
    let config = Config::default();

    let results = run_ranks(2, |comm| open_store(layout.clone(), comm, &config).err());
    for err in results {
        assert!(matches!(err, Some(Error::Configuration(_))));
    }
}
