//! Staged object reads and writes on the local filesystem

use crate::container::{BlockCodec, BlockContainer};
use crate::object::{CONTAINER_CLASS, ObjectHeader, StoredObject};
use crate::processor::{detect_case_rank, split_case_path};
use bytes::Bytes;
use caseio_common::{Error, Rank, Result};
use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, warn};

/// Progress of one read
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadStage {
    ResolvingPath,
    Opening,
    ReadingHeader,
    ReadingPayload,
    Done,
    Failed(String),
}

impl fmt::Display for ReadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResolvingPath => write!(f, "resolving-path"),
            Self::Opening => write!(f, "opening"),
            Self::ReadingHeader => write!(f, "reading-header"),
            Self::ReadingPayload => write!(f, "reading-payload"),
            Self::Done => write!(f, "done"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Stage tracker for one read, logging every transition
pub(crate) struct ReadTrace {
    rank: Rank,
    object: String,
    stage: ReadStage,
}

impl ReadTrace {
    pub(crate) fn start(rank: Rank, object: impl fmt::Display) -> Self {
        let object = object.to_string();
        debug!(rank = %rank, object = %object, stage = %ReadStage::ResolvingPath, "Read stage");
        Self {
            rank,
            object,
            stage: ReadStage::ResolvingPath,
        }
    }

    pub(crate) fn enter(&mut self, stage: ReadStage) {
        debug!(rank = %self.rank, object = %self.object, stage = %stage, "Read stage");
        self.stage = stage;
    }

    #[cfg(test)]
    pub(crate) fn stage(&self) -> &ReadStage {
        &self.stage
    }

    /// Record the outcome of the read
    pub(crate) fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.enter(ReadStage::Done),
            Err(e) => {
                warn!(
                    rank = %self.rank,
                    object = %self.object,
                    during = %self.stage,
                    error = %e,
                    "Read failed"
                );
                self.stage = ReadStage::Failed(e.to_string());
            }
        }
        result
    }
}

/// Open, read and verify the object file at `path`
///
/// A plain object of a class other than `expected_class` fails at the
/// header stage. Container files come back still wrapped; see
/// [`unwrap_for_rank`].
pub(crate) fn load_object(
    path: &Path,
    expected_class: Option<&str>,
    trace: &mut ReadTrace,
) -> Result<StoredObject> {
    trace.enter(ReadStage::Opening);
    let mut file = File::open(path).map_err(|e| Error::open_failure(path, e))?;
    let mut raw = Vec::new();
    file.read_to_end(&mut raw)?;
    drop(file);
    let raw = Bytes::from(raw);

    trace.enter(ReadStage::ReadingHeader);
    let (header, offset) = ObjectHeader::parse(path, &raw)?;
    header.expect_class(path, expected_class)?;

    trace.enter(ReadStage::ReadingPayload);
    let payload = header.read_payload(path, &raw, offset)?;
    Ok(StoredObject {
        class_name: header.class_name,
        note: header.note,
        payload,
    })
}

/// Extract the object belonging to `rank` when `outer` is a container
///
/// A rank directory below the case `root` names the slot owner; otherwise
/// `rank` does. The expected rank range comes from the group directory
/// name, or from the container itself when the file sits outside any group
/// directory.
pub(crate) fn unwrap_for_rank(
    root: &Path,
    path: &Path,
    outer: StoredObject,
    rank: Rank,
) -> Result<StoredObject> {
    if outer.class_name != CONTAINER_CLASS {
        return Ok(outer);
    }

    let owner = detect_case_rank(root, path).unwrap_or(rank);
    let (group_start, group_size) = match split_case_path(root, path) {
        Some(split) if !split.group.is_per_rank() => {
            (split.group.group_start, split.group.group_size)
        }
        _ => {
            let container = BlockContainer::parse(outer.payload.clone())?;
            let header = container.header();
            (header.group_start, header.group_size)
        }
    };

    let block = BlockCodec::decode(outer.payload, owner, group_start, group_size)?;
    StoredObject::decode(path, block)
}

/// Complete read of the object at `path` under the case `root` for `rank`
pub(crate) fn read_object(
    root: &Path,
    path: &Path,
    rank: Rank,
    expected_class: Option<&str>,
    trace: &mut ReadTrace,
) -> Result<StoredObject> {
    let outer = load_object(path, expected_class, trace)?;
    let object = unwrap_for_rank(root, path, outer, rank)?;
    object.expect_class(path, expected_class)?;
    Ok(object)
}

/// Write an encoded object, creating parent directories
pub(crate) fn write_object_file(path: &Path, object: &StoredObject) -> Result<()> {
    let encoded = object.encode()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path).map_err(|e| Error::open_failure(path, e))?;
    file.write_all(&encoded)?;
    file.sync_all()?;
    debug!(path = %path.display(), bytes = encoded.len(), class = %object.class_name, "Wrote object");
    Ok(())
}

/// Wrap per-rank objects into one container object
pub(crate) fn pack_container(group_start: Rank, blocks: &[Bytes], total: u32) -> Result<StoredObject> {
    let container = BlockCodec::encode(group_start, blocks, total)?;
    Ok(StoredObject::new(CONTAINER_CLASS, container))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn trace_for(label: &str) -> ReadTrace {
        ReadTrace::start(Rank::MASTER, label)
    }

    #[test]
    fn test_write_then_read() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("0/fluid/p");
        let object = StoredObject::new("volScalarField", Bytes::from_static(b"uniform 0"));
        write_object_file(&path, &object).unwrap();

        let mut trace = trace_for("0/fluid/p");
        let got = read_object(temp.path(), &path, Rank::MASTER, Some("volScalarField"), &mut trace);
        let got = trace.finish(got).unwrap();
        assert_eq!(got, object);
        assert_eq!(trace.stage(), &ReadStage::Done);
    }

    #[test]
    fn test_missing_file_is_open_failure() {
        let temp = TempDir::new().unwrap();
        let mut trace = trace_for("0/U");
        let result = read_object(temp.path(), &temp.path().join("0/U"), Rank::MASTER, None, &mut trace);
        let err = trace.finish(result).unwrap_err();
        assert!(matches!(err, Error::OpenFailure { .. }));
        assert!(matches!(trace.stage(), ReadStage::Failed(_)));
    }

    #[test]
    fn test_header_mismatch() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("U");
        write_object_file(&path, &StoredObject::new("volScalarField", Bytes::new())).unwrap();

        let mut trace = trace_for("U");
        let err = read_object(temp.path(), &path, Rank::MASTER, Some("volVectorField"), &mut trace)
            .unwrap_err();
        assert!(matches!(err, Error::HeaderMismatch { .. }));
    }

    #[test]
    fn test_header_mismatch_before_payload_checks() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("p");
        let object = StoredObject::new("volScalarField", Bytes::from_static(b"uniform 0"));
        write_object_file(&path, &object).unwrap();
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        fs::write(&path, raw).unwrap();

        let mut trace = trace_for("p");
        let err = read_object(temp.path(), &path, Rank::MASTER, Some("volVectorField"), &mut trace)
            .unwrap_err();
        assert!(matches!(err, Error::HeaderMismatch { .. }), "{err}");
        assert_eq!(trace.stage(), &ReadStage::ReadingHeader);

        let mut trace = trace_for("p");
        let err = read_object(temp.path(), &path, Rank::MASTER, Some("volScalarField"), &mut trace)
            .unwrap_err();
        assert!(matches!(err, Error::MalformedObject { .. }), "{err}");
        assert_eq!(trace.stage(), &ReadStage::ReadingPayload);
    }

    #[test]
    fn test_container_slot_from_group_directory() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("1/processors8(4-7)/U");
        let blocks: Vec<Bytes> = (4..8)
            .map(|r| StoredObject::new("label", Bytes::from(format!("rank {r}"))).encode().unwrap())
            .collect();
        write_object_file(&path, &pack_container(Rank::new(4), &blocks, 8).unwrap()).unwrap();

        let mut trace = trace_for("1/U");
        let got = read_object(temp.path(), &path, Rank::new(5), Some("label"), &mut trace).unwrap();
        assert_eq!(got.payload, "rank 5");

        let mut trace = trace_for("1/U");
        let err = read_object(temp.path(), &path, Rank::new(2), None, &mut trace).unwrap_err();
        assert!(matches!(err, Error::CorruptContainer(_)));
    }

    #[test]
    fn test_container_range_mismatch_with_directory() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("1/processors8(0-3)/U");
        let blocks = vec![StoredObject::new("label", Bytes::new()).encode().unwrap(); 4];
        write_object_file(&path, &pack_container(Rank::new(4), &blocks, 8).unwrap()).unwrap();

        let mut trace = trace_for("1/U");
        let err = read_object(temp.path(), &path, Rank::new(1), None, &mut trace).unwrap_err();
        assert!(matches!(err, Error::CorruptContainer(_)));
    }

    #[test]
    fn test_group_named_case_root() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("processors4/case");
        let path = root.join("1/U");
        let blocks: Vec<Bytes> = (0..3)
            .map(|r| StoredObject::new("label", Bytes::from(vec![r; 3])).encode().unwrap())
            .collect();
        write_object_file(&path, &pack_container(Rank::new(0), &blocks, 3).unwrap()).unwrap();

        let mut trace = trace_for("1/U");
        let got = read_object(&root, &path, Rank::new(2), Some("label"), &mut trace).unwrap();
        assert_eq!(got.payload, vec![2u8; 3]);
    }

    #[test]
    fn test_container_outside_group_directory() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("1/U");
        let blocks: Vec<Bytes> = (0..3)
            .map(|r| StoredObject::new("label", Bytes::from(vec![r; 2])).encode().unwrap())
            .collect();
        write_object_file(&path, &pack_container(Rank::new(0), &blocks, 3).unwrap()).unwrap();

        let mut trace = trace_for("1/U");
        let got = read_object(temp.path(), &path, Rank::new(2), None, &mut trace).unwrap();
        assert_eq!(got.payload, vec![2u8, 2]);
    }
}
