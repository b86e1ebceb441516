//! Decomposed directory naming
//!
//! Recognised directory names:
//! - `processor<rank>`: one rank
//! - `processors<total>`: all `total` ranks
//! - `processors<total>(<first>-<last>)`: ranks `first..=last`
//! - `processors<total>_<first>-<last>`: same, older spelling

use caseio_common::{DecomposedDirectoryGroup, Rank};
use std::path::{Component, Path, PathBuf};

/// Prefix of per-rank directories
pub const PROCESSOR_PREFIX: &str = "processor";

/// Prefix of grouped directories
pub const PROCESSORS_PREFIX: &str = "processors";

/// Directory name of a single rank
#[must_use]
pub fn processor_dir_name(rank: Rank) -> String {
    format!("{PROCESSOR_PREFIX}{rank}")
}

/// Directory name of a rank group
#[must_use]
pub fn group_dir_name(total: u32, group_start: Rank, group_size: u32) -> String {
    let last = group_start.get() + group_size.saturating_sub(1);
    format!("{PROCESSORS_PREFIX}{total}({group_start}-{last})")
}

fn parse_u32(digits: &str) -> Option<u32> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Parse a decomposed directory name
#[must_use]
pub fn parse_group_dir(name: &str) -> Option<DecomposedDirectoryGroup> {
    if let Some(rest) = name.strip_prefix(PROCESSORS_PREFIX) {
        let digits_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        let total = parse_u32(&rest[..digits_end])?;
        let range = &rest[digits_end..];

        let (group_start, group_size) = if range.is_empty() {
            (0, total)
        } else {
            let inner = range
                .strip_prefix('(')
                .and_then(|r| r.strip_suffix(')'))
                .or_else(|| range.strip_prefix('_'))?;
            let (first, last) = inner.split_once('-')?;
            let (first, last) = (parse_u32(first)?, parse_u32(last)?);
            if last < first || last >= total {
                return None;
            }
            (first, last - first + 1)
        };

        return Some(DecomposedDirectoryGroup {
            name: name.to_string(),
            group_start: Rank::new(group_start),
            group_size,
            total: Some(total),
        });
    }

    let rank = parse_u32(name.strip_prefix(PROCESSOR_PREFIX)?)?;
    Some(DecomposedDirectoryGroup {
        name: name.to_string(),
        group_start: Rank::new(rank),
        group_size: 1,
        total: None,
    })
}

/// A path split around its decomposed directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessorPath {
    /// Everything before the decomposed directory
    pub case_dir: PathBuf,
    /// The decomposed directory component
    pub group: DecomposedDirectoryGroup,
    /// Everything after the decomposed directory
    pub local: PathBuf,
}

/// Split `path` at its first decomposed directory component
#[must_use]
pub fn split_processor_path(path: &Path) -> Option<ProcessorPath> {
    let mut case_dir = PathBuf::new();
    let mut components = path.components();

    for component in components.by_ref() {
        if let Component::Normal(name) = component {
            if let Some(group) = name.to_str().and_then(parse_group_dir) {
                return Some(ProcessorPath {
                    case_dir,
                    group,
                    local: components.collect(),
                });
            }
        }
        case_dir.push(component);
    }
    None
}

/// Rank of the per-rank directory in `path`, if it has one
#[must_use]
pub fn detect_processor_path(path: &Path) -> Option<Rank> {
    split_processor_path(path)
        .filter(|split| split.group.is_per_rank())
        .map(|split| split.group.group_start)
}

/// Split `path` at its first decomposed directory below the case `root`
///
/// Components of `root` itself are never taken for decomposed directories.
/// Paths outside `root` have no split.
#[must_use]
pub fn split_case_path(root: &Path, path: &Path) -> Option<ProcessorPath> {
    let below = path.strip_prefix(root).ok()?;
    let split = split_processor_path(below)?;
    Some(ProcessorPath {
        case_dir: root.join(split.case_dir),
        ..split
    })
}

/// Rank of the per-rank directory below the case `root`, if `path` has one
#[must_use]
pub fn detect_case_rank(root: &Path, path: &Path) -> Option<Rank> {
    split_case_path(root, path)
        .filter(|split| split.group.is_per_rank())
        .map(|split| split.group.group_start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_rank_names() {
        let group = parse_group_dir("processor12").unwrap();
        assert!(group.is_per_rank());
        assert_eq!(group.group_start, Rank::new(12));
        assert_eq!(processor_dir_name(Rank::new(12)), "processor12");

        assert!(parse_group_dir("processor").is_none());
        assert!(parse_group_dir("processor1a").is_none());
        assert!(parse_group_dir("processor-1").is_none());
        assert!(parse_group_dir("constant").is_none());
    }

    #[test]
    fn test_group_names() {
        let group = parse_group_dir("processors8(4-7)").unwrap();
        assert_eq!(group.group_start, Rank::new(4));
        assert_eq!(group.group_size, 4);
        assert_eq!(group.total, Some(8));
        assert_eq!(group_dir_name(8, Rank::new(4), 4), "processors8(4-7)");

        let legacy = parse_group_dir("processors8_0-3").unwrap();
        assert_eq!((legacy.group_start, legacy.group_size), (Rank::new(0), 4));

        let whole = parse_group_dir("processors6").unwrap();
        assert_eq!((whole.group_start, whole.group_size), (Rank::new(0), 6));
        assert!(!whole.is_per_rank());
    }

    #[test]
    fn test_group_names_rejected() {
        for name in [
            "processors",
            "processors8(7-4)",
            "processors8(4-8)",
            "processors8(4-7",
            "processors8[4-7]",
            "processors8(a-b)",
        ] {
            assert!(parse_group_dir(name).is_none(), "{name}");
        }
    }

    #[test]
    fn test_split_processor_path() {
        let split =
            split_processor_path(Path::new("/run/case/1/processors8(4-7)/fluid/U")).unwrap();
        assert_eq!(split.case_dir, PathBuf::from("/run/case/1"));
        assert_eq!(split.group.name, "processors8(4-7)");
        assert_eq!(split.local, PathBuf::from("fluid/U"));

        assert!(split_processor_path(Path::new("/run/case/1/U")).is_none());
    }

    #[test]
    fn test_detect_processor_path() {
        assert_eq!(
            detect_processor_path(Path::new("/case/0/processor3/U")),
            Some(Rank::new(3))
        );
        assert_eq!(detect_processor_path(Path::new("/case/0/processors4/U")), None);
        assert_eq!(detect_processor_path(Path::new("/case/0/U")), None);
    }

    #[test]
    fn test_case_root_components_ignored() {
        let root = Path::new("/scratch/processors4/case");
        assert!(split_case_path(root, &root.join("1/U")).is_none());
        assert_eq!(detect_case_rank(root, &root.join("1/U")), None);

        let split = split_case_path(root, &root.join("1/processors8(4-7)/U")).unwrap();
        assert_eq!(split.case_dir, root.join("1"));
        assert_eq!(split.group.name, "processors8(4-7)");
        assert_eq!(split.local, PathBuf::from("U"));

        let per_rank = Path::new("/scratch/processor3/case");
        assert_eq!(detect_case_rank(per_rank, &per_rank.join("0/U")), None);
        assert_eq!(
            detect_case_rank(per_rank, &per_rank.join("0/processor1/U")),
            Some(Rank::new(1))
        );

        assert!(split_case_path(root, Path::new("/elsewhere/1/processor0/U")).is_none());
    }
}
