//! Removal of local files once their data is safely stored remotely.

use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::shard::ShardReport;
use crate::unit::Direction;

/// Local files that may be removed after a run.
///
/// With shards, only members of uploaded shards and the shard archives
/// themselves qualify. Without shards, uploaded sources qualify; downloaded
/// files are the run's product and are never removed.
pub fn cleanup_targets(
    direction: Direction,
    completed_local: &[PathBuf],
    shards: Option<&[ShardReport]>,
) -> Vec<PathBuf> {
    match shards {
        Some(reports) => reports
            .iter()
            .filter(|r| r.is_uploaded())
            .flat_map(|r| r.members.iter().cloned().chain([r.path.clone()]))
            .collect(),
        None => match direction {
            Direction::Upload => completed_local.to_vec(),
            Direction::Download => Vec::new(),
        },
    }
}

/// Deletes `paths`, returning how many files were removed.
///
/// Files already gone are skipped; other errors are logged and do not stop
/// the sweep.
pub async fn remove_local_files(paths: &[PathBuf]) -> usize {
    let mut removed = 0;
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "already removed");
            }
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove local file"),
        }
    }
    info!(removed, requested = paths.len(), "local cleanup done");
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(path: &str, members: &[&str], error: Option<&str>) -> ShardReport {
        ShardReport {
            key: format!("shards/{path}"),
            path: PathBuf::from(path),
            members: members.iter().map(PathBuf::from).collect(),
            already_present: false,
            error: error.map(String::from),
        }
    }

    #[test]
    fn upload_without_shards_removes_sources() {
        let done = vec![PathBuf::from("/s/a"), PathBuf::from("/s/b")];
        assert_eq!(cleanup_targets(Direction::Upload, &done, None), done);
    }

    #[test]
    fn download_without_shards_keeps_everything() {
        let done = vec![PathBuf::from("/d/a")];
        assert!(cleanup_targets(Direction::Download, &done, None).is_empty());
    }

    #[test]
    fn only_uploaded_shards_are_cleaned() {
        let reports = [
            shard("s0.tar", &["a", "b"], None),
            shard("s1.tar", &["c"], Some("503")),
        ];
        let targets = cleanup_targets(Direction::Download, &[], Some(&reports));
        assert_eq!(
            targets,
            ["a", "b", "s0.tar"].map(PathBuf::from).to_vec()
        );
    }

    #[tokio::test]
    async fn removes_existing_and_tolerates_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.cif");
        std::fs::write(&a, b"x").unwrap();
        let missing = tmp.path().join("missing.cif");

        let removed = remove_local_files(&[a.clone(), missing]).await;
        assert_eq!(removed, 1);
        assert!(!a.exists());
    }
}
