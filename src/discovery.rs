use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Files younger than this are picked up by the initial online walk.
pub const ONLINE_BACKLOG: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItem {
    File(PathBuf),
    /// One per worker; the receiving worker exits.
    Shutdown,
}

pub type WorkSender = mpsc::UnboundedSender<WorkItem>;
pub type WorkQueue = Arc<Mutex<mpsc::UnboundedReceiver<WorkItem>>>;

pub fn work_queue() -> (WorkSender, WorkQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Arc::new(Mutex::new(rx)))
}

/// File name filter for discovered inputs.
#[derive(Debug, Clone)]
pub struct FileFilter {
    pattern: Regex,
}

impl FileFilter {
    pub fn new(pattern: &str) -> anyhow::Result<Self> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn accepts(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        // 上游写入中的临时文件不处理
        !name.starts_with('.') && !name.ends_with(".tmp") && self.pattern.is_match(name)
    }
}

/// Recursively lists accepted files, oldest first. With `within`, only files
/// modified less than that long ago are returned.
pub fn walk(dir: &Path, filter: &FileFilter, within: Option<Duration>) -> Vec<PathBuf> {
    let now = SystemTime::now();
    let mut found: Vec<(SystemTime, PathBuf)> = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(target = "discovery", dir = %dir.display(), error = %err, "walk input dir failed");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && filter.accepts(entry.path()))
        .filter_map(|entry| {
            let mtime = entry
                .metadata()
                .ok()?
                .modified()
                .unwrap_or(SystemTime::UNIX_EPOCH);
            if let Some(window) = within {
                let age = now.duration_since(mtime).unwrap_or(Duration::ZERO);
                if age >= window {
                    return None;
                }
            }
            Some((mtime, entry.into_path()))
        })
        .collect();
    found.sort();
    found.into_iter().map(|(_, p)| p).collect()
}

/// Offline mode: queues every accepted file, then one shutdown marker per worker.
pub fn enqueue_offline(dir: &Path, filter: &FileFilter, tx: &WorkSender, workers: usize) -> usize {
    let files = walk(dir, filter, None);
    let count = files.len();
    for path in files {
        if tx.send(WorkItem::File(path)).is_err() {
            break;
        }
    }
    for _ in 0..workers {
        let _ = tx.send(WorkItem::Shutdown);
    }
    info!(target = "discovery", dir = %dir.display(), files = count, "offline backlog queued");
    count
}

/// Online mode: queues the recent backlog, then keeps watching `dir`.
pub fn spawn_online(dir: PathBuf, filter: FileFilter, tx: WorkSender) -> usize {
    let backlog = walk(&dir, &filter, Some(ONLINE_BACKLOG));
    let count = backlog.len();
    for path in backlog {
        let _ = tx.send(WorkItem::File(path));
    }
    info!(target = "discovery", dir = %dir.display(), files = count, "online backlog queued");

    // 使用阻塞线程持有watcher，避免异步生命周期问题。
    thread::spawn(move || {
        if let Err(err) = run_watcher(&dir, &filter, &tx) {
            error!(target = "discovery", dir = %dir.display(), error = %err, "input watcher exited with error");
        }
    });
    count
}

fn is_arrival(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(CreateKind::File)
            | EventKind::Create(CreateKind::Any)
            | EventKind::Modify(ModifyKind::Name(RenameMode::To))
            | EventKind::Modify(ModifyKind::Name(RenameMode::Both))
    )
}

fn run_watcher(dir: &Path, filter: &FileFilter, tx: &WorkSender) -> notify::Result<()> {
    let (event_tx, event_rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(event_tx, Config::default())?;
    watcher.watch(dir, RecursiveMode::Recursive)?;

    info!(target = "discovery", dir = %dir.display(), "input watcher started");

    for res in event_rx {
        match res {
            Ok(event) => {
                if !is_arrival(&event.kind) {
                    continue;
                }
                // rename 事件的最后一个路径是新名字
                let Some(path) = event.paths.last() else {
                    continue;
                };
                if !path.is_file() || !filter.accepts(path) {
                    continue;
                }
                debug!(target = "discovery", file = %path.display(), "input file arrived");
                if tx.send(WorkItem::File(path.clone())).is_err() {
                    info!(target = "discovery", "work queue closed, input watcher stopping");
                    break;
                }
            }
            Err(err) => {
                warn!(target = "discovery", error = %err, "watcher event error");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn filter() -> FileFilter {
        FileFilter::new(r"\.(log|txt)(\.gz)?$|\.gz$").unwrap()
    }

    #[test]
    fn filter_matches_names_only() {
        let f = filter();
        assert!(f.accepts(Path::new("/in/a.log")));
        assert!(f.accepts(Path::new("/in/a.log.gz")));
        assert!(f.accepts(Path::new("/in/a.gz")));
        assert!(!f.accepts(Path::new("/in/a.log.tmp")));
        assert!(!f.accepts(Path::new("/in/.a.log")));
        assert!(!f.accepts(Path::new("/in/a.csv")));
        assert!(FileFilter::new("(").is_err());
    }

    #[test]
    fn walk_recurses_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        fs::write(dir.path().join("a.log"), b"").unwrap();
        fs::write(sub.join("b.log.gz"), b"").unwrap();
        fs::write(sub.join("c.csv"), b"").unwrap();
        let mut found = walk(dir.path(), &filter(), None);
        found.sort();
        assert_eq!(found, vec![dir.path().join("a.log"), sub.join("b.log.gz")]);
    }

    #[test]
    fn walk_window_skips_old_files() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.log");
        let fresh = dir.path().join("fresh.log");
        fs::write(&old, b"").unwrap();
        fs::write(&fresh, b"").unwrap();
        let three_hours_ago = SystemTime::now() - Duration::from_secs(3 * 3600);
        fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(three_hours_ago)
            .unwrap();
        assert_eq!(walk(dir.path(), &filter(), Some(ONLINE_BACKLOG)), vec![fresh]);
        assert_eq!(walk(dir.path(), &filter(), None).len(), 2);
    }

    #[test]
    fn walk_returns_oldest_first_across_subdirs() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("2024").join("01");
        fs::create_dir_all(&sub).unwrap();
        let newer = dir.path().join("a.log");
        let older = sub.join("z.log");
        fs::write(&newer, b"").unwrap();
        fs::write(&older, b"").unwrap();
        let hour_ago = SystemTime::now() - Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(&older)
            .unwrap()
            .set_modified(hour_ago)
            .unwrap();
        assert_eq!(walk(dir.path(), &filter(), None), vec![older, newer]);
        assert!(walk(&dir.path().join("absent"), &filter(), None).is_empty());
    }

    #[tokio::test]
    async fn offline_queue_ends_with_one_marker_per_worker() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.log"), b"").unwrap();
        fs::write(dir.path().join("b.log"), b"").unwrap();
        let (tx, queue) = work_queue();
        assert_eq!(enqueue_offline(dir.path(), &filter(), &tx, 3), 2);
        drop(tx);

        let mut rx = queue.lock().await;
        let mut files = 0;
        let mut markers = 0;
        while let Some(item) = rx.recv().await {
            match item {
                WorkItem::File(_) => {
                    assert_eq!(markers, 0, "file queued after a shutdown marker");
                    files += 1;
                }
                WorkItem::Shutdown => markers += 1,
            }
        }
        assert_eq!((files, markers), (2, 3));
    }
}
