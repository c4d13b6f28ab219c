use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::matcher::{RuntimeConfig, RuntimePolicy};

/// Starts the rule reload loop: a periodic mtime check plus immediate checks
/// for rule files that `notify` reports as touched.
pub fn spawn(runtime: Arc<RuntimeConfig>) -> JoinHandle<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    let dirs = watched_dirs(&runtime);
    if !dirs.is_empty() {
        // 使用阻塞线程持有watcher，避免异步生命周期问题。
        thread::spawn(move || {
            if let Err(err) = run_watcher(dirs, tx) {
                error!(target = "watcher", error = %err, "rule watcher exited with error");
            }
        });
    }
    tokio::spawn(reload_loop(runtime, rx))
}

/// Parent directories of every rule file. Editors often replace files instead of
/// writing in place, so the directory is watched rather than the file.
fn watched_dirs(runtime: &RuntimeConfig) -> BTreeSet<PathBuf> {
    runtime
        .policies
        .iter()
        .flat_map(|p| p.rules.sources().all().cloned().collect::<Vec<_>>())
        .map(|file| match file.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        })
        .collect()
}

fn run_watcher(dirs: BTreeSet<PathBuf>, tx: mpsc::UnboundedSender<PathBuf>) -> notify::Result<()> {
    let (event_tx, event_rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(event_tx, Config::default())?;
    for dir in &dirs {
        match watcher.watch(dir, RecursiveMode::NonRecursive) {
            Ok(()) => info!(target = "watcher", dir = %dir.display(), "rule watcher started"),
            Err(err) => warn!(target = "watcher", dir = %dir.display(), error = %err, "watch rule dir failed"),
        }
    }

    for res in event_rx {
        match res {
            Ok(event) => {
                if matches!(event.kind, EventKind::Access(_)) {
                    continue;
                }
                for path in event.paths {
                    if tx.send(path).is_err() {
                        return Ok(());
                    }
                }
            }
            Err(err) => {
                warn!(target = "watcher", error = %err, "watcher event error");
            }
        }
    }
    Ok(())
}

async fn reload_loop(runtime: Arc<RuntimeConfig>, mut rx: mpsc::UnboundedReceiver<PathBuf>) {
    let mut ticker = tokio::time::interval(runtime.reload_interval());
    ticker.tick().await;
    let mut watcher_alive = true;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for policy in &runtime.policies {
                    reload_if_changed(policy.clone()).await;
                }
            }
            touched = rx.recv(), if watcher_alive => match touched {
                Some(path) => {
                    for policy in runtime.policies_using(&path) {
                        reload_if_changed(policy).await;
                    }
                }
                None => watcher_alive = false,
            },
        }
    }
}

async fn reload_if_changed(policy: Arc<RuntimePolicy>) {
    let name = policy.name.clone();
    let rules = policy.rules.clone();
    match tokio::task::spawn_blocking(move || rules.reload_if_changed()).await {
        Ok(Some(_)) => {}
        Ok(None) => debug!(target = "watcher", policy = %name, "rules unchanged"),
        Err(err) => error!(target = "watcher", policy = %name, error = %err, "rule reload task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use serde_json::json;
    use std::fs;
    use std::path::Path;
    use std::time::{Duration, Instant, SystemTime};

    fn runtime(dir: &Path, list: &Path) -> Arc<RuntimeConfig> {
        let cfg: AppConfig = serde_json::from_value(json!({
            "settings": { "input_dir": dir, "reload_interval_secs": 1 },
            "policies": [{
                "name": "p",
                "filter_domain_rules": [list],
                "output_dir": dir.join("out")
            }]
        }))
        .unwrap();
        Arc::new(RuntimeConfig::from_config(cfg).unwrap())
    }

    #[test]
    fn watched_dirs_are_rule_parents() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("d.list");
        fs::write(&list, "a.com\n").unwrap();
        let rt = runtime(dir.path(), &list);
        let dirs = watched_dirs(&rt);
        assert_eq!(dirs.into_iter().collect::<Vec<_>>(), vec![dir.path().to_path_buf()]);
        assert_eq!(rt.policies_using(&list).len(), 1);
        assert!(rt.policies_using(&dir.path().join("x.list")).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn periodic_check_picks_up_edits() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("d.list");
        fs::write(&list, "a.com\n").unwrap();
        let rt = runtime(dir.path(), &list);
        let handle = spawn(rt.clone());

        fs::write(&list, "b.com\n").unwrap();
        // 保证 mtime 与加载时不同
        fs::File::options()
            .write(true)
            .open(&list)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(10))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if rt.policies[0].rules.read().domains.search("x.b.com") {
                break;
            }
            assert!(Instant::now() < deadline, "rules were not reloaded");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!rt.policies[0].rules.read().domains.search("x.a.com"));
        handle.abort();
    }
}
