use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use crate::ipset::parse_ipv4_rule;
use crate::matcher::{IpFilterMode, RuleSet};

/// Poll interval used by readers while a rebuild is pending.
const WRITER_POLL: Duration = Duration::from_millis(5);

/// Rule files backing one policy.
#[derive(Debug, Clone, Default)]
pub struct RuleSources {
    pub ip_files: Vec<PathBuf>,
    pub domain_files: Vec<PathBuf>,
}

impl RuleSources {
    pub fn all(&self) -> impl Iterator<Item = &PathBuf> {
        self.ip_files.iter().chain(self.domain_files.iter())
    }

    pub fn references(&self, path: &Path) -> bool {
        let canonical = fs::canonicalize(path).ok();
        self.all().any(|p| {
            p == path
                || (canonical.is_some() && fs::canonicalize(p).ok() == canonical)
        })
    }

    fn mod_times(&self) -> Vec<(PathBuf, Option<SystemTime>)> {
        self.all()
            .map(|p| {
                let mtime = fs::metadata(p).and_then(|m| m.modified()).ok();
                (p.clone(), mtime)
            })
            .collect()
    }
}

/// Counters collected while building one rule set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub v4_entries: usize,
    /// Addresses covered by the IPv4 rules, as if every block were enumerated.
    pub v4_addresses: u64,
    pub v6_entries: usize,
    pub domains: usize,
    pub skipped_lines: usize,
    pub failed_files: usize,
}

/// Builds a fresh rule set from disk. Unreadable files and malformed lines are
/// logged and skipped; they never abort the load.
pub fn build_rule_set(sources: &RuleSources) -> (RuleSet, LoadReport) {
    let mut set = RuleSet::default();
    let mut report = LoadReport::default();
    let mut v4_lines = 0usize;

    for path in &sources.ip_files {
        let loaded = for_each_rule_line(path, |line| {
            if line.contains(':') {
                if !set.v6.insert(line) {
                    debug!(target = "rules", file = %path.display(), line, "invalid ipv6 rule skipped");
                    report.skipped_lines += 1;
                }
                return;
            }
            match parse_ipv4_rule(line) {
                Ok(rule) => {
                    report.v4_addresses += rule.address_count();
                    set.v4.insert(rule);
                    v4_lines += 1;
                }
                Err(err) => {
                    debug!(target = "rules", file = %path.display(), error = %err, "invalid ipv4 rule skipped");
                    report.skipped_lines += 1;
                }
            }
        });
        if !loaded {
            report.failed_files += 1;
        }
    }
    set.v4.finish();

    for path in &sources.domain_files {
        let loaded = for_each_rule_line(path, |line| set.domains.insert(line));
        if !loaded {
            report.failed_files += 1;
        }
    }

    report.v4_entries = set.v4.entry_count();
    report.v6_entries = set.v6.len();
    report.domains = set.domains.len();
    set.ip_mode = IpFilterMode::from_counts(v4_lines, report.v6_entries);
    (set, report)
}

/// Feeds every non-empty, non-comment line to `f`. Returns false if the file
/// could not be read.
fn for_each_rule_line(path: &Path, mut f: impl FnMut(&str)) -> bool {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            warn!(target = "rules", file = %path.display(), error = %err, "rule file unreadable, skipped");
            return false;
        }
    };
    for line in BufReader::new(file).lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!(target = "rules", file = %path.display(), error = %err, "rule file read aborted");
                return false;
            }
        };
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        f(line);
    }
    true
}

/// Writer-preferring handle over one policy's rule set.
///
/// A rebuild announces itself through `pending_writers` before it asks for the
/// write lock. Workers check the counter before starting a file and wait it out,
/// so a rebuild never starves behind a steady stream of new readers. Readers
/// already inside a file keep their guard until the file is done.
pub struct RuleHandle {
    policy: Arc<str>,
    sources: RuleSources,
    pending_writers: AtomicUsize,
    current: RwLock<RuleSet>,
    mod_times: Mutex<Vec<(PathBuf, Option<SystemTime>)>>,
}

impl RuleHandle {
    /// 启动加载，规则文件缺失时以空规则启动。
    pub fn load(policy: &str, ip_files: Vec<PathBuf>, domain_files: Vec<PathBuf>) -> Self {
        let sources = RuleSources {
            ip_files,
            domain_files,
        };
        let snapshot = sources.mod_times();
        let (set, report) = build_rule_set(&sources);
        if set.v4.is_empty() && set.v6.is_empty() && set.domains.is_empty() {
            warn!(target = "rules", policy, "no usable rules loaded, policy matches nothing until reload");
        }
        info!(
            target = "rules",
            policy,
            v4 = report.v4_entries,
            v4_addresses = report.v4_addresses,
            v6 = report.v6_entries,
            domains = report.domains,
            skipped = report.skipped_lines,
            failed_files = report.failed_files,
            "rules loaded"
        );
        Self {
            policy: Arc::from(policy),
            sources,
            pending_writers: AtomicUsize::new(0),
            current: RwLock::new(set),
            mod_times: Mutex::new(snapshot),
        }
    }

    pub fn sources(&self) -> &RuleSources {
        &self.sources
    }

    #[inline]
    pub fn writer_pending(&self) -> bool {
        self.pending_writers.load(Ordering::SeqCst) > 0
    }

    /// Returns once no rebuild is announced. Blocking.
    pub fn wait_for_writer(&self) {
        while self.writer_pending() {
            std::thread::sleep(WRITER_POLL);
        }
    }

    /// Shared access for the duration of one file pass.
    pub fn read(&self) -> RwLockReadGuard<'_, RuleSet> {
        self.current.read()
    }

    /// True when any rule file's modification time differs from the last load,
    /// including files that appeared or disappeared since.
    pub fn has_changed(&self) -> bool {
        let now = self.sources.mod_times();
        *self.mod_times.lock() != now
    }

    /// Rebuilds all three structures and swaps them in under the write lock.
    pub fn reload(&self) -> LoadReport {
        self.pending_writers.fetch_add(1, Ordering::SeqCst);
        let snapshot = self.sources.mod_times();
        let report = {
            let mut guard = self.current.write();
            let (set, report) = build_rule_set(&self.sources);
            *guard = set;
            report
        };
        self.pending_writers.fetch_sub(1, Ordering::SeqCst);
        *self.mod_times.lock() = snapshot;

        info!(
            target = "rules",
            policy = %self.policy,
            v4 = report.v4_entries,
            v4_addresses = report.v4_addresses,
            v6 = report.v6_entries,
            domains = report.domains,
            skipped = report.skipped_lines,
            failed_files = report.failed_files,
            "rules reloaded"
        );
        report
    }

    pub fn reload_if_changed(&self) -> Option<LoadReport> {
        if self.has_changed() {
            Some(self.reload())
        } else {
            None
        }
    }
}

impl std::fmt::Debug for RuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleHandle")
            .field("policy", &self.policy)
            .field("sources", &self.sources)
            .field("pending_writers", &self.pending_writers.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn write(path: &Path, body: &str) {
        fs::write(path, body).unwrap();
    }

    #[test]
    fn loads_mixed_ip_file_and_skips_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let ips = dir.path().join("ip.list");
        write(
            &ips,
            "# comment\n\n10.0.0.0/24\n1.1.1.1-1.1.1.9\n8.8.8.8\n2409:8720\nbogus\n1.2.3.400\n",
        );
        let sources = RuleSources {
            ip_files: vec![ips],
            domain_files: vec![],
        };
        let (set, report) = build_rule_set(&sources);
        assert_eq!(report.skipped_lines, 2);
        assert_eq!(report.v6_entries, 1);
        assert_eq!(set.ip_mode, IpFilterMode::V4orV6);
        assert!(set.ip_member("10.0.0.255"));
        assert!(!set.ip_member("10.0.1.0"));
        assert!(set.ip_member("1.1.1.5"));
        assert!(set.ip_member("2409:8720::1"));
    }

    #[test]
    fn missing_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let domains = dir.path().join("d.list");
        write(&domains, "example.com\n");
        let sources = RuleSources {
            ip_files: vec![dir.path().join("absent.list")],
            domain_files: vec![domains],
        };
        let (set, report) = build_rule_set(&sources);
        assert_eq!(report.failed_files, 1);
        assert_eq!(set.ip_mode, IpFilterMode::None);
        assert!(set.domains.search("example.com"));
    }

    #[test]
    fn reload_swaps_domain_rules() {
        let dir = tempfile::tempdir().unwrap();
        let domains = dir.path().join("d.list");
        write(&domains, "a.com\n");
        let handle = RuleHandle::load("p", vec![], vec![domains.clone()]);
        assert!(handle.read().domains.search("x.a.com"));
        assert!(!handle.read().domains.search("x.b.com"));

        write(&domains, "b.com\n");
        handle.reload();
        assert!(!handle.read().domains.search("x.a.com"));
        assert!(handle.read().domains.search("x.b.com"));
    }

    #[test]
    fn reload_of_unchanged_files_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ips = dir.path().join("ip.list");
        write(&ips, "192.168.0.0/16\n2001:db8::1\n");
        let handle = RuleHandle::load("p", vec![ips], vec![]);
        let addrs = ["192.168.3.4", "192.169.0.0", "2001:db8::1", "2001:db8::2"];
        let before: Vec<bool> = addrs.iter().map(|p| handle.read().ip_member(p)).collect();
        let first = handle.reload();
        let second = handle.reload();
        assert_eq!(first, second);
        let after: Vec<bool> = addrs.iter().map(|p| handle.read().ip_member(p)).collect();
        assert_eq!(before, after);
        assert_eq!(before, vec![true, false, true, false]);
    }

    #[test]
    fn change_detection_follows_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let domains = dir.path().join("d.list");
        write(&domains, "a.com\n");
        let handle = RuleHandle::load("p", vec![], vec![domains.clone()]);
        assert!(!handle.has_changed());
        assert!(handle.reload_if_changed().is_none());

        let later = SystemTime::now() + Duration::from_secs(5);
        let file = File::options().write(true).open(&domains).unwrap();
        file.set_modified(later).unwrap();
        assert!(handle.has_changed());
        assert!(handle.reload_if_changed().is_some());
        assert!(!handle.has_changed());

        fs::remove_file(&domains).unwrap();
        assert!(handle.has_changed());
    }

    #[test]
    fn writer_waits_for_reader_and_announces_itself() {
        let dir = tempfile::tempdir().unwrap();
        let domains = dir.path().join("d.list");
        write(&domains, "a.com\n");
        let handle = Arc::new(RuleHandle::load("p", vec![], vec![domains.clone()]));

        let guard = handle.read();
        write(&domains, "b.com\n");
        let writer = {
            let handle = handle.clone();
            thread::spawn(move || handle.reload())
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.writer_pending() {
            assert!(Instant::now() < deadline, "writer never announced itself");
            thread::sleep(Duration::from_millis(1));
        }
        // 读者仍持有旧规则
        assert!(guard.domains.search("a.com"));
        drop(guard);

        writer.join().unwrap();
        assert!(!handle.writer_pending());
        handle.wait_for_writer();
        assert!(handle.read().domains.search("b.com"));
    }

    #[test]
    fn fresh_reader_defers_while_intent_is_raised() {
        let dir = tempfile::tempdir().unwrap();
        let domains = dir.path().join("d.list");
        write(&domains, "a.com\n");
        let handle = Arc::new(RuleHandle::load("p", vec![], vec![domains.clone()]));
        let entered = Arc::new(AtomicUsize::new(0));

        handle.pending_writers.fetch_add(1, Ordering::SeqCst);
        let reader = {
            let handle = handle.clone();
            let entered = entered.clone();
            thread::spawn(move || {
                handle.wait_for_writer();
                let guard = handle.read();
                entered.store(1, Ordering::SeqCst);
                guard.domains.search("x.a.com")
            })
        };

        thread::sleep(WRITER_POLL * 20);
        assert_eq!(entered.load(Ordering::SeqCst), 0, "reader took the lock while a writer was pending");
        // 未持有任何锁，写者可以直接拿到写锁
        assert!(handle.current.try_write().is_some());

        handle.pending_writers.fetch_sub(1, Ordering::SeqCst);
        assert!(reader.join().unwrap());
        assert_eq!(entered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn references_matches_configured_paths() {
        let dir = tempfile::tempdir().unwrap();
        let domains = dir.path().join("d.list");
        write(&domains, "a.com\n");
        let sources = RuleSources {
            ip_files: vec![],
            domain_files: vec![domains.clone()],
        };
        assert!(sources.references(&domains));
        assert!(!sources.references(&dir.path().join("other.list")));
    }
}
