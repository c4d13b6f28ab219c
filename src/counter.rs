use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DomainCounterConfig;

type Counts = FxHashMap<String, u64>;

enum CounterMsg {
    Domain(String),
    /// In-band marker: everything queued before it is already counted.
    Flush(oneshot::Sender<Counts>),
}

#[derive(Debug, Default)]
struct PauseGate {
    paused: Mutex<bool>,
    resumed: Condvar,
}

impl PauseGate {
    fn wait_open(&self) {
        let mut paused = self.paused.lock();
        while *paused {
            self.resumed.wait(&mut paused);
        }
    }

    fn set(&self, value: bool) {
        *self.paused.lock() = value;
        if !value {
            self.resumed.notify_all();
        }
    }
}

/// Counts queried main domains and periodically folds them into a counts file.
#[derive(Clone)]
pub struct DomainCounter {
    tx: mpsc::Sender<CounterMsg>,
    gate: Arc<PauseGate>,
    output: Arc<PathBuf>,
}

impl DomainCounter {
    /// Starts the aggregator task. It ends once every handle is dropped.
    pub fn spawn(cfg: &DomainCounterConfig) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(cfg.queue_capacity.max(1));
        let task = tokio::spawn(async move {
            let mut counts = Counts::default();
            while let Some(msg) = rx.recv().await {
                match msg {
                    CounterMsg::Domain(domain) => {
                        *counts.entry(domain).or_insert(0) += 1;
                    }
                    CounterMsg::Flush(reply) => {
                        let _ = reply.send(std::mem::take(&mut counts));
                    }
                }
            }
            debug!(target = "counter", "domain counter aggregator stopped");
        });
        let counter = Self {
            tx,
            gate: Arc::new(PauseGate::default()),
            output: Arc::new(cfg.output.clone()),
        };
        (counter, task)
    }

    /// Queues one domain. Blocking: waits while a flush holds intake paused and
    /// while the queue is full. Call from worker threads only.
    pub fn record(&self, domain: &str) {
        let Some(main) = main_domain(domain) else {
            return;
        };
        self.gate.wait_open();
        if self.tx.blocking_send(CounterMsg::Domain(main)).is_err() {
            debug!(target = "counter", "domain counter closed, record dropped");
        }
    }

    /// Drains the aggregator and merges the window into the counts file.
    /// Returns the number of distinct domains in the window.
    pub async fn flush(&self) -> anyhow::Result<usize> {
        self.gate.set(true);
        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self.tx.send(CounterMsg::Flush(reply_tx)).await;
        let window = match sent {
            Ok(()) => reply_rx.await.unwrap_or_default(),
            Err(_) => Counts::default(),
        };
        self.gate.set(false);

        let distinct = window.len();
        if distinct == 0 {
            return Ok(0);
        }
        let output = self.output.clone();
        tokio::task::spawn_blocking(move || merge_into_file(&output, window))
            .await
            .context("domain counter flush task")??;
        info!(target = "counter", distinct, file = %self.output.display(), "domain counts flushed");
        Ok(distinct)
    }

    pub fn spawn_flusher(&self, every: Duration) -> JoinHandle<()> {
        let counter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = counter.flush().await {
                    warn!(target = "counter", error = %err, "domain counter flush failed");
                }
            }
        })
    }
}

/// Last two labels, lowercased. Empty input yields `None`.
pub fn main_domain(domain: &str) -> Option<String> {
    let domain = domain.trim().trim_end_matches('.');
    if domain.is_empty() {
        return None;
    }
    let mut labels = domain.rsplit('.');
    let last = labels.next()?;
    let main = match labels.next() {
        Some(second) if !second.is_empty() => format!("{second}.{last}"),
        _ => last.to_string(),
    };
    Some(main.to_ascii_lowercase())
}

fn read_counts(path: &Path) -> io::Result<Counts> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Counts::default()),
        Err(err) => return Err(err),
    };
    let mut counts = Counts::default();
    for line in raw.lines() {
        let Some((domain, n)) = line.rsplit_once('|') else {
            continue;
        };
        if let Ok(n) = n.trim().parse::<u64>() {
            *counts.entry(domain.to_string()).or_insert(0) += n;
        }
    }
    Ok(counts)
}

fn merge_into_file(path: &Path, window: Counts) -> anyhow::Result<()> {
    let mut merged = read_counts(path)
        .with_context(|| format!("read domain counts: {}", path.display()))?;
    for (domain, n) in window {
        *merged.entry(domain).or_insert(0) += n;
    }
    let mut rows: Vec<(String, u64)> = merged.into_iter().collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut body = String::with_capacity(rows.len() * 24);
    for (domain, n) in rows {
        body.push_str(&domain);
        body.push('|');
        body.push_str(&n.to_string());
        body.push('\n');
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let temp = path.with_extension("tmp");
    fs::write(&temp, body).with_context(|| format!("write {}", temp.display()))?;
    fs::rename(&temp, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
