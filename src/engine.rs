use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::BytesMut;
use tracing::{debug, error, info, warn};

use crate::counter::DomainCounter;
use crate::discovery::{WorkItem, WorkQueue};
use crate::format::field;
use crate::matcher::{RuntimeConfig, RuntimePolicy};
use crate::output::{self, OutputError, ShardWriter};
use crate::stats::{FileReport, PipelineStats};

/// Poll interval while waiting for an input file to settle.
const STABLE_POLL: Duration = Duration::from_millis(200);
/// Initial capacity of a per-policy record buffer.
const BUFFER_CAPACITY: usize = 256 * 1024;

#[derive(Clone)]
pub struct Engine {
    runtime: Arc<RuntimeConfig>,
    stats: Arc<PipelineStats>,
    counter: Option<DomainCounter>,
    host_ip: Arc<str>,
}

/// Per-worker mutable state: one buffer and one output shard per policy.
/// Owned by exactly one worker, so nothing in here is locked.
pub struct WorkerState {
    worker_id: usize,
    shards: Vec<ShardWriter>,
    buffers: Vec<BytesMut>,
}

/// Result of one processed file.
#[derive(Debug, Default)]
pub struct FileOutcome {
    pub report: FileReport,
    /// Files rotated out during this pass: (policy index, published path).
    pub published: Vec<(usize, PathBuf)>,
    /// The source was left in place because some matched records were not written.
    pub retained: bool,
}

impl Engine {
    pub fn new(
        runtime: Arc<RuntimeConfig>,
        stats: Arc<PipelineStats>,
        counter: Option<DomainCounter>,
        host_ip: String,
    ) -> Self {
        Self {
            runtime,
            stats,
            counter,
            host_ip: Arc::from(host_ip),
        }
    }

    pub fn runtime(&self) -> &Arc<RuntimeConfig> {
        &self.runtime
    }

    pub fn worker_state(&self, worker_id: usize) -> WorkerState {
        let policies = &self.runtime.policies;
        WorkerState {
            worker_id,
            shards: policies
                .iter()
                .map(|p| ShardWriter::new(p, worker_id, self.host_ip.clone()))
                .collect(),
            buffers: policies
                .iter()
                .map(|_| BytesMut::with_capacity(BUFFER_CAPACITY))
                .collect(),
        }
    }

    /// Matches every record of `path` against every policy and persists the
    /// per-policy buffers. Blocking.
    ///
    /// Returns `Ok(None)` when the file could not be read; only an unusable
    /// output directory is an error.
    pub fn process_file(&self, path: &Path, state: &mut WorkerState) -> Result<Option<FileOutcome>, OutputError> {
        let started = Instant::now();
        let content = match output::read_source(path) {
            Ok(content) => content,
            Err(err) => {
                warn!(target = "engine", worker_id = state.worker_id, file = %path.display(), error = %err, "read source failed, skipped");
                return Ok(None);
            }
        };

        let runtime = &self.runtime;
        let policies = &runtime.policies;
        let layout = &runtime.layout;
        let marker = runtime.settings.invalid_marker.as_deref();

        let mut report = FileReport {
            matched: policies.iter().map(|p| (p.name.clone(), 0)).collect(),
            ..FileReport::default()
        };

        // 写优先：有待执行的重建时先让出
        for policy in policies.iter() {
            policy.rules.wait_for_writer();
        }
        let guards: Vec<_> = policies.iter().map(|p| p.rules.read()).collect();

        let mut fields: Vec<&str> = Vec::with_capacity(layout.field_count() + 4);
        for line in content.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            report.records += 1;

            fields.clear();
            fields.extend(line.split('|'));
            if fields.len() < runtime.min_fields {
                report.invalid += 1;
                continue;
            }
            if marker.is_some_and(|m| fields.iter().any(|f| *f == m)) {
                report.invalid += 1;
                continue;
            }

            let request_ip = field(&fields, layout.request_ip);
            let domain = field(&fields, layout.domain);
            let resolved = layout.result.map(|i| field(&fields, i)).unwrap_or("");

            if let Some(counter) = self.counter.as_ref() {
                counter.record(domain);
            }

            for (idx, policy) in policies.iter().enumerate() {
                if guards[idx].matches(request_ip, domain, resolved, policy.tag) {
                    policy
                        .format
                        .write_record(line, &fields, layout.answer, &mut state.buffers[idx]);
                    report.matched[idx].1 += 1;
                }
            }
        }
        drop(guards);

        let (published, retained) = self.persist_buffers(state)?;

        // 有匹配记录未落盘时保留源文件，等待重新分析
        if !retained {
            if let Err(err) = output::dispose_source(path, runtime.settings.backup_dir.as_deref()) {
                warn!(target = "engine", worker_id = state.worker_id, file = %path.display(), error = %err, "dispose source failed");
            }
        }

        report.elapsed = started.elapsed();
        Ok(Some(FileOutcome {
            report,
            published,
            retained,
        }))
    }

    /// Rotation check and flush for every policy shard of this worker. The flag is
    /// set when any policy's records could not be written.
    fn persist_buffers(&self, state: &mut WorkerState) -> Result<(Vec<(usize, PathBuf)>, bool), OutputError> {
        let mut published = Vec::new();
        let mut write_failed = false;
        let WorkerState {
            worker_id,
            shards,
            buffers,
        } = state;
        for (idx, (shard, buffer)) in shards.iter_mut().zip(buffers.iter_mut()).enumerate() {
            let result = shard.persist(buffer);
            buffer.clear();
            match result {
                Ok(Some(path)) => published.push((idx, path)),
                Ok(None) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    write_failed = true;
                    error!(target = "engine", worker_id = *worker_id, policy = %self.runtime.policies[idx].name, error = %err, "persist matched records failed");
                }
            }
        }
        Ok((published, write_failed))
    }

    /// Uploads a published file for `policy` and removes it once every target has it.
    pub async fn ship(&self, policy: &RuntimePolicy, path: &Path) {
        let Some(uploader) = policy.uploader.as_ref() else {
            return;
        };
        if let Err(err) = uploader.upload_and_remove(path).await {
            self.stats.record_upload_failure();
            error!(target = "engine", policy = %policy.name, file = %path.display(), error = %err, "upload failed, local file kept");
        }
    }

    /// Startup pass over every policy's output directory. Leftover temp files are
    /// published when `publish_temp` is set; uploading policies then re-send every
    /// published file still on disk, since uploaded files are removed. Returns the
    /// number of files handed to an uploader.
    pub async fn recover_outputs(&self, publish_temp: bool) -> usize {
        let mut shipped = 0;
        for policy in &self.runtime.policies {
            if publish_temp {
                let dir = policy.output_dir.clone();
                match tokio::task::spawn_blocking(move || output::recover_temp_files(&dir)).await {
                    Ok(recovered) if !recovered.is_empty() => {
                        info!(target = "engine", policy = %policy.name, files = recovered.len(), "recovered temp outputs");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(target = "engine", policy = %policy.name, error = %err, "temp file recovery failed");
                    }
                }
            }
            if policy.uploader.is_none() {
                continue;
            }
            let dir = policy.output_dir.clone();
            let pending = match tokio::task::spawn_blocking(move || output::pending_uploads(&dir)).await {
                Ok(pending) => pending,
                Err(err) => {
                    warn!(target = "engine", policy = %policy.name, error = %err, "pending upload scan failed");
                    continue;
                }
            };
            if !pending.is_empty() {
                info!(target = "engine", policy = %policy.name, files = pending.len(), "re-sending unsent outputs");
            }
            for path in &pending {
                self.ship(policy, path).await;
            }
            shipped += pending.len();
        }
        shipped
    }

    /// Worker loop: pulls files off the shared queue until a shutdown marker or
    /// the queue closes. An unusable output directory ends the worker with an error.
    pub async fn run_worker(self, worker_id: usize, queue: WorkQueue) -> anyhow::Result<()> {
        let mut state = self.worker_state(worker_id);
        let stable_after = self.runtime.stable_after();
        info!(target = "engine", worker_id, "worker started");

        loop {
            let item = {
                let mut rx = queue.lock().await;
                rx.recv().await
            };
            let path = match item {
                Some(WorkItem::File(path)) => path,
                Some(WorkItem::Shutdown) | None => break,
            };
            if !wait_until_stable(&path, stable_after).await {
                continue;
            }

            let engine = self.clone();
            let file = path.clone();
            let (returned, result) = tokio::task::spawn_blocking(move || {
                let result = engine.process_file(&file, &mut state);
                (state, result)
            })
            .await
            .context("analysis task panicked")?;
            state = returned;

            let outcome = match result {
                Ok(Some(outcome)) => outcome,
                Ok(None) => continue,
                Err(err) => {
                    error!(target = "engine", worker_id, error = %err, "output unusable, worker stopping");
                    return Err(err.into());
                }
            };

            let total = self.stats.record_file(&outcome.report);
            self.log_file(worker_id, total, &path, &outcome.report);
            if outcome.retained {
                warn!(target = "engine", worker_id, file = %path.display(), "matched records not persisted, source kept for reanalysis");
            }
            for (idx, published) in &outcome.published {
                self.ship(&self.runtime.policies[*idx], published).await;
            }
        }

        // 退出前发布当前文件
        let engine = self.clone();
        let (_, closed) = tokio::task::spawn_blocking(move || {
            let closed: Vec<(usize, PathBuf)> = state
                .shards
                .iter_mut()
                .enumerate()
                .filter_map(|(idx, shard)| shard.close().map(|p| (idx, p)))
                .collect();
            (state, closed)
        })
        .await
        .context("close task panicked")?;
        for (idx, published) in &closed {
            engine.ship(&engine.runtime.policies[*idx], published).await;
        }
        info!(target = "engine", worker_id, published = closed.len(), "worker stopped");
        Ok(())
    }

    fn log_file(&self, worker_id: usize, total: u64, path: &Path, report: &FileReport) {
        let per_policy = report
            .matched
            .iter()
            .map(|(name, n)| format!("{name}={n}"))
            .collect::<Vec<_>>()
            .join(",");
        info!(
            target = "engine",
            worker_id,
            file_no = total,
            file = %path.display(),
            records = report.records,
            invalid = report.invalid,
            matched = report.total_matched(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            qps = report.qps(),
            per_policy = %per_policy,
            "file analyzed"
        );
    }
}

/// Waits until `path` has not been modified for `stable_after`. Returns false
/// when the file disappears or cannot be inspected.
pub async fn wait_until_stable(path: &Path, stable_after: Duration) -> bool {
    loop {
        match tokio::fs::metadata(path).await {
            Ok(meta) => {
                let age = meta
                    .modified()
                    .ok()
                    .and_then(|m| m.elapsed().ok())
                    .unwrap_or(Duration::ZERO);
                if age > stable_after {
                    return true;
                }
                debug!(target = "engine", file = %path.display(), age_ms = age.as_millis() as u64, "input still being written");
                tokio::time::sleep(STABLE_POLL).await;
            }
            Err(err) => {
                warn!(target = "engine", file = %path.display(), error = %err, "input vanished before analysis");
                return false;
            }
        }
    }
}
