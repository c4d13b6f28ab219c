mod config;
mod counter;
mod discovery;
mod engine;
mod format;
mod ipset;
mod matcher;
mod output;
mod rules;
mod stats;
mod trie;
mod upload;
mod watcher;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::load_config;
use crate::counter::DomainCounter;
use crate::discovery::{FileFilter, work_queue};
use crate::engine::Engine;
use crate::matcher::RuntimeConfig;
use crate::stats::PipelineStats;

#[derive(Parser, Debug)]
#[command(author, version, about = "KixLog DNS query log splitter with hot-reload rules", long_about = None)]
struct Args {
    /// 配置文件路径（JSON）
    #[arg(short = 'c', long = "config", default_value = "config/kixlog.json")]
    config: PathBuf,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// 以 JSON 格式输出日志
    #[arg(long = "json-logs", default_value_t = false)]
    json_logs: bool,
    /// 强制离线模式：处理完存量文件后退出
    #[arg(long = "offline", default_value_t = false)]
    offline: bool,
    /// 只加载并校验配置与规则，然后退出
    #[arg(long = "check", default_value_t = false)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug, args.json_logs);

    let mut cfg = load_config(&args.config).context("load initial config")?;
    if args.offline {
        cfg.settings.online_mode = false;
    }

    // 规则加载与上传连接都是阻塞操作
    let runtime = tokio::task::spawn_blocking(move || RuntimeConfig::from_config(cfg))
        .await
        .context("compile task panicked")?
        .context("compile policies")?;
    let runtime = Arc::new(runtime);

    if args.check {
        report_check(&runtime);
        return Ok(());
    }

    let filter = FileFilter::new(&runtime.settings.input_pattern).context("compile input_pattern")?;
    let host_ip = output::resolve_host_ip(runtime.settings.host_ip.as_deref());
    let workers = if runtime.settings.analyze_threads > 0 {
        runtime.settings.analyze_threads
    } else {
        num_cpus::get()
    };

    let stats = Arc::new(PipelineStats::new());
    let counter = if runtime.settings.domain_counter.enabled {
        let (counter, _aggregator) = DomainCounter::spawn(&runtime.settings.domain_counter);
        counter.spawn_flusher(Duration::from_secs(
            runtime.settings.domain_counter.flush_interval_secs,
        ));
        Some(counter)
    } else {
        None
    };
    let engine = Engine::new(runtime.clone(), stats.clone(), counter.clone(), host_ip.clone());

    info!(
        policies = runtime.policies.len(),
        workers,
        host_ip = %host_ip,
        online = runtime.settings.online_mode,
        input_dir = %runtime.settings.input_dir.display(),
        "kixlog started"
    );

    let resent = engine.recover_outputs(runtime.settings.recover_temp_files).await;
    if resent > 0 {
        info!(files = resent, "startup outputs handed to uploaders");
    }

    let reload = watcher::spawn(runtime.clone());
    let status = spawn_status(stats.clone(), runtime.settings.status_interval_secs);

    let (tx, queue) = work_queue();
    let mut pool = JoinSet::new();
    for worker_id in 0..workers {
        pool.spawn(engine.clone().run_worker(worker_id, queue.clone()));
    }

    let online = runtime.settings.online_mode;
    let input_dir = runtime.settings.input_dir.clone();
    if online {
        discovery::spawn_online(input_dir, filter, tx);
    } else {
        let queued = tokio::task::spawn_blocking(move || {
            discovery::enqueue_offline(&input_dir, &filter, &tx, workers)
        })
        .await
        .context("offline walk panicked")?;
        info!(files = queued, "offline run queued");
    }

    let result = supervise(&mut pool, online).await;

    reload.abort();
    if let Some(status) = status {
        status.abort();
    }
    stats.log_status();
    if let Some(counter) = counter.as_ref() {
        if let Err(err) = counter.flush().await {
            warn!(error = %err, "final domain counter flush failed");
        }
    }
    result
}

/// Waits for the worker pool. Any worker error is process-fatal. Online runs
/// also end on ctrl-c; offline runs end once every worker has exited.
async fn supervise(pool: &mut JoinSet<anyhow::Result<()>>, online: bool) -> anyhow::Result<()> {
    let shutdown = async {
        if online {
            let _ = tokio::signal::ctrl_c().await;
        } else {
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested");
                pool.abort_all();
                return Ok(());
            }
            joined = pool.join_next() => match joined {
                None => {
                    info!("all workers finished");
                    return Ok(());
                }
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(err))) => {
                    error!(error = %err, "worker failed, exiting");
                    pool.abort_all();
                    return Err(err);
                }
                Some(Err(err)) => {
                    pool.abort_all();
                    return Err(anyhow::anyhow!("worker task aborted: {err}"));
                }
            },
        }
    }
}

fn spawn_status(stats: Arc<PipelineStats>, interval_secs: u64) -> Option<tokio::task::JoinHandle<()>> {
    if interval_secs == 0 {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            stats.log_status();
        }
    }))
}

fn report_check(runtime: &RuntimeConfig) {
    println!("min_fields: {}", runtime.min_fields);
    for policy in &runtime.policies {
        let rules = policy.rules.read();
        println!(
            "policy {}: tag={} v4={} v6={} domains={} upload={}",
            policy.name,
            policy.tag.code(),
            rules.v4.entry_count(),
            rules.v6.len(),
            rules.domains.len(),
            policy.uploader.as_ref().map(|u| u.target_count()).unwrap_or(0)
        );
    }
}

fn init_tracing(debug: bool, json: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_ansi(false))
            .init();
    }
}
