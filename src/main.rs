use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::UdpSocket;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use nftdns::config::load_config;
use nftdns::feed;
use nftdns::metrics;
use nftdns::rules::RuntimeConfig;
use nftdns::watcher;
use nftdns::{Dispatcher, NetlinkConnector, ServeContext};

#[derive(Parser, Debug)]
#[command(author, version, about = "nftdns: program DNS answers into nftables sets", long_about = None)]
struct Args {
    /// 配置文件路径（JSON）
    #[arg(short = 'c', long = "config", default_value = "config/nftdns.json")]
    config: PathBuf,
    /// 服务器标签，用作指标维度。
    #[arg(long = "listener-label", default_value = "default")]
    listener_label: String,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// UDP worker 数量（默认 CPU 核心数）
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
    /// 周期性输出指标的间隔（秒），0 关闭
    #[arg(long = "metrics-interval-secs", default_value_t = 0)]
    metrics_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let cfg = load_config(&args.config).context("load initial config")?;
    let runtime = RuntimeConfig::from_config(cfg).context("compile rules")?;
    let bind_addr: SocketAddr = runtime
        .settings
        .bind_udp
        .parse()
        .context("parse bind addr")?;

    let metrics_addr: Option<SocketAddr> = runtime
        .settings
        .metrics_listen
        .as_deref()
        .map(str::parse)
        .transpose()
        .context("parse metrics listen addr")?;

    let connector = NetlinkConnector::new(runtime.settings.isolate_namespace);
    let dispatcher = Dispatcher::new(connector, runtime).context("create dispatcher")?;
    let ctx = ServeContext::new(&args.listener_label);

    watcher::spawn(args.config.clone(), dispatcher.clone());

    // UDP worker 数量：默认为 CPU 核心数，最少 1 个
    let udp_workers = if args.udp_workers > 0 {
        args.udp_workers
    } else {
        num_cpus::get()
    };

    info!(bind_udp = %bind_addr, udp_workers = udp_workers, "nftdns feed started");

    let mut udp_handles = Vec::with_capacity(udp_workers);
    for worker_id in 0..udp_workers {
        let dispatcher = dispatcher.clone();
        let ctx = ctx.clone();
        let std_socket = feed::bind_udp(bind_addr)
            .with_context(|| format!("create udp socket for worker {}", worker_id))?;
        let socket = UdpSocket::from_std(std_socket)?;
        let handle = tokio::spawn(async move {
            if let Err(err) = feed::run_udp_worker(worker_id, Arc::new(socket), dispatcher, ctx).await {
                error!(worker_id, error = %err, "udp worker exited");
            }
        });
        udp_handles.push(handle);
    }

    if let Some(addr) = metrics_addr {
        let listener = metrics::bind(addr).await?;
        let registry = dispatcher.metrics().clone();
        info!(metrics_listen = %addr, "metrics endpoint started");
        tokio::spawn(async move {
            if let Err(err) = metrics::serve(listener, registry).await {
                error!(error = %err, "metrics endpoint exited");
            }
        });
    }

    if args.metrics_interval_secs > 0 {
        let dispatcher = dispatcher.clone();
        let period = Duration::from_secs(args.metrics_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                info!(
                    metrics = %dispatcher.metrics().snapshot(),
                    idle_sessions = dispatcher.pool().idle_len(),
                    opened_sessions = dispatcher.pool().opened(),
                    "nftdns metrics"
                );
            }
        });
    }

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutting down");
    for h in &udp_handles {
        h.abort();
    }
    dispatcher.pool().drain();
    Ok(())
}

fn init_tracing(debug: bool) {
    // 非 debug 仅 warn，降低热路径日志开销
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_level(debug);

    let level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
