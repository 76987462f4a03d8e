use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use rustc_hash::FxBuildHasher;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error};

/// 直方图桶上界（微秒）/ Histogram bucket upper bounds in microseconds.
const DURATION_BUCKETS_US: [f64; 10] = [
    50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 50_000.0, 250_000.0,
];

// 抓取请求头上限
const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// 单个服务器标签已解析好的指标句柄。
#[derive(Clone)]
struct ServerMetrics {
    records: IntCounter,
    duration: Histogram,
}

/// 进程内指标，按服务器标签区分，可导出为 Prometheus 文本。
/// In-process metrics keyed by server label, exported as Prometheus text.
pub struct Metrics {
    registry: Registry,
    records: IntCounterVec,
    duration: HistogramVec,
    // 标签句柄缓存，热路径不再做 label 查找
    servers: DashMap<Arc<str>, ServerMetrics, FxBuildHasher>,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let records = IntCounterVec::new(
            Opts::new("nftdns_record_count_total", "Counter of records processed."),
            &["server"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "nftdns_record_duration_microseconds",
                "Histogram of the time each record took.",
            )
            .buckets(DURATION_BUCKETS_US.to_vec()),
            &["server"],
        )?;
        registry.register(Box::new(records.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        Ok(Self {
            registry,
            records,
            duration,
            servers: DashMap::with_hasher(FxBuildHasher),
        })
    }

    fn server(&self, server: &str) -> ServerMetrics {
        if let Some(m) = self.servers.get(server) {
            return m.clone();
        }
        self.servers
            .entry(Arc::from(server))
            .or_insert_with(|| ServerMetrics {
                records: self.records.with_label_values(&[server]),
                duration: self.duration.with_label_values(&[server]),
            })
            .clone()
    }

    /// 每条合格记录计数一次 / Counted once per qualifying record.
    #[inline]
    pub fn record(&self, server: &str) {
        self.server(server).records.inc();
    }

    #[inline]
    pub fn observe(&self, server: &str, dur: Duration) {
        self.server(server)
            .duration
            .observe(dur.as_micros().min(u64::MAX as u128) as f64);
    }

    #[cfg(test)]
    pub fn records(&self, server: &str) -> u64 {
        self.servers
            .get(server)
            .map(|m| m.records.get())
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub fn observations(&self, server: &str) -> u64 {
        self.servers
            .get(server)
            .map(|m| m.duration.get_sample_count())
            .unwrap_or(0)
    }

    /// 单行摘要，供周期日志使用 / One-line summary for the periodic log.
    pub fn snapshot(&self) -> String {
        let mut servers: Vec<_> = self
            .servers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        if servers.is_empty() {
            return "records=0".to_string();
        }
        servers.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = String::new();
        for (name, m) in servers {
            let count = m.duration.get_sample_count();
            let avg = if count > 0 {
                (m.duration.get_sample_sum() / count as f64) as u64
            } else {
                0
            };
            if !out.is_empty() {
                out.push(' ');
            }
            let _ = write!(out, "{}:records={} avg_us={}", name, m.records.get(), avg);
        }
        out
    }

    /// Prometheus 文本格式 / Prometheus text exposition.
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .context("encode metrics")?;
        String::from_utf8(buf).context("metrics text is not utf-8")
    }
}

/// 指标抓取端点：每个连接读完请求头后回写一次文本并关闭。
/// Scrape endpoint: every connection gets one text response, then is closed.
pub async fn serve(listener: TcpListener, metrics: Arc<Metrics>) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_scrape(stream, &metrics).await {
                debug!(peer = %peer, error = %err, "metrics scrape failed");
            }
        });
    }
}

pub async fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind metrics listener {}", addr))
}

async fn handle_scrape(mut stream: TcpStream, metrics: &Metrics) -> anyhow::Result<()> {
    let mut head = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        head.extend_from_slice(&chunk[..n]);
        if head.len() > MAX_REQUEST_HEAD {
            anyhow::bail!("request head too large");
        }
    }

    let (status, content_type, body) = match metrics.render() {
        Ok(body) => ("200 OK", TextEncoder::new().format_type().to_string(), body),
        Err(err) => {
            error!(error = %err, "render metrics failed");
            (
                "500 Internal Server Error",
                "text/plain".to_string(),
                String::new(),
            )
        }
    };
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}
