use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use arc_swap::ArcSwap;
use tracing::{debug, error, info, warn};

use crate::answer::AnswerSet;
use crate::applier::{self, ApplyOutcome, SkipReason};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::nft::{AddrKind, Connector};
use crate::pool::Pool;
use crate::retry::RetryLimiter;
use crate::rules::RuntimeConfig;

/// 调用方身份，用于指标标签 / Caller identity used as the metrics label.
#[derive(Debug, Clone)]
pub struct ServeContext {
    pub server: Arc<str>,
}

impl ServeContext {
    pub fn new(server: &str) -> Self {
        Self {
            server: Arc::from(server),
        }
    }
}

struct Inner<K: Connector> {
    pool: Pool<K>,
    limiter: ArcSwap<RetryLimiter>,
    runtime: ArcSwap<RuntimeConfig>,
    metrics: Arc<Metrics>,
}

/// 把 DNS 应答中的地址分发到 nftables 集合。
/// Fans the addresses of each DNS answer out to the configured nftables sets.
pub struct Dispatcher<K: Connector> {
    inner: Arc<Inner<K>>,
}

impl<K: Connector> Clone for Dispatcher<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Connector> Dispatcher<K> {
    pub fn new(connector: K, runtime: RuntimeConfig) -> anyhow::Result<Self> {
        let metrics = Metrics::new().context("register metrics")?;
        connector.reconfigure(&runtime.settings);
        let pool = Pool::new(connector, runtime.connection_timeout());
        let limiter = RetryLimiter::new(runtime.retry_settings());
        Ok(Self {
            inner: Arc::new(Inner {
                pool,
                limiter: ArcSwap::from_pointee(limiter),
                runtime: ArcSwap::from_pointee(runtime),
                metrics: Arc::new(metrics),
            }),
        })
    }

    pub fn pool(&self) -> &Pool<K> {
        &self.inner.pool
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    pub fn limiter(&self) -> Arc<RetryLimiter> {
        self.inner.limiter.load_full()
    }

    pub fn runtime(&self) -> Arc<RuntimeConfig> {
        self.inner.runtime.load_full()
    }

    /// 热加载：原子替换规则，必要时重建限流表，并清空连接池。
    pub fn reload(&self, runtime: RuntimeConfig) {
        let retry = runtime.retry_settings();
        if *self.inner.limiter.load().settings() != retry {
            self.inner.limiter.store(Arc::new(RetryLimiter::new(retry)));
            debug!(max_retry_times = ?retry.max_retry_times, "retry limiter rebuilt");
        }
        self.inner.pool.set_ttl(runtime.connection_timeout());
        self.inner.pool.connector().reconfigure(&runtime.settings);
        let targets = runtime.target_count();
        self.inner.runtime.store(Arc::new(runtime));
        self.inner.pool.drain();
        info!(targets, "nftables rules reloaded");
    }

    /// 应答处理入口。同步模式等待内核写入完成；异步模式立即返回 0。
    /// Never surfaces kernel problems to the DNS path beyond the returned error.
    pub async fn serve_answer(&self, ctx: &ServeContext, answers: AnswerSet) -> anyhow::Result<usize> {
        let runtime = self.inner.runtime.load_full();
        if !qualifies(&runtime, &answers) {
            return Ok(0);
        }

        let this = self.clone();
        let server = ctx.server.clone();
        if runtime.async_mode() {
            tokio::task::spawn_blocking(move || {
                if let Err(err) = this.apply_with(&runtime, &server, &answers) {
                    warn!(server = %server, error = %err, "async nftables apply failed");
                }
            });
            return Ok(0);
        }

        let applied = tokio::task::spawn_blocking(move || this.apply_with(&runtime, &server, &answers))
            .await
            .context("nftables worker panicked")??;
        Ok(applied)
    }

    /// 阻塞核心：在当前线程完成整组应答 / Blocking core, runs the whole answer set inline.
    pub fn apply_answer(&self, ctx: &ServeContext, answers: &AnswerSet) -> Result<usize> {
        let runtime = self.inner.runtime.load_full();
        if !qualifies(&runtime, answers) {
            return Ok(0);
        }
        self.apply_with(&runtime, &ctx.server, answers)
    }

    fn apply_with(&self, runtime: &RuntimeConfig, server: &str, answers: &AnswerSet) -> Result<usize> {
        let limiter = self.inner.limiter.load();
        let metrics = &self.inner.metrics;
        // 第一条需要写内核的记录出现时才借会话
        let mut session = None;
        let mut applied = 0usize;

        for (record, addr) in answers.addresses() {
            let kind = AddrKind::of(&addr);
            if !runtime.has_targets_for(kind) {
                continue;
            }
            let started = Instant::now();
            metrics.record(server);

            if limiter.should_skip(addr, &record.name) {
                debug!(
                    addr = %addr,
                    name = %record.name,
                    reason = %SkipReason::RetryLimited,
                    "address skipped"
                );
                metrics.observe(server, started.elapsed());
                continue;
            }

            if session.is_none() {
                match self.inner.pool.acquire() {
                    Ok(s) => session = Some(s),
                    Err(err) => {
                        // 计数与耗时保持成对
                        metrics.observe(server, started.elapsed());
                        return Err(err);
                    }
                }
            }
            let Some(s) = session.as_mut() else {
                continue;
            };

            let mut succeeded = false;
            for target in runtime.targets_for(kind) {
                match applier::apply(s, target, addr) {
                    Ok(ApplyOutcome::Applied) => {
                        succeeded = true;
                        applied += 1;
                    }
                    Ok(ApplyOutcome::Skipped(reason)) => {
                        debug!(
                            family = %target.family,
                            table = %target.table,
                            set = %target.set,
                            addr = %addr,
                            reason = %reason,
                            "address skipped"
                        );
                    }
                    Err(err) => {
                        error!(
                            family = %target.family,
                            table = %target.table,
                            set = %target.set,
                            addr = %addr,
                            name = %record.name,
                            session = s.id(),
                            error = %err,
                            "nftables apply failed"
                        );
                    }
                }
            }
            limiter.record_outcome(addr, &record.name, succeeded);
            metrics.observe(server, started.elapsed());
        }

        if let Some(s) = session {
            self.inner.pool.release(s);
        }
        if applied > 0 {
            debug!(server = %server, applied, "answer applied to nftables");
        }
        Ok(applied)
    }
}

/// 无地址或无可达目标时不碰连接池 / The pool is left alone when nothing can be applied.
fn qualifies(runtime: &RuntimeConfig, answers: &AnswerSet) -> bool {
    answers
        .addresses()
        .any(|(_, addr)| runtime.has_targets_for(AddrKind::of(&addr)))
}
