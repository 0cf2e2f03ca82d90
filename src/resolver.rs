//! The resolution engine: cache lookup, nameserver iteration with timeouts
//! and failover, answer validation.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RecordType};
use rand::seq::SliceRandom;
use rustc_hash::FxBuildHasher;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::answer::Answer;
use crate::cache::{RecordKey, ResolverCache};
use crate::config::{ResolverConfig, ResolverSettings, read_resolv_conf};
use crate::error::{ResolveError, Result};
use crate::selector::{Selector, default_selector};
use crate::transport::{self, TransportError, build_query};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(30);

/// First pause between two passes over the nameserver list; doubles each pass.
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Per-server error strings kept for the `Exhausted` message.
const MAX_RECORDED_ERRORS: usize = 32;

/// What to do once every nameserver has been tried without a final answer.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Walk the remaining list again, with backoff, until the lifetime runs out.
    #[default]
    UntilLifetime,
    /// Give up after one pass.
    SinglePass,
}

/// Resolver-wide behavior, fixed at construction.
#[derive(Debug, Clone)]
pub struct ResolverOpts {
    /// Upper bound for one exchange with one nameserver.
    pub timeout: Duration,
    /// Upper bound for a whole resolution.
    pub lifetime: Duration,
    pub retry_policy: RetryPolicy,
    /// Re-ask over TCP when a UDP response comes back truncated.
    pub tcp_fallback: bool,
    pub use_tcp: bool,
    /// Keep asking a server that answered SERVFAIL instead of dropping it.
    pub retry_servfail: bool,
    pub rotate: bool,
}

impl Default for ResolverOpts {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            lifetime: DEFAULT_LIFETIME,
            retry_policy: RetryPolicy::default(),
            tcp_fallback: true,
            use_tcp: false,
            retry_servfail: false,
            rotate: false,
        }
    }
}

impl ResolverOpts {
    pub fn from_settings(settings: &ResolverSettings) -> Self {
        Self {
            timeout: Duration::from_millis(settings.timeout_ms),
            lifetime: Duration::from_millis(settings.lifetime_ms),
            retry_policy: settings.retry_policy,
            tcp_fallback: settings.tcp_fallback,
            use_tcp: settings.use_tcp,
            retry_servfail: settings.retry_servfail,
            rotate: settings.rotate,
        }
    }
}

/// Per-call overrides.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Force (or forbid) TCP for this call.
    pub tcp: Option<bool>,
    /// Per-attempt timeout; wins over resolv.conf and `ResolverOpts`.
    pub timeout: Option<Duration>,
    pub lifetime: Option<Duration>,
    /// Fail with `NoAnswer` when the response has no RRset for the question.
    pub raise_on_no_answer: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            tcp: None,
            timeout: None,
            lifetime: None,
            raise_on_no_answer: true,
        }
    }
}

#[derive(Debug, Default)]
struct ServerStats {
    queries: AtomicU64,
    responses: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStatsSnapshot {
    pub queries: u64,
    pub responses: u64,
    pub failures: u64,
    pub timeouts: u64,
}

#[derive(Clone)]
pub struct Resolver {
    config: Arc<ArcSwap<ResolverConfig>>,
    opts: Arc<ResolverOpts>,
    cache: Option<Arc<dyn ResolverCache>>,
    selector: Arc<dyn Selector>,
    stats: Arc<DashMap<SocketAddr, Arc<ServerStats>, FxBuildHasher>>,
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("config", &self.config.load())
            .field("opts", &self.opts)
            .field("cache", &self.cache.is_some())
            .field("selector", &self.selector.name())
            .finish()
    }
}

impl Resolver {
    /// A resolver without a cache, using the default selector.
    pub fn new(config: ResolverConfig, opts: ResolverOpts) -> Self {
        Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            opts: Arc::new(opts),
            cache: None,
            selector: default_selector(),
            stats: Arc::new(DashMap::with_hasher(FxBuildHasher::default())),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResolverCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_selector(mut self, selector: Arc<dyn Selector>) -> Self {
        self.selector = selector;
        self
    }

    /// Builds a resolver from settings; nameservers come from the settings
    /// override when present, otherwise from the resolv.conf it points at.
    pub fn from_settings(settings: &ResolverSettings) -> anyhow::Result<Self> {
        let config = if settings.nameservers.is_empty() {
            read_resolv_conf(&settings.resolv_conf, settings.port)?
        } else {
            let nameservers = settings
                .parse_nameservers()
                .context("parse nameservers from settings")?;
            ResolverConfig::from_nameservers(nameservers)
        };
        info!(
            target = "resolver",
            nameservers = config.nameservers.len(),
            selector = ?settings.selector,
            cache = ?settings.cache.kind,
            "resolver configured"
        );

        let mut resolver = Self::new(config, ResolverOpts::from_settings(settings))
            .with_selector(settings.selector.build());
        if let Some(cache) = settings.cache.build() {
            resolver = resolver.with_cache(cache);
        }
        Ok(resolver)
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> Arc<ResolverConfig> {
        self.config.load_full()
    }

    /// Shared handle for swapping the configuration from elsewhere.
    pub fn config_handle(&self) -> Arc<ArcSwap<ResolverConfig>> {
        Arc::clone(&self.config)
    }

    /// Replaces the configuration. Resolutions already running keep the
    /// snapshot they started with.
    pub fn set_config(&self, config: ResolverConfig) {
        self.config.store(Arc::new(config));
    }

    pub fn opts(&self) -> &ResolverOpts {
        &self.opts
    }

    pub fn cache(&self) -> Option<&Arc<dyn ResolverCache>> {
        self.cache.as_ref()
    }

    pub fn selector(&self) -> &dyn Selector {
        self.selector.as_ref()
    }

    pub async fn resolve(&self, name: &Name, rtype: RecordType, rclass: DNSClass) -> Result<Answer> {
        self.resolve_with(name, rtype, rclass, &ResolveOptions::default())
            .await
    }

    pub async fn resolve_with(
        &self,
        name: &Name,
        rtype: RecordType,
        rclass: DNSClass,
        options: &ResolveOptions,
    ) -> Result<Answer> {
        let config = self.config.load_full();
        let start = Instant::now();
        let lifetime = options.lifetime.unwrap_or(self.opts.lifetime);
        let mut nxdomains = Vec::new();

        for qname in candidate_names(name, &config)? {
            let key = RecordKey::new(qname.clone(), rtype, rclass);
            if let Some(answer) = self.cache.as_ref().and_then(|c| c.get(&key)) {
                debug!(target = "resolver", event = "cache_hit", qname = %qname, rtype = %rtype);
                if !answer.has_records() && options.raise_on_no_answer {
                    return Err(ResolveError::NoAnswer { name: qname, rtype });
                }
                return Ok(answer);
            }

            let response = self
                .query_nameservers(&config, &qname, rtype, rclass, options, start, lifetime)
                .await?;
            if response.response_code() == ResponseCode::NXDomain {
                debug!(target = "resolver", event = "nxdomain", qname = %qname);
                nxdomains.push(qname);
                continue;
            }

            let answer = Answer::from_response(
                qname,
                rtype,
                rclass,
                response,
                options.raise_on_no_answer,
            )?;
            if let Some(cache) = &self.cache {
                cache.put(key, answer.clone());
            }
            return Ok(answer);
        }

        Err(ResolveError::NxDomain { qnames: nxdomains })
    }

    /// Asks the configured nameservers in order until one gives a final
    /// response (NOERROR or NXDOMAIN).
    #[allow(clippy::too_many_arguments)]
    async fn query_nameservers(
        &self,
        config: &ResolverConfig,
        qname: &Name,
        rtype: RecordType,
        rclass: DNSClass,
        options: &ResolveOptions,
        start: Instant,
        lifetime: Duration,
    ) -> Result<Message> {
        let mut nameservers = config.nameservers.clone();
        if nameservers.is_empty() {
            return Err(ResolveError::NoNameservers);
        }
        if self.opts.rotate || config.rotate {
            nameservers.shuffle(&mut rand::thread_rng());
        }
        let per_attempt = options
            .timeout
            .or(config.timeout)
            .unwrap_or(self.opts.timeout);
        let use_tcp = options.tcp.unwrap_or(self.opts.use_tcp);

        let query = build_query(qname, rtype, rclass);
        let wire = query.to_vec()?;
        let mut errors: Vec<String> = Vec::new();
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let mut idx = 0;
            while idx < nameservers.len() {
                let server = nameservers[idx];
                let deadline = attempt_deadline(start, lifetime, per_attempt)?;
                let result = self
                    .exchange(&query, &wire, server, use_tcp, deadline, start, lifetime, per_attempt)
                    .await;

                match result {
                    Ok(response) => match response.response_code() {
                        ResponseCode::NoError | ResponseCode::NXDomain => return Ok(response),
                        ResponseCode::YXDomain => return Err(ResolveError::YxDomain),
                        ResponseCode::ServFail if self.opts.retry_servfail => {
                            debug!(target = "resolver", event = "servfail", server = %server, qname = %qname);
                            record_error(&mut errors, server, "SERVFAIL");
                            idx += 1;
                        }
                        rcode => {
                            warn!(target = "resolver", event = "nameserver_dropped", server = %server, rcode = %rcode, qname = %qname);
                            record_error(&mut errors, server, &rcode.to_string());
                            nameservers.remove(idx);
                        }
                    },
                    Err(err) => {
                        debug!(target = "resolver", event = "nameserver_failed", server = %server, error = %err, qname = %qname);
                        record_error(&mut errors, server, &err.to_string());
                        idx += 1;
                    }
                }
            }

            if nameservers.is_empty() || self.opts.retry_policy == RetryPolicy::SinglePass {
                // A pass cut short by the lifetime is a timeout, not exhaustion.
                remaining_lifetime(start, lifetime)?;
                return Err(ResolveError::Exhausted(errors.join("; ")));
            }

            let remaining = remaining_lifetime(start, lifetime)?;
            tokio::time::sleep(remaining.min(backoff)).await;
            backoff = backoff.saturating_mul(2);
        }
    }

    /// One exchange with one server, including the TCP retry of a
    /// truncated UDP response.
    #[allow(clippy::too_many_arguments)]
    async fn exchange(
        &self,
        query: &Message,
        wire: &[u8],
        server: SocketAddr,
        use_tcp: bool,
        deadline: Instant,
        start: Instant,
        lifetime: Duration,
        per_attempt: Duration,
    ) -> std::result::Result<Message, TransportError> {
        let stats = self.server_stats_entry(server);
        stats.queries.fetch_add(1, Ordering::Relaxed);
        let selector = self.selector.as_ref();

        let res = if use_tcp {
            transport::tcp(query, wire, server, selector, deadline).await
        } else {
            match transport::udp(query, wire, server, selector, deadline).await {
                Ok(response) if response.truncated() && self.opts.tcp_fallback => {
                    debug!(target = "resolver", event = "tcp_fallback", server = %server);
                    match attempt_deadline(start, lifetime, per_attempt) {
                        Ok(deadline) => transport::tcp(query, wire, server, selector, deadline).await,
                        Err(_) => Err(TransportError::Timeout),
                    }
                }
                other => other,
            }
        };

        match &res {
            Ok(_) => stats.responses.fetch_add(1, Ordering::Relaxed),
            Err(TransportError::Timeout) => stats.timeouts.fetch_add(1, Ordering::Relaxed),
            Err(_) => stats.failures.fetch_add(1, Ordering::Relaxed),
        };
        res
    }

    fn server_stats_entry(&self, server: SocketAddr) -> Arc<ServerStats> {
        Arc::clone(self.stats.entry(server).or_default().value())
    }

    /// Counters per nameserver address, sorted by address.
    pub fn server_stats(&self) -> Vec<(SocketAddr, ServerStatsSnapshot)> {
        let mut out: Vec<_> = self
            .stats
            .iter()
            .map(|entry| {
                let s = entry.value();
                (
                    *entry.key(),
                    ServerStatsSnapshot {
                        queries: s.queries.load(Ordering::Relaxed),
                        responses: s.responses.load(Ordering::Relaxed),
                        failures: s.failures.load(Ordering::Relaxed),
                        timeouts: s.timeouts.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();
        out.sort_by_key(|(addr, _)| *addr);
        out
    }

    pub fn metrics_snapshot(&self) -> String {
        self.server_stats()
            .iter()
            .map(|(addr, s)| {
                format!(
                    "{} queries={} responses={} failures={} timeouts={}",
                    addr, s.queries, s.responses, s.failures, s.timeouts
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// The absolute names to try for `name`, in order.
///
/// An absolute name is tried as-is. A relative name is tried as an absolute
/// name first when it has more than one label, then under each search
/// suffix.
fn candidate_names(name: &Name, config: &ResolverConfig) -> Result<Vec<Name>> {
    if name.is_fqdn() {
        return Ok(vec![name.clone()]);
    }
    let mut as_absolute = name.clone();
    as_absolute.set_fqdn(true);

    let mut out = Vec::new();
    if name.num_labels() > 1 {
        out.push(as_absolute.clone());
    }
    for suffix in config.search_suffixes() {
        let candidate = name.clone().append_domain(suffix)?;
        if !out.contains(&candidate) {
            out.push(candidate);
        }
    }
    if out.is_empty() {
        out.push(as_absolute);
    }
    Ok(out)
}

fn remaining_lifetime(start: Instant, lifetime: Duration) -> Result<Duration> {
    let elapsed = start.elapsed();
    if elapsed >= lifetime {
        return Err(ResolveError::Timeout(lifetime));
    }
    Ok(lifetime - elapsed)
}

fn attempt_deadline(start: Instant, lifetime: Duration, per_attempt: Duration) -> Result<Instant> {
    let remaining = remaining_lifetime(start, lifetime)?;
    Ok(Instant::now() + remaining.min(per_attempt))
}

fn record_error(errors: &mut Vec<String>, server: SocketAddr, error: &str) {
    if errors.len() < MAX_RECORDED_ERRORS {
        errors.push(format!("{server}: {error}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, LruCache};
    use crate::selector::{ReactorSelector, ReadyFuture, SelectorKind, Watched};
    use crate::testing::{FakeNameserver, Proto, Reply, a_record, closed_port, name, reply, soa_record};
    use futures::future::join_all;
    use std::sync::atomic::AtomicUsize;

    fn opts(timeout_ms: u64, lifetime_ms: u64) -> ResolverOpts {
        ResolverOpts {
            timeout: Duration::from_millis(timeout_ms),
            lifetime: Duration::from_millis(lifetime_ms),
            ..ResolverOpts::default()
        }
    }

    fn backends() -> Vec<Arc<dyn Selector>> {
        vec![SelectorKind::Reactor.build(), SelectorKind::Poll.build()]
    }

    fn resolver(servers: &[SocketAddr], opts: ResolverOpts) -> Resolver {
        Resolver::new(ResolverConfig::from_nameservers(servers.to_vec()), opts)
    }

    #[derive(Debug)]
    struct NeverReady;

    impl Selector for NeverReady {
        fn wait_for_readable<'a>(&'a self, _socket: Watched<'a>, _deadline: Instant) -> ReadyFuture<'a> {
            Box::pin(async { Ok(false) })
        }

        fn name(&self) -> &'static str {
            "never"
        }
    }

    #[derive(Debug, Default)]
    struct CountingSelector {
        inner: ReactorSelector,
        waits: AtomicUsize,
    }

    impl Selector for CountingSelector {
        fn wait_for_readable<'a>(&'a self, socket: Watched<'a>, deadline: Instant) -> ReadyFuture<'a> {
            self.waits.fetch_add(1, Ordering::SeqCst);
            self.inner.wait_for_readable(socket, deadline)
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    #[tokio::test]
    async fn resolves_and_caches() {
        for selector in backends() {
            let server = FakeNameserver::answering([10, 0, 0, 1]).await;
            let cache: Arc<Cache> = Arc::new(Cache::new());
            let r = resolver(&[server.addr], opts(1000, 5000))
                .with_cache(cache.clone())
                .with_selector(selector);

            let answer = r.resolve(&name("example."), RecordType::A, DNSClass::IN).await.unwrap();
            assert_eq!(answer.records().len(), 1, "{} selector", r.selector().name());
            assert_eq!(server.hits(), 1);

            let again = r.resolve(&name("example."), RecordType::A, DNSClass::IN).await.unwrap();
            assert_eq!(again.records(), answer.records());
            assert_eq!(server.hits(), 1, "second lookup must come from the cache");
            assert_eq!(cache.stats().hits, 1);
        }
    }

    #[tokio::test]
    async fn without_cache_every_lookup_hits_the_network() {
        let server = FakeNameserver::answering([10, 0, 0, 1]).await;
        let r = resolver(&[server.addr], opts(1000, 5000));
        for _ in 0..3 {
            r.resolve(&name("example."), RecordType::A, DNSClass::IN).await.unwrap();
        }
        assert_eq!(server.hits(), 3);
    }

    #[tokio::test]
    async fn fails_over_to_next_nameserver() {
        for selector in backends() {
            let dead = closed_port().await;
            let silent = FakeNameserver::silent().await;
            let good = FakeNameserver::answering([10, 0, 0, 2]).await;
            let r = resolver(&[dead, silent.addr, good.addr], opts(200, 5000)).with_selector(selector);

            let answer = r.resolve(&name("example."), RecordType::A, DNSClass::IN).await.unwrap();
            assert_eq!(answer.records().len(), 1, "{} selector", r.selector().name());
            assert_eq!(silent.hits(), 1);
            assert_eq!(good.hits(), 1);

            let stats = r.server_stats();
            let silent_stats = stats.iter().find(|(a, _)| *a == silent.addr).unwrap().1;
            assert_eq!(silent_stats.timeouts, 1);
            let good_stats = stats.iter().find(|(a, _)| *a == good.addr).unwrap().1;
            assert_eq!(good_stats.responses, 1);
        }
    }

    #[tokio::test]
    async fn nxdomain_is_final() {
        let first = FakeNameserver::spawn(|req, _| Reply::Message(reply(req, ResponseCode::NXDomain))).await;
        let second = FakeNameserver::answering([10, 0, 0, 3]).await;
        let r = resolver(&[first.addr, second.addr], opts(1000, 5000));

        let err = r.resolve(&name("nope.example."), RecordType::A, DNSClass::IN).await.unwrap_err();
        match err {
            ResolveError::NxDomain { qnames } => assert_eq!(qnames, vec![name("nope.example.")]),
            other => panic!("expected NXDOMAIN, got {other:?}"),
        }
        assert_eq!(second.hits(), 0);
    }

    #[tokio::test]
    async fn no_answer_is_final_and_typed() {
        let server = FakeNameserver::spawn(|req, _| {
            let mut resp = reply(req, ResponseCode::NoError);
            resp.add_name_server(soa_record("example.", 300, 60));
            Reply::Message(resp)
        })
        .await;
        let other = FakeNameserver::answering([10, 0, 0, 3]).await;
        let r = resolver(&[server.addr, other.addr], opts(1000, 5000));

        let err = r.resolve(&name("example."), RecordType::AAAA, DNSClass::IN).await.unwrap_err();
        assert!(matches!(err, ResolveError::NoAnswer { rtype: RecordType::AAAA, .. }));
        assert_eq!(other.hits(), 0);

        let options = ResolveOptions {
            raise_on_no_answer: false,
            ..ResolveOptions::default()
        };
        let empty = r
            .resolve_with(&name("example."), RecordType::AAAA, DNSClass::IN, &options)
            .await
            .unwrap();
        assert!(!empty.has_records());
    }

    #[tokio::test]
    async fn cached_empty_answer_still_raises() {
        let server = FakeNameserver::spawn(|req, _| {
            let mut resp = reply(req, ResponseCode::NoError);
            resp.add_name_server(soa_record("example.", 300, 60));
            Reply::Message(resp)
        })
        .await;
        let r = resolver(&[server.addr], opts(1000, 5000)).with_cache(Arc::new(LruCache::new(16)));
        let lenient = ResolveOptions {
            raise_on_no_answer: false,
            ..ResolveOptions::default()
        };
        r.resolve_with(&name("example."), RecordType::MX, DNSClass::IN, &lenient)
            .await
            .unwrap();
        let err = r.resolve(&name("example."), RecordType::MX, DNSClass::IN).await.unwrap_err();
        assert!(matches!(err, ResolveError::NoAnswer { .. }));
        assert_eq!(server.hits(), 1);
    }

    #[tokio::test]
    async fn no_nameservers_fails_without_io() {
        let selector = Arc::new(CountingSelector::default());
        let r = resolver(&[], opts(1000, 5000)).with_selector(selector.clone());
        let err = r.resolve(&name("example."), RecordType::A, DNSClass::IN).await.unwrap_err();
        assert!(matches!(err, ResolveError::NoNameservers));
        assert_eq!(selector.waits.load(Ordering::SeqCst), 0);
        assert!(r.server_stats().is_empty());
    }

    #[tokio::test]
    async fn lifetime_exhaustion_times_out() {
        let silent = FakeNameserver::silent().await;
        let r = resolver(&[silent.addr], opts(100, 450));
        let started = Instant::now();
        let err = r.resolve(&name("example."), RecordType::A, DNSClass::IN).await.unwrap_err();
        assert!(matches!(err, ResolveError::Timeout(_)), "{err:?}");
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(400));
        assert!(elapsed < Duration::from_secs(3));
        // The list was walked more than once before giving up.
        assert!(silent.hits() >= 2);
    }

    #[tokio::test]
    async fn single_pass_gives_up_after_one_walk() {
        let a = FakeNameserver::silent().await;
        let b = FakeNameserver::silent().await;
        let r = resolver(
            &[a.addr, b.addr],
            ResolverOpts {
                retry_policy: RetryPolicy::SinglePass,
                ..opts(100, 10_000)
            },
        );
        let err = r.resolve(&name("example."), RecordType::A, DNSClass::IN).await.unwrap_err();
        assert!(matches!(err, ResolveError::Exhausted(_)), "{err:?}");
        assert_eq!(a.hits(), 1);
        assert_eq!(b.hits(), 1);
    }

    #[tokio::test]
    async fn single_pass_cut_short_by_lifetime_times_out() {
        let silent = FakeNameserver::silent().await;
        let r = resolver(
            &[silent.addr],
            ResolverOpts {
                retry_policy: RetryPolicy::SinglePass,
                ..opts(1000, 200)
            },
        );
        let started = Instant::now();
        let err = r.resolve(&name("example."), RecordType::A, DNSClass::IN).await.unwrap_err();
        assert!(matches!(err, ResolveError::Timeout(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn refused_everywhere_is_exhausted() {
        let server = FakeNameserver::spawn(|req, _| Reply::Message(reply(req, ResponseCode::Refused))).await;
        let r = resolver(&[server.addr], opts(1000, 5000));
        let err = r.resolve(&name("example."), RecordType::A, DNSClass::IN).await.unwrap_err();
        match err {
            ResolveError::Exhausted(msg) => assert!(msg.contains(&server.addr.to_string()), "{msg}"),
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert_eq!(server.hits(), 1);
    }

    #[tokio::test]
    async fn servfail_drops_server_unless_retrying() {
        let failing = FakeNameserver::spawn(|req, _| Reply::Message(reply(req, ResponseCode::ServFail))).await;
        let good = FakeNameserver::answering([10, 0, 0, 4]).await;
        let r = resolver(&[failing.addr, good.addr], opts(1000, 5000));
        r.resolve(&name("example."), RecordType::A, DNSClass::IN).await.unwrap();
        assert_eq!(failing.hits(), 1);

        let only_failing = resolver(
            &[failing.addr],
            ResolverOpts {
                retry_servfail: true,
                ..opts(1000, 400)
            },
        );
        let err = only_failing
            .resolve(&name("example."), RecordType::A, DNSClass::IN)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Timeout(_)), "{err:?}");
        assert!(failing.hits() >= 3);
    }

    #[tokio::test]
    async fn yxdomain_raises() {
        let server = FakeNameserver::spawn(|req, _| Reply::Message(reply(req, ResponseCode::YXDomain))).await;
        let r = resolver(&[server.addr], opts(1000, 5000));
        let err = r.resolve(&name("example."), RecordType::A, DNSClass::IN).await.unwrap_err();
        assert!(matches!(err, ResolveError::YxDomain));
    }

    #[tokio::test]
    async fn malformed_response_advances_to_next_server() {
        let broken = FakeNameserver::spawn(|req, _| {
            let mut bytes = reply(req, ResponseCode::NoError).to_vec().unwrap();
            bytes.truncate(13);
            Reply::Raw(bytes)
        })
        .await;
        let good = FakeNameserver::answering([10, 0, 0, 5]).await;
        let r = resolver(&[broken.addr, good.addr], opts(1000, 5000));
        r.resolve(&name("example."), RecordType::A, DNSClass::IN).await.unwrap();
        assert_eq!(broken.hits(), 1);
        let stats = r.server_stats();
        assert_eq!(stats.iter().find(|(a, _)| *a == broken.addr).unwrap().1.failures, 1);
    }

    #[tokio::test]
    async fn malformed_response_is_retried_on_the_same_server() {
        let seen = AtomicUsize::new(0);
        let flaky = FakeNameserver::spawn(move |req, _| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                let mut bytes = reply(req, ResponseCode::NoError).to_vec().unwrap();
                bytes.truncate(13);
                return Reply::Raw(bytes);
            }
            let mut resp = reply(req, ResponseCode::NoError);
            resp.add_answer(a_record("example.", 300, [10, 0, 0, 5]));
            Reply::Message(resp)
        })
        .await;
        let r = resolver(&[flaky.addr], opts(1000, 5000));
        let answer = r.resolve(&name("example."), RecordType::A, DNSClass::IN).await.unwrap();
        assert_eq!(answer.records().len(), 1);
        assert_eq!(flaky.hits(), 2);
    }

    #[tokio::test]
    async fn truncated_udp_falls_back_to_tcp() {
        let server = FakeNameserver::spawn(|req, proto| {
            let mut resp = reply(req, ResponseCode::NoError);
            match proto {
                Proto::Udp => {
                    resp.set_truncated(true);
                }
                Proto::Tcp => {
                    resp.add_answer(a_record("example.", 300, [10, 0, 0, 6]));
                }
            }
            Reply::Message(resp)
        })
        .await;
        let r = resolver(&[server.addr], opts(1000, 5000));
        let answer = r.resolve(&name("example."), RecordType::A, DNSClass::IN).await.unwrap();
        assert_eq!(answer.records().len(), 1);
        assert_eq!(server.udp_hits(), 1);
        assert_eq!(server.tcp_hits(), 1);

        let no_fallback = resolver(
            &[server.addr],
            ResolverOpts {
                tcp_fallback: false,
                ..opts(1000, 5000)
            },
        );
        let err = no_fallback
            .resolve(&name("example."), RecordType::A, DNSClass::IN)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NoAnswer { .. }));
        assert_eq!(server.tcp_hits(), 1);
    }

    #[tokio::test]
    async fn per_call_timeout_override() {
        let silent = FakeNameserver::silent().await;
        let good = FakeNameserver::answering([10, 0, 0, 7]).await;
        let r = resolver(&[silent.addr, good.addr], opts(5000, 10_000));
        let options = ResolveOptions {
            timeout: Some(Duration::from_millis(100)),
            ..ResolveOptions::default()
        };
        let started = Instant::now();
        r.resolve_with(&name("example."), RecordType::A, DNSClass::IN, &options)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn per_call_tcp_override() {
        let server = FakeNameserver::answering([10, 0, 0, 7]).await;
        let r = resolver(&[server.addr], opts(1000, 5000));
        let options = ResolveOptions {
            tcp: Some(true),
            ..ResolveOptions::default()
        };
        r.resolve_with(&name("example."), RecordType::A, DNSClass::IN, &options)
            .await
            .unwrap();
        assert_eq!(server.tcp_hits(), 1);
        assert_eq!(server.udp_hits(), 0);
    }

    #[tokio::test]
    async fn relative_names_walk_the_search_list() {
        let server = FakeNameserver::spawn(|req, _| {
            let qname = req.queries()[0].name().clone();
            if qname == name("www.corp.example.") {
                let mut resp = reply(req, ResponseCode::NoError);
                resp.add_answer(a_record("www.corp.example.", 60, [10, 1, 1, 1]));
                Reply::Message(resp)
            } else {
                Reply::Message(reply(req, ResponseCode::NXDomain))
            }
        })
        .await;
        let mut config = ResolverConfig::from_nameservers(vec![server.addr]);
        config.search = vec![name("lab.example."), name("corp.example.")];
        let r = Resolver::new(config, opts(1000, 5000));

        let answer = r.resolve(&name("www"), RecordType::A, DNSClass::IN).await.unwrap();
        assert_eq!(answer.qname(), &name("www.corp.example."));
        assert_eq!(server.hits(), 2);

        let err = r.resolve(&name("db.x"), RecordType::A, DNSClass::IN).await.unwrap_err();
        match err {
            ResolveError::NxDomain { qnames } => assert_eq!(
                qnames,
                vec![name("db.x."), name("db.x.lab.example."), name("db.x.corp.example.")]
            ),
            other => panic!("expected NXDOMAIN, got {other:?}"),
        }
    }

    #[test]
    fn candidates_fall_back_to_domain_then_root() {
        let mut config = ResolverConfig::default();
        assert_eq!(candidate_names(&name("host"), &config).unwrap(), vec![name("host.")]);
        config.domain = Some(name("foo."));
        assert_eq!(candidate_names(&name("host"), &config).unwrap(), vec![name("host.foo.")]);
        assert_eq!(candidate_names(&name("a.b."), &config).unwrap(), vec![name("a.b.")]);
    }

    #[tokio::test]
    async fn injected_selector_is_used() {
        let server = FakeNameserver::answering([10, 0, 0, 8]).await;
        let selector = Arc::new(CountingSelector::default());
        let r = resolver(&[server.addr], opts(1000, 5000)).with_selector(selector.clone());
        r.resolve(&name("example."), RecordType::A, DNSClass::IN).await.unwrap();
        assert!(selector.waits.load(Ordering::SeqCst) >= 1);
        assert_eq!(r.selector().name(), "counting");
    }

    #[tokio::test]
    async fn selector_that_never_fires_ends_in_timeout() {
        let server = FakeNameserver::answering([10, 0, 0, 9]).await;
        let r = resolver(&[server.addr], opts(1000, 350)).with_selector(Arc::new(NeverReady));
        let err = r.resolve(&name("example."), RecordType::A, DNSClass::IN).await.unwrap_err();
        assert!(matches!(err, ResolveError::Timeout(_)), "{err:?}");
    }

    #[tokio::test]
    async fn config_swap_applies_to_next_resolution() {
        let old = FakeNameserver::answering([10, 0, 0, 1]).await;
        let new = FakeNameserver::answering([10, 0, 0, 2]).await;
        let r = resolver(&[old.addr], opts(1000, 5000));
        r.resolve(&name("example."), RecordType::A, DNSClass::IN).await.unwrap();
        r.set_config(ResolverConfig::from_nameservers(vec![new.addr]));
        r.resolve(&name("example."), RecordType::A, DNSClass::IN).await.unwrap();
        assert_eq!(old.hits(), 1);
        assert_eq!(new.hits(), 1);
        assert_eq!(r.config().nameservers, vec![new.addr]);
    }

    #[tokio::test]
    async fn concurrent_resolutions_share_the_cache() {
        let server = FakeNameserver::answering([10, 0, 0, 1]).await;
        let r = resolver(&[server.addr], opts(2000, 10_000)).with_cache(Arc::new(LruCache::new(64)));
        let names: Vec<Name> = (0..16).map(|i| name(&format!("host{i}.example."))).collect();

        let first = join_all(names.iter().map(|n| r.resolve(n, RecordType::A, DNSClass::IN))).await;
        assert!(first.iter().all(|res| res.is_ok()));
        let hits_after_first = server.hits();
        assert_eq!(hits_after_first, 16);

        let second = join_all(names.iter().map(|n| r.resolve(n, RecordType::A, DNSClass::IN))).await;
        assert!(second.iter().all(|res| res.is_ok()));
        assert_eq!(server.hits(), hits_after_first);
    }

    #[tokio::test]
    async fn metrics_snapshot_lists_servers() {
        let server = FakeNameserver::answering([10, 0, 0, 1]).await;
        let r = resolver(&[server.addr], opts(1000, 5000));
        r.resolve(&name("example."), RecordType::A, DNSClass::IN).await.unwrap();
        let snapshot = r.metrics_snapshot();
        assert!(snapshot.contains(&server.addr.to_string()));
        assert!(snapshot.contains("queries=1 responses=1"));
    }
}
