//! # Latency Probe Orchestrator
//!
//! Runs latency probes for a scope (the members of one group, one provider's
//! proxies, or an ad hoc list) and records the outcome per proxy in the shared
//! `DelayMap`.
//!
//! ## Contract
//! 1. Every member is marked `Testing` before anything goes on the wire.
//! 2. One run per scope key at a time; a concurrent call for the same key returns
//!    `ProbeOutcome::Skipped` without touching the network.
//! 3. Each member settles to `Result(ms)` or `Error(message)`.
//! 4. A batch-level failure is logged and swallowed. Members keep `Testing` if the
//!    batch attributed nothing, otherwise the unattributed ones become `Error`.
//! 5. The scope key is released on every exit path, panics included.
//!
//! Outbound probe requests are additionally bounded process-wide by a semaphore,
//! so expanding many groups at once cannot fan out without limit.

use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::FutureExt;
use tokio::sync::Semaphore;

use crate::core::delay_map::{DelayMap, DelayRecord};
use crate::core::single_flight::SingleFlight;
use crate::model::ProxyName;
use crate::retrieve::ControlApi;

/// Default URL probed through each proxy.
pub const DEFAULT_TEST_URL: &str = "http://www.gstatic.com/generate_204";

/// Something that can measure one proxy. Failures are part of the answer.
pub trait ProbeTransport {
    fn probe(&self, name: &str, test_url: &str, timeout: Duration) -> impl Future<Output = DelayRecord> + Send;
}

impl ProbeTransport for ControlApi {
    async fn probe(&self, name: &str, test_url: &str, timeout: Duration) -> DelayRecord {
        match self.proxy_delay(name, test_url, timeout).await {
            Ok(res) if res.success => match res.data {
                Some(body) => DelayRecord::Result(body.delay),
                None => DelayRecord::Error("empty delay response".to_string()),
            },
            Ok(res) => DelayRecord::Error(res.error_message.unwrap_or_else(|| format!("HTTP {}", res.status))),
            Err(e) => DelayRecord::Error(e.to_string()),
        }
    }
}

/// The unit single-flight is enforced on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeScope {
    pub key: String,
    pub members: Vec<ProxyName>,
}

impl ProbeScope {
    pub fn group(name: &str, members: Vec<ProxyName>) -> Self {
        Self { key: format!("proxyGroup:{}", name), members }
    }

    pub fn provider(name: &str, members: Vec<ProxyName>) -> Self {
        Self { key: format!("proxyProvider:{}", name), members }
    }

    /// Ad hoc list; two calls with the same list share a key.
    pub fn proxies(members: Vec<ProxyName>) -> Self {
        Self { key: format!("proxies:{}", members.join("\u{1f}")), members }
    }
}

/// What a batch managed to attribute, plus a batch-level failure if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub settled: Vec<(ProxyName, DelayRecord)>,
    pub failure: Option<String>,
}

impl BatchReport {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self { settled: Vec::new(), failure: Some(reason.into()) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Another run for the same scope was in flight.
    Skipped,
    Completed { ok: usize, failed: usize },
    /// The batch failed as a whole; `attributed` members still got a record.
    Aborted { attributed: usize, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    /// Engine-side timeout sent with each probe.
    pub timeout: Duration,
    /// Upper bound on outbound probe requests across all scopes.
    pub max_concurrent: usize,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self { timeout: Duration::from_millis(5_000), max_concurrent: 16 }
    }
}

pub struct LatencyOrchestrator {
    delays: Arc<DelayMap>,
    flights: SingleFlight,
    permits: Arc<Semaphore>,
    settings: ProbeSettings,
}

impl LatencyOrchestrator {
    pub fn new(delays: Arc<DelayMap>, settings: ProbeSettings) -> Self {
        Self {
            delays,
            flights: SingleFlight::new(),
            permits: Arc::new(Semaphore::new(settings.max_concurrent.max(1))),
            settings,
        }
    }

    pub fn is_in_flight(&self, scope_key: &str) -> bool {
        self.flights.is_in_flight(scope_key)
    }

    /// Stops handing out probe permits; queued probes of running batches fail the batch.
    pub fn shutdown(&self) {
        self.permits.close();
    }

    /// Probes every member of `scope` through `transport`.
    pub async fn test_latency<T>(&self, scope: &ProbeScope, test_url: &str, transport: &T) -> ProbeOutcome
    where
        T: ProbeTransport + Sync,
    {
        let timeout = self.settings.timeout;
        let permits = Arc::clone(&self.permits);
        self.run_scope(scope, |members| async move {
            let probes = members.into_iter().map(|name| {
                let permits = Arc::clone(&permits);
                async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return (name, None);
                    };
                    let record = transport.probe(&name, test_url, timeout).await;
                    (name, Some(record))
                }
            });

            let mut report = BatchReport::default();
            for (name, record) in join_all(probes).await {
                match record {
                    Some(record) => report.settled.push((name, record)),
                    None => report.failure = Some("probe pool shut down".to_string()),
                }
            }
            report
        })
        .await
    }

    /// Single-flight wrapper around an arbitrary batch for `scope`.
    ///
    /// `batch` receives the member list after every member has been marked
    /// `Testing`. A panic inside `batch` is caught and treated as a batch failure.
    pub async fn run_scope<F, Fut>(&self, scope: &ProbeScope, batch: F) -> ProbeOutcome
    where
        F: FnOnce(Vec<ProxyName>) -> Fut,
        Fut: Future<Output = BatchReport>,
    {
        let Some(_guard) = self.flights.try_acquire(&scope.key) else {
            log::debug!("Probe for '{}' already in flight, skipping", scope.key);
            return ProbeOutcome::Skipped;
        };

        self.delays.mark_testing(&scope.members);
        log::debug!("Probing {} member(s) of '{}'", scope.members.len(), scope.key);

        let report = match AssertUnwindSafe(batch(scope.members.clone())).catch_unwind().await {
            Ok(report) => report,
            Err(_) => BatchReport::failed("probe batch panicked"),
        };

        self.finish(scope, report)
    }

    fn finish(&self, scope: &ProbeScope, report: BatchReport) -> ProbeOutcome {
        let BatchReport { mut settled, failure } = report;
        let attributed = settled.len();

        match failure {
            None => {
                let failed = settled.iter().filter(|(_, r)| r.is_error()).count();
                self.delays.settle(settled);
                log::info!("Probe '{}' finished: {} ok, {} failed", scope.key, attributed - failed, failed);
                ProbeOutcome::Completed { ok: attributed - failed, failed }
            }
            Some(reason) => {
                log::warn!("Probe '{}' failed after {} result(s): {}", scope.key, attributed, reason);
                if attributed > 0 {
                    let seen: HashSet<&ProxyName> = settled.iter().map(|(n, _)| n).collect();
                    let missing: Vec<ProxyName> = scope
                        .members
                        .iter()
                        .filter(|m| !seen.contains(m))
                        .cloned()
                        .collect();
                    settled.extend(missing.into_iter().map(|m| (m, DelayRecord::Error(reason.clone()))));
                    self.delays.settle(settled);
                }
                ProbeOutcome::Aborted { attributed, reason }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeTransport {
        calls: AtomicUsize,
        active: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
        answers: HashMap<String, DelayRecord>,
    }

    impl FakeTransport {
        fn new(delay_ms: u64, answers: &[(&str, DelayRecord)]) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay: Duration::from_millis(delay_ms),
                answers: answers.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            }
        }
    }

    impl ProbeTransport for FakeTransport {
        async fn probe(&self, name: &str, _test_url: &str, _timeout: Duration) -> DelayRecord {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.answers.get(name).cloned().unwrap_or(DelayRecord::Result(100))
        }
    }

    fn setup(max_concurrent: usize) -> (Arc<DelayMap>, LatencyOrchestrator) {
        let delays = Arc::new(DelayMap::new());
        delays.set_roster(["A", "B", "C"].map(String::from));
        let settings = ProbeSettings { max_concurrent, ..ProbeSettings::default() };
        (Arc::clone(&delays), LatencyOrchestrator::new(delays, settings))
    }

    fn members(list: &[&str]) -> Vec<ProxyName> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_calls_on_same_scope_make_one_batch() {
        let (delays, orch) = setup(16);
        let transport = FakeTransport::new(50, &[]);
        let scope = ProbeScope::group("Proxy", members(&["A", "B"]));

        let (first, second) = tokio::join!(
            orch.test_latency(&scope, DEFAULT_TEST_URL, &transport),
            orch.test_latency(&scope, DEFAULT_TEST_URL, &transport),
        );

        assert_eq!(first, ProbeOutcome::Completed { ok: 2, failed: 0 });
        assert_eq!(second, ProbeOutcome::Skipped);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        assert!(!orch.is_in_flight(&scope.key));
        assert_eq!(delays.get("A"), DelayRecord::Result(100));
    }

    #[tokio::test(start_paused = true)]
    async fn members_read_testing_while_probe_runs() {
        let (delays, orch) = setup(16);
        let transport = FakeTransport::new(1_000, &[]);
        let scope = ProbeScope::group("Proxy", members(&["A"]));

        let probe = orch.test_latency(&scope, DEFAULT_TEST_URL, &transport);
        let observe = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            (delays.get("A"), orch.is_in_flight(&scope.key))
        };
        let (_, (seen, in_flight)) = tokio::join!(probe, observe);

        assert_eq!(seen, DelayRecord::Testing);
        assert!(in_flight);
        assert_eq!(delays.get("A"), DelayRecord::Result(100));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_members_get_error_others_result() {
        let (delays, orch) = setup(16);
        let transport = FakeTransport::new(5, &[("B", DelayRecord::Error("Timeout".into()))]);
        let scope = ProbeScope::proxies(members(&["A", "B"]));

        let outcome = orch.test_latency(&scope, DEFAULT_TEST_URL, &transport).await;

        assert_eq!(outcome, ProbeOutcome::Completed { ok: 1, failed: 1 });
        assert_eq!(delays.get("A"), DelayRecord::Result(100));
        assert_eq!(delays.get("B"), DelayRecord::Error("Timeout".into()));
    }

    #[tokio::test]
    async fn total_failure_without_results_leaves_testing_and_clears_guard() {
        let (delays, orch) = setup(16);
        let scope = ProbeScope::provider("sub", members(&["A", "B"]));

        let outcome = orch.run_scope(&scope, |_| async { BatchReport::failed("connection refused") }).await;

        assert_eq!(outcome, ProbeOutcome::Aborted { attributed: 0, reason: "connection refused".into() });
        assert_eq!(delays.get("A"), DelayRecord::Testing);
        assert_eq!(delays.get("B"), DelayRecord::Testing);
        assert!(!orch.is_in_flight(&scope.key));
    }

    #[tokio::test]
    async fn total_failure_after_partial_results_falls_back_to_error() {
        let (delays, orch) = setup(16);
        let scope = ProbeScope::provider("sub", members(&["A", "B"]));

        let outcome = orch
            .run_scope(&scope, |_| async {
                BatchReport {
                    settled: vec![("A".to_string(), DelayRecord::Result(30))],
                    failure: Some("stream reset".into()),
                }
            })
            .await;

        assert_eq!(outcome, ProbeOutcome::Aborted { attributed: 1, reason: "stream reset".into() });
        assert_eq!(delays.get("A"), DelayRecord::Result(30));
        assert_eq!(delays.get("B"), DelayRecord::Error("stream reset".into()));
    }

    #[tokio::test]
    async fn panicking_batch_is_contained() {
        let (_delays, orch) = setup(16);
        let scope = ProbeScope::group("Proxy", members(&["A"]));

        let outcome = orch
            .run_scope(&scope, |_| async {
                if true {
                    panic!("transport bug");
                }
                BatchReport::default()
            })
            .await;

        assert!(matches!(outcome, ProbeOutcome::Aborted { attributed: 0, .. }));
        assert!(!orch.is_in_flight(&scope.key));
    }

    #[tokio::test(start_paused = true)]
    async fn outbound_probes_are_capped_across_scopes() {
        let (_delays, orch) = setup(2);
        let transport = FakeTransport::new(20, &[]);
        let g1 = ProbeScope::group("G1", members(&["A", "B", "C"]));
        let g2 = ProbeScope::group("G2", members(&["A", "B", "C"]));

        let (a, b) = tokio::join!(
            orch.test_latency(&g1, DEFAULT_TEST_URL, &transport),
            orch.test_latency(&g2, DEFAULT_TEST_URL, &transport),
        );

        assert!(matches!(a, ProbeOutcome::Completed { ok: 3, .. }));
        assert!(matches!(b, ProbeOutcome::Completed { ok: 3, .. }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 6);
        assert!(transport.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn shutdown_pool_aborts_without_attribution() {
        let (delays, orch) = setup(4);
        orch.shutdown();
        let transport = FakeTransport::new(0, &[]);
        let scope = ProbeScope::group("Proxy", members(&["A"]));

        let outcome = orch.test_latency(&scope, DEFAULT_TEST_URL, &transport).await;

        assert!(matches!(outcome, ProbeOutcome::Aborted { attributed: 0, .. }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert_eq!(delays.get("A"), DelayRecord::Testing);
    }
}
