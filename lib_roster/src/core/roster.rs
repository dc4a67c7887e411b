//! # Proxy Roster Store
//!
//! Owns the session state of one front end: the normalized roster snapshot, the
//! delay map, the collapsible flags and the probe orchestrator. Everything is
//! reached through typed selectors and an `Action` dispatcher; there are no
//! process-wide singletons.
//!
//! Snapshots are handed out as `Arc`s. A fetch replaces the snapshot wholesale and
//! only the most recently issued fetch may do so.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures_util::future::join_all;

use crate::core::collapsible::{CollapsibleAction, CollapsibleDefaults, CollapsibleState};
use crate::core::connections::ConnectionCloser;
use crate::core::delay_map::{DelayMap, DelayRecord, DelaySnapshot};
use crate::core::latency::{BatchReport, LatencyOrchestrator, ProbeOutcome, ProbeScope, ProbeSettings, DEFAULT_TEST_URL};
use crate::error::{RosterError, RosterResult};
use crate::model::{ProvidersResponse, ProxyName, ProxyNode, ProxyProvider, RosterSnapshot};
use crate::pipeline::filter_sort::{apply_filter_state, FilterState};
use crate::retrieve::{ApiConfig, ControlApi, QueryRetry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    pub retry: QueryRetry,
    pub probe: ProbeSettings,
    pub test_url: String,
    pub collapsible: CollapsibleDefaults,
    /// Park the post-switch connection close until a front end confirms it.
    pub confirm_close_prev_conns: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            retry: QueryRetry::default(),
            probe: ProbeSettings::default(),
            test_url: DEFAULT_TEST_URL.to_string(),
            collapsible: CollapsibleDefaults::default(),
            confirm_close_prev_conns: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Adopted,
    /// A later fetch was issued before this one returned; its result was dropped.
    Superseded,
    /// No base URL configured, nothing was requested.
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchOutcome {
    pub previous: Option<ProxyName>,
    pub closed_connections: usize,
    /// The close was parked behind `show_modal_close_prev_conns`.
    pub awaiting_confirmation: bool,
}

struct PendingConnClose {
    api: Arc<ControlApi>,
    group: String,
    previous: ProxyName,
}

/// Everything a front end can ask the store to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    FetchProxies,
    SwitchProxy { group: String, member: ProxyName, auto_close_old_conns: bool },
    RequestDelayForGroup { group: String },
    RequestDelayForProxies { names: Vec<ProxyName> },
    HealthcheckProvider { name: String },
    HealthcheckAllProviders,
    UpdateProvider { name: String },
    UpdateAllProviders,
    ConfirmCloseConnections,
    DismissCloseConnections,
    Collapsible(CollapsibleAction),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Fetched(FetchOutcome),
    Switched(SwitchOutcome),
    Probed(ProbeOutcome),
    ProbedAll(Vec<(String, ProbeOutcome)>),
    ConnectionsClosed(usize),
    Dismissed,
    Collapsible(Option<bool>),
}

pub struct ProxyStore {
    settings: StoreSettings,
    snapshot: RwLock<Arc<RosterSnapshot>>,
    delays: Arc<DelayMap>,
    collapsible: CollapsibleState,
    latency: LatencyOrchestrator,
    fetch_seq: AtomicU64,
    loading: AtomicBool,
    last_error: RwLock<Option<String>>,
    client: Mutex<Option<(ApiConfig, Arc<ControlApi>)>>,
    pending_close: Mutex<Option<PendingConnClose>>,
}

impl ProxyStore {
    pub fn new(settings: StoreSettings) -> Self {
        let delays = Arc::new(DelayMap::new());
        Self {
            latency: LatencyOrchestrator::new(Arc::clone(&delays), settings.probe),
            collapsible: CollapsibleState::new(settings.collapsible),
            delays,
            snapshot: RwLock::new(Arc::new(RosterSnapshot::default())),
            fetch_seq: AtomicU64::new(0),
            loading: AtomicBool::new(false),
            last_error: RwLock::new(None),
            client: Mutex::new(None),
            pending_close: Mutex::new(None),
            settings,
        }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Client for `config`, rebuilt only when the config changes.
    fn api(&self, config: &ApiConfig) -> RosterResult<Arc<ControlApi>> {
        if !config.is_enabled() {
            return Err(RosterError::ConfigUnavailable);
        }
        let mut cached = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((seen, api)) = cached.as_ref() {
            if seen == config {
                return Ok(Arc::clone(api));
            }
        }
        let api = Arc::new(ControlApi::new(config, &self.settings.retry)?);
        *cached = Some((config.clone(), Arc::clone(&api)));
        Ok(api)
    }

    // ---------------------------------------------------------------------
    // Selectors
    // ---------------------------------------------------------------------

    pub fn get_proxies(&self) -> Arc<RosterSnapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn get_delay(&self) -> DelaySnapshot {
        self.delays.snapshot()
    }

    pub fn get_proxy_group_names(&self) -> Vec<ProxyName> {
        self.get_proxies().group_names.clone()
    }

    pub fn get_proxy_providers(&self) -> Vec<ProxyProvider> {
        self.get_proxies().providers.clone()
    }

    pub fn get_proxies_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    /// Message of the last failed fetch, cleared by the next adopted one.
    pub fn get_last_error(&self) -> Option<String> {
        self.last_error.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn delays(&self) -> &Arc<DelayMap> {
        &self.delays
    }

    pub fn collapsible(&self) -> &CollapsibleState {
        &self.collapsible
    }

    pub fn latency(&self) -> &LatencyOrchestrator {
        &self.latency
    }

    /// Members of `group` as the view should list them.
    pub fn group_view(&self, group: &str, filter: &FilterState) -> Option<Vec<ProxyName>> {
        let snapshot = self.get_proxies();
        let members = &snapshot.groups.get(group)?.all;
        Some(apply_filter_state(members, &self.get_delay(), filter, Some(&snapshot.proxies)))
    }

    /// Proxies of `provider` as the view should list them.
    pub fn provider_view(&self, provider: &str, filter: &FilterState) -> Option<Vec<ProxyName>> {
        let snapshot = self.get_proxies();
        let members = &snapshot.providers.iter().find(|p| p.name == provider)?.proxies;
        Some(apply_filter_state(members, &self.get_delay(), filter, Some(&snapshot.proxies)))
    }

    fn set_last_error(&self, error: Option<String>) {
        *self.last_error.write().unwrap_or_else(PoisonError::into_inner) = error;
    }

    fn provider_members(&self, name: &str) -> RosterResult<Vec<ProxyName>> {
        self.get_proxies()
            .providers
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.proxies.clone())
            .ok_or_else(|| RosterError::UnknownProvider(name.to_string()))
    }

    // ---------------------------------------------------------------------
    // Roster sync
    // ---------------------------------------------------------------------

    /// Fetches `/proxies` and `/providers/proxies` and adopts them if no later
    /// fetch was issued meanwhile.
    pub async fn fetch_proxies(&self, config: &ApiConfig) -> RosterResult<FetchOutcome> {
        if !config.is_enabled() {
            log::debug!("Control API not configured, skipping roster fetch");
            return Ok(FetchOutcome::Disabled);
        }
        let api = self.api(config)?;
        let ticket = self.fetch_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.loading.store(true, Ordering::SeqCst);

        let result = tokio::try_join!(api.get_proxies(), fetch_providers(&api));

        let mut current = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        if self.fetch_seq.load(Ordering::SeqCst) != ticket {
            log::debug!("Roster fetch #{} superseded, dropping its result", ticket);
            return Ok(FetchOutcome::Superseded);
        }

        match result {
            Ok((proxies, providers)) => {
                let next = RosterSnapshot::normalize(proxies, providers);
                self.delays.set_roster(next.names().cloned());
                log::info!(
                    "Adopted roster #{}: {} node(s), {} group(s), {} provider(s)",
                    ticket,
                    next.proxies.len(),
                    next.groups.len(),
                    next.providers.len()
                );
                *current = Arc::new(next);
                drop(current);
                self.set_last_error(None);
                self.loading.store(false, Ordering::SeqCst);
                Ok(FetchOutcome::Adopted)
            }
            Err(e) => {
                drop(current);
                log::error!("Roster fetch #{} failed: {}", ticket, e);
                self.set_last_error(Some(e.to_string()));
                self.loading.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    // ---------------------------------------------------------------------
    // Switching
    // ---------------------------------------------------------------------

    /// Makes `member` the active member of `group`.
    ///
    /// The snapshot changes only after the engine accepted the switch. With
    /// `auto_close_old_conns`, connections still routed through the previous
    /// member are closed, or parked for confirmation when the settings ask for it.
    pub async fn switch_proxy(
        &self,
        config: &ApiConfig,
        group: &str,
        member: &str,
        auto_close_old_conns: bool,
    ) -> RosterResult<SwitchOutcome> {
        let api = self.api(config)?;
        let previous = {
            let snapshot = self.get_proxies();
            let target = snapshot
                .groups
                .get(group)
                .ok_or_else(|| RosterError::UnknownGroup(group.to_string()))?;
            if !target.group_type.is_selectable() {
                return Err(RosterError::NotSelectable { group: group.to_string(), group_type: target.group_type });
            }
            if !target.all.iter().any(|m| m == member) {
                return Err(RosterError::UnknownMember { group: group.to_string(), member: member.to_string() });
            }
            target.now.clone()
        };

        if let Err(e) = api.switch_proxy(group, member).await {
            log::warn!("Switching '{}' to '{}' failed: {}", group, member, e);
            return Err(e);
        }
        self.apply_switch(group, member);
        log::info!("Switched '{}' to '{}'", group, member);

        let mut outcome = SwitchOutcome { previous: previous.clone(), closed_connections: 0, awaiting_confirmation: false };
        let Some(previous) = previous.filter(|p| auto_close_old_conns && p != member) else {
            return Ok(outcome);
        };

        if self.settings.confirm_close_prev_conns {
            *self.pending_close.lock().unwrap_or_else(PoisonError::into_inner) =
                Some(PendingConnClose { api, group: group.to_string(), previous });
            outcome.awaiting_confirmation = true;
        } else {
            outcome.closed_connections = close_previous(api.as_ref(), group, &previous).await;
        }
        Ok(outcome)
    }

    fn apply_switch(&self, group: &str, member: &str) {
        let mut guard = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        let snapshot = Arc::make_mut(&mut guard);
        match snapshot.groups.get_mut(group) {
            Some(g) if g.all.iter().any(|m| m == member) => g.now = Some(member.to_string()),
            // A newer roster dropped the group or the member; it is authoritative.
            _ => return,
        }
        if let Some(node) = snapshot.proxies.get_mut(group) {
            node.now = Some(member.to_string());
        }
    }

    /// Whether a connection close is waiting for the user.
    pub fn show_modal_close_prev_conns(&self) -> bool {
        self.pending_close.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Runs the parked close, if any. Returns how many connections were closed.
    pub async fn confirm_close_prev_conns(&self) -> usize {
        let pending = self.pending_close.lock().unwrap_or_else(PoisonError::into_inner).take();
        match pending {
            Some(p) => close_previous(p.api.as_ref(), &p.group, &p.previous).await,
            None => 0,
        }
    }

    pub fn dismiss_close_prev_conns(&self) {
        if let Some(p) = self.pending_close.lock().unwrap_or_else(PoisonError::into_inner).take() {
            log::debug!("Kept connections through '{}' -> '{}'", p.group, p.previous);
        }
    }

    // ---------------------------------------------------------------------
    // Probes
    // ---------------------------------------------------------------------

    /// Probes every member of `group`.
    pub async fn request_delay_for_group(&self, config: &ApiConfig, group: &str) -> RosterResult<ProbeOutcome> {
        let api = self.api(config)?;
        let members = self
            .get_proxies()
            .groups
            .get(group)
            .map(|g| g.all.clone())
            .ok_or_else(|| RosterError::UnknownGroup(group.to_string()))?;
        let scope = ProbeScope::group(group, members);
        Ok(self.latency.test_latency(&scope, &self.settings.test_url, api.as_ref()).await)
    }

    /// Probes an ad hoc list; names missing from the roster are ignored.
    pub async fn request_delay_for_proxies(&self, config: &ApiConfig, names: Vec<ProxyName>) -> RosterResult<ProbeOutcome> {
        let api = self.api(config)?;
        let snapshot = self.get_proxies();
        let (known, unknown): (Vec<ProxyName>, Vec<ProxyName>) = names.into_iter().partition(|n| snapshot.contains(n));
        if !unknown.is_empty() {
            log::debug!("Ignoring {} name(s) not in the roster: {:?}", unknown.len(), unknown);
        }
        if known.is_empty() {
            return Ok(ProbeOutcome::Completed { ok: 0, failed: 0 });
        }
        let scope = ProbeScope::proxies(known);
        Ok(self.latency.test_latency(&scope, &self.settings.test_url, api.as_ref()).await)
    }

    /// Asks the engine to health-check provider `name`, then reads each proxy's
    /// latest history entry from the provider listing fetched right after it.
    ///
    /// Results come from that listing, not from the shared snapshot: the roster
    /// refetch that follows may lose to a later fetch and adopt nothing.
    pub async fn healthcheck_provider_by_name(&self, config: &ApiConfig, name: &str) -> RosterResult<ProbeOutcome> {
        let api = self.api(config)?;
        let scope = ProbeScope::provider(name, self.provider_members(name)?);

        let outcome = self
            .latency
            .run_scope(&scope, |members| async move {
                if let Err(e) = api.healthcheck_provider(name).await {
                    return BatchReport::failed(e.to_string());
                }
                let checked = match fetch_providers(&api).await {
                    Ok(checked) => checked,
                    Err(e) => return BatchReport::failed(e.to_string()),
                };
                let nodes = checked.providers.get(name).map(|p| p.proxies.as_slice()).unwrap_or_default();
                let settled = members
                    .into_iter()
                    .map(|m| {
                        let last = nodes.iter().find(|n| n.name == m).and_then(ProxyNode::last_delay);
                        (m, health_record(last))
                    })
                    .collect();

                match self.fetch_proxies(config).await {
                    Ok(FetchOutcome::Superseded) => log::debug!("Roster refresh after checking '{}' was superseded", name),
                    Ok(_) => {}
                    Err(e) => log::warn!("Roster refresh after checking '{}' failed: {}", name, e),
                }
                BatchReport { settled, failure: None }
            })
            .await;
        Ok(outcome)
    }

    /// Health-checks every provider concurrently.
    pub async fn healthcheck_all_providers(&self, config: &ApiConfig) -> RosterResult<Vec<(String, ProbeOutcome)>> {
        self.api(config)?;
        let names: Vec<String> = self.get_proxies().providers.iter().map(|p| p.name.clone()).collect();
        let runs = names.iter().map(|n| self.healthcheck_provider_by_name(config, n));
        let results = join_all(runs).await;

        let mut outcomes = Vec::with_capacity(names.len());
        for (name, result) in names.into_iter().zip(results) {
            outcomes.push((name, result?));
        }
        Ok(outcomes)
    }

    // ---------------------------------------------------------------------
    // Providers
    // ---------------------------------------------------------------------

    /// Has the engine re-pull provider `name`, then refetches the roster.
    pub async fn update_provider_by_name(&self, config: &ApiConfig, name: &str) -> RosterResult<FetchOutcome> {
        let api = self.api(config)?;
        self.provider_members(name)?;
        api.update_provider(name).await?;
        log::info!("Provider '{}' updated", name);
        self.fetch_proxies(config).await
    }

    /// Updates every provider, then refetches once. The first provider error is
    /// returned after the refetch.
    pub async fn update_all_providers(&self, config: &ApiConfig) -> RosterResult<FetchOutcome> {
        let api = self.api(config)?;
        let names: Vec<String> = self.get_proxies().providers.iter().map(|p| p.name.clone()).collect();
        let results = join_all(names.iter().map(|n| api.update_provider(n))).await;

        let mut first_error = None;
        for (name, result) in names.iter().zip(results) {
            if let Err(e) = result {
                log::warn!("Updating provider '{}' failed: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
        let fetched = self.fetch_proxies(config).await?;
        match first_error {
            Some(e) => Err(e),
            None => Ok(fetched),
        }
    }

    // ---------------------------------------------------------------------
    // Dispatch
    // ---------------------------------------------------------------------

    pub async fn dispatch(&self, config: &ApiConfig, action: Action) -> RosterResult<ActionOutcome> {
        log::debug!("Dispatching {:?}", action);
        Ok(match action {
            Action::FetchProxies => ActionOutcome::Fetched(self.fetch_proxies(config).await?),
            Action::SwitchProxy { group, member, auto_close_old_conns } => {
                ActionOutcome::Switched(self.switch_proxy(config, &group, &member, auto_close_old_conns).await?)
            }
            Action::RequestDelayForGroup { group } => ActionOutcome::Probed(self.request_delay_for_group(config, &group).await?),
            Action::RequestDelayForProxies { names } => {
                ActionOutcome::Probed(self.request_delay_for_proxies(config, names).await?)
            }
            Action::HealthcheckProvider { name } => {
                ActionOutcome::Probed(self.healthcheck_provider_by_name(config, &name).await?)
            }
            Action::HealthcheckAllProviders => ActionOutcome::ProbedAll(self.healthcheck_all_providers(config).await?),
            Action::UpdateProvider { name } => ActionOutcome::Fetched(self.update_provider_by_name(config, &name).await?),
            Action::UpdateAllProviders => ActionOutcome::Fetched(self.update_all_providers(config).await?),
            Action::ConfirmCloseConnections => ActionOutcome::ConnectionsClosed(self.confirm_close_prev_conns().await),
            Action::DismissCloseConnections => {
                self.dismiss_close_prev_conns();
                ActionOutcome::Dismissed
            }
            Action::Collapsible(action) => ActionOutcome::Collapsible(self.collapsible.apply(action)),
        })
    }
}

/// `/providers/proxies` is optional on some engines; a 404 means no providers.
async fn fetch_providers(api: &ControlApi) -> RosterResult<ProvidersResponse> {
    match api.get_providers().await {
        Err(RosterError::Http { status: 404, .. }) => Ok(ProvidersResponse::default()),
        other => other,
    }
}

/// Maps the engine's last recorded delay after a provider health check.
fn health_record(last_delay: Option<u32>) -> DelayRecord {
    match last_delay {
        Some(0) => DelayRecord::Error("unreachable".to_string()),
        Some(ms) => DelayRecord::Result(ms),
        None => DelayRecord::Error("no health check result".to_string()),
    }
}

async fn close_previous<C: ConnectionCloser + Sync>(closer: &C, group: &str, previous: &str) -> usize {
    match closer.close_connections_via(group, previous).await {
        Ok(closed) => closed,
        Err(e) => {
            log::warn!("Closing connections through '{}' -> '{}' failed: {}", group, previous, e);
            0
        }
    }
}
