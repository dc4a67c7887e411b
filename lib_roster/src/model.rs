//! # Roster Data Model
//!
//! Wire shapes returned by the control API and the normalized snapshot the store
//! keeps in memory. Wire structs mirror the JSON exactly (`camelCase`, `type`),
//! normalized structs are what selectors hand out to collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Name of a proxy node or group, unique within one roster snapshot.
pub type ProxyName = String;

/// Name of the built-in group that lists every other group in display order.
pub const GLOBAL_GROUP: &str = "GLOBAL";

/// One entry of a node's latency history as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayHistory {
    #[serde(default)]
    pub time: String,
    /// Milliseconds. The engine reports `0` when the last check failed.
    pub delay: u32,
}

/// A proxy node exactly as `/proxies` and `/providers/proxies` return it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyNode {
    pub name: ProxyName,
    #[serde(rename = "type")]
    pub kind: String,
    /// Ordered members, present only for group-type nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all: Option<Vec<ProxyName>>,
    /// Currently active member, present only for selectable groups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub now: Option<ProxyName>,
    #[serde(default)]
    pub udp: bool,
    #[serde(default)]
    pub history: Vec<DelayHistory>,
}

impl ProxyNode {
    /// Group policy of this node, `None` for plain proxies.
    pub fn group_type(&self) -> Option<GroupType> {
        self.kind.parse().ok()
    }

    /// The most recent delay the engine recorded for this node.
    pub fn last_delay(&self) -> Option<u32> {
        self.history.last().map(|h| h.delay)
    }
}

/// Policy types that make a node a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupType {
    Selector,
    URLTest,
    Fallback,
    LoadBalance,
    Relay,
}

impl GroupType {
    /// Only `Selector` groups accept a manual switch.
    pub fn is_selectable(self) -> bool {
        matches!(self, GroupType::Selector)
    }
}

impl FromStr for GroupType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Selector" => Ok(GroupType::Selector),
            "URLTest" => Ok(GroupType::URLTest),
            "Fallback" => Ok(GroupType::Fallback),
            "LoadBalance" => Ok(GroupType::LoadBalance),
            "Relay" => Ok(GroupType::Relay),
            _ => Err(()),
        }
    }
}

impl fmt::Display for GroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GroupType::Selector => "Selector",
            GroupType::URLTest => "URLTest",
            GroupType::Fallback => "Fallback",
            GroupType::LoadBalance => "LoadBalance",
            GroupType::Relay => "Relay",
        };
        f.write_str(s)
    }
}

/// How a provider obtains its proxy list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VehicleType {
    HTTP,
    File,
    Compatible,
}

/// `GET /proxies` body.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxiesResponse {
    pub proxies: BTreeMap<ProxyName, ProxyNode>,
}

/// A provider exactly as `/providers/proxies` returns it; proxies are full nodes.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderWire {
    pub name: String,
    pub vehicle_type: VehicleType,
    #[serde(default)]
    pub proxies: Vec<ProxyNode>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// `GET /providers/proxies` body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidersResponse {
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderWire>,
}

/// `GET /proxies/{name}/delay` success body.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DelayResponse {
    pub delay: u32,
}

/// Error body the engine attaches to non-2xx answers.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

/// `PUT /proxies/{group}` body.
#[derive(Debug, Clone, Serialize)]
pub struct SwitchRequest<'a> {
    pub name: &'a str,
}

/// One live connection from `GET /connections`.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionWire {
    pub id: String,
    #[serde(default)]
    pub chains: Vec<ProxyName>,
}

/// `GET /connections` body.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionsResponse {
    #[serde(default)]
    pub connections: Option<Vec<ConnectionWire>>,
}

/// A normalized proxy group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyGroup {
    pub name: ProxyName,
    pub group_type: GroupType,
    pub all: Vec<ProxyName>,
    pub now: Option<ProxyName>,
}

/// A normalized proxy provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyProvider {
    pub name: String,
    pub vehicle_type: VehicleType,
    pub proxies: Vec<ProxyName>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// The whole roster as adopted from one successful fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterSnapshot {
    /// Every node, groups included, keyed by name.
    pub proxies: HashMap<ProxyName, ProxyNode>,
    pub groups: HashMap<ProxyName, ProxyGroup>,
    /// Group names in display order.
    pub group_names: Vec<ProxyName>,
    /// Providers in name order, `Compatible` ones excluded.
    pub providers: Vec<ProxyProvider>,
}

impl RosterSnapshot {
    /// Builds a snapshot from the two roster responses.
    ///
    /// Provider nodes are merged into the node map (a provider node never overrides
    /// a node of the same name from `/proxies`). A group `now` that is not one of
    /// its members is dropped.
    pub fn normalize(proxies: ProxiesResponse, providers: ProvidersResponse) -> Self {
        let mut nodes: HashMap<ProxyName, ProxyNode> = proxies.proxies.into_iter().collect();

        let mut provider_list = Vec::new();
        for (_, provider) in providers.providers {
            let names: Vec<ProxyName> = provider.proxies.iter().map(|p| p.name.clone()).collect();
            for node in provider.proxies {
                nodes.entry(node.name.clone()).or_insert(node);
            }
            if provider.vehicle_type == VehicleType::Compatible {
                continue;
            }
            provider_list.push(ProxyProvider {
                name: provider.name,
                vehicle_type: provider.vehicle_type,
                proxies: names,
                updated_at: provider.updated_at,
            });
        }

        let mut groups = HashMap::new();
        for node in nodes.values() {
            let Some(group_type) = node.group_type() else { continue };
            let all = match &node.all {
                Some(all) if !all.is_empty() => all.clone(),
                _ => {
                    log::warn!("Group '{}' has no members, skipping", node.name);
                    continue;
                }
            };
            let now = match &node.now {
                Some(now) if all.contains(now) => Some(now.clone()),
                Some(now) => {
                    log::warn!("Group '{}' reports now='{}' which is not a member, dropping", node.name, now);
                    None
                }
                None => None,
            };
            groups.insert(
                node.name.clone(),
                ProxyGroup { name: node.name.clone(), group_type, all, now },
            );
        }

        let group_names = order_group_names(&groups);

        Self { proxies: nodes, groups, group_names, providers: provider_list }
    }

    /// Every name a delay record may be kept for.
    pub fn names(&self) -> impl Iterator<Item = &ProxyName> {
        self.proxies.keys()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.proxies.contains_key(name)
    }
}

/// Groups listed by `GLOBAL`'s member order, `GLOBAL` last, leftovers by name.
fn order_group_names(groups: &HashMap<ProxyName, ProxyGroup>) -> Vec<ProxyName> {
    let mut ordered: Vec<ProxyName> = Vec::with_capacity(groups.len());
    if let Some(global) = groups.get(GLOBAL_GROUP) {
        for member in &global.all {
            if member != GLOBAL_GROUP && groups.contains_key(member) && !ordered.contains(member) {
                ordered.push(member.clone());
            }
        }
    }
    let mut rest: Vec<&ProxyName> = groups
        .keys()
        .filter(|name| name.as_str() != GLOBAL_GROUP && !ordered.contains(*name))
        .collect();
    rest.sort();
    ordered.extend(rest.into_iter().cloned());
    if groups.contains_key(GLOBAL_GROUP) {
        ordered.push(GLOBAL_GROUP.to_string());
    }
    ordered
}
