//! # Collapsible-Open State
//!
//! Expand/collapse flags for groups and providers, keyed `"<category>:<name>"`.
//! Unset keys fall back to a per-category default from configuration. Updates
//! follow the same copy-on-write discipline as the delay map.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CollapsibleCategory {
    ProxyGroup,
    ProxyProvider,
}

impl fmt::Display for CollapsibleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollapsibleCategory::ProxyGroup => f.write_str("proxyGroup"),
            CollapsibleCategory::ProxyProvider => f.write_str("proxyProvider"),
        }
    }
}

/// Openness of an entity nobody has toggled yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollapsibleDefaults {
    pub proxy_group: bool,
    pub proxy_provider: bool,
}

impl Default for CollapsibleDefaults {
    /// Groups start expanded, providers collapsed.
    fn default() -> Self {
        Self { proxy_group: true, proxy_provider: false }
    }
}

impl CollapsibleDefaults {
    pub fn for_category(&self, category: CollapsibleCategory) -> bool {
        match category {
            CollapsibleCategory::ProxyGroup => self.proxy_group,
            CollapsibleCategory::ProxyProvider => self.proxy_provider,
        }
    }
}

pub fn collapsible_key(category: CollapsibleCategory, name: &str) -> String {
    format!("{}:{}", category, name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollapsibleAction {
    Toggle { category: CollapsibleCategory, name: String },
    Set { category: CollapsibleCategory, name: String, open: bool },
    /// Expand all / collapse all over `names`.
    SetAll { category: CollapsibleCategory, names: Vec<String>, open: bool },
}

pub struct CollapsibleState {
    defaults: CollapsibleDefaults,
    flags: RwLock<Arc<HashMap<String, bool>>>,
}

impl CollapsibleState {
    pub fn new(defaults: CollapsibleDefaults) -> Self {
        Self { defaults, flags: RwLock::new(Arc::new(HashMap::new())) }
    }

    pub fn is_open(&self, category: CollapsibleCategory, name: &str) -> bool {
        self.snapshot()
            .get(&collapsible_key(category, name))
            .copied()
            .unwrap_or_else(|| self.defaults.for_category(category))
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, bool>> {
        Arc::clone(&self.flags.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Applies `action` and returns the new state of the last key it touched.
    pub fn apply(&self, action: CollapsibleAction) -> Option<bool> {
        let mut guard = self.flags.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = HashMap::clone(&guard);
        let last = match action {
            CollapsibleAction::Toggle { category, name } => {
                let key = collapsible_key(category, &name);
                let open = !next.get(&key).copied().unwrap_or_else(|| self.defaults.for_category(category));
                next.insert(key, open);
                Some(open)
            }
            CollapsibleAction::Set { category, name, open } => {
                next.insert(collapsible_key(category, &name), open);
                Some(open)
            }
            CollapsibleAction::SetAll { category, names, open } => {
                let touched = !names.is_empty();
                for name in names {
                    next.insert(collapsible_key(category, &name), open);
                }
                touched.then_some(open)
            }
        };
        *guard = Arc::new(next);
        last
    }

    pub fn toggle(&self, category: CollapsibleCategory, name: &str) -> bool {
        self.apply(CollapsibleAction::Toggle { category, name: name.to_string() })
            .unwrap_or_else(|| self.defaults.for_category(category))
    }

    pub fn set_all(&self, category: CollapsibleCategory, names: &[String], open: bool) {
        self.apply(CollapsibleAction::SetAll { category, names: names.to_vec(), open });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_category_prefixed() {
        assert_eq!(collapsible_key(CollapsibleCategory::ProxyGroup, "Proxy"), "proxyGroup:Proxy");
        assert_eq!(collapsible_key(CollapsibleCategory::ProxyProvider, "sub"), "proxyProvider:sub");
    }

    #[test]
    fn defaults_come_from_configuration() {
        let state = CollapsibleState::new(CollapsibleDefaults { proxy_group: false, proxy_provider: true });
        assert!(!state.is_open(CollapsibleCategory::ProxyGroup, "Proxy"));
        assert!(state.is_open(CollapsibleCategory::ProxyProvider, "sub"));
    }

    #[test]
    fn toggle_flips_from_default() {
        let state = CollapsibleState::new(CollapsibleDefaults::default());
        assert!(!state.toggle(CollapsibleCategory::ProxyGroup, "Proxy"));
        assert!(state.toggle(CollapsibleCategory::ProxyGroup, "Proxy"));
        assert!(state.toggle(CollapsibleCategory::ProxyProvider, "sub"));
    }

    #[test]
    fn set_all_only_touches_named_keys_of_category() {
        let state = CollapsibleState::new(CollapsibleDefaults::default());
        state.toggle(CollapsibleCategory::ProxyProvider, "sub");
        let groups = vec!["A".to_string(), "B".to_string()];

        state.set_all(CollapsibleCategory::ProxyGroup, &groups, false);

        assert!(!state.is_open(CollapsibleCategory::ProxyGroup, "A"));
        assert!(!state.is_open(CollapsibleCategory::ProxyGroup, "B"));
        assert!(state.is_open(CollapsibleCategory::ProxyGroup, "C"));
        assert!(state.is_open(CollapsibleCategory::ProxyProvider, "sub"));
    }
}
