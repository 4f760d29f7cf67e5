//! Local cache of rules and subscriber memberships.
use std::{
    collections::{BTreeSet, HashMap},
    sync::RwLock,
};

use serde::{Deserialize, Serialize};

/// Version reported by an empty cache.
pub const EMPTY_VERSION: i64 = -1;

/// Lifecycle status of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RuleStatus {
    /// Removed from the rule set.
    #[serde(rename = "ARCHIVED")]
    Archived,
    /// Evaluated normally. Unknown statuses fall back to this one.
    #[default]
    #[serde(rename = "ACTIVE", other)]
    Active,
}

/// A feature flag definition.
///
/// Only the fields the synchronizer needs are typed. Everything the evaluator consumes is kept
/// verbatim in `definition`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Flag name, unique in the rule set.
    pub name: String,
    /// Version of this definition.
    pub change_number: i64,
    /// Serve `default_treatment` to everyone.
    #[serde(default)]
    pub killed: bool,
    /// Treatment served when killed or when no condition matches.
    #[serde(default)]
    pub default_treatment: String,
    /// Whether the rule is still part of the set.
    #[serde(default)]
    pub status: RuleStatus,
    /// Every other field, untouched.
    #[serde(flatten)]
    pub definition: serde_json::Map<String, serde_json::Value>,
}

/// A batch of rule changes taking the cache from `since` to `till`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulesDelta {
    /// Changed rules. Archived ones are removed from the cache.
    #[serde(rename = "splits", default)]
    pub rules: Vec<Rule>,
    /// Version the delta applies on top of.
    pub since: i64,
    /// Version the cache holds once the delta is applied.
    pub till: i64,
}

/// Per-subscriber membership domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentDomain {
    /// Regular segments.
    Segments,
    /// Large segments.
    LargeSegments,
}

/// Segments a subscriber belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriberSegments {
    /// Segment names.
    pub names: BTreeSet<String>,
    /// `None` when the source does not version memberships.
    pub change_number: Option<i64>,
}

impl SubscriberSegments {
    /// Create memberships from `names`.
    pub fn new(
        names: impl IntoIterator<Item = impl Into<String>>,
        change_number: Option<i64>,
    ) -> SubscriberSegments {
        SubscriberSegments {
            names: names.into_iter().map(Into::into).collect(),
            change_number,
        }
    }
}

/// Storage shared by notification workers and fetch workers.
///
/// Every write is last-writer-wins keyed by change number: a write carrying a version lower than
/// or equal to the stored one is a no-op and returns `false`.
pub trait Cache: Send + Sync {
    /// Restore persisted state. Called once on start.
    fn load(&self) {}

    /// Version of the rule set, [`EMPTY_VERSION`] when nothing was synced yet.
    fn rules_version(&self) -> i64;

    /// Look up a rule by name.
    fn rule(&self, name: &str) -> Option<Rule>;

    /// Apply `delta` if `delta.till` is newer than the stored version.
    fn apply_rules_delta(&self, delta: RulesDelta) -> bool;

    /// Mark a rule killed if `change_number` is newer than the rule's.
    fn kill_rule(&self, name: &str, default_treatment: &str, change_number: i64) -> bool;

    /// Memberships of `key`, empty if unknown.
    fn subscriber_segments(&self, domain: SegmentDomain, key: &str) -> SubscriberSegments;

    /// Replace a subscriber's memberships.
    fn set_subscriber_segments(
        &self,
        domain: SegmentDomain,
        key: &str,
        segments: SubscriberSegments,
    ) -> bool;

    /// Add or remove `names` from a subscriber's memberships.
    fn update_subscriber_segments(
        &self,
        domain: SegmentDomain,
        key: &str,
        names: &[String],
        add: bool,
        change_number: Option<i64>,
    ) -> bool;

    /// Forget everything stored for `key`.
    fn remove_subscriber(&self, key: &str);

    /// Drop everything.
    fn clear(&self);
}

fn is_stale(stored: Option<i64>, incoming: Option<i64>) -> bool {
    matches!((stored, incoming), (Some(stored), Some(incoming)) if incoming <= stored)
}

#[derive(Debug)]
struct CacheState {
    version: i64,
    rules: HashMap<String, Rule>,
    segments: HashMap<(SegmentDomain, String), SubscriberSegments>,
}

impl Default for CacheState {
    fn default() -> Self {
        CacheState {
            version: EMPTY_VERSION,
            rules: HashMap::new(),
            segments: HashMap::new(),
        }
    }
}

/// `InMemoryCache` provides a Sync storage that allows concurrent access for readers and writers.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    state: RwLock<CacheState>,
}

impl InMemoryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Cache for InMemoryCache {
    fn rules_version(&self) -> i64 {
        // Err() is possible only if the lock is poisoned (writer panicked while holding the lock),
        // which should never happen. Still, not crashing the app here.
        self.state
            .read()
            .map(|state| state.version)
            .unwrap_or(EMPTY_VERSION)
    }

    fn rule(&self, name: &str) -> Option<Rule> {
        self.state.read().ok()?.rules.get(name).cloned()
    }

    fn apply_rules_delta(&self, delta: RulesDelta) -> bool {
        let Ok(mut state) = self.state.write() else {
            return false;
        };
        if delta.till <= state.version {
            return false;
        }

        for rule in delta.rules {
            if let Some(existing) = state.rules.get(&rule.name) {
                if existing.change_number > rule.change_number {
                    continue;
                }
            }
            match rule.status {
                RuleStatus::Archived => {
                    state.rules.remove(&rule.name);
                }
                RuleStatus::Active => {
                    state.rules.insert(rule.name.clone(), rule);
                }
            }
        }
        state.version = delta.till;
        true
    }

    fn kill_rule(&self, name: &str, default_treatment: &str, change_number: i64) -> bool {
        let Ok(mut state) = self.state.write() else {
            return false;
        };
        match state.rules.get_mut(name) {
            Some(rule) if rule.change_number < change_number => {
                rule.killed = true;
                rule.default_treatment = default_treatment.to_owned();
                rule.change_number = change_number;
                true
            }
            _ => false,
        }
    }

    fn subscriber_segments(&self, domain: SegmentDomain, key: &str) -> SubscriberSegments {
        self.state
            .read()
            .ok()
            .and_then(|state| state.segments.get(&(domain, key.to_owned())).cloned())
            .unwrap_or_default()
    }

    fn set_subscriber_segments(
        &self,
        domain: SegmentDomain,
        key: &str,
        segments: SubscriberSegments,
    ) -> bool {
        let Ok(mut state) = self.state.write() else {
            return false;
        };
        let slot = state.segments.entry((domain, key.to_owned())).or_default();
        if is_stale(slot.change_number, segments.change_number) {
            return false;
        }
        *slot = segments;
        true
    }

    fn update_subscriber_segments(
        &self,
        domain: SegmentDomain,
        key: &str,
        names: &[String],
        add: bool,
        change_number: Option<i64>,
    ) -> bool {
        let Ok(mut state) = self.state.write() else {
            return false;
        };
        let slot = state.segments.entry((domain, key.to_owned())).or_default();
        if is_stale(slot.change_number, change_number) {
            return false;
        }
        for name in names {
            if add {
                slot.names.insert(name.clone());
            } else {
                slot.names.remove(name);
            }
        }
        if change_number.is_some() {
            slot.change_number = change_number;
        }
        true
    }

    fn remove_subscriber(&self, key: &str) {
        if let Ok(mut state) = self.state.write() {
            state.segments.retain(|(_, stored_key), _| stored_key != key);
        }
    }

    fn clear(&self) {
        if let Ok(mut state) = self.state.write() {
            *state = CacheState::default();
        }
    }
}
