//! Audit rule manager: compiled destination patterns per inbound tag and
//! the incident set drained by the report task.

use crate::tag;
use dashmap::DashMap;
use nc_panel::types::{DetectResult, DetectRule};
use parking_lot::Mutex;
use std::collections::HashSet;

#[derive(Default)]
pub struct RuleManager {
    rules: DashMap<String, Vec<DetectRule>>,
    results: DashMap<String, Mutex<HashSet<DetectResult>>>,
}

impl RuleManager {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    /// Replace the rule list for a tag, but only when it actually changed;
    /// unchanged fetches must not churn the compiled patterns.
    pub fn update(&self, inbound_tag: &str, new_rules: Vec<DetectRule>) {
        match self.rules.entry(inbound_tag.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                if slot.get() != &new_rules {
                    slot.insert(new_rules);
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(new_rules);
            }
        }
    }

    /// First matching rule rejects the link. Panel rules also record an
    /// incident (once per (uid, rule) per cycle); local rules reject
    /// silently. A user tag without a parseable uid still rejects.
    pub fn detect(&self, inbound_tag: &str, destination: &str, email: &str) -> bool {
        let hit = {
            let Some(rules) = self.rules.get(inbound_tag) else {
                return false;
            };
            rules
                .iter()
                .find(|rule| rule.pattern.is_match(destination))
                .map(|rule| rule.id)
        };
        let Some(rule_id) = hit else {
            return false;
        };
        if rule_id >= 0 {
            match tag::uid_of_user_tag(email) {
                Some(uid) => {
                    self.results
                        .entry(inbound_tag.to_string())
                        .or_insert_with(|| Mutex::new(HashSet::new()))
                        .lock()
                        .insert(DetectResult { uid, rule_id });
                }
                None => {
                    tracing::debug!(email, "cannot record incident: no uid in user tag");
                }
            }
        }
        true
    }

    /// Swap out and return the incidents accumulated for a tag.
    pub fn drain(&self, inbound_tag: &str) -> Vec<DetectResult> {
        match self.results.remove(inbound_tag) {
            Some((_, set)) => set.into_inner().into_iter().collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> Vec<DetectRule> {
        vec![
            DetectRule::new(7, r"(?i)^porn\.").unwrap(),
            DetectRule::new(8, r"\.gamble\.").unwrap(),
        ]
    }

    #[test]
    fn first_match_wins_and_incident_recorded() {
        let manager = RuleManager::new();
        manager.update("t", rules());
        assert!(manager.detect("t", "porn.example.com:443", "t|u@x|4"));
        assert!(!manager.detect("t", "news.example.com:443", "t|u@x|4"));
        let drained = manager.drain("t");
        assert_eq!(drained, vec![DetectResult { uid: 4, rule_id: 7 }]);
    }

    #[test]
    fn incidents_are_deduplicated_per_cycle() {
        let manager = RuleManager::new();
        manager.update("t", rules());
        assert!(manager.detect("t", "porn.example.com:443", "t|u@x|4"));
        assert!(manager.detect("t", "porn.example.net:443", "t|u@x|4"));
        assert_eq!(manager.drain("t").len(), 1);
        // Drained: the next cycle starts empty.
        assert!(manager.drain("t").is_empty());
    }

    #[test]
    fn local_rules_reject_without_incident() {
        let manager = RuleManager::new();
        manager.update("t", vec![DetectRule::new(-1, "blocked.example").unwrap()]);
        assert!(manager.detect("t", "blocked.example:80", "t|u@x|4"));
        assert!(manager.drain("t").is_empty());
    }

    #[test]
    fn unparseable_uid_still_rejects() {
        let manager = RuleManager::new();
        manager.update("t", rules());
        assert!(manager.detect("t", "porn.example.com", "garbage-email"));
        assert!(manager.drain("t").is_empty());
    }

    #[test]
    fn unknown_tag_never_matches() {
        let manager = RuleManager::new();
        assert!(!manager.detect("t", "porn.example.com", "t|u|1"));
    }

    #[test]
    fn update_replaces_only_on_change() {
        let manager = RuleManager::new();
        manager.update("t", rules());
        // Unchanged list: same compiled patterns stay in place.
        manager.update("t", rules());
        assert_eq!(manager.rules.get("t").unwrap().len(), 2);
        manager.update("t", vec![DetectRule::new(9, "x").unwrap()]);
        assert_eq!(manager.rules.get("t").unwrap().len(), 1);
    }
}
