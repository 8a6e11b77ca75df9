//! Topic filter matching for the per-connection subscription table.

use std::collections::{HashMap, HashSet};

/// Subscribers interested in one topic filter on one connection.
#[derive(Debug, Clone)]
pub struct TopicEntry {
    pub qos: rumqttc::QoS,
    pub subscribers: HashSet<String>,
}

impl TopicEntry {
    pub fn new(qos: rumqttc::QoS) -> Self {
        Self {
            qos,
            subscribers: HashSet::new(),
        }
    }
}

pub type SubscriptionTable = HashMap<String, TopicEntry>;

pub fn is_wildcard(filter: &str) -> bool {
    filter.contains('+') || filter.contains('#')
}

/// Check if a topic filter matches a topic name.
///
/// - `+` matches exactly one level
/// - `#` matches the current and all remaining levels, including none, but
///   only when it is the last level of the filter
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic == filter {
        return true;
    }
    if !is_wildcard(filter) {
        return false;
    }

    let filter_levels: Vec<&str> = filter.split('/').collect();
    let topic_levels: Vec<&str> = topic.split('/').collect();

    for (i, level) in filter_levels.iter().enumerate() {
        match *level {
            "#" => return i == filter_levels.len() - 1,
            "+" => {
                if i >= topic_levels.len() {
                    return false;
                }
            }
            literal => {
                if topic_levels.get(i) != Some(&literal) {
                    return false;
                }
            }
        }
    }

    filter_levels.len() == topic_levels.len()
}

/// Union of the subscriber sets of every filter in `table` matching `topic`.
pub fn matching_subscribers(table: &SubscriptionTable, topic: &str) -> HashSet<String> {
    let mut subscribers = HashSet::new();

    if let Some(entry) = table.get(topic) {
        subscribers.extend(entry.subscribers.iter().cloned());
    }

    for (filter, entry) in table {
        if filter != topic && is_wildcard(filter) && topic_matches_filter(topic, filter) {
            subscribers.extend(entry.subscribers.iter().cloned());
        }
    }

    subscribers
}
