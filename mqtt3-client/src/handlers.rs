use std::fmt;

use mqtt3_packet::QoS;

use crate::message::MessageHandler;
use crate::topic::topic_matches;

/// A registered subscription: topic filter, the QoS requested at subscribe
/// time and the handler messages are delivered to.
#[derive(Clone)]
pub struct Subscription {
    pub topic_filter: String,
    pub qos: QoS,
    pub handler: MessageHandler,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic_filter", &self.topic_filter)
            .field("qos", &self.qos)
            .finish()
    }
}

/// The subscription table.
///
/// Entries are installed only once the broker's SUBACK confirms them and
/// removed on UNSUBACK or when a pending registration expires.
#[derive(Debug, Default)]
pub struct SubscriptionList {
    entries: Vec<Subscription>,
}

impl SubscriptionList {
    pub fn new() -> Self {
        SubscriptionList {
            entries: Vec::new(),
        }
    }

    /// First subscription whose filter matches `topic`, by exact equality
    /// or wildcard match.
    pub fn find(&self, topic: &str) -> Option<&Subscription> {
        self.entries
            .iter()
            .find(|sub| sub.topic_filter == topic || topic_matches(&sub.topic_filter, topic))
    }

    /// Subscription registered under exactly this filter. Wildcards are not
    /// expanded; duplicate detection is plain string equality.
    pub fn find_filter(&self, topic_filter: &str) -> Option<&Subscription> {
        self.entries
            .iter()
            .find(|sub| sub.topic_filter == topic_filter)
    }

    /// Installs a confirmed subscription. A record with an equal filter
    /// already present wins; the new one is dropped.
    pub fn install(&mut self, subscription: Subscription) {
        if self.find_filter(&subscription.topic_filter).is_some() {
            debug!(
                "subscription for {:?} already installed",
                subscription.topic_filter
            );
            return;
        }

        self.entries.push(subscription);
    }

    pub fn remove(&mut self, topic_filter: &str) {
        self.entries.retain(|sub| sub.topic_filter != topic_filter);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn subscription(filter: &str, qos: QoS) -> Subscription {
        Subscription {
            topic_filter: filter.to_string(),
            qos,
            handler: Arc::new(|_, _| {}),
        }
    }

    #[test]
    fn test_find_prefers_first_match() {
        let mut list = SubscriptionList::new();
        list.install(subscription("a/+", QoS::AtMostOnce));
        list.install(subscription("a/#", QoS::AtLeastOnce));

        let found = list.find("a/b").unwrap();
        assert_eq!(found.topic_filter, "a/+");

        let found = list.find("a/b/c").unwrap();
        assert_eq!(found.topic_filter, "a/#");

        assert!(list.find("b").is_none());
    }

    #[test]
    fn test_duplicate_filter_not_installed_twice() {
        let mut list = SubscriptionList::new();
        list.install(subscription("a/b", QoS::AtMostOnce));
        list.install(subscription("a/b", QoS::ExactlyOnce));

        assert_eq!(list.iter().count(), 1);
        // the original registration wins
        assert_eq!(list.find_filter("a/b").unwrap().qos, QoS::AtMostOnce);
    }

    #[test]
    fn test_duplicate_detection_is_exact_not_wildcard() {
        let mut list = SubscriptionList::new();
        list.install(subscription("a/+", QoS::AtMostOnce));
        list.install(subscription("a/b", QoS::AtMostOnce));

        // "a/+" matches the topic "a/b", but is not the same filter
        assert_eq!(list.iter().count(), 2);
    }

    #[test]
    fn test_remove() {
        let mut list = SubscriptionList::new();
        list.install(subscription("a/b", QoS::AtMostOnce));
        list.install(subscription("c/d", QoS::AtMostOnce));

        list.remove("a/b");
        assert!(list.find_filter("a/b").is_none());
        assert!(list.find_filter("c/d").is_some());
    }
}
