/// Result of `SubscriptionSet::add`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOutcome {
    pub already_present: bool,
}

/// Result of `SubscriptionSet::remove`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveOutcome {
    pub was_present: bool,
}

/// The authoritative list of subscribed topics.
///
/// No duplicates; exposed in insertion order. Pure bookkeeping: changing it
/// never touches the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    topics: Vec<String>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a list, keeping the first occurrence of each topic.
    pub fn from_topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::new();
        for topic in topics {
            set.add(topic.into());
        }
        set
    }

    pub fn add(&mut self, topic: impl Into<String>) -> AddOutcome {
        let topic = topic.into();
        if self.contains(&topic) {
            return AddOutcome { already_present: true };
        }
        self.topics.push(topic);
        AddOutcome { already_present: false }
    }

    pub fn remove(&mut self, topic: &str) -> RemoveOutcome {
        match self.topics.iter().position(|t| t == topic) {
            Some(idx) => {
                self.topics.remove(idx);
                RemoveOutcome { was_present: true }
            }
            None => RemoveOutcome { was_present: false },
        }
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.iter().any(|t| t == topic)
    }

    pub fn list(&self) -> &[String] {
        &self.topics
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.topics.clone()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}
