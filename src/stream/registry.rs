use crate::snapshot::Frame;
use crate::stream::{StreamError, SubscriberId};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

pub type Outbox = mpsc::UnboundedSender<Frame>;

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    members: BTreeMap<SubscriberId, Outbox>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: SubscriberId, outbox: Outbox) -> Result<(), StreamError> {
        if self.members.contains_key(&id) {
            return Err(StreamError::DuplicateSubscriber(id));
        }
        self.members.insert(id, outbox);
        Ok(())
    }

    pub fn remove(&mut self, id: SubscriberId) -> bool {
        self.members.remove(&id).is_some()
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn outbox(&self, id: SubscriberId) -> Option<&Outbox> {
        self.members.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SubscriberId, &Outbox)> {
        self.members.iter().map(|(id, tx)| (*id, tx))
    }
}
