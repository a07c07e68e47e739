//! External collaborators the engine reads from: the recipient store and
//! the content resolver. In-memory implementations back local runs and tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use campaign_core::channels::{Channel, MessageContent, Recipient, RecipientId};
use campaign_core::{CampaignError, CampaignResult};
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

#[async_trait]
pub trait RecipientStore: Send + Sync {
    /// A page of the recipient ids listed for `flow_id`, in stable order.
    async fn list_ids(
        &self,
        flow_id: Uuid,
        offset: usize,
        limit: usize,
    ) -> CampaignResult<Vec<RecipientId>>;

    async fn count(&self, flow_id: Uuid) -> CampaignResult<usize>;

    async fn get(&self, id: &str) -> CampaignResult<Option<Recipient>>;
}

#[async_trait]
pub trait ContentResolver: Send + Sync {
    async fn resolve(&self, node_id: &str, channel: Channel) -> CampaignResult<MessageContent>;
}

/// Recipient store held in memory.
#[derive(Clone, Default)]
pub struct MemoryRecipientStore {
    recipients: Arc<DashMap<RecipientId, Recipient>>,
    lists: Arc<RwLock<HashMap<Uuid, Vec<RecipientId>>>>,
}

impl MemoryRecipientStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, recipient: Recipient) {
        self.recipients.insert(recipient.id.clone(), recipient);
    }

    /// Adds `recipient` and lists it under `flow_id`.
    pub fn insert_for_flow(&self, flow_id: Uuid, recipient: Recipient) {
        self.lists
            .write()
            .entry(flow_id)
            .or_default()
            .push(recipient.id.clone());
        self.insert(recipient);
    }

    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }
}

#[async_trait]
impl RecipientStore for MemoryRecipientStore {
    async fn list_ids(
        &self,
        flow_id: Uuid,
        offset: usize,
        limit: usize,
    ) -> CampaignResult<Vec<RecipientId>> {
        let lists = self.lists.read();
        Ok(lists
            .get(&flow_id)
            .map(|ids| ids.iter().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn count(&self, flow_id: Uuid) -> CampaignResult<usize> {
        Ok(self.lists.read().get(&flow_id).map_or(0, Vec::len))
    }

    async fn get(&self, id: &str) -> CampaignResult<Option<Recipient>> {
        Ok(self.recipients.get(id).map(|r| r.clone()))
    }
}

/// Content keyed by node id, with an optional per-channel fallback.
#[derive(Clone, Default)]
pub struct StaticContentResolver {
    by_node: Arc<DashMap<String, MessageContent>>,
    fallback: Arc<DashMap<Channel, MessageContent>>,
}

impl StaticContentResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(self, node_id: impl Into<String>, content: MessageContent) -> Self {
        self.by_node.insert(node_id.into(), content);
        self
    }

    pub fn with_fallback(self, channel: Channel, content: MessageContent) -> Self {
        self.fallback.insert(channel, content);
        self
    }
}

#[async_trait]
impl ContentResolver for StaticContentResolver {
    async fn resolve(&self, node_id: &str, channel: Channel) -> CampaignResult<MessageContent> {
        if let Some(content) = self.by_node.get(node_id) {
            return Ok(content.clone());
        }
        self.fallback
            .get(&channel)
            .map(|c| c.clone())
            .ok_or_else(|| CampaignError::not_found(format!("content for node '{node_id}'")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_ids_pages_in_order() {
        let store = MemoryRecipientStore::new();
        let flow = Uuid::new_v4();
        for i in 0..25 {
            store.insert_for_flow(
                flow,
                Recipient {
                    id: format!("r{i:02}"),
                    email: Some(format!("r{i}@example.com")),
                    phone: None,
                },
            );
        }
        assert_eq!(store.count(flow).await.unwrap(), 25);
        let page = store.list_ids(flow, 20, 10).await.unwrap();
        assert_eq!(page, vec!["r20", "r21", "r22", "r23", "r24"]);
        assert!(store.list_ids(flow, 30, 10).await.unwrap().is_empty());
        assert!(store.list_ids(Uuid::new_v4(), 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_content_resolution_prefers_node() {
        let email = |body: &str| MessageContent {
            subject: Some("s".into()),
            body: body.into(),
            is_html: false,
        };
        let resolver = StaticContentResolver::new()
            .with_node("a", email("node a"))
            .with_fallback(Channel::Email, email("default"));
        assert_eq!(
            resolver.resolve("a", Channel::Email).await.unwrap().body,
            "node a"
        );
        assert_eq!(
            resolver.resolve("b", Channel::Email).await.unwrap().body,
            "default"
        );
        assert!(resolver.resolve("b", Channel::Sms).await.is_err());
    }
}
