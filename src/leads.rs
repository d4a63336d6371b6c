//! Lead records and the narrow storage interface the engine reaches them
//! through. Personalization and scheduled-audience resolution are the only
//! consumers.

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Contact record captured by the lead funnel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LeadRecord {
    pub phone: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub age: Option<String>,
    pub weight: Option<String>,
    pub height: Option<String>,
    pub gender: Option<String>,
    pub place: Option<String>,
    pub health_issues: Option<String>,
    pub preferred_date: Option<String>,
    pub preferred_time: Option<String>,
    pub tags: Vec<String>,
}

impl LeadRecord {
    pub fn new(phone: impl Into<String>) -> Self {
        Self {
            phone: phone.into(),
            ..Default::default()
        }
    }

    /// Look up a personalization field by its placeholder key.
    pub fn field(&self, key: &str) -> Option<&str> {
        let value = match key {
            "name" => &self.name,
            "email" => &self.email,
            "age" => &self.age,
            "weight" => &self.weight,
            "height" => &self.height,
            "gender" => &self.gender,
            "place" => &self.place,
            "health_issues" => &self.health_issues,
            "preferred_date" => &self.preferred_date,
            "preferred_time" => &self.preferred_time,
            _ => return None,
        };
        value.as_deref()
    }
}

/// Placeholder keys resolvable from a lead record, in substitution order.
pub const LEAD_FIELDS: &[&str] = &[
    "name",
    "email",
    "age",
    "weight",
    "height",
    "gender",
    "place",
    "health_issues",
    "preferred_date",
    "preferred_time",
];

#[derive(Debug, Error)]
pub enum LeadStoreError {
    #[error("lead storage unavailable: {0}")]
    Unavailable(String),
}

pub type LeadStore = Arc<dyn LeadStoreType>;

#[async_trait]
pub trait LeadStoreType: Send + Sync + Debug {
    /// Exact-identity lookup. A missing record is `Ok(None)`; `Err` means the
    /// backing store itself failed and callers degrade rather than abort.
    async fn find_by_identity(&self, identity: &str) -> Result<Option<LeadRecord>, LeadStoreError>;
    async fn list_all(&self) -> Vec<LeadRecord>;
    /// Leads carrying at least one of the given tags.
    async fn find_by_any_tag(&self, tags: &[String]) -> Vec<LeadRecord>;
}

#[derive(Debug, Default)]
pub struct InMemoryLeadStore {
    leads: DashMap<String, LeadRecord>,
}

impl InMemoryLeadStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            leads: DashMap::new(),
        })
    }

    pub fn insert(&self, lead: LeadRecord) {
        self.leads.insert(lead.phone.clone(), lead);
    }

    /// Seed the store from a JSON array of lead records.
    pub fn load_file(&self, path: &Path) -> anyhow::Result<usize> {
        let contents = std::fs::read_to_string(path)?;
        let records: Vec<LeadRecord> = serde_json::from_str(&contents)?;
        let count = records.len();
        for lead in records {
            self.insert(lead);
        }
        Ok(count)
    }
}

#[async_trait]
impl LeadStoreType for InMemoryLeadStore {
    async fn find_by_identity(&self, identity: &str) -> Result<Option<LeadRecord>, LeadStoreError> {
        Ok(self.leads.get(identity).map(|entry| entry.value().clone()))
    }

    async fn list_all(&self) -> Vec<LeadRecord> {
        let mut all: Vec<LeadRecord> = self
            .leads
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.phone.cmp(&b.phone));
        all
    }

    async fn find_by_any_tag(&self, tags: &[String]) -> Vec<LeadRecord> {
        let mut matched: Vec<LeadRecord> = self
            .leads
            .iter()
            .filter(|entry| entry.value().tags.iter().any(|t| tags.contains(t)))
            .map(|entry| entry.value().clone())
            .collect();
        matched.sort_by(|a, b| a.phone.cmp(&b.phone));
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(phone: &str, tags: &[&str]) -> LeadRecord {
        LeadRecord {
            phone: phone.into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_find_by_identity_exact_only() {
        let store = InMemoryLeadStore::new();
        store.insert(LeadRecord::new("91890000000"));

        assert!(
            store
                .find_by_identity("91890000000")
                .await
                .unwrap()
                .is_some()
        );
        // No fuzzy matching at the store level; that is session-table policy.
        assert!(store.find_by_identity("890000000").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_by_any_tag() {
        let store = InMemoryLeadStore::new();
        store.insert(tagged("1", &["vip"]));
        store.insert(tagged("2", &["trial", "vip"]));
        store.insert(tagged("3", &["churned"]));

        let hits = store.find_by_any_tag(&["vip".to_string()]).await;
        let phones: Vec<&str> = hits.iter().map(|l| l.phone.as_str()).collect();
        assert_eq!(phones, vec!["1", "2"]);

        assert!(store.find_by_any_tag(&[]).await.is_empty());
    }

    #[test]
    fn test_field_lookup() {
        let lead = LeadRecord {
            phone: "1".into(),
            name: Some("Ana".into()),
            ..Default::default()
        };
        assert_eq!(lead.field("name"), Some("Ana"));
        assert_eq!(lead.field("email"), None);
        assert_eq!(lead.field("not_a_field"), None);
    }
}
