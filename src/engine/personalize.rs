//! Text templating: `{placeholder}` substitution from the user identity, the
//! lead record, and session variables.

use std::collections::HashMap;

use tracing::warn;

use super::session::Session;
use crate::leads::{LEAD_FIELDS, LeadStore};

/// Personalize a message template.
///
/// Substitutions are merged in order: `{phone}`, then the lead record's
/// fields, then session variables. Later entries override earlier ones that
/// share a key, so a session variable always beats the lead field of the
/// same name.
///
/// When the lead record is missing or the lead store fails, the lead-derived
/// placeholders are left literally in the output (no empty-string fallback).
/// That asymmetry (a present lead with a missing field substitutes "", an
/// absent lead substitutes nothing) is long-standing observable behavior
/// and is preserved deliberately.
pub async fn personalize_message(
    text: &str,
    identity: &str,
    session: Option<&Session>,
    leads: &LeadStore,
) -> String {
    let mut substitutions: HashMap<String, String> = HashMap::new();
    substitutions.insert("phone".to_string(), identity.to_string());

    match leads.find_by_identity(identity).await {
        Ok(Some(lead)) => {
            for field in LEAD_FIELDS {
                substitutions.insert(
                    field.to_string(),
                    lead.field(field).unwrap_or_default().to_string(),
                );
            }
        }
        Ok(None) => {}
        Err(e) => {
            warn!(identity = %identity, error = %e, "lead fetch failed during personalization");
        }
    }

    if let Some(session) = session {
        for (key, value) in &session.variables {
            substitutions.insert(key.clone(), value.clone());
        }
    }

    let mut result = text.to_string();
    for (key, value) in &substitutions {
        result = result.replace(&format!("{{{key}}}"), value);
    }
    result
}

/// Lighter-weight personalization for bulk sends: only `{name}`,
/// `{preferred_date}` and `{preferred_time}`, with friendly fallbacks when
/// the lead is unknown or unnamed.
pub async fn personalize_bulk(message: &str, phone: &str, leads: &LeadStore) -> String {
    let lead = leads.find_by_identity(phone).await.unwrap_or_else(|e| {
        warn!(phone = %phone, error = %e, "lead fetch failed during bulk personalization");
        None
    });

    match lead {
        Some(lead) if lead.name.as_deref().is_some_and(|n| !n.is_empty()) => message
            .replace("{name}", lead.name.as_deref().unwrap_or_default())
            .replace(
                "{preferred_date}",
                lead.preferred_date.as_deref().unwrap_or("your requested date"),
            )
            .replace(
                "{preferred_time}",
                lead.preferred_time.as_deref().unwrap_or("your requested time"),
            ),
        _ => message
            .replace("{name}", "there")
            .replace("{preferred_date}", "your requested date")
            .replace("{preferred_time}", "your requested time"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leads::{InMemoryLeadStore, LeadRecord, LeadStoreError, LeadStoreType};

    fn store_with_ana() -> LeadStore {
        let store = InMemoryLeadStore::new();
        store.insert(LeadRecord {
            phone: "311".into(),
            name: Some("Ana".into()),
            preferred_date: Some("2025-01-02".into()),
            ..Default::default()
        });
        store
    }

    #[tokio::test]
    async fn test_lead_round_trip() {
        let leads = store_with_ana();
        let out = personalize_message("Hi {name}, on {preferred_date}", "311", None, &leads).await;
        assert_eq!(out, "Hi Ana, on 2025-01-02");
    }

    #[tokio::test]
    async fn test_session_variable_overrides_lead_field() {
        let leads = store_with_ana();
        let mut session = Session::new("f", "s");
        session
            .variables
            .insert("preferred_date".into(), "rescheduled".into());
        let out =
            personalize_message("Hi {name}, on {preferred_date}", "311", Some(&session), &leads)
                .await;
        assert_eq!(out, "Hi Ana, on rescheduled");
    }

    #[tokio::test]
    async fn test_missing_lead_field_substitutes_empty() {
        let leads = store_with_ana();
        let out = personalize_message("email: {email}.", "311", None, &leads).await;
        assert_eq!(out, "email: .");
    }

    #[tokio::test]
    async fn test_unknown_lead_leaves_placeholders_untouched() {
        let leads: LeadStore = InMemoryLeadStore::new();
        let out = personalize_message("Hi {name} from {phone}", "999", None, &leads).await;
        assert_eq!(out, "Hi {name} from 999");
    }

    #[derive(Debug)]
    struct FailingLeadStore;

    #[async_trait::async_trait]
    impl LeadStoreType for FailingLeadStore {
        async fn find_by_identity(
            &self,
            _identity: &str,
        ) -> Result<Option<LeadRecord>, LeadStoreError> {
            Err(LeadStoreError::Unavailable("down".into()))
        }
        async fn list_all(&self) -> Vec<LeadRecord> {
            vec![]
        }
        async fn find_by_any_tag(&self, _tags: &[String]) -> Vec<LeadRecord> {
            vec![]
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_swallowed_placeholders_remain() {
        let leads: LeadStore = std::sync::Arc::new(FailingLeadStore);
        let out = personalize_message("Hi {name}", "311", None, &leads).await;
        assert_eq!(out, "Hi {name}");
    }

    #[tokio::test]
    async fn test_bulk_fallbacks_for_unknown_lead() {
        let leads: LeadStore = InMemoryLeadStore::new();
        let out = personalize_bulk("Hi {name}, see you {preferred_date}", "1", &leads).await;
        assert_eq!(out, "Hi there, see you your requested date");
    }

    #[tokio::test]
    async fn test_bulk_uses_lead_when_named() {
        let leads = store_with_ana();
        let out = personalize_bulk("Hi {name}, {preferred_time}", "311", &leads).await;
        assert_eq!(out, "Hi Ana, your requested time");
    }
}
