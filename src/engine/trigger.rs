//! Trigger matching: which flow should start a fresh session for an
//! unsolicited inbound message.

use regex::RegexBuilder;
use tracing::warn;

use crate::flow::{FlowDefinition, TriggerType};

/// First definition whose trigger matches the message, in the order the
/// definitions were listed. There is no priority field; ties go to whichever
/// definition the store lists first, which is observable but arbitrary.
pub fn find_matching_flow<'a>(
    flows: &'a [FlowDefinition],
    message: &str,
) -> Option<&'a FlowDefinition> {
    let msg_lower = message.to_lowercase().trim().to_string();

    for flow in flows {
        let trigger = flow.trigger.to_lowercase();
        let matched = match flow.trigger_type {
            TriggerType::Exact => msg_lower == trigger,
            TriggerType::Contains | TriggerType::Keyword => msg_lower.contains(&trigger),
            TriggerType::Regex => {
                // Compiled case-insensitively against the raw message, not
                // the lowercased copy.
                match RegexBuilder::new(&flow.trigger).case_insensitive(true).build() {
                    Ok(re) => re.is_match(message),
                    Err(e) => {
                        warn!(flow = %flow.id, error = %e, "invalid regex trigger, skipping flow");
                        false
                    }
                }
            }
            // Scheduled flows never start from an inbound message.
            TriggerType::Scheduled => false,
        };
        if matched {
            return Some(flow);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flow(id: &str, trigger: &str, trigger_type: &str) -> FlowDefinition {
        serde_json::from_value(json!({
            "id": id,
            "name": id,
            "trigger": trigger,
            "triggerType": trigger_type,
            "nodes": [{"id": "s", "type": "start"}],
            "connections": []
        }))
        .unwrap()
    }

    #[test]
    fn test_exact_is_trimmed_and_case_insensitive() {
        let flows = vec![flow("f", "Hello", "exact")];
        assert!(find_matching_flow(&flows, "  hello  ").is_some());
        assert!(find_matching_flow(&flows, "hello there").is_none());
    }

    #[test]
    fn test_contains_and_keyword_are_substring() {
        let flows = vec![flow("a", "price", "contains"), flow("b", "menu", "keyword")];
        assert_eq!(find_matching_flow(&flows, "What's the PRICE?").unwrap().id, "a");
        assert_eq!(find_matching_flow(&flows, "show me the menu").unwrap().id, "b");
    }

    #[test]
    fn test_regex_matches_raw_text() {
        let flows = vec![flow("f", r"^order\s+\d+$", "regex")];
        assert!(find_matching_flow(&flows, "Order 42").is_some());
        assert!(find_matching_flow(&flows, "order something").is_none());
    }

    #[test]
    fn test_invalid_regex_is_skipped_not_fatal() {
        let flows = vec![flow("bad", r"(unclosed", "regex"), flow("ok", "hi", "exact")];
        assert_eq!(find_matching_flow(&flows, "hi").unwrap().id, "ok");
    }

    #[test]
    fn test_first_match_wins_in_listing_order() {
        let flows = vec![flow("first", "help", "contains"), flow("second", "help", "contains")];
        assert_eq!(find_matching_flow(&flows, "help me").unwrap().id, "first");
    }

    #[test]
    fn test_scheduled_flows_never_match_inbound() {
        let flows = vec![flow("s", "anything", "scheduled")];
        assert!(find_matching_flow(&flows, "anything").is_none());
    }
}
