use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::action::Verb;

/// Error attached to a failed item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub status: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ItemError>,
}

/// One entry of `items`: `{ "<verb>": { "status": .., "error": .. } }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, ItemResult>", into = "BTreeMap<String, ItemResult>")]
pub struct BulkItem {
    pub verb: String,
    pub result: ItemResult,
}

impl BulkItem {
    pub fn new(verb: impl Into<String>, status: u16, error: Option<ItemError>) -> Self {
        Self {
            verb: verb.into(),
            result: ItemResult { status, error },
        }
    }

    pub fn status(&self) -> u16 {
        self.result.status
    }

    pub fn error(&self) -> Option<&ItemError> {
        self.result.error.as_ref()
    }

    pub fn error_type(&self) -> Option<&str> {
        self.error().map(|e| e.kind.as_str())
    }
}

impl TryFrom<BTreeMap<String, ItemResult>> for BulkItem {
    type Error = String;

    fn try_from(map: BTreeMap<String, ItemResult>) -> Result<Self, Self::Error> {
        if map.len() != 1 {
            return Err(format!("bulk item must have exactly one key, got {}", map.len()));
        }
        let (verb, result) = map
            .into_iter()
            .next()
            .ok_or_else(|| "empty bulk item".to_string())?;
        Ok(Self { verb, result })
    }
}

impl From<BulkItem> for BTreeMap<String, ItemResult> {
    fn from(item: BulkItem) -> Self {
        BTreeMap::from([(item.verb, item.result)])
    }
}

/// Logical response of a bulk call, possibly stitched from several
/// sub-requests
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkResponse {
    #[serde(default)]
    pub errors: bool,

    #[serde(default)]
    pub items: Vec<BulkItem>,
}

impl BulkResponse {
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// `errors` is the OR of the parts, `items` their concatenation in order
    pub fn join(parts: Vec<BulkResponse>) -> Self {
        let mut joined = BulkResponse::default();
        for part in parts {
            joined.errors |= part.errors;
            joined.items.extend(part.items);
        }
        joined
    }

    /// One failed item per submitted action, all carrying `reason`
    pub fn rejected_batch(verbs: &[Verb], status: u16, reason: &str) -> Self {
        let items = verbs
            .iter()
            .map(|verb| {
                BulkItem::new(
                    verb.as_str(),
                    status,
                    Some(ItemError {
                        kind: reason.to_string(),
                        reason: Some(reason.to_string()),
                    }),
                )
            })
            .collect();
        Self {
            errors: true,
            items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_wire_response() {
        let body = json!({
            "errors": true,
            "items": [
                { "index": { "status": 201 } },
                { "create": { "status": 409, "error": { "type": "version_conflict_engine_exception", "reason": "exists" } } },
                { "delete": { "status": 404 } }
            ]
        });
        let response = BulkResponse::parse(body.to_string().as_bytes()).unwrap();

        assert!(response.errors);
        assert_eq!(response.items.len(), 3);
        assert_eq!(response.items[0].verb, "index");
        assert_eq!(response.items[1].status(), 409);
        assert_eq!(
            response.items[1].error_type(),
            Some("version_conflict_engine_exception")
        );
        assert_eq!(response.items[2].error(), None);
    }

    #[test]
    fn test_item_with_two_keys_is_rejected() {
        let body = json!({
            "errors": false,
            "items": [ { "index": { "status": 201 }, "create": { "status": 201 } } ]
        });
        assert!(BulkResponse::parse(body.to_string().as_bytes()).is_err());
    }

    #[test]
    fn test_missing_fields_default() {
        let response = BulkResponse::parse(b"{}").unwrap();
        assert!(!response.errors);
        assert!(response.items.is_empty());
    }

    #[test]
    fn test_join_ors_errors_and_keeps_order() {
        let a = BulkResponse {
            errors: false,
            items: vec![BulkItem::new("index", 201, None)],
        };
        let b = BulkResponse {
            errors: true,
            items: vec![
                BulkItem::new("create", 429, None),
                BulkItem::new("delete", 200, None),
            ],
        };
        let joined = BulkResponse::join(vec![a, b]);
        assert!(joined.errors);
        let verbs: Vec<&str> = joined.items.iter().map(|i| i.verb.as_str()).collect();
        assert_eq!(verbs, vec!["index", "create", "delete"]);
    }

    #[test]
    fn test_rejected_batch_serializes_like_the_wire() {
        let rejected = BulkResponse::rejected_batch(&[Verb::Index, Verb::Delete], 413, "payload_too_large");
        assert_eq!(
            serde_json::to_value(&rejected).unwrap(),
            json!({
                "errors": true,
                "items": [
                    { "index": { "status": 413, "error": { "type": "payload_too_large", "reason": "payload_too_large" } } },
                    { "delete": { "status": 413, "error": { "type": "payload_too_large", "reason": "payload_too_large" } } }
                ]
            })
        );
    }
}
