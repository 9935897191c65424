//! JSON-RPC 2.0 envelope handling
//!
//! The gateway relays messages opaquely; payload-bearing fields stay as raw
//! JSON and are re-serialized verbatim on forward. The only inspection is the
//! block header notification check used for upstream liveness tracking.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Notification method carrying subscription payloads from upstream nodes
pub const SUBSCRIPTION_METHOD: &str = "eth_subscription";

/// A JSON-RPC 2.0-shaped message envelope
///
/// Decoding tolerates missing fields (a bare `{}` is a valid, empty
/// envelope); anything that is not a JSON object fails to decode and is
/// dropped by the relay pumps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Box<RawValue>>,
}

/// Subscription notification params, only as deep as liveness needs
#[derive(Debug, Default, Deserialize)]
struct SubscriptionParams {
    #[serde(default)]
    result: HeaderFields,
}

#[derive(Debug, Default, Deserialize)]
struct HeaderFields {
    #[serde(default)]
    difficulty: String,
    #[serde(default, rename = "parentHash")]
    parent_hash: String,
}

impl JsonRpcMessage {
    /// Whether this message is a block header notification from an upstream node
    ///
    /// True iff the method is `eth_subscription` and the notification result
    /// carries non-empty `difficulty` and `parentHash` fields. Other header
    /// fields are not validated.
    pub fn is_block_header_notification(&self) -> bool {
        if self.method.as_deref() != Some(SUBSCRIPTION_METHOD) {
            return false;
        }

        let Some(params) = self.params.as_deref() else {
            return false;
        };

        let Ok(params) = serde_json::from_str::<SubscriptionParams>(params.get()) else {
            return false;
        };

        !params.result.difficulty.is_empty() && !params.result.parent_hash.is_empty()
    }
}
