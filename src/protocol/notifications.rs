//! Typed params for the lifecycle notifications.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::RequestId;

/// Params of `notifications/cancelled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledNotification {
    /// The request being abandoned.
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CancelledNotification {
    pub fn new(request_id: RequestId, reason: impl Into<String>) -> Self {
        Self {
            request_id,
            reason: Some(reason.into()),
        }
    }
}

/// Params of `notifications/progress`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressNotification {
    /// Token from the originating request's `_meta`.
    pub progress_token: RequestId,
    /// Work done so far; increases with every notification.
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    /// Anything else the sender attached (e.g. a status message).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProgressNotification {
    pub fn new(progress_token: RequestId, progress: f64, total: Option<f64>) -> Self {
        Self {
            progress_token,
            progress,
            total,
            extra: Map::new(),
        }
    }
}
