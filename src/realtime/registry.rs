//! In-memory session state keyed by session id.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of a challenge session.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Subscribed,
    Authenticated,
    Failed,
    KycPending,
    KycComplete,
    Expired,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Subscribed => "subscribed",
            Self::Authenticated => "authenticated",
            Self::Failed => "failed",
            Self::KycPending => "kyc_pending",
            Self::KycComplete => "kyc_complete",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State tracked for one session.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionRecord {
    pub status: SessionStatus,
    /// Unix seconds of the last `subscribe` call, if any.
    pub subscribed_at: Option<u64>,
    pub user_id: Option<Value>,
    pub reason: Option<String>,
    pub kyc_data: Option<Value>,
    pub pending_steps: Option<Vec<Value>>,
    /// Raw payload of the most recent event naming this session.
    pub last_event_data: Option<Value>,
}

impl SessionRecord {
    /// Fresh record written by a successful subscribe.
    pub fn subscribed(at: u64) -> Self {
        Self {
            subscribed_at: Some(at),
            ..Self::default()
        }
    }
}

impl Default for SessionRecord {
    fn default() -> Self {
        Self {
            status: SessionStatus::Subscribed,
            subscribed_at: None,
            user_id: None,
            reason: None,
            kyc_data: None,
            pending_steps: None,
            last_event_data: None,
        }
    }
}

/// Partial update merged into a [`SessionRecord`].
///
/// `None` fields leave the stored value untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionUpdate {
    pub status: Option<SessionStatus>,
    pub user_id: Option<Value>,
    pub reason: Option<String>,
    pub kyc_data: Option<Value>,
    pub pending_steps: Option<Vec<Value>>,
    pub last_event_data: Option<Value>,
}

impl SessionUpdate {
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_user_id(mut self, user_id: Value) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_kyc_data(mut self, kyc_data: Value) -> Self {
        self.kyc_data = Some(kyc_data);
        self
    }

    pub fn with_pending_steps(mut self, steps: Vec<Value>) -> Self {
        self.pending_steps = Some(steps);
        self
    }

    pub fn with_event_data(mut self, payload: Value) -> Self {
        self.last_event_data = Some(payload);
        self
    }

    fn apply(self, record: &mut SessionRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(user_id) = self.user_id {
            record.user_id = Some(user_id);
        }
        if let Some(reason) = self.reason {
            record.reason = Some(reason);
        }
        if let Some(kyc_data) = self.kyc_data {
            record.kyc_data = Some(kyc_data);
        }
        if let Some(steps) = self.pending_steps {
            record.pending_steps = Some(steps);
        }
        if let Some(payload) = self.last_event_data {
            record.last_event_data = Some(payload);
        }
    }
}

/// Map from session id to [`SessionRecord`]; one record per id.
#[derive(Clone, Debug, Default)]
pub struct SessionRegistry {
    sessions: BTreeMap<String, SessionRecord>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `update` into the record for `id`, creating a default record
    /// when none exists.
    pub fn upsert(&mut self, id: &str, update: SessionUpdate) -> &SessionRecord {
        let record = self.sessions.entry(id.to_string()).or_default();
        update.apply(record);
        record
    }

    /// Records a subscription to `id`.
    ///
    /// A record whose status already moved past `subscribed` is left as is.
    /// Returns `true` when a new record was created.
    pub fn mark_subscribed(&mut self, id: &str, at: u64) -> bool {
        match self.sessions.get_mut(id) {
            Some(record) => {
                if record.status == SessionStatus::Subscribed {
                    record.subscribed_at = Some(at);
                }
                false
            }
            None => {
                self.sessions
                    .insert(id.to_string(), SessionRecord::subscribed(at));
                true
            }
        }
    }

    /// Replaces the record for `id` wholesale.
    pub fn insert(&mut self, id: &str, record: SessionRecord) {
        self.sessions.insert(id.to_string(), record);
    }

    pub fn remove(&mut self, id: &str) -> Option<SessionRecord> {
        self.sessions.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&SessionRecord> {
        self.sessions.get(id)
    }

    /// Snapshot of every tracked session.
    pub fn list(&self) -> BTreeMap<String, SessionRecord> {
        self.sessions.clone()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}
