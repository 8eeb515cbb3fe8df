//! Approval gates: durable wait tokens that a human (or automation)
//! resolves out-of-band. A gate is created with a deadline, awaited by the
//! workflow, and resolved exactly once; re-awaiting a resolved gate returns
//! the stored resolution.

use crate::errors::GateError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

/// Handle given to whoever must answer the gate. The credential must be
/// presented on resolve; the id alone is not enough.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalToken {
    pub id: String,
    pub credential: String,
    pub created_at: DateTime<Utc>,
    pub timeout_ms: u64,
}

/// Outcome of awaiting a gate.
#[derive(Debug, Clone, PartialEq)]
pub enum GateWait {
    Answered(Value),
    TimedOut,
}

#[derive(Debug, Clone)]
enum Resolution {
    Pending,
    Answered(Value),
    TimedOut,
}

struct GateEntry {
    credential: String,
    deadline: Instant,
    resolution: Resolution,
    notify: watch::Sender<bool>,
}

/// In-process broker for approval gates. Cheap to clone; all clones share
/// the same table.
#[derive(Clone, Default)]
pub struct GateBroker {
    inner: Arc<Mutex<HashMap<String, GateEntry>>>,
}

impl GateBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new gate that times out after `timeout`.
    pub fn create(&self, timeout: Duration) -> ApprovalToken {
        let token = ApprovalToken {
            id: Uuid::new_v4().simple().to_string(),
            credential: Uuid::new_v4().simple().to_string(),
            created_at: Utc::now(),
            timeout_ms: timeout.as_millis() as u64,
        };
        let entry = GateEntry {
            credential: token.credential.clone(),
            deadline: Instant::now() + timeout,
            resolution: Resolution::Pending,
            notify: watch::channel(false).0,
        };
        self.inner
            .lock()
            .expect("gate table poisoned")
            .insert(token.id.clone(), entry);
        token
    }

    /// Resolve a pending gate with an answer payload. The first resolve
    /// wins; later attempts and attempts after timeout get AlreadyResolved.
    pub fn resolve(&self, id: &str, credential: &str, answer: Value) -> Result<(), GateError> {
        let mut table = self.inner.lock().expect("gate table poisoned");
        let entry = table
            .get_mut(id)
            .ok_or_else(|| GateError::UnknownToken(id.to_string()))?;
        if entry.credential != credential {
            return Err(GateError::BadCredential(id.to_string()));
        }
        match entry.resolution {
            Resolution::Pending => {
                entry.resolution = Resolution::Answered(answer);
                let _ = entry.notify.send(true);
                Ok(())
            }
            _ => Err(GateError::AlreadyResolved(id.to_string())),
        }
    }

    /// Await the gate's resolution. Idempotent: awaiting an already-resolved
    /// gate returns immediately with the stored resolution.
    pub async fn wait(&self, id: &str) -> Result<GateWait, GateError> {
        let (deadline, mut rx) = {
            let table = self.inner.lock().expect("gate table poisoned");
            let entry = table
                .get(id)
                .ok_or_else(|| GateError::UnknownToken(id.to_string()))?;
            match &entry.resolution {
                Resolution::Answered(value) => return Ok(GateWait::Answered(value.clone())),
                Resolution::TimedOut => return Ok(GateWait::TimedOut),
                Resolution::Pending => (entry.deadline, entry.notify.subscribe()),
            }
        };

        let _ = tokio::time::timeout_at(deadline, rx.changed()).await;
        let mut table = self.inner.lock().expect("gate table poisoned");
        let entry = table
            .get_mut(id)
            .ok_or_else(|| GateError::UnknownToken(id.to_string()))?;
        // A resolve may have won the race against the deadline; the stored
        // resolution is authoritative either way.
        match &entry.resolution {
            Resolution::Answered(value) => Ok(GateWait::Answered(value.clone())),
            Resolution::TimedOut => Ok(GateWait::TimedOut),
            Resolution::Pending => {
                entry.resolution = Resolution::TimedOut;
                Ok(GateWait::TimedOut)
            }
        }
    }

    /// Drop a gate from the table once the workflow is done with it.
    pub fn remove(&self, id: &str) {
        self.inner.lock().expect("gate table poisoned").remove(id);
    }
}

/// Answer for the plan-review gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlanAnswer {
    ApprovePrd {
        prd: crate::prd::Prd,
        #[serde(default)]
        yolo: bool,
    },
}

/// Answer for per-story gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StoryAnswer {
    /// Keep going to the next story.
    Continue,
    /// Stop now and publish what exists.
    Stop,
    /// Accept all remaining work: skip the rest and publish.
    ApproveComplete,
    /// Keep going and stop asking.
    Yolo,
}
