//! Sandbox identity and lifecycle.

use crate::error::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use testbed_proto::EndpointPair;
use uuid::Uuid;

/// Kubernetes object names are DNS labels.
const MAX_ID_LEN: usize = 63;

/// Identifier of a sandbox. Doubles as the workload name and the protocol
/// owner id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxId(String);

impl SandboxId {
    /// A fresh id for `instance_ref`: `<instance>-testbed-<5 random chars>`.
    ///
    /// `django__django-11099` becomes `django-django-11099-testbed-3fa9c`.
    pub fn generate(instance_ref: &str) -> Self {
        let suffix: String = Uuid::new_v4().simple().to_string().chars().take(5).collect();
        let tail = format!("-testbed-{suffix}");

        let base: String = instance_ref
            .replace("__", "-")
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        let base = base.trim_matches('-');
        let room = MAX_ID_LEN - tail.len();
        let base = base[..base.len().min(room)].trim_end_matches('-');
        let base = if base.is_empty() { "sandbox" } else { base };

        Self(format!("{base}{tail}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SandboxId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SandboxId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Lifecycle status of a sandbox.
///
/// ```text
/// Requested ─▶ Provisioning ─▶ Ready ─▶ InUse ─┐
///     │             │            ▲───reset──┘  │
///     └──▶ Failed ◀─┘                          ▼
///           └───────────────────────▶ Terminating ─▶ Deleted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    /// Registered, workload not yet submitted.
    Requested,
    /// Workload submitted, endpoint not yet resolved.
    Provisioning,
    /// Endpoint resolved.
    Ready,
    /// A client is attached.
    InUse,
    Terminating,
    Deleted,
    /// The scheduler refused the workload.
    Failed,
}

impl SandboxStatus {
    /// Whether moving to `next` is allowed.
    pub fn can_transition_to(self, next: SandboxStatus) -> bool {
        use SandboxStatus::*;
        matches!(
            (self, next),
            (Requested, Provisioning)
                | (Provisioning, Ready)
                | (Ready, InUse)
                | (InUse, Ready)
                | (Requested | Provisioning, Failed)
                | (Requested | Provisioning | Ready | InUse | Failed, Terminating)
                | (Terminating, Deleted)
        )
    }

    /// Still holds, or may soon hold, cluster resources.
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Deleted | Self::Failed)
    }

    /// Creation is still in progress.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Requested | Self::Provisioning)
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Requested => "requested",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::InUse => "in_use",
            Self::Terminating => "terminating",
            Self::Deleted => "deleted",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Snapshot of one sandbox as tracked by the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub id: SandboxId,
    pub instance_ref: String,
    pub user_id: Option<String>,
    pub status: SandboxStatus,
    /// Set once the endpoint has been resolved.
    pub endpoints: Option<EndpointPair>,
    /// Why provisioning failed, for `Failed` sandboxes.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SandboxInfo {
    pub(crate) fn new(id: SandboxId, instance_ref: &str, user_id: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id,
            instance_ref: instance_ref.to_string(),
            user_id: user_id.map(String::from),
            status: SandboxStatus::Requested,
            endpoints: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub(crate) fn advance(
        &mut self,
        next: SandboxStatus,
        operation: &'static str,
    ) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidState {
                id: self.id.clone(),
                status: self.status,
                operation,
            });
        }
        tracing::debug!(
            sandbox_id = %self.id,
            from = %self.status,
            to = %next,
            "Sandbox status changed"
        );
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Owned by `user_id`, or `user_id` is `None` (no filter).
    pub fn belongs_to(&self, user_id: Option<&str>) -> bool {
        match user_id {
            Some(user) => self.user_id.as_deref() == Some(user),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_shape() {
        let id = SandboxId::generate("django__django-11099");
        let s = id.as_str();
        assert!(s.starts_with("django-django-11099-testbed-"), "{s}");
        assert_eq!(s.len(), "django-django-11099-testbed-".len() + 5);
        assert!(s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn test_generate_id_is_unique() {
        let a = SandboxId::generate("instance-1");
        let b = SandboxId::generate("instance-1");
        assert_ne!(a, b);
    }

    #[test]
    fn test_generate_id_truncates_long_refs() {
        let long = "Some_Org__".to_string() + &"x".repeat(120);
        let id = SandboxId::generate(&long);
        assert!(id.as_str().len() <= MAX_ID_LEN);
        assert!(id.as_str().starts_with("some-org-"));
        assert!(!id.as_str().contains("--testbed"));
    }

    #[test]
    fn test_generate_id_for_symbol_only_ref() {
        let id = SandboxId::generate("___");
        assert!(id.as_str().starts_with("sandbox-testbed-"));
    }

    #[test]
    fn test_lifecycle_transitions() {
        use SandboxStatus::*;
        assert!(Requested.can_transition_to(Provisioning));
        assert!(Provisioning.can_transition_to(Ready));
        assert!(Ready.can_transition_to(InUse));
        assert!(InUse.can_transition_to(Ready));
        assert!(Provisioning.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Terminating));
        assert!(Terminating.can_transition_to(Deleted));

        assert!(!Ready.can_transition_to(Provisioning));
        assert!(!Deleted.can_transition_to(Terminating));
        assert!(!Ready.can_transition_to(Failed));
        assert!(!Requested.can_transition_to(Ready));
    }

    #[test]
    fn test_advance_rejects_illegal_move() {
        let mut info = SandboxInfo::new(SandboxId::from("x-testbed-aaaaa"), "x", None);
        assert!(info.advance(SandboxStatus::Ready, "mark ready").is_err());
        info.advance(SandboxStatus::Provisioning, "submit").unwrap();
        assert_eq!(info.status, SandboxStatus::Provisioning);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&SandboxStatus::InUse).unwrap(),
            "\"in_use\""
        );
    }

    #[test]
    fn test_belongs_to() {
        let info = SandboxInfo::new(SandboxId::from("x-testbed-aaaaa"), "x", Some("alice"));
        assert!(info.belongs_to(Some("alice")));
        assert!(!info.belongs_to(Some("bob")));
        assert!(info.belongs_to(None));
    }
}
