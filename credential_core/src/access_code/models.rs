//! Access code data models.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default clearance level for newly issued codes
pub const DEFAULT_CLEARANCE: &str = "civilian";

/// Default scope for newly issued codes
pub const DEFAULT_SCOPE: &str = "portal";

/// Scope value that satisfies any requested scope
pub const WILDCARD_SCOPE: &str = "all";

/// Stored access code. The plaintext code is never part of this record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessCode {
    pub id: Uuid,
    pub code_hash: String,
    pub code_last4: String,
    pub user_id: Option<Uuid>,
    pub created_by: Option<Uuid>,
    pub clearance_level: String,
    pub scope: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub usage_count: i32,
    pub max_uses: Option<i32>,
    pub rotation_interval_hours: i32,
    pub next_rotation_at: DateTime<Utc>,
    pub note: Option<String>,
}

impl AccessCode {
    /// Not revoked and not yet expired at `now`
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at > now
    }

    /// Usage cap reached
    pub fn is_exhausted(&self) -> bool {
        self.max_uses.is_some_and(|max| self.usage_count >= max)
    }

    /// Scheduled rotation time has passed and the code is still live
    pub fn is_rotation_due(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.next_rotation_at <= now
    }

    /// Whether this code grants `requested` scope; `all` grants everything
    pub fn allows_scope(&self, requested: &str) -> bool {
        requested.is_empty()
            || self.scope.eq_ignore_ascii_case(WILDCARD_SCOPE)
            || self.scope.eq_ignore_ascii_case(requested)
    }
}

/// Parameters for issuing a new access code
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessCodeRequest {
    pub user_id: Option<Uuid>,
    pub created_by: Option<Uuid>,
    pub clearance_level: Option<String>,
    pub scope: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_uses: Option<i32>,
    pub rotation_interval_hours: Option<i32>,
    pub note: Option<String>,
}

impl AccessCodeRequest {
    /// Request for `user_id` with every other field defaulted
    pub fn for_user(user_id: Uuid) -> Self {
        Self {
            user_id: Some(user_id),
            ..Self::default()
        }
    }

    /// Expire the code `hours` from now; non-positive values keep the default lifetime
    pub fn expiring_in_hours(self, hours: i64) -> Self {
        Self {
            expires_at: (hours > 0).then(|| Utc::now() + Duration::hours(hours)),
            ..self
        }
    }

    /// Request that re-issues `previous` with the same attributes
    pub fn reissue_of(previous: &AccessCode) -> Self {
        Self {
            user_id: previous.user_id,
            created_by: previous.created_by,
            clearance_level: Some(previous.clearance_level.clone()),
            scope: Some(previous.scope.clone()),
            expires_at: None,
            max_uses: previous.max_uses,
            rotation_interval_hours: Some(previous.rotation_interval_hours),
            note: previous.note.clone(),
        }
    }

    /// Build the stored record for this request around freshly generated code material
    ///
    /// Blank strings are treated as absent, clearance and scope are
    /// lower-cased, and a non-positive `max_uses` means unlimited.
    pub(crate) fn into_record(
        self,
        code_hash: String,
        code_last4: String,
        default_rotation_hours: i32,
        now: DateTime<Utc>,
    ) -> AccessCode {
        let rotation_interval_hours = self
            .rotation_interval_hours
            .filter(|h| *h > 0)
            .unwrap_or(default_rotation_hours);
        let rotation = Duration::hours(i64::from(rotation_interval_hours));

        AccessCode {
            id: Uuid::new_v4(),
            code_hash,
            code_last4,
            user_id: self.user_id,
            created_by: self.created_by,
            clearance_level: normalized_or(self.clearance_level, DEFAULT_CLEARANCE),
            scope: normalized_or(self.scope, DEFAULT_SCOPE),
            issued_at: now,
            expires_at: self.expires_at.unwrap_or(now + rotation),
            revoked_at: None,
            last_used_at: None,
            usage_count: 0,
            max_uses: self.max_uses.filter(|m| *m > 0),
            rotation_interval_hours,
            next_rotation_at: now + rotation,
            note: self
                .note
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
        }
    }
}

fn normalized_or(value: Option<String>, default: &str) -> String {
    value
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// A freshly issued code. `code` is the only copy of the plaintext.
#[derive(Debug, Clone)]
pub struct IssuedAccessCode {
    pub code: String,
    pub record: AccessCode,
}

/// What to do when the subject already holds an active code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Fail with a conflict
    RejectIfActive,
    /// Revoke the active code(s) in the same transaction
    ReplaceActive,
}

/// Target of a revocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessCodeTarget {
    /// A single code by id
    Code(Uuid),
    /// Every non-revoked code of a subject
    User(Uuid),
}

/// One subject's code replaced by a rotation
#[derive(Debug, Clone)]
pub struct UserRotation {
    pub user_id: Uuid,
    /// Active code before the rotation, if the subject had one
    pub previous_code_id: Option<Uuid>,
    pub issued: IssuedAccessCode,
}

/// Outcome of rotating every active subject
#[derive(Debug, Clone, Default)]
pub struct BulkRotation {
    pub rotated: Vec<UserRotation>,
    pub failed: usize,
}
