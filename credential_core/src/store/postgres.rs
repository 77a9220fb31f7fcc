//! PostgreSQL implementation of [`CredentialStore`].
//!
//! Races are decided inside PostgreSQL: claims and increments are single
//! `UPDATE ... WHERE <still claimable> RETURNING` statements, and the few
//! multi-statement operations run in one transaction. When a conditional
//! update matches nothing, a follow-up read only classifies the failure; it
//! never decides the outcome.
#![allow(clippy::needless_raw_string_hashes)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use super::{Conditional, CredentialStore, Rejection};
use crate::access_code::{AccessCode, CreateMode};
use crate::db::Database;
use crate::email_token::{EmailToken, EmailTokenKind};
use crate::error::CredentialResult;
use crate::tokens::RefreshToken;
use crate::webauthn::{CeremonyKind, WebAuthnCredential, WebAuthnSession};

/// Idempotent DDL for every table this store touches
pub const SCHEMA: &str = include_str!("schema.sql");

const ACCESS_CODE_COLUMNS: &str = "id, code_hash, code_last4, user_id, created_by, clearance_level, scope, \
     issued_at, expires_at, revoked_at, last_used_at, usage_count, max_uses, \
     rotation_interval_hours, next_rotation_at, note";

const REFRESH_TOKEN_COLUMNS: &str = "id, user_id, token_hash, family_id, expires_at, revoked_at, rotated_at, \
     user_agent, ip_address, created_at";

const CREDENTIAL_COLUMNS: &str = "credential_id, user_id, public_key, attestation_type, transport, sign_count, \
     aaguid, last_used_at, clone_suspected_at";

const SESSION_COLUMNS: &str =
    "id, user_id, session_type, challenge, session_data, expires_at, consumed_at, created_at";

/// Credential store backed by a PostgreSQL pool
#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn from_database(db: &Database) -> Self {
        Self::new(db.pool().clone())
    }

    /// Create missing tables and indexes
    pub async fn apply_schema(&self) -> CredentialResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

fn decode_error(message: String) -> sqlx::Error {
    sqlx::Error::Decode(message.into())
}

/// Transaction-scoped advisory lock on `key`, released at commit or rollback
async fn advisory_lock(conn: &mut PgConnection, key: String) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(key)
        .execute(conn)
        .await?;
    Ok(())
}

/// Serializes rotation and revocation of one owner's refresh tokens
async fn lock_refresh_owner(conn: &mut PgConnection, user_id: Uuid) -> Result<(), sqlx::Error> {
    advisory_lock(conn, format!("refresh_tokens:{user_id}")).await
}

fn access_code_from_row(row: &PgRow) -> Result<AccessCode, sqlx::Error> {
    Ok(AccessCode {
        id: row.try_get("id")?,
        code_hash: row.try_get("code_hash")?,
        code_last4: row.try_get("code_last4")?,
        user_id: row.try_get("user_id")?,
        created_by: row.try_get("created_by")?,
        clearance_level: row.try_get("clearance_level")?,
        scope: row.try_get("scope")?,
        issued_at: row.try_get("issued_at")?,
        expires_at: row.try_get("expires_at")?,
        revoked_at: row.try_get("revoked_at")?,
        last_used_at: row.try_get("last_used_at")?,
        usage_count: row.try_get("usage_count")?,
        max_uses: row.try_get("max_uses")?,
        rotation_interval_hours: row.try_get("rotation_interval_hours")?,
        next_rotation_at: row.try_get("next_rotation_at")?,
        note: row.try_get("note")?,
    })
}

fn refresh_token_from_row(row: &PgRow) -> Result<RefreshToken, sqlx::Error> {
    let ip_address: Option<String> = row.try_get("ip_address")?;
    Ok(RefreshToken {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        token_hash: row.try_get("token_hash")?,
        family_id: row.try_get("family_id")?,
        expires_at: row.try_get("expires_at")?,
        revoked_at: row.try_get("revoked_at")?,
        rotated_at: row.try_get("rotated_at")?,
        user_agent: row.try_get("user_agent")?,
        ip_address: ip_address.and_then(|ip| ip.parse().ok()),
        created_at: row.try_get("created_at")?,
    })
}

fn sign_count_from_row(row: &PgRow) -> Result<u32, sqlx::Error> {
    let raw: i64 = row.try_get("sign_count")?;
    u32::try_from(raw).map_err(|_| decode_error(format!("sign_count out of range: {raw}")))
}

fn credential_from_row(row: &PgRow) -> Result<WebAuthnCredential, sqlx::Error> {
    Ok(WebAuthnCredential {
        user_id: row.try_get("user_id")?,
        credential_id: row.try_get("credential_id")?,
        public_key: row.try_get("public_key")?,
        attestation_type: row.try_get("attestation_type")?,
        transports: row.try_get("transport")?,
        sign_count: sign_count_from_row(row)?,
        aaguid: row.try_get("aaguid")?,
        last_used_at: row.try_get("last_used_at")?,
        clone_suspected_at: row.try_get("clone_suspected_at")?,
    })
}

fn session_from_row(row: &PgRow) -> Result<WebAuthnSession, sqlx::Error> {
    let session_type: String = row.try_get("session_type")?;
    Ok(WebAuthnSession {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        session_type: session_type.parse().map_err(decode_error)?,
        challenge: row.try_get("challenge")?,
        session_data: row.try_get("session_data")?,
        expires_at: row.try_get("expires_at")?,
        consumed_at: row.try_get("consumed_at")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Decode every row, skipping (and logging) the ones that fail
fn decode_rows<T>(
    rows: &[PgRow],
    what: &str,
    decode: impl Fn(&PgRow) -> Result<T, sqlx::Error>,
) -> Vec<T> {
    rows.iter()
        .filter_map(|row| match decode(row) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "skipping undecodable {what} row");
                None
            }
        })
        .collect()
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn insert_access_code(
        &self,
        code: &AccessCode,
        mode: CreateMode,
    ) -> CredentialResult<Conditional<()>> {
        let mut tx = self.pool.begin().await?;

        if let Some(user_id) = code.user_id {
            // Serializes issuance per subject
            advisory_lock(&mut *tx, format!("access_codes:{user_id}")).await?;

            match mode {
                CreateMode::RejectIfActive => {
                    let active = sqlx::query(
                        r#"
                        SELECT 1 FROM access_codes
                        WHERE user_id = $1 AND revoked_at IS NULL AND expires_at > NOW()
                        LIMIT 1
                        "#,
                    )
                    .bind(user_id)
                    .fetch_optional(&mut *tx)
                    .await?;

                    if active.is_some() {
                        return Ok(Conditional::Rejected(Rejection::ActiveExists));
                    }
                }
                CreateMode::ReplaceActive => {
                    sqlx::query(
                        "UPDATE access_codes SET revoked_at = NOW() WHERE user_id = $1 AND revoked_at IS NULL",
                    )
                    .bind(user_id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        sqlx::query(&format!(
            "INSERT INTO access_codes ({ACCESS_CODE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"
        ))
        .bind(code.id)
        .bind(&code.code_hash)
        .bind(&code.code_last4)
        .bind(code.user_id)
        .bind(code.created_by)
        .bind(&code.clearance_level)
        .bind(&code.scope)
        .bind(code.issued_at)
        .bind(code.expires_at)
        .bind(code.revoked_at)
        .bind(code.last_used_at)
        .bind(code.usage_count)
        .bind(code.max_uses)
        .bind(code.rotation_interval_hours)
        .bind(code.next_rotation_at)
        .bind(&code.note)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Conditional::Applied(()))
    }

    async fn active_access_code_for_user(
        &self,
        user_id: Uuid,
    ) -> CredentialResult<Option<AccessCode>> {
        let row = sqlx::query(&format!(
            "SELECT {ACCESS_CODE_COLUMNS} FROM access_codes \
             WHERE user_id = $1 AND revoked_at IS NULL AND expires_at > NOW() \
             ORDER BY issued_at DESC LIMIT 1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(access_code_from_row).transpose()?)
    }

    async fn access_code_by_hash(&self, code_hash: &str) -> CredentialResult<Option<AccessCode>> {
        let row = sqlx::query(&format!(
            "SELECT {ACCESS_CODE_COLUMNS} FROM access_codes WHERE code_hash = $1 LIMIT 1"
        ))
        .bind(code_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(access_code_from_row).transpose()?)
    }

    async fn increment_access_code_usage(
        &self,
        id: Uuid,
    ) -> CredentialResult<Conditional<AccessCode>> {
        let row = sqlx::query(&format!(
            "UPDATE access_codes \
             SET usage_count = usage_count + 1, last_used_at = NOW() \
             WHERE id = $1 AND (max_uses IS NULL OR usage_count < max_uses) \
             RETURNING {ACCESS_CODE_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(Conditional::Applied(access_code_from_row(&row)?));
        }

        let exists = sqlx::query("SELECT 1 FROM access_codes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(Conditional::Rejected(if exists.is_some() {
            Rejection::Exhausted
        } else {
            Rejection::Missing
        }))
    }

    async fn claim_access_code_use(&self, id: Uuid) -> CredentialResult<Conditional<AccessCode>> {
        let row = sqlx::query(&format!(
            "UPDATE access_codes \
             SET usage_count = usage_count + 1, last_used_at = NOW() \
             WHERE id = $1 AND revoked_at IS NULL AND expires_at > NOW() \
               AND (max_uses IS NULL OR usage_count < max_uses) \
             RETURNING {ACCESS_CODE_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(Conditional::Applied(access_code_from_row(&row)?));
        }

        let current = sqlx::query(
            r#"
            SELECT revoked_at IS NOT NULL AS revoked, expires_at <= NOW() AS expired
            FROM access_codes
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let rejection = match current {
            None => Rejection::Missing,
            Some(row) => {
                let revoked: bool = row.try_get("revoked")?;
                let expired: bool = row.try_get("expired")?;
                if revoked {
                    Rejection::Revoked
                } else if expired {
                    Rejection::Expired
                } else {
                    Rejection::Exhausted
                }
            }
        };
        Ok(Conditional::Rejected(rejection))
    }

    async fn revoke_access_code(&self, id: Uuid) -> CredentialResult<bool> {
        let result = sqlx::query(
            "UPDATE access_codes SET revoked_at = COALESCE(revoked_at, NOW()) WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_access_codes_for_user(&self, user_id: Uuid) -> CredentialResult<u64> {
        let result = sqlx::query(
            "UPDATE access_codes SET revoked_at = NOW() WHERE user_id = $1 AND revoked_at IS NULL",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn access_codes_due_for_rotation(&self) -> CredentialResult<Vec<AccessCode>> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCESS_CODE_COLUMNS} FROM access_codes \
             WHERE revoked_at IS NULL AND next_rotation_at <= NOW()"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(decode_rows(&rows, "access code", access_code_from_row))
    }

    async fn claim_due_rotation(&self, id: Uuid, until: DateTime<Utc>) -> CredentialResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE access_codes
            SET next_rotation_at = $2
            WHERE id = $1 AND revoked_at IS NULL AND next_rotation_at <= NOW()
            "#,
        )
        .bind(id)
        .bind(until)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn active_access_code_user_ids(&self) -> CredentialResult<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT user_id
            FROM access_codes
            WHERE user_id IS NOT NULL AND revoked_at IS NULL AND expires_at > NOW()
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(decode_rows(&rows, "access code subject", |row| {
            row.try_get("user_id")
        }))
    }

    async fn set_next_rotation(&self, id: Uuid, next: DateTime<Utc>) -> CredentialResult<bool> {
        let result = sqlx::query("UPDATE access_codes SET next_rotation_at = $2 WHERE id = $1")
            .bind(id)
            .bind(next)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_access_codes(&self, limit: i64) -> CredentialResult<Vec<AccessCode>> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCESS_CODE_COLUMNS} FROM access_codes ORDER BY issued_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(decode_rows(&rows, "access code", access_code_from_row))
    }

    async fn insert_token_revocation(
        &self,
        token_id: Uuid,
        user_id: Uuid,
    ) -> CredentialResult<()> {
        sqlx::query(
            r#"
            INSERT INTO auth_token_revocations (token_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT (token_id) DO NOTHING
            "#,
        )
        .bind(token_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_token_revoked(&self, token_id: Uuid) -> CredentialResult<bool> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM auth_token_revocations WHERE token_id = $1) AS revoked",
        )
        .bind(token_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("revoked")?)
    }

    async fn insert_refresh_token(&self, token: &RefreshToken) -> CredentialResult<()> {
        sqlx::query(&format!(
            "INSERT INTO auth_refresh_tokens ({REFRESH_TOKEN_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        ))
        .bind(token.id)
        .bind(token.user_id)
        .bind(&token.token_hash)
        .bind(token.family_id)
        .bind(token.expires_at)
        .bind(token.revoked_at)
        .bind(token.rotated_at)
        .bind(&token.user_agent)
        .bind(token.ip_address.map(|ip| ip.to_string()))
        .bind(token.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn refresh_token_by_hash(
        &self,
        token_hash: &str,
    ) -> CredentialResult<Option<RefreshToken>> {
        let row = sqlx::query(&format!(
            "SELECT {REFRESH_TOKEN_COLUMNS} FROM auth_refresh_tokens WHERE token_hash = $1"
        ))
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(refresh_token_from_row).transpose()?)
    }

    async fn revoke_refresh_token(&self, token_hash: &str) -> CredentialResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE auth_refresh_tokens
            SET revoked_at = NOW()
            WHERE token_hash = $1 AND revoked_at IS NULL
            "#,
        )
        .bind(token_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn rotate_refresh_token(
        &self,
        presented_hash: &str,
        successor: &RefreshToken,
    ) -> CredentialResult<Conditional<RefreshToken>> {
        let mut tx = self.pool.begin().await?;

        let owner = sqlx::query("SELECT user_id FROM auth_refresh_tokens WHERE token_hash = $1")
            .bind(presented_hash)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(owner) = owner else {
            return Ok(Conditional::Rejected(Rejection::Missing));
        };
        // A family revocation committed while waiting here is seen by the update below
        lock_refresh_owner(&mut *tx, owner.try_get("user_id")?).await?;

        let retired = sqlx::query(&format!(
            "UPDATE auth_refresh_tokens \
             SET revoked_at = NOW(), rotated_at = NOW() \
             WHERE token_hash = $1 AND revoked_at IS NULL AND expires_at > NOW() \
             RETURNING {REFRESH_TOKEN_COLUMNS}"
        ))
        .bind(presented_hash)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(retired) = retired else {
            let current = sqlx::query(&format!(
                "SELECT {REFRESH_TOKEN_COLUMNS} FROM auth_refresh_tokens WHERE token_hash = $1"
            ))
            .bind(presented_hash)
            .fetch_optional(&mut *tx)
            .await?;

            let rejection = match current.as_ref().map(refresh_token_from_row).transpose()? {
                None => Rejection::Missing,
                Some(token) if token.rotated_at.is_some() => Rejection::Replayed {
                    family_id: token.family_id,
                    user_id: token.user_id,
                },
                Some(token) if token.revoked_at.is_some() => Rejection::Revoked,
                Some(_) => Rejection::Expired,
            };
            return Ok(Conditional::Rejected(rejection));
        };
        let retired = refresh_token_from_row(&retired)?;

        sqlx::query(&format!(
            "INSERT INTO auth_refresh_tokens ({REFRESH_TOKEN_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, NULL, NULL, $6, $7, $8)"
        ))
        .bind(successor.id)
        .bind(retired.user_id)
        .bind(&successor.token_hash)
        .bind(retired.family_id)
        .bind(successor.expires_at)
        .bind(&successor.user_agent)
        .bind(successor.ip_address.map(|ip| ip.to_string()))
        .bind(successor.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Conditional::Applied(retired))
    }

    async fn revoke_refresh_family(&self, family_id: Uuid) -> CredentialResult<u64> {
        let mut tx = self.pool.begin().await?;

        let owner =
            sqlx::query("SELECT user_id FROM auth_refresh_tokens WHERE family_id = $1 LIMIT 1")
                .bind(family_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(owner) = owner else {
            return Ok(0);
        };
        // Waits out any in-flight rotation so its successor is revoked too
        lock_refresh_owner(&mut *tx, owner.try_get("user_id")?).await?;

        let result = sqlx::query(
            "UPDATE auth_refresh_tokens SET revoked_at = NOW() WHERE family_id = $1 AND revoked_at IS NULL",
        )
        .bind(family_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn revoke_refresh_tokens_for_user(&self, user_id: Uuid) -> CredentialResult<u64> {
        let mut tx = self.pool.begin().await?;
        lock_refresh_owner(&mut *tx, user_id).await?;

        let result = sqlx::query(
            "UPDATE auth_refresh_tokens SET revoked_at = NOW() WHERE user_id = $1 AND revoked_at IS NULL",
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn insert_email_token(
        &self,
        kind: EmailTokenKind,
        token: &EmailToken,
    ) -> CredentialResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (user_id, token, expires_at, used_at, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
            kind.table()
        ))
        .bind(token.user_id)
        .bind(&token.token)
        .bind(token.expires_at)
        .bind(token.used_at)
        .bind(token.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_email_token(
        &self,
        kind: EmailTokenKind,
        token: &str,
    ) -> CredentialResult<Conditional<Uuid>> {
        let claimed = sqlx::query(&format!(
            "UPDATE {} SET used_at = NOW() \
             WHERE token = $1 AND used_at IS NULL AND expires_at > NOW() \
             RETURNING user_id",
            kind.table()
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = claimed {
            return Ok(Conditional::Applied(row.try_get("user_id")?));
        }

        let current = sqlx::query(&format!(
            "SELECT used_at FROM {} WHERE token = $1",
            kind.table()
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        let rejection = match current {
            None => Rejection::Missing,
            Some(row) => {
                let used_at: Option<DateTime<Utc>> = row.try_get("used_at")?;
                if used_at.is_some() {
                    Rejection::AlreadyUsed
                } else {
                    Rejection::Expired
                }
            }
        };
        Ok(Conditional::Rejected(rejection))
    }

    async fn insert_webauthn_session(&self, session: &WebAuthnSession) -> CredentialResult<()> {
        sqlx::query(&format!(
            "INSERT INTO webauthn_sessions ({SESSION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        ))
        .bind(session.id)
        .bind(session.user_id)
        .bind(session.session_type.as_str())
        .bind(&session.challenge)
        .bind(&session.session_data)
        .bind(session.expires_at)
        .bind(session.consumed_at)
        .bind(session.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_webauthn_session(
        &self,
        user_id: Uuid,
        kind: CeremonyKind,
    ) -> CredentialResult<Option<WebAuthnSession>> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM webauthn_sessions \
             WHERE user_id = $1 AND session_type = $2 \
               AND consumed_at IS NULL AND expires_at > NOW() \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(user_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(session_from_row).transpose()?)
    }

    async fn consume_webauthn_session(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        kind: CeremonyKind,
    ) -> CredentialResult<Conditional<WebAuthnSession>> {
        let consumed = sqlx::query(&format!(
            "UPDATE webauthn_sessions SET consumed_at = NOW() \
             WHERE id = $1 AND user_id = $2 AND session_type = $3 \
               AND consumed_at IS NULL AND expires_at > NOW() \
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(session_id)
        .bind(user_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = consumed {
            return Ok(Conditional::Applied(session_from_row(&row)?));
        }

        let current = sqlx::query(
            r#"
            SELECT consumed_at FROM webauthn_sessions
            WHERE id = $1 AND user_id = $2 AND session_type = $3
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let rejection = match current {
            None => Rejection::Missing,
            Some(row) => {
                let consumed_at: Option<DateTime<Utc>> = row.try_get("consumed_at")?;
                if consumed_at.is_some() {
                    Rejection::AlreadyUsed
                } else {
                    Rejection::Expired
                }
            }
        };
        Ok(Conditional::Rejected(rejection))
    }

    async fn upsert_webauthn_credential(
        &self,
        credential: &WebAuthnCredential,
    ) -> CredentialResult<Conditional<WebAuthnCredential>> {
        let row = sqlx::query(&format!(
            "INSERT INTO webauthn_credentials \
                (credential_id, user_id, public_key, attestation_type, transport, sign_count, aaguid, last_used_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, NOW()) \
             ON CONFLICT (credential_id) DO UPDATE SET \
                public_key = EXCLUDED.public_key, \
                attestation_type = EXCLUDED.attestation_type, \
                transport = EXCLUDED.transport, \
                sign_count = GREATEST(webauthn_credentials.sign_count, EXCLUDED.sign_count), \
                aaguid = EXCLUDED.aaguid, \
                last_used_at = NOW() \
             WHERE webauthn_credentials.user_id = EXCLUDED.user_id \
             RETURNING {CREDENTIAL_COLUMNS}"
        ))
        .bind(&credential.credential_id)
        .bind(credential.user_id)
        .bind(&credential.public_key)
        .bind(&credential.attestation_type)
        .bind(&credential.transports)
        .bind(i64::from(credential.sign_count))
        .bind(&credential.aaguid)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Conditional::Applied(credential_from_row(&row)?)),
            None => Ok(Conditional::Rejected(Rejection::OwnedByOther)),
        }
    }

    async fn webauthn_credentials_for_user(
        &self,
        user_id: Uuid,
    ) -> CredentialResult<Vec<WebAuthnCredential>> {
        let rows = sqlx::query(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM webauthn_credentials WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(decode_rows(&rows, "webauthn credential", credential_from_row))
    }

    async fn advance_sign_count(
        &self,
        user_id: Uuid,
        credential_id: &[u8],
        sign_count: u32,
    ) -> CredentialResult<Conditional<WebAuthnCredential>> {
        let row = sqlx::query(&format!(
            "UPDATE webauthn_credentials SET sign_count = $3, last_used_at = NOW() \
             WHERE credential_id = $1 AND user_id = $2 AND sign_count < $3 \
             RETURNING {CREDENTIAL_COLUMNS}"
        ))
        .bind(credential_id)
        .bind(user_id)
        .bind(i64::from(sign_count))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(Conditional::Applied(credential_from_row(&row)?));
        }

        let current = sqlx::query(
            "SELECT sign_count FROM webauthn_credentials WHERE credential_id = $1 AND user_id = $2",
        )
        .bind(credential_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match current {
            None => Ok(Conditional::Rejected(Rejection::Missing)),
            Some(row) => Ok(Conditional::Rejected(Rejection::Regressed {
                stored: sign_count_from_row(&row)?,
            })),
        }
    }

    async fn flag_cloned_credential(&self, credential_id: &[u8]) -> CredentialResult<bool> {
        let result = sqlx::query(
            "UPDATE webauthn_credentials SET clone_suspected_at = NOW() WHERE credential_id = $1",
        )
        .bind(credential_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
