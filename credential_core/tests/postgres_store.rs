//! Integration tests for the PostgreSQL credential store.
//!
//! Require a running database: set `DATABASE_URL` and run with
//! `--ignored`. Every test uses fresh random ids, so no cleanup is needed.

use chrono::{Duration, Utc};
use credential_core::access_code::AccessCodeRequest;
use credential_core::db::{Database, DatabaseConfig};
use credential_core::tokens::ClientMeta;
use credential_core::webauthn::NewCredential;
use credential_core::{
    CoreConfig, CredentialCore, CredentialError, EmailTokenKind, PgCredentialStore,
};
use serial_test::serial;
use std::sync::Arc;
use uuid::Uuid;

/// Helper to create a facade over the test database
async fn setup_core() -> CredentialCore {
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://postgres@localhost/credentials_test".to_string());

    let config = DatabaseConfig {
        database_url,
        max_connections: 10,
        min_connections: 1,
        connection_timeout_secs: 5,
        idle_timeout_secs: 300,
        max_lifetime_secs: 1800,
    };

    let db = Database::new(&config)
        .await
        .expect("Failed to create test database");
    let store = PgCredentialStore::from_database(&db);
    store.apply_schema().await.expect("Failed to apply schema");

    CredentialCore::new(Arc::new(store), &CoreConfig::default())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
#[serial]
async fn test_pg_email_token_single_use_under_contention() {
    let core = setup_core().await;
    let user_id = Uuid::new_v4();
    let token = core
        .issue_email_token(EmailTokenKind::Verification, &user_id.to_string())
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let core = core.clone();
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            core.consume_email_token(EmailTokenKind::Verification, &token)
                .await
        }));
    }

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(owner) => {
                assert_eq!(owner, user_id);
                successes += 1;
            }
            Err(e) => assert!(matches!(e, CredentialError::AlreadyUsed), "got {e}"),
        }
    }
    assert_eq!(successes, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
#[serial]
async fn test_pg_one_active_code_per_user() {
    let core = setup_core().await;
    let user_id = Uuid::new_v4();

    let mut handles = Vec::new();
    for _ in 0..6 {
        let core = core.clone();
        handles.push(tokio::spawn(async move {
            core.create_access_code(AccessCodeRequest::for_user(user_id))
                .await
        }));
    }

    let mut created = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            created += 1;
        }
    }
    assert_eq!(created, 1);

    let rotated = core
        .rotate_access_code_for_user(&user_id.to_string(), None)
        .await
        .unwrap();
    let active = core
        .get_active_access_code(&user_id.to_string())
        .await
        .unwrap();
    assert_eq!(active.id, rotated.record.id);
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_pg_max_uses_and_rotation_schedule() {
    let core = setup_core().await;
    let issued = core
        .create_access_code(AccessCodeRequest {
            max_uses: Some(3),
            ..AccessCodeRequest::for_user(Uuid::new_v4())
        })
        .await
        .unwrap();

    for _ in 0..3 {
        core.verify_access_code(&issued.record.code_hash)
            .await
            .unwrap();
    }
    assert!(matches!(
        core.access_codes().mark_used(issued.record.id).await,
        Err(CredentialError::Exhausted)
    ));

    let id = issued.record.id.to_string();
    core.apply_rotation(&id, Utc::now() - Duration::minutes(1))
        .await
        .unwrap();
    let due = core.list_codes_due_for_rotation().await.unwrap();
    assert!(due.iter().any(|c| c.id == issued.record.id));

    core.apply_rotation(&id, Utc::now() + Duration::hours(1))
        .await
        .unwrap();
    let due = core.list_codes_due_for_rotation().await.unwrap();
    assert!(!due.iter().any(|c| c.id == issued.record.id));
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_pg_refresh_rotation_and_replay() {
    let core = setup_core().await;
    let user_id = Uuid::new_v4();
    let (h1, h2) = (
        format!("pg-{}", Uuid::new_v4()),
        format!("pg-{}", Uuid::new_v4()),
    );
    let meta = ClientMeta::new("pg-test", "2001:db8::1".parse().ok());

    core.issue_refresh_token(&user_id.to_string(), &h1, meta.clone())
        .await
        .unwrap();
    let successor = core
        .rotate_refresh_token(&h1, &h2, meta.clone())
        .await
        .unwrap();
    assert_eq!(successor.user_id, user_id);
    assert_eq!(core.resolve_refresh_token(&h2).await.unwrap(), user_id);

    let replay = core
        .rotate_refresh_token(&h1, &format!("pg-{}", Uuid::new_v4()), meta)
        .await;
    assert!(matches!(replay, Err(CredentialError::Revoked)));
    assert!(matches!(
        core.resolve_refresh_token(&h2).await,
        Err(CredentialError::Revoked)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
#[serial]
async fn test_pg_replay_during_rotation_revokes_successor() {
    let core = setup_core().await;

    for _ in 0..20 {
        let user_id = Uuid::new_v4();
        let [a, b, c, stolen] = [(); 4].map(|()| format!("pg-{}", Uuid::new_v4()));

        core.issue_refresh_token(&user_id.to_string(), &a, ClientMeta::default())
            .await
            .unwrap();
        core.rotate_refresh_token(&a, &b, ClientMeta::default())
            .await
            .unwrap();

        // The owner rotates b while a stolen copy of a is replayed
        let legit = {
            let core = core.clone();
            let (b, c) = (b.clone(), c.clone());
            tokio::spawn(async move {
                core.rotate_refresh_token(&b, &c, ClientMeta::default())
                    .await
            })
        };
        let replay = {
            let core = core.clone();
            let a = a.clone();
            tokio::spawn(async move {
                core.rotate_refresh_token(&a, &stolen, ClientMeta::default())
                    .await
            })
        };

        assert!(matches!(
            replay.await.unwrap(),
            Err(CredentialError::Revoked)
        ));
        let _ = legit.await.unwrap();

        for hash in [&b, &c] {
            assert!(
                core.resolve_refresh_token(hash).await.is_err(),
                "family token survived replay"
            );
        }
    }
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_pg_verify_rejects_revoked_and_expired_without_counting() {
    let core = setup_core().await;
    let revoked = core
        .create_access_code(AccessCodeRequest::for_user(Uuid::new_v4()))
        .await
        .unwrap();
    core.access_codes().revoke(revoked.record.id).await.unwrap();
    assert!(matches!(
        core.verify_access_code(&revoked.record.code_hash).await,
        Err(CredentialError::Revoked)
    ));

    let expired = core
        .create_access_code(AccessCodeRequest {
            expires_at: Some(Utc::now() - Duration::minutes(1)),
            ..AccessCodeRequest::for_user(Uuid::new_v4())
        })
        .await
        .unwrap();
    assert!(matches!(
        core.verify_access_code(&expired.record.code_hash).await,
        Err(CredentialError::Expired)
    ));

    for hash in [&revoked.record.code_hash, &expired.record.code_hash] {
        let stored = core.access_codes().get_by_hash(hash).await.unwrap();
        assert_eq!(stored.usage_count, 0);
    }
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_pg_rotation_claim_and_active_subjects() {
    let core = setup_core().await;
    let user_id = Uuid::new_v4();
    let issued = core
        .create_access_code(AccessCodeRequest::for_user(user_id))
        .await
        .unwrap();
    let manager = core.access_codes();

    assert!(manager.active_user_ids().await.unwrap().contains(&user_id));

    let until = Utc::now() + Duration::minutes(15);
    assert!(!manager.claim_rotation(issued.record.id, until).await.unwrap());
    manager
        .update_rotation(issued.record.id, Utc::now() - Duration::minutes(1))
        .await
        .unwrap();
    assert!(manager.claim_rotation(issued.record.id, until).await.unwrap());
    assert!(!manager.claim_rotation(issued.record.id, until).await.unwrap());

    manager.revoke_by_user(user_id).await.unwrap();
    assert!(!manager.active_user_ids().await.unwrap().contains(&user_id));
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_pg_jwt_deny_list() {
    let core = setup_core().await;
    let (token_id, user_id) = (Uuid::new_v4().to_string(), Uuid::new_v4().to_string());

    assert!(!core.is_jwt_revoked(&token_id).await.unwrap());
    core.revoke_jwt(&token_id, &user_id).await.unwrap();
    core.revoke_jwt(&token_id, &user_id).await.unwrap();
    assert!(core.is_jwt_revoked(&token_id).await.unwrap());
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_pg_sign_count_regression() {
    let core = setup_core().await;
    let user_id = Uuid::new_v4();
    let credential_id = Uuid::new_v4().as_bytes().to_vec();

    core.webauthn()
        .upsert_credential(
            user_id,
            NewCredential {
                credential_id: credential_id.clone(),
                public_key: vec![4; 65],
                attestation_type: "none".to_string(),
                transports: vec!["internal".to_string()],
                sign_count: 4,
                aaguid: "00000000000000000000000000000000".to_string(),
            },
        )
        .await
        .unwrap();

    let advanced = core
        .webauthn()
        .record_assertion(user_id, &credential_id, 5)
        .await
        .unwrap();
    assert_eq!(advanced.sign_count, 5);

    assert!(matches!(
        core.webauthn()
            .record_assertion(user_id, &credential_id, 5)
            .await,
        Err(CredentialError::CloneDetected)
    ));

    let stored = core.list_credentials(&user_id.to_string()).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].transports, vec!["internal".to_string()]);
    assert!(stored[0].clone_suspected_at.is_some());
}
