//! Access code rotation sweep.
//!
//! A sweep re-issues every code whose `next_rotation_at` has passed. Codes
//! bound to a user are replaced (old revoked, new inserted, atomically) and
//! the new plaintext is handed to a [`RotationNotifier`]. Codes without a
//! subject have nobody to deliver a new secret to, so only their schedule is
//! advanced.
//!
//! Several sweepers may run against one store. Each due row is claimed with
//! a conditional schedule update before it is re-issued, so a row is rotated
//! by at most one of them.

use crate::access_code::{AccessCodeManager, AccessCodeRequest, UserRotation};
use crate::error::CredentialResult;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use uuid::Uuid;

/// A code replaced by a sweep or a bulk rotation
#[derive(Debug, Clone, Serialize)]
pub struct RotatedCode {
    pub user_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_code_id: Option<Uuid>,
    pub code_id: Uuid,
    /// New plaintext code, for delivery to the user
    pub code: String,
    pub clearance_level: String,
    pub scope: String,
    pub expires_at: DateTime<Utc>,
}

impl From<UserRotation> for RotatedCode {
    fn from(rotation: UserRotation) -> Self {
        let record = rotation.issued.record;
        Self {
            user_id: rotation.user_id,
            previous_code_id: rotation.previous_code_id,
            code_id: record.id,
            code: rotation.issued.code,
            clearance_level: record.clearance_level,
            scope: record.scope,
            expires_at: record.expires_at,
        }
    }
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub rotated: Vec<RotatedCode>,
    /// Subject-less codes whose schedule was pushed forward
    pub rescheduled: usize,
    pub failed: usize,
}

/// Receives every rotated code, typically to e-mail it to the user
#[async_trait]
pub trait RotationNotifier: Send + Sync {
    async fn notify(&self, rotation: &RotatedCode);
}

/// Notifier that only logs; the plaintext code is never logged
pub struct LogNotifier;

#[async_trait]
impl RotationNotifier for LogNotifier {
    async fn notify(&self, rotation: &RotatedCode) {
        tracing::info!(
            user_id = %rotation.user_id,
            code_id = %rotation.code_id,
            expires_at = %rotation.expires_at,
            "Access code rotated"
        );
    }
}

/// Periodic access code rotation
pub struct RotationSweep {
    access_codes: AccessCodeManager,
    notifier: Arc<dyn RotationNotifier>,
    check_interval: StdDuration,
}

impl RotationSweep {
    pub fn new(
        access_codes: AccessCodeManager,
        notifier: Arc<dyn RotationNotifier>,
        check_interval: StdDuration,
    ) -> Self {
        Self {
            access_codes,
            notifier,
            check_interval,
        }
    }

    /// Rotate everything currently due
    ///
    /// Failures on individual codes are logged and counted; only a failure to
    /// list the due codes fails the sweep.
    pub async fn run_once(&self) -> CredentialResult<SweepReport> {
        let due = self.access_codes.list_rotation_due().await?;
        let now = Utc::now();
        let lease_until =
            now + Duration::from_std(self.check_interval).unwrap_or_else(|_| Duration::minutes(15));
        let mut report = SweepReport::default();
        let mut seen_users = HashSet::new();

        for code in due {
            let Some(user_id) = code.user_id else {
                let next = now + Duration::hours(i64::from(code.rotation_interval_hours.max(1)));
                match self.access_codes.claim_rotation(code.id, next).await {
                    Ok(true) => report.rescheduled += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(code_id = %code.id, error = %e, "Failed to reschedule access code");
                        report.failed += 1;
                    }
                }
                continue;
            };

            // One replacement per user covers all of that user's due rows
            if !seen_users.insert(user_id) {
                continue;
            }

            // Unless re-issued below, the row becomes due again once the lease ends
            match self.access_codes.claim_rotation(code.id, lease_until).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(code_id = %code.id, "Access code already claimed for rotation");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(code_id = %code.id, error = %e, "Failed to claim access code for rotation");
                    report.failed += 1;
                    continue;
                }
            }

            match self
                .access_codes
                .replace_for_user(AccessCodeRequest::reissue_of(&code))
                .await
            {
                Ok(issued) => {
                    let rotation = RotatedCode::from(UserRotation {
                        user_id,
                        previous_code_id: Some(code.id),
                        issued,
                    });
                    self.notifier.notify(&rotation).await;
                    report.rotated.push(rotation);
                }
                Err(e) => {
                    tracing::warn!(code_id = %code.id, user_id = %user_id, error = %e, "Failed to rotate access code");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Rotate the code of every subject holding an active one, due or not
    ///
    /// Each new code goes to the notifier exactly like a scheduled rotation.
    pub async fn rotate_all_active(
        &self,
        created_by: Option<Uuid>,
    ) -> CredentialResult<SweepReport> {
        let outcome = self.access_codes.rotate_all_active(created_by).await?;
        let mut report = SweepReport {
            failed: outcome.failed,
            ..SweepReport::default()
        };

        for rotation in outcome.rotated {
            let rotation = RotatedCode::from(rotation);
            self.notifier.notify(&rotation).await;
            report.rotated.push(rotation);
        }
        Ok(report)
    }

    /// Sweep on every tick until `shutdown` turns true or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval = ?self.check_interval, "Rotation sweep starting");

        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(report) if report.rotated.is_empty() && report.failed == 0 => {}
                        Ok(report) => tracing::info!(
                            rotated = report.rotated.len(),
                            rescheduled = report.rescheduled,
                            failed = report.failed,
                            "Rotation sweep finished"
                        ),
                        Err(e) => tracing::error!(error = %e, "Rotation sweep failed"),
                    }
                }

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Rotation sweep stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::store::MemoryCredentialStore;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<RotatedCode>>);

    #[async_trait]
    impl RotationNotifier for Collect {
        async fn notify(&self, rotation: &RotatedCode) {
            self.0.lock().await.push(rotation.clone());
        }
    }

    fn manager() -> AccessCodeManager {
        AccessCodeManager::new(
            Arc::new(MemoryCredentialStore::new()),
            &CoreConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_sweep_replaces_due_codes() {
        let manager = manager();
        let user_id = Uuid::new_v4();
        let issued = manager
            .create(AccessCodeRequest::for_user(user_id))
            .await
            .unwrap();
        manager
            .update_rotation(issued.record.id, Utc::now() - Duration::minutes(1))
            .await
            .unwrap();

        let notifier = Arc::new(Collect::default());
        let sweep = RotationSweep::new(manager.clone(), notifier.clone(), StdDuration::from_secs(60));
        let report = sweep.run_once().await.unwrap();

        assert_eq!(report.rotated.len(), 1);
        assert_eq!(report.rotated[0].previous_code_id, Some(issued.record.id));
        assert_eq!(notifier.0.lock().await.len(), 1);

        let active = manager.get_active_for_user(user_id).await.unwrap();
        assert_eq!(active.id, report.rotated[0].code_id);
        assert!(manager.list_rotation_due().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_reschedules_subjectless_codes() {
        let manager = manager();
        let issued = manager.create(AccessCodeRequest::default()).await.unwrap();
        manager
            .update_rotation(issued.record.id, Utc::now() - Duration::minutes(1))
            .await
            .unwrap();

        let sweep = RotationSweep::new(manager.clone(), Arc::new(LogNotifier), StdDuration::from_secs(60));
        let report = sweep.run_once().await.unwrap();

        assert!(report.rotated.is_empty());
        assert_eq!(report.rescheduled, 1);
        assert!(manager.list_rotation_due().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_sweeps_rotate_each_code_once() {
        let manager = manager();
        let users: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        for user_id in &users {
            let issued = manager
                .create(AccessCodeRequest::for_user(*user_id))
                .await
                .unwrap();
            manager
                .update_rotation(issued.record.id, Utc::now() - Duration::minutes(1))
                .await
                .unwrap();
        }

        let notifier = Arc::new(Collect::default());
        let first = RotationSweep::new(manager.clone(), notifier.clone(), StdDuration::from_secs(60));
        let second = RotationSweep::new(manager.clone(), notifier.clone(), StdDuration::from_secs(60));
        let (a, b) = tokio::join!(first.run_once(), second.run_once());
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.rotated.len() + b.rotated.len(), users.len());
        assert_eq!(notifier.0.lock().await.len(), users.len());
        for user_id in &users {
            let active = manager.get_active_for_user(*user_id).await.unwrap();
            assert!(notifier.0.lock().await.iter().any(|r| r.code_id == active.id));
        }
    }

    #[tokio::test]
    async fn test_rotate_all_active_notifies_each_subject() {
        let manager = manager();
        let user_id = Uuid::new_v4();
        let issued = manager
            .create(AccessCodeRequest::for_user(user_id))
            .await
            .unwrap();

        let notifier = Arc::new(Collect::default());
        let sweep = RotationSweep::new(manager.clone(), notifier.clone(), StdDuration::from_secs(60));
        let report = sweep.rotate_all_active(None).await.unwrap();

        assert_eq!(report.rotated.len(), 1);
        assert_eq!(report.rotated[0].previous_code_id, Some(issued.record.id));
        let delivered = notifier.0.lock().await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].code, report.rotated[0].code);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let sweep = RotationSweep::new(manager(), Arc::new(LogNotifier), StdDuration::from_millis(10));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(sweep.run(rx));

        tokio::time::sleep(StdDuration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(StdDuration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
