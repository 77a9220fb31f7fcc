//! Operator CLI for the credential lifecycle core.
//!
//! Applies the schema, issues, lists and rotates access codes (once, in bulk
//! or on a schedule) and performs emergency revocations against the shared
//! PostgreSQL store.

mod config;
mod logging;
mod notify;

use std::sync::Arc;

use anyhow::{Context, Error, bail};
use credential_core::{
    AccessCodeRequest, AccessCodeTarget, CredentialCore, PgCredentialStore, RotationSweep,
    access_code::IssuedAccessCode,
    db::Database,
    error::parse_id,
};
use pico_args::Arguments;
use tokio::sync::watch;
use tracing::info;

use crate::config::CtlConfig;
use crate::notify::JsonLinesNotifier;

const HELP: &str = "\
Manage credential lifecycle state

USAGE:
  credctl [OPTIONS] <COMMAND> [ARGS]

COMMANDS:
  migrate                        Create missing tables and indexes
  issue <USER_ID>                Issue an access code; prints the plaintext once as JSON
  rotate <USER_ID>               Replace a user's code, keeping its attributes
  rotate-all                     Rotate every active code; prints one JSON line per new code
  list                           Print the newest access codes as JSON
  sweep                          Rotate due access codes once; prints one JSON line per new code
  watch                          Rotate due access codes periodically until Ctrl+C
  revoke-code <CODE_ID>          Revoke a single access code
  revoke-user-codes <USER_ID>    Revoke every access code of a user
  revoke-jwt <TOKEN_ID> <USER_ID>
                                 Deny-list a JWT by its jti
  health                         Check database connectivity

OPTIONS:
  --db-url     URL               Database connection string  [default: env DATABASE_URL]

ISSUE OPTIONS:
  --scope              SCOPE     Scope the code is valid for  [default: portal]
  --clearance          LEVEL     Clearance level  [default: civilian]
  --max-uses           N         Use limit; omit for unlimited
  --expires-in-hours   HOURS     Lifetime  [default: one rotation interval]
  --rotation-hours     HOURS     Rotation interval  [default: ACCESS_CODE_ROTATION_HOURS]
  --note               TEXT      Free-form note stored with the code
  --created-by         ID        Issuing operator (issue, rotate, rotate-all)

LIST OPTIONS:
  --limit              N         Number of codes, at most 200  [default: 200]

FLAGS:
  -h, --help                     Print help information

ENVIRONMENT:
  DATABASE_URL                          PostgreSQL connection string
  ACCESS_CODE_ROTATION_HOURS            Default rotation interval [default: 24]
  ACCESS_CODE_ROTATION_CHECK_MINUTES    Interval between sweeps in watch mode [default: 15]
  RUST_LOG                              Log filter [default: info,sqlx=warn]
  (See .env file for all configuration options)
";

enum Command {
    Migrate,
    Issue(AccessCodeRequest),
    Rotate {
        user_id: String,
        created_by: Option<String>,
    },
    RotateAll {
        created_by: Option<String>,
    },
    List {
        limit: i64,
    },
    Sweep,
    Watch,
    RevokeCode(String),
    RevokeUserCodes(String),
    RevokeJwt { token_id: String, user_id: String },
    Health,
}

struct Args {
    database_url: Option<String>,
    command: Command,
}

fn parse_args() -> Result<Args, Error> {
    let mut pargs = Arguments::from_env();

    // Help has a higher priority and should be handled separately.
    if pargs.contains(["-h", "--help"]) {
        print!("{HELP}");
        std::process::exit(0);
    }

    let database_url = pargs.opt_value_from_str("--db-url")?;
    let Some(subcommand) = pargs.subcommand()? else {
        bail!("missing command\n\n{HELP}");
    };

    let command = match subcommand.as_str() {
        "migrate" => Command::Migrate,
        "issue" => Command::Issue(parse_issue_request(&mut pargs)?),
        "rotate" => Command::Rotate {
            created_by: pargs.opt_value_from_str("--created-by")?,
            user_id: pargs.free_from_str()?,
        },
        "rotate-all" => Command::RotateAll {
            created_by: pargs.opt_value_from_str("--created-by")?,
        },
        "list" => Command::List {
            limit: pargs.opt_value_from_str("--limit")?.unwrap_or(200),
        },
        "sweep" => Command::Sweep,
        "watch" => Command::Watch,
        "revoke-code" => Command::RevokeCode(pargs.free_from_str()?),
        "revoke-user-codes" => Command::RevokeUserCodes(pargs.free_from_str()?),
        "revoke-jwt" => Command::RevokeJwt {
            token_id: pargs.free_from_str()?,
            user_id: pargs.free_from_str()?,
        },
        "health" => Command::Health,
        other => bail!("unknown command: {other}\n\n{HELP}"),
    };

    let remaining = pargs.finish();
    if !remaining.is_empty() {
        bail!("unexpected arguments: {remaining:?}");
    }

    Ok(Args {
        database_url,
        command,
    })
}

/// Options are taken before the positional user ID
fn parse_issue_request(pargs: &mut Arguments) -> Result<AccessCodeRequest, Error> {
    let scope = pargs.opt_value_from_str("--scope")?;
    let clearance_level = pargs.opt_value_from_str("--clearance")?;
    let max_uses = pargs.opt_value_from_str("--max-uses")?;
    let expires_in_hours: Option<i64> = pargs.opt_value_from_str("--expires-in-hours")?;
    let rotation_interval_hours = pargs.opt_value_from_str("--rotation-hours")?;
    let note = pargs.opt_value_from_str("--note")?;
    let created_by: Option<String> = pargs.opt_value_from_str("--created-by")?;
    let user_id: String = pargs.free_from_str()?;

    let request = AccessCodeRequest {
        user_id: Some(parse_id("user ID", &user_id)?),
        created_by: created_by
            .map(|raw| parse_id("issuer ID", &raw))
            .transpose()?,
        clearance_level,
        scope,
        max_uses,
        rotation_interval_hours,
        note,
        ..AccessCodeRequest::default()
    };
    Ok(match expires_in_hours {
        Some(hours) => request.expiring_in_hours(hours),
        None => request,
    })
}

fn print_issued(issued: &IssuedAccessCode) -> Result<(), Error> {
    let output = serde_json::json!({
        "code": issued.code,
        "record": issued.record,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Load .env file if it exists
    let _ = dotenvy::dotenv();

    let args = parse_args()?;

    logging::init();

    let config = CtlConfig::from_env(args.database_url)?;
    config.validate()?;

    let db = Database::new(&config.database)
        .await
        .context("Failed to connect to database")?;
    let store = Arc::new(PgCredentialStore::from_database(&db));
    let core = CredentialCore::new(store.clone(), &config.core);

    match args.command {
        Command::Migrate => {
            store.apply_schema().await?;
            info!("Schema applied");
        }

        Command::Issue(request) => {
            let issued = core.create_access_code(request).await?;
            logging::log_security_event(
                "access_code_issued",
                issued.record.user_id,
                &format!("Issued access code {}", issued.record.id),
            );
            print_issued(&issued)?;
        }

        Command::Rotate {
            user_id,
            created_by,
        } => {
            let issued = core
                .rotate_access_code_for_user(&user_id, created_by.as_deref())
                .await?;
            logging::log_security_event(
                "access_code_rotated",
                issued.record.user_id,
                &format!("Rotated to access code {}", issued.record.id),
            );
            print_issued(&issued)?;
        }

        Command::RotateAll { created_by } => {
            let created_by = created_by
                .map(|raw| parse_id("issuer ID", &raw))
                .transpose()?;
            let sweep = RotationSweep::new(
                core.access_codes().clone(),
                Arc::new(JsonLinesNotifier::stdout()),
                config.core.rotation_check_interval,
            );
            let report = sweep.rotate_all_active(created_by).await?;
            logging::log_security_event(
                "access_codes_rotated",
                None,
                &format!(
                    "Rotated {} active access code(s), {} failed",
                    report.rotated.len(),
                    report.failed
                ),
            );
            if report.failed > 0 {
                bail!("{} access code(s) failed to rotate", report.failed);
            }
        }

        Command::List { limit } => {
            let codes = core.list_access_codes(limit).await?;
            println!("{}", serde_json::to_string_pretty(&codes)?);
        }

        Command::Health => {
            db.health_check().await.context("Database health check failed")?;
            info!("Database is healthy");
        }

        Command::Sweep => {
            let sweep = RotationSweep::new(
                core.access_codes().clone(),
                Arc::new(JsonLinesNotifier::stdout()),
                config.core.rotation_check_interval,
            );
            let report = sweep.run_once().await?;
            info!(
                rotated = report.rotated.len(),
                rescheduled = report.rescheduled,
                failed = report.failed,
                "Rotation sweep finished"
            );
            if report.failed > 0 {
                bail!("{} access code(s) failed to rotate", report.failed);
            }
        }

        Command::Watch => {
            let sweep = RotationSweep::new(
                core.access_codes().clone(),
                Arc::new(JsonLinesNotifier::stdout()),
                config.core.rotation_check_interval,
            );

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let handle = tokio::spawn(sweep.run(shutdown_rx));

            tokio::signal::ctrl_c()
                .await
                .context("Failed to install CTRL+C signal handler")?;
            info!("Shutting down rotation sweep...");
            let _ = shutdown_tx.send(true);
            handle.await?;
        }

        Command::RevokeCode(code_id) => {
            let code_id = parse_id("access code ID", &code_id)?;
            core.revoke_access_code(AccessCodeTarget::Code(code_id)).await?;
            logging::log_security_event(
                "access_code_revoked",
                None,
                &format!("Revoked access code {code_id}"),
            );
        }

        Command::RevokeUserCodes(user_id) => {
            let user_id = parse_id("user ID", &user_id)?;
            let revoked = core
                .revoke_access_code(AccessCodeTarget::User(user_id))
                .await?;
            logging::log_security_event(
                "access_codes_revoked",
                Some(user_id),
                &format!("Revoked {revoked} access code(s)"),
            );
        }

        Command::RevokeJwt { token_id, user_id } => {
            core.revoke_jwt(&token_id, &user_id).await?;
            logging::log_security_event(
                "jwt_revoked",
                parse_id("user ID", &user_id).ok(),
                &format!("Deny-listed token {}", token_id.trim()),
            );
        }
    }

    db.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use uuid::Uuid;

    fn args(raw: &[&str]) -> Arguments {
        Arguments::from_vec(raw.iter().map(OsString::from).collect())
    }

    #[test]
    fn test_issue_options_around_user_id() {
        let user_id = Uuid::new_v4().to_string();
        let mut pargs = args(&[
            "--scope",
            "ops",
            &user_id,
            "--max-uses",
            "3",
            "--expires-in-hours",
            "12",
            "--note",
            "contractor",
        ]);

        let request = parse_issue_request(&mut pargs).unwrap();
        assert_eq!(request.user_id.map(|id| id.to_string()), Some(user_id));
        assert_eq!(request.scope.as_deref(), Some("ops"));
        assert_eq!(request.max_uses, Some(3));
        assert_eq!(request.note.as_deref(), Some("contractor"));
        assert!(request.expires_at.is_some());
        assert!(request.clearance_level.is_none());
        assert!(pargs.finish().is_empty());
    }

    #[test]
    fn test_issue_rejects_malformed_ids() {
        assert!(parse_issue_request(&mut args(&["not-a-uuid"])).is_err());
        assert!(parse_issue_request(&mut args(&[])).is_err());

        let user_id = Uuid::new_v4().to_string();
        let mut pargs = args(&["--created-by", "admin", &user_id]);
        assert!(parse_issue_request(&mut pargs).is_err());
    }
}
