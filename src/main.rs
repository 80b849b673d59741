// Waymark Review - admin CLI
// Drives the review workflow against a local database: grant coins, submit
// contributions, vote, approve/reject, inspect balances and history.

use anyhow::{bail, Result};
use std::env;
use std::sync::{Arc, Mutex};

use waymark_review::{
    open_database, ContributionAction, ContributionStatus, OwnerPatch, ReviewCoordinator,
    ReviewPolicy, SqliteMarkerRegistry, StdoutNotifier, SubmitRequest, VoteTally,
};

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    let db_path = env::var("WAYMARK_DB").unwrap_or_else(|_| "waymark.db".to_string());
    let policy = match env::var("WAYMARK_POLICY") {
        Ok(path) => ReviewPolicy::from_file(&path)?,
        Err(_) => ReviewPolicy::default(),
    };

    let conn = Arc::new(Mutex::new(open_database(&db_path)?));
    let registry = Arc::new(SqliteMarkerRegistry::new(conn.clone()));
    let notifier = Arc::new(StdoutNotifier);
    let coordinator = ReviewCoordinator::new(conn.clone(), registry, notifier, policy);
    let tally = VoteTally::new(conn);

    match args[1].as_str() {
        "init" => {
            // open_database already applied the schema
            println!("✓ Database ready: {}", db_path);
        }
        "grant" => {
            let (user, amount) = parse_user_amount(&args)?;
            let reason = format!("grant:{}", uuid::Uuid::new_v4());
            let balance = coordinator.ledger().credit(&user, amount, &reason)?;
            println!("✓ Granted {} coins to {} (balance: {})", amount, user, balance);
        }
        "balance" => {
            let user = arg(&args, 2, "user id")?;
            let balance = coordinator.ledger().balance(&user)?;
            println!("{}: {} coins", user, balance);
            for entry in coordinator.ledger().entries(&user)? {
                println!(
                    "  {} {} {} -> {} ({})",
                    entry.created_at.format("%Y-%m-%d %H:%M"),
                    entry.kind,
                    entry.amount,
                    entry.balance_after,
                    entry.reason
                );
            }
        }
        "submit" => run_submit(&coordinator, &args)?,
        "approve" => {
            let id = arg(&args, 2, "contribution id")?;
            let reward = args.get(3).map(|s| s.parse::<f64>()).transpose()?;
            let c = coordinator.approve(&id, reward)?;
            println!("✓ Approved {} ({})", c.id, c.action.as_str());
            if let Some(marker_id) = &c.marker_id {
                println!("  marker: {}", marker_id);
            }
        }
        "reject" => {
            let id = arg(&args, 2, "contribution id")?;
            let note = args.get(3).map(|s| s.as_str());
            let c = coordinator.reject(&id, note)?;
            println!("✓ Rejected {}", c.id);
        }
        "retry-sync" => {
            let id = arg(&args, 2, "contribution id")?;
            let c = coordinator.retry_marker_sync(&id)?;
            println!("✓ Marker sync complete for {}", c.id);
        }
        "edit" => {
            let id = arg(&args, 2, "contribution id")?;
            let user = arg(&args, 3, "user id")?;
            let description = args.get(4).cloned();
            let c = coordinator.update_own(
                &id,
                &user,
                &OwnerPatch {
                    description,
                    ..Default::default()
                },
            )?;
            println!("✓ Updated {}", c.id);
        }
        "withdraw" => {
            let id = arg(&args, 2, "contribution id")?;
            let user = arg(&args, 3, "user id")?;
            coordinator.delete_own(&id, &user)?;
            println!("✓ Withdrawn {}", id);
        }
        "vote" => {
            let id = arg(&args, 2, "contribution id")?;
            let user = arg(&args, 3, "user id")?;
            let direction = arg(&args, 4, "up|down")?;
            let is_upvote = match direction.as_str() {
                "up" => true,
                "down" => false,
                other => bail!("Expected 'up' or 'down', got '{}'", other),
            };
            let weight = args
                .get(5)
                .map(|s| s.parse::<f64>())
                .transpose()?
                .unwrap_or(1.0);
            // The contribution must exist before anyone votes on it
            coordinator.get(&id)?;
            let vote = tally.cast(&id, &user, is_upvote, weight)?;
            println!("✓ Vote {} recorded ({} x{})", vote.id, direction, weight);
        }
        "votes" => {
            let id = arg(&args, 2, "contribution id")?;
            let summary = tally.summary(&id)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        "list" => {
            let status = match args.get(2).map(|s| s.as_str()) {
                Some(s) => Some(
                    ContributionStatus::parse(s)
                        .ok_or_else(|| anyhow::anyhow!("Unknown status: {}", s))?,
                ),
                None => None,
            };
            let contributions = coordinator.filter(status, None, None)?;
            println!("{} contribution(s)", contributions.len());
            for c in contributions {
                println!(
                    "  {} [{}] {} by {} {}",
                    c.id,
                    c.status,
                    c.action.as_str(),
                    c.user_id,
                    c.description.as_deref().unwrap_or("-")
                );
            }
        }
        "history" => {
            let id = arg(&args, 2, "contribution id")?;
            for event in coordinator.history(&id)? {
                println!(
                    "  {} {} -> {} by {} {}",
                    event.created_at.format("%Y-%m-%d %H:%M"),
                    event.from_status,
                    event.to_status,
                    event.actor,
                    event.note.as_deref().unwrap_or("")
                );
            }
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn run_submit(coordinator: &ReviewCoordinator, args: &[String]) -> Result<()> {
    let user = arg(args, 2, "user id")?;
    let kind = arg(args, 3, "add|update|delete")?;

    let (action, description) = match kind.as_str() {
        "add" => {
            let marker_type = arg(args, 4, "marker type")?;
            let latitude: f64 = arg(args, 5, "latitude")?.parse()?;
            let longitude: f64 = arg(args, 6, "longitude")?.parse()?;
            (
                ContributionAction::Add {
                    marker_type,
                    latitude,
                    longitude,
                },
                args.get(7).cloned(),
            )
        }
        "update" => {
            let marker_id = arg(args, 4, "marker id")?;
            (
                ContributionAction::Update {
                    marker_id,
                    marker_type: args.get(5).cloned(),
                    latitude: args.get(6).map(|s| s.parse()).transpose()?,
                    longitude: args.get(7).map(|s| s.parse()).transpose()?,
                },
                args.get(8).cloned(),
            )
        }
        "delete" => {
            let marker_id = arg(args, 4, "marker id")?;
            (ContributionAction::Delete { marker_id }, args.get(5).cloned())
        }
        other => bail!("Expected add|update|delete, got '{}'", other),
    };

    let contribution = coordinator.submit(
        &user,
        SubmitRequest {
            action,
            description,
            image_url: None,
        },
    )?;

    println!(
        "✓ Submitted {} ({} by {}, cost {} coins)",
        contribution.id,
        contribution.action.as_str(),
        contribution.user_id,
        coordinator.policy().submission_cost
    );
    Ok(())
}

fn arg(args: &[String], index: usize, name: &str) -> Result<String> {
    args.get(index)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("Missing argument: {}", name))
}

fn parse_user_amount(args: &[String]) -> Result<(String, f64)> {
    let user = arg(args, 2, "user id")?;
    let amount: f64 = arg(args, 3, "amount")?.parse()?;
    Ok((user, amount))
}

fn print_usage() {
    println!("Waymark Review v{}", waymark_review::VERSION);
    println!();
    println!("Usage: waymark-review <command> [args]");
    println!();
    println!("Commands:");
    println!("  init                                      Create/upgrade the database");
    println!("  grant <user> <amount>                     Credit coins (admin)");
    println!("  balance <user>                            Show balance and journal");
    println!("  submit <user> add <type> <lat> <lon> [description]");
    println!("  submit <user> update <marker> [type] [lat] [lon] [description]");
    println!("  submit <user> delete <marker> [description]");
    println!("  approve <contribution> [reward]           Approve a pending contribution");
    println!("  reject <contribution> [note]              Reject a pending contribution");
    println!("  retry-sync <contribution>                 Re-run a failed marker sync");
    println!("  edit <contribution> <user> [description]  Owner edit while pending");
    println!("  withdraw <contribution> <user>            Owner delete while pending");
    println!("  vote <contribution> <user> up|down [weight]");
    println!("  votes <contribution>                      Vote summary");
    println!("  list [pending|approved|rejected]          List contributions");
    println!("  history <contribution>                    Status history");
    println!();
    println!("Environment: WAYMARK_DB (default waymark.db), WAYMARK_POLICY (JSON file)");
}
