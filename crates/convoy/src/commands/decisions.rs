//! Decision and operator commands
//!
//! `decide`, `pause`, `resume`, `skip` and `priority` each translate to a
//! single coordinator operation.

use anyhow::Result;
use convoy_core::{Decision, DecisionStatus, Error, Priorities};
use serde_json::json;

use super::{ack, Context};

fn print_decision(decision: &Decision) {
    println!(
        "{} [{}] {} ({})",
        decision.id, decision.kind, decision.summary, decision.status
    );
    for option in &decision.options {
        let marker = if option.key == decision.default_option { "*" } else { " " };
        println!("   {marker} {:<14} {}", option.key, option.description);
    }
    match (&decision.chosen_option, &decision.resolved_by) {
        (Some(choice), Some(by)) => println!("   chose {choice} ({by})"),
        _ => println!("   times out {}", decision.timeout_at.format("%Y-%m-%d %H:%M:%S")),
    }
}

/// Run the decisions command
pub async fn run(context: &Context, status: Option<&str>, all: bool) -> Result<()> {
    let coordinator = context.coordinator();
    let decisions = if all {
        coordinator.decisions(None).await?
    } else {
        let status = match status {
            Some(raw) => raw
                .parse::<DecisionStatus>()
                .map_err(|_| Error::InvalidInput(format!("unknown decision status '{raw}'")))?,
            None => DecisionStatus::Pending,
        };
        coordinator.decisions(Some(status)).await?
    };

    context.emit(&decisions, |decisions| {
        if decisions.is_empty() {
            println!("No decisions");
        }
        decisions.iter().for_each(print_decision);
    })
}

/// Run the decide command
pub async fn decide(context: &Context, decision_id: &str, choice: &str, by: &str) -> Result<()> {
    let decision = context.coordinator().resolve(decision_id, choice, by).await?;
    context.emit(&decision, |d| {
        println!("Resolved {} with '{choice}'", d.id);
    })
}

/// Run the pause command
pub async fn pause(context: &Context, owner: &str, reason: &str, by: &str) -> Result<()> {
    context.coordinator().pause(owner, reason, by).await?;
    let message = format!("Asked {owner} to pause");
    context.emit(&ack(message.clone()), |_| println!("{message}"))
}

/// Run the resume command
pub async fn resume(context: &Context, owner: &str, by: &str) -> Result<()> {
    context.coordinator().resume(owner, by).await?;
    let message = format!("Asked {owner} to resume");
    context.emit(&ack(message.clone()), |_| println!("{message}"))
}

/// Run the skip command
pub async fn skip(context: &Context, owner: &str, work_item: &str, by: &str) -> Result<()> {
    context.coordinator().skip(owner, work_item, by).await?;
    let message = format!("Asked {owner} to skip {work_item}");
    context.emit(&ack(message.clone()), |_| println!("{message}"))
}

/// Run the priority command: list, show one, or set one.
pub async fn priority(
    context: &Context,
    owner: Option<&str>,
    value: Option<i64>,
    by: &str,
) -> Result<()> {
    match (owner, value) {
        (Some(owner), Some(value)) => {
            let previous = context.coordinator().set_priority(owner, value, by).await?;
            let output = json!({ "owner": owner, "priority": value, "previous": previous });
            context.emit(&output, |_| {
                println!("{owner}: {previous} -> {value}");
            })
        }
        (Some(owner), None) => {
            let current = Priorities::new(context.store.clone()).get(owner).await?;
            let output = json!({ "owner": owner, "priority": current });
            context.emit(&output, |_| println!("{owner}: {current}"))
        }
        (None, _) => {
            let all = Priorities::new(context.store.clone()).all().await?;
            let output: Vec<_> = all
                .iter()
                .map(|(owner, priority)| json!({ "owner": owner, "priority": priority }))
                .collect();
            context.emit(&output, |_| {
                if all.is_empty() {
                    println!("All participants at default priority");
                }
                for (owner, priority) in &all {
                    println!("{owner}: {priority}");
                }
            })
        }
    }
}
