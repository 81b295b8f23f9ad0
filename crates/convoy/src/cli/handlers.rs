//! Command dispatch: turn parsed arguments into command options and run them

use anyhow::Result;
use clap::ArgMatches;

use crate::{
    cli::build_cli,
    commands::{
        checkpoints, decisions,
        events::{self, EventsOptions, PublishOptions},
        health,
        locks::{self, UnlockOptions},
        monitor, regressions, Context,
    },
};

/// Parse the process arguments and run the selected command.
pub async fn run_cli() -> Result<()> {
    let matches = build_cli().get_matches();
    dispatch(&matches).await
}

/// Value of `id`, or `None` when unset or not defined for this subcommand.
fn string(matches: &ArgMatches, id: &str) -> Option<String> {
    matches.try_get_one::<String>(id).ok().flatten().cloned()
}

fn required(matches: &ArgMatches, id: &str) -> Result<String> {
    string(matches, id).ok_or_else(|| anyhow::anyhow!("missing argument '{id}'"))
}

pub async fn dispatch(matches: &ArgMatches) -> Result<()> {
    let Some((name, sub)) = matches.subcommand() else {
        anyhow::bail!("No command given. Run 'convoy --help' for usage.");
    };
    let context = Context::open(sub).await?;
    let by = string(sub, "by").unwrap_or_default();

    match name {
        "events" => {
            let options = EventsOptions {
                event_types: sub
                    .get_many::<String>("type")
                    .map(|values| values.cloned().collect())
                    .unwrap_or_default(),
                source: string(sub, "source"),
                correlation: string(sub, "correlation"),
                after: sub.get_one::<i64>("after").copied(),
                limit: sub.get_one::<u32>("limit").copied().unwrap_or(50),
                follow: sub.get_flag("follow"),
            };
            events::run(&context, &options).await
        }
        "publish" => {
            let options = PublishOptions {
                event_type: required(sub, "event_type")?,
                source: required(sub, "source")?,
                payload: required(sub, "payload")?,
                correlation: string(sub, "correlation"),
                priority: required(sub, "priority")?,
            };
            events::publish(&context, &options).await
        }
        "locks" => {
            locks::run(
                &context,
                sub.get_one::<String>("holder").map(String::as_str),
                sub.get_flag("pending"),
            )
            .await
        }
        "unlock" => {
            let options = UnlockOptions {
                resource: required(sub, "resource")?,
                holder: string(sub, "holder"),
                force: sub.get_flag("force"),
                reason: required(sub, "reason")?,
                operator: by,
            };
            locks::unlock(&context, &options).await
        }
        "decisions" => {
            decisions::run(
                &context,
                sub.get_one::<String>("status").map(String::as_str),
                sub.get_flag("all"),
            )
            .await
        }
        "decide" => {
            let id = required(sub, "decision_id")?;
            let choice = required(sub, "choice")?;
            decisions::decide(&context, &id, &choice, &by).await
        }
        "health" => health::run(&context).await,
        "checkpoints" => {
            checkpoints::run(
                &context,
                sub.get_one::<String>("owner").map(String::as_str),
                sub.get_flag("all"),
            )
            .await
        }
        "regressions" => {
            regressions::run(&context, sub.get_one::<u32>("limit").copied().unwrap_or(20)).await
        }
        "pause" => {
            let owner = required(sub, "owner")?;
            let reason = required(sub, "reason")?;
            decisions::pause(&context, &owner, &reason, &by).await
        }
        "resume" => decisions::resume(&context, &required(sub, "owner")?, &by).await,
        "skip" => {
            let owner = required(sub, "owner")?;
            let work_item = required(sub, "work_item")?;
            decisions::skip(&context, &owner, &work_item, &by).await
        }
        "priority" => {
            decisions::priority(
                &context,
                sub.get_one::<String>("owner").map(String::as_str),
                sub.get_one::<i64>("value").copied(),
                &by,
            )
            .await
        }
        "sweep" => monitor::sweep(&context).await,
        "detect" => monitor::detect(&context).await,
        "supervise" => monitor::supervise(&context, sub.get_flag("once")).await,
        other => anyhow::bail!("Unknown command '{other}'. Run 'convoy --help' for usage."),
    }
}
