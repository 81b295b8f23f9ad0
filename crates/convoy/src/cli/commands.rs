//! CLI command definitions using `clap`

use std::path::PathBuf;

use clap::{value_parser, Arg, ArgAction, Command};

/// Operator name recorded on commands that do not say otherwise.
pub const DEFAULT_OPERATOR: &str = "operator";

pub fn build_cli() -> Command {
    Command::new("convoy")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Coordinate autonomous loops sharing one repository")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("db")
                .long("db")
                .global(true)
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .help("Coordination database (overrides config)"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("Read this config file instead of the global and project layers"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Output as JSON"),
        )
        .subcommand(cmd_events())
        .subcommand(cmd_publish())
        .subcommand(cmd_locks())
        .subcommand(cmd_unlock())
        .subcommand(cmd_decisions())
        .subcommand(cmd_decide())
        .subcommand(cmd_health())
        .subcommand(cmd_checkpoints())
        .subcommand(cmd_regressions())
        .subcommand(cmd_pause())
        .subcommand(cmd_resume())
        .subcommand(cmd_skip())
        .subcommand(cmd_priority())
        .subcommand(cmd_sweep())
        .subcommand(cmd_detect())
        .subcommand(cmd_supervise())
}

fn operator_arg() -> Arg {
    Arg::new("by")
        .long("by")
        .value_name("NAME")
        .default_value(DEFAULT_OPERATOR)
        .help("Operator identity recorded on the event")
}

fn cmd_events() -> Command {
    Command::new("events")
        .about("List events from the coordination log")
        .arg(
            Arg::new("type")
                .long("type")
                .short('t')
                .action(ArgAction::Append)
                .value_name("EVENT_TYPE")
                .help("Only this event type (repeatable)"),
        )
        .arg(Arg::new("source").long("source").help("Only events from this source"))
        .arg(
            Arg::new("correlation")
                .long("correlation")
                .help("Only events with this correlation id"),
        )
        .arg(
            Arg::new("after")
                .long("after")
                .value_name("SEQ")
                .value_parser(value_parser!(i64))
                .help("Only events after this sequence number"),
        )
        .arg(
            Arg::new("limit")
                .long("limit")
                .short('n')
                .value_parser(value_parser!(u32))
                .default_value("50")
                .help("Maximum events to show"),
        )
        .arg(
            Arg::new("follow")
                .long("follow")
                .short('f')
                .action(ArgAction::SetTrue)
                .help("Keep printing new events until interrupted"),
        )
}

fn cmd_publish() -> Command {
    Command::new("publish")
        .about("Append an event to the log")
        .arg(
            Arg::new("event_type")
                .required(true)
                .value_name("EVENT_TYPE")
                .help("Event type, e.g. stuck_detected"),
        )
        .arg(
            Arg::new("source")
                .long("source")
                .default_value(DEFAULT_OPERATOR)
                .help("Publisher identity"),
        )
        .arg(
            Arg::new("payload")
                .long("payload")
                .value_name("JSON")
                .default_value("{}")
                .help("Event payload as a JSON object"),
        )
        .arg(Arg::new("correlation").long("correlation").help("Correlation id"))
        .arg(
            Arg::new("priority")
                .long("priority")
                .default_value("normal")
                .help("low, normal, high or critical"),
        )
}

fn cmd_locks() -> Command {
    Command::new("locks")
        .about("Show the lock table")
        .arg(Arg::new("holder").long("holder").help("Only locks held by this owner"))
        .arg(
            Arg::new("pending")
                .long("pending")
                .action(ArgAction::SetTrue)
                .help("Also show denied requests still waiting"),
        )
}

fn cmd_unlock() -> Command {
    Command::new("unlock")
        .about("Release a lock")
        .arg(Arg::new("resource").required(true).help("Resource key"))
        .arg(
            Arg::new("holder")
                .long("holder")
                .required_unless_present("force")
                .help("Release as this holder"),
        )
        .arg(
            Arg::new("force")
                .long("force")
                .action(ArgAction::SetTrue)
                .conflicts_with("holder")
                .help("Remove the lock whoever holds it"),
        )
        .arg(
            Arg::new("reason")
                .long("reason")
                .default_value("operator force-unlock")
                .help("Reason recorded for a forced unlock"),
        )
        .arg(operator_arg())
}

fn cmd_decisions() -> Command {
    Command::new("decisions")
        .about("List decisions (pending by default)")
        .arg(
            Arg::new("status")
                .long("status")
                .help("pending, resolved or timed_out"),
        )
        .arg(
            Arg::new("all")
                .long("all")
                .action(ArgAction::SetTrue)
                .conflicts_with("status")
                .help("Every decision regardless of status"),
        )
}

fn cmd_decide() -> Command {
    Command::new("decide")
        .about("Resolve a pending decision")
        .arg(Arg::new("decision_id").required(true).help("Decision id"))
        .arg(Arg::new("choice").required(true).help("Option key to apply"))
        .arg(operator_arg())
}

fn cmd_health() -> Command {
    Command::new("health").about("Show component health")
}

fn cmd_checkpoints() -> Command {
    Command::new("checkpoints")
        .about("List checkpoints")
        .arg(Arg::new("owner").long("owner").help("Only this owner's checkpoints"))
        .arg(
            Arg::new("all")
                .long("all")
                .action(ArgAction::SetTrue)
                .help("Include inactive checkpoints awaiting purge"),
        )
}

fn cmd_regressions() -> Command {
    Command::new("regressions")
        .about("Show detected regressions, newest first")
        .arg(
            Arg::new("limit")
                .long("limit")
                .short('n')
                .value_parser(value_parser!(u32))
                .default_value("20"),
        )
}

fn cmd_pause() -> Command {
    Command::new("pause")
        .about("Ask a loop to pause")
        .arg(Arg::new("owner").required(true))
        .arg(
            Arg::new("reason")
                .long("reason")
                .default_value("paused by operator"),
        )
        .arg(operator_arg())
}

fn cmd_resume() -> Command {
    Command::new("resume")
        .about("Ask a paused loop to resume")
        .arg(Arg::new("owner").required(true))
        .arg(operator_arg())
}

fn cmd_skip() -> Command {
    Command::new("skip")
        .about("Ask a loop to skip a work item")
        .arg(Arg::new("owner").required(true))
        .arg(Arg::new("work_item").required(true))
        .arg(operator_arg())
}

fn cmd_priority() -> Command {
    Command::new("priority")
        .about("Show or change participant priorities")
        .arg(Arg::new("owner").help("Participant; omit to list every priority"))
        .arg(
            Arg::new("value")
                .requires("owner")
                .allow_negative_numbers(true)
                .value_parser(value_parser!(i64))
                .help("New priority; larger wins conflicts"),
        )
        .arg(operator_arg())
}

fn cmd_sweep() -> Command {
    Command::new("sweep").about("Run one orphan-cleanup sweep")
}

fn cmd_detect() -> Command {
    Command::new("detect").about("Run one deadlock detection pass")
}

fn cmd_supervise() -> Command {
    Command::new("supervise")
        .about("Run the monitor until SIGINT or SIGTERM")
        .arg(
            Arg::new("once")
                .long("once")
                .action(ArgAction::SetTrue)
                .help("Run every periodic task once and exit"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<clap::ArgMatches, clap::Error> {
        build_cli().try_get_matches_from(args)
    }

    #[test]
    fn definition_is_consistent() {
        build_cli().debug_assert();
    }

    #[test]
    fn global_flags_reach_subcommands() {
        let matches = parse(&["convoy", "locks", "--json", "--db", "/tmp/c.db"]).unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "locks");
        assert!(sub.get_flag("json"));
        assert_eq!(
            sub.get_one::<PathBuf>("db"),
            Some(&PathBuf::from("/tmp/c.db"))
        );
    }

    #[test]
    fn events_collects_repeated_types() {
        let matches = parse(&[
            "convoy",
            "events",
            "--type",
            "file_locked",
            "-t",
            "file_unlocked",
            "--after",
            "7",
        ])
        .unwrap();
        let sub = matches.subcommand_matches("events").unwrap();
        let types: Vec<&String> = sub.get_many::<String>("type").unwrap().collect();
        assert_eq!(types, ["file_locked", "file_unlocked"]);
        assert_eq!(sub.get_one::<i64>("after"), Some(&7));
        assert_eq!(sub.get_one::<u32>("limit"), Some(&50));
    }

    #[test]
    fn unlock_needs_holder_or_force() {
        assert!(parse(&["convoy", "unlock", "src/a.ts"]).is_err());
        assert!(parse(&["convoy", "unlock", "src/a.ts", "--holder", "loop-1"]).is_ok());
        assert!(parse(&["convoy", "unlock", "src/a.ts", "--force"]).is_ok());
        assert!(parse(&["convoy", "unlock", "src/a.ts", "--force", "--holder", "loop-1"]).is_err());
    }

    #[test]
    fn priority_accepts_negative_values() {
        let matches = parse(&["convoy", "priority", "loop-2", "-3"]).unwrap();
        let sub = matches.subcommand_matches("priority").unwrap();
        assert_eq!(sub.get_one::<i64>("value"), Some(&-3));
        assert_eq!(
            sub.get_one::<String>("by").map(String::as_str),
            Some(DEFAULT_OPERATOR)
        );
    }

    #[test]
    fn decide_requires_choice() {
        assert!(parse(&["convoy", "decide", "dec-1"]).is_err());
        assert!(parse(&["convoy", "decide", "dec-1", "rollback", "--by", "alice"]).is_ok());
    }

    #[test]
    fn decisions_status_and_all_conflict() {
        assert!(parse(&["convoy", "decisions", "--all", "--status", "pending"]).is_err());
    }

    #[test]
    fn subcommand_is_required() {
        assert!(parse(&["convoy"]).is_err());
    }
}
