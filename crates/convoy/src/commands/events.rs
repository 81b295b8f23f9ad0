//! Events commands - list, follow and publish

use std::time::Duration;

use anyhow::Result;
use convoy_core::{shutdown_signal, Error, Event, EventFilter, EventLog, EventPriority, EventType, NewEvent};

use super::Context;

const FOLLOW_INTERVAL: Duration = Duration::from_secs(1);

/// Options for the events command
#[derive(Debug, Clone, Default)]
pub struct EventsOptions {
    pub event_types: Vec<String>,
    pub source: Option<String>,
    pub correlation: Option<String>,
    pub after: Option<i64>,
    pub limit: u32,
    pub follow: bool,
}

/// Options for the publish command
#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub event_type: String,
    pub source: String,
    pub payload: String,
    pub correlation: Option<String>,
    pub priority: String,
}

pub fn parse_event_type(raw: &str) -> convoy_core::Result<EventType> {
    raw.parse()
        .map_err(|_| Error::InvalidInput(format!("unknown event type '{raw}'")))
}

fn build_filter(options: &EventsOptions) -> convoy_core::Result<EventFilter> {
    let event_types = options
        .event_types
        .iter()
        .map(|raw| parse_event_type(raw))
        .collect::<convoy_core::Result<Vec<_>>>()?;
    Ok(EventFilter {
        event_types,
        sources: options.source.iter().cloned().collect(),
        correlation_id: options.correlation.clone(),
    })
}

fn print_event(event: &Event) {
    let correlation = event
        .correlation_id
        .as_ref()
        .map_or(String::new(), |c| format!(" [{c}]"));
    println!(
        "{:>6} {} {:<20} {:<18}{} {}",
        event.id,
        event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
        event.event_type,
        event.source,
        correlation,
        event.payload
    );
}

/// Run the events command
pub async fn run(context: &Context, options: &EventsOptions) -> Result<()> {
    let filter = build_filter(options)?;
    let log = EventLog::new(context.store.clone());
    let events = match options.after {
        Some(after) => log.list(&filter, Some(after), options.limit).await?,
        None => log.recent(&filter, options.limit).await?,
    };

    if options.follow {
        return follow(context, &log, &filter, events).await;
    }

    context.emit(&events, |events| {
        if events.is_empty() {
            println!("No events");
        }
        events.iter().for_each(print_event);
    })
}

async fn follow(context: &Context, log: &EventLog, filter: &EventFilter, initial: Vec<Event>) -> Result<()> {
    let mut last = match initial.last() {
        Some(event) => event.id,
        None => log.latest_sequence().await?,
    };
    for event in &initial {
        emit_line(context, event)?;
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => break,
            () = tokio::time::sleep(FOLLOW_INTERVAL) => {}
        }
        let batch = log.list(filter, Some(last), convoy_core::events::DEFAULT_POLL_LIMIT).await?;
        for event in &batch {
            emit_line(context, event)?;
            last = event.id;
        }
    }
    Ok(())
}

fn emit_line(context: &Context, event: &Event) -> Result<()> {
    if context.json {
        println!("{}", serde_json::to_string(event)?);
    } else {
        print_event(event);
    }
    Ok(())
}

/// Run the publish command
pub async fn publish(context: &Context, options: &PublishOptions) -> Result<()> {
    let event_type = parse_event_type(&options.event_type)?;
    let priority: EventPriority = options
        .priority
        .parse()
        .map_err(|_| Error::InvalidInput(format!("unknown priority '{}'", options.priority)))?;
    let payload: serde_json::Value = serde_json::from_str(&options.payload)
        .map_err(|e| Error::InvalidInput(format!("payload is not valid JSON: {e}")))?;
    if !payload.is_object() {
        return Err(Error::InvalidInput("payload must be a JSON object".into()).into());
    }

    let mut event = NewEvent::new(&options.source, event_type)
        .with_payload(payload)
        .with_priority(priority);
    if let Some(correlation) = &options.correlation {
        event = event.with_correlation(correlation);
    }

    let seq = EventLog::new(context.store.clone()).publish(event).await?;
    context.emit(&serde_json::json!({ "success": true, "seq": seq }), |_| {
        println!("Published {event_type} as #{seq}");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_parses_types_and_source() {
        let options = EventsOptions {
            event_types: vec!["file_locked".into(), "force_release".into()],
            source: Some("loop-1".into()),
            ..EventsOptions::default()
        };
        let filter = build_filter(&options).unwrap();
        assert_eq!(filter.event_types, vec![EventType::FileLocked, EventType::ForceRelease]);
        assert_eq!(filter.sources, vec!["loop-1".to_string()]);
    }

    #[test]
    fn unknown_type_is_invalid_input() {
        let err = parse_event_type("file_exploded").unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(err.exit_code(), 1);
    }
}
