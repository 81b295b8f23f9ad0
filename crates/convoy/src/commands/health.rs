//! Health command

use anyhow::Result;

use super::Context;

/// Run the health command
pub async fn run(context: &Context) -> Result<()> {
    let table = context.health().table().await?;
    context.emit(&table, |table| {
        if table.is_empty() {
            println!("No components registered");
            return;
        }
        for component in table {
            let pid = component.pid.map_or_else(|| "-".to_string(), |p| p.to_string());
            println!(
                "{:<20} {:<9} pid {:<8} last heartbeat {}",
                component.component,
                component.status,
                pid,
                component.last_heartbeat.format("%Y-%m-%d %H:%M:%S")
            );
        }
    })
}
