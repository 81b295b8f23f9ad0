//! Checkpoints command

use anyhow::Result;
use convoy_core::CheckpointManager;

use super::Context;

/// Run the checkpoints command
pub async fn run(context: &Context, owner: Option<&str>, all: bool) -> Result<()> {
    let manager = CheckpointManager::new(context.store.clone(), context.repository());
    let checkpoints = if all {
        manager.list_all(owner).await?
    } else {
        manager.list(owner).await?
    };

    context.emit(&checkpoints, |checkpoints| {
        if checkpoints.is_empty() {
            println!("No checkpoints");
        }
        for checkpoint in checkpoints {
            let state = if checkpoint.active { "active" } else { "inactive" };
            println!(
                "{} {:<12} {:<8} {} {}",
                checkpoint.id,
                checkpoint.owner,
                state,
                checkpoint.created_at.format("%Y-%m-%d %H:%M:%S"),
                checkpoint.label
            );
        }
    })
}
