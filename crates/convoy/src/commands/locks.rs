//! Lock commands - inspect the lock table and unlock resources

use anyhow::Result;
use convoy_core::{Lock, LockManager, PendingRequest};
use serde_json::json;

use super::{ack, Context};

/// Options for the unlock command
#[derive(Debug, Clone)]
pub struct UnlockOptions {
    pub resource: String,
    pub holder: Option<String>,
    pub force: bool,
    pub reason: String,
    pub operator: String,
}

fn print_lock(lock: &Lock) {
    let context = lock.context.as_deref().unwrap_or("-");
    println!(
        "  {:<32} {:<12} expires {} ({context})",
        lock.resource_key,
        lock.holder,
        lock.expires_at.format("%H:%M:%S")
    );
}

fn print_pending(request: &PendingRequest) {
    println!(
        "  {:<32} {:<12} waiting on {} since {}",
        request.resource_key,
        request.waiter,
        request.holder_at_denial,
        request.recorded_at.format("%H:%M:%S")
    );
}

/// Run the locks command
pub async fn run(context: &Context, holder: Option<&str>, include_pending: bool) -> Result<()> {
    let manager = LockManager::with_ttl(context.store.clone(), context.config.lock_ttl());
    let locks = match holder {
        Some(holder) => manager.locks_held_by(holder).await?,
        None => manager.lock_table().await?,
    };
    let pending = if include_pending {
        manager.pending_requests().await?
    } else {
        Vec::new()
    };

    let output = json!({ "locks": locks, "pending": pending });
    context.emit(&output, |_| {
        if locks.is_empty() {
            println!("No active locks");
        } else {
            println!("Active locks ({}):", locks.len());
            locks.iter().for_each(print_lock);
        }
        if include_pending && !pending.is_empty() {
            println!("Pending requests ({}):", pending.len());
            pending.iter().for_each(print_pending);
        }
    })
}

/// Run the unlock command
pub async fn unlock(context: &Context, options: &UnlockOptions) -> Result<()> {
    let manager = LockManager::with_ttl(context.store.clone(), context.config.lock_ttl());

    let message = if options.force {
        match manager
            .force_release(&options.resource, &options.operator, &options.reason)
            .await?
        {
            Some(lock) => format!("Force-released '{}' from {}", options.resource, lock.holder),
            None => format!("'{}' was not locked", options.resource),
        }
    } else {
        let holder = options
            .holder
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("--holder is required without --force"))?;
        if manager.release(&options.resource, holder).await? {
            format!("Released '{}'", options.resource)
        } else {
            format!("'{}' was not locked", options.resource)
        }
    };

    context.emit(&ack(message.clone()), |_| println!("{message}"))
}
