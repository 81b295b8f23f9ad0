//! Regressions command

use anyhow::Result;
use convoy_core::RegressionMonitor;

use super::Context;

/// Run the regressions command
pub async fn run(context: &Context, limit: u32) -> Result<()> {
    let monitor = RegressionMonitor::new(context.store.clone(), context.repository());
    let history = monitor.history(limit).await?;

    context.emit(&history, |history| {
        if history.is_empty() {
            println!("No regressions detected");
        }
        for regression in history {
            let blamed = regression.blamed_loop.as_deref().unwrap_or("unknown");
            println!(
                "#{} {} broke {} (blamed {blamed}, {}..{}){}",
                regression.id,
                regression.work_item_id,
                regression.blamed_test,
                regression.passing_commit,
                regression.failing_commit,
                if regression.auto_rolled_back { " rolled back" } else { "" }
            );
        }
    })
}
