// Quota reset reconciler
//
// Every usage-quota row whose reset_at has passed is zeroed and its
// reset_at advanced by the row's interval.

use tracing::info;

use super::ReconcilerCtx;

pub async fn run_pass(ctx: &ReconcilerCtx) -> anyhow::Result<()> {
    let reset_count = ctx.db.reset_expired_quotas().await?;
    if reset_count > 0 {
        info!(count = reset_count, "Reset expired quotas");
    }
    Ok(())
}
