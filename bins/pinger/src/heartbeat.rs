use std::time::Duration;

use ping_core::driver::Driver;
use ping_core::store::{keys, KvSerde};
use tracing::{debug, info, warn};

use crate::module::{Module, ModuleCtx};

/// Drives the ping job and keeps its last status in KV for `pinger status`.
pub struct Heartbeat {
    constraint_poll: Duration,
}

impl Heartbeat {
    pub fn new(constraint_poll: Duration) -> Self {
        Self { constraint_poll }
    }
}

impl Module for Heartbeat {
    fn name(&self) -> &'static str { "heartbeat" }

    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let kv = ctx.kv.clone();
            let key = keys::last_status(&ctx.job);

            Driver::new(ctx.scheduler.clone(), ctx.job.clone())
                .with_constraint_poll(self.constraint_poll)
                .run(ctx.shutdown.clone(), move |status| {
                    match kv.put_t(&key, status) {
                        Ok(()) => debug!(state = ?status.state, "status saved"),
                        Err(e) => warn!("save status: {e:#}"),
                    }
                })
                .await;

            // keep the final state (e.g. cancelled) visible after exit
            let last = ctx.scheduler.query(&ctx.job).await;
            ctx.kv.put_t(&keys::last_status(&ctx.job), &last)?;
            info!("heartbeat stopping, job {} is {:?}", ctx.job, last.state);
            Ok(())
        })
    }
}
