use std::sync::Arc;

use ping_core::scheduler::Scheduler;
use ping_core::store::DefaultKv;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct ModuleCtx {
    pub kv: DefaultKv,
    pub scheduler: Arc<Scheduler>,
    pub job: String,
    pub shutdown: tokio::sync::watch::Receiver<bool>,
}

pub trait Module: Send + 'static {
    fn name(&self) -> &'static str;
    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>>;
}
