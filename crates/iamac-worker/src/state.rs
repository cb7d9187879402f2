//! Shared axum control-plane state: one `Clone`-able struct handed to
//! every handler via `State<Arc<AppState>>`.

use sqlx::PgPool;

#[derive(Debug, Clone, Copy)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

pub const BUILD_INFO: BuildInfo = BuildInfo {
    service: "iamac-worker",
    version: env!("CARGO_PKG_VERSION"),
};

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    /// The task queue name `Runner` claims `workflow_runs` rows under — the
    /// same one routes enqueue new runs onto.
    pub task_queue: String,
    pub build: BuildInfo,
}

impl AppState {
    pub fn new(pool: PgPool, task_queue: impl Into<String>) -> Self {
        Self {
            pool,
            task_queue: task_queue.into(),
            build: BUILD_INFO,
        }
    }
}
