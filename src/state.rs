use std::sync::Arc;

use crate::config::{AppConfig, StoreBackend};
use crate::db::PgStore;
use crate::mailer::{LogMailer, Mailer};
use crate::memory::MemoryStore;
use crate::metrics::RequestMetrics;
use crate::storage::Store;
use crate::tasks::BackgroundTasks;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub config: Arc<AppConfig>,
    pub mailer: Arc<dyn Mailer>,
    pub tasks: BackgroundTasks,
    pub metrics: Arc<RequestMetrics>,
}

impl AppState {
    /// Connects the configured backend. For postgres, also runs migrations.
    pub async fn init(config: AppConfig) -> anyhow::Result<Self> {
        let config = Arc::new(config);

        let store = match config.database.backend {
            StoreBackend::Postgres => {
                let pg = PgStore::connect(&config.database).await?;
                sqlx::migrate!("./migrations").run(pg.pool()).await?;
                tracing::info!("database connection established, migrations applied");
                Arc::new(pg) as Arc<dyn Store>
            }
            StoreBackend::Memory => {
                tracing::warn!("using in-memory store; all data is lost on exit");
                Arc::new(MemoryStore::new()) as Arc<dyn Store>
            }
        };

        Ok(Self::from_parts(store, config, Arc::new(LogMailer)))
    }

    pub fn from_parts(store: Arc<dyn Store>, config: Arc<AppConfig>, mailer: Arc<dyn Mailer>) -> Self {
        Self {
            store,
            config,
            mailer,
            tasks: BackgroundTasks::new(),
            metrics: Arc::new(RequestMetrics::new()),
        }
    }
}
