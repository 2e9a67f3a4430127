//! DispatcherBuilder - 構築とワイヤリング
//!
//! # Fail-fast 設計
//! - config is validated before anything connects
//! - missing required components (ledger, broker connector) are a
//!   `DispatchError::MissingComponent`, not a panic later
//! - consumers are optional, but coordinator and handler come as a pair

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::app::broker_pool::BrokerClientPool;
use crate::app::coalescer::StatusCoalescer;
use crate::app::consumer::{ConsumerGroup, RecordHandler};
use crate::app::dispatcher::Dispatcher;
use crate::app::scheduler::DispatchScheduler;
use crate::config::DispatcherConfig;
use crate::domain::DispatchError;
use crate::ports::{
    BrokerConnector, Clock, ConsumerGroupCoordinator, IdGenerator, Ledger, SystemClock,
    UlidGenerator,
};

/// # 使用例
/// ```ignore
/// let dispatcher = DispatcherBuilder::new(DispatcherConfig::from_env())
///     .ledger(ledger)
///     .broker(connector)
///     .consumers(coordinator, handler)
///     .start()
///     .await?;
/// ```
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    ledger: Option<Arc<dyn Ledger>>,
    connector: Option<Arc<dyn BrokerConnector>>,
    coordinator: Option<Arc<dyn ConsumerGroupCoordinator>>,
    handler: Option<Arc<dyn RecordHandler>>,
    clock: Arc<dyn Clock>,
}

impl DispatcherBuilder {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            config,
            ledger: None,
            connector: None,
            coordinator: None,
            handler: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn broker(mut self, connector: Arc<dyn BrokerConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Run consumer-group workers in this process too.
    pub fn consumers(
        mut self,
        coordinator: Arc<dyn ConsumerGroupCoordinator>,
        handler: Arc<dyn RecordHandler>,
    ) -> Self {
        self.coordinator = Some(coordinator);
        self.handler = Some(handler);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate, connect, and start every loop.
    pub async fn start(self) -> Result<Dispatcher, DispatchError> {
        let Self {
            config,
            ledger,
            connector,
            coordinator,
            handler,
            clock,
        } = self;

        config.validate()?;
        let ledger = ledger.ok_or(DispatchError::MissingComponent("ledger"))?;
        let connector = connector.ok_or(DispatchError::MissingComponent("broker connector"))?;

        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        let pool = Arc::new(BrokerClientPool::connect(connector.as_ref(), &config).await?);
        let coalescer = Arc::new(StatusCoalescer::new(
            Arc::clone(&ledger),
            Arc::clone(&clock),
            Arc::clone(&ids),
            &config,
        ));
        let scheduler = Arc::new(DispatchScheduler::new(
            Arc::clone(&ledger),
            Arc::clone(&pool),
            Arc::clone(&coalescer),
            Arc::clone(&clock),
            &config,
        ));

        // intake = scheduler + consumers; the flush loop stops later
        let (intake_tx, intake_rx) = watch::channel(false);
        let (flush_tx, flush_rx) = watch::channel(false);
        let flush_loop = tokio::spawn(Arc::clone(&coalescer).run_flush_loop(flush_rx));

        let consumers = match (coordinator, handler) {
            (Some(coordinator), Some(handler)) => {
                let started = ConsumerGroup::start(
                    coordinator,
                    handler,
                    Arc::clone(&coalescer),
                    Arc::clone(&clock),
                    Arc::clone(&ids),
                    &config,
                    intake_rx.clone(),
                )
                .await;
                match started {
                    Ok(group) => Some(group),
                    Err(e) => {
                        flush_tx.send_replace(true);
                        pool.abort();
                        return Err(e.into());
                    }
                }
            }
            (None, None) => None,
            (None, Some(_)) => {
                pool.abort();
                flush_tx.send_replace(true);
                return Err(DispatchError::MissingComponent("consumer group coordinator"));
            }
            (Some(_), None) => {
                pool.abort();
                flush_tx.send_replace(true);
                return Err(DispatchError::MissingComponent("record handler"));
            }
        };

        let scheduler_tasks = scheduler.spawn(intake_rx);
        info!(
            topic = %config.topic,
            batch_size = config.batch_size,
            pool_size = config.pool_size,
            consumers = consumers.as_ref().map(|c| c.members().len()).unwrap_or(0),
            "dispatcher started"
        );

        Ok(Dispatcher::new(
            config,
            ledger,
            pool,
            coalescer,
            scheduler,
            consumers,
            intake_tx,
            flush_tx,
            scheduler_tasks,
            flush_loop,
        ))
    }
}
