// Worker Runner
// The periodic scheduler tick: rescue stalled jobs, then claim one queued
// job when a worker slot is free and hand it to a pipeline executor on its
// own task. One tick loop per process; shutdown drains in-flight jobs.

use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::artifacts::ArtifactStore;
use crate::config::EngineConfig;
use crate::engine::PipelineExecutor;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::store::Store;
use crate::sweeper;
use crate::tools::ToolGateway;
use crate::vector::VectorStore;

pub struct Runner {
    store: Store,
    tools: Arc<dyn ToolGateway>,
    artifacts: Arc<dyn ArtifactStore>,
    vectors: Arc<dyn VectorStore>,
    config: EngineConfig,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

impl Runner {
    pub fn new(
        store: Store,
        tools: Arc<dyn ToolGateway>,
        artifacts: Arc<dyn ArtifactStore>,
        vectors: Arc<dyn VectorStore>,
        config: EngineConfig,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            tools,
            artifacts,
            vectors,
            config,
            metrics,
            shutdown,
        }
    }

    /// Drive ticks until shutdown, then drain in-flight jobs.
    pub async fn run(&self) -> Result<()> {
        // Warm the archive collection; the engine degrades without it.
        if let Err(err) = self
            .vectors
            .ensure_collection(self.config.tools.embed_dim)
            .await
        {
            tracing::warn!(error = %err, "vector collection unavailable");
        }

        let mut interval =
            tokio::time::interval(std::time::Duration::from_millis(self.config.tick_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut in_flight: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            // Free finished slots before claiming.
            while in_flight.try_join_next().is_some() {}

            self.tick(&mut in_flight).await;
        }

        tracing::info!(in_flight = in_flight.len(), "runner shutting down");
        while in_flight.join_next().await.is_some() {}
        Ok(())
    }

    /// One scheduler tick: sweep, then claim while capacity permits.
    pub async fn tick(&self, in_flight: &mut JoinSet<()>) {
        match sweeper::sweep(&self.store, &self.config, &self.metrics).await {
            Ok(rescued) if rescued > 0 => {
                tracing::info!(rescued, "rescue sweep requeued stalled jobs");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(error = %err, "rescue sweep failed");
            }
        }

        // One claim per tick, and only when a worker slot is free.
        if in_flight.len() >= self.config.max_concurrent {
            return;
        }
        let claimed = match self.store.claim_next_queued().await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(err) => {
                tracing::error!(error = %err, "queue claim failed");
                return;
            }
        };

        tracing::info!(job_id = %claimed.id, "claimed job");
        let executor = PipelineExecutor::new(
            claimed.id.clone(),
            self.store.clone(),
            self.tools.clone(),
            self.artifacts.clone(),
            self.vectors.clone(),
            self.config.clone(),
            self.metrics.clone(),
        );
        in_flight.spawn(async move {
            // Terminal status and error text are already on the job row.
            let _ = executor.run().await;
        });
    }
}
