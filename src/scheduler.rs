//! Pipeline scheduler (spec.md §4.I, §5).
//!
//! A single cooperative loop drains the work queue, classifies each
//! popped chunk, and spawns `process_chunk` detached; CPU-bound work
//! (`process()`) is bridged to `rayon`'s pool via `spawn_blocking`. A
//! second loop drains the purge FIFO on a fixed interval.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{Mutex, Semaphore};
use tokio::time::{interval, Duration};
use tracing::{error, info, instrument};

use crate::chunk_proc::{ChunkVariant, UpdateFlags};
use crate::config::{self, Settings};
use crate::delayed_updates::DelayedUpdateTable;
use crate::id::ChunkId;
use crate::purge::PurgeFifo;
use crate::store::work_store::WorkStore;
use crate::store::ObjectStore;

const WORK_QUEUE_POP_TIMEOUT_SECS: f64 = 5.0;

fn now_epoch_s() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub struct Scheduler {
    settings: Arc<Settings>,
    store: Arc<ObjectStore>,
    work_store: WorkStore,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    purge_fifo: Arc<Mutex<PurgeFifo>>,
    delayed_updates: Arc<Mutex<DelayedUpdateTable>>,
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(settings: Settings, store: ObjectStore, work_store: WorkStore) -> Self {
        let pipeline_limit = settings.pipeline_limit;
        Self {
            settings: Arc::new(settings),
            store: Arc::new(store),
            work_store,
            semaphore: Arc::new(Semaphore::new(pipeline_limit)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            purge_fifo: Arc::new(Mutex::new(PurgeFifo::new())),
            delayed_updates: Arc::new(Mutex::new(DelayedUpdateTable::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A handle that flips the shutdown flag; cloned into the signal
    /// handler task in `main`.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Runs the purge loop until shutdown; intended to be spawned
    /// alongside [`Scheduler::run`].
    pub async fn run_purge_loop(&self) {
        let mut ticker = interval(Duration::from_millis(config::PURGE_DELAY_MS));
        loop {
            ticker.tick().await;
            if self.shutdown.load(Ordering::Relaxed) && self.purge_fifo.lock().await.is_empty() {
                return;
            }

            let ids = {
                let mut fifo = self.purge_fifo.lock().await;
                fifo.pop_up_to(config::PURGE_URLS_LIMIT)
            };
            if ids.is_empty() {
                continue;
            }

            let urls: Vec<String> = ids
                .iter()
                .map(|id| format!("{}{id}", self.settings.chunks_bucket_url))
                .collect();
            self.store.purge_cache(&urls).await;
        }
    }

    /// The main scheduler loop (spec.md §4.I).
    pub async fn run(&self) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                self.drain_on_shutdown().await;
                return;
            }

            {
                let mut delayed = self.delayed_updates.lock().await;
                delayed.refresh(&mut self.work_store.clone(), now_epoch_s()).await;
            }

            let popped = match self.work_store.clone().brpop(WORK_QUEUE_POP_TIMEOUT_SECS).await {
                Ok(Some(id)) => id,
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, "work queue pop failed");
                    continue;
                }
            };

            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore never closed");

            {
                let mut in_flight = self.in_flight.lock().await;
                if in_flight.contains(&popped) {
                    drop(in_flight);
                    if let Err(e) = self.work_store.clone().requeue_head(&popped).await {
                        error!(chunk_id = %popped, error = %e, "failed to requeue duplicate in-flight chunk");
                    }
                    drop(permit);
                    continue;
                }
                in_flight.insert(popped.clone());
            }

            let ctx = TaskContext {
                settings: self.settings.clone(),
                store: self.store.clone(),
                work_store: self.work_store.clone(),
                in_flight: self.in_flight.clone(),
                purge_fifo: self.purge_fifo.clone(),
                delayed_updates: self.delayed_updates.clone(),
            };

            tokio::spawn(async move {
                let _permit = permit;
                let id = popped;
                if let Err(e) = process_chunk(ctx.clone(), id.clone()).await {
                    error!(chunk_id = %id, error = %e, "process_chunk failed");
                }
                ctx.in_flight.lock().await.remove(&id);
            });
        }
    }

    async fn drain_on_shutdown(&self) {
        info!("shutdown requested, draining in-flight tasks");
        loop {
            if self.in_flight.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let ids = self.purge_fifo.lock().await.drain_all();
        if !ids.is_empty() {
            let urls: Vec<String> = ids
                .iter()
                .map(|id| format!("{}{id}", self.settings.chunks_bucket_url))
                .collect();
            self.store.purge_cache(&urls).await;
        }

        self.delayed_updates
            .lock()
            .await
            .purge(&mut self.work_store.clone())
            .await;
    }
}

#[derive(Clone)]
struct TaskContext {
    settings: Arc<Settings>,
    store: Arc<ObjectStore>,
    work_store: WorkStore,
    in_flight: Arc<Mutex<HashSet<String>>>,
    purge_fifo: Arc<Mutex<PurgeFifo>>,
    delayed_updates: Arc<Mutex<DelayedUpdateTable>>,
}

#[instrument(skip(ctx))]
async fn process_chunk(ctx: TaskContext, chunk_id_str: String) -> anyhow::Result<()> {
    let mut work_store = ctx.work_store.clone();

    let needs_update_vec = work_store.drain_needs_update(&chunk_id_str).await?;
    if needs_update_vec.is_empty() {
        return Ok(());
    }
    let needs_update: HashSet<u64> = needs_update_vec.into_iter().collect();

    let chunk_id = ChunkId::parse(&chunk_id_str)?;
    let mut variant = ChunkVariant::classify(chunk_id);

    let flags: HashMap<u64, UpdateFlags> = match &variant {
        ChunkVariant::Detail(_) | ChunkVariant::Base(_) => {
            let mut ids: Vec<u64> = needs_update.iter().copied().collect();
            ids.sort_unstable();
            let token_lists = work_store.drain_flags(&ids).await?;
            ids.into_iter()
                .zip(token_lists)
                .map(|(id, tokens)| (id, UpdateFlags::from_tokens(&tokens)))
                .collect()
        }
        ChunkVariant::Lod(_) => HashMap::new(),
    };

    variant
        .prep(&ctx.store, &ctx.settings, &needs_update, &flags)
        .await?;

    variant = tokio::task::spawn_blocking(move || {
        variant.process();
        variant
    })
    .await?;

    let next = variant.update(&ctx.store, &ctx.settings).await?;

    if let Some(next_id) = next {
        let next_layer = ChunkId::parse(&next_id)?.layer;
        let delay = if next_layer == 1 {
            ctx.settings.l1_update_delay_secs
        } else {
            ctx.settings.l0_update_delay_secs
        };
        ctx.delayed_updates.lock().await.track(
            &next_id,
            u64::from(variant.chunk_id().index),
            delay,
            now_epoch_s(),
        );
    }

    ctx.purge_fifo.lock().await.push(chunk_id_str);

    Ok(())
}
