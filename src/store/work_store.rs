//! Redis-backed work store (spec.md §6 "Work store protocol", §4.D).
//!
//! Three server-side atomic scripts back the pipeline's queue/set
//! operations: `drain-needs-update`, `drain-flags`, and `schedule-parent`.
//! Scripts are loaded once and invoked via `redis::Script`, the idiomatic
//! way to get atomic multi-command semantics from the async `redis` crate.

use std::sync::Arc;

use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};

use crate::config::{NEEDS_UPDATE_FLAGS_PREFIX, NEEDS_UPDATE_PREFIX, WORK_QUEUE_KEY};
use crate::error::PipelineError;

/// `SMEMBERS` then `DEL` of `up:nu:<chunk_id>`, returning the members.
const DRAIN_NEEDS_UPDATE: &str = r"
local members = redis.call('SMEMBERS', KEYS[1])
redis.call('DEL', KEYS[1])
return members
";

/// For each key in `KEYS`: `SMEMBERS`, then `DEL` all keys; returns an
/// array of arrays parallel to `KEYS` order.
const DRAIN_FLAGS: &str = r"
local out = {}
for i, key in ipairs(KEYS) do
    out[i] = redis.call('SMEMBERS', key)
end
for _, key in ipairs(KEYS) do
    redis.call('DEL', key)
end
return out
";

/// `SADD` `ARGV[1]` into `KEYS[1]`; if the set was newly created and at
/// least one member was added, `EXPIRE` it and `LPUSH` `ARGV[2]` onto
/// `KEYS[2]`.
const SCHEDULE_PARENT: &str = r"
local existed = redis.call('EXISTS', KEYS[1])
local added = redis.call('SADD', KEYS[1], ARGV[1])
if existed == 0 and added > 0 then
    redis.call('EXPIRE', KEYS[1], ARGV[3])
    redis.call('LPUSH', KEYS[2], ARGV[2])
    return 1
end
return 0
";

struct Scripts {
    drain_needs_update: Script,
    drain_flags: Script,
    schedule_parent: Script,
}

/// Cheaply `Clone`-able: `MultiplexedConnection` is designed for concurrent
/// in-flight requests from clones sharing one underlying connection, and
/// the compiled scripts are immutable once loaded.
#[derive(Clone)]
pub struct WorkStore {
    conn: MultiplexedConnection,
    scripts: Arc<Scripts>,
}

impl WorkStore {
    pub async fn connect(redis_url: &str) -> Result<Self, PipelineError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| PipelineError::StoreError(e.to_string()))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| PipelineError::StoreError(e.to_string()))?;

        Ok(Self {
            conn,
            scripts: Arc::new(Scripts {
                drain_needs_update: Script::new(DRAIN_NEEDS_UPDATE),
                drain_flags: Script::new(DRAIN_FLAGS),
                schedule_parent: Script::new(SCHEDULE_PARENT),
            }),
        })
    }

    /// Blocking right-pop on the work queue with a server-side timeout.
    pub async fn brpop(&mut self, timeout_secs: f64) -> Result<Option<String>, PipelineError> {
        let result: Option<(String, String)> = self
            .conn
            .brpop(WORK_QUEUE_KEY, timeout_secs)
            .await
            .map_err(|e| PipelineError::StoreError(e.to_string()))?;
        Ok(result.map(|(_key, id)| id))
    }

    /// Requeues `id` at the head of the work queue (duplicate in-flight
    /// pop, spec.md §4.I step 5).
    pub async fn requeue_head(&mut self, id: &str) -> Result<(), PipelineError> {
        self.conn
            .lpush::<_, _, ()>(WORK_QUEUE_KEY, id)
            .await
            .map_err(|e| PipelineError::StoreError(e.to_string()))
    }

    /// Atomically reads and clears the `needs_update` set for `chunk_id`.
    pub async fn drain_needs_update(&mut self, chunk_id: &str) -> Result<Vec<u64>, PipelineError> {
        let key = format!("{NEEDS_UPDATE_PREFIX}{chunk_id}");
        let raw: Vec<String> = self
            .scripts
            .drain_needs_update
            .key(key)
            .invoke_async(&mut self.conn)
            .await
            .map_err(|e| PipelineError::StoreError(e.to_string()))?;

        raw.into_iter()
            .map(|s| {
                s.parse::<u64>()
                    .map_err(|_| PipelineError::StoreError(format!("non-numeric child id {s:?}")))
            })
            .collect()
    }

    /// Atomically reads and clears the update-flag sets for `child_ids`,
    /// returning the parsed flag tokens per child in input order.
    pub async fn drain_flags(
        &mut self,
        child_ids: &[u64],
    ) -> Result<Vec<Vec<String>>, PipelineError> {
        if child_ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = child_ids
            .iter()
            .map(|id| format!("{NEEDS_UPDATE_FLAGS_PREFIX}{id}"))
            .collect();

        let mut invocation = self.scripts.drain_flags.prepare_invoke();
        for key in &keys {
            invocation.key(key);
        }
        invocation
            .invoke_async(&mut self.conn)
            .await
            .map_err(|e| PipelineError::StoreError(e.to_string()))
    }

    /// Schedules `this_id` as a child needing update under `parent_id`,
    /// atomically. `expire_secs` bounds how long an orphaned needs-update
    /// set survives if nothing ever drains it.
    pub async fn schedule_parent(
        &mut self,
        parent_id: &str,
        this_id: u64,
        expire_secs: i64,
    ) -> Result<(), PipelineError> {
        let parent_set_key = format!("{NEEDS_UPDATE_PREFIX}{parent_id}");
        self.scripts
            .schedule_parent
            .key(parent_set_key)
            .key(WORK_QUEUE_KEY)
            .arg(this_id)
            .arg(parent_id)
            .arg(expire_secs)
            .invoke_async::<()>(&mut self.conn)
            .await
            .map_err(|e| PipelineError::StoreError(e.to_string()))
    }
}
