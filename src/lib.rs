//! A small fault-tolerant MapReduce: one coordinator, many stateless
//! workers, connected by tarpc. The coordinator hands out map tasks until
//! every one of them has completed, then hands out reduce tasks, and
//! reassigns anything a crashed or straggling worker failed to report
//! within the deadline.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub mod app;
mod coordinator;
mod worker;

pub use coordinator::Coordinator;
pub use worker::Worker;

#[tarpc::service]
pub trait JobService {
    /// Ask the coordinator for work.
    async fn acquire_task() -> Directive;
    /// Report a finished task. Stale and duplicate reports are accepted
    /// and discarded, so this always succeeds from the caller's side.
    async fn task_done(kind: TaskKind, id: usize);
    /// True once every map and reduce task has completed. No side effects.
    async fn done() -> bool;
    /// Connectivity smoke test, replies with `x + 1`.
    async fn echo(x: i32) -> i32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    Map,
    Reduce,
}

/// Reply to `acquire_task`. Both sides match on this exhaustively; adding
/// a variant is a compile-time-checked change in the coordinator and in
/// every worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Directive {
    Map {
        task_id: usize,
        input: PathBuf,
        reducer_count: usize,
    },
    Reduce {
        task_id: usize,
        map_task_count: usize,
    },
    Wait,
    Done,
}

/// One intermediate record, encoded as a single JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Routes a key to a reduce partition in `0..nreduce`.
///
/// Every worker in a job must route a given key identically, whichever map
/// task emitted it, so the hash is pinned here rather than left to callers.
pub fn partition(key: &str, nreduce: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % nreduce
}

/// Path of the intermediate artifact written by map task `map_id` for
/// partition `reduce_id`.
pub fn intermediate_path(dir: &Path, map_id: usize, reduce_id: usize) -> PathBuf {
    dir.join(format!("mr-{}-{}", map_id, reduce_id))
}

/// Path of the final artifact for reduce task `reduce_id`.
pub fn output_path(dir: &Path, reduce_id: usize) -> PathBuf {
    dir.join(format!("mr-out-{}", reduce_id))
}
