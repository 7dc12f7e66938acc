use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::{future, prelude::*};
use log::{info, trace, warn};
use tarpc::{
    context,
    server::{self, incoming::Incoming, Channel},
    tokio_serde::formats::Json,
};

use crate::{Directive, JobService, TaskKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    InProgress { since: Instant },
    Completed,
}

/// Scheduling record for one task. Completed is terminal: timeouts only
/// ever touch a slot still tracked as in progress.
#[derive(Debug)]
struct Slot {
    state: SlotState,
    /// Bumped on every assignment. A watchdog armed for an older generation
    /// finds a mismatch here and must not revert the newer assignment.
    generation: u64,
}

impl Slot {
    fn new() -> Self {
        Slot {
            state: SlotState::Idle,
            generation: 0,
        }
    }

    fn assign(&mut self, now: Instant) -> u64 {
        self.generation += 1;
        self.state = SlotState::InProgress { since: now };
        self.generation
    }

    fn is_idle(&self) -> bool {
        self.state == SlotState::Idle
    }

    fn in_progress(&self) -> bool {
        matches!(self.state, SlotState::InProgress { .. })
    }

    fn completed(&self) -> bool {
        self.state == SlotState::Completed
    }
}

/// Handed back by a successful assignment; the watchdog armed for it may
/// only revert that exact assignment.
#[derive(Debug, Clone, Copy)]
struct Lease {
    kind: TaskKind,
    id: usize,
    generation: u64,
}

/// All job state. Methods are plain synchronous transitions; the caller
/// holds the one lock around each of them, which is what makes "is this
/// task still in progress" a race-free question.
struct JobState {
    files: Vec<PathBuf>,
    nreduce: usize,
    maps: Vec<Slot>,
    /// Empty until the last map task completes; reduce slots must not
    /// exist, let alone be assignable, while any map is outstanding.
    reduces: Vec<Slot>,
}

impl JobState {
    fn new(files: Vec<PathBuf>, nreduce: usize) -> Self {
        let maps = files.iter().map(|_| Slot::new()).collect();
        let mut state = JobState {
            files,
            nreduce,
            maps,
            reduces: Vec::new(),
        };
        if state.files.is_empty() {
            state.unlock_reduces();
        }
        state
    }

    fn unlock_reduces(&mut self) {
        debug_assert!(self.reduces.is_empty());
        info!("map phase complete, {} reduce tasks assignable", self.nreduce);
        self.reduces = (0..self.nreduce).map(|_| Slot::new()).collect();
    }

    /// Picks work for one caller: an idle map task, else Wait while any map
    /// is outstanding, else an idle reduce task, else Wait, else Done.
    fn acquire(&mut self, now: Instant) -> (Directive, Option<Lease>) {
        if let Some(id) = self.maps.iter().position(Slot::is_idle) {
            let generation = self.maps[id].assign(now);
            let directive = Directive::Map {
                task_id: id,
                input: self.files[id].clone(),
                reducer_count: self.nreduce,
            };
            return (
                directive,
                Some(Lease {
                    kind: TaskKind::Map,
                    id,
                    generation,
                }),
            );
        }
        if self.maps.iter().any(Slot::in_progress) {
            return (Directive::Wait, None);
        }
        if let Some(id) = self.reduces.iter().position(Slot::is_idle) {
            let generation = self.reduces[id].assign(now);
            let directive = Directive::Reduce {
                task_id: id,
                map_task_count: self.files.len(),
            };
            return (
                directive,
                Some(Lease {
                    kind: TaskKind::Reduce,
                    id,
                    generation,
                }),
            );
        }
        if self.reduces.iter().any(Slot::in_progress) {
            return (Directive::Wait, None);
        }
        (Directive::Done, None)
    }

    /// Records a completion. Returns false for stale reports: duplicates,
    /// reports for a task already reverted by its watchdog, and ids the job
    /// never had. Those must be discarded without complaint.
    fn complete(&mut self, kind: TaskKind, id: usize) -> bool {
        let slot = match kind {
            TaskKind::Map => self.maps.get_mut(id),
            TaskKind::Reduce => self.reduces.get_mut(id),
        };
        let slot = match slot {
            Some(s) => s,
            None => return false,
        };
        match slot.state {
            SlotState::InProgress { since } => {
                trace!("{:?} task {} ran for {:?}", kind, id, since.elapsed());
                slot.state = SlotState::Completed;
            }
            SlotState::Idle | SlotState::Completed => return false,
        }
        if kind == TaskKind::Map
            && self.reduces.is_empty()
            && self.maps.iter().all(Slot::completed)
        {
            self.unlock_reduces();
        }
        true
    }

    /// Watchdog expiry. Reverts the slot to idle only if the assignment the
    /// watchdog was armed for is still the current one and still running.
    fn expire(&mut self, kind: TaskKind, id: usize, generation: u64) -> bool {
        let slot = match kind {
            TaskKind::Map => self.maps.get_mut(id),
            TaskKind::Reduce => self.reduces.get_mut(id),
        };
        match slot {
            Some(s) if s.generation == generation && s.in_progress() => {
                s.state = SlotState::Idle;
                true
            }
            _ => false,
        }
    }

    fn done(&self) -> bool {
        self.maps.iter().all(Slot::completed)
            && self.reduces.len() == self.nreduce
            && self.reduces.iter().all(Slot::completed)
    }
}

/// Single point of coordination for one job. Cheap to clone; clones share
/// the same state, so the driver can keep one handle for `done` polling
/// while the server serves from another.
#[derive(Clone)]
pub struct Coordinator {
    state: Arc<Mutex<JobState>>,
    timeout: Duration,
}

impl Coordinator {
    pub fn new(files: Vec<PathBuf>, nreduce: usize, timeout: Duration) -> Self {
        Coordinator {
            state: Arc::new(Mutex::new(JobState::new(files, nreduce))),
            timeout,
        }
    }

    /// True once every map and reduce task has completed.
    pub fn done(&self) -> bool {
        self.state.lock().unwrap().done()
    }

    fn arm_watchdog(&self, lease: Lease) {
        let state = Arc::clone(&self.state);
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let reverted = state
                .lock()
                .unwrap()
                .expire(lease.kind, lease.id, lease.generation);
            if reverted {
                warn!(
                    "{:?} task {} unreported after {:?}, reassigning",
                    lease.kind, lease.id, timeout
                );
            }
        });
    }

    /// Serves worker RPCs on localhost:`port` until the process exits.
    pub async fn launch(&self, port: u16) -> io::Result<()> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let mut listener = tarpc::serde_transport::tcp::listen(&addr, Json::default).await?;
        listener.config_mut().max_frame_length(usize::MAX);
        info!("coordinator listening on {}", listener.local_addr());
        listener
            // Ignore accept errors.
            .filter_map(|r| future::ready(r.ok()))
            .map(server::BaseChannel::with_defaults)
            // Limit channels to 10 per IP.
            .max_channels_per_key(10, |t| t.transport().peer_addr().unwrap().ip())
            .map(|channel| channel.execute(self.clone().serve()).for_each(spawn))
            .buffer_unordered(10)
            .for_each(|_| async {})
            .await;
        Ok(())
    }
}

async fn spawn(fut: impl std::future::Future<Output = ()> + Send + 'static) {
    tokio::spawn(fut);
}

impl JobService for Coordinator {
    async fn acquire_task(self, _: context::Context) -> Directive {
        let (directive, lease) = self.state.lock().unwrap().acquire(Instant::now());
        if let Some(lease) = lease {
            trace!(
                "assigned {:?} task {} (generation {})",
                lease.kind,
                lease.id,
                lease.generation
            );
            self.arm_watchdog(lease);
        }
        directive
    }

    async fn task_done(self, _: context::Context, kind: TaskKind, id: usize) {
        if self.state.lock().unwrap().complete(kind, id) {
            info!("{:?} task {} completed", kind, id);
        } else {
            trace!("discarding stale completion report for {:?} task {}", kind, id);
        }
    }

    async fn done(self, _: context::Context) -> bool {
        self.state.lock().unwrap().done()
    }

    async fn echo(self, _: context::Context, x: i32) -> i32 {
        x + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(nmap: usize, nreduce: usize) -> JobState {
        let files = (0..nmap)
            .map(|i| PathBuf::from(format!("in-{}.txt", i)))
            .collect();
        JobState::new(files, nreduce)
    }

    fn acquire_map(state: &mut JobState) -> (usize, Lease) {
        match state.acquire(Instant::now()) {
            (Directive::Map { task_id, .. }, Some(lease)) => (task_id, lease),
            other => panic!("expected a map assignment, got {:?}", other.0),
        }
    }

    fn acquire_reduce(state: &mut JobState) -> (usize, Lease) {
        match state.acquire(Instant::now()) {
            (Directive::Reduce { task_id, .. }, Some(lease)) => (task_id, lease),
            other => panic!("expected a reduce assignment, got {:?}", other.0),
        }
    }

    #[test]
    fn each_idle_map_task_is_assigned_once() {
        let mut state = job(3, 2);
        let mut ids: Vec<usize> = (0..3).map(|_| acquire_map(&mut state).0).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(matches!(
            state.acquire(Instant::now()),
            (Directive::Wait, None)
        ));
    }

    #[test]
    fn no_reduce_work_while_a_map_is_outstanding() {
        let mut state = job(2, 2);
        acquire_map(&mut state);
        acquire_map(&mut state);
        assert!(state.complete(TaskKind::Map, 0));
        // Map 1 is still in progress; reduce work must be withheld.
        assert!(matches!(
            state.acquire(Instant::now()),
            (Directive::Wait, None)
        ));
        assert!(state.reduces.is_empty());
    }

    #[test]
    fn last_map_completion_unlocks_all_reduces_at_once() {
        let mut state = job(2, 3);
        acquire_map(&mut state);
        acquire_map(&mut state);
        assert!(state.complete(TaskKind::Map, 1));
        assert!(state.reduces.is_empty());
        assert!(state.complete(TaskKind::Map, 0));
        assert_eq!(state.reduces.len(), 3);

        let mut ids: Vec<usize> = (0..3).map(|_| acquire_reduce(&mut state).0).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2]);
        match state.acquire(Instant::now()) {
            (Directive::Wait, None) => {}
            other => panic!("expected Wait, got {:?}", other.0),
        }
    }

    #[test]
    fn reduce_reply_carries_the_map_task_count() {
        let mut state = job(4, 1);
        for _ in 0..4 {
            acquire_map(&mut state);
        }
        for id in 0..4 {
            assert!(state.complete(TaskKind::Map, id));
        }
        match state.acquire(Instant::now()) {
            (
                Directive::Reduce {
                    map_task_count, ..
                },
                Some(_),
            ) => assert_eq!(map_task_count, 4),
            other => panic!("expected a reduce assignment, got {:?}", other.0),
        }
    }

    #[test]
    fn done_iff_every_task_completed() {
        let mut state = job(2, 2);
        assert!(!state.done());
        acquire_map(&mut state);
        acquire_map(&mut state);
        state.complete(TaskKind::Map, 0);
        state.complete(TaskKind::Map, 1);
        assert!(!state.done());
        acquire_reduce(&mut state);
        acquire_reduce(&mut state);
        state.complete(TaskKind::Reduce, 0);
        assert!(!state.done());
        state.complete(TaskKind::Reduce, 1);
        assert!(state.done());
        assert!(matches!(
            state.acquire(Instant::now()),
            (Directive::Done, None)
        ));
    }

    #[test]
    fn stale_completion_reports_are_discarded() {
        let mut state = job(1, 1);
        // Never assigned: the report is stale.
        assert!(!state.complete(TaskKind::Map, 0));
        assert!(state.maps[0].is_idle());

        let (id, _) = acquire_map(&mut state);
        assert!(state.complete(TaskKind::Map, id));
        // Duplicate retry of the same report.
        assert!(!state.complete(TaskKind::Map, id));
        assert!(state.maps[id].completed());

        // An id the job never had.
        assert!(!state.complete(TaskKind::Map, 99));
        assert!(!state.complete(TaskKind::Reduce, 99));
    }

    #[test]
    fn timed_out_task_reverts_and_is_reassigned() {
        let mut state = job(1, 1);
        let (id, lease) = acquire_map(&mut state);
        assert!(state.expire(lease.kind, lease.id, lease.generation));
        assert!(state.maps[id].is_idle());

        // The same task identity is offered again, under a new generation.
        let (id2, lease2) = acquire_map(&mut state);
        assert_eq!(id, id2);
        assert!(lease2.generation > lease.generation);
    }

    #[test]
    fn stale_generation_watchdog_cannot_revert_a_reassignment() {
        let mut state = job(1, 1);
        let (_, first) = acquire_map(&mut state);
        assert!(state.expire(first.kind, first.id, first.generation));
        let (_, second) = acquire_map(&mut state);

        // The first assignment's delayed watchdog fires after reassignment.
        assert!(!state.expire(first.kind, first.id, first.generation));
        assert!(state.maps[first.id].in_progress());

        // The live watchdog still works.
        assert!(state.expire(second.kind, second.id, second.generation));
        assert!(state.maps[second.id].is_idle());
    }

    #[test]
    fn late_report_from_the_original_worker_is_ignored_after_timeout() {
        let mut state = job(1, 1);
        let (id, lease) = acquire_map(&mut state);
        assert!(state.expire(lease.kind, lease.id, lease.generation));
        // The original worker finally finishes and reports; the task has
        // already been reverted, so nothing may change.
        assert!(!state.complete(TaskKind::Map, id));
        assert!(state.maps[id].is_idle());

        // A second attempt then runs it to completion.
        let (id2, _) = acquire_map(&mut state);
        assert_eq!(id, id2);
        assert!(state.complete(TaskKind::Map, id2));
        assert!(state.maps[id2].completed());
    }

    #[test]
    fn watchdog_expiry_after_completion_is_a_noop() {
        let mut state = job(1, 1);
        let (id, lease) = acquire_map(&mut state);
        assert!(state.complete(TaskKind::Map, id));
        assert!(!state.expire(lease.kind, lease.id, lease.generation));
        assert!(state.maps[id].completed());
    }

    #[test]
    fn empty_input_list_goes_straight_to_reduce_phase() {
        let mut state = job(0, 2);
        let (id, _) = acquire_reduce(&mut state);
        match state.acquire(Instant::now()) {
            (Directive::Reduce { task_id, .. }, Some(_)) => assert_ne!(task_id, id),
            other => panic!("expected a reduce assignment, got {:?}", other.0),
        }
        state.complete(TaskKind::Reduce, 0);
        state.complete(TaskKind::Reduce, 1);
        assert!(state.done());
    }

    #[test]
    fn zero_reducers_finish_after_the_map_phase() {
        let mut state = job(1, 0);
        let (id, _) = acquire_map(&mut state);
        assert!(state.complete(TaskKind::Map, id));
        assert!(state.done());
        assert!(matches!(
            state.acquire(Instant::now()),
            (Directive::Done, None)
        ));
    }
}
