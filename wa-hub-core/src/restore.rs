//! RestoreScheduler: sequential startup restoration with cooldown, memory
//! gate, attempt cap, backoff.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sysinfo::System;
use tokio::time::Instant;
use tracing::{info, warn};
use wa_hub_model::Instance;

const TICK_INTERVAL: Duration = Duration::from_secs(10);
const MAX_BACKOFF: Duration = Duration::from_secs(120);

struct PendingRestore {
    instance: Instance,
    attempts: u32,
    next_attempt_after: Instant,
}

struct State {
    queue: VecDeque<PendingRestore>,
    processing: bool,
    last_processed_at: Option<Instant>,
}

/// Bounded-concurrency (default 1) sequential restore of persisted
/// instances at startup.
pub struct RestoreScheduler {
    concurrency: usize,
    cooldown: Duration,
    min_free_mem_mb: u64,
    max_attempts: u32,
    state: Mutex<State>,
}

impl RestoreScheduler {
    pub fn new(concurrency: usize, cooldown: Duration, min_free_mem_mb: u64, max_attempts: u32) -> Self {
        Self {
            concurrency: concurrency.max(1),
            cooldown,
            min_free_mem_mb,
            max_attempts,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                processing: false,
                last_processed_at: None,
            }),
        }
    }

    pub fn enqueue(&self, instance: Instance) {
        let mut state = self.state.lock();
        state.queue.push_back(PendingRestore {
            instance,
            attempts: 0,
            next_attempt_after: Instant::now(),
        });
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn free_memory_mb(&self) -> u64 {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.available_memory() / (1024 * 1024)
    }

    /// Pop and process up to `concurrency` ready items (those whose
    /// `next_attempt_after` has elapsed), calling `create_fn` for each and
    /// `mark_failed_fn` once an item exhausts `max_attempts`. Intended to be
    /// driven by a background `tokio::time::interval` tick loop in the
    /// owning binary via `spawn_tick_loop`.
    pub async fn tick<C, CFut, M>(&self, create_fn: &C, mark_failed_fn: &M)
    where
        C: Fn(Instance) -> CFut,
        CFut: std::future::Future<Output = Result<(), String>>,
        M: Fn(Instance, String),
    {
        {
            let state = self.state.lock();
            if state.processing {
                return;
            }
            if let Some(last) = state.last_processed_at {
                if last.elapsed() < self.cooldown {
                    return;
                }
            }
        }

        if self.free_memory_mb() < self.min_free_mem_mb {
            warn!("restore scheduler skipping tick: free memory below threshold");
            return;
        }

        let mut budget = self.concurrency;
        while budget > 0 {
            let now = Instant::now();
            let next = {
                let mut state = self.state.lock();
                let position = state
                    .queue
                    .iter()
                    .position(|item| item.next_attempt_after <= now);
                position.map(|idx| state.queue.remove(idx).unwrap())
            };
            let Some(mut pending) = next else { break };

            {
                let mut state = self.state.lock();
                state.processing = true;
            }

            let id = pending.instance.id.clone();
            let result = create_fn(pending.instance.clone()).await;
            match result {
                Ok(()) => {
                    info!(instance = %id, "restored instance from persisted list");
                }
                Err(reason) => {
                    pending.attempts += 1;
                    if pending.attempts >= self.max_attempts {
                        warn!(instance = %id, attempts = pending.attempts, "giving up restoring instance");
                        mark_failed_fn(pending.instance, reason);
                    } else {
                        let backoff = Duration::from_millis(2_000u64 * (1u64 << pending.attempts.min(6)))
                            .min(MAX_BACKOFF);
                        warn!(instance = %id, attempts = pending.attempts, backoff_ms = backoff.as_millis() as u64, "restore attempt failed, re-queuing");
                        pending.next_attempt_after = Instant::now() + backoff;
                        self.state.lock().queue.push_back(pending);
                    }
                }
            }

            {
                let mut state = self.state.lock();
                state.processing = false;
                state.last_processed_at = Some(Instant::now());
            }
            budget -= 1;
        }
    }

    /// Spawn the 10s tick loop as its own task. Stops when `shutdown` fires.
    pub fn spawn_tick_loop<C, CFut, M>(
        scheduler: Arc<Self>,
        create_fn: C,
        mark_failed_fn: M,
        shutdown: tokio_util::sync::CancellationToken,
    ) where
        C: Fn(Instance) -> CFut + Send + Sync + 'static,
        CFut: std::future::Future<Output = Result<(), String>> + Send,
        M: Fn(Instance, String) + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        scheduler.tick(&create_fn, &mark_failed_fn).await;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wa_hub_model::{InstanceId, WebhookConfig};

    fn instance(id: &str) -> Instance {
        Instance {
            id: InstanceId::parse(id).unwrap(),
            name: id.into(),
            created_at: chrono::Utc::now(),
            webhook: WebhookConfig::new("http://example.invalid").unwrap(),
            typing_enabled: true,
            typing_apply_to: BTreeSet::new(),
        }
    }

    /// With `concurrency` 1, a single `tick()` call pops and processes
    /// exactly one ready item; a second tick (after the cooldown elapses)
    /// drains the rest. Two items need two ticks, not one.
    #[tokio::test(start_paused = true)]
    async fn processes_queued_items_one_per_tick() {
        let scheduler = RestoreScheduler::new(1, Duration::from_millis(0), 0, 5);
        scheduler.enqueue(instance("a"));
        scheduler.enqueue(instance("b"));

        let created = Arc::new(AtomicUsize::new(0));
        let run_tick = |scheduler: &RestoreScheduler, created: &Arc<AtomicUsize>| {
            let created_clone = created.clone();
            scheduler.tick(
                &move |_inst: Instance| {
                    let created = created_clone.clone();
                    async move {
                        created.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                &|_inst, _reason| {},
            )
        };

        run_tick(&scheduler, &created).await;
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending_count(), 1);

        run_tick(&scheduler, &created).await;
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let scheduler = RestoreScheduler::new(1, Duration::from_millis(0), 0, 2);
        scheduler.enqueue(instance("a"));

        let failed = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let failed_clone = failed.clone();
            scheduler
                .tick(
                    &|_inst: Instance| async { Err("boom".to_string()) },
                    &move |_inst, _reason| {
                        failed_clone.fetch_add(1, Ordering::SeqCst);
                    },
                )
                .await;
            tokio::time::advance(Duration::from_secs(130)).await;
        }

        assert_eq!(failed.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending_count(), 0);
    }
}
