use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use iamac_db::WorkflowEventRow;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::event_types;
use crate::StateTransition;

/// Handed to every activity body: the `activity.heartbeat()` /
/// `activity.is_cancelled()` pair Temporal-style activities expect.
#[derive(Clone)]
pub struct ActivityCtx {
    cancel: CancellationToken,
}

impl ActivityCtx {
    /// Public so activity bodies can be unit-tested directly (without
    /// driving them through `WorkflowCtx::execute_activity`), mirroring how
    /// the original Python activities could be called with a bare
    /// `ActivityEnvironment` in their own test suite.
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Records liveness. In this in-process engine there is no remote
    /// server to report to; the call exists so activity bodies carry the
    /// same heartbeat discipline as the original Python activities, and so
    /// a future out-of-process engine can observe it without changing
    /// activity code.
    pub fn heartbeat(&self) {
        tracing::trace!("activity heartbeat");
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Retry policy for `WorkflowCtx::execute_activity`. Mirrors the
/// attempt-cap framing used throughout spec.md §4.3 (`phase_cap`), not a
/// generic exponential-backoff library default.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::from_secs(0),
            backoff_coefficient: 1.0,
        }
    }

    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            backoff_coefficient: 1.0,
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_coefficient.powi(attempt as i32 - 1);
        Duration::from_secs_f64(self.initial_interval.as_secs_f64() * multiplier)
    }
}

/// Deterministic execution context for one workflow run.
///
/// Holds the run's full event log (loaded once at claim time) and a cursor
/// into it. Every `execute_activity`/`wait_timer`/`wait_for_signal` call
/// first checks whether the next logged event already answers the call
/// (replay); only once the cursor runs past the end of the log does it fall
/// through to doing real work and appending a new event.
pub struct WorkflowCtx {
    pool: PgPool,
    run_id: String,
    events: Vec<WorkflowEventRow>,
    cursor: usize,
    history: Vec<StateTransition>,
    cancel: CancellationToken,
}

impl WorkflowCtx {
    pub fn new(
        pool: PgPool,
        run_id: String,
        events: Vec<WorkflowEventRow>,
        cancel: CancellationToken,
    ) -> Self {
        let history = events
            .iter()
            .filter(|e| e.event_type == event_types::STATE_TRANSITION)
            .filter_map(|e| serde_json::from_value::<StateTransition>(e.payload.clone()).ok())
            .collect();

        Self {
            pool,
            run_id,
            events,
            cursor: 0,
            history,
            cancel,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn history_snapshot(&self) -> Vec<StateTransition> {
        self.history.clone()
    }

    /// True once the cursor has passed every event loaded at claim time —
    /// everything from here on is live execution, not replay.
    fn is_replaying(&self) -> bool {
        self.cursor < self.events.len()
    }

    fn next_event(&mut self) -> Option<&WorkflowEventRow> {
        let event = self.events.get(self.cursor);
        if event.is_some() {
            self.cursor += 1;
        }
        event
    }

    async fn append(&self, event_type: &str, payload: &Value) -> Result<i64> {
        iamac_db::workflow_record_event(&self.pool, &self.run_id, event_type, payload)
            .await
            .context("workflow_record_event failed")
    }

    /// Records an in-memory + durable state transition. The in-memory
    /// `history` vector is what `stateHistory` queries read.
    pub async fn record_transition(&mut self, old_state: &str, new_state: &str) -> Result<()> {
        let transition = StateTransition {
            old_state: old_state.to_string(),
            new_state: new_state.to_string(),
        };

        if self.is_replaying() {
            self.next_event();
            return Ok(());
        }

        self.append(
            event_types::STATE_TRANSITION,
            &serde_json::to_value(&transition)?,
        )
        .await?;
        self.history.push(transition);
        Ok(())
    }

    /// Executes (or replays) one named activity. `name` must be stable and
    /// unique within a single workflow run's call sequence — the same
    /// discipline Temporal requires of activity call ordering for
    /// deterministic replay.
    pub async fn execute_activity<T, F, Fut>(
        &mut self,
        name: &str,
        policy: RetryPolicy,
        timeout: Duration,
        body: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(ActivityCtx) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let completed_type = format!("{}{}", event_types::ACTIVITY_COMPLETED_PREFIX, name);
        let failed_type = format!("{}{}", event_types::ACTIVITY_FAILED_PREFIX, name);

        if self.is_replaying() {
            let event = self
                .next_event()
                .ok_or_else(|| anyhow!("replay cursor ran past recorded history for {name}"))?
                .clone();
            if event.event_type == completed_type {
                return serde_json::from_value(event.payload)
                    .with_context(|| format!("failed to decode replayed result for {name}"));
            }
            if event.event_type == failed_type {
                let reason = event
                    .payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("activity failed")
                    .to_string();
                return Err(anyhow!(reason));
            }
            return Err(anyhow!(
                "replay mismatch: expected activity event for {name}, found {}",
                event.event_type
            ));
        }

        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 1..=policy.max_attempts {
            if self.cancel.is_cancelled() {
                anyhow::bail!("workflow cancelled before activity {name} attempt {attempt}");
            }

            if attempt > 1 {
                tokio::time::sleep(policy.delay_for_attempt(attempt - 1)).await;
            }

            let activity_ctx = ActivityCtx::new(self.cancel.clone());
            let result = tokio::time::timeout(timeout, body(activity_ctx)).await;

            match result {
                Ok(Ok(value)) => {
                    let payload = serde_json::to_value(&value)?;
                    self.append(&completed_type, &payload).await?;
                    return Ok(value);
                }
                Ok(Err(err)) => {
                    last_err = Some(err);
                }
                Err(_) => {
                    last_err = Some(anyhow!("activity {name} timed out after {timeout:?}"));
                }
            }
        }

        let reason = last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "activity failed with no error detail".to_string());
        self.append(&failed_type, &serde_json::json!({ "reason": reason }))
            .await?;
        Err(anyhow!(reason))
    }

    /// Durable timer. On replay, a previously-recorded `timer.fired` simply
    /// advances the cursor; live execution sleeps for real and records one.
    pub async fn wait_timer(&mut self, duration: Duration) -> Result<()> {
        if self.is_replaying() {
            let event = self
                .next_event()
                .ok_or_else(|| anyhow!("replay cursor ran past recorded history for timer"))?;
            anyhow::ensure!(
                event.event_type == event_types::TIMER_FIRED,
                "replay mismatch: expected timer.fired, found {}",
                event.event_type
            );
            return Ok(());
        }

        tokio::time::sleep(duration).await;
        self.append(event_types::TIMER_FIRED, &Value::Null).await?;
        Ok(())
    }

    /// Blocks (subject to `poll_interval`/`deadline`) until a signal named
    /// `signal_name` has been delivered, consuming it from
    /// `workflow_signals` and recording the consumption as a replayable
    /// event. Returns `None` if `deadline` elapses first.
    pub async fn wait_for_signal(
        &mut self,
        signal_name: &str,
        poll_interval: Duration,
        deadline: Option<Duration>,
    ) -> Result<Option<Value>> {
        let event_type = format!("{}{}", event_types::SIGNAL_RECEIVED_PREFIX, signal_name);

        if self.is_replaying() {
            let event = self
                .next_event()
                .ok_or_else(|| anyhow!("replay cursor ran past recorded history for signal {signal_name}"))?
                .clone();
            if event.event_type == event_type {
                return Ok(Some(event.payload));
            }
            anyhow::ensure!(
                event.event_type == "signal.timeout",
                "replay mismatch: expected {event_type} or signal.timeout, found {}",
                event.event_type
            );
            return Ok(None);
        }

        let start = tokio::time::Instant::now();
        loop {
            if self.cancel.is_cancelled() {
                anyhow::bail!("workflow cancelled while waiting for signal {signal_name}");
            }

            let pending = iamac_db::workflow_unconsumed_signals(&self.pool, &self.run_id)
                .await
                .context("workflow_unconsumed_signals failed")?;

            if let Some(row) = pending.into_iter().find(|s| s.signal_name == signal_name) {
                iamac_db::workflow_consume_signal(&self.pool, row.id)
                    .await
                    .context("workflow_consume_signal failed")?;
                self.append(&event_type, &row.payload).await?;
                return Ok(Some(row.payload));
            }

            if let Some(deadline) = deadline {
                if start.elapsed() >= deadline {
                    self.append("signal.timeout", &Value::Null).await?;
                    return Ok(None);
                }
            }

            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn lazy_pool() -> PgPool {
        sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://unused/unused")
            .expect("connect_lazy never touches the network")
    }

    fn event(seq: i64, event_type: &str, payload: Value) -> WorkflowEventRow {
        WorkflowEventRow {
            run_id: "run_1".to_string(),
            seq,
            event_type: event_type.to_string(),
            payload,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn execute_activity_replays_a_completed_event_without_running_the_body() {
        let events = vec![event(
            1,
            "activity.completed:assemble_context",
            serde_json::json!(42),
        )];
        let mut ctx = WorkflowCtx::new(lazy_pool(), "run_1".to_string(), events, CancellationToken::new());

        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_clone = ran.clone();

        let result: Result<i32> = ctx
            .execute_activity(
                "assemble_context",
                RetryPolicy::no_retry(),
                Duration::from_secs(5),
                move |_activity_ctx| {
                    ran_clone.store(true, std::sync::atomic::Ordering::SeqCst);
                    async move { Ok(0) }
                },
            )
            .await;

        assert_eq!(result.unwrap(), 42);
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst), "replay must not re-run the body");
    }

    #[tokio::test]
    async fn execute_activity_replays_a_failed_event_as_an_error() {
        let events = vec![event(
            1,
            "activity.failed:generate_patch",
            serde_json::json!({"reason": "llm timeout"}),
        )];
        let mut ctx = WorkflowCtx::new(lazy_pool(), "run_1".to_string(), events, CancellationToken::new());

        let result: Result<i32> = ctx
            .execute_activity(
                "generate_patch",
                RetryPolicy::no_retry(),
                Duration::from_secs(5),
                |_activity_ctx| async move { Ok(0) },
            )
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "llm timeout");
    }

    #[tokio::test]
    async fn wait_timer_replays_instantly_instead_of_sleeping() {
        let events = vec![event(1, event_types::TIMER_FIRED, Value::Null)];
        let mut ctx = WorkflowCtx::new(lazy_pool(), "run_1".to_string(), events, CancellationToken::new());

        let start = tokio::time::Instant::now();
        ctx.wait_timer(Duration::from_secs(3600)).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn history_snapshot_is_rebuilt_from_state_transition_events_on_replay() {
        let events = vec![event(
            1,
            event_types::STATE_TRANSITION,
            serde_json::to_value(StateTransition {
                old_state: "PENDING".to_string(),
                new_state: "ANALYZING".to_string(),
            })
            .unwrap(),
        )];
        let ctx = WorkflowCtx::new(lazy_pool(), "run_1".to_string(), events, CancellationToken::new());

        let history = ctx.history_snapshot();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].old_state, "PENDING");
        assert_eq!(history[0].new_state, "ANALYZING");
    }
}
