//! Proactive loop: run a cycle, wait, run the next one.
//!
//! Every cycle is a fresh run (`<correlation_id>-cycle-<n>`) linked to the
//! loop by its correlation id. The only state carried between cycles is the
//! bounded history and the most recent problem sets already notified.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn, Instrument};

use crate::config::{CycleConfig, LoopConfig};
use crate::domain::{CyclePhase, CycleState, RepairError, Result};
use crate::notify::{notifier_for, Notifier, ProblemNotification};
use crate::obs;
use crate::orchestrator::{RepairOrchestrator, RunHandle};

/// Control messages accepted by a running loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopControl {
    /// Finish after the current cycle, or right away if waiting.
    RequestExit,
    /// Cut the current wait short and start the next cycle.
    StopWaiting,
}

/// One finished cycle in the loop's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub run_id: String,
    pub iteration: u32,
    pub phase: Option<CyclePhase>,
    pub problems: usize,
    pub repaired: usize,
    pub skipped: usize,
    pub failed: usize,
    pub notified: bool,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Live view of a loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopStatus {
    pub correlation_id: String,
    /// Phase of the running cycle, or WAITING-FOR-NEXT-CYCLE between cycles.
    pub phase: CyclePhase,
    pub iteration: u32,
    pub current_run_id: Option<String>,
    pub next_cycle_at: Option<DateTime<Utc>>,
    pub history: VecDeque<CycleSummary>,
    pub exit_requested: bool,
    pub finished: bool,
}

impl LoopStatus {
    fn new(correlation_id: &str) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            phase: CyclePhase::DetectingProblems,
            iteration: 0,
            current_run_id: None,
            next_cycle_at: None,
            history: VecDeque::new(),
            exit_requested: false,
            finished: false,
        }
    }
}

/// Handle to a spawned loop.
#[derive(Debug)]
pub struct LoopHandle {
    correlation_id: String,
    status: watch::Receiver<LoopStatus>,
    control: mpsc::UnboundedSender<LoopControl>,
    join: JoinHandle<Result<LoopStatus>>,
}

impl LoopHandle {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn status(&self) -> LoopStatus {
        self.status.borrow().clone()
    }

    pub fn request_exit(&self) -> Result<()> {
        self.send(LoopControl::RequestExit)
    }

    pub fn stop_waiting(&self) -> Result<()> {
        self.send(LoopControl::StopWaiting)
    }

    fn send(&self, msg: LoopControl) -> Result<()> {
        self.control
            .send(msg)
            .map_err(|_| RepairError::LoopNotFound {
                correlation_id: self.correlation_id.clone(),
            })
    }

    pub async fn wait_until<F>(&self, pred: F) -> Result<LoopStatus>
    where
        F: FnMut(&LoopStatus) -> bool,
    {
        let mut rx = self.status.clone();
        let status = rx
            .wait_for(pred)
            .await
            .map_err(|_| RepairError::TaskAborted("loop ended before the condition held".into()))?;
        Ok(status.clone())
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the loop to end and return its final status.
    pub async fn wait(self) -> Result<LoopStatus> {
        self.join
            .await
            .map_err(|e| RepairError::TaskAborted(e.to_string()))?
    }
}

/// A configured loop, ready to spawn.
pub struct ProactiveLoop {
    orchestrator: RepairOrchestrator,
    correlation_id: String,
    cycle: CycleConfig,
    config: LoopConfig,
    notifier: Option<Arc<dyn Notifier>>,
}

impl ProactiveLoop {
    pub fn new(
        orchestrator: RepairOrchestrator,
        correlation_id: impl Into<String>,
        cycle: CycleConfig,
        config: LoopConfig,
    ) -> Result<Self> {
        cycle.validate()?;
        config.validate()?;
        let notifier = match &config.notification {
            Some(target) => Some(notifier_for(target, orchestrator.store())?),
            None => None,
        };
        Ok(Self {
            orchestrator,
            correlation_id: correlation_id.into(),
            cycle,
            config,
            notifier,
        })
    }

    /// Replace the notifier built from the config.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn spawn(self) -> LoopHandle {
        let correlation_id = self.correlation_id.clone();
        let (status_tx, status_rx) = watch::channel(LoopStatus::new(&correlation_id));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let span = tracing::info_span!("repair.loop", correlation_id = %correlation_id);
        let join = tokio::spawn(self.run(status_tx, control_rx).instrument(span));
        LoopHandle {
            correlation_id,
            status: status_rx,
            control: control_tx,
            join,
        }
    }

    async fn run(
        self,
        status_tx: watch::Sender<LoopStatus>,
        mut control: mpsc::UnboundedReceiver<LoopControl>,
    ) -> Result<LoopStatus> {
        let mut status = LoopStatus::new(&self.correlation_id);
        let mut notified = NotifiedSets::new(self.config.history_limit);
        info!(interval_secs = self.config.interval.as_secs(), "proactive loop started");

        loop {
            status.iteration += 1;
            let run_id = format!("{}-cycle-{}", self.correlation_id, status.iteration);
            status.current_run_id = Some(run_id.clone());
            status.next_cycle_at = None;
            status.phase = CyclePhase::DetectingProblems;
            status_tx.send_replace(status.clone());

            let summary = match self
                .orchestrator
                .start(&run_id, self.cycle.clone(), Some(self.correlation_id.clone()))
                .await
            {
                Ok(handle) => {
                    self.follow(handle, &mut status, &status_tx, &mut control, &mut notified)
                        .await
                }
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "loop cycle failed to start");
                    failed_summary(&run_id, status.iteration, &e)
                }
            };
            status.history.push_back(summary);
            while status.history.len() > self.config.history_limit {
                status.history.pop_front();
            }
            status.current_run_id = None;
            status_tx.send_replace(status.clone());

            let reached_max = self
                .config
                .max_cycles
                .is_some_and(|max| status.iteration >= max);
            if status.exit_requested || reached_max {
                break;
            }

            let interval = self.config.interval;
            status.phase = CyclePhase::WaitingForNextCycle;
            status.next_cycle_at = chrono::Duration::from_std(interval)
                .ok()
                .map(|d| Utc::now() + d);
            status_tx.send_replace(status.clone());
            obs::emit_loop_waiting(&self.correlation_id, status.iteration, interval.as_secs());

            let wait = sleep(interval);
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    _ = &mut wait => break,
                    Some(msg) = control.recv() => match msg {
                        LoopControl::StopWaiting => {
                            info!("wait cut short");
                            break;
                        }
                        LoopControl::RequestExit => {
                            status.exit_requested = true;
                            break;
                        }
                    },
                }
            }
            if status.exit_requested {
                break;
            }
        }

        status.finished = true;
        status.next_cycle_at = None;
        status_tx.send_replace(status.clone());
        info!(cycles = status.iteration, "proactive loop finished");
        Ok(status)
    }

    /// Track one cycle to its end, notifying once when problems show up.
    async fn follow(
        &self,
        handle: RunHandle,
        status: &mut LoopStatus,
        status_tx: &watch::Sender<LoopStatus>,
        control: &mut mpsc::UnboundedReceiver<LoopControl>,
        notified: &mut NotifiedSets,
    ) -> CycleSummary {
        let mut rx = handle.subscribe();
        let mut sent = false;
        let mut problems = 0;

        loop {
            let state = rx.borrow_and_update().clone();
            if status.phase != state.phase {
                status.phase = state.phase;
                status_tx.send_replace(status.clone());
            }
            if !state.units.is_empty() && problems == 0 {
                problems = state.units.len();
                sent = self.notify(&state, status.iteration, notified).await;
            }
            if state.is_terminal() {
                break;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(msg) = control.recv() => {
                    if msg == LoopControl::RequestExit && !status.exit_requested {
                        info!("exit requested; finishing current cycle");
                        status.exit_requested = true;
                        status_tx.send_replace(status.clone());
                    }
                }
            }
        }

        let run_id = handle.run_id().to_string();
        let iteration = status.iteration;
        match handle.wait().await {
            Ok(report) => CycleSummary {
                run_id,
                iteration,
                phase: Some(report.terminal_phase),
                problems,
                repaired: report.repaired,
                skipped: report.skipped,
                failed: report.failed,
                notified: sent,
                summary: Some(report.summary),
                error: None,
                finished_at: Utc::now(),
            },
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "loop cycle stopped on error");
                CycleSummary {
                    problems,
                    notified: sent,
                    ..failed_summary(&run_id, iteration, &e)
                }
            }
        }
    }

    async fn notify(&self, state: &CycleState, iteration: u32, notified: &mut NotifiedSets) -> bool {
        let Some(notifier) = &self.notifier else {
            return false;
        };
        let mut key: Vec<String> = state.units.iter().map(|u| u.unit_id.clone()).collect();
        key.sort();
        if !notified.insert(key) {
            info!(run_id = %state.run_id, "problem set already notified; skipping");
            return false;
        }
        let notification = ProblemNotification {
            correlation_id: self.correlation_id.clone(),
            run_id: state.run_id.clone(),
            iteration,
            detection_confidence: state.detection_confidence(),
            units: state.units.clone(),
            detected_at: Utc::now(),
        };
        match notifier.notify(&notification).await {
            Ok(()) => true,
            Err(e) => {
                warn!(run_id = %state.run_id, error = %e, "problem notification failed");
                false
            }
        }
    }
}

/// Problem sets already notified, keeping only the most recent `limit`.
#[derive(Debug)]
struct NotifiedSets {
    limit: usize,
    seen: HashSet<Vec<String>>,
    order: VecDeque<Vec<String>>,
}

impl NotifiedSets {
    fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// `false` if `key` was already notified.
    fn insert(&mut self, key: Vec<String>) -> bool {
        if !self.seen.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.seen.len()
    }
}

fn failed_summary(run_id: &str, iteration: u32, error: &RepairError) -> CycleSummary {
    CycleSummary {
        run_id: run_id.to_string(),
        iteration,
        phase: None,
        problems: 0,
        repaired: 0,
        skipped: 0,
        failed: 0,
        notified: false,
        summary: None,
        error: Some(error.to_string()),
        finished_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_notified_sets_stay_bounded() {
        let mut sets = NotifiedSets::new(2);
        assert!(sets.insert(key(&["O-1"])));
        assert!(!sets.insert(key(&["O-1"])));
        assert!(sets.insert(key(&["O-2"])));
        assert!(sets.insert(key(&["O-3"])));
        assert_eq!(sets.len(), 2);

        // The oldest set fell out and notifies again.
        assert!(sets.insert(key(&["O-1"])));
        assert!(!sets.insert(key(&["O-3"])));
    }

    #[test]
    fn test_notified_sets_grow_no_further_over_many_cycles() {
        let mut sets = NotifiedSets::new(10);
        for i in 0..1_000 {
            sets.insert(key(&[&format!("O-{i}")]));
        }
        assert_eq!(sets.len(), 10);
    }
}
