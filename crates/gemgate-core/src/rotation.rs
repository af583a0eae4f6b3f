//! Credential rotation policy and state.
//!
//! All counters and flags live under one async mutex so eligibility checks
//! and flag flips are atomic; in particular the pending-drain sequence
//! (pending && !switching && active == 0 => flip switching) can never
//! launch two switches. The session rebind itself happens outside the lock
//! while `is_switching`/`is_system_busy` keep the admission gate closed.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::credentials::CredentialStore;
use crate::session::SessionBinder;

#[derive(Debug, Clone)]
pub struct RotationConfig {
    /// Consecutive terminal failures before a forced switch. 0 disables.
    pub failure_threshold: u32,
    /// Generative uses before a drain-then-switch. 0 disables.
    pub switch_on_uses: u32,
    /// Upstream statuses that switch immediately, mid-flight.
    pub immediate_switch_status_codes: BTreeSet<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    UsageThreshold,
    FailureThreshold,
    ImmediateStatus(u16),
    Manual,
}

#[derive(Debug, thiserror::Error)]
pub enum RotationError {
    #[error("a switch is already in progress")]
    Busy,
    #[error("credential {0} is not available")]
    UnknownTarget(u32),
    #[error("switch to credential {target} failed ({message}); fell back to {fallback}")]
    SwitchFailed {
        target: u32,
        fallback: u32,
        message: String,
    },
    #[error(
        "switch to credential {target} failed ({message}) and fallback to {fallback} failed ({fallback_message})"
    )]
    Fatal {
        target: u32,
        fallback: u32,
        message: String,
        fallback_message: String,
    },
}

/// Gate rejections for new arrivals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdmitError {
    #[error("rotating accounts")]
    Draining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationSnapshot {
    pub current_index: u32,
    pub usage_count: u32,
    pub failure_count: u32,
    pub active_requests: u32,
    pub pending_switch: bool,
    pub is_switching: bool,
    pub is_system_busy: bool,
}

#[derive(Debug)]
struct RotationState {
    current_index: u32,
    usage_count: u32,
    failure_count: u32,
    active_requests: u32,
    pending_switch: bool,
    is_switching: bool,
    is_system_busy: bool,
}

pub struct RotationController {
    config: RotationConfig,
    store: Arc<CredentialStore>,
    binder: Arc<dyn SessionBinder>,
    state: Mutex<RotationState>,
}

impl RotationController {
    pub fn new(
        config: RotationConfig,
        store: Arc<CredentialStore>,
        binder: Arc<dyn SessionBinder>,
        initial_index: u32,
    ) -> Self {
        Self {
            config,
            store,
            binder,
            state: Mutex::new(RotationState {
                current_index: initial_index,
                usage_count: 0,
                failure_count: 0,
                active_requests: 0,
                pending_switch: false,
                is_switching: false,
                is_system_busy: false,
            }),
        }
    }

    pub async fn snapshot(&self) -> RotationSnapshot {
        let state = self.state.lock().await;
        RotationSnapshot {
            current_index: state.current_index,
            usage_count: state.usage_count,
            failure_count: state.failure_count,
            active_requests: state.active_requests,
            pending_switch: state.pending_switch,
            is_switching: state.is_switching,
            is_system_busy: state.is_system_busy,
        }
    }

    pub async fn current_index(&self) -> u32 {
        self.state.lock().await.current_index
    }

    pub async fn is_system_busy(&self) -> bool {
        self.state.lock().await.is_system_busy
    }

    /// Admission gate for a new request: rejected while a switch is pending
    /// or running, otherwise counted as active.
    pub async fn admit(&self) -> Result<(), AdmitError> {
        let mut state = self.state.lock().await;
        if state.pending_switch || state.is_switching {
            return Err(AdmitError::Draining);
        }
        state.active_requests += 1;
        Ok(())
    }

    /// Usage accounting for a generative request that passed the gate.
    /// Skipped entirely while a switch is pending so drain cannot re-arm.
    pub async fn count_usage(&self, generative: bool) {
        if !generative {
            return;
        }
        let mut state = self.state.lock().await;
        if state.pending_switch {
            return;
        }
        state.usage_count += 1;
        if self.config.switch_on_uses > 0 && state.usage_count >= self.config.switch_on_uses {
            state.pending_switch = true;
            tracing::info!(
                usage_count = state.usage_count,
                threshold = self.config.switch_on_uses,
                active = state.active_requests,
                "usage threshold reached, draining before switch"
            );
        }
    }

    /// Guaranteed-release hook: every request exit decrements the active
    /// count and gives a pending switch its chance to run.
    pub async fn release(&self) {
        {
            let mut state = self.state.lock().await;
            state.active_requests = state.active_requests.saturating_sub(1);
        }
        self.try_execute_pending_switch().await;
    }

    /// One in-request success clears the consecutive-failure streak.
    pub async fn record_success(&self) {
        self.state.lock().await.failure_count = 0;
    }

    /// Terminal non-abort failure accounting. Returns the switch decision so
    /// the caller's failure handler can log before the switch runs.
    pub async fn record_failure(&self, status: Option<u16>) -> Option<SwitchReason> {
        let mut state = self.state.lock().await;
        if self.config.failure_threshold > 0 {
            state.failure_count += 1;
        }
        if let Some(status) = status
            && self.config.immediate_switch_status_codes.contains(&status)
        {
            return Some(SwitchReason::ImmediateStatus(status));
        }
        if self.config.failure_threshold > 0
            && state.failure_count >= self.config.failure_threshold
        {
            return Some(SwitchReason::FailureThreshold);
        }
        None
    }

    /// Advance from draining to switching when eligible. The check and the
    /// flag flip happen under one lock acquisition.
    pub async fn try_execute_pending_switch(&self) -> bool {
        {
            let mut state = self.state.lock().await;
            if !state.pending_switch || state.is_switching || state.active_requests > 0 {
                return false;
            }
            state.is_switching = true;
            state.is_system_busy = true;
        }
        self.finish_switch(None, SwitchReason::UsageThreshold)
            .await
            .is_ok()
    }

    /// Immediate switch (failure threshold / immediate status code).
    pub async fn switch_now(&self, reason: SwitchReason) -> Result<u32, RotationError> {
        self.acquire_switch_flags().await?;
        self.finish_switch(None, reason).await
    }

    /// Operator-initiated switch to a specific credential. Proceeds even
    /// with requests in flight (warned, not refused).
    pub async fn switch_to(&self, target: u32) -> Result<u32, RotationError> {
        if !self.store.available_indices().contains(&target) {
            return Err(RotationError::UnknownTarget(target));
        }
        {
            let state = self.state.lock().await;
            if state.active_requests > 0 {
                tracing::warn!(
                    active = state.active_requests,
                    target,
                    "manual switch requested with requests in flight"
                );
            }
        }
        self.acquire_switch_flags().await?;
        self.finish_switch(Some(target), SwitchReason::Manual).await
    }

    /// Silent recovery used by the gate when the control link was lost:
    /// rebind the current credential without touching counters.
    pub async fn recover(&self) -> Result<(), RotationError> {
        let current = {
            let mut state = self.state.lock().await;
            if state.is_system_busy {
                return Err(RotationError::Busy);
            }
            state.is_system_busy = true;
            state.current_index
        };
        let result = self.binder.bind(current).await;
        let mut state = self.state.lock().await;
        state.is_system_busy = false;
        match result {
            Ok(()) => {
                tracing::info!(index = current, "session recovered on current credential");
                Ok(())
            }
            Err(err) => Err(RotationError::SwitchFailed {
                target: current,
                fallback: current,
                message: err.to_string(),
            }),
        }
    }

    async fn acquire_switch_flags(&self) -> Result<(), RotationError> {
        let mut state = self.state.lock().await;
        if state.is_switching {
            return Err(RotationError::Busy);
        }
        state.is_switching = true;
        state.is_system_busy = true;
        Ok(())
    }

    /// Runs with the switching flags held; clears them on every exit path.
    async fn finish_switch(
        &self,
        target: Option<u32>,
        reason: SwitchReason,
    ) -> Result<u32, RotationError> {
        let previous = self.state.lock().await.current_index;
        let target = target.unwrap_or_else(|| self.next_index(previous));
        tracing::info!(
            from = previous,
            to = target,
            reason = ?reason,
            from_label = %self.store.label(previous),
            to_label = %self.store.label(target),
            "switching credential"
        );

        match self.binder.bind(target).await {
            Ok(()) => {
                let mut state = self.state.lock().await;
                state.current_index = target;
                state.usage_count = 0;
                state.failure_count = 0;
                state.pending_switch = false;
                state.is_switching = false;
                state.is_system_busy = false;
                tracing::info!(index = target, "credential switch complete");
                Ok(target)
            }
            Err(err) => {
                tracing::warn!(
                    target,
                    error = %err,
                    fallback = previous,
                    "switch failed, attempting fallback to previous credential"
                );
                let fallback = self.binder.bind(previous).await;
                let mut state = self.state.lock().await;
                state.is_switching = false;
                state.is_system_busy = false;
                match fallback {
                    Ok(()) => {
                        state.usage_count = 0;
                        state.failure_count = 0;
                        state.pending_switch = false;
                        Err(RotationError::SwitchFailed {
                            target,
                            fallback: previous,
                            message: err.to_string(),
                        })
                    }
                    Err(fallback_err) => {
                        tracing::error!(
                            target,
                            fallback = previous,
                            error = %fallback_err,
                            "fallback rebind failed, rotation is wedged"
                        );
                        Err(RotationError::Fatal {
                            target,
                            fallback: previous,
                            message: err.to_string(),
                            fallback_message: fallback_err.to_string(),
                        })
                    }
                }
            }
        }
    }

    /// Next credential in ascending order, wrapping; unknown current falls
    /// back to the first available index.
    fn next_index(&self, current: u32) -> u32 {
        let available = self.store.available_indices();
        match available.iter().position(|&index| index == current) {
            Some(pos) => available[(pos + 1) % available.len()],
            None => available[0],
        }
    }
}
