/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! The reservation server: budget, deadline, and task-set state for one
//! reservation.
//!
//! A server is the unit the EDF scheduler orders: it owns a current budget
//! `c` that is debited while its tasks run, an absolute deadline used as the
//! queue key, and the set of attached tasks partitioned into ready and
//! blocked. The budget may dip below zero inside a single scheduler tick
//! (the running task is only stopped at the tick); the recharge then adds
//! one full budget on top of the negative remainder, so overrun time is paid
//! back from the next instance.

use serde::Serialize;

use crate::bandwidth::Bw;
use crate::error::{QosError, QosResult};
use crate::host::{Principal, TaskId};
use crate::time::{Duration, Instant};
use crate::timer::Timer;

/// Dense server identifier. Never zero; reused only after destruction.
pub type ServerId = u32;

// ── Flags ─────────────────────────────────────────────────────────────────────

/// The server is the distinguished default server hosting tasks not
/// otherwise reserved. At most one exists; creation is restricted to root.
pub const FLAG_DEFAULT: u32 = 0x0000_0001;

/// Tasks stay eligible for best-effort execution while the budget is
/// exhausted. Advisory to the host; accounting is unchanged.
pub const FLAG_SOFT: u32 = 0x0000_0002;

/// Reject attaching more than one task.
pub const FLAG_NOMULTI: u32 = 0x0000_0004;

/// Keep the server alive when its last task detaches.
pub const FLAG_PERSISTENT: u32 = 0x0000_0008;

/// All flag bits understood by this build.
pub const FLAGS_KNOWN: u32 = FLAG_DEFAULT | FLAG_SOFT | FLAG_NOMULTI | FLAG_PERSISTENT;

// ── Parameters ────────────────────────────────────────────────────────────────

/// User-submitted reservation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ServerParams {
    /// Guaranteed minimum budget per period; compression never grants less.
    pub q_min: Duration,
    /// Requested budget per period.
    pub q: Duration,
    /// Reservation period.
    pub p: Duration,
    /// Combination of `FLAG_*` bits.
    pub flags: u32,
    /// Maximum auto-destroy timeout for an empty PERSISTENT server; opaque
    /// to the core scheduler.
    pub timeout: Duration,
}

impl ServerParams {
    pub fn new(q_min: Duration, q: Duration, p: Duration, flags: u32) -> Self {
        ServerParams {
            q_min,
            q,
            p,
            flags,
            timeout: Duration::ZERO,
        }
    }

    /// Structural validation against the configured minimum period.
    pub fn validate(&self, min_period: Duration) -> QosResult<()> {
        if self.q_min.is_negative() || self.q.is_negative() || !self.p.is_positive() {
            tracing::warn!(
                q_min = self.q_min.as_usec(),
                q = self.q.as_usec(),
                p = self.p.as_usec(),
                "negative or zero reservation parameter"
            );
            return Err(QosError::InvalidParam);
        }
        if self.p < min_period {
            tracing::warn!(
                p = self.p.as_usec(),
                min_period = min_period.as_usec(),
                "period below the configured minimum"
            );
            return Err(QosError::InvalidParam);
        }
        if self.q_min > self.q || self.q > self.p {
            tracing::warn!(
                q_min = self.q_min.as_usec(),
                q = self.q.as_usec(),
                p = self.p.as_usec(),
                "budget ordering violated (need q_min <= q <= p)"
            );
            return Err(QosError::InvalidParam);
        }
        if self.flags & !FLAGS_KNOWN != 0 {
            tracing::warn!(flags = self.flags, "unknown flag bits");
            return Err(QosError::InvalidParam);
        }
        Ok(())
    }

    /// Round both budgets to the bandwidth granularity: the requested values
    /// are rounded *up* to the next representable bandwidth, then re-derived
    /// as budgets, so the stored parameters are exactly representable and
    /// never below what was asked for.
    pub fn rounded(&self) -> ServerParams {
        let q_min = Bw::from_ratio_ceil(self.q_min, self.p).to_budget(self.p);
        let q = Bw::from_ratio_ceil(self.q, self.p).to_budget(self.p);
        ServerParams {
            q_min,
            q,
            p: self.p,
            flags: self.flags,
            timeout: self.timeout,
        }
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

// ── Statistics ────────────────────────────────────────────────────────────────

/// Accounting kept since server creation.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ServerStat {
    /// Number of budget recharges.
    pub recharges: u64,
    /// Total execution time served to the attached tasks.
    pub exec_time: Duration,
}

// ── Server ────────────────────────────────────────────────────────────────────

/// One reservation server.
#[derive(Debug)]
pub struct Server {
    pub id: ServerId,
    /// Parameters as submitted (after granularity rounding).
    pub params: ServerParams,
    pub period: Duration,
    /// Budget granted per instance; follows the approved bandwidth.
    pub max_budget: Duration,
    /// Current budget `c`. May be negative between a debit and the stop of
    /// the overrunning task.
    pub budget: Duration,
    /// Absolute deadline; EDF key while queued.
    pub deadline: Instant,
    /// Bandwidth currently assigned for the next instance.
    pub bw_current: Bw,
    pub ready_tasks: Vec<TaskId>,
    pub blocked_tasks: Vec<TaskId>,
    /// Outstanding job activations; the server is active while positive.
    pub activations: u32,
    /// Fires at the current deadline to recharge the budget.
    pub recharge_timer: Timer,
    pub stat: ServerStat,
    pub flags: u32,
    /// Opaque weight, plumbed for a future reclaiming policy; never read by
    /// the scheduler or supervisor.
    pub weight: u32,
    pub owner: Principal,
}

impl Server {
    /// Build a dormant server: zero budget, deadline at `now`, no tasks.
    /// Bandwidth is assigned afterwards through the scheduler's admission.
    pub fn new(id: ServerId, params: ServerParams, owner: Principal, now: Instant) -> Self {
        Server {
            id,
            params,
            period: params.p,
            max_budget: Duration::ZERO,
            budget: Duration::ZERO,
            deadline: now,
            bw_current: Bw::ZERO,
            ready_tasks: Vec::new(),
            blocked_tasks: Vec::new(),
            activations: 0,
            recharge_timer: Timer::new(),
            stat: ServerStat::default(),
            flags: params.flags,
            weight: 1,
            owner,
        }
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn has_ready_tasks(&self) -> bool {
        !self.ready_tasks.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.ready_tasks.is_empty() && self.blocked_tasks.is_empty()
    }

    pub fn is_active(&self) -> bool {
        self.activations > 0
    }

    pub fn contains_task(&self, tid: TaskId) -> bool {
        self.ready_tasks.contains(&tid) || self.blocked_tasks.contains(&tid)
    }

    pub fn task_count(&self) -> usize {
        self.ready_tasks.len() + self.blocked_tasks.len()
    }

    /// Remove `tid` from whichever partition holds it. Returns whether the
    /// task was in the ready partition, or `None` if it was not attached.
    pub fn remove_task(&mut self, tid: TaskId) -> Option<bool> {
        if let Some(i) = self.ready_tasks.iter().position(|&t| t == tid) {
            self.ready_tasks.swap_remove(i);
            return Some(true);
        }
        if let Some(i) = self.blocked_tasks.iter().position(|&t| t == tid) {
            self.blocked_tasks.swap_remove(i);
            return Some(false);
        }
        None
    }

    /// Debit served time from the budget and account it.
    pub fn consume(&mut self, dt: Duration) {
        debug_assert!(!dt.is_negative());
        self.budget -= dt;
        self.stat.exec_time += dt;
    }

    /// Budget exhausted: nothing left to serve in this instance.
    pub fn is_exhausted(&self) -> bool {
        !self.budget.is_positive()
    }

    /// Periodic recharge: add one full budget on top of the (possibly
    /// negative) remainder and postpone the deadline by one period. Overrun
    /// microseconds from the previous instance are thereby lost; an idle
    /// positive remainder is clamped rather than accumulated.
    pub fn apply_recharge(&mut self) {
        self.budget = (self.budget + self.max_budget).min(self.max_budget);
        self.deadline += self.period;
        self.stat.recharges += 1;
    }

    /// Fresh instance anchored at `now`: full budget, deadline one period
    /// out. Used when a dormant server activates past its old deadline.
    pub fn reset_instance(&mut self, now: Instant) {
        self.budget = self.max_budget;
        self.deadline = now + self.period;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
