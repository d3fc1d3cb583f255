/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Public reservation API.
//!
//! [`Reservations`] is the thin composition layer over the supervisor and
//! the scheduler core: every entry point takes the single scheduler lock,
//! samples the clock, settles due timers, checks authorization, delegates,
//! and returns a [`QosResult`]. Host-driven notifications (block, unblock,
//! stop, continue, fork, exit) enter through the `on_task_*` hooks, which
//! never fail: they clamp state, log, and continue.
//!
//! Authorization model: root may affect anything; any other principal may
//! affect a task only if it owns the task, and a server only if it owns the
//! server. Reads of server state are unrestricted. Supervisor rule
//! administration and global cleanup are root-only.
//!
//! No entry point leaves state half-mutated on error: admission runs before
//! any aggregate moves, and the one multi-step path (re-admitting a changed
//! guarantee floor) rolls back to the previous floor when the new one is
//! refused.

use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::bandwidth::Bw;
use crate::config::SchedConfig;
use crate::error::{QosError, QosResult};
use crate::host::{HostScheduler, Principal, TaskId};
use crate::scheduler::{SchedCore, ServerSnapshot};
use crate::server::{Server, ServerId, ServerParams, FLAG_DEFAULT, FLAG_NOMULTI, FLAG_PERSISTENT};
use crate::supervisor::{Constraints, Supervisor, SupervisorSnapshot};
use crate::time::{Clock, Duration, Instant};

// ── Snapshot ──────────────────────────────────────────────────────────────────

/// Structured view of the whole scheduling domain, for the host's
/// introspection surface. Formatting is the host's concern.
#[derive(Debug, Clone, Serialize)]
pub struct SystemSnapshot {
    pub time: Instant,
    pub u_tot: Bw,
    pub running: Option<ServerId>,
    pub servers: Vec<ServerSnapshot>,
    pub supervisor: SupervisorSnapshot,
}

// ── Reservations ──────────────────────────────────────────────────────────────

struct Core {
    cfg: SchedConfig,
    sched: SchedCore,
    sup: Supervisor,
    clock: Box<dyn Clock>,
    host: Box<dyn HostScheduler>,
    /// Reverse task-to-server binding; agrees with the servers' task sets.
    task_server: std::collections::BTreeMap<TaskId, ServerId>,
}

impl Core {
    /// Sample the clock and run a full scheduling pass.
    fn tick(&mut self) {
        let now = self.clock.now();
        let Core {
            sched, sup, host, ..
        } = self;
        sched.tick(now, sup, host.as_mut());
    }

    /// Re-derive every budget from the supervisor's approved shares.
    fn refresh(&mut self) {
        self.sched.refresh_budgets(&self.sup);
    }

    fn principal(&self) -> Principal {
        self.host.current_principal()
    }

    fn may_affect_server(&self, p: Principal, sid: ServerId) -> QosResult<()> {
        let srv = self.sched.server(sid)?;
        if p.is_root() || p.uid == srv.owner.uid {
            Ok(())
        } else {
            warn!(sid, uid = p.uid, owner = srv.owner.uid, "server operation not authorized");
            Err(QosError::Unauthorized)
        }
    }

    fn may_affect_task(&self, p: Principal, tid: TaskId) -> QosResult<()> {
        let task_uid = self.host.task_uid(tid).ok_or(QosError::NotFound)?;
        if p.is_root() || p.uid == task_uid {
            Ok(())
        } else {
            warn!(tid, uid = p.uid, task_uid, "task operation not authorized");
            Err(QosError::Unauthorized)
        }
    }

    /// Tear a server down: stop and release its tasks, unwind its
    /// supervisor partials, re-propagate budgets. Authorization is the
    /// caller's business.
    fn destroy_locked(&mut self, sid: ServerId) -> QosResult<()> {
        let srv = {
            let Core { sched, host, .. } = self;
            sched.remove_server(sid, host.as_mut())?
        };
        for &tid in srv.ready_tasks.iter().chain(srv.blocked_tasks.iter()) {
            self.host.to_default_class(tid);
            self.task_server.remove(&tid);
        }
        if let Err(e) = self.sup.remove_server(sid) {
            error!(sid, err = %e, "supervisor had no record of a destroyed server");
        }
        self.sched.refresh_budgets(&self.sup);
        self.tick();
        info!(sid, "server destroyed");
        Ok(())
    }

    /// Detach one task; destroys the server when it empties and is not
    /// PERSISTENT. `return_to_default` is false when the task is exiting.
    fn detach_locked(&mut self, sid: ServerId, tid: TaskId, return_to_default: bool) -> QosResult<()> {
        let srv = self.sched.server_mut(sid)?;
        let was_ready = srv.remove_task(tid).ok_or(QosError::NotFound)?;
        self.task_server.remove(&tid);

        if was_ready {
            if self.sched.running() == Some(sid) {
                self.host.stop(sid, &[tid]);
            }
            let Core { sched, host, .. } = self;
            if let Err(e) = sched.deactivate(sid, host.as_mut()) {
                error!(sid, err = %e, "deactivation on detach failed");
            }
        }
        if return_to_default {
            self.host.to_default_class(tid);
        }

        let srv = self.sched.server(sid)?;
        if srv.is_empty() && !srv.has_flag(FLAG_PERSISTENT) {
            debug!(sid, "last task detached from a non-persistent server");
            self.destroy_locked(sid)?;
        } else {
            self.tick();
        }
        Ok(())
    }
}

/// The reservation facade: one instance per scheduling domain.
///
/// All mutable state lives behind one internal lock; every operation runs
/// as a single critical section, including timer expiries delivered through
/// [`tick`](Reservations::tick).
pub struct Reservations {
    inner: Mutex<Core>,
}

impl Reservations {
    /// Build a scheduling domain from a validated configuration, a
    /// monotonic clock and the host binding. The configured spare bandwidth
    /// is reserved before any server can exist.
    pub fn new(
        cfg: SchedConfig,
        clock: impl Clock + 'static,
        host: impl HostScheduler + 'static,
    ) -> QosResult<Self> {
        cfg.validate()?;
        let mut sup = Supervisor::new(cfg.u_lub(), cfg.expand);
        sup.reserve_spare(cfg.spare())?;
        let sched = SchedCore::new(&cfg);
        info!(
            u_lub_percent = cfg.u_lub_percent,
            spare_percent = cfg.spare_percent,
            "reservation scheduler initialised"
        );
        Ok(Reservations {
            inner: Mutex::new(Core {
                cfg,
                sched,
                sup,
                clock: Box::new(clock),
                host: Box::new(host),
                task_server: std::collections::BTreeMap::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Core> {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    // ── Server lifecycle ──────────────────────────────────────────────────────

    /// Create a reservation server owned by the calling principal.
    ///
    /// The guaranteed minimum is admitted by the supervisor, the requested
    /// budget becomes the required bandwidth, and every live server's budget
    /// is re-derived from the resulting approved shares.
    pub fn create_server(&self, params: ServerParams) -> QosResult<ServerId> {
        let mut core = self.lock();
        core.tick();
        let principal = core.principal();

        params.validate(core.cfg.min_period)?;
        let params = params.rounded();
        debug!(
            q_min = params.q_min.as_usec(),
            q = params.q.as_usec(),
            p = params.p.as_usec(),
            flags = params.flags,
            uid = principal.uid,
            "create server"
        );

        if params.has_flag(FLAG_DEFAULT) {
            if !principal.is_root() {
                warn!(uid = principal.uid, "default server creation requires root");
                return Err(QosError::Unauthorized);
            }
            if core.sched.servers().any(|s| s.has_flag(FLAG_DEFAULT)) {
                warn!("a default server already exists");
                return Err(QosError::InconsistentState);
            }
        }

        let sid = core.sched.alloc_sid();
        core.sup
            .admit_server(sid, principal.uid, principal.gid, &params)?;
        if let Err(e) = core
            .sup
            .set_required_bw(sid, Bw::from_ratio(params.q, params.p))
        {
            let _ = core.sup.remove_server(sid);
            return Err(e);
        }

        let now = core.clock.now();
        let mut srv = Server::new(sid, params, principal, now);
        srv.weight = core.sup.rule_weight(sid);
        core.sched.insert_server(srv);
        core.refresh();
        core.tick();

        info!(
            sid,
            approved = core.sup.approved_bw(sid).to_f64(),
            "server created"
        );
        Ok(sid)
    }

    /// Destroy a server explicitly, detaching all of its tasks.
    pub fn destroy_server(&self, sid: ServerId) -> QosResult<()> {
        let mut core = self.lock();
        core.tick();
        let principal = core.principal();
        core.may_affect_server(principal, sid)?;
        core.destroy_locked(sid)
    }

    /// Attach a task to a server. The task starts being dispatched at the
    /// next scheduling decision.
    ///
    /// A task already bound to a server is rejected rather than silently
    /// moved, so the one-server-per-task invariant stays visible to callers.
    pub fn attach(&self, sid: ServerId, tid: TaskId) -> QosResult<()> {
        let mut core = self.lock();
        core.tick();
        let principal = core.principal();
        core.may_affect_server(principal, sid)?;
        core.may_affect_task(principal, tid)?;

        if let Some(&bound) = core.task_server.get(&tid) {
            warn!(tid, bound, "task is already attached to a server");
            return Err(QosError::InconsistentState);
        }
        let srv = core.sched.server(sid)?;
        if srv.has_flag(FLAG_NOMULTI) && !srv.is_empty() {
            warn!(sid, tid, "server does not accept further tasks");
            return Err(QosError::Full);
        }

        let runnable = core.host.is_runnable(tid);
        let srv = core.sched.server_mut(sid)?;
        if runnable {
            srv.ready_tasks.push(tid);
        } else {
            srv.blocked_tasks.push(tid);
        }
        core.task_server.insert(tid, sid);
        debug!(sid, tid, runnable, "task attached");

        if runnable {
            let already_running = core.sched.running() == Some(sid);
            let now = core.clock.now();
            core.sched.activate(sid, now)?;
            core.tick();
            if already_running && core.sched.running() == Some(sid) {
                // The server was mid-dispatch: the newcomer joins it now
                core.host.dispatch(sid, &[tid]);
            }
        } else {
            core.tick();
        }
        Ok(())
    }

    /// Detach a task from its server and return it to the host's default
    /// scheduling class. A non-PERSISTENT server that empties is destroyed.
    pub fn detach(&self, sid: ServerId, tid: TaskId) -> QosResult<()> {
        let mut core = self.lock();
        core.tick();
        let principal = core.principal();
        core.may_affect_server(principal, sid)?;
        core.may_affect_task(principal, tid)?;
        core.detach_locked(sid, tid, true)
    }

    /// Change a server's parameters. Flags are immutable; a change of the
    /// guaranteed minimum or the period re-runs admission for the new floor
    /// and rolls back to the previous parameters when it is refused.
    pub fn set_params(&self, sid: ServerId, params: ServerParams) -> QosResult<()> {
        let mut core = self.lock();
        core.tick();
        let principal = core.principal();
        core.may_affect_server(principal, sid)?;

        params.validate(core.cfg.min_period)?;
        let old = core.sched.server(sid)?.params;
        if params.flags != old.flags {
            warn!(sid, "changing flags through a parameter update is not supported");
            return Err(QosError::Unimplemented);
        }
        let params = params.rounded();
        let owner = core.sched.server(sid)?.owner;
        debug!(
            sid,
            q_min = params.q_min.as_usec(),
            q = params.q.as_usec(),
            p = params.p.as_usec(),
            "set params"
        );

        if params.q_min != old.q_min || params.p != old.p {
            core.sup.remove_server(sid)?;
            if let Err(refusal) = core.sup.admit_server(sid, owner.uid, owner.gid, &params) {
                // Restore the previous floor. It was admitted before and the
                // lock was held throughout, so a second refusal means the
                // supervisor state is corrupt.
                if core.sup.admit_server(sid, owner.uid, owner.gid, &old).is_err() {
                    error!(sid, "failed to restore the previous guarantee floor");
                    return Err(QosError::Internal);
                }
                let _ = core.sup.set_required_bw(sid, Bw::from_ratio(old.q, old.p));
                core.refresh();
                core.tick();
                return Err(refusal);
            }
        }
        core.sup
            .set_required_bw(sid, Bw::from_ratio(params.q, params.p))?;

        let old_max = {
            let srv = core.sched.server_mut(sid)?;
            let old_max = srv.max_budget;
            srv.params = params;
            srv.period = params.p;
            old_max
        };
        core.refresh();

        if core.cfg.instant_setparams {
            let new_max = core.sched.server(sid)?.max_budget;
            if new_max > old_max {
                core.sched.boost_budget(sid, new_max - old_max)?;
            }
        }
        core.tick();
        Ok(())
    }

    // ── Server getters ────────────────────────────────────────────────────────

    /// Parameters as granted: rounded to the bandwidth granularity, so the
    /// returned budgets may sit slightly above the ones submitted.
    pub fn get_params(&self, sid: ServerId) -> QosResult<ServerParams> {
        Ok(self.lock().sched.server(sid)?.params)
    }

    /// Total execution time served since creation, with the current time.
    pub fn get_exec_time(&self, sid: ServerId) -> QosResult<(Duration, Instant)> {
        let mut core = self.lock();
        core.tick();
        let exec = core.sched.server(sid)?.stat.exec_time;
        Ok((exec, core.clock.now()))
    }

    /// Remaining budget of the current instance, clamped to
    /// `[0, max_budget]` for observation.
    pub fn get_curr_budget(&self, sid: ServerId) -> QosResult<Duration> {
        let mut core = self.lock();
        core.tick();
        Ok(core.sched.server(sid)?.budget.clamp_floor_zero())
    }

    /// Budget the next instance will start with.
    pub fn get_next_budget(&self, sid: ServerId) -> QosResult<Duration> {
        let core = self.lock();
        let srv = core.sched.server(sid)?;
        Ok(srv.bw_current.to_budget(srv.params.p))
    }

    /// Budget corresponding to the bandwidth currently approved by the
    /// supervisor; the running instance converges to it over at most one
    /// recharge.
    pub fn get_approved_budget(&self, sid: ServerId) -> QosResult<Duration> {
        let core = self.lock();
        let p = core.sched.server(sid)?.params.p;
        Ok(core.sup.approved_bw(sid).to_budget(p))
    }

    /// Absolute deadline of the current instance.
    pub fn get_deadline(&self, sid: ServerId) -> QosResult<Instant> {
        Ok(self.lock().sched.server(sid)?.deadline)
    }

    /// Opaque scheduling weight (reserved for a future reclaiming policy).
    pub fn get_weight(&self, sid: ServerId) -> QosResult<u32> {
        Ok(self.lock().sched.server(sid)?.weight)
    }

    pub fn set_weight(&self, sid: ServerId, weight: u32) -> QosResult<()> {
        let mut core = self.lock();
        let principal = core.principal();
        core.may_affect_server(principal, sid)?;
        core.sched.server_mut(sid)?.weight = weight;
        Ok(())
    }

    // ── Supervisor administration (root only) ─────────────────────────────────

    pub fn add_level_rule(&self, level: usize, max_bw: Bw) -> QosResult<()> {
        let mut core = self.lock();
        if !core.principal().is_root() {
            return Err(QosError::Unauthorized);
        }
        core.sup.add_level_rule(level, max_bw)
    }

    pub fn add_group_constraints(&self, gid: u32, constr: Constraints) -> QosResult<()> {
        let mut core = self.lock();
        if !core.principal().is_root() {
            return Err(QosError::Unauthorized);
        }
        core.sup.add_group_constraints(gid, constr)
    }

    pub fn add_user_constraints(&self, uid: u32, constr: Constraints) -> QosResult<()> {
        let mut core = self.lock();
        if !core.principal().is_root() {
            return Err(QosError::Unauthorized);
        }
        core.sup.add_user_constraints(uid, constr)
    }

    /// Reserve spare bandwidth; only legal before any server exists.
    pub fn reserve_spare(&self, bw: Bw) -> QosResult<()> {
        let mut core = self.lock();
        if !core.principal().is_root() {
            return Err(QosError::Unauthorized);
        }
        core.sup.reserve_spare(bw)
    }

    /// Constraints in force for a principal.
    pub fn find_constraints(&self, uid: u32, gid: u32) -> Constraints {
        self.lock().sup.find_constraints(uid, gid)
    }

    /// Guaranteed bandwidth the principal may still admit.
    pub fn get_avail_gua_bw(&self, uid: u32, gid: u32) -> Bw {
        self.lock().sup.avail_gua_bw(uid, gid)
    }

    /// Bandwidth the principal may still request before saturation.
    pub fn get_avail_bw(&self, uid: u32, gid: u32) -> Bw {
        self.lock().sup.avail_bw(uid, gid)
    }

    /// Cap on the principal's aggregate guaranteed minima.
    pub fn get_max_gua_bw(&self, uid: u32, gid: u32) -> Bw {
        self.lock().sup.max_gua_bw(uid, gid)
    }

    // ── Host hooks ────────────────────────────────────────────────────────────
    //
    // Called from the host's own notification paths. Never fail: a hook on
    // an unknown task is silently ignored, inconsistencies are clamped and
    // logged.

    /// The task went to sleep in the host.
    pub fn on_task_block(&self, tid: TaskId) {
        let mut core = self.lock();
        core.tick();
        let Some(&sid) = core.task_server.get(&tid) else {
            return;
        };
        let Ok(srv) = core.sched.server_mut(sid) else {
            return;
        };
        let Some(i) = srv.ready_tasks.iter().position(|&t| t == tid) else {
            debug!(sid, tid, "block hook for an already blocked task");
            return;
        };
        srv.ready_tasks.swap_remove(i);
        srv.blocked_tasks.push(tid);
        debug!(sid, tid, "task blocked");

        if core.sched.running() == Some(sid) {
            core.host.stop(sid, &[tid]);
        }
        {
            let Core { sched, host, .. } = &mut *core;
            if let Err(e) = sched.deactivate(sid, host.as_mut()) {
                error!(sid, err = %e, "deactivation on block failed");
            }
        }
        core.tick();
    }

    /// The task became runnable again.
    pub fn on_task_unblock(&self, tid: TaskId) {
        let mut core = self.lock();
        core.tick();
        let Some(&sid) = core.task_server.get(&tid) else {
            return;
        };
        let Ok(srv) = core.sched.server_mut(sid) else {
            return;
        };
        let Some(i) = srv.blocked_tasks.iter().position(|&t| t == tid) else {
            debug!(sid, tid, "unblock hook for an already ready task");
            return;
        };
        srv.blocked_tasks.swap_remove(i);
        srv.ready_tasks.push(tid);
        debug!(sid, tid, "task unblocked");

        let already_running = core.sched.running() == Some(sid);
        let now = core.clock.now();
        if let Err(e) = core.sched.activate(sid, now) {
            error!(sid, err = %e, "activation on unblock failed");
        }
        core.tick();
        if already_running && core.sched.running() == Some(sid) {
            core.host.dispatch(sid, &[tid]);
        }
    }

    /// SIGSTOP-style suspension: same bookkeeping as blocking.
    pub fn on_task_stop(&self, tid: TaskId) {
        self.on_task_block(tid);
    }

    /// SIGCONT-style resumption: same bookkeeping as unblocking.
    pub fn on_task_continue(&self, tid: TaskId) {
        self.on_task_unblock(tid);
    }

    /// A served task forked: the child joins the parent's server, unless
    /// the server refuses company.
    pub fn on_task_fork(&self, parent: TaskId, child: TaskId) {
        let mut core = self.lock();
        core.tick();
        let Some(&sid) = core.task_server.get(&parent) else {
            return;
        };
        if core.task_server.contains_key(&child) {
            warn!(parent, child, "forked child is already attached");
            return;
        }
        let Ok(srv) = core.sched.server(sid) else {
            return;
        };
        if srv.has_flag(FLAG_NOMULTI) {
            debug!(sid, child, "server refuses the forked child; it stays unreserved");
            return;
        }
        let runnable = core.host.is_runnable(child);
        let Ok(srv) = core.sched.server_mut(sid) else {
            return;
        };
        if runnable {
            srv.ready_tasks.push(child);
        } else {
            srv.blocked_tasks.push(child);
        }
        core.task_server.insert(child, sid);
        info!(sid, parent, child, "forked child attached");
        if runnable {
            let now = core.clock.now();
            if let Err(e) = core.sched.activate(sid, now) {
                error!(sid, err = %e, "activation on fork failed");
            }
        }
        core.tick();
    }

    /// A served task exited: detach it; an emptied non-PERSISTENT server is
    /// destroyed.
    pub fn on_task_exit(&self, tid: TaskId) {
        let mut core = self.lock();
        core.tick();
        let Some(&sid) = core.task_server.get(&tid) else {
            return;
        };
        if let Err(e) = core.detach_locked(sid, tid, false) {
            error!(sid, tid, err = %e, "detach on exit failed");
        }
    }

    // ── Timer surface ─────────────────────────────────────────────────────────

    /// Timer-interrupt entry point: settle due recharges and re-evaluate the
    /// dispatch decision.
    pub fn tick(&self) {
        self.lock().tick();
    }

    /// Earliest instant at which the scheduler wants a [`tick`](Self::tick);
    /// a lower bound, so ticking earlier is always safe.
    pub fn next_timer_expiry(&self) -> Option<Instant> {
        self.lock().sched.next_expiry()
    }

    // ── Introspection and teardown ────────────────────────────────────────────

    /// Structured dump of servers and supervisor aggregates.
    pub fn dump(&self) -> SystemSnapshot {
        let mut core = self.lock();
        core.tick();
        SystemSnapshot {
            time: core.clock.now(),
            u_tot: core.sched.u_tot(),
            running: core.sched.running(),
            servers: core.sched.snapshot(),
            supervisor: core.sup.snapshot(),
        }
    }

    /// Destroy every server, the default one included. Root only.
    pub fn cleanup(&self) -> QosResult<()> {
        let mut core = self.lock();
        core.tick();
        if !core.principal().is_root() {
            return Err(QosError::Unauthorized);
        }
        let sids: Vec<ServerId> = core.sched.servers().map(|s| s.id).collect();
        for sid in sids {
            core.destroy_locked(sid)?;
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
