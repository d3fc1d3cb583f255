/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! The EDF reservation scheduler core.
//!
//! [`SchedCore`] owns every piece of mutable scheduling state (the server
//! registry, the ready queue, the timer wheel, the total allocated bandwidth
//! and the identity of the running server) as one value. There are no
//! globals: the facade instantiates a core per scheduling domain and holds
//! it behind the single scheduler lock; tests instantiate their own.
//!
//! The scheduling cycle, entered from every API call and every timer expiry
//! through [`tick`](SchedCore::tick):
//!
//! 1. **Debit**: charge the elapsed time to the running server; if its
//!    budget is gone, remove it from the ready queue and arm its recharge
//!    timer at the current deadline (*exhaustion*).
//! 2. **Recharge**: fire due timers to refill exhausted budgets, postpone
//!    deadlines by one period, re-queue servers that still have ready tasks.
//!    Debiting precedes this step, so an exhaust and a recharge coinciding
//!    at the same instant process exhaust-first and the server re-enters the
//!    queue at its fresh deadline.
//! 3. **Dispatch**: compare the earliest-deadline ready server with the
//!    running one and tell the host to switch if they differ.
//!
//! Budget depletion of the running server is detected by its own expiry
//! instant (`last_update + remaining budget`), surfaced through
//! [`next_expiry`](SchedCore::next_expiry) so the host can program a
//! hardware timer at exactly the next interesting moment.

pub mod admission;

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::bandwidth::Bw;
use crate::config::SchedConfig;
use crate::error::{QosError, QosResult};
use crate::host::HostScheduler;
use crate::ready_queue::EdfQueue;
use crate::server::{Server, ServerId, FLAG_SOFT};
use crate::supervisor::Supervisor;
use crate::time::{Duration, Instant};
use crate::timer::TimerWheel;

// ── SchedCore ─────────────────────────────────────────────────────────────────

/// All mutable state of one scheduling domain.
#[derive(Debug)]
pub struct SchedCore {
    servers: BTreeMap<ServerId, Server>,
    rq: EdfQueue,
    wheel: TimerWheel<ServerId>,
    /// Sum of `bw_current` over all registered servers.
    u_tot: Bw,
    running: Option<ServerId>,
    /// Time of the last budget update; elapsed time since is charged to the
    /// running server at the next tick.
    last_update: Instant,
    /// When the running server's budget runs out, given no state change.
    budget_expiry: Option<Instant>,
    next_sid: ServerId,
    u_lub2: Bw,
}

impl SchedCore {
    pub fn new(cfg: &SchedConfig) -> Self {
        SchedCore {
            servers: BTreeMap::new(),
            rq: EdfQueue::new(),
            wheel: TimerWheel::new(),
            u_tot: Bw::ZERO,
            running: None,
            last_update: Instant::ZERO,
            budget_expiry: None,
            next_sid: 1,
            u_lub2: cfg.u_lub2(),
        }
    }

    // ── Registry ──────────────────────────────────────────────────────────────

    /// Allocate the next free server id. Ids are dense, skip live servers,
    /// and are never zero.
    pub fn alloc_sid(&mut self) -> ServerId {
        while self.next_sid == 0 || self.servers.contains_key(&self.next_sid) {
            debug!(sid = self.next_sid, "skipping server id already in use");
            self.next_sid = self.next_sid.wrapping_add(1);
        }
        let sid = self.next_sid;
        self.next_sid = self.next_sid.wrapping_add(1);
        sid
    }

    pub fn insert_server(&mut self, srv: Server) {
        debug_assert!(!self.servers.contains_key(&srv.id));
        self.servers.insert(srv.id, srv);
    }

    /// Unregister a server: dequeue it, stop it if it was running, release
    /// its bandwidth. Pending timer-wheel entries go stale and are discarded
    /// on expiry.
    pub fn remove_server(
        &mut self,
        sid: ServerId,
        host: &mut dyn HostScheduler,
    ) -> QosResult<Server> {
        let mut srv = self.servers.remove(&sid).ok_or(QosError::NotFound)?;
        self.rq.remove(sid);
        if self.running == Some(sid) {
            host.stop(sid, &srv.ready_tasks);
            self.running = None;
            self.budget_expiry = None;
        }
        srv.recharge_timer.cancel();
        self.u_tot = self.u_tot.saturating_sub(srv.bw_current);
        info!(sid, u_tot = %self.u_tot, "server unregistered");
        Ok(srv)
    }

    pub fn contains(&self, sid: ServerId) -> bool {
        self.servers.contains_key(&sid)
    }

    pub fn server(&self, sid: ServerId) -> QosResult<&Server> {
        self.servers.get(&sid).ok_or(QosError::NotFound)
    }

    pub fn server_mut(&mut self, sid: ServerId) -> QosResult<&mut Server> {
        self.servers.get_mut(&sid).ok_or(QosError::NotFound)
    }

    pub fn servers(&self) -> impl Iterator<Item = &Server> {
        self.servers.values()
    }

    pub fn running(&self) -> Option<ServerId> {
        self.running
    }

    pub fn u_tot(&self) -> Bw {
        self.u_tot
    }

    // ── Budget assignment ─────────────────────────────────────────────────────

    /// Change a server's maximum budget, updating its bandwidth share and
    /// the total. The current budget is not touched; it catches up at the
    /// next recharge.
    pub fn set_budget(&mut self, sid: ServerId, new_budget: Duration) -> QosResult<()> {
        let srv = self.servers.get_mut(&sid).ok_or(QosError::NotFound)?;
        if !srv.period.is_positive() {
            error!(sid, "server has a non-positive period");
            return Err(QosError::Internal);
        }
        let new_bw = Bw::from_ratio(new_budget, srv.period);
        if !admission::admissible(self.u_tot, srv.bw_current, new_bw, self.u_lub2) {
            warn!(
                sid,
                projected = %admission::projected_total(self.u_tot, srv.bw_current, new_bw),
                ceiling = %self.u_lub2,
                "budget change rejected: system overload"
            );
            return Err(QosError::SystemOverload);
        }
        self.u_tot = self
            .u_tot
            .saturating_sub(srv.bw_current)
            .saturating_add(new_bw);
        srv.bw_current = new_bw;
        srv.max_budget = new_budget;
        debug!(sid, budget = new_budget.as_usec(), u_tot = %self.u_tot, "budget assigned");
        Ok(())
    }

    /// Re-derive every server's budget from its approved bandwidth.
    ///
    /// Called after any create, parameter change or destroy: compression may
    /// have moved every server's approved share. Shares are cleared first so
    /// the per-server admission test never trips on a transient ordering of
    /// the walk.
    pub fn refresh_budgets(&mut self, sup: &Supervisor) {
        for srv in self.servers.values_mut() {
            srv.bw_current = Bw::ZERO;
        }
        self.u_tot = Bw::ZERO;

        let sids: Vec<ServerId> = self.servers.keys().copied().collect();
        for sid in sids {
            let period = self.servers[&sid].period;
            let q = sup.approved_bw(sid).to_budget(period);
            if let Err(e) = self.set_budget(sid, q) {
                // Only reachable when supervisor expansion outruns the
                // ceiling; the server keeps a zero budget until demand drops.
                error!(sid, err = %e, "approved budget not installable");
            }
        }
    }

    /// Add an immediately usable budget increase to the current instance.
    /// An exhausted server that regains budget goes straight back into the
    /// ready queue instead of waiting for its recharge.
    pub fn boost_budget(&mut self, sid: ServerId, delta: Duration) -> QosResult<()> {
        let srv = self.servers.get_mut(&sid).ok_or(QosError::NotFound)?;
        if delta.is_positive() {
            srv.budget = (srv.budget + delta).min(srv.max_budget);
            debug!(sid, budget = srv.budget.as_usec(), "instant budget increase");
            let deadline = srv.deadline;
            if srv.is_active() && srv.budget.is_positive() && !self.rq.contains(sid) {
                self.rq.push(sid, deadline)?;
            }
        }
        Ok(())
    }

    // ── Activation bookkeeping ────────────────────────────────────────────────

    /// A job arrived for `sid` (task became ready). On the transition from
    /// dormant to active the server joins the ready queue: with a fresh
    /// instance if its old deadline has already passed, with its preserved
    /// `(deadline, budget)` otherwise.
    pub fn activate(&mut self, sid: ServerId, now: Instant) -> QosResult<()> {
        let srv = self.servers.get_mut(&sid).ok_or(QosError::NotFound)?;
        srv.activations += 1;
        debug!(sid, activations = srv.activations, "activation");
        if srv.activations > 1 {
            return Ok(());
        }

        if now >= srv.deadline {
            // Dormant past its deadline: the old instance is worthless
            srv.reset_instance(now);
        }
        if srv.budget.is_positive() {
            let deadline = srv.deadline;
            if !self.rq.contains(sid) {
                self.rq.push(sid, deadline)?;
            }
        } else if srv.max_budget.is_positive() && !srv.recharge_timer.pending() {
            // Exhausted but not yet scheduled for recharge
            let deadline = srv.deadline;
            srv.recharge_timer.set(deadline);
            self.wheel.schedule(deadline, sid);
        }
        Ok(())
    }

    /// A job finished for `sid` (ready task blocked or left). On the last
    /// deactivation the server leaves the ready queue; its recharge timer
    /// stays armed so the budget and deadline are refreshed at the deadline
    /// and a later resumption does not inherit stale state.
    pub fn deactivate(&mut self, sid: ServerId, host: &mut dyn HostScheduler) -> QosResult<()> {
        let srv = self.servers.get_mut(&sid).ok_or(QosError::NotFound)?;
        if srv.activations == 0 {
            warn!(sid, "deactivation of a dormant server ignored");
            return Ok(());
        }
        srv.activations -= 1;
        debug!(sid, activations = srv.activations, "deactivation");
        if srv.activations == 0 {
            self.rq.remove(sid);
            if self.running == Some(sid) {
                let tasks = srv.ready_tasks.clone();
                host.stop(sid, &tasks);
                self.running = None;
                self.budget_expiry = None;
            }
        }
        Ok(())
    }

    // ── Scheduling cycle ──────────────────────────────────────────────────────

    /// Full scheduling pass at time `now`: debit, fire due timers, dispatch.
    /// Idempotent when nothing changed.
    pub fn tick(&mut self, now: Instant, sup: &Supervisor, host: &mut dyn HostScheduler) {
        self.update_running(now, host);
        self.process_timers(now, sup);
        self.dispatch_decision(now, host);
    }

    /// Charge elapsed time to the running server and handle exhaustion.
    fn update_running(&mut self, now: Instant, host: &mut dyn HostScheduler) {
        let dt = now - self.last_update;
        if dt.is_negative() {
            warn!(%now, last = %self.last_update, "time went backwards; skipping debit");
            return;
        }
        self.last_update = now;
        let Some(rid) = self.running else {
            return;
        };
        if !dt.is_positive() {
            return;
        }
        let Some(srv) = self.servers.get_mut(&rid) else {
            self.running = None;
            return;
        };
        srv.consume(dt);
        debug!(sid = rid, dt = dt.as_usec(), budget = srv.budget.as_usec(), "debit");
        if srv.is_exhausted() {
            self.exhaust(rid, host);
        }
    }

    /// Budget gone: out of the ready queue until the recharge at the current
    /// deadline. SOFT servers stay eligible best-effort in the host.
    fn exhaust(&mut self, sid: ServerId, host: &mut dyn HostScheduler) {
        let Some(srv) = self.servers.get_mut(&sid) else {
            return;
        };
        info!(sid, deadline = %srv.deadline, "budget exhausted");
        let deadline = srv.deadline;
        let tasks = srv.ready_tasks.clone();
        let soft = srv.has_flag(FLAG_SOFT);
        srv.recharge_timer.set(deadline);

        self.rq.remove(sid);
        self.wheel.schedule(deadline, sid);
        if self.running == Some(sid) {
            host.stop(sid, &tasks);
            self.running = None;
            self.budget_expiry = None;
        }
        if soft {
            host.allow_best_effort(sid, &tasks);
        }
    }

    /// Fire every due recharge. Entries popping at one instant are executed
    /// in deadline order, so coinciding recharges enter the ready queue the
    /// way EDF will serve them.
    fn process_timers(&mut self, now: Instant, sup: &Supervisor) {
        loop {
            let Some(at) = self.wheel.next_expiry().filter(|&a| a <= now) else {
                break;
            };
            let mut batch: Vec<ServerId> = Vec::new();
            while self.wheel.next_expiry() == Some(at) {
                let (_, sid) = self.wheel.pop_due(now).expect("expiry peeked above");
                let live = self
                    .servers
                    .get(&sid)
                    .map(|s| s.recharge_timer.fires_at(at))
                    .unwrap_or(false);
                if live && !batch.contains(&sid) {
                    batch.push(sid);
                } else {
                    debug!(sid, %at, "stale timer entry discarded");
                }
            }
            batch.sort_by_key(|sid| self.servers[sid].deadline);
            for sid in batch {
                self.recharge(sid, sup);
            }
        }
    }

    /// Refill the budget, postpone the deadline by one period, take the
    /// bandwidth approved for the new instance, and re-queue if the server
    /// still has work.
    fn recharge(&mut self, sid: ServerId, sup: &Supervisor) {
        let Some(srv) = self.servers.get_mut(&sid) else {
            return;
        };
        srv.recharge_timer.begin_fire();

        // The approved share may have moved since the last propagation; the
        // new instance must run on the fresh value.
        let appr = sup.approved_bw(sid);
        if appr != srv.bw_current {
            self.u_tot = self
                .u_tot
                .saturating_sub(srv.bw_current)
                .saturating_add(appr);
            srv.bw_current = appr;
            srv.max_budget = appr.to_budget(srv.period);
        }

        srv.apply_recharge();
        info!(
            sid,
            budget = srv.budget.as_usec(),
            deadline = %srv.deadline,
            recharges = srv.stat.recharges,
            "recharge"
        );
        srv.recharge_timer.end_fire();

        let deadline = srv.deadline;
        let requeue = srv.is_active() && srv.budget.is_positive();
        let rearm = srv.is_active() && srv.max_budget.is_positive();
        if rearm {
            srv.recharge_timer.set(deadline);
            self.wheel.schedule(deadline, sid);
        }
        if requeue {
            // The deadline moved: reposition rather than keep a stale key
            self.rq.remove(sid);
            if let Err(e) = self.rq.push(sid, deadline) {
                error!(sid, err = %e, "ready queue rejected recharged server");
            }
        } else {
            self.rq.remove(sid);
        }
    }

    /// Compare the queue head with the running server and switch if needed.
    fn dispatch_decision(&mut self, now: Instant, host: &mut dyn HostScheduler) {
        let top = self.rq.peek();
        if top != self.running {
            if let Some(old) = self.running {
                if let Some(srv) = self.servers.get(&old) {
                    debug!(sid = old, "preempted");
                    host.stop(old, &srv.ready_tasks);
                }
            }
            if let Some(new) = top {
                let srv = &self.servers[&new];
                info!(sid = new, deadline = %srv.deadline, "dispatch");
                host.dispatch(new, &srv.ready_tasks);
            }
            self.running = top;
        }
        self.budget_expiry = self.running.map(|rid| now + self.servers[&rid].budget);
    }

    /// Earliest instant at which this core wants a [`tick`](Self::tick):
    /// the sooner of the next timer expiry and the running server's budget
    /// depletion. A lower bound: ticking early is always safe.
    pub fn next_expiry(&self) -> Option<Instant> {
        match (self.wheel.next_expiry(), self.budget_expiry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // ── Introspection ─────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> Vec<ServerSnapshot> {
        self.servers
            .values()
            .map(|s| ServerSnapshot {
                sid: s.id,
                params: s.params,
                max_budget: s.max_budget,
                budget: s.budget,
                deadline: s.deadline,
                bw_current: s.bw_current,
                activations: s.activations,
                ready_tasks: s.ready_tasks.clone(),
                blocked_tasks: s.blocked_tasks.clone(),
                queued: self.rq.contains(s.id),
                running: self.running == Some(s.id),
                recharges: s.stat.recharges,
                exec_time: s.stat.exec_time,
                weight: s.weight,
                owner_uid: s.owner.uid,
                owner_gid: s.owner.gid,
            })
            .collect()
    }
}

/// Structured per-server view for the host's introspection surface.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSnapshot {
    pub sid: ServerId,
    pub params: crate::server::ServerParams,
    pub max_budget: Duration,
    pub budget: Duration,
    pub deadline: Instant,
    pub bw_current: Bw,
    pub activations: u32,
    pub ready_tasks: Vec<crate::host::TaskId>,
    pub blocked_tasks: Vec<crate::host::TaskId>,
    pub queued: bool,
    pub running: bool,
    pub recharges: u64,
    pub exec_time: Duration,
    pub weight: u32,
    pub owner_uid: u32,
    pub owner_gid: u32,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing::{HostEvent, StubHost};
    use crate::host::Principal;
    use crate::server::ServerParams;

    fn us(v: i64) -> Duration {
        Duration::from_usec(v)
    }

    fn t(v: u64) -> Instant {
        Instant::from_usec(v)
    }

    struct Rig {
        core: SchedCore,
        sup: Supervisor,
        host: StubHost,
    }

    impl Rig {
        fn new() -> Self {
            let cfg = SchedConfig::default();
            Rig {
                core: SchedCore::new(&cfg),
                sup: Supervisor::new(cfg.u_lub(), cfg.expand),
                host: StubHost::new(),
            }
        }

        /// Full creation flow: admission, required bandwidth, registration,
        /// propagation. One ready task is attached per server.
        fn add_server(&mut self, q: i64, p: i64, tid: u32) -> ServerId {
            let params = ServerParams::new(us(0), us(q), us(p), 0).rounded();
            let sid = self.core.alloc_sid();
            self.sup.admit_server(sid, 0, 0, &params).unwrap();
            self.sup
                .set_required_bw(sid, Bw::from_ratio(params.q, params.p))
                .unwrap();
            let mut srv = Server::new(sid, params, Principal::ROOT, Instant::ZERO);
            srv.ready_tasks.push(tid);
            self.core.insert_server(srv);
            self.core.refresh_budgets(&self.sup);
            sid
        }

        fn tick(&mut self, now: u64) {
            let mut host = self.host.clone();
            self.core.tick(t(now), &self.sup, &mut host);
        }

        fn activate(&mut self, sid: ServerId, now: u64) {
            self.core.activate(sid, t(now)).unwrap();
            self.tick(now);
        }

        /// Drive the core from timer expiry to timer expiry until `end`.
        fn run_until(&mut self, end: u64) {
            loop {
                match self.core.next_expiry() {
                    Some(at) if at.as_usec() <= end => self.tick(at.as_usec()),
                    _ => break,
                }
            }
            self.tick(end);
        }
    }

    // ── Budget assignment ─────────────────────────────────────────────────────

    #[test]
    fn created_server_gets_its_approved_budget() {
        let mut rig = Rig::new();
        let sid = rig.add_server(50_000, 100_000, 1);
        let srv = rig.core.server(sid).unwrap();
        assert_eq!(srv.max_budget, us(50_000));
        assert_eq!(srv.bw_current, Bw::from_ratio(us(50_000), us(100_000)));
        assert_eq!(rig.core.u_tot(), srv.bw_current);
    }

    #[test]
    fn set_budget_rejects_overload() {
        let mut rig = Rig::new();
        let sid = rig.add_server(50_000, 100_000, 1);
        // 97% of one CPU is past U_LUB2 = 96%
        assert_eq!(
            rig.core.set_budget(sid, us(97_000)),
            Err(QosError::SystemOverload)
        );
        // The rejected change left the old assignment in place
        assert_eq!(rig.core.server(sid).unwrap().max_budget, us(50_000));
    }

    #[test]
    fn alloc_sid_skips_zero_and_live_ids() {
        let mut rig = Rig::new();
        let a = rig.add_server(1_000, 10_000, 1);
        let b = rig.add_server(1_000, 10_000, 2);
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
    }

    // ── Activation and dispatch ───────────────────────────────────────────────

    #[test]
    fn activation_dispatches_the_server() {
        let mut rig = Rig::new();
        let sid = rig.add_server(50_000, 100_000, 1);
        rig.activate(sid, 0);
        assert_eq!(rig.core.running(), Some(sid));
        assert!(rig
            .host
            .events()
            .contains(&HostEvent::Dispatch(sid, vec![1])));
        // Fresh instance anchored at activation time
        let srv = rig.core.server(sid).unwrap();
        assert_eq!(srv.deadline, t(100_000));
        assert_eq!(srv.budget, us(50_000));
    }

    #[test]
    fn earliest_deadline_wins() {
        let mut rig = Rig::new();
        let slow = rig.add_server(10_000, 200_000, 1);
        let fast = rig.add_server(10_000, 50_000, 2);
        rig.activate(slow, 0); // deadline 200000, dispatched first
        assert_eq!(rig.core.running(), Some(slow));
        rig.activate(fast, 0); // deadline 50000 preempts
        assert_eq!(rig.core.running(), Some(fast));
        let ev = rig.host.events();
        assert!(ev.contains(&HostEvent::Stop(slow, vec![1])));
        assert!(ev.contains(&HostEvent::Dispatch(fast, vec![2])));
    }

    #[test]
    fn tick_is_idempotent_without_state_changes() {
        let mut rig = Rig::new();
        let sid = rig.add_server(50_000, 100_000, 1);
        rig.activate(sid, 0);
        rig.host.clear_events();
        rig.tick(10_000);
        rig.tick(10_000);
        rig.tick(10_000);
        assert!(rig.host.events().is_empty(), "{:?}", rig.host.events());
        assert_eq!(rig.core.running(), Some(sid));
    }

    // ── Exhaustion and recharge ───────────────────────────────────────────────

    #[test]
    fn exhaustion_stops_and_recharge_redispatches() {
        let mut rig = Rig::new();
        let sid = rig.add_server(50_000, 100_000, 1);
        rig.activate(sid, 0);
        rig.host.clear_events();

        rig.tick(50_000); // budget gone
        assert_eq!(rig.core.running(), None);
        assert!(rig.host.events().contains(&HostEvent::Stop(sid, vec![1])));
        let srv = rig.core.server(sid).unwrap();
        assert_eq!(srv.budget, us(0));
        assert!(!srv.budget.is_positive());

        rig.host.clear_events();
        rig.tick(100_000); // recharge at the deadline
        let srv = rig.core.server(sid).unwrap();
        assert_eq!(srv.budget, us(50_000));
        assert_eq!(srv.deadline, t(200_000));
        assert_eq!(srv.stat.recharges, 1);
        assert_eq!(rig.core.running(), Some(sid));
        assert!(rig
            .host
            .events()
            .contains(&HostEvent::Dispatch(sid, vec![1])));
    }

    #[test]
    fn overrun_is_paid_back_at_recharge() {
        let mut rig = Rig::new();
        let sid = rig.add_server(50_000, 100_000, 1);
        rig.activate(sid, 0);
        // The host only stops the task 300 µs after depletion
        rig.tick(50_300);
        assert_eq!(rig.core.server(sid).unwrap().budget, us(-300));
        rig.tick(100_000);
        assert_eq!(rig.core.server(sid).unwrap().budget, us(49_700));
    }

    #[test]
    fn proportional_execution_over_ten_periods() {
        let mut rig = Rig::new();
        let sid = rig.add_server(50_000, 100_000, 1);
        rig.activate(sid, 0);
        rig.run_until(1_000_000);
        let srv = rig.core.server(sid).unwrap();
        // 50% of 1 s
        assert_eq!(srv.stat.exec_time, us(500_000));
        assert!(srv.stat.recharges >= 9, "recharges = {}", srv.stat.recharges);
    }

    #[test]
    fn small_budget_server_gets_its_share_each_period() {
        let mut rig = Rig::new();
        let sid = rig.add_server(10_000, 100_000, 1);
        rig.activate(sid, 0);
        for k in 1..=10u64 {
            rig.run_until(k * 100_000);
            let exec = rig.core.server(sid).unwrap().stat.exec_time;
            assert_eq!(exec, us(10_000 * k as i64), "period {k}");
        }
    }

    #[test]
    fn soft_server_is_offered_best_effort_on_exhaustion() {
        let mut rig = Rig::new();
        let params = ServerParams::new(us(0), us(10_000), us(100_000), FLAG_SOFT).rounded();
        let sid = rig.core.alloc_sid();
        rig.sup.admit_server(sid, 0, 0, &params).unwrap();
        rig.sup
            .set_required_bw(sid, Bw::from_ratio(params.q, params.p))
            .unwrap();
        let mut srv = Server::new(sid, params, Principal::ROOT, Instant::ZERO);
        srv.ready_tasks.push(9);
        rig.core.insert_server(srv);
        rig.core.refresh_budgets(&rig.sup);

        rig.activate(sid, 0);
        rig.tick(10_000);
        assert!(rig
            .host
            .events()
            .contains(&HostEvent::BestEffort(sid, vec![9])));
    }

    // ── Deactivation ──────────────────────────────────────────────────────────

    #[test]
    fn last_deactivation_parks_the_server() {
        let mut rig = Rig::new();
        let sid = rig.add_server(50_000, 100_000, 1);
        rig.activate(sid, 0);
        rig.tick(20_000);

        let mut host = rig.host.clone();
        rig.core.deactivate(sid, &mut host).unwrap();
        rig.tick(20_000);
        assert_eq!(rig.core.running(), None);
        let srv = rig.core.server(sid).unwrap();
        assert!(!srv.is_active());
        // Budget is preserved for a quick resumption
        assert_eq!(srv.budget, us(30_000));
    }

    #[test]
    fn resumption_before_the_deadline_keeps_the_instance() {
        let mut rig = Rig::new();
        let sid = rig.add_server(50_000, 100_000, 1);
        rig.activate(sid, 0);
        rig.tick(20_000);
        let mut host = rig.host.clone();
        rig.core.deactivate(sid, &mut host).unwrap();
        rig.tick(20_000);

        rig.activate(sid, 60_000); // deadline 100000 still ahead
        let srv = rig.core.server(sid).unwrap();
        assert_eq!(srv.deadline, t(100_000));
        assert_eq!(srv.budget, us(30_000));
        assert_eq!(rig.core.running(), Some(sid));
    }

    #[test]
    fn resumption_after_long_idle_starts_a_fresh_instance() {
        let mut rig = Rig::new();
        let sid = rig.add_server(50_000, 100_000, 1);
        rig.activate(sid, 0);
        rig.tick(20_000);
        let mut host = rig.host.clone();
        rig.core.deactivate(sid, &mut host).unwrap();
        rig.tick(20_000);

        // Long idle, well past the old deadline of 100000: a stale deadline
        // must not leak into EDF ordering.
        rig.activate(sid, 950_000);
        let srv = rig.core.server(sid).unwrap();
        assert!(srv.deadline > t(950_000), "deadline {} is stale", srv.deadline);
        assert_eq!(srv.budget, us(50_000));
    }

    #[test]
    fn deactivating_a_dormant_server_is_clamped() {
        let mut rig = Rig::new();
        let sid = rig.add_server(50_000, 100_000, 1);
        let mut host = rig.host.clone();
        rig.core.deactivate(sid, &mut host).unwrap();
        assert_eq!(rig.core.server(sid).unwrap().activations, 0);
    }

    // ── Coinciding timers ─────────────────────────────────────────────────────

    #[test]
    fn coinciding_recharges_enter_in_deadline_order() {
        let mut rig = Rig::new();
        // Same period, activated together: both exhaust and both recharge at
        // the same instants.
        let a = rig.add_server(20_000, 100_000, 1);
        let b = rig.add_server(30_000, 100_000, 2);
        rig.core.activate(a, t(0)).unwrap();
        rig.core.activate(b, t(0)).unwrap();
        rig.tick(0);

        // a (insertion order) runs first, exhausts at 20000; b runs, exhausts
        // at 50000; both recharge timers sit at deadline 100000.
        rig.run_until(99_999);
        assert_eq!(rig.core.running(), None);

        rig.host.clear_events();
        rig.tick(100_000);
        // Both recharged to deadline 200000; insertion order decides again
        assert_eq!(rig.core.running(), Some(a));
        let srv_a = rig.core.server(a).unwrap();
        let srv_b = rig.core.server(b).unwrap();
        assert_eq!(srv_a.deadline, t(200_000));
        assert_eq!(srv_b.deadline, t(200_000));
        assert_eq!(srv_a.stat.recharges, 1);
        assert_eq!(srv_b.stat.recharges, 1);
    }

    #[test]
    fn exhaust_at_the_deadline_recharges_into_the_fresh_instance() {
        // Two servers arranged so that b's budget depletes exactly when its
        // own recharge timer fires: the exhaust must be processed first and
        // the recharge must then queue b at its fresh deadline.
        let mut rig = Rig::new();
        let a = rig.add_server(50_000, 100_000, 1);
        let b = rig.add_server(25_000, 50_000, 2);
        rig.core.activate(a, t(0)).unwrap();
        rig.core.activate(b, t(0)).unwrap();
        rig.tick(0);

        // b (deadline 50000) runs [0, 25000] and exhausts; a (deadline
        // 100000) runs [25000, 75000] and exhausts; b recharges at 50000 to
        // deadline 100000 and runs [75000, 100000], depleting exactly at
        // its own 100000 recharge.
        rig.run_until(100_000);

        let srv_b = rig.core.server(b).unwrap();
        assert_eq!(srv_b.budget, us(25_000));
        assert_eq!(srv_b.deadline, t(150_000));
        let srv_a = rig.core.server(a).unwrap();
        assert_eq!(srv_a.budget, us(50_000));
        assert_eq!(srv_a.deadline, t(200_000));
        // b re-entered at its fresh deadline and is the earlier of the two
        assert_eq!(rig.core.running(), Some(b));
        assert_eq!(srv_a.stat.exec_time, us(50_000));
        assert_eq!(srv_b.stat.exec_time, us(50_000));
    }

    // ── Removal ───────────────────────────────────────────────────────────────

    #[test]
    fn removal_releases_bandwidth_and_stops_tasks() {
        let mut rig = Rig::new();
        let sid = rig.add_server(50_000, 100_000, 1);
        rig.activate(sid, 0);
        let mut host = rig.host.clone();
        let srv = rig.core.remove_server(sid, &mut host).unwrap();
        assert_eq!(srv.id, sid);
        assert_eq!(rig.core.u_tot(), Bw::ZERO);
        assert_eq!(rig.core.running(), None);
        assert!(rig.host.events().contains(&HostEvent::Stop(sid, vec![1])));
        assert_eq!(
            rig.core.remove_server(sid, &mut host).unwrap_err(),
            QosError::NotFound
        );
    }

    #[test]
    fn stale_wheel_entries_of_a_removed_server_are_discarded() {
        let mut rig = Rig::new();
        let sid = rig.add_server(50_000, 100_000, 1);
        rig.activate(sid, 0);
        rig.tick(50_000); // exhausts and arms the recharge timer at 100000
        let mut host = rig.host.clone();
        rig.core.remove_server(sid, &mut host).unwrap();
        // The wheel entry for 100000 now points at nothing; the tick must
        // discard it without effect
        rig.tick(500_000);
        assert_eq!(rig.core.running(), None);
    }

    #[test]
    fn next_expiry_tracks_budget_depletion() {
        let mut rig = Rig::new();
        let sid = rig.add_server(50_000, 100_000, 1);
        rig.activate(sid, 0);
        assert_eq!(rig.core.next_expiry(), Some(t(50_000)));
        rig.tick(30_000);
        assert_eq!(rig.core.next_expiry(), Some(t(50_000)));
        assert_eq!(rig.core.server(sid).unwrap().budget, us(20_000));
    }
}
