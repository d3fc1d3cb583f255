/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! The bandwidth supervisor: rule-driven admission and adaptive compression.
//!
//! The supervisor mediates every bandwidth request before the scheduler sees
//! it. Policy comes from three rule kinds (per-level caps, per-group and
//! per-user [`Constraints`]) and from a global spare reservation. For each
//! server it tracks the *required* bandwidth (what the owner asked for, after
//! per-server saturation), the *guaranteed* minimum admitted at creation, and
//! derives the *approved* bandwidth:
//!
//! ```text
//! approved = used_gua + (required − used_gua) × user_coeff × level_coeff
//! ```
//!
//! Both coefficients are recomputed on every request change: the user
//! coefficient shrinks a user's aggregate demand to its per-user cap, the
//! level coefficient shrinks a level's aggregate demand to what is left by
//! higher-priority levels. Guaranteed minima are excluded from both products,
//! so compression can never push a server below its admitted floor.
//!
//! Aggregate partials are updated by deltas on every change; repeated
//! truncation can leave a partial a few units off, so subtractions saturate
//! instead of wrapping.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::bandwidth::{Bw, Coeff};
use crate::error::{QosError, QosResult};
use crate::server::{ServerId, ServerParams};

/// Number of priority levels. Level 0 is served first; each subsequent level
/// receives what its predecessors left below the ceiling.
pub const MAX_LEVELS: usize = 2;

// ── Rules ─────────────────────────────────────────────────────────────────────

/// Constraint set attached to a user or group rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Constraints {
    /// Priority level the principal's servers are accounted in.
    pub level: usize,
    /// Relative weight among servers of the same level; opaque until a
    /// reclaiming policy consumes it.
    pub weight: u32,
    /// Cap on the principal's aggregate required bandwidth.
    pub max_bw: Bw,
    /// Cap on the principal's aggregate guaranteed minima.
    pub max_min_bw: Bw,
    /// Server flags the principal may not use.
    pub flags_mask: u32,
}

impl Constraints {
    /// Built-in constraints applied when no rule matches.
    fn default_for(u_lub: Bw) -> Self {
        Constraints {
            level: 0,
            weight: 1,
            max_bw: u_lub,
            max_min_bw: u_lub,
            flags_mask: 0,
        }
    }
}

// ── Aggregates ────────────────────────────────────────────────────────────────

/// Per-user aggregate demand and compression state.
#[derive(Debug, Clone)]
struct UserState {
    /// Sum of saturated requests of this user's servers.
    req: Bw,
    /// Sum of admitted guaranteed minima.
    gua: Bw,
    /// Sum of minima currently in use (`min(req, gua)` per server).
    used_gua: Bw,
    /// Compression applied to this user's demand beyond the used minima.
    coeff: Coeff,
}

impl Default for UserState {
    fn default() -> Self {
        UserState {
            req: Bw::ZERO,
            gua: Bw::ZERO,
            used_gua: Bw::ZERO,
            coeff: Coeff::ONE,
        }
    }
}

/// Per-level aggregate demand and compression state.
#[derive(Debug, Clone)]
struct LevelState {
    /// Configured cap for this level.
    max: Bw,
    /// Total (per-user capped) request accounted to this level.
    req: Bw,
    /// Bandwidth actually assigned to this level in the last walk.
    sum: Bw,
    /// Sum of minima currently in use by this level's servers.
    gua: Bw,
    /// Compression applied to this level's demand beyond the used minima.
    coeff: Coeff,
}

/// Per-server supervisor record.
#[derive(Debug, Clone, Copy)]
struct Entry {
    level: usize,
    weight: u32,
    /// Per-user cap in force when the server was admitted.
    max_user_bw: Bw,
    uid: u32,
    gid: u32,
    /// Saturated required bandwidth.
    req_bw: Bw,
    /// Admitted guaranteed minimum.
    gua_bw: Bw,
    /// Minimum currently in use: `min(req_bw, gua_bw)`.
    used_gua_bw: Bw,
}

// ── Supervisor ────────────────────────────────────────────────────────────────

/// Rule set, aggregates and per-server records of the admission layer.
#[derive(Debug)]
pub struct Supervisor {
    u_lub: Bw,
    expand: bool,
    spare: Bw,
    /// Rules are prepended and the lookup stops at the first match, so the
    /// most recently added rule for a key wins.
    user_rules: Vec<(u32, Constraints)>,
    group_rules: Vec<(u32, Constraints)>,
    users: BTreeMap<u32, UserState>,
    levels: [LevelState; MAX_LEVELS],
    entries: BTreeMap<ServerId, Entry>,
    /// Sum of admitted guaranteed minima across all servers.
    tot_gua: Bw,
    /// Sum of minima currently in use across all servers.
    tot_used_gua: Bw,
}

impl Supervisor {
    pub fn new(u_lub: Bw, expand: bool) -> Self {
        Supervisor {
            u_lub,
            expand,
            spare: Bw::ZERO,
            user_rules: Vec::new(),
            group_rules: Vec::new(),
            users: BTreeMap::new(),
            levels: std::array::from_fn(|_| LevelState {
                max: u_lub,
                req: Bw::ZERO,
                sum: Bw::ZERO,
                gua: Bw::ZERO,
                coeff: Coeff::ONE,
            }),
            entries: BTreeMap::new(),
            tot_gua: Bw::ZERO,
            tot_used_gua: Bw::ZERO,
        }
    }

    // ── Rule administration ───────────────────────────────────────────────────

    /// Cap the bandwidth assignable to `level`. The cap is clamped to the
    /// global ceiling.
    pub fn add_level_rule(&mut self, level: usize, max_bw: Bw) -> QosResult<()> {
        if level >= MAX_LEVELS {
            return Err(QosError::InvalidParam);
        }
        self.levels[level].max = max_bw.min(self.u_lub);
        debug!(level, max_bw = %self.levels[level].max, "level rule installed");
        Ok(())
    }

    pub fn add_group_constraints(&mut self, gid: u32, constr: Constraints) -> QosResult<()> {
        if constr.level >= MAX_LEVELS {
            return Err(QosError::InvalidParam);
        }
        self.group_rules.insert(0, (gid, constr));
        debug!(gid, level = constr.level, max_bw = %constr.max_bw, "group rule installed");
        Ok(())
    }

    pub fn add_user_constraints(&mut self, uid: u32, constr: Constraints) -> QosResult<()> {
        if constr.level >= MAX_LEVELS {
            return Err(QosError::InvalidParam);
        }
        self.user_rules.insert(0, (uid, constr));
        debug!(uid, level = constr.level, max_bw = %constr.max_bw, "user rule installed");
        Ok(())
    }

    /// Withhold `bw` from the guaranteed-minimum admission test. Only legal
    /// while no server exists.
    pub fn reserve_spare(&mut self, bw: Bw) -> QosResult<()> {
        if bw > self.u_lub {
            return Err(QosError::InvalidParam);
        }
        if !self.entries.is_empty() {
            return Err(QosError::InconsistentState);
        }
        self.spare = bw;
        Ok(())
    }

    /// Constraints in force for a principal: user rule first, then group
    /// rule, else the built-in defaults.
    pub fn find_constraints(&self, uid: u32, gid: u32) -> Constraints {
        if let Some(&(_, c)) = self.user_rules.iter().find(|&&(u, _)| u == uid) {
            return c;
        }
        if let Some(&(_, c)) = self.group_rules.iter().find(|&&(g, _)| g == gid) {
            return c;
        }
        Constraints::default_for(self.u_lub)
    }

    // ── Principal queries ─────────────────────────────────────────────────────

    /// Cap on the principal's aggregate guaranteed minima.
    pub fn max_gua_bw(&self, uid: u32, gid: u32) -> Bw {
        self.find_constraints(uid, gid).max_min_bw
    }

    /// Guaranteed bandwidth the principal may still admit.
    pub fn avail_gua_bw(&self, uid: u32, gid: u32) -> Bw {
        let gua = self.users.get(&uid).map(|u| u.gua).unwrap_or(Bw::ZERO);
        self.find_constraints(uid, gid).max_min_bw.saturating_sub(gua)
    }

    /// Bandwidth the principal may still request before saturation.
    pub fn avail_bw(&self, uid: u32, gid: u32) -> Bw {
        let req = self.users.get(&uid).map(|u| u.req).unwrap_or(Bw::ZERO);
        self.find_constraints(uid, gid).max_bw.saturating_sub(req)
    }

    // ── Server admission and removal ──────────────────────────────────────────

    /// Admit a new server's guaranteed minimum.
    ///
    /// On success the server is recorded with a zero required bandwidth; the
    /// caller follows up with [`set_required_bw`](Self::set_required_bw).
    /// On failure no aggregate is modified.
    pub fn admit_server(
        &mut self,
        sid: ServerId,
        uid: u32,
        gid: u32,
        params: &ServerParams,
    ) -> QosResult<()> {
        if self.entries.contains_key(&sid) {
            error!(sid, "server already known to the supervisor");
            return Err(QosError::Internal);
        }

        let bw_min = Bw::from_ratio_ceil(params.q_min, params.p);
        let constr = self.find_constraints(uid, gid);
        debug!(sid, uid, gid, bw_min = %bw_min, "admitting server");

        if params.flags & constr.flags_mask != 0 {
            warn!(sid, uid, flags = params.flags, mask = constr.flags_mask,
                  "requested flags violate the configured mask");
            return Err(QosError::Unauthorized);
        }
        if bw_min > constr.max_min_bw {
            warn!(sid, uid, bw_min = %bw_min, max_min_bw = %constr.max_min_bw,
                  "guaranteed minimum violates the per-principal cap");
            return Err(QosError::Unauthorized);
        }

        // Feasibility of all admitted minima: Σ bw_min <= U_LUB − spare
        let headroom = self.u_lub.saturating_sub(self.spare);
        let new_tot = self.tot_gua.saturating_add(bw_min);
        if new_tot > headroom {
            warn!(sid, new_tot = %new_tot, headroom = %headroom,
                  "guaranteed minimum rejected: system overload");
            return Err(QosError::SystemOverload);
        }

        let user_gua = self.users.get(&uid).map(|u| u.gua).unwrap_or(Bw::ZERO);
        if user_gua.saturating_add(bw_min) > headroom {
            warn!(sid, uid, user_gua = %user_gua,
                  "user's aggregate minima exceed the global headroom");
            return Err(QosError::SystemOverload);
        }
        if user_gua.saturating_add(bw_min) > constr.max_min_bw {
            warn!(sid, uid, user_gua = %user_gua, max_min_bw = %constr.max_min_bw,
                  "user's aggregate minima exceed the per-principal cap");
            return Err(QosError::Unauthorized);
        }

        let user = self.users.entry(uid).or_default();
        user.gua = user.gua.saturating_add(bw_min);
        self.tot_gua = new_tot;
        self.entries.insert(
            sid,
            Entry {
                level: constr.level,
                weight: constr.weight,
                max_user_bw: constr.max_bw,
                uid,
                gid,
                req_bw: Bw::ZERO,
                gua_bw: bw_min,
                used_gua_bw: Bw::ZERO,
            },
        );
        Ok(())
    }

    /// Remove a server, returning its guaranteed minimum to the pool. The
    /// required bandwidth is first driven to zero so every partial is
    /// correctly unwound.
    pub fn remove_server(&mut self, sid: ServerId) -> QosResult<()> {
        if !self.entries.contains_key(&sid) {
            return Err(QosError::NotFound);
        }
        if self.entries[&sid].req_bw != Bw::ZERO {
            self.set_required_bw(sid, Bw::ZERO)?;
        }
        let e = self.entries.remove(&sid).expect("entry checked above");
        self.tot_gua = self.tot_gua.saturating_sub(e.gua_bw);
        if let Some(user) = self.users.get_mut(&e.uid) {
            user.gua = user.gua.saturating_sub(e.gua_bw);
        }
        Ok(())
    }

    /// Number of admitted servers.
    pub fn server_count(&self) -> usize {
        self.entries.len()
    }

    // ── Required bandwidth ────────────────────────────────────────────────────

    /// Record a new required bandwidth for `sid` and recompute every
    /// affected compression coefficient.
    ///
    /// A request beyond the per-user cap saturates silently: rejecting it
    /// would make "as much as I can get" inexpressible.
    pub fn set_required_bw(&mut self, sid: ServerId, requested: Bw) -> QosResult<()> {
        let e = *self.entries.get(&sid).ok_or(QosError::NotFound)?;

        let mut r = requested;
        if r > e.max_user_bw {
            debug!(sid, requested = %requested, cap = %e.max_user_bw, "saturating request");
            r = e.max_user_bw;
        }

        // Guaranteed-minimum usage and its partials
        let used = r.min(e.gua_bw);
        let user = self.users.entry(e.uid).or_default();
        user.used_gua = user.used_gua.saturating_sub(e.used_gua_bw).saturating_add(used);
        let user_used_gua = user.used_gua;
        let lev_state = &mut self.levels[e.level];
        lev_state.gua = lev_state.gua.saturating_sub(e.used_gua_bw).saturating_add(used);
        self.tot_used_gua = self
            .tot_used_gua
            .saturating_sub(e.used_gua_bw)
            .saturating_add(used);

        // Per-user aggregate request and compression coefficient
        let user = self.users.get_mut(&e.uid).expect("user created above");
        let user_req_old = user.req;
        let user_req_new = user.req.saturating_sub(e.req_bw).saturating_add(r);
        user.req = user_req_new;

        let compressible = user_req_new.saturating_sub(user_used_gua);
        if user_req_new > e.max_user_bw || (self.expand && compressible != Bw::ZERO) {
            user.coeff = Coeff::ratio(e.max_user_bw.saturating_sub(user_used_gua), compressible);
        } else {
            user.coeff = Coeff::ONE;
        }
        debug!(sid, uid = e.uid, user_req = %user_req_new,
               user_coeff = user.coeff.to_f64(), "per-user demand updated");

        // Per-level aggregate request (per-user demand enters capped)
        let lev_state = &mut self.levels[e.level];
        lev_state.req = lev_state
            .req
            .saturating_sub(user_req_old.min(e.max_user_bw))
            .saturating_add(user_req_new.min(e.max_user_bw));

        let entry = self.entries.get_mut(&sid).expect("entry copied above");
        entry.req_bw = r;
        entry.used_gua_bw = used;

        // A change in one level's demand can shift what is available to all
        // lower-priority levels, so walk them all from the top.
        let mut avail = self.u_lub;
        for (i, lev) in self.levels.iter_mut().enumerate() {
            let assigned = lev.req.min(lev.max).min(avail);
            lev.sum = assigned;
            lev.coeff = if lev.req > lev.gua {
                Coeff::ratio(
                    assigned.saturating_sub(lev.gua),
                    lev.req.saturating_sub(lev.gua),
                )
            } else {
                Coeff::ONE
            };
            debug!(level = i, req = %lev.req, assigned = %assigned,
                   coeff = lev.coeff.to_f64(), "level walk");
            avail = avail.saturating_sub(assigned);
        }
        Ok(())
    }

    // ── Per-server getters ────────────────────────────────────────────────────

    /// Bandwidth the supervisor currently grants to `sid`: the used minimum
    /// plus the doubly-compressed remainder of the request.
    pub fn approved_bw(&self, sid: ServerId) -> Bw {
        let Some(e) = self.entries.get(&sid) else {
            error!(sid, "approved bandwidth queried for unknown server");
            return Bw::ZERO;
        };
        let user_coeff = self
            .users
            .get(&e.uid)
            .map(|u| u.coeff)
            .unwrap_or(Coeff::ONE);
        let level_coeff = self.levels[e.level].coeff;
        let beyond = e.req_bw.saturating_sub(e.used_gua_bw);
        e.used_gua_bw
            .saturating_add(level_coeff.apply(user_coeff.apply(beyond)))
    }

    /// Saturated required bandwidth recorded for `sid`.
    pub fn required_bw(&self, sid: ServerId) -> Bw {
        self.entries.get(&sid).map(|e| e.req_bw).unwrap_or(Bw::ZERO)
    }

    /// Guaranteed minimum admitted for `sid`.
    pub fn guaranteed_bw(&self, sid: ServerId) -> Bw {
        self.entries.get(&sid).map(|e| e.gua_bw).unwrap_or(Bw::ZERO)
    }

    /// Weight from the constraints in force when `sid` was admitted.
    pub fn rule_weight(&self, sid: ServerId) -> u32 {
        self.entries.get(&sid).map(|e| e.weight).unwrap_or(1)
    }

    // ── Introspection ─────────────────────────────────────────────────────────

    /// Structured view of the full supervisor state; formatting is the
    /// host's concern.
    pub fn snapshot(&self) -> SupervisorSnapshot {
        SupervisorSnapshot {
            u_lub: self.u_lub,
            spare: self.spare,
            tot_gua: self.tot_gua,
            tot_used_gua: self.tot_used_gua,
            levels: self
                .levels
                .iter()
                .enumerate()
                .map(|(i, l)| LevelSnapshot {
                    level: i,
                    max: l.max,
                    req: l.req,
                    sum: l.sum,
                    gua: l.gua,
                    coeff: l.coeff.to_f64(),
                })
                .collect(),
            users: self
                .users
                .iter()
                .map(|(&uid, u)| UserSnapshot {
                    uid,
                    req: u.req,
                    gua: u.gua,
                    used_gua: u.used_gua,
                    coeff: u.coeff.to_f64(),
                })
                .collect(),
            servers: self
                .entries
                .iter()
                .map(|(&sid, e)| ServerBwSnapshot {
                    sid,
                    uid: e.uid,
                    level: e.level,
                    req_bw: e.req_bw,
                    gua_bw: e.gua_bw,
                    approved_bw: self.approved_bw(sid),
                })
                .collect(),
        }
    }
}

// ── Snapshot types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct LevelSnapshot {
    pub level: usize,
    pub max: Bw,
    pub req: Bw,
    pub sum: Bw,
    pub gua: Bw,
    pub coeff: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserSnapshot {
    pub uid: u32,
    pub req: Bw,
    pub gua: Bw,
    pub used_gua: Bw,
    pub coeff: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerBwSnapshot {
    pub sid: ServerId,
    pub uid: u32,
    pub level: usize,
    pub req_bw: Bw,
    pub gua_bw: Bw,
    pub approved_bw: Bw,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorSnapshot {
    pub u_lub: Bw,
    pub spare: Bw,
    pub tot_gua: Bw,
    pub tot_used_gua: Bw,
    pub levels: Vec<LevelSnapshot>,
    pub users: Vec<UserSnapshot>,
    pub servers: Vec<ServerBwSnapshot>,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
