/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Utilisation-based admission test for budget changes.
//!
//! The scheduler admits a bandwidth change on one server only if the total
//! allocated bandwidth stays below the ceiling:
//!
//! ```text
//! U_tot − U_old + U_new ≤ U_LUB2        where U_LUB2 = U_LUB + 1%
//! ```
//!
//! The supervisor performs its own admission in exact request space before
//! any budget reaches the scheduler, but the two layers round independently:
//! the supervisor works on requested bandwidths, the scheduler on budgets
//! re-derived from approved bandwidths. The one-percent tolerance absorbs
//! that cumulative fixed-point drift, so a request the supervisor accepted
//! is never bounced here for rounding reasons alone.

use crate::bandwidth::Bw;

/// Whether replacing `old_bw` by `new_bw` keeps the total under `ceiling`.
pub fn admissible(u_tot: Bw, old_bw: Bw, new_bw: Bw, ceiling: Bw) -> bool {
    u_tot.saturating_sub(old_bw).saturating_add(new_bw) <= ceiling
}

/// Total after the replacement, for logging at the rejection site.
pub fn projected_total(u_tot: Bw, old_bw: Bw, new_bw: Bw) -> Bw {
    u_tot.saturating_sub(old_bw).saturating_add(new_bw)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
