/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Metronome – adaptive CPU-time resource reservation scheduling.
//!
//! Each reservation *server* owns a budget `Q` consumed over a period `P`
//! (bandwidth `Q/P`); attached tasks are dispatched EDF-style by server
//! deadline, and a supervising admission layer compresses aggregate demand
//! so total utilisation stays below a configured ceiling while per-server
//! guaranteed minima are never violated.
//!
//! Module layout:
//!
//! ```text
//! lib.rs
//! ├── bandwidth   – 24-bit fixed-point bandwidths & compression coefficients
//! ├── time        – µs durations (signed), monotonic instants, clock sources
//! ├── timer       – one-shot recharge timers + expiry wheel
//! ├── ready_queue – deadline-ordered queue of runnable servers
//! ├── server      – the reservation server: budget, deadline, task set
//! ├── scheduler/  – registry, utilisation accounting, dispatch, recharge
//! ├── supervisor  – level/group/user rules, aggregation, compression
//! ├── facade      – public API surface, authorization, host hooks
//! ├── config      – YAML scheduler configuration
//! ├── host        – host scheduler binding (dispatch/stop/task queries)
//! ├── error       – stable error taxonomy
//! └── trace       – tracing subscriber bootstrap for embedders
//! ```

pub mod bandwidth;
pub mod config;
pub mod error;
pub mod facade;
pub mod host;
pub mod ready_queue;
pub mod scheduler;
pub mod server;
pub mod supervisor;
pub mod time;
pub mod timer;
pub mod trace;

pub use bandwidth::Bw;
pub use config::SchedConfig;
pub use error::{QosError, QosResult};
pub use facade::Reservations;
pub use server::{ServerId, ServerParams};
pub use time::{Duration, Instant};
