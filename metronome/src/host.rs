/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Host scheduler binding.
//!
//! The reservation core never manipulates task state directly: everything it
//! needs from the surrounding operating environment goes through the single
//! [`HostScheduler`] trait: raising and lowering the effective priority of
//! a server's tasks at dispatch/stop, returning a detached task to the
//! default scheduling class, and reading task attributes.
//!
//! All trait methods are invoked with the scheduler lock held; an
//! implementation must not call back into the reservation core.

use crate::server::ServerId;

/// Host-side task identifier (thread id in a POSIX host).
pub type TaskId = u32;

/// Effective uid/gid pair of the caller of a facade operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub uid: u32,
    pub gid: u32,
}

impl Principal {
    pub const ROOT: Principal = Principal { uid: 0, gid: 0 };

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// Integration surface the embedding host must provide.
pub trait HostScheduler: Send {
    /// Effective principal of the caller currently executing a facade
    /// operation.
    fn current_principal(&self) -> Principal;

    /// Owner uid of a task, or `None` if the host does not know the task.
    fn task_uid(&self, task: TaskId) -> Option<u32>;

    /// Owner gid of a task, or `None` if the host does not know the task.
    fn task_gid(&self, task: TaskId) -> Option<u32>;

    /// Whether the task is currently runnable (not blocked in the host).
    fn is_runnable(&self, task: TaskId) -> bool;

    /// Make the listed tasks of `server` eligible to run at the reservation
    /// priority.
    fn dispatch(&mut self, server: ServerId, tasks: &[TaskId]);

    /// Stop scheduling the listed tasks of `server` at the reservation
    /// priority.
    fn stop(&mut self, server: ServerId, tasks: &[TaskId]);

    /// Return a detached task to the host's default scheduling class.
    fn to_default_class(&mut self, task: TaskId);

    /// Advisory: the server exhausted its budget but carries the SOFT flag,
    /// so its tasks may keep running best-effort until the recharge.
    fn allow_best_effort(&mut self, _server: ServerId, _tasks: &[TaskId]) {}
}

// ── Test double ───────────────────────────────────────────────────────────────
