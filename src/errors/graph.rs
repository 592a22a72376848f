// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Errors raised while building or mutating the stream graph.

use thiserror::Error;

/// Errors that can occur during graph construction and validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Two streams bound to different event loops were connected.
    ///
    /// Connecting fails before either side is mutated, so the existing
    /// graph is left exactly as it was.
    #[error("streams are bound to conflicting event loops ({left} vs {right})")]
    ConflictingLoops { left: String, right: String },

    /// An operator that schedules work needs an event loop, but none is
    /// bound to the stream or any stream it connects to.
    #[error("operator '{operator}' requires an event loop; bind one with Stream::with_loop or Runtime::stream")]
    LoopRequired { operator: &'static str },

    /// A scheduler job was registered under a name that is already taken.
    #[error("duplicate job name: '{name}'")]
    DuplicateJob { name: String },

    /// A namespace or topic name contains characters the backends cannot
    /// address safely.
    #[error("invalid name '{name}': only ASCII alphanumerics, '_' and '-' are allowed")]
    InvalidName { name: String },
}

/// Errors for content-based dispatch and upstream resolution.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// An operation required exactly one upstream, but the stream has
    /// zero or several.
    #[error("stream has {count} upstreams where exactly one is required")]
    AmbiguousUpstream { count: usize },

    /// A combining node received a value from a stream that is not one
    /// of its registered branches.
    #[error("value arrived from an unknown branch of a combining node")]
    UnknownBranch,
}
