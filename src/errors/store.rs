// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Errors for the persistent key/value + time-log store.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A payload could not be encoded to or decoded from its stored form.
    #[error("cannot encode or decode stored value: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A raw mapping was written to a time-keyed store under the default
    /// policy. Use `append` (the whole mapping becomes one record) or open
    /// the store with `MappingPolicy::Append`.
    #[error("time-keyed store rejects raw mappings; append the mapping as a single value instead")]
    MappingRejected,

    /// `append` was called on an explicit-key store.
    #[error("append is only supported on time-keyed stores")]
    AppendUnsupported,

    /// The namespace would grow past its configured `max_size`.
    ///
    /// Internal signal only: the store reacts by evicting the oldest
    /// record and retrying, so callers never observe this variant.
    #[error("namespace is at capacity")]
    CapacityExceeded,

    /// The underlying SQLite backend failed.
    #[error(transparent)]
    Backend(#[from] sqlx::Error),
}
