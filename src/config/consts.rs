// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

/// Default cap on retained entries per bus topic (oldest trimmed first)
pub const DEFAULT_BUS_MAX_LEN: usize = 10_000;
/// Default blocking-read timeout for bus consumers (milliseconds)
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 5_000;
/// Default publish retry budget before giving up
pub const DEFAULT_PUBLISH_ATTEMPTS: u32 = 3;
/// Default initial backoff between publish retries (doubles per attempt)
pub const DEFAULT_PUBLISH_BACKOFF_MS: u64 = 100;
/// Default window before an unacknowledged delivery is claimable by peers (milliseconds)
pub const DEFAULT_CLAIM_TIMEOUT_MS: u64 = 60_000;
/// Default deadline for blocking calls into an event loop (milliseconds)
pub const DEFAULT_BLOCK_TIMEOUT_MS: u64 = 10_000;
