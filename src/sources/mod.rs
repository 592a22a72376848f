// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! External feed sources.
//!
//! A [`FileTail`] follows a text file and emits each complete line into
//! a stream: existing content first, then lines appended while the tail
//! is running. Polling happens on the event loop; the tail stops on
//! [`FileTail::stop`] or drop.

use crate::bridge::ExecLoop;
use crate::graph::Stream;
use crate::Value;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;

/// Line-oriented file follower feeding one stream.
pub struct FileTail {
    cancel: CancellationToken,
}

impl FileTail {
    pub fn start(
        exec: &ExecLoop,
        path: impl Into<PathBuf>,
        poll_interval: Duration,
        target: Stream,
    ) -> FileTail {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let path = path.into();
        exec.spawn(async move {
            let mut pos: u64 = 0;
            let mut carry: Vec<u8> = Vec::new();
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = poll_file(&path, &mut pos, &mut carry, &target).await {
                            tracing::warn!(path = %path.display(), error = %err, "file tail read failed");
                        }
                    }
                }
            }
        });
        FileTail { cancel }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for FileTail {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// One poll: read everything past `pos`, emit the complete lines, keep
/// the trailing partial line in `carry` for the next round. A file that
/// shrank was truncated or rotated; the tail starts over from the top.
async fn poll_file(
    path: &PathBuf,
    pos: &mut u64,
    carry: &mut Vec<u8>,
    target: &Stream,
) -> std::io::Result<()> {
    let len = tokio::fs::metadata(path).await?.len();
    if len < *pos {
        *pos = 0;
        carry.clear();
    }
    if len == *pos {
        return Ok(());
    }

    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(*pos)).await?;
    let mut buf = vec![0u8; (len - *pos) as usize];
    file.read_exact(&mut buf).await?;
    *pos = len;

    carry.extend_from_slice(&buf);
    while let Some(newline) = carry.iter().position(|byte| *byte == b'\n') {
        let raw: Vec<u8> = carry.drain(..=newline).collect();
        let line = String::from_utf8_lossy(&raw[..newline])
            .trim_end_matches('\r')
            .to_string();
        if let Err(err) = target.emit(Value::String(line)) {
            tracing::error!(path = %path.display(), error = %err, "tailed line rejected by stream");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use std::time::Instant;

    #[test]
    fn tail_emits_existing_lines_then_appended_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        std::fs::write(&path, "alpha\nbeta\n").unwrap();

        let exec = ExecLoop::background().unwrap();
        let target = Stream::new();
        let seen = target.to_list();
        let tail = FileTail::start(&exec, &path, Duration::from_millis(20), target);

        let deadline = Instant::now() + Duration::from_secs(3);
        while seen.len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(seen.snapshot(), vec![json!("alpha"), json!("beta")]);

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "gamma").unwrap();
        file.flush().unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while seen.len() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(
            seen.snapshot(),
            vec![json!("alpha"), json!("beta"), json!("gamma")]
        );
        tail.stop();
    }

    #[test]
    fn partial_lines_wait_for_their_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        std::fs::write(&path, "complete\nhalf").unwrap();

        let exec = ExecLoop::background().unwrap();
        let target = Stream::new();
        let seen = target.to_list();
        let _tail = FileTail::start(&exec, &path, Duration::from_millis(20), target);

        let deadline = Instant::now() + Duration::from_secs(3);
        while seen.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        // The unterminated tail stays buffered.
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(seen.snapshot(), vec![json!("complete")]);

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, " now whole").unwrap();
        file.flush().unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while seen.len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(
            seen.snapshot(),
            vec![json!("complete"), json!("half now whole")]
        );
    }

    #[test]
    fn stopped_tail_ignores_later_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        std::fs::write(&path, "one\n").unwrap();

        let exec = ExecLoop::background().unwrap();
        let target = Stream::new();
        let seen = target.to_list();
        let tail = FileTail::start(&exec, &path, Duration::from_millis(20), target);

        let deadline = Instant::now() + Duration::from_secs(3);
        while seen.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        tail.stop();
        std::thread::sleep(Duration::from_millis(60));

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "two").unwrap();
        file.flush().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(seen.snapshot(), vec![json!("one")]);
    }
}
