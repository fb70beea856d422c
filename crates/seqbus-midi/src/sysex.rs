//! Chunked SysEx transmission.
//!
//! Slow hardware drops long SysEx bursts, so payloads at or above the chunk
//! size go out in pieces with a pause and a flush after each one. This
//! sleeps; never call it from a path that also emits clock ticks.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::Duration;

pub const SYSEX_CHUNK_SIZE: usize = 256;
pub const SYSEX_CHUNK_PAUSE: Duration = Duration::from_millis(80);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysexPacing {
    pub chunk_size: usize,
    pub pause: Duration,
}

impl Default for SysexPacing {
    fn default() -> Self {
        Self {
            chunk_size: SYSEX_CHUNK_SIZE,
            pause: SYSEX_CHUNK_PAUSE,
        }
    }
}

impl SysexPacing {
    pub fn new(chunk_size: usize, pause: Duration) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            pause,
        }
    }

    /// No pause between chunks.
    pub fn unpaced(chunk_size: usize) -> Self {
        Self::new(chunk_size, Duration::ZERO)
    }

    /// Number of native send calls for a payload of `len` bytes.
    pub fn call_count(&self, len: usize) -> usize {
        if len == 0 {
            0
        } else {
            len.div_ceil(self.chunk_size.max(1))
        }
    }

    pub fn chunks<'a>(&self, payload: &'a [u8]) -> std::slice::Chunks<'a, u8> {
        payload.chunks(self.chunk_size.max(1))
    }
}

/// Outcome of one chunked transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SysexReport {
    pub calls: usize,
    pub failed: usize,
}

impl SysexReport {
    pub fn is_ok(&self) -> bool {
        self.failed == 0
    }
}

/// Sends `payload` through `send`, one call per chunk.
///
/// Below the chunk size the payload goes out in a single call followed by a
/// flush. Otherwise every successful chunk is followed by the pacing pause
/// and a flush. A failed chunk is logged and the remaining chunks are still
/// attempted; there is no cancellation.
pub fn send_chunked<E, S, F>(
    payload: &[u8],
    pacing: SysexPacing,
    mut send: S,
    mut flush: F,
) -> SysexReport
where
    E: Display,
    S: FnMut(&[u8]) -> Result<(), E>,
    F: FnMut(),
{
    let mut report = SysexReport::default();
    if payload.is_empty() {
        return report;
    }

    if payload.len() < pacing.chunk_size {
        report.calls = 1;
        match send(payload) {
            Ok(()) => flush(),
            Err(e) => {
                report.failed = 1;
                tracing::warn!("Sending complete SysEx failed: {}", e);
            }
        }
        return report;
    }

    for (index, chunk) in pacing.chunks(payload).enumerate() {
        report.calls += 1;
        match send(chunk) {
            Ok(()) => {
                if !pacing.pause.is_zero() {
                    std::thread::sleep(pacing.pause);
                }
                flush();
            }
            Err(e) => {
                report.failed += 1;
                tracing::warn!(
                    "Sending SysEx chunk {} ({} bytes) failed: {}",
                    index,
                    chunk.len(),
                    e
                );
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 0x7F) as u8).collect()
    }

    #[test]
    fn test_small_payload_single_call() {
        let data = payload(100);
        let mut sent = Vec::new();
        let mut flushes = 0;
        let report = send_chunked(
            &data,
            SysexPacing::unpaced(256),
            |chunk| {
                sent.push(chunk.to_vec());
                Ok::<(), String>(())
            },
            || flushes += 1,
        );
        assert_eq!(report, SysexReport { calls: 1, failed: 0 });
        assert_eq!(sent, vec![data]);
        assert_eq!(flushes, 1);
    }

    #[test]
    fn test_600_bytes_three_chunks() {
        let data = payload(600);
        let mut sizes = Vec::new();
        let mut joined = Vec::new();
        let report = send_chunked(
            &data,
            SysexPacing::unpaced(256),
            |chunk| {
                sizes.push(chunk.len());
                joined.extend_from_slice(chunk);
                Ok::<(), String>(())
            },
            || {},
        );
        assert_eq!(report.calls, 3);
        assert_eq!(sizes, vec![256, 256, 88]);
        assert_eq!(joined, data);
    }

    #[test]
    fn test_chunk_count_law() {
        for (len, size) in [(1usize, 256usize), (256, 256), (257, 256), (1000, 7), (512, 128)] {
            let data = payload(len);
            let pacing = SysexPacing::unpaced(size);
            let mut joined = Vec::new();
            let report = send_chunked(
                &data,
                pacing,
                |chunk| {
                    assert!(chunk.len() <= size);
                    joined.extend_from_slice(chunk);
                    Ok::<(), String>(())
                },
                || {},
            );
            assert_eq!(report.calls, pacing.call_count(len));
            assert_eq!(joined, data);
        }
    }

    #[test]
    fn test_failed_chunk_does_not_abort() {
        let data = payload(600);
        let mut attempt = 0;
        let mut flushes = 0;
        let report = send_chunked(
            &data,
            SysexPacing::unpaced(256),
            |_| {
                attempt += 1;
                if attempt == 2 {
                    Err("device busy")
                } else {
                    Ok(())
                }
            },
            || flushes += 1,
        );
        assert_eq!(report, SysexReport { calls: 3, failed: 1 });
        assert!(!report.is_ok());
        assert_eq!(flushes, 2);
    }

    #[test]
    fn test_pause_applied_between_chunks() {
        let data = payload(20);
        let pacing = SysexPacing::new(10, Duration::from_millis(5));
        let started = std::time::Instant::now();
        let report = send_chunked(&data, pacing, |_| Ok::<(), String>(()), || {});
        assert_eq!(report.calls, 2);
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_empty_payload() {
        let report = send_chunked(&[], SysexPacing::default(), |_| Ok::<(), String>(()), || {});
        assert_eq!(report.calls, 0);
        assert_eq!(SysexPacing::default().call_count(0), 0);
    }
}
