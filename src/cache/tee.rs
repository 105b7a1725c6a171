//! Fan-out of an upstream body to the client and a cache file.
//!
//! Every chunk goes to the client first and to the cache file second.  The
//! cache file is a temp file next to its final path and is renamed into place
//! only after the whole body went through, so readers never observe a
//! truncated entry.
//!
//! The one exception is the chunk that completes an advertised
//! `Content-Length`: it is written and committed before the client gets it,
//! so a client holding the full body can rely on the entry being in place.
//! Bodies of unknown length end for the client when the channel closes,
//! which also happens after the commit.

use std::fmt::Display;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{CacheError, KeyGuard, TEMP_SUFFIX};

/// Chunks buffered between the upstream reader and the client body.
const CHANNEL_CAPACITY: usize = 32;

// ---------------------------------------------------------------------------
// Cache sink
// ---------------------------------------------------------------------------

/// An uncommitted cache entry: a temp file plus the lock on its key.
///
/// Dropping the sink without [`commit`](Self::commit) removes the temp file
/// and releases the key.
#[derive(Debug)]
pub struct CacheSink {
    path: PathBuf,
    file: tokio::fs::File,
    temp: TempPath,
    written: u64,
    guard: KeyGuard,
}

impl CacheSink {
    /// Create a fresh temp file in the directory of `path`.
    pub fn create(path: PathBuf, guard: KeyGuard) -> Result<Self, CacheError> {
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let named = tempfile::Builder::new()
            .prefix(".")
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&dir)
            .map_err(|source| CacheError::CreateTemp { dir, source })?;
        let (file, temp) = named.into_parts();

        Ok(Self {
            path,
            file: tokio::fs::File::from_std(file),
            temp,
            written: 0,
            guard,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), CacheError> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|source| CacheError::CacheWrite {
                path: self.path.clone(),
                source,
            })?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Write the final chunk and commit.
    async fn finish(mut self, chunk: &[u8], expected_len: Option<u64>) -> Result<u64, CacheError> {
        self.write(chunk).await?;
        self.commit(expected_len).await
    }

    /// Flush the temp file and atomically rename it to the final path.
    ///
    /// When `expected_len` is known the entry is only committed if exactly
    /// that many bytes were written.
    pub async fn commit(mut self, expected_len: Option<u64>) -> Result<u64, CacheError> {
        if let Some(expected) = expected_len
            && expected != self.written
        {
            return Err(CacheError::Incomplete {
                path: self.path.clone(),
                expected,
                actual: self.written,
            });
        }

        let flushed = match self.file.flush().await {
            Ok(()) => self.file.sync_all().await,
            Err(e) => Err(e),
        };
        if let Err(source) = flushed {
            return Err(CacheError::CacheWrite {
                path: self.path.clone(),
                source,
            });
        }

        let CacheSink {
            path,
            file,
            temp,
            written,
            guard,
        } = self;
        drop(file);

        temp.persist(&path).map_err(|e| CacheError::Commit {
            path: path.clone(),
            source: e.error,
        })?;
        debug!(path = %path.display(), bytes = written, "cache entry committed");

        // Waiters must see the final file once they get the key.
        drop(guard);
        Ok(written)
    }
}

// ---------------------------------------------------------------------------
// Tee
// ---------------------------------------------------------------------------

/// How a tee ended.
#[derive(Debug)]
pub enum TeeOutcome {
    /// Client received the full body and the cache entry was committed.
    Cached { bytes: u64 },
    /// Client received the full body; nothing was cached.  `reason` is set
    /// when caching was attempted and failed.
    Uncached {
        bytes: u64,
        reason: Option<CacheError>,
    },
    /// The copy stopped early; the client saw a truncated body.
    Aborted(CacheError),
}

/// Stream `body` to the returned receiver and, if `sink` is given, into the
/// cache file as well.
///
/// The receiver feeds the client response.  The join handle resolves once the
/// body was fully copied (and committed) or the copy was abandoned.  A
/// failing cache sink is dropped while the client stream carries on; a
/// failing client or upstream aborts the whole copy.
pub fn tee_to_cache<S, E>(
    body: S,
    sink: Option<CacheSink>,
    expected_len: Option<u64>,
) -> (
    mpsc::Receiver<Result<Bytes, io::Error>>,
    JoinHandle<TeeOutcome>,
)
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(CHANNEL_CAPACITY);

    let handle = tokio::spawn(async move {
        let mut body = Box::pin(body);
        let mut sink = sink;
        let mut cache_failure = None;
        let mut bytes: u64 = 0;
        let mut committed = None;

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    let message = e.to_string();
                    let _ = tx.send(Err(io::Error::other(message.clone()))).await;
                    return TeeOutcome::Aborted(CacheError::UpstreamBody { bytes, message });
                }
            };

            let completes_body =
                expected_len.is_some_and(|len| bytes + chunk.len() as u64 >= len);
            if completes_body && let Some(active) = sink.take() {
                match active.finish(&chunk, expected_len).await {
                    Ok(written) => committed = Some(written),
                    Err(e) => {
                        warn!(error = %e, "cache commit failed, continuing without cache");
                        cache_failure = Some(e);
                    }
                }
            }

            if tx.send(Ok(chunk.clone())).await.is_err() {
                return match committed {
                    Some(bytes) => TeeOutcome::Cached { bytes },
                    None => TeeOutcome::Aborted(CacheError::ClientGone(bytes)),
                };
            }
            bytes += chunk.len() as u64;

            if let Some(active) = sink.as_mut()
                && let Err(e) = active.write(&chunk).await
            {
                warn!(error = %e, "cache write failed, continuing without cache");
                sink = None;
                cache_failure = Some(e);
            }
        }

        // Bodies without a known length are committed here, before the
        // channel closes.
        let outcome = match (committed, sink) {
            (Some(bytes), _) => TeeOutcome::Cached { bytes },
            (None, Some(sink)) => match sink.commit(expected_len).await {
                Ok(bytes) => TeeOutcome::Cached { bytes },
                Err(e) => TeeOutcome::Uncached {
                    bytes,
                    reason: Some(e),
                },
            },
            (None, None) => TeeOutcome::Uncached {
                bytes,
                reason: cache_failure,
            },
        };
        drop(tx);
        outcome
    });

    (rx, handle)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
