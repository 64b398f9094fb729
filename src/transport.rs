//! Message passing between cooperating ranks.
//!
//! Rank 0 coordinates; every other rank is a worker. Messages are tagged
//! frames of bincode bytes. A critical error on any rank aborts the whole
//! group: blocked receives and barriers return [`TransportError::Aborted`]
//! instead of waiting forever.

use crate::error::TransportError;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{error, trace, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const ROOT: usize = 0;
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Payload kind carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    Flow = 0,
    LiquidVolume = 1,
    GasVolume = 2,
    Neighbor = 3,
    Signal = 4,
    Statistics = 5,
    Init = 6,
    Barrier = 7,
}

/// Control word sent by the coordinator at the start of every iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    Stop,
    Run,
    Nop,
    Dump,
}

#[derive(Debug)]
struct Frame {
    tag: u8,
    bytes: Vec<u8>,
}

pub trait Transport {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn send_bytes(&self, dest: usize, tag: Tag, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Blocks until the next frame from `source` arrives. The frame must carry
    /// `tag`.
    fn recv_bytes(&self, source: usize, tag: Tag) -> Result<Vec<u8>, TransportError>;

    /// Blocks until every rank of the group has reached the barrier.
    fn barrier(&self) -> Result<(), TransportError>;

    /// Aborts every rank of the group. Never fails.
    fn critical_error(&self, reason: &str);

    fn is_aborted(&self) -> bool;

    fn is_root(&self) -> bool {
        self.rank() == ROOT
    }

    fn send<T: Serialize + ?Sized>(
        &self,
        dest: usize,
        tag: Tag,
        value: &T,
    ) -> Result<(), TransportError> {
        self.send_bytes(dest, tag, bincode::serialize(value)?)
    }

    fn recv<T: DeserializeOwned>(&self, source: usize, tag: Tag) -> Result<T, TransportError> {
        let bytes = self.recv_bytes(source, tag)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Root passes `Some(value)` and sends it to every other rank; the other
    /// ranks pass `None` and receive it.
    fn broadcast<T>(&self, tag: Tag, value: Option<T>) -> Result<T, TransportError>
    where
        T: Serialize + DeserializeOwned,
    {
        if !self.is_root() {
            return self.recv(ROOT, tag);
        }
        let value = value.ok_or(TransportError::UnexpectedMessage {
            expected: "broadcast value on root",
            got: "nothing",
        })?;
        let bytes = bincode::serialize(&value)?;
        for peer in 1..self.size() {
            self.send_bytes(peer, tag, bytes.clone())?;
        }
        Ok(value)
    }

    /// Collects one value per rank on the root, in rank order. Other ranks get
    /// `None`.
    fn gather<T>(&self, tag: Tag, value: T) -> Result<Option<Vec<T>>, TransportError>
    where
        T: Serialize + DeserializeOwned,
    {
        if !self.is_root() {
            self.send(ROOT, tag, &value)?;
            return Ok(None);
        }
        let mut values = Vec::with_capacity(self.size());
        values.push(value);
        for peer in 1..self.size() {
            values.push(self.recv(peer, tag)?);
        }
        Ok(Some(values))
    }
}

/// Wires `size` in-process ranks together, each pair through its own
/// channel.
pub struct ProcessGroup {
    endpoints: Vec<ChannelTransport>,
}

impl ProcessGroup {
    pub fn new(size: usize) -> Self {
        let abort = Arc::new(AtomicBool::new(false));
        // links[src][dst]
        let links: Vec<Vec<(Sender<Frame>, Receiver<Frame>)>> =
            (0..size).map(|_| (0..size).map(|_| unbounded()).collect()).collect();

        let endpoints = (0..size)
            .map(|rank| ChannelTransport {
                rank,
                size,
                outgoing: (0..size).map(|dst| links[rank][dst].0.clone()).collect(),
                incoming: (0..size).map(|src| links[src][rank].1.clone()).collect(),
                abort: Arc::clone(&abort),
            })
            .collect();
        Self { endpoints }
    }

    pub fn size(&self) -> usize {
        self.endpoints.len()
    }

    pub fn into_endpoints(self) -> Vec<ChannelTransport> {
        self.endpoints
    }

    /// Runs `rank_main` on one thread per rank and waits for all of them.
    ///
    /// A rank that returns an error aborts the group. The first error that is
    /// not a mere echo of the abort is returned.
    pub fn run<R, F>(self, rank_main: F) -> anyhow::Result<Vec<R>>
    where
        R: Send,
        F: Fn(&ChannelTransport) -> anyhow::Result<R> + Sync,
    {
        let rank_main = &rank_main;
        let outcomes: Vec<anyhow::Result<R>> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .endpoints
                .iter()
                .map(|endpoint| {
                    scope.spawn(move || {
                        let _guard = AbortOnPanic(endpoint);
                        let outcome = rank_main(endpoint);
                        if let Err(e) = &outcome {
                            endpoint.critical_error(&format!("{:#}", e));
                        }
                        outcome
                    })
                })
                .collect();
            handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| {
                    handle.join().unwrap_or_else(|_| Err(anyhow::anyhow!("rank {} panicked", rank)))
                })
                .collect()
        });

        let mut results = Vec::with_capacity(outcomes.len());
        let mut echoes = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(value) => results.push(value),
                Err(e) if is_abort_echo(&e) => echoes.push(e),
                Err(e) => return Err(e),
            }
        }
        if let Some(e) = echoes.into_iter().next() {
            return Err(e);
        }
        Ok(results)
    }
}

/// Aborts the group when a rank thread unwinds, so peers blocked on it return.
struct AbortOnPanic<'a>(&'a ChannelTransport);

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.critical_error("rank panicked");
        }
    }
}

fn is_abort_echo(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<TransportError>(), Some(TransportError::Aborted))
}

/// One rank's end of a [`ProcessGroup`].
pub struct ChannelTransport {
    rank: usize,
    size: usize,
    outgoing: Vec<Sender<Frame>>,
    incoming: Vec<Receiver<Frame>>,
    abort: Arc<AtomicBool>,
}

impl ChannelTransport {
    fn check_peer(&self, peer: usize) -> Result<(), TransportError> {
        if peer >= self.size {
            return Err(TransportError::InvalidRank { rank: peer, size: self.size });
        }
        Ok(())
    }
}

impl Transport for ChannelTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send_bytes(&self, dest: usize, tag: Tag, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.check_peer(dest)?;
        if self.is_aborted() {
            return Err(TransportError::Aborted);
        }
        trace!("rank {} -> {}: {:?} ({} bytes)", self.rank, dest, tag, bytes.len());
        self.outgoing[dest]
            .send(Frame { tag: tag as u8, bytes })
            .map_err(|_| TransportError::Disconnected { peer: dest })
    }

    fn recv_bytes(&self, source: usize, tag: Tag) -> Result<Vec<u8>, TransportError> {
        self.check_peer(source)?;
        loop {
            if self.is_aborted() {
                return Err(TransportError::Aborted);
            }
            match self.incoming[source].recv_timeout(POLL_INTERVAL) {
                Ok(frame) if frame.tag == tag as u8 => {
                    let len = frame.bytes.len();
                    trace!("rank {} <- {}: {:?} ({} bytes)", self.rank, source, tag, len);
                    return Ok(frame.bytes);
                }
                Ok(frame) => {
                    return Err(TransportError::UnexpectedTag {
                        peer: source,
                        expected: tag,
                        got: frame.tag,
                    });
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(TransportError::Disconnected { peer: source });
                }
            }
        }
    }

    fn barrier(&self) -> Result<(), TransportError> {
        if self.is_root() {
            for peer in 1..self.size {
                self.recv_bytes(peer, Tag::Barrier)?;
            }
            for peer in 1..self.size {
                self.send_bytes(peer, Tag::Barrier, Vec::new())?;
            }
        } else {
            self.send_bytes(ROOT, Tag::Barrier, Vec::new())?;
            self.recv_bytes(ROOT, Tag::Barrier)?;
        }
        Ok(())
    }

    fn critical_error(&self, reason: &str) {
        if !self.abort.swap(true, Ordering::SeqCst) {
            error!("rank {}: critical error, aborting process group: {}", self.rank, reason);
        } else {
            warn!("rank {}: {} (group already aborted)", self.rank, reason);
        }
    }

    fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}
