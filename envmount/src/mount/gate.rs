//! Single-flight gate for image mounts.
//!
//! At most one mount sequence runs per backing URL. Callers arriving while
//! a sequence is in flight await its outcome instead of starting their
//! own. The gate is released only after the whole sequence (mount plus
//! tree materialization) completes.
//!
//! ```text
//!   caller A ──ensure_mounted(url)──▶ [vacant]   → InFlight(shared rx) → run do_mount
//!   caller B ──ensure_mounted(url)──▶ [InFlight] → await shared rx     → Joined
//!   A done: Ok  → Mounted             (later callers: AlreadyMounted)
//!           Err → entry removed       (url can be mounted again)
//!   A dropped   → entry removed, waiters see Abandoned
//! ```

use std::fmt::Display;
use std::future::Future;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{FutureExt, Shared};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Errors reported by the gate to callers that did not run the sequence.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MountError {
    /// The mount sequence failed.
    #[error("mounting {url} failed: {reason}")]
    Failed { url: String, reason: String },

    /// A concurrent caller's mount sequence, which this caller joined, failed.
    #[error("mounting {url} failed in a concurrent attempt: {reason}")]
    PeerFailed { url: String, reason: String },

    /// The caller running the sequence was dropped before finishing.
    #[error("mount of {url} was abandoned")]
    Abandoned { url: String },
}

/// How [`MountGate::ensure_mounted`] was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStatus {
    /// This caller ran the mount sequence.
    Mounted,
    /// This caller awaited a concurrent caller's successful sequence.
    Joined,
    /// The URL was already mounted.
    AlreadyMounted,
}

type Outcome = Result<(), String>;

enum GateState {
    InFlight(Shared<oneshot::Receiver<Outcome>>),
    Mounted,
}

enum Role {
    Leader(oneshot::Sender<Outcome>),
    Follower(Shared<oneshot::Receiver<Outcome>>),
    Done,
}

/// Registry of mounted and in-flight URLs.
///
/// One gate is shared by every installer in the process.
#[derive(Default)]
pub struct MountGate {
    entries: DashMap<String, GateState>,
}

/// Releases an in-flight entry if the leader is dropped mid-sequence.
struct AbandonGuard<'a> {
    gate: &'a MountGate,
    url: &'a str,
    armed: bool,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(url = %self.url, "mount abandoned before completion");
            self.gate
                .entries
                .remove_if(self.url, |_, state| matches!(state, GateState::InFlight(_)));
        }
    }
}

impl MountGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `url` has been mounted successfully.
    pub fn is_mounted(&self, url: &str) -> bool {
        matches!(
            self.entries.get(url).as_deref(),
            Some(GateState::Mounted)
        )
    }

    /// Whether a mount sequence for `url` is running.
    pub fn is_in_flight(&self, url: &str) -> bool {
        matches!(
            self.entries.get(url).as_deref(),
            Some(GateState::InFlight(_))
        )
    }

    /// Run `do_mount` for `url` unless it is mounted or being mounted.
    ///
    /// The caller that runs the sequence gets its own error back;
    /// callers that joined get [`MountError::PeerFailed`] or
    /// [`MountError::Abandoned`] converted into `E`.
    pub async fn ensure_mounted<F, Fut, E>(&self, url: &str, do_mount: F) -> Result<MountStatus, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: From<MountError> + Display,
    {
        // The map guard must not live across an await.
        let role = match self.entries.entry(url.to_string()) {
            Entry::Occupied(entry) => match entry.get() {
                GateState::Mounted => Role::Done,
                GateState::InFlight(outcome) => Role::Follower(outcome.clone()),
            },
            Entry::Vacant(entry) => {
                let (tx, rx) = oneshot::channel();
                entry.insert(GateState::InFlight(rx.shared()));
                Role::Leader(tx)
            }
        };

        let tx = match role {
            Role::Done => return Ok(MountStatus::AlreadyMounted),
            Role::Follower(outcome) => {
                debug!(url = %url, "joining in-flight mount");
                return match outcome.await {
                    Ok(Ok(())) => Ok(MountStatus::Joined),
                    Ok(Err(reason)) => Err(MountError::PeerFailed {
                        url: url.to_string(),
                        reason,
                    }
                    .into()),
                    Err(_) => Err(MountError::Abandoned {
                        url: url.to_string(),
                    }
                    .into()),
                };
            }
            Role::Leader(tx) => tx,
        };

        let mut guard = AbandonGuard {
            gate: self,
            url,
            armed: true,
        };
        let result = do_mount().await;
        guard.armed = false;

        match result {
            Ok(()) => {
                self.entries.insert(url.to_string(), GateState::Mounted);
                let _ = tx.send(Ok(()));
                debug!(url = %url, "mount complete");
                Ok(MountStatus::Mounted)
            }
            Err(e) => {
                self.entries.remove(url);
                let _ = tx.send(Err(e.to_string()));
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for MountGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountGate")
            .field("entries", &self.entries.len())
            .finish()
    }
}
