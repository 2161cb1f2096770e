//! Persistent, resumable updates of the device's app set.

pub mod runner;
pub mod store;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use composeapp_oci::Digest;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blob::BlobInfo;

pub use runner::{Env, InitOptions, Runner};
pub use store::UpdateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Created,
    Initializing,
    Initialized,
    Fetching,
    Fetched,
    Installing,
    Installed,
    Starting,
    Started,
    Completing,
    Completed,
    Cancelling,
    Canceled,
    Failed,
}

impl State {
    pub const ALL: [State; 14] = [
        State::Created,
        State::Initializing,
        State::Initialized,
        State::Fetching,
        State::Fetched,
        State::Installing,
        State::Installed,
        State::Starting,
        State::Started,
        State::Completing,
        State::Completed,
        State::Cancelling,
        State::Canceled,
        State::Failed,
    ];

    /// States of an update still in progress. At most one record is in one
    /// of them.
    pub const IN_PROGRESS: [State; 10] = [
        State::Created,
        State::Initializing,
        State::Initialized,
        State::Fetching,
        State::Fetched,
        State::Installing,
        State::Installed,
        State::Starting,
        State::Completing,
        State::Cancelling,
    ];

    pub fn is_terminal(self) -> bool {
        !Self::IN_PROGRESS.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Created => "created",
            State::Initializing => "initializing",
            State::Initialized => "initialized",
            State::Fetching => "fetching",
            State::Fetched => "fetched",
            State::Installing => "installing",
            State::Installed => "installed",
            State::Starting => "starting",
            State::Started => "started",
            State::Completing => "completing",
            State::Completed => "completed",
            State::Cancelling => "cancelling",
            State::Canceled => "canceled",
            State::Failed => "failed",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Init,
    Fetch,
    Install,
    Start,
    Cancel,
    Complete,
}

impl Op {
    pub const ALL: [Op; 6] = [Op::Init, Op::Fetch, Op::Install, Op::Start, Op::Cancel, Op::Complete];
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Op::Init => "init",
            Op::Fetch => "fetch",
            Op::Install => "install",
            Op::Start => "start",
            Op::Cancel => "cancel",
            Op::Complete => "complete",
        };
        f.write_str(s)
    }
}

struct Transition {
    op: Op,
    from: &'static [State],
    running: State,
    done: State,
}

const TRANSITIONS: [Transition; 6] = [
    Transition {
        op: Op::Init,
        from: &[
            State::Created,
            State::Initializing,
            State::Initialized,
            State::Fetching,
            State::Fetched,
        ],
        running: State::Initializing,
        done: State::Initialized,
    },
    Transition {
        op: Op::Fetch,
        from: &[State::Initialized, State::Fetching],
        running: State::Fetching,
        done: State::Fetched,
    },
    Transition {
        op: Op::Install,
        from: &[State::Fetched, State::Installing, State::Installed],
        running: State::Installing,
        done: State::Installed,
    },
    Transition {
        op: Op::Start,
        from: &[State::Installed, State::Starting],
        running: State::Starting,
        done: State::Started,
    },
    Transition {
        op: Op::Cancel,
        from: &[
            State::Created,
            State::Initializing,
            State::Initialized,
            State::Fetching,
            State::Fetched,
            State::Installing,
            State::Installed,
        ],
        running: State::Cancelling,
        done: State::Canceled,
    },
    Transition {
        op: Op::Complete,
        from: &[State::Started, State::Completing],
        running: State::Completing,
        done: State::Completed,
    },
];

/// `(state while running, state on success)` of `op` from `from`, or
/// `None` when `op` is not allowed there.
pub fn transition(op: Op, from: State) -> Option<(State, State)> {
    TRANSITIONS
        .iter()
        .find(|t| t.op == op)
        .filter(|t| t.from.contains(&from))
        .map(|t| (t.running, t.done))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub id: Uuid,
    pub client_ref: String,
    pub state: State,
    /// Progress of the current phase, 0 to 100.
    pub progress: u8,
    pub creation_time: SystemTime,
    pub update_time: SystemTime,
    pub uris: Vec<String>,
    /// Blobs Init found missing or invalid.
    #[serde(default)]
    pub blobs: BTreeMap<Digest, BlobInfo>,
    #[serde(default)]
    pub total_blobs_bytes: u64,
    /// Image tags Install loaded; Cancel removes them.
    #[serde(default)]
    pub loaded_images: BTreeSet<String>,
    #[serde(default)]
    pub fetched_bytes: u64,
    #[serde(default)]
    pub fetched_blobs: usize,
}

impl Update {
    pub fn new(client_ref: impl Into<String>, uris: Vec<String>) -> Self {
        let now = SystemTime::now();
        Self {
            id: Uuid::now_v7(),
            client_ref: client_ref.into(),
            state: State::Created,
            progress: 0,
            creation_time: now,
            update_time: now,
            uris,
            blobs: BTreeMap::new(),
            total_blobs_bytes: 0,
            loaded_images: BTreeSet::new(),
            fetched_bytes: 0,
            fetched_blobs: 0,
        }
    }

    /// Store key: zero-padded creation nanoseconds, then the id, so keys
    /// sort by creation.
    pub fn key(&self) -> String {
        let nanos = self
            .creation_time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        format!("{:020}:{}", nanos, self.id)
    }

    /// Bytes the missing blobs need in the store and once extracted.
    pub fn required_bytes(&self) -> u64 {
        self.blobs
            .values()
            .map(|b| b.store_size.saturating_add(b.runtime_size))
            .sum()
    }

    fn touch(&mut self) {
        self.update_time = SystemTime::now();
    }
}
