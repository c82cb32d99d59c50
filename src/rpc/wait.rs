//! Correlation tables for in-flight calls.
//!
//! Each direction of a session has its own table. The local-originated
//! [`WaitTable`] maps the `return_id` we allocated to the waiting caller's
//! slot; the remote-originated [`CancelTable`] maps the peer's `return_id`
//! to the cancellation token handed to the executing method, so an inbound
//! cancel can trip it.
//!
//! Ids come from a 16-bit space with wrap-around; id 0 means "no response
//! expected" and is never allocated, nor is an id still in use.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::cancel::CancelToken;
use crate::error::{RemoteException, Result, WireError};

/// What came back for a call.
#[derive(Debug)]
pub enum RpcOutcome {
    /// Encoded return value (one codec field).
    Return(Bytes),
    /// The remote method threw.
    Exception(RemoteException),
}

struct WaitInner {
    entries: HashMap<u16, oneshot::Sender<RpcOutcome>>,
    next_id: u16,
}

/// Local-originated wait table: `return_id -> caller slot`.
pub struct WaitTable {
    inner: Mutex<WaitInner>,
}

impl Default for WaitTable {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(WaitInner {
                entries: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    /// Allocate a fresh id and its outcome slot.
    ///
    /// Skips 0 and ids still in use; wraps around the u16 space.
    pub fn allocate(&self) -> Result<(u16, oneshot::Receiver<RpcOutcome>)> {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.len() >= u16::MAX as usize {
            return Err(WireError::WaitTableFull);
        }

        loop {
            inner.next_id = inner.next_id.wrapping_add(1);
            let candidate = inner.next_id;
            if candidate == 0 || inner.entries.contains_key(&candidate) {
                continue;
            }
            let (tx, rx) = oneshot::channel();
            inner.entries.insert(candidate, tx);
            return Ok((candidate, rx));
        }
    }

    /// Resolve the waiter for `id`. Unknown ids (already cancelled or
    /// timed out) are dropped silently; returns whether a waiter existed.
    pub fn complete(&self, id: u16, outcome: RpcOutcome) -> bool {
        let sender = self.inner.lock().unwrap().entries.remove(&id);
        match sender {
            Some(tx) => {
                // A racing cancel may have dropped the receiver already.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Forget `id` without resolving it (cancelled wait).
    pub fn remove(&self, id: u16) -> bool {
        self.inner.lock().unwrap().entries.remove(&id).is_some()
    }

    /// Calls currently awaiting a response.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every waiter; their receivers observe a closed channel.
    /// Called when the session goes away.
    pub fn clear(&self) {
        self.inner.lock().unwrap().entries.clear();
    }
}

/// Remote-originated table: the peer's `return_id -> method token`.
#[derive(Default)]
pub struct CancelTable {
    entries: Mutex<HashMap<u16, CancelToken>>,
}

impl CancelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track the token for an executing method.
    pub fn insert(&self, id: u16, token: CancelToken) {
        self.entries.lock().unwrap().insert(id, token);
    }

    /// Stop tracking once the method completes.
    pub fn remove(&self, id: u16) {
        self.entries.lock().unwrap().remove(&id);
    }

    /// Trip the token for `id`, if the method is still running.
    pub fn cancel(&self, id: u16) -> bool {
        match self.entries.lock().unwrap().get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
