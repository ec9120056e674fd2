// This file is part of ccdemux, a closed caption demultiplexer and extractor.
// Copyright (C) 2026 The ccdemux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Tools for propagating a graceful shutdown signal through the program.
//!
//! The core is single-threaded and never awaits, so this is a plain polled
//! flag: the demux/sample loops call [`Receiver::check`] at each loop head
//! and unwind with a `Cancelled` error when shutdown has been requested.
//! The request side is async-signal-safe (a single atomic store), so a
//! [`Handle`] may be triggered directly from a signal handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("shutdown requested")
    }
}

impl std::error::Error for ShutdownError {}

impl From<ShutdownError> for crate::Error {
    fn from(e: ShutdownError) -> Self {
        crate::Error::new(crate::ErrorKind::Cancelled).with_source(e)
    }
}

#[derive(Debug)]
struct Inner {
    requested: AtomicBool,
}

/// The sole requester of a shutdown; dropping it also requests one.
pub struct Sender(Arc<Inner>);

impl Sender {
    pub fn request(&self) {
        self.0.requested.store(true, Ordering::SeqCst);
    }

    /// Returns a handle whose `request` is async-signal-safe.
    pub fn handle(&self) -> Handle {
        Handle(self.0.clone())
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        self.request();
    }
}

/// A cloneable, signal-safe way to request shutdown without owning the [`Sender`].
#[derive(Clone)]
pub struct Handle(Arc<Inner>);

impl Handle {
    pub fn request(&self) {
        self.0.requested.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct Receiver(Arc<Inner>);

impl Receiver {
    pub fn check(&self) -> Result<(), ShutdownError> {
        if self.0.requested.load(Ordering::SeqCst) {
            Err(ShutdownError)
        } else {
            Ok(())
        }
    }

    /// A receiver that never reports shutdown, for tests and simple callers.
    pub fn detached() -> Self {
        Receiver(Arc::new(Inner {
            requested: AtomicBool::new(false),
        }))
    }
}

/// Returns a sender and receiver for graceful shutdown.
pub fn channel() -> (Sender, Receiver) {
    let inner = Arc::new(Inner {
        requested: AtomicBool::new(false),
    });
    (Sender(inner.clone()), Receiver(inner))
}

#[cfg(test)]
mod tests {
    #[test]
    fn explicit_request() {
        let (snd, rcv) = super::channel();
        rcv.check().unwrap();
        snd.request();
        rcv.check().unwrap_err();
    }

    #[test]
    fn drop_requests() {
        let (snd, rcv) = super::channel();
        drop(snd);
        rcv.check().unwrap_err();
    }

    #[test]
    fn handle_requests() {
        let (snd, rcv) = super::channel();
        let handle = snd.handle();
        handle.request();
        rcv.check().unwrap_err();
        drop(snd);
    }
}
