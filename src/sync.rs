// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Mutex and Condvar wrappers that panic instead of returning a poison error.
//!
//! A panic while a lock is held takes the whole process down, so no thread
//! ever observes a poisoned lock in practice. Wrapping the std types keeps
//! `unwrap()` calls on lock results out of the rest of the crate.

use std::fmt;
use std::fmt::Debug;
use std::sync::Condvar as StdCondvar;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::WaitTimeoutResult;
use std::time::Duration;

static MUTEX_POISONED: &str = "mutex is poisoned";
static CONDVAR_POISONED: &str = "condvar is poisoned";

/// A mutual exclusion primitive mirroring `std::sync::Mutex`, minus poisoning.
#[derive(Default)]
pub struct Mutex<T: ?Sized> {
    std: StdMutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Mutex<T> {
        Mutex {
            std: StdMutex::new(value),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<T> {
        self.std.lock().expect(MUTEX_POISONED)
    }
}

impl<T: ?Sized + Debug> Debug for Mutex<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&self.std, formatter)
    }
}

/// A condition variable mirroring `std::sync::Condvar`, minus poisoning.
#[derive(Default)]
pub struct Condvar {
    std: StdCondvar,
}

impl Condvar {
    pub const fn new() -> Condvar {
        Condvar {
            std: StdCondvar::new(),
        }
    }

    /// Waits until notified or `dur` elapses, as long as `condition` is true.
    pub fn wait_timeout_while<'a, T, F>(
        &self,
        guard: MutexGuard<'a, T>,
        dur: Duration,
        condition: F,
    ) -> (MutexGuard<'a, T>, WaitTimeoutResult)
    where
        F: FnMut(&mut T) -> bool,
    {
        self.std
            .wait_timeout_while(guard, dur, condition)
            .expect(CONDVAR_POISONED)
    }

    pub fn notify_all(&self) {
        self.std.notify_all();
    }
}

impl Debug for Condvar {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&self.std, formatter)
    }
}
