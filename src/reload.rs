//! Hot-swappable values rebuilt from disk
//!
//! A [`Reloader`] owns the current value of some credential-backed resource
//! (a server certificate, a token authenticator) together with the function
//! that builds it. Reloading runs the constructor outside the lock and only
//! replaces the value on success, so an unreadable file never blanks out a
//! working credential.

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{error, info};

/// Thread-safe slot holding the current value
#[derive(Debug)]
pub struct HotSwap<V> {
    slot: RwLock<V>,
}

impl<V: Clone> HotSwap<V> {
    pub fn new(value: V) -> Self {
        Self {
            slot: RwLock::new(value),
        }
    }

    pub fn get(&self) -> V {
        self.slot.read().clone()
    }

    pub fn set(&self, value: V) {
        *self.slot.write() = value;
    }

    /// Install `value` and hand back the one it replaced, under one write lock.
    fn swap(&self, value: V) -> V {
        std::mem::replace(&mut *self.slot.write(), value)
    }
}

pub type Constructor<V> = Box<dyn Fn() -> anyhow::Result<V> + Send + Sync>;

/// A [`HotSwap`] paired with the constructor that produces its values
pub struct Reloader<V> {
    name: String,
    holder: HotSwap<V>,
    constructor: Constructor<V>,
}

impl<V: Clone> Reloader<V> {
    /// Build the initial value. Fails if the constructor fails.
    pub fn new<F>(name: impl Into<String>, constructor: F) -> anyhow::Result<Self>
    where
        F: Fn() -> anyhow::Result<V> + Send + Sync + 'static,
    {
        let name = name.into();
        let initial = constructor()?;
        info!(reloader = %name, "Loaded initial value");

        Ok(Self {
            name,
            holder: HotSwap::new(initial),
            constructor: Box::new(constructor),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self) -> V {
        self.holder.get()
    }

    /// Rebuild the value. On failure the previous value stays in place.
    pub fn reload(&self) {
        if let Some(value) = self.construct() {
            self.holder.set(value);
            info!(reloader = %self.name, "Reloaded");
        }
    }

    fn construct(&self) -> Option<V> {
        match (self.constructor)() {
            Ok(value) => Some(value),
            Err(e) => {
                error!(
                    reloader = %self.name,
                    error = %e,
                    "Reload failed, keeping previous value"
                );
                None
            }
        }
    }
}

/// A value that owns background work and has to be told to stop
pub trait Cancelable {
    fn cancel(&self);
}

impl<T: Cancelable + ?Sized> Cancelable for Arc<T> {
    fn cancel(&self) {
        (**self).cancel()
    }
}

/// A [`Reloader`] whose superseded values are canceled.
///
/// The new value is visible to [`CancelableReloader::get`] before `cancel`
/// runs on the old one, and each superseded value is canceled exactly once.
pub struct CancelableReloader<V> {
    inner: Reloader<V>,
}

impl<V: Clone + Cancelable> CancelableReloader<V> {
    pub fn new<F>(name: impl Into<String>, constructor: F) -> anyhow::Result<Self>
    where
        F: Fn() -> anyhow::Result<V> + Send + Sync + 'static,
    {
        Ok(Self {
            inner: Reloader::new(name, constructor)?,
        })
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn get(&self) -> V {
        self.inner.get()
    }

    pub fn reload(&self) {
        if let Some(value) = self.inner.construct() {
            let old = self.inner.holder.swap(value);
            old.cancel();
            info!(reloader = %self.inner.name, "Reloaded, previous value canceled");
        }
    }
}
