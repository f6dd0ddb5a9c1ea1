//! Shared reactors keyed by TLS configuration
//!
//! Façade objects that do not bring their own reactor share one per key.
//! The registry is constructed explicitly and owns its reactors: they are
//! started on first lookup and stopped, newest first, by
//! [`ReactorRegistry::shutdown`] or when the registry is dropped.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::options::ReactorOptions;
use crate::reactor::Reactor;
use crate::transport::Transport;

#[derive(Default)]
pub struct ReactorRegistry {
    reactors: Mutex<Vec<(String, Arc<Reactor>)>>,
}

impl ReactorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the reactor registered under `options.registry_key()`,
    /// starting one with `factory` if there is none yet.
    ///
    /// The lock is held only for the lookup and the start itself.
    pub fn get_or_start<F>(&self, options: ReactorOptions, factory: F) -> Arc<Reactor>
    where
        F: FnOnce(&ReactorOptions) -> Result<Box<dyn Transport>>,
    {
        let key = options.registry_key();
        let mut reactors = self.reactors.lock();
        if let Some((_, reactor)) = reactors.iter().find(|(k, _)| *k == key) {
            return Arc::clone(reactor);
        }

        debug!(key = %key, "starting shared reactor");
        let reactor = Arc::new(Reactor::start(options, factory));
        reactors.push((key, Arc::clone(&reactor)));
        reactor
    }

    /// Look up a reactor without starting one.
    pub fn get(&self, key: &str) -> Option<Arc<Reactor>> {
        self.reactors
            .lock()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, reactor)| Arc::clone(reactor))
    }

    pub fn len(&self) -> usize {
        self.reactors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reactors.lock().is_empty()
    }

    /// Stop every reactor, most recently started first.
    ///
    /// Handles still held elsewhere stay valid but refuse new submissions.
    pub fn shutdown(&self) {
        let reactors = std::mem::take(&mut *self.reactors.lock());
        for (key, reactor) in reactors.into_iter().rev() {
            debug!(key = %key, "stopping shared reactor");
            reactor.stop();
        }
    }
}

impl fmt::Debug for ReactorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self.reactors.lock().iter().map(|(k, _)| k.clone()).collect();
        f.debug_struct("ReactorRegistry").field("keys", &keys).finish()
    }
}

impl Drop for ReactorRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SluiceError;
    use crate::transport::scripted::ScriptedTransport;

    fn scripted(_: &ReactorOptions) -> Result<Box<dyn Transport>> {
        let (engine, _handle) = ScriptedTransport::new();
        Ok(Box::new(engine))
    }

    fn small() -> ReactorOptions {
        ReactorOptions::new().with_pool_capacity(4).with_queue_capacity(4)
    }

    #[test]
    fn test_same_key_shares_reactor() {
        let registry = ReactorRegistry::new();
        let a = registry.get_or_start(small(), scripted);
        let b = registry.get_or_start(small(), scripted);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);

        let c = registry.get_or_start(small().with_ca_file("/tmp/ca.pem"), scripted);
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
        assert!(registry.get("/tmp/ca.pem").is_some());
        assert!(registry.get("/nowhere").is_none());
    }

    #[test]
    fn test_shutdown_stops_all() {
        let registry = ReactorRegistry::new();
        let a = registry.get_or_start(small(), scripted);
        let b = registry.get_or_start(small().with_ca_file("x"), scripted);
        assert!(a.is_running() && b.is_running());

        registry.shutdown();
        assert!(registry.is_empty());
        assert!(!a.is_running());
        assert!(!b.is_running());
    }

    #[test]
    fn test_failed_engine_is_registered_disabled() {
        let registry = ReactorRegistry::new();
        let reactor = registry.get_or_start(small(), |_| {
            Err(SluiceError::EngineUnavailable("no context".into()))
        });
        assert!(!reactor.is_enabled());
        assert_eq!(registry.len(), 1);
    }
}
