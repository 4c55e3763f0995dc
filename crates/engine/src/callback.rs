//! Retrying initialization callbacks
//!
//! A [`Callback`] wraps an idempotent initialization step. [`RetryingCallback`]
//! runs it until it succeeds, its cleanup gives up, or shutdown is requested;
//! shutdown blocks until an in-flight attempt and its cleanup are finished.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tsweep_core::{Error, Result};

/// An initialization step over a resource `R`
pub trait Callback<R>: Send + Sync {
    /// Run the step; returning `Ok` marks it successful
    fn init(&self, resource: &R) -> Result<()>;

    /// Undo a failed `init` before it is retried
    ///
    /// Returning an error stops retrying. The default treats every `init`
    /// failure as terminal.
    fn cleanup(&self, _resource: &R, init_error: Error) -> Result<()> {
        Err(init_error)
    }
}

/// Runs a [`Callback`] with retry and a shutdown handshake
pub struct RetryingCallback<C> {
    callback: C,
    retry_pause: Duration,
    shutdown_requested: AtomicBool,
    running: Mutex<()>,
}

impl<C> RetryingCallback<C> {
    /// Retry immediately after a failed attempt
    pub fn new(callback: C) -> Self {
        Self::with_retry_pause(callback, Duration::ZERO)
    }

    /// Wait `retry_pause` between attempts
    pub fn with_retry_pause(callback: C, retry_pause: Duration) -> Self {
        Self {
            callback,
            retry_pause,
            shutdown_requested: AtomicBool::new(false),
            running: Mutex::new(()),
        }
    }

    /// The wrapped callback
    pub fn callback(&self) -> &C {
        &self.callback
    }

    /// Request shutdown and wait for an in-flight attempt to finish
    ///
    /// No attempt starts after this returns.
    pub fn block_until_safe_to_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
        drop(self.running.lock());
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    /// Retry `init` until it succeeds
    ///
    /// Returns `Ok(true)` on success, `Ok(false)` if shutdown stopped the
    /// retries, and the cleanup's error if cleanup gave up.
    pub fn run_with_retry<R>(&self, resource: &R) -> Result<bool>
    where
        C: Callback<R>,
    {
        loop {
            {
                let _running = self.running.lock();
                if self.is_shutdown_requested() {
                    return Ok(false);
                }
                match self.callback.init(resource) {
                    Ok(()) => return Ok(true),
                    Err(e) => self.callback.cleanup(resource, e)?,
                }
            }
            if !self.retry_pause.is_zero() {
                std::thread::sleep(self.retry_pause);
            }
        }
    }

    /// Attempt `init` once, cleaning up on failure
    ///
    /// Returns `Ok(false)` if the attempt failed and cleanup succeeded, or if
    /// shutdown was already requested.
    pub fn run_once_only<R>(&self, resource: &R) -> Result<bool>
    where
        C: Callback<R>,
    {
        let _running = self.running.lock();
        if self.is_shutdown_requested() {
            return Ok(false);
        }
        match self.callback.init(resource) {
            Ok(()) => Ok(true),
            Err(e) => self.callback.cleanup(resource, e).map(|()| false),
        }
    }
}

/// Runs callbacks in order, each retried on its own until it succeeds
///
/// A later callback only starts once every earlier one has succeeded; a
/// failing callback never re-runs the ones before it.
pub struct CallChain<R> {
    callbacks: Vec<RetryingCallback<Box<dyn Callback<R>>>>,
}

impl<R> CallChain<R> {
    /// Chain `callbacks`, first to last
    pub fn new(callbacks: Vec<Box<dyn Callback<R>>>) -> Self {
        Self {
            callbacks: callbacks.into_iter().map(RetryingCallback::new).collect(),
        }
    }

    /// Stop every link and wait for in-flight attempts
    pub fn block_until_safe_to_shutdown(&self) {
        for callback in &self.callbacks {
            callback.block_until_safe_to_shutdown();
        }
    }
}

impl<R, C: Callback<R> + ?Sized> Callback<R> for Box<C> {
    fn init(&self, resource: &R) -> Result<()> {
        (**self).init(resource)
    }

    fn cleanup(&self, resource: &R, init_error: Error) -> Result<()> {
        (**self).cleanup(resource, init_error)
    }
}

impl<R, C: Callback<R> + ?Sized> Callback<R> for Arc<C> {
    fn init(&self, resource: &R) -> Result<()> {
        (**self).init(resource)
    }

    fn cleanup(&self, resource: &R, init_error: Error) -> Result<()> {
        (**self).cleanup(resource, init_error)
    }
}

impl<R> Callback<R> for CallChain<R> {
    fn init(&self, resource: &R) -> Result<()> {
        for callback in &self.callbacks {
            if !callback.run_with_retry(resource)? {
                return Err(Error::IllegalState("call chain shut down before completing".to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Fails its first `failures` attempts
    struct Flaky {
        failures: usize,
        attempts: AtomicUsize,
        cleanups: AtomicUsize,
        cleanup_gives_up: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
    }

    impl Flaky {
        fn new(name: &'static str, failures: usize, log: Arc<Mutex<Vec<&'static str>>>) -> Self {
            Self {
                failures,
                attempts: AtomicUsize::new(0),
                cleanups: AtomicUsize::new(0),
                cleanup_gives_up: false,
                log,
                name,
            }
        }
    }

    impl Callback<()> for Flaky {
        fn init(&self, _resource: &()) -> Result<()> {
            self.log.lock().push(self.name);
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(Error::UpstreamUnavailable(format!("{} attempt {}", self.name, attempt)));
            }
            Ok(())
        }

        fn cleanup(&self, _resource: &(), init_error: Error) -> Result<()> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            if self.cleanup_gives_up {
                return Err(init_error);
            }
            Ok(())
        }
    }

    struct AlwaysFails;

    impl Callback<()> for AlwaysFails {
        fn init(&self, _resource: &()) -> Result<()> {
            Err(Error::IllegalState("boom".to_string()))
        }
    }

    fn log() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn test_run_with_retry_retries_until_success() {
        let runner = RetryingCallback::new(Flaky::new("a", 3, log()));
        assert!(runner.run_with_retry(&()).unwrap());
        assert_eq!(runner.callback().attempts.load(Ordering::SeqCst), 4);
        assert_eq!(runner.callback().cleanups.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_default_cleanup_is_terminal() {
        let runner = RetryingCallback::new(AlwaysFails);
        assert!(matches!(runner.run_with_retry(&()), Err(Error::IllegalState(_))));
    }

    #[test]
    fn test_cleanup_error_stops_retrying() {
        let mut flaky = Flaky::new("a", 10, log());
        flaky.cleanup_gives_up = true;
        let runner = RetryingCallback::new(flaky);
        assert!(runner.run_with_retry(&()).is_err());
        assert_eq!(runner.callback().attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_once_only() {
        let runner = RetryingCallback::new(Flaky::new("a", 1, log()));
        assert!(!runner.run_once_only(&()).unwrap());
        assert!(runner.run_once_only(&()).unwrap());
        assert_eq!(runner.callback().cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_attempt_after_shutdown() {
        let runner = RetryingCallback::new(Flaky::new("a", 0, log()));
        runner.block_until_safe_to_shutdown();
        assert!(!runner.run_with_retry(&()).unwrap());
        assert!(!runner.run_once_only(&()).unwrap());
        assert_eq!(runner.callback().attempts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_shutdown_stops_endless_retries() {
        let runner = Arc::new(RetryingCallback::with_retry_pause(
            Flaky::new("a", usize::MAX, log()),
            Duration::from_millis(1),
        ));
        let background = {
            let runner = Arc::clone(&runner);
            std::thread::spawn(move || runner.run_with_retry(&()))
        };
        while runner.callback().attempts.load(Ordering::SeqCst) < 3 {
            std::thread::sleep(Duration::from_millis(1));
        }
        runner.block_until_safe_to_shutdown();
        assert!(!background.join().unwrap().unwrap());
    }

    #[test]
    fn test_call_chain_retries_links_independently() {
        let log = log();
        let chain = CallChain::new(vec![
            Box::new(Flaky::new("first", 1, log.clone())) as Box<dyn Callback<()>>,
            Box::new(Flaky::new("second", 2, log.clone())),
        ]);
        assert!(RetryingCallback::new(chain).run_with_retry(&()).unwrap());
        assert_eq!(*log.lock(), vec!["first", "first", "second", "second", "second"]);
    }
}
