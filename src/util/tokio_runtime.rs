use crate::Result;
use std::{
    future::Future,
    sync::{Arc, Mutex},
};
use tokio::{
    self,
    runtime::{Builder, Handle, Runtime},
    task::JoinHandle,
};

/// Where a client spawns its connection task.
#[derive(Clone, Debug)]
pub enum TokioRuntime {
    /// The runtime of the caller of `Client::connect`.
    Default,
    /// An explicit runtime handle.
    Handle(Handle),
    /// A runtime shared between clients, started by the first lease and
    /// shut down when the last lease is dropped.
    Shared(SharedRuntime),
}

impl TokioRuntime {
    /// Take a lease on this runtime. The lease must be held as long as
    /// tasks spawned through it run.
    pub fn acquire(&self) -> Result<RuntimeLease> {
        match self {
            TokioRuntime::Default => Ok(RuntimeLease {
                handle: Handle::try_current().map_err(|e| crate::Error::from_std_err(e))?,
                shared: None,
            }),
            TokioRuntime::Handle(h) => Ok(RuntimeLease {
                handle: h.clone(),
                shared: None,
            }),
            TokioRuntime::Shared(s) => s.acquire(),
        }
    }
}

impl Default for TokioRuntime {
    fn default() -> TokioRuntime {
        TokioRuntime::Default
    }
}

/// A lazily started multi-threaded runtime, counted by outstanding leases.
#[derive(Clone, Debug)]
pub struct SharedRuntime {
    inner: Arc<Mutex<SharedInner>>,
}

#[derive(Debug)]
struct SharedInner {
    worker_threads: usize,
    runtime: Option<Runtime>,
    leases: usize,
}

impl SharedRuntime {
    /// A shared runtime that will run `worker_threads` threads while leased.
    pub fn new(worker_threads: usize) -> SharedRuntime {
        SharedRuntime {
            inner: Arc::new(Mutex::new(SharedInner {
                worker_threads: worker_threads.max(1),
                runtime: None,
                leases: 0,
            })),
        }
    }

    /// Number of leases currently held.
    pub fn leases(&self) -> usize {
        self.inner.lock().map(|i| i.leases).unwrap_or(0)
    }

    /// Returns true while the runtime is started.
    pub fn is_running(&self) -> bool {
        self.inner.lock().map(|i| i.runtime.is_some()).unwrap_or(false)
    }

    fn acquire(&self) -> Result<RuntimeLease> {
        let mut inner = self.inner.lock()
            .map_err(|_| crate::Error::from("Shared runtime lock poisoned"))?;
        if inner.runtime.is_none() {
            let rt = Builder::new_multi_thread()
                .worker_threads(inner.worker_threads)
                .thread_name("mqtt-delivery")
                .enable_all()
                .build()?;
            inner.runtime = Some(rt);
        }
        inner.leases += 1;
        let handle = match inner.runtime {
            Some(ref rt) => rt.handle().clone(),
            None => return Err("Shared runtime not started".into()),
        };
        Ok(RuntimeLease {
            handle,
            shared: Some(self.inner.clone()),
        })
    }
}

/// A held reference to a runtime; see [`TokioRuntime::acquire`].
#[derive(Debug)]
pub struct RuntimeLease {
    handle: Handle,
    shared: Option<Arc<Mutex<SharedInner>>>,
}

impl RuntimeLease {
    /// Spawn a future onto the leased runtime.
    pub fn spawn<F>(&self, f: F) -> JoinHandle<F::Output>
        where
            F: Future + Send + 'static,
            F::Output: Send + 'static, {
        self.handle.spawn(f)
    }
}

impl Drop for RuntimeLease {
    fn drop(&mut self) {
        let shared = match self.shared.take() {
            Some(s) => s,
            None => return,
        };
        let rt = match shared.lock() {
            Ok(mut inner) => {
                inner.leases -= 1;
                if inner.leases == 0 { inner.runtime.take() } else { None }
            }
            Err(_) => None,
        };
        if let Some(rt) = rt {
            // May be dropped from inside one of the runtime's own tasks.
            rt.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_runtime_lives_while_leased() {
        let shared = SharedRuntime::new(1);
        let rt = TokioRuntime::Shared(shared.clone());
        assert!(!shared.is_running());

        let a = rt.acquire().unwrap();
        let b = rt.acquire().unwrap();
        assert_eq!(shared.leases(), 2);
        assert!(shared.is_running());

        drop(a);
        assert_eq!(shared.leases(), 1);
        assert!(shared.is_running());

        let (tx, rx) = std::sync::mpsc::channel();
        b.spawn(async move { tx.send(42).unwrap() });
        assert_eq!(rx.recv().unwrap(), 42);

        drop(b);
        assert_eq!(shared.leases(), 0);
        assert!(!shared.is_running());

        // A new lease starts a fresh runtime.
        let c = rt.acquire().unwrap();
        assert!(shared.is_running());
        drop(c);
    }

    #[test]
    fn default_needs_a_runtime_context() {
        assert!(TokioRuntime::Default.acquire().is_err());
        let rt = tokio::runtime::Runtime::new().unwrap();
        let lease = rt.block_on(async { TokioRuntime::Default.acquire() });
        assert!(lease.is_ok());
    }
}
