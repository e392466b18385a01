use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::warn;

/// Thread handle joined on drop
pub struct AutoJoinHandle {
    pub(crate) join_handle: Option<JoinHandle<()>>,
}

impl AutoJoinHandle {
    pub fn spawn<F>(name: &str, f: F) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Ok(Self::from(
            thread::Builder::new().name(name.to_owned()).spawn(f)?,
        ))
    }
}

impl From<JoinHandle<()>> for AutoJoinHandle {
    fn from(value: JoinHandle<()>) -> Self {
        Self {
            join_handle: Some(value),
        }
    }
}

impl Drop for AutoJoinHandle {
    fn drop(&mut self) {
        if let Some(join_handle) = self.join_handle.take() {
            if join_handle.join().is_err() {
                warn!("Node thread panicked");
            }
        }
    }
}

/// Flags node shutdown if dropped without `done()`, i.e. on panic
pub struct PanicGuard {
    name: &'static str,
    flag: Arc<AtomicBool>,
    done: bool,
}

impl PanicGuard {
    pub fn new(name: &'static str, flag: Arc<AtomicBool>) -> Self {
        Self {
            name,
            flag,
            done: false,
        }
    }

    pub fn done(mut self) {
        self.done = true;
    }
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if !self.done {
            warn!("Task {} panic detected via PanicGuard", self.name);
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

#[test]
fn panic_guard_flags_shutdown() {
    let flag = Arc::new(AtomicBool::new(false));
    PanicGuard::new("finished", flag.clone()).done();
    assert!(!flag.load(Ordering::SeqCst));

    drop(PanicGuard::new("panicked", flag.clone()));
    assert!(flag.load(Ordering::SeqCst));
}
