use std::{
    io,
    thread::{self, JoinHandle},
};

use log::{debug, error};

/// A named background thread whose result is collected on join.
#[derive(Debug)]
pub(crate) struct Worker<T> {
    name: &'static str,
    thread: JoinHandle<T>,
}

impl<T: Send + 'static> Worker<T> {
    pub(crate) fn spawn<F>(name: &'static str, f: F) -> io::Result<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let thread = thread::Builder::new().name(name.to_string()).spawn(f)?;
        debug!("worker {name} started");
        Ok(Self { name, thread })
    }

    /// Waits for the thread. `None` if it panicked.
    pub(crate) fn join(self) -> Option<T> {
        match self.thread.join() {
            Ok(value) => {
                debug!("worker {} finished", self.name);
                Some(value)
            }
            Err(_) => {
                error!("worker {} panicked", self.name);
                None
            }
        }
    }
}
