//! Long-lived task plumbing shared by the oastd listeners and the storage
//! expirer.
//!
//! Every protocol receiver runs as a [`Task`]: it is spawned once at startup,
//! loops until a fatal error occurs or the [`ShutdownSignal`] fires, and its
//! terminal result is collected by the service supervisor. Per-request errors
//! never travel through this layer.

use std::future::Future;

use async_trait::async_trait;
use tokio::task::JoinHandle;

/// Broadcasts the stop order to every running [`Task`].
#[derive(Debug)]
pub struct ShutdownHandle(tokio::sync::watch::Sender<()>);

impl ShutdownHandle {
    pub fn new() -> (Self, ShutdownSignal) {
        let (sender, receiver) = tokio::sync::watch::channel(());
        (Self(sender), ShutdownSignal(receiver))
    }

    pub fn signal(&self) {
        let _ = self.0.send(());
    }

    /// Resolves once every [`ShutdownSignal`] clone has been dropped, i.e.
    /// once all tasks have actually wound down.
    pub async fn all_closed(&self) {
        self.0.closed().await;
    }
}

#[derive(Clone, Debug)]
pub struct ShutdownSignal(tokio::sync::watch::Receiver<()>);

impl ShutdownSignal {
    pub async fn wait(&mut self) {
        let _ = self.0.changed().await;
    }
}

/// A unit of long-running work owned by the supervisor.
///
/// Listeners return only when their accept loop dies, so a `Task` resolving
/// with an error is always fatal to the process.
#[async_trait]
pub trait Task {
    type Output: Send;

    const NAME: &'static str;

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output;
}

/// Join handle that aborts the running task when dropped.
///
/// See https://github.com/tokio-rs/tokio/issues/1830 for why detaching must
/// be explicit.
#[must_use]
pub struct ChildTask<T>(JoinHandle<T>);

impl<T> ChildTask<T> {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        ChildTask(tokio::task::spawn(future))
    }

    pub async fn join(mut self) -> Result<T, tokio::task::JoinError> {
        (&mut self.0).await
    }

    pub fn abort(&self) {
        self.0.abort();
    }

    /// Let the task keep running without a handle on it.
    pub fn detach(self) {
        core::mem::forget(self);
    }
}

impl<T> Drop for ChildTask<T> {
    fn drop(&mut self) {
        self.abort();
    }
}

pub fn spawn_task<T>(task: T, shutdown_signal: ShutdownSignal) -> ChildTask<T::Output>
where
    T: Task + 'static,
{
    ChildTask(tokio::task::spawn(task.run(shutdown_signal)))
}
