// Copyright 2024 Guanhao Yin <sopium@mysterious.site>

// This file is part of wgdash.

// wgdash is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// wgdash is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with wgdash.  If not, see <https://www.gnu.org/licenses/>.

use futures::future::Shared;
use futures::prelude::*;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot::*;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Manage a group of tasks.
pub struct AsyncScope {
    receiver: Shared<Pin<Box<dyn Future<Output = ()> + Send>>>,
    sender: Mutex<Option<Sender<()>>>,
}

impl AsyncScope {
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = channel();
        Arc::new(AsyncScope {
            receiver: async move {
                let _ = receiver.await;
            }
            .boxed()
            .shared(),
            sender: Mutex::new(Some(sender)),
        })
    }

    pub fn cancelled(&self) -> impl Future<Output = ()> + Send + Unpin {
        self.receiver.clone()
    }

    pub fn cancel(&self) {
        self.sender.lock().take();
    }

    /// Spawn a future that is bound to this scope.
    ///
    /// When this scope is cancelled, the future is cancelled.
    ///
    /// When the future completes, this scope is cancelled.
    pub fn spawn_canceller<F>(self: &Arc<Self>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let w = Arc::downgrade(self);
        self.spawn_async(async move {
            future.await;
            if let Some(c) = w.upgrade() {
                c.cancel();
            }
        });
    }

    /// Spawn a future that is bound to this scope.
    ///
    /// When this scope is cancelled, the future is cancelled.
    pub fn spawn_async<T>(&self, future: T)
    where
        T: Future<Output = ()> + Send + 'static,
    {
        let cancelled = self.cancelled();

        tokio::spawn(async move {
            futures::select_biased! {
                _ = future.fuse() => {}
                _ = cancelled.fuse() => {}
            };
        });
    }

    /// Run `f` every `period`, starting now.
    ///
    /// Cancellation is only observed between runs, so a run in progress
    /// always completes. Await the handle to wait for that.
    pub fn spawn_periodic<F, Fut>(&self, period: Duration, mut f: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut cancelled = self.cancelled();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut cancelled => break,
                    _ = interval.tick() => {}
                }
                f().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn cancellation() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();

        rt.block_on(async {
            let scope = AsyncScope::new();
            scope.spawn_async(future::pending());
            scope.spawn_async(future::pending());
            drop(scope);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_runs_finish_before_exit() {
        let scope = AsyncScope::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let handle = {
            let runs = runs.clone();
            let finished = finished.clone();
            scope.spawn_periodic(Duration::from_secs(10), move || {
                let runs = runs.clone();
                let finished = finished.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        tokio::time::sleep(Duration::from_secs(21)).await;
        scope.cancel();
        handle.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }
}
