use kanal::{Receiver, Sender};
use log::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;

use crate::error::{HostError, HostResult};

/// Cancellation token shared between the script thread and a pool worker.
/// Long-running work is expected to poll it between syscalls.
#[derive(Clone, Debug, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
  pub fn new() -> Self {
    return Self::default();
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    return self.0.load(Ordering::SeqCst);
  }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool for blocking host work: filesystem, digests over large
/// buffers, nonblocking FFI calls. Completions are posted back through
/// oneshot channels awaited on the script thread.
pub struct WorkPool {
  sender: Sender<Job>,
  handles: Vec<std::thread::JoinHandle<()>>,
}

impl WorkPool {
  pub fn new(threads: usize) -> Self {
    let threads = threads.max(1);
    let (sender, receiver) = kanal::unbounded::<Job>();

    let handles = (0..threads)
      .map(|index| {
        let receiver: Receiver<Job> = receiver.clone();
        return std::thread::Builder::new()
          .name(format!("andromeda-pool-{index}"))
          .spawn(move || {
            while let Ok(job) = receiver.recv() {
              job();
            }
          })
          .expect("startup");
      })
      .collect();

    return Self { sender, handles };
  }

  pub fn submit<R: Send + 'static>(
    &self,
    flag: CancellationFlag,
    work: impl FnOnce(&CancellationFlag) -> HostResult<R> + Send + 'static,
  ) -> oneshot::Receiver<HostResult<R>> {
    let (sender, receiver) = oneshot::channel::<HostResult<R>>();

    let submitted = self.sender.send(Box::new(move || {
      let result = if flag.is_cancelled() {
        Err(HostError::interrupted())
      } else {
        work(&flag)
      };
      if sender.send(result).is_err() {
        debug!("pool completion dropped, caller went away");
      }
    }));

    if submitted.is_err() {
      warn!("work pool is shut down");
    }
    return receiver;
  }

  pub fn shutdown(mut self) {
    let _ = self.sender.close();
    for handle in self.handles.drain(..) {
      if let Err(err) = handle.join() {
        error!("Failed to join pool worker: {err:?}");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_submit_and_complete() {
    let pool = WorkPool::new(2);

    let receiver = pool.submit(CancellationFlag::new(), |_flag| Ok(21 * 2));
    assert_eq!(42, receiver.await.unwrap().unwrap());

    pool.shutdown();
  }

  #[tokio::test]
  async fn test_cancelled_before_run() {
    let pool = WorkPool::new(1);

    // Occupy the single worker so the next job stays queued.
    let (block_tx, block_rx) = kanal::bounded::<()>(0);
    let _busy = pool.submit(CancellationFlag::new(), move |_flag| {
      let _ = block_rx.recv();
      return Ok(());
    });

    let flag = CancellationFlag::new();
    let receiver = pool.submit(flag.clone(), |_flag| Ok(1));
    flag.cancel();
    block_tx.send(()).unwrap();

    let err = receiver.await.unwrap().unwrap_err();
    assert_eq!(crate::error::ErrorKind::Interrupted, err.kind);

    pool.shutdown();
  }
}
