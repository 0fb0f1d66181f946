use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::item::{Processable, WorkItem};
use crate::port::BufferPort;
use crate::BrokerError;

/// Local worker thread draining the outbound queue of one port
pub struct Worker {
    id: usize,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    /// Spawn a worker that processes items until the port closes or `stop` is set
    pub fn new<P: Processable>(
        id: usize,
        port: Arc<BufferPort<P>>,
        stop: Arc<AtomicBool>,
        poll: Duration,
        processed: Arc<AtomicU64>,
    ) -> std::io::Result<Worker> {
        let thread = thread::Builder::new()
            .name(format!("zerg-worker-{}", id))
            .spawn(move || loop {
                if stop.load(Ordering::Acquire) {
                    log::debug!("Worker {} received stop signal", id);
                    break;
                }

                let mut item = match port.pop_outbound(Some(poll)) {
                    Ok(item) => item,
                    Err(BrokerError::Timeout) => continue,
                    Err(BrokerError::PortClosed) => {
                        log::debug!("Worker {} port {} closed", id, port.id());
                        break;
                    }
                    Err(e) => {
                        log::error!("Worker {} failed to fetch work: {}", id, e);
                        break;
                    }
                };

                log::debug!("Worker {} executing item {}", id, item.id());
                let start = std::time::Instant::now();
                match item.process() {
                    Ok(status) => {
                        processed.fetch_add(1, Ordering::Relaxed);
                        log::debug!(
                            "Worker {} finished item {} ({}) in {:?}",
                            id,
                            item.id(),
                            status,
                            start.elapsed()
                        );
                    }
                    Err(e) => log::warn!("Worker {} returning item {} untouched: {}", id, item.id(), e),
                }

                if !return_result(&port, item, &stop, poll) {
                    log::warn!("Worker {} lost its result", id);
                    break;
                }
            })?;

        Ok(Worker {
            id,
            thread: Some(thread),
        })
    }
}

/// 把结果放回inbound；队列满时等待，直到成功、port关闭或收到停止信号
///
/// 无法写回时交还broker，返回`false`表示该工作单元已丢失。
fn return_result<P>(
    port: &BufferPort<P>,
    item: WorkItem<P>,
    stop: &AtomicBool,
    poll: Duration,
) -> bool {
    let mut item = item;
    loop {
        match port.push_inbound_or_return(item, Some(poll)) {
            Ok(()) => return true,
            Err((BrokerError::Timeout, back)) if !stop.load(Ordering::Acquire) => item = back,
            Err((e, back)) => {
                log::debug!("Result {} not returned to port {}: {}", back.id(), port.id(), e);
                return port.hand_back(back, "port closed before result was returned");
            }
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Worker {} thread panicked", self.id);
            }
        }
    }
}
