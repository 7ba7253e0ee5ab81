//! Relay between task producers and worker pools.
//!
//! Producers push tasks to the Streamer's `task_in` endpoint; worker pools
//! pull them from `task_out`. Tasks are forwarded in arrival order.

use crate::config::Config;
use crate::error::{FarmError, Result};
use crate::transport::{Endpoint, PullSocket, PushSocket, SocketCloser, proxy};
use std::thread::{self, JoinHandle};
use tracing::info;

pub struct Streamer {
    task_in: Endpoint,
    task_out: Endpoint,
}

impl Streamer {
    pub fn new(task_in: Endpoint, task_out: Endpoint) -> Self {
        Self { task_in, task_out }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.task_in_url(), config.task_out_url())
    }

    fn bind(&self) -> Result<(PullSocket, PushSocket)> {
        let pull = PullSocket::bind(&self.task_in)?;
        let push = PushSocket::bind(&self.task_out)?;
        Ok((pull, push))
    }

    /// Relay in the foreground until interrupted.
    ///
    /// Returns the number of tasks relayed.
    pub fn run(&self) -> Result<u64> {
        let (pull, mut push) = self.bind()?;
        info!(task_in = %self.task_in, task_out = %self.task_out, "streamer started");
        let relayed = proxy(&pull, &mut push)?;
        info!(relayed, "streamer stopped");
        Ok(relayed)
    }

    /// Bind both endpoints, then relay on a background thread.
    pub fn spawn(self) -> Result<StreamerHandle> {
        let (pull, mut push) = self.bind()?;
        let task_in = pull
            .local_endpoint()
            .cloned()
            .unwrap_or_else(|| self.task_in.clone());
        let task_out = push
            .local_endpoint()
            .cloned()
            .unwrap_or_else(|| self.task_out.clone());
        let closer = pull.closer();
        info!(task_in = %task_in, task_out = %task_out, "streamer started");

        let thread = thread::Builder::new()
            .name("streamer".to_string())
            .spawn(move || {
                let relayed = proxy(&pull, &mut push)?;
                info!(relayed, "streamer stopped");
                Ok(relayed)
            })?;

        Ok(StreamerHandle {
            task_in,
            task_out,
            closer,
            thread,
        })
    }
}

/// A Streamer running on a background thread.
pub struct StreamerHandle {
    pub task_in: Endpoint,
    pub task_out: Endpoint,
    closer: SocketCloser,
    thread: JoinHandle<Result<u64>>,
}

impl StreamerHandle {
    /// Interrupt the relay and wait for it.
    ///
    /// A relay blocked on a task nobody pulls keeps blocking.
    pub fn shutdown(self) -> Result<u64> {
        self.closer.close();
        self.thread
            .join()
            .map_err(|_| FarmError::Transport("streamer thread panicked".into()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_relays_in_order_and_stops() {
        let any = Endpoint::new("127.0.0.1", 0);
        let handle = Streamer::new(any.clone(), any).spawn().unwrap();

        let worker = PullSocket::connect(&handle.task_out).unwrap();
        let mut producer = PushSocket::connect(&handle.task_in).unwrap();
        for i in 0..10 {
            producer.send(&json!({"task_no": i})).unwrap();
        }
        let got: Vec<i64> = (0..10)
            .map(|_| {
                let v: serde_json::Value = worker.recv().unwrap().unwrap();
                v["task_no"].as_i64().unwrap()
            })
            .collect();
        assert_eq!(got, (0..10).collect::<Vec<_>>());

        assert_eq!(handle.shutdown().unwrap(), 10);
    }
}
