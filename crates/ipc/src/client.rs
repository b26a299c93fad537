//! Proxy-side client
//!
//! Drives one request through the whole protocol: enqueue the path, wait for
//! the worker to start streaming (or to fail early), drain the data channel,
//! wait for the final status and acknowledge the slot. A finished request is
//! always acknowledged, whatever happened to the bytes, so a failing proxy
//! never leaks queue slots.

use crate::data::DataChannels;
use crate::names::RegionNames;
use crate::queue::{Readiness, RequestQueue, Ticket};
use shmcache_core::{Completion, Error, Result};
use std::io::Write;
use std::time::Duration;

pub struct ProxyClient {
    queue: RequestQueue,
    channels: DataChannels,
    timeout: Option<Duration>,
}

impl ProxyClient {
    /// Attach to both regions published by a running daemon
    pub fn attach(names: &RegionNames) -> Result<Self> {
        let queue = RequestQueue::attach(&names.requests)?;
        let channels = DataChannels::attach(&names.data)?;
        tracing::debug!(requests = %names.requests, data = %names.data, "proxy attached");
        Ok(Self {
            queue,
            channels,
            timeout: None,
        })
    }

    /// Bound every wait of every request
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Fetch the cached content of `path`
    pub fn fetch(&self, path: &str) -> Result<Vec<u8>> {
        let mut content = Vec::new();
        self.fetch_into(path, &mut content)?;
        Ok(content)
    }

    /// Stream the cached content of `path` into `dst`, returning its size
    pub fn fetch_into<W: Write>(&self, path: &str, dst: W) -> Result<u64> {
        let ticket = self.queue.enqueue(path)?;
        tracing::debug!(request_id = ticket.id, path = %path, "request submitted");

        match self.queue.wait_ready(ticket, self.timeout)? {
            Readiness::Finished(completion) => {
                self.queue.acknowledge(ticket)?;
                completion.into_result(path)
            }
            Readiness::Streaming { channel, size } => {
                let copied = self
                    .channels
                    .reader(channel, ticket.id, self.timeout)
                    .and_then(|mut reader| reader.copy_to(dst));
                let expected = self.complete(ticket)?.into_result(path)?;
                let copied = copied?;
                if copied != expected || copied != size {
                    return Err(Error::transfer(
                        path,
                        format!("received {copied} of {expected} bytes"),
                    ));
                }
                Ok(copied)
            }
        }
    }

    fn complete(&self, ticket: Ticket) -> Result<Completion> {
        self.queue.wait_completion(ticket, self.timeout)?;
        self.queue.acknowledge(ticket)
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn channels(&self) -> &DataChannels {
        &self.channels
    }

    /// Unmap both regions
    pub fn detach(self) {
        self.queue.detach();
        self.channels.detach();
    }
}

impl std::fmt::Debug for ProxyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyClient")
            .field("queue", &self.queue)
            .field("channels", &self.channels)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataGeometry;
    use shmcache_core::Outcome;
    use std::thread;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Serve `requests` requests from an in-memory table, like one worker
    fn serve(queue: &RequestQueue, channels: &DataChannels, requests: usize) {
        let table = [("/hello.txt", b"hello, world".to_vec()), ("/big", vec![7u8; 3000])];
        let mut writer = channels.writer(0, TIMEOUT).unwrap();
        for _ in 0..requests {
            let claim = queue.dequeue().unwrap().unwrap();
            match table.iter().find(|(path, _)| *path == claim.path) {
                None => queue.mark_done(&claim, Outcome::NotFound, 0).unwrap(),
                Some((_, body)) => {
                    let size = body.len() as u64;
                    writer.begin(claim.id, size).unwrap();
                    queue.begin_transfer(&claim, 0, size).unwrap();
                    let report = writer.send_from(body.as_slice(), &claim.path).unwrap();
                    queue.mark_done(&claim, Outcome::Ok, report.bytes).unwrap();
                }
            }
        }
    }

    #[test]
    fn test_fetch_hits_and_misses() {
        let names = RegionNames::with_prefix(&format!(
            "shmcache-test-c-{}",
            uuid::Uuid::new_v4().simple()
        ));
        let queue = RequestQueue::create(&names.requests, 4).unwrap();
        let channels = DataChannels::create(&names.data, DataGeometry::new(1, 1024).unwrap()).unwrap();
        let client = ProxyClient::attach(&names).unwrap().with_timeout(TIMEOUT);

        thread::scope(|s| {
            s.spawn(|| serve(&queue, &channels, 3));

            assert_eq!(client.fetch("/hello.txt").unwrap(), b"hello, world");
            assert!(matches!(client.fetch("/missing"), Err(Error::NotFound { .. })));
            assert_eq!(client.fetch("/big").unwrap(), vec![7u8; 3000]);
        });

        assert_eq!(queue.occupied().unwrap(), 0);
        client.detach();
        channels.destroy().unwrap();
        queue.destroy().unwrap();
    }

    #[test]
    fn test_attach_fails_without_daemon() {
        let names = RegionNames::with_prefix(&format!(
            "shmcache-test-c-{}",
            uuid::Uuid::new_v4().simple()
        ));
        assert!(matches!(ProxyClient::attach(&names), Err(Error::Resource { .. })));
    }
}
