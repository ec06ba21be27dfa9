use std::net::{SocketAddr, ToSocketAddrs};
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};

use crate::client::{Client, ClientError};

/// A fixed number of connection slots shared between threads. Slots connect
/// on first checkout. A blocking `get_more` holds its slot for the whole
/// wait, so size the pool for the number of streams read concurrently.
pub struct ClientPool {
    addrs: Vec<SocketAddr>,
    free: Sender<Option<Client>>,
    slots: Receiver<Option<Client>>,
}

impl ClientPool {
    pub fn new(addr: impl ToSocketAddrs, size: usize) -> Result<Self, ClientError> {
        let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
        let (free, slots) = crossbeam::channel::bounded(size);
        for _ in 0..size {
            free.send(None).map_err(closed)?;
        }
        Ok(Self { addrs, free, slots })
    }

    /// Take a slot, waiting as long as it takes.
    pub fn get(&self) -> Result<PooledClient<'_>, ClientError> {
        let slot = self.slots.recv().map_err(closed)?;
        self.lend(slot)
    }

    /// Take a slot, or fail with [`ClientError::PoolExhausted`] once `wait`
    /// passes with every slot lent out.
    pub fn checkout(&self, wait: Duration) -> Result<PooledClient<'_>, ClientError> {
        match self.slots.recv_timeout(wait) {
            Ok(slot) => self.lend(slot),
            Err(RecvTimeoutError::Timeout) => Err(ClientError::PoolExhausted(wait)),
            Err(e) => Err(closed(e)),
        }
    }

    /// Slots not currently lent out.
    pub fn available(&self) -> usize {
        self.slots.len()
    }

    fn lend(&self, slot: Option<Client>) -> Result<PooledClient<'_>, ClientError> {
        let client = match slot {
            Some(client) => client,
            None => match Client::connect(self.addrs.as_slice()) {
                Ok(client) => client,
                Err(e) => {
                    let _ = self.free.send(None);
                    return Err(e);
                }
            },
        };
        Ok(PooledClient {
            client: Some(client),
            free: &self.free,
        })
    }
}

fn closed(e: impl std::fmt::Display) -> ClientError {
    ClientError::Io(std::io::Error::other(e.to_string()))
}

/// A lent connection. Dropping it hands the connection back to the pool.
pub struct PooledClient<'a> {
    client: Option<Client>,
    free: &'a Sender<Option<Client>>,
}

impl PooledClient<'_> {
    /// Close the connection instead of returning it, for when a call failed
    /// mid-frame and the stream can no longer be trusted. The slot reconnects
    /// on its next checkout.
    pub fn discard(mut self) {
        self.client = None;
    }
}

impl Deref for PooledClient<'_> {
    type Target = Client;

    fn deref(&self) -> &Client {
        // Only cleared by `discard` and Drop, which both consume the guard.
        self.client.as_ref().expect("pooled client already returned")
    }
}

impl DerefMut for PooledClient<'_> {
    fn deref_mut(&mut self) -> &mut Client {
        self.client.as_mut().expect("pooled client already returned")
    }
}

impl Drop for PooledClient<'_> {
    fn drop(&mut self) {
        let _ = self.free.send(self.client.take());
    }
}
