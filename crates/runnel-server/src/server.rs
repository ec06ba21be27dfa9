use std::io::{BufReader, BufWriter, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};
use runnel_oplog::MemoryCluster;
use runnel_stream::{CursorManager, StreamConfig, StreamError};
use signal_hook::consts::SIGTERM;
use signal_hook::flag;
use tracing::{debug, error, info, warn};

use crate::protocol::{FrameError, Request, read_frame, write_frame};
use crate::session::Session;

pub struct Server {
    cluster: Arc<MemoryCluster>,
    manager: Arc<CursorManager>,
    addr: String,
}

impl Server {
    pub fn new(cluster: MemoryCluster, config: StreamConfig, addr: impl Into<String>) -> Result<Self, StreamError> {
        let manager = CursorManager::new(cluster.topology(), config)?;
        Ok(Self {
            cluster: Arc::new(cluster),
            manager: Arc::new(manager),
            addr: addr.into(),
        })
    }

    pub fn cluster(&self) -> Arc<MemoryCluster> {
        Arc::clone(&self.cluster)
    }

    /// Serve until SIGTERM.
    pub fn serve(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(&self.addr)?;
        info!(addr = %self.addr, "runnel-server listening");

        let shutdown = Arc::new(AtomicBool::new(false));
        flag::register(SIGTERM, Arc::clone(&shutdown))?;
        listener.set_nonblocking(true)?;

        let mut open = Connections::default();
        while !shutdown.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    stream.set_nonblocking(false)?;
                    let session = Session::new(Arc::clone(&self.cluster), Arc::clone(&self.manager));
                    open.spawn(stream, move |stream| {
                        if let Err(e) = handle_connection(stream, session) {
                            warn!(%peer, error = %e, "connection error");
                        }
                    })?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => error!(error = %e, "accept error"),
            }
        }

        info!("shutdown signal received, draining connections");
        // Killing the cursors wakes handlers blocked in get_more; closing the
        // read halves ends the ones waiting for their next request.
        let killed = self.manager.kill_all();
        open.drain();
        info!(cursors = killed, "shutdown complete");
        Ok(())
    }
}

/// Connection threads still running, each with a handle on its socket so
/// shutdown can end its read.
#[derive(Default)]
struct Connections {
    open: Vec<(TcpStream, JoinHandle<()>)>,
}

impl Connections {
    fn spawn(&mut self, stream: TcpStream, handler: impl FnOnce(TcpStream) + Send + 'static) -> std::io::Result<()> {
        self.prune();
        let socket = stream.try_clone()?;
        self.open.push((socket, thread::spawn(move || handler(stream))));
        Ok(())
    }

    fn prune(&mut self) {
        self.open.retain(|(_, handle)| !handle.is_finished());
    }

    fn drain(self) {
        for (socket, _) in &self.open {
            let _ = socket.shutdown(Shutdown::Read);
        }
        for (_, handle) in self.open {
            let _ = handle.join();
        }
    }
}

/// Reads requests on this thread and answers them on another, so a peer that
/// hangs up is noticed even while a `get_more` is blocked on its behalf.
fn handle_connection(stream: TcpStream, session: Session) -> Result<(), FrameError> {
    let reader = BufReader::new(stream.try_clone()?);
    let writer = BufWriter::new(stream);
    let (requests, inbox) = crossbeam::channel::unbounded();

    thread::scope(|s| {
        let worker = s.spawn(|| answer(inbox, writer, &session));
        let read = forward(reader, requests);
        session.disconnect();
        let answered = worker
            .join()
            .unwrap_or_else(|_| Err(FrameError::Io(std::io::Error::other("request worker panicked"))));
        read.and(answered)
    })
}

fn forward(mut reader: BufReader<TcpStream>, requests: Sender<Request>) -> Result<(), FrameError> {
    while let Some(request) = read_frame::<_, Request>(&mut reader)? {
        if requests.send(request).is_err() {
            break;
        }
    }
    Ok(())
}

fn answer(inbox: Receiver<Request>, mut writer: BufWriter<TcpStream>, session: &Session) -> Result<(), FrameError> {
    for request in inbox {
        let response = session.handle(request);
        let written = write_frame(&mut writer, &response).and_then(|()| Ok(writer.flush()?));
        if let Err(e) = written {
            // Unblock the reader; the peer is not listening.
            let _ = writer.get_ref().shutdown(Shutdown::Both);
            return Err(e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_connections_are_pruned() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut open = Connections::default();

        for _ in 0..3 {
            let _client = TcpStream::connect(addr).unwrap();
            let (stream, _) = listener.accept().unwrap();
            open.spawn(stream, drop).unwrap();
        }
        while open.open.iter().any(|(_, handle)| !handle.is_finished()) {
            thread::sleep(Duration::from_millis(5));
        }
        open.prune();
        assert!(open.open.is_empty());
        open.drain();
    }
}
