use std::io::{BufReader, BufWriter};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::lane::{route, Forwarder, Lane, LaneStats};
use crate::range::RangeMap;
use crate::wire::{self, MalformedRequest, Request, Response};

/// Counters collected when the channel shuts down.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelReport {
    /// Per-range counters in address order.
    pub ranges: Vec<(String, LaneStats)>,

    /// Requests answered with a fault before reaching a range.
    pub rejected: u64,

    /// Reason a provider connection was lost, if any.
    pub lost: Option<String>,
}

impl ChannelReport {
    /// Sum of the counters across all ranges.
    pub fn total(&self) -> LaneStats {
        self.ranges
            .iter()
            .fold(LaneStats::default(), |total, (_, stats)| LaneStats {
                served: total.served + stats.served,
                faulted: total.faulted + stats.faulted,
                cache_hits: total.cache_hits + stats.cache_hits,
                forwarded: total.forwarded + stats.forwarded,
            })
    }
}

struct Job {
    request: Request,
    reply: Sender<Response>,
}

struct Shared {
    ranges: RangeMap,
    closing: AtomicBool,
    rejected: AtomicU64,
    lost: Mutex<Option<String>>,
    connections: Mutex<Vec<TcpStream>>,
    connection_threads: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn is_lost(&self) -> bool {
        lock(&self.lost).is_some()
    }

    /// Record the first provider loss. Returns whether this call recorded it.
    fn record_lost(&self, reason: &str) -> bool {
        let mut lost = lock(&self.lost);
        if lost.is_some() {
            return false;
        }

        *lost = Some(reason.to_string());
        true
    }

    /// Close every emulator connection so blocked clients observe the loss.
    fn sever(&self) {
        for stream in lock(&self.connections).iter() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Forwarding service listening for emulator connections.
///
/// Each range is served by a dedicated worker thread, so requests to one range are answered in
/// arrival order while different ranges proceed concurrently. Shutting down answers queued
/// requests with faults rather than leaving the emulator blocked. Losing a provider closes every
/// emulator connection, which the emulator observes as [Error::TargetLost].
pub struct ForwardingChannel {
    address: SocketAddr,
    shared: Arc<Shared>,
    acceptor: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<Lane>>,
    report: Option<ChannelReport>,
}

impl ForwardingChannel {
    /// Bind the listener and start one worker per range.
    pub fn bind(address: impl ToSocketAddrs, forwarder: Forwarder) -> Result<Self> {
        let listener = TcpListener::bind(address)?;
        let address = listener.local_addr()?;
        let (ranges, lanes) = forwarder.into_lanes();

        let shared = Arc::new(Shared {
            ranges,
            closing: AtomicBool::new(false),
            rejected: AtomicU64::new(0),
            lost: Mutex::new(None),
            connections: Mutex::new(Vec::new()),
            connection_threads: Mutex::new(Vec::new()),
        });

        let mut senders = Vec::with_capacity(lanes.len());
        let mut workers = Vec::with_capacity(lanes.len());
        for lane in lanes {
            let (sender, receiver) = mpsc::channel();
            let shared = Arc::clone(&shared);
            senders.push(sender);
            workers.push(thread::spawn(move || run_lane(lane, receiver, shared)));
        }

        let acceptor = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || accept_connections(listener, senders, shared))
        };

        info!(%address, ranges = workers.len(), "memory forwarding channel listening");
        Ok(Self {
            address,
            shared,
            acceptor: Some(acceptor),
            workers,
            report: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub fn ranges(&self) -> &RangeMap {
        &self.shared.ranges
    }

    /// Fails with [Error::TargetLost] once any backing provider has lost its connection.
    pub fn health(&self) -> Result<()> {
        match lock(&self.shared.lost).as_ref() {
            Some(reason) => Err(Error::TargetLost(reason.clone())),
            None => Ok(()),
        }
    }

    /// Stop accepting requests, answer everything still queued with a fault, and join all
    /// threads. Calling this more than once returns the same report.
    pub fn shutdown(&mut self) -> ChannelReport {
        if let Some(report) = &self.report {
            return report.clone();
        }

        self.shared.closing.store(true, Ordering::SeqCst);

        // Wake the acceptor so it observes the closing flag
        let mut wake_address = self.address;
        if wake_address.ip().is_unspecified() {
            wake_address.set_ip(Ipv4Addr::LOCALHOST.into());
        }
        let _ = TcpStream::connect(wake_address);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }

        // Readers stop, writers keep delivering fault responses for queued requests
        let connections: Vec<TcpStream> = lock(&self.shared.connections).drain(..).collect();
        for stream in &connections {
            let _ = stream.shutdown(Shutdown::Read);
        }

        let threads: Vec<JoinHandle<()>> =
            lock(&self.shared.connection_threads).drain(..).collect();
        for handle in threads {
            let _ = handle.join();
        }

        let mut ranges = Vec::with_capacity(self.workers.len());
        for worker in self.workers.drain(..) {
            match worker.join() {
                Ok(lane) => ranges.push((lane.range().name().to_string(), lane.stats())),
                Err(_) => warn!("forwarding worker panicked"),
            }
        }

        for stream in &connections {
            let _ = stream.shutdown(Shutdown::Both);
        }

        let report = ChannelReport {
            ranges,
            rejected: self.shared.rejected.load(Ordering::SeqCst),
            lost: lock(&self.shared.lost).clone(),
        };

        info!(address = %self.address, ?report, "memory forwarding channel closed");
        self.report = Some(report.clone());
        report
    }
}

impl Drop for ForwardingChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_lane(mut lane: Lane, jobs: Receiver<Job>, shared: Arc<Shared>) -> Lane {
    for job in jobs {
        let response = if shared.is_closing() {
            Response::fault(job.request.id)
        } else {
            lane.serve(&job.request)
        };

        if let Some(reason) = lane.lost() {
            if shared.record_lost(reason) {
                warn!(
                    range = %lane.range().name(),
                    "provider lost, closing forwarding connections"
                );
                shared.sever();
            }

            // Nobody is left to answer
            continue;
        }

        // The connection may already be gone during teardown
        let _ = job.reply.send(response);
    }

    lane
}

fn accept_connections(listener: TcpListener, lanes: Vec<Sender<Job>>, shared: Arc<Shared>) {
    for stream in listener.incoming() {
        if shared.is_closing() {
            break;
        }

        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!("failed to accept forwarding connection: {err}");
                continue;
            }
        };

        if shared.is_lost() {
            debug!("refusing forwarding connection after provider loss");
            let _ = stream.shutdown(Shutdown::Both);
            continue;
        }

        let registered = stream.try_clone().map(|clone| {
            lock(&shared.connections).push(clone);
        });

        if let Err(err) = registered {
            warn!("failed to register forwarding connection: {err}");
            continue;
        }

        let lanes = lanes.clone();
        let connection_shared = Arc::clone(&shared);
        let handle = thread::spawn(move || serve_connection(stream, lanes, connection_shared));
        lock(&shared.connection_threads).push(handle);
    }
}

fn serve_connection(stream: TcpStream, lanes: Vec<Sender<Job>>, shared: Arc<Shared>) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    debug!(%peer, "forwarding connection established");

    let writer_stream = match stream.try_clone() {
        Ok(stream) => stream,
        Err(err) => {
            warn!(%peer, "failed to split forwarding connection: {err}");
            return;
        }
    };

    let (reply, replies) = mpsc::channel::<Response>();
    let writer = thread::spawn(move || {
        let mut writer = BufWriter::new(writer_stream);
        for response in replies {
            if let Err(err) = wire::write_message(&mut writer, &response) {
                debug!("failed to deliver forwarding response: {err}");
                break;
            }
        }
    });

    let mut reader = BufReader::new(stream);
    loop {
        let request = match wire::read_request(&mut reader) {
            Ok(Some(Ok(request))) => request,
            Ok(Some(Err(MalformedRequest { id: Some(id), error }))) => {
                debug!(%peer, id, "rejected malformed request: {error}");
                shared.rejected.fetch_add(1, Ordering::SeqCst);
                let _ = reply.send(Response::fault(id));
                continue;
            }
            Ok(Some(Err(MalformedRequest { id: None, error }))) => {
                warn!(%peer, "dropping forwarding request without an id: {error}");
                continue;
            }
            Ok(None) => break,
            Err(err) => {
                debug!(%peer, "forwarding connection failed: {err}");
                break;
            }
        };

        if shared.is_lost() {
            break;
        }

        if shared.is_closing() {
            let _ = reply.send(Response::fault(request.id));
            continue;
        }

        match route(&shared.ranges, &request) {
            Ok(index) => {
                let job = Job {
                    request,
                    reply: reply.clone(),
                };

                if let Err(mpsc::SendError(job)) = lanes[index].send(job) {
                    let _ = reply.send(Response::fault(job.request.id));
                }
            }
            Err(rejection) => {
                debug!(%peer, id = request.id, "rejected request: {rejection}");
                shared.rejected.fetch_add(1, Ordering::SeqCst);
                let _ = reply.send(Response::fault(request.id));
            }
        }
    }

    if shared.is_lost() {
        let _ = reader.get_ref().shutdown(Shutdown::Both);
    }

    debug!(%peer, "forwarding connection closed");
    drop(lanes);
    drop(reply);
    let _ = writer.join();
}
