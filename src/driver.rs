//! The event loop (§4.5): one `mio::Poll`, one timer heap, one listener,
//! one `HashMap` of live transfers. Everything here runs on a single
//! thread; the only blocking call is `Poll::poll`.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::TcpListener;
use mio::{Events, Poll, PollOpt, Ready, Token};
use rand::{self, ThreadRng};

use action::{Action, TransferKind};
use error::TgenError;
use graph::{Graph, VertexId};
use peer::{Peer, PeerPool};
use transfer::{Transfer, TransferState};
use transport::Transport;

const LISTENER_TOKEN: Token = Token(0);
const FIRST_TRANSFER_TOKEN: usize = 1;

/// `boot + vertex.time_s` (or the instant a Pause elapses): fires
/// `walk_successors(vertex)`. Ties break FIFO by enqueue order (§5).
struct TimerEntry {
    deadline: Instant,
    seq: u64,
    vertex: VertexId,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // BinaryHeap is a max-heap; reverse deadline so the earliest
    // deadline (and, on a tie, the lowest seq) pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Clone, Copy)]
enum Origin {
    Client(VertexId),
    Server,
}

struct TransferSlot {
    transfer: Transfer,
    origin: Origin,
}

#[derive(Clone, Debug, Default)]
pub struct Summary {
    pub client_attempted: u64,
    pub client_succeeded: u64,
    pub client_failed: u64,
    pub server_attempted: u64,
    pub server_succeeded: u64,
    pub server_failed: u64,
    pub bytes_transferred: u64,
    pub wall_time: Duration,
}

pub struct Driver {
    poll: Poll,
    graph: Graph,
    listener: TcpListener,
    boot: Instant,
    timers: BinaryHeap<TimerEntry>,
    timer_seq: u64,
    transfers: HashMap<Token, TransferSlot>,
    next_token_val: usize,
    next_transfer_id: u64,
    rng: ThreadRng,
    join_counts: Vec<usize>,
    in_degrees: Vec<usize>,
    start_peers: PeerPool,
    socks_proxy: Option<Peer>,
    end_vertices: Vec<VertexId>,
    stop: bool,
    summary: Summary,
}

impl Driver {
    /// §4.5.1: binds the listener, seeds the RNG, and enqueues the
    /// Start vertex at `boot + time_s`.
    pub fn boot(graph: Graph) -> Result<Driver, TgenError> {
        let start = graph.start_vertex();
        let (time_s, server_port, peers, socks_proxy) = match graph.action_of(start) {
            Action::Start {
                time_s,
                server_port,
                peers,
                socks_proxy,
            } => (*time_s, *server_port, peers.clone(), *socks_proxy),
            _ => unreachable!("GraphBuilder guarantees start_vertex() holds a Start action"),
        };

        let addr: SocketAddr = format!("0.0.0.0:{}", server_port)
            .parse()
            .expect("formatted socket address is always valid");
        let listener = TcpListener::bind(&addr).map_err(TgenError::Bind)?;

        let poll = Poll::new().map_err(TgenError::Poll)?;
        poll.register(&listener, LISTENER_TOKEN, Ready::readable(), PollOpt::edge())
            .map_err(TgenError::Poll)?;

        let in_degrees = graph.in_degrees();
        let join_counts = vec![0usize; graph.len()];
        let end_vertices: Vec<VertexId> = graph
            .vertex_ids()
            .filter(|&v| matches!(graph.action_of(v), Action::End { .. }))
            .collect();

        let boot = Instant::now();
        let mut driver = Driver {
            poll,
            graph,
            listener,
            boot,
            timers: BinaryHeap::new(),
            timer_seq: 0,
            transfers: HashMap::new(),
            next_token_val: FIRST_TRANSFER_TOKEN,
            next_transfer_id: 0,
            rng: rand::thread_rng(),
            join_counts,
            in_degrees,
            start_peers: peers,
            socks_proxy,
            end_vertices,
            stop: false,
            summary: Summary::default(),
        };
        driver.schedule_timer(start, boot + Duration::from_secs(time_s));
        Ok(driver)
    }

    /// §4.5.2: runs until an End condition or fatal error stops it,
    /// returning the shutdown summary.
    pub fn run(mut self) -> Result<Summary, TgenError> {
        let mut events = Events::with_capacity(1024);
        while !self.stop {
            let timeout = self.next_timeout();
            self.poll.poll(&mut events, timeout).map_err(TgenError::Poll)?;
            let now = Instant::now();
            trace!("poll woke with {} events, {} live transfers", events.iter().count(), self.transfers.len());

            let tokens: Vec<(Token, Ready)> =
                events.iter().map(|e| (e.token(), e.readiness())).collect();
            for (token, readiness) in tokens {
                if token == LISTENER_TOKEN {
                    self.accept_loop(now);
                } else {
                    self.dispatch_transfer(token, readiness, now);
                }
            }

            let now = Instant::now();
            self.drain_timers(now);
            self.check_end_conditions(now);
        }
        self.shutdown();
        Ok(self.summary.clone())
    }

    fn next_timeout(&self) -> Option<Duration> {
        self.timers
            .peek()
            .map(|e| e.deadline.saturating_duration_since(Instant::now()))
    }

    fn schedule_timer(&mut self, vertex: VertexId, deadline: Instant) {
        self.timers.push(TimerEntry {
            deadline,
            seq: self.timer_seq,
            vertex,
        });
        self.timer_seq += 1;
    }

    fn drain_timers(&mut self, now: Instant) {
        loop {
            match self.timers.peek() {
                Some(e) if e.deadline <= now => {}
                _ => break,
            }
            let entry = self.timers.pop().expect("peek just confirmed an entry");
            self.walk_successors(entry.vertex, now);
        }
    }

    fn next_token(&mut self) -> Token {
        let token = Token(self.next_token_val);
        self.next_token_val += 1;
        token
    }

    /// §4.5.4: accepts until `WouldBlock`. Inbound transfers are not
    /// part of the graph walk.
    fn accept_loop(&mut self, now: Instant) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let peer = match addr {
                        SocketAddr::V4(v4) => Peer::new(*v4.ip(), v4.port()),
                        SocketAddr::V6(_) => {
                            warn!("rejecting inbound connection from non-IPv4 peer {}", addr);
                            continue;
                        }
                    };
                    let transport = Transport::from_accepted(stream, peer);
                    let token = self.next_token();
                    if let Err(e) = transport.register(&self.poll, token) {
                        warn!("failed to register inbound transfer from {}: {}", peer, e);
                        continue;
                    }
                    let id = self.next_transfer_id;
                    self.next_transfer_id += 1;
                    let transfer = Transfer::new_server(id, transport, peer, now);
                    debug!("accepted inbound transfer id={} peer={}", id, peer);
                    self.summary.server_attempted += 1;
                    self.transfers.insert(
                        token,
                        TransferSlot {
                            transfer,
                            origin: Origin::Server,
                        },
                    );
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("accept error: {}", e);
                    return;
                }
            }
        }
    }

    fn dispatch_transfer(&mut self, token: Token, readiness: Ready, now: Instant) {
        let done = {
            let slot = match self.transfers.get_mut(&token) {
                Some(s) => s,
                None => return,
            };
            if readiness.is_readable() && !slot.transfer.is_done() {
                if let Err(e) = slot.transfer.on_readable(now) {
                    debug!("transfer {} read error: {}", slot.transfer.id(), e);
                }
            }
            if readiness.is_writable() && !slot.transfer.is_done() {
                if let Err(e) = slot.transfer.on_writable(now) {
                    debug!("transfer {} write error: {}", slot.transfer.id(), e);
                }
            }
            slot.transfer.is_done()
        };
        if done {
            self.finish_transfer(token, now);
        }
    }

    fn finish_transfer(&mut self, token: Token, now: Instant) {
        let mut slot = match self.transfers.remove(&token) {
            Some(s) => s,
            None => return,
        };
        let _ = slot.transfer.transport().deregister(&self.poll);
        let success = slot.transfer.state() == TransferState::Success;

        let role = match slot.origin {
            Origin::Client(_) => "client",
            Origin::Server => "server",
        };
        log_completion(&slot.transfer, role);

        match slot.origin {
            Origin::Client(_) if success => self.summary.client_succeeded += 1,
            Origin::Client(_) => self.summary.client_failed += 1,
            Origin::Server if success => self.summary.server_succeeded += 1,
            Origin::Server => self.summary.server_failed += 1,
        }
        if success {
            self.summary.bytes_transferred += slot.transfer.bytes_transferred();
        }
        slot.transfer.close();

        if let Origin::Client(vertex) = slot.origin {
            self.walk_successors(vertex, now);
        }
    }

    /// §4.5.3: activates every successor of `v` in the loader's fixed
    /// order.
    fn walk_successors(&mut self, v: VertexId, now: Instant) {
        let succs = self.graph.successors(v).to_vec();
        for succ in succs {
            self.activate(succ, now);
        }
    }

    fn activate(&mut self, v: VertexId, now: Instant) {
        match self.graph.action_of(v).clone() {
            Action::Start { .. } => {
                // Only ever activated once, at boot.
            }
            Action::Pause { time_s } => {
                self.schedule_timer(v, now + Duration::from_secs(time_s));
            }
            Action::Synchronize => {
                self.join_counts[v] += 1;
                if self.join_counts[v] >= self.in_degrees[v].max(1) {
                    self.join_counts[v] = 0;
                    self.walk_successors(v, now);
                }
            }
            Action::Transfer {
                kind,
                size_bytes,
                peers,
                ..
            } => {
                self.begin_client_transfer(v, kind, size_bytes, peers, now);
            }
            Action::End { .. } => {
                // Terminal; thresholds are polled globally by
                // check_end_conditions rather than on activation, since
                // an End vertex may be reachable from several branches
                // each completing at a different time.
            }
        }
    }

    fn begin_client_transfer(
        &mut self,
        origin_vertex: VertexId,
        kind: TransferKind,
        size_bytes: u64,
        peers: Option<PeerPool>,
        now: Instant,
    ) {
        let pool = peers.unwrap_or_else(|| self.start_peers.clone());
        let peer = match pool.choose_random(&mut self.rng) {
            Ok(p) => p,
            Err(e) => {
                warn!("transfer dispatch skipped, {}", e);
                self.summary.client_attempted += 1;
                self.summary.client_failed += 1;
                self.walk_successors(origin_vertex, now);
                return;
            }
        };

        let id = self.next_transfer_id;
        self.next_transfer_id += 1;
        self.summary.client_attempted += 1;

        match Transfer::new_client(id, kind, size_bytes, peer, self.socks_proxy, now) {
            Ok(transfer) => {
                let token = self.next_token();
                if let Err(e) = transfer.transport().register(&self.poll, token) {
                    warn!("failed to register outbound transfer {}: {}", id, e);
                    self.summary.client_failed += 1;
                    self.walk_successors(origin_vertex, now);
                    return;
                }
                self.transfers.insert(
                    token,
                    TransferSlot {
                        transfer,
                        origin: Origin::Client(origin_vertex),
                    },
                );
            }
            Err(e) => {
                warn!("failed to initiate transfer {} to {}: {}", id, peer, e);
                self.summary.client_failed += 1;
                self.walk_successors(origin_vertex, now);
            }
        }
    }

    /// §4.5.3: consulted after every transfer completion and timer
    /// tick; any non-zero, satisfied threshold begins shutdown.
    fn check_end_conditions(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.boot);
        let succeeded = self.summary.client_succeeded + self.summary.server_succeeded;
        let bytes = self.summary.bytes_transferred;

        let end_vertices = self.end_vertices.clone();
        for v in end_vertices {
            if let Action::End {
                time_s,
                count,
                size_bytes,
            } = self.graph.action_of(v).clone()
            {
                let time_hit = time_s != 0 && elapsed >= Duration::from_secs(time_s);
                let count_hit = count != 0 && succeeded >= count;
                let size_hit = size_bytes != 0 && bytes >= size_bytes;
                if time_hit || count_hit || size_hit {
                    self.stop = true;
                }
            }
        }
    }

    /// §4.5.5: stops accepting, closes in-flight transfers, and the
    /// listener.
    fn shutdown(&mut self) {
        let _ = self.poll.deregister(&self.listener);
        let tokens: Vec<Token> = self.transfers.keys().cloned().collect();
        for token in tokens {
            if let Some(mut slot) = self.transfers.remove(&token) {
                slot.transfer.close();
            }
        }
        self.summary.wall_time = Instant::now().saturating_duration_since(self.boot);
        info!(
            "driver shutdown: client {}/{} ok, server {}/{} ok, bytes={} wall_ms={}",
            self.summary.client_succeeded,
            self.summary.client_attempted,
            self.summary.server_succeeded,
            self.summary.server_attempted,
            self.summary.bytes_transferred,
            self.summary.wall_time.as_millis()
        );
    }
}

fn log_completion(t: &Transfer, role: &str) {
    let cp = t.checkpoints();
    let ms = |at: Option<Instant>| -> i64 {
        match (cp.created, at) {
            (Some(created), Some(x)) => x.saturating_duration_since(created).as_millis() as i64,
            _ => -1,
        }
    };
    let kind = t
        .kind()
        .map(|k| k.as_str().to_ascii_lowercase())
        .unwrap_or_else(|| "?".to_string());
    let result = match t.state() {
        TransferState::Success => "success".to_string(),
        _ => format!("error:{}", t.reason().unwrap_or("unknown")),
    };
    info!(
        "transfer-complete id={} role={} kind={} peer={} size={} connect_ms={} command_ms={} payload_ms={} total_ms={} result={}",
        t.id(),
        role,
        kind,
        t.peer(),
        t.bytes_transferred(),
        ms(cp.connected),
        ms(cp.command_received),
        ms(cp.first_payload),
        ms(cp.complete),
        result
    );
}
