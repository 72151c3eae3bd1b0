//! Connection multiplexer.
//!
//! A [`Mux`] owns a base listener and an ordered list of rules. Every
//! accepted connection is sniffed on its own task: the leading bytes are
//! read into a bounded window, the rules are asked in registration order,
//! and the connection is queued on the first rule that claims it. The
//! sniffed bytes stay in front of the stream, see [`MuxStream`].
//!
//! ```ignore
//! let mut mux = Mux::new(TcpListener::bind("0.0.0.0:8080").await?, MuxConfig::default());
//! let http = mux.match_with(matchers::http1_fast());
//! let tls = mux.match_with(matchers::any());
//! tokio::spawn(serve_http(http));
//! tokio::spawn(serve_https(tls));
//! mux.serve().await
//! ```

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;

use crate::config::MuxConfig;
use crate::conn::MuxStream;
use crate::error::{MuxError, Unmatched};
use crate::matchers::{MatchResult, Matcher};

/// Size of a single read while sniffing.
const READ_CHUNK: usize = 1024;

/// A source of raw byte-stream connections.
///
/// Closing the listener is dropping it.
pub trait Listener: Send + 'static {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    type Addr: fmt::Display + Clone + Send + Sync + 'static;

    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Io, Self::Addr)>> + Send;

    fn local_addr(&self) -> io::Result<Self::Addr>;
}

impl Listener for TcpListener {
    type Io = TcpStream;
    type Addr = SocketAddr;

    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(&*self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Receiving end of a rule's queue, shared by the rule and its
/// sub-listener so either side can release what is still waiting.
type Inbox<S> = Arc<Mutex<mpsc::UnboundedReceiver<MuxStream<S>>>>;

struct Rule<S> {
    matcher: Box<dyn Matcher>,
    queue: mpsc::UnboundedSender<MuxStream<S>>,
    inbox: Inbox<S>,
    closed: watch::Receiver<bool>,
}

/// Outcome of asking the rules about a prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Route(usize),
    Unmatched,
    NeedMore,
}

/// Asks the matchers in order. A rule that needs more bytes blocks every
/// rule after it, unless the prefix is final (window full or peer at EOF),
/// in which case it counts as a rejection.
fn decide<'a, M>(matchers: impl IntoIterator<Item = &'a M>, prefix: &[u8], is_final: bool) -> Decision
where
    M: Matcher + ?Sized + 'a,
{
    for (index, matcher) in matchers.into_iter().enumerate() {
        match matcher.matches(prefix) {
            MatchResult::Matched => return Decision::Route(index),
            MatchResult::NoMatch => continue,
            MatchResult::Incomplete if is_final => continue,
            MatchResult::Incomplete => return Decision::NeedMore,
        }
    }
    Decision::Unmatched
}

/// Resolves once the flag is set or its sender is gone.
async fn wait_closed(flag: &mut watch::Receiver<bool>) {
    while !*flag.borrow_and_update() {
        if flag.changed().await.is_err() {
            return;
        }
    }
}

/// Closes a queue and drops every connection still waiting in it, which
/// closes those sockets. Later pushes fail.
fn drain<S>(queue: &mut mpsc::UnboundedReceiver<MuxStream<S>>) -> usize {
    queue.close();
    let mut dropped = 0;
    while queue.try_recv().is_ok() {
        dropped += 1;
    }
    dropped
}

fn release<S: Send + 'static>(inbox: &Inbox<S>, rule: usize) {
    match inbox.try_lock() {
        Ok(mut queue) => log_released(rule, drain(&mut *queue)),
        // A pending accept holds the queue; drain once it lets go.
        Err(_) => {
            let inbox = Arc::clone(inbox);
            tokio::spawn(async move {
                let dropped = drain(&mut *inbox.lock().await);
                log_released(rule, dropped);
            });
        }
    }
}

fn log_released(rule: usize, dropped: usize) {
    if dropped > 0 {
        tracing::debug!(rule, dropped, "mux released queued connections");
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

/// Routes connections from a base listener to sub-listeners by sniffing
/// their first bytes.
pub struct Mux<L: Listener> {
    listener: L,
    config: MuxConfig,
    rules: Vec<Rule<L::Io>>,
    local_addr: Option<L::Addr>,
    shutdown: Arc<watch::Sender<bool>>,
    errors: Option<mpsc::UnboundedSender<MuxError>>,
}

impl<L: Listener> Mux<L> {
    pub fn new(listener: L, config: MuxConfig) -> Self {
        let local_addr = listener.local_addr().ok();
        let (shutdown, _) = watch::channel(false);
        Self {
            listener,
            config,
            rules: Vec::new(),
            local_addr,
            shutdown: Arc::new(shutdown),
            errors: None,
        }
    }

    /// Registers a rule and returns the listener its connections arrive on.
    ///
    /// Rules are tried in the order they were registered. Register
    /// [`any`](crate::matchers::any) last to catch everything else.
    pub fn match_with(&mut self, matcher: impl Matcher) -> SubListener<L> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let index = self.rules.len();
        let inbox = Arc::new(Mutex::new(queue_rx));

        self.rules.push(Rule {
            matcher: Box::new(matcher),
            queue: queue_tx,
            inbox: Arc::clone(&inbox),
            closed: closed_rx,
        });

        SubListener {
            index,
            queue: inbox,
            closed: closed_tx,
            shutdown: self.shutdown.subscribe(),
            local_addr: self.local_addr.clone(),
        }
    }

    /// Returns a channel receiving every per-connection failure.
    pub fn errors(&mut self) -> mpsc::UnboundedReceiver<MuxError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.errors = Some(tx);
        rx
    }

    /// Returns a handle that can close the multiplexer while it serves.
    pub fn closer(&self) -> MuxCloser {
        MuxCloser {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    pub fn local_addr(&self) -> Option<&L::Addr> {
        self.local_addr.as_ref()
    }

    /// Accepts connections until closed or the base listener fails.
    ///
    /// Returns [`MuxError::Closed`] after [`MuxCloser::close`], which is a
    /// normal shutdown. Any other error comes from the base listener. Either
    /// way every sub-listener is closed on return.
    pub async fn serve(mut self) -> Result<(), MuxError> {
        let rules: Arc<[Rule<L::Io>]> = std::mem::take(&mut self.rules).into();
        let reporter = Arc::new(Reporter {
            errors: self.errors.take(),
        });
        let mut shutdown = self.shutdown.subscribe();

        tracing::info!(rules = rules.len(), "mux serving");

        let result = loop {
            let accepted = tokio::select! {
                biased;
                _ = wait_closed(&mut shutdown) => None,
                accepted = self.listener.accept() => Some(accepted),
            };

            let Some(accepted) = accepted else {
                break Err(MuxError::Closed);
            };

            match accepted {
                Ok((io, addr)) => {
                    tracing::debug!(peer = %addr, "mux accepted connection");
                    let sniffer = Sniffer {
                        rules: Arc::clone(&rules),
                        peek_limit: self.config.peek_limit,
                        deadline: Instant::now() + self.config.peek_timeout(),
                        reporter: Arc::clone(&reporter),
                        shutdown: self.shutdown.subscribe(),
                    };
                    tokio::spawn(sniffer.run(io, addr.to_string()));
                }
                Err(e) if is_transient(&e) => {
                    tracing::warn!(error = %e, "mux: transient accept error");
                }
                Err(e) => break Err(MuxError::Accept(e)),
            }
        };

        self.shutdown.send_replace(true);
        for (index, rule) in rules.iter().enumerate() {
            release(&rule.inbox, index);
        }
        match &result {
            Err(e) if e.is_closed() => tracing::info!("mux closed"),
            Err(e) => tracing::error!(error = %e, "mux stopped"),
            Ok(()) => {}
        }
        result
    }
}

/// Closes a [`Mux`] from another task.
#[derive(Clone)]
pub struct MuxCloser {
    shutdown: Arc<watch::Sender<bool>>,
}

impl MuxCloser {
    /// Stops the accept loop, wakes every pending sub-listener accept and
    /// closes connections still queued for a sub-listener. Calling it again
    /// has no effect.
    pub fn close(&self) {
        if !self.shutdown.send_replace(true) {
            tracing::debug!("mux close requested");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Connections claimed by one rule.
pub struct SubListener<L: Listener> {
    index: usize,
    queue: Inbox<L::Io>,
    closed: watch::Sender<bool>,
    shutdown: watch::Receiver<bool>,
    local_addr: Option<L::Addr>,
}

impl<L: Listener> SubListener<L> {
    /// Waits for the next connection claimed by this rule.
    ///
    /// Fails with [`MuxError::Closed`] once this sub-listener or the whole
    /// multiplexer is closed.
    pub async fn accept(&self) -> Result<MuxStream<L::Io>, MuxError> {
        let mut closed = self.closed.subscribe();
        let mut shutdown = self.shutdown.clone();

        let received = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => None,
            _ = wait_closed(&mut shutdown) => None,
            stream = async { self.queue.lock().await.recv().await } => stream,
        };

        match received {
            Some(stream) => Ok(stream),
            None => {
                log_released(self.index, drain(&mut *self.queue.lock().await));
                Err(MuxError::Closed)
            }
        }
    }

    /// Closes this sub-listener only. It never fails and calling it again
    /// has no effect.
    ///
    /// Connections still queued here are closed. Connections routed here
    /// afterwards are dropped and reported as [`MuxError::QueueClosed`].
    pub fn close(&self) {
        self.closed.send_replace(true);
        // A pending accept holding the queue drains it when it wakes.
        if let Ok(mut queue) = self.queue.try_lock() {
            log_released(self.index, drain(&mut *queue));
        }
    }

    /// Position of the rule in registration order.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Address of the base listener.
    pub fn local_addr(&self) -> Option<&L::Addr> {
        self.local_addr.as_ref()
    }
}

impl<L: Listener> Drop for SubListener<L> {
    fn drop(&mut self) {
        self.closed.send_replace(true);
        if let Ok(mut queue) = self.queue.try_lock() {
            log_released(self.index, drain(&mut *queue));
        }
    }
}

struct Reporter {
    errors: Option<mpsc::UnboundedSender<MuxError>>,
}

impl Reporter {
    fn report(&self, err: MuxError) {
        match &err {
            MuxError::NoMatch { .. } => tracing::debug!(error = %err, "connection not routed"),
            _ => tracing::warn!(error = %err, "connection not routed"),
        }
        if let Some(errors) = &self.errors {
            let _ = errors.send(err);
        }
    }
}

/// Per-connection task: sniff, decide, enqueue.
struct Sniffer<S> {
    rules: Arc<[Rule<S>]>,
    peek_limit: usize,
    deadline: Instant,
    reporter: Arc<Reporter>,
    shutdown: watch::Receiver<bool>,
}

impl<S> Sniffer<S>
where
    S: AsyncRead + Unpin + Send + 'static,
{
    async fn run(self, io: S, peer: String) {
        let mut shutdown = self.shutdown.clone();
        let sniffed = tokio::select! {
            biased;
            _ = wait_closed(&mut shutdown) => None,
            sniffed = self.sniff(io, &peer) => Some(sniffed),
        };

        let result = match sniffed {
            Some(Ok((index, stream))) => self.dispatch(index, stream, &peer),
            Some(Err(e)) => Err(e),
            None => {
                tracing::debug!(%peer, "mux closed while sniffing");
                return;
            }
        };
        if let Err(e) = result {
            self.reporter.report(e);
        }
    }

    async fn sniff(&self, mut io: S, peer: &str) -> Result<(usize, MuxStream<S>), MuxError> {
        let mut prefix = Vec::with_capacity(self.peek_limit.min(READ_CHUNK));
        let mut chunk = [0u8; READ_CHUNK];
        let mut at_eof = false;

        loop {
            let is_final = at_eof || prefix.len() >= self.peek_limit;
            let matchers = self.rules.iter().map(|rule| &*rule.matcher);

            match decide(matchers, &prefix, is_final) {
                Decision::Route(index) => {
                    tracing::debug!(%peer, rule = index, sniffed = prefix.len(), "mux matched");
                    return Ok((index, MuxStream::new(prefix, io, peer)));
                }
                Decision::Unmatched => {
                    let reason = if prefix.is_empty() {
                        Unmatched::Empty
                    } else {
                        Unmatched::Rejected
                    };
                    return Err(MuxError::NoMatch {
                        peer: peer.to_string(),
                        reason,
                    });
                }
                Decision::NeedMore => {}
            }

            let want = (self.peek_limit - prefix.len()).min(READ_CHUNK);
            match tokio::time::timeout_at(self.deadline, io.read(&mut chunk[..want])).await {
                Err(_) => {
                    return Err(MuxError::NoMatch {
                        peer: peer.to_string(),
                        reason: Unmatched::TimedOut,
                    });
                }
                Ok(Ok(0)) => {
                    if prefix.is_empty() {
                        return Err(MuxError::NoMatch {
                            peer: peer.to_string(),
                            reason: Unmatched::Empty,
                        });
                    }
                    at_eof = true;
                }
                Ok(Ok(n)) => prefix.extend_from_slice(&chunk[..n]),
                Ok(Err(source)) => {
                    return Err(MuxError::Io {
                        peer: peer.to_string(),
                        source,
                    });
                }
            }
        }
    }

    fn dispatch(&self, index: usize, stream: MuxStream<S>, peer: &str) -> Result<(), MuxError> {
        if *self.shutdown.borrow() {
            tracing::debug!(%peer, "mux closed before dispatch");
            return Ok(());
        }

        let rule = &self.rules[index];
        let queue_closed = || MuxError::QueueClosed {
            rule: index,
            peer: peer.to_string(),
        };

        if *rule.closed.borrow() {
            return Err(queue_closed());
        }
        rule.queue.send(stream).map_err(|_| queue_closed())
    }
}
