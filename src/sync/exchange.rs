//! Contents of the connection's execution lock
//!
//! A reply belongs to the [`Backlog`] that sent its request. It is read from
//! the wire lazily; when another request needs the channel first, the rest of
//! the reply is moved into the owner's backlog and read from memory later.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::buffer_pool::PooledBufferSet;
use crate::constant::{PacketType, ProcId};
use crate::cursor::{CallReply, RpcCall};
use crate::demux::TokenSource;
use crate::error::{Error, Result, Warning, eyre};
use crate::param::ParamDescriptor;
use crate::protocol::packet::Inbound;
use crate::protocol::rpc::write_rpc;
use crate::protocol::token::{Token, TokenDecoder};
use crate::sync::channel::{Attention, Channel, ChannelRead};
use crate::sync::lock;
use crate::timer::{self, TimerGuard};

/// Connection state reachable without the execution lock
pub struct ConnShared {
    attention: Arc<dyn Attention>,
    /// Attentions written so far; the server answers each with one DONE ATTN
    attentions: AtomicUsize,
    closed: AtomicBool,
    /// Held while an attention is sent and while a reply leaves the wire
    gate: Mutex<()>,
}

impl ConnShared {
    pub fn new(attention: Arc<dyn Attention>) -> Self {
        Self {
            attention,
            attentions: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            gate: Mutex::new(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns `true` if the connection was already closed
    pub fn mark_closed(&self) -> bool {
        self.closed.swap(true, Ordering::AcqRel)
    }

    /// Send an attention if `backlog`'s reply is still on the wire
    pub fn interrupt(&self, backlog: &Backlog) -> bool {
        let _gate = lock(&self.gate);
        if !backlog.on_wire.load(Ordering::Acquire) {
            return false;
        }
        self.attentions.fetch_add(1, Ordering::AcqRel);
        match self.attention.send_attention() {
            Ok(()) => true,
            Err(e) => {
                self.attentions.fetch_sub(1, Ordering::AcqRel);
                tracing::warn!(error = %e, "failed to send attention");
                false
            }
        }
    }

    /// Shut the channel down under a thread that may be blocked reading it
    pub fn abort(&self) {
        if let Err(e) = self.attention.abort() {
            tracing::debug!(error = %e, "channel abort failed");
        }
    }
}

/// Tokens of one reply that were read off the wire ahead of their owner
#[derive(Default)]
pub struct Backlog {
    tokens: Mutex<VecDeque<Token>>,
    on_wire: AtomicBool,
    abandoned: AtomicBool,
    timed_out: AtomicBool,
    deadline: Mutex<Option<TimerGuard>>,
}

impl Backlog {
    /// The owner will never read the rest of this reply
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::Release);
        lock(&self.tokens).clear();
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    fn pop(&self) -> Option<Token> {
        lock(&self.tokens).pop_front()
    }
}

impl std::fmt::Debug for Backlog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backlog")
            .field("queued", &lock(&self.tokens).len())
            .field("on_wire", &self.on_wire.load(Ordering::Relaxed))
            .finish()
    }
}

pub struct Exchange {
    channel: Box<dyn Channel>,
    buffers: PooledBufferSet,
    inbound: Inbound,
    decoder: TokenDecoder,
    packet_size: usize,
    owner: Option<Weak<Backlog>>,
    /// DONE ATTN tokens read so far
    acks: usize,
    shared: Arc<ConnShared>,
    broken: bool,
}

impl Exchange {
    pub fn new(
        channel: Box<dyn Channel>,
        buffers: PooledBufferSet,
        packet_size: usize,
        shared: Arc<ConnShared>,
    ) -> Self {
        Self {
            channel,
            buffers,
            inbound: Inbound::default(),
            decoder: TokenDecoder::default(),
            packet_size,
            owner: None,
            acks: 0,
            shared,
            broken: false,
        }
    }

    pub fn shared(&self) -> &Arc<ConnShared> {
        &self.shared
    }

    fn check(&self) -> Result<()> {
        if self.broken || self.shared.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    pub fn is_owner(&self, backlog: &Arc<Backlog>) -> bool {
        self.owner
            .as_ref()
            .is_some_and(|owner| std::ptr::eq(owner.as_ptr(), Arc::as_ptr(backlog)))
    }

    /// The owner's reply has left the wire
    fn release_owner(&mut self) {
        let Some(owner) = self.owner.take().and_then(|owner| owner.upgrade()) else {
            return;
        };
        {
            let _gate = lock(&self.shared.gate);
            owner.on_wire.store(false, Ordering::Release);
        }
        let deadline = lock(&owner.deadline).take();
        drop(deadline);
    }

    /// Clear the wire for a new request
    ///
    /// The unread part of the previous reply goes to its owner's backlog, or
    /// nowhere if the owner is gone. Pending attention acknowledgements are
    /// consumed so they cannot end the next reply early.
    fn reclaim(&mut self) -> Result<()> {
        if let Some(owner) = self.owner.clone() {
            let upgraded = owner.upgrade();
            let target = upgraded
                .as_ref()
                .filter(|backlog| !backlog.abandoned.load(Ordering::Acquire));
            let mut spilled = 0usize;
            while let Some(token) = self.read_token()? {
                if let Some(backlog) = target {
                    lock(&backlog.tokens).push_back(token);
                    spilled += 1;
                }
            }
            match (&upgraded, target) {
                (_, Some(_)) => tracing::debug!(spilled, "spilled reply into backlog"),
                (None, _) => tracing::warn!("discarded reply of a dropped statement"),
                (Some(_), None) => tracing::debug!("discarded abandoned reply"),
            }
            self.release_owner();
        }
        while self.shared.attentions.load(Ordering::Acquire) > self.acks {
            self.inbound.reset();
            self.decoder.reset();
            while self.read_token()?.is_some() {}
        }
        Ok(())
    }

    /// Write a request owned by `owner`
    #[tracing::instrument(skip_all)]
    pub fn send(
        &mut self,
        packet_type: PacketType,
        owner: &Arc<Backlog>,
        build: impl FnOnce(&mut Vec<u8>) -> Result<()>,
    ) -> Result<()> {
        self.check()?;
        self.reclaim()?;
        build(self.buffers.new_write_buffer())?;
        let framed = self.buffers.frame(packet_type as u8, self.packet_size);
        let written = self
            .channel
            .write_all(framed)
            .and_then(|()| self.channel.flush());
        if let Err(e) = written {
            self.broken = true;
            return Err(e.into());
        }
        self.inbound.reset();
        self.decoder.reset();
        owner.on_wire.store(true, Ordering::Release);
        self.owner = Some(Arc::downgrade(owner));
        Ok(())
    }

    /// Next token of the reply on the wire, `None` at the end of the message
    #[tracing::instrument(skip_all)]
    pub fn read_token(&mut self) -> Result<Option<Token>> {
        if self.broken {
            return Err(Error::ConnectionClosed);
        }
        match self.decode_next() {
            Ok(Some(Token::Done(done))) if done.is_attention() => {
                self.acks += 1;
                Ok(Some(Token::Done(done)))
            }
            Ok(token) => Ok(token),
            Err(e) => {
                self.broken = true;
                Err(e)
            }
        }
    }

    fn decode_next(&mut self) -> Result<Option<Token>> {
        let mut src = ChannelRead(&mut *self.channel);
        self.inbound.prime(&mut src)?;
        if self.inbound.is_finished() {
            return Ok(None);
        }
        let mut reader = self.inbound.reader(&mut src);
        self.decoder.decode(&mut reader).map(Some)
    }

    pub fn shutdown(&mut self) {
        self.broken = true;
        if let Err(e) = self.channel.shutdown() {
            tracing::debug!(error = %e, "channel shutdown failed");
        }
    }
}

/// Reads one reply, from the owner's backlog first and then from the wire
///
/// The execution lock is taken on the first token that has to come from the
/// wire and held until the source is dropped.
pub struct ReplySource<'a> {
    exchange: &'a Mutex<Exchange>,
    guard: Option<MutexGuard<'a, Exchange>>,
    backlog: &'a Arc<Backlog>,
}

impl<'a> ReplySource<'a> {
    pub fn new(exchange: &'a Mutex<Exchange>, backlog: &'a Arc<Backlog>) -> Self {
        Self {
            exchange,
            guard: None,
            backlog,
        }
    }

    pub fn locked(
        exchange: &'a Mutex<Exchange>,
        guard: MutexGuard<'a, Exchange>,
        backlog: &'a Arc<Backlog>,
    ) -> Self {
        Self {
            exchange,
            guard: Some(guard),
            backlog,
        }
    }
}

impl TokenSource for ReplySource<'_> {
    fn next_token(&mut self) -> Result<Option<Token>> {
        if let Some(token) = self.backlog.pop() {
            return Ok(Some(token));
        }
        if !self.backlog.on_wire.load(Ordering::Acquire) {
            return Ok(None);
        }
        if self.guard.is_none() {
            self.guard = Some(lock(self.exchange));
        }
        // spilled while waiting for the lock
        if let Some(token) = self.backlog.pop() {
            return Ok(Some(token));
        }
        let exchange = self
            .guard
            .as_mut()
            .ok_or_else(|| Error::LibraryBug(eyre!("execution lock not held")))?;
        if !exchange.is_owner(self.backlog) {
            return Ok(None);
        }
        match exchange.read_token()? {
            Some(token) => Ok(Some(token)),
            None => {
                exchange.release_owner();
                Ok(None)
            }
        }
    }

    fn interruption(&self) -> Error {
        if self.backlog.timed_out() {
            Error::Timeout
        } else {
            Error::Cancelled
        }
    }
}

/// Timeout, cancellation and warnings shared by a statement and its result sets
#[derive(Debug, Default)]
pub struct CallContext {
    timeout_secs: AtomicU32,
    in_flight: Mutex<Option<Arc<Backlog>>>,
    warnings: Mutex<Vec<Warning>>,
}

impl CallContext {
    pub fn new(timeout_secs: u32) -> Self {
        Self {
            timeout_secs: AtomicU32::new(timeout_secs),
            ..Self::default()
        }
    }

    pub fn add_warning(&self, warning: Warning) {
        lock(&self.warnings).push(warning);
    }

    pub fn add_warnings(&self, warnings: impl IntoIterator<Item = Warning>) {
        lock(&self.warnings).extend(warnings);
    }

    pub fn warnings(&self) -> Vec<Warning> {
        lock(&self.warnings).clone()
    }

    pub fn clear_warnings(&self) {
        lock(&self.warnings).clear();
    }

    pub fn query_timeout(&self) -> u32 {
        self.timeout_secs.load(Ordering::Relaxed)
    }

    pub fn set_query_timeout(&self, secs: u32) {
        self.timeout_secs.store(secs, Ordering::Relaxed);
    }

    /// Send a request and arm the deadline of its reply
    ///
    /// Returns with the execution lock still held so the caller can start
    /// reading without another request slipping in.
    pub fn begin<'a>(
        &self,
        exchange: &'a Mutex<Exchange>,
        packet_type: PacketType,
        build: impl FnOnce(&mut Vec<u8>) -> Result<()>,
    ) -> Result<(MutexGuard<'a, Exchange>, Arc<Backlog>)> {
        let mut guard = lock(exchange);
        let backlog = Arc::new(Backlog::default());
        guard.send(packet_type, &backlog, build)?;
        *lock(&self.in_flight) = Some(Arc::clone(&backlog));

        let secs = self.query_timeout();
        if secs > 0 {
            let shared = Arc::clone(guard.shared());
            let target = Arc::downgrade(&backlog);
            let deadline = timer::schedule(Duration::from_secs(u64::from(secs)), move || {
                if let Some(backlog) = target.upgrade() {
                    backlog.timed_out.store(true, Ordering::Release);
                    if shared.interrupt(&backlog) {
                        tracing::debug!(secs, "query timed out, attention sent");
                    }
                }
            })?;
            *lock(&backlog.deadline) = Some(deadline);
        }
        Ok((guard, backlog))
    }

    pub fn finish(&self, backlog: &Arc<Backlog>) {
        let mut in_flight = lock(&self.in_flight);
        if in_flight
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, backlog))
        {
            *in_flight = None;
        }
    }

    /// Interrupt the reply in flight, if any
    pub fn cancel(&self, shared: &ConnShared) -> bool {
        let in_flight = lock(&self.in_flight).clone();
        in_flight.is_some_and(|backlog| shared.interrupt(&backlog))
    }
}

/// [`RpcCall`] over the connection's exchange
///
/// The whole reply is read under one acquisition of the execution lock.
pub struct ExchangeCall<'a> {
    exchange: &'a Mutex<Exchange>,
    ctx: &'a CallContext,
}

impl<'a> ExchangeCall<'a> {
    pub fn new(exchange: &'a Mutex<Exchange>, ctx: &'a CallContext) -> Self {
        Self { exchange, ctx }
    }
}

impl RpcCall for ExchangeCall<'_> {
    fn call(&mut self, proc_id: ProcId, params: &[ParamDescriptor]) -> Result<CallReply> {
        let (guard, backlog) = self.ctx.begin(self.exchange, PacketType::Rpc, |out| {
            write_rpc(out, proc_id, params)
        })?;
        let result = {
            let mut src = ReplySource::locked(self.exchange, guard, &backlog);
            CallReply::collect(&mut src)
        };
        self.ctx.finish(&backlog);
        result
    }
}
