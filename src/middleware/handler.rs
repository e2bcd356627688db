//! Handlers and the per-read context they operate on
//!
//! A `HandlerContext` carries the bytes of one read plus a chain of scratch
//! buffers. Every transforming stage reads its input (the raw read, or the
//! previous stage's output), writes into the current scratch buffer and then
//! advances the chain, so no stage ever overwrites bytes a later stage still
//! has to consume.
//!
//! The context lives for a whole direction of a connection, so a stage can
//! also park state (a streaming decoder, say) between read events.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{LantasError, Result};
use crate::pool::{BufferPool, PooledBuffer};

/// Which way bytes flow through a proxied connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client bytes on their way upstream (pre-write middleware)
    ClientToUpstream,
    /// Upstream bytes on their way back to the client (post-read middleware)
    UpstreamToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientToUpstream => "prewrite",
            Self::UpstreamToClient => "postread",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stream transform invoked once per read event
pub trait ConnHandler: Send + Sync {
    fn handle(&self, ctx: &mut HandlerContext) -> Result<()>;
}

impl<F> ConnHandler for F
where
    F: Fn(&mut HandlerContext) -> Result<()> + Send + Sync,
{
    fn handle(&self, ctx: &mut HandlerContext) -> Result<()> {
        self(ctx)
    }
}

/// Box a closure as a handler
pub fn handler_fn<F>(f: F) -> Box<dyn ConnHandler>
where
    F: Fn(&mut HandlerContext) -> Result<()> + Send + Sync + 'static,
{
    Box::new(f)
}

/// Terminal handler that leaves the context untouched
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl ConnHandler for Passthrough {
    fn handle(&self, _ctx: &mut HandlerContext) -> Result<()> {
        Ok(())
    }
}

/// State shared by every stage of one direction's pipeline for one read
pub struct HandlerContext {
    direction: Direction,
    read_buf: PooledBuffer,
    read_n: usize,
    chain: Vec<PooledBuffer>,
    /// Index of the buffer the next stage writes into
    current: usize,
    /// Index of the buffer the last stage wrote, if any stage ran
    previous: Option<usize>,
    /// State parked by stateful stages, keyed by their position in the chain
    stage_state: HashMap<usize, Box<dyn Any + Send + Sync>>,
}

impl HandlerContext {
    /// Build a context over an already acquired read buffer and buffer chain
    pub fn new(direction: Direction, read_buf: PooledBuffer, chain: Vec<PooledBuffer>) -> Self {
        Self {
            direction,
            read_buf,
            read_n: 0,
            chain,
            current: 0,
            previous: None,
            stage_state: HashMap::new(),
        }
    }

    /// Acquire a read buffer and `chain_len` scratch buffers from `pool`
    pub fn from_pool(direction: Direction, pool: &Arc<BufferPool>, chain_len: usize) -> Self {
        let read_buf = pool.get_read_buf();
        let chain = (0..chain_len).map(|_| pool.get()).collect();
        Self::new(direction, read_buf, chain)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Buffer the next read lands in
    pub fn read_buf_mut(&mut self) -> &mut [u8] {
        &mut self.read_buf[..]
    }

    /// Record how many bytes the last read produced
    pub fn set_read_n(&mut self, n: usize) {
        self.read_n = n.min(self.read_buf.len());
    }

    /// Size of the read buffer, which bounds the bytes of one read event
    pub fn buffer_size(&self) -> usize {
        self.read_buf.len()
    }

    pub fn read_n(&self) -> usize {
        self.read_n
    }

    /// Bytes actually read for this event
    pub fn read_bytes(&self) -> &[u8] {
        &self.read_buf[..self.read_n]
    }

    /// Input of the next stage: the previous stage's output, else the read bytes
    pub fn input(&self) -> &[u8] {
        match self.previous {
            Some(prev) => &self.chain[prev][..],
            None => self.read_bytes(),
        }
    }

    /// Input of the next stage together with its (cleared) output buffer
    pub fn stage_buffers(&mut self) -> Result<(&[u8], &mut Vec<u8>)> {
        let len = self.chain.len();
        if self.current >= len {
            return Err(LantasError::BufferChainExhausted {
                stage: self.current,
                len,
            });
        }

        let (input, output): (&[u8], &mut Vec<u8>) = match self.previous {
            Some(prev) => {
                let (done, rest) = self.chain.split_at_mut(self.current);
                (&done[prev][..], &mut *rest[0])
            }
            None => (
                &self.read_buf[..self.read_n],
                &mut *self.chain[self.current],
            ),
        };
        output.clear();
        Ok((input, output))
    }

    /// Hand the current buffer to the next stage as its input.
    ///
    /// Fails when no scratch buffer is left for the next stage, which means
    /// the chain was sized too small for the pipeline.
    pub fn advance_buf_chain(&mut self) -> Result<()> {
        let next = self.current + 1;
        if next >= self.chain.len() {
            return Err(LantasError::BufferChainExhausted {
                stage: next,
                len: self.chain.len(),
            });
        }
        self.previous = Some(self.current);
        self.current = next;
        Ok(())
    }

    /// Bytes to forward once the pipeline has run
    pub fn output(&self) -> &[u8] {
        self.input()
    }

    /// Take back the state the current stage parked on an earlier read
    pub fn take_stage_state<T: Send + Sync + 'static>(&mut self) -> Option<Box<T>> {
        self.stage_state.remove(&self.current)?.downcast().ok()
    }

    /// Park state for the current stage until the next read event
    pub fn put_stage_state<T: Send + Sync + 'static>(&mut self, state: Box<T>) {
        self.stage_state.insert(self.current, state);
    }

    /// Number of scratch buffers in the chain
    pub fn chain_len(&self) -> usize {
        self.chain.len()
    }

    /// Number of stages that have written output since the last reset
    pub fn stages_run(&self) -> usize {
        match self.previous {
            Some(_) => self.current,
            None => 0,
        }
    }

    /// Rewind the chain for the next read event; parked stage state survives
    pub fn reset(&mut self) {
        let used = (self.current + 1).min(self.chain.len());
        for buf in &mut self.chain[..used] {
            buf.clear();
        }
        self.read_n = 0;
        self.current = 0;
        self.previous = None;
    }
}

impl fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("direction", &self.direction)
            .field("read_n", &self.read_n)
            .field("chain_len", &self.chain.len())
            .field("current", &self.current)
            .field("previous", &self.previous)
            .field("stage_state", &self.stage_state.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(chain_len: usize) -> HandlerContext {
        let pool = BufferPool::new(0, 64);
        HandlerContext::from_pool(Direction::ClientToUpstream, &pool, chain_len)
    }

    fn load(ctx: &mut HandlerContext, bytes: &[u8]) {
        ctx.read_buf_mut()[..bytes.len()].copy_from_slice(bytes);
        ctx.set_read_n(bytes.len());
    }

    /// Stage that uppercases its input into the current buffer
    fn upper(ctx: &mut HandlerContext) -> Result<()> {
        let (input, output) = ctx.stage_buffers()?;
        output.extend(input.iter().map(u8::to_ascii_uppercase));
        ctx.advance_buf_chain()
    }

    /// Stage that appends a marker byte to its input
    fn mark(ctx: &mut HandlerContext) -> Result<()> {
        let (input, output) = ctx.stage_buffers()?;
        output.extend_from_slice(input);
        output.push(b'!');
        ctx.advance_buf_chain()
    }

    #[test]
    fn test_output_without_stages_is_read_bytes() {
        let mut ctx = context(1);
        load(&mut ctx, b"raw");
        assert_eq!(ctx.output(), b"raw");
        assert_eq!(ctx.stages_run(), 0);
    }

    #[test]
    fn test_stages_chain_through_buffers() {
        let mut ctx = context(3);
        load(&mut ctx, b"hello");

        upper(&mut ctx).unwrap();
        assert_eq!(ctx.input(), b"HELLO");
        mark(&mut ctx).unwrap();

        assert_eq!(ctx.output(), b"HELLO!");
        assert_eq!(ctx.stages_run(), 2);
        // the raw read is still intact for inspection
        assert_eq!(ctx.read_bytes(), b"hello");
    }

    #[test]
    fn test_chain_sized_one_short_is_exhausted() {
        let mut ctx = context(2);
        load(&mut ctx, b"abc");

        upper(&mut ctx).unwrap();
        let err = mark(&mut ctx).unwrap_err();
        assert!(matches!(
            err,
            LantasError::BufferChainExhausted { stage: 2, len: 2 }
        ));
    }

    #[test]
    fn test_empty_chain_rejects_stage() {
        let mut ctx = context(0);
        load(&mut ctx, b"abc");
        assert!(matches!(
            ctx.stage_buffers(),
            Err(LantasError::BufferChainExhausted { stage: 0, len: 0 })
        ));
    }

    #[test]
    fn test_reset_rewinds_for_next_read() {
        let mut ctx = context(3);
        load(&mut ctx, b"first");
        upper(&mut ctx).unwrap();
        mark(&mut ctx).unwrap();

        ctx.reset();
        assert_eq!(ctx.read_n(), 0);
        assert_eq!(ctx.stages_run(), 0);

        load(&mut ctx, b"second");
        mark(&mut ctx).unwrap();
        assert_eq!(ctx.output(), b"second!");
    }

    /// Stage that counts the reads it has seen in parked state
    fn count(ctx: &mut HandlerContext) -> Result<()> {
        let mut seen = ctx.take_stage_state::<u32>().unwrap_or_default();
        *seen += 1;
        {
            let (input, output) = ctx.stage_buffers()?;
            output.extend_from_slice(input);
            output.push(b'0' + *seen as u8);
        }
        ctx.put_stage_state(seen);
        ctx.advance_buf_chain()
    }

    #[test]
    fn test_stage_state_survives_reset_per_position() {
        let mut ctx = context(3);
        for expected in [&b"a11"[..], b"a22", b"a33"] {
            load(&mut ctx, b"a");
            count(&mut ctx).unwrap();
            count(&mut ctx).unwrap();
            assert_eq!(ctx.output(), expected);
            ctx.reset();
        }
    }

    #[test]
    fn test_stage_state_of_another_type_is_not_returned() {
        let mut ctx = context(2);
        ctx.put_stage_state(Box::new(7u32));
        assert!(ctx.take_stage_state::<String>().is_none());
        assert!(ctx.take_stage_state::<u32>().is_none());
    }

    #[test]
    fn test_set_read_n_is_clamped() {
        let mut ctx = context(1);
        ctx.set_read_n(10_000);
        assert_eq!(ctx.read_n(), 64);
    }
}
