//! Bounded worker pool for per-message handlers.
//!
//! The pool caps the number of concurrently running handler invocations at
//! a fixed capacity. It is payload-oblivious: the handler registered at
//! construction owns all message semantics.

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Default pool capacity, also used as the processor batch size.
pub const DEFAULT_CAPACITY: usize = 10;

/// Per-message handler executed under a pool slot.
#[async_trait]
pub trait Handler: Send + Sync {
    type Msg: Send + Sync;
    type Error: Send;

    async fn handle(&self, ctx: &CancellationToken, msg: &Self::Msg)
        -> Result<(), Self::Error>;
}

/// Fixed-capacity execution gate.
///
/// Slots are tokio semaphore permits. The pool starts empty: [`fill`] must
/// run before [`handle`] can proceed. [`drain`] reclaims every slot, and
/// only completes once no handler is still running.
///
/// [`fill`]: WorkerPool::fill
/// [`handle`]: WorkerPool::handle
/// [`drain`]: WorkerPool::drain
pub struct WorkerPool<H: Handler> {
    capacity: usize,
    slots: Semaphore,
    handler: H,
}

impl<H: Handler> WorkerPool<H> {
    pub fn new(capacity: usize, handler: H) -> Self {
        Self {
            capacity,
            slots: Semaphore::new(0),
            handler,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Makes all `capacity` slots available. Must be paired with a
    /// [`drain`](WorkerPool::drain) before the next fill.
    pub fn fill(&self) {
        self.slots.add_permits(self.capacity);
    }

    /// Runs the handler under a pool slot.
    ///
    /// Blocks while all slots are taken, which is what back-pressures the
    /// caller. The slot is released on every exit path: success, handler
    /// error, or cancellation of the handler future.
    pub async fn handle(
        &self,
        ctx: &CancellationToken,
        msg: &H::Msg,
    ) -> Result<(), H::Error> {
        let _slot = self
            .slots
            .acquire()
            .await
            .expect("worker pool semaphore closed");
        self.handler.handle(ctx, msg).await
    }

    /// Reclaims every slot, completing only when no handler holds one.
    pub async fn drain(&self) {
        let slots = self
            .slots
            .acquire_many(self.capacity as u32)
            .await
            .expect("worker pool semaphore closed");
        slots.forget();
    }
}
