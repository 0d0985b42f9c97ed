//! Memory pools as kernel objects: a [`MemoryPool`] plus a wait list for
//! threads blocked on an empty pool.

use core::task::Poll;

use crate::error::{KernelError, KernelResult};
use crate::isr::PostEvent;
use crate::kernel::{Kernel, KernelState, Timeout, WaitValue};
use crate::list::List;
use crate::pool::{Block, MemoryPool, PoolStats};
use crate::port::Port;
use crate::slots::{object_id, Leaf};
use crate::thread::{Wait, WaitReason};
use crate::trace::records;

object_id!(
    /// Handle to a memory pool object.
    PoolId
);

pub(crate) struct PoolCb {
    pub name: &'static str,
    pub waiters: List,
}

impl<P: Port> Kernel<P> {
    pub fn pool_new(&self, name: &'static str, block_count: usize, block_size: usize) -> KernelResult<PoolId> {
        self.thread_context()?;
        let pool = MemoryPool::new(block_count, block_size)?;
        self.with_state(|st| {
            let key = st.pools.insert(PoolCb {
                name,
                waiters: List::new(),
            })?;
            self.pool_leaves.at(key.index())?.bind(key, pool);
            self.emit(records::pool::CREATE, &key.index().to_le_bytes());
            log::debug!("pool '{}' created: {} x {} bytes", name, block_count, block_size);
            Ok(PoolId(key))
        })
    }

    fn with_pool<R>(&self, id: PoolId, f: impl FnOnce(&mut MemoryPool) -> R) -> KernelResult<R> {
        self.pool_leaves.at(id.index())?.with(id.key(), f)
    }

    /// Allocates a block, blocking up to `timeout` while the pool is empty.
    /// From an interrupt handler the call never blocks.
    pub fn pool_alloc(&self, id: PoolId, timeout: Timeout) -> KernelResult<Poll<Block>> {
        self.check_alive()?;
        let timeout = self.wait_timeout(timeout)?;
        if let Some(block) = self.with_pool(id, MemoryPool::alloc)? {
            self.emit(records::pool::ALLOC, &id.index().to_le_bytes());
            return Ok(Poll::Ready(block));
        }
        if timeout.is_no_wait() {
            return Err(KernelError::Resource);
        }

        self.with_state(|st| {
            st.pools.get(id.key())?;
            if let Some(block) = self.with_pool(id, MemoryPool::alloc)? {
                return Ok(Poll::Ready(block));
            }
            let me = self.begin_wait(st)?;
            st.pools
                .at_mut(id.index())
                .waiters
                .insert_by(&mut st.threads, me, |t| t.priority);
            let wait = Wait {
                reason: WaitReason::Pool,
                object: id.index(),
                flags: None,
            };
            self.suspend(st, me, wait, timeout);
            Ok(Poll::Pending)
        })
    }

    /// Returns a block. Safe from interrupt handlers.
    pub fn pool_free(&self, id: PoolId, block: Block) -> KernelResult<()> {
        self.check_alive()?;
        if let Err(err) = self.with_pool(id, |pool| pool.free(block))? {
            log::warn!("pool {} rejected block {:#x}: {}", id, block.address(), err);
            return Err(err);
        }
        self.emit(records::pool::FREE, &id.index().to_le_bytes());
        self.post_or_process(PostEvent::Pool(id));
        Ok(())
    }

    pub fn pool_stats(&self, id: PoolId) -> KernelResult<PoolStats> {
        self.with_pool(id, |pool| pool.stats())
    }

    pub fn pool_block_size(&self, id: PoolId) -> KernelResult<usize> {
        self.with_pool(id, |pool| pool.block_size())
    }

    /// Copies block contents starting at `offset` into `buf`; returns the
    /// number of bytes copied.
    pub fn pool_read(&self, id: PoolId, block: &Block, offset: usize, buf: &mut [u8]) -> KernelResult<usize> {
        self.with_pool(id, |pool| {
            let bytes = pool.block(block)?;
            let src = bytes.get(offset..).ok_or(KernelError::Parameter)?;
            let len = src.len().min(buf.len());
            buf[..len].copy_from_slice(&src[..len]);
            Ok(len)
        })?
    }

    pub fn pool_write(&self, id: PoolId, block: &Block, offset: usize, data: &[u8]) -> KernelResult<()> {
        self.with_pool(id, |pool| {
            let bytes = pool.block_mut(block)?;
            let end = offset.checked_add(data.len()).ok_or(KernelError::Parameter)?;
            let dst = bytes.get_mut(offset..end).ok_or(KernelError::Parameter)?;
            dst.copy_from_slice(data);
            Ok(())
        })?
    }

    pub fn pool_delete(&self, id: PoolId) -> KernelResult<()> {
        self.thread_context()?;
        self.with_state(|st| {
            let mut cb = st.pools.remove(id.key())?;
            self.pool_leaves.at(id.index())?.unbind();
            while let Some(waiter) = cb.waiters.pop_front(&mut st.threads) {
                self.wake(st, waiter, Err(KernelError::Deleted));
            }
            self.emit(records::pool::DELETE, &id.index().to_le_bytes());
            log::debug!("pool '{}' deleted", cb.name);
            Ok(())
        })
    }

    /// Hands free blocks to waiters, highest priority first.
    pub(crate) fn pool_wake(&self, st: &mut KernelState, id: PoolId) {
        loop {
            let Ok(cb) = st.pools.get_mut(id.key()) else {
                return;
            };
            let Some(head) = cb.waiters.front() else {
                return;
            };
            let Ok(Some(block)) = self.with_pool(id, MemoryPool::alloc) else {
                return;
            };
            cb.waiters.remove(&mut st.threads, head);
            self.wake(st, head, Ok(WaitValue::Block(block)));
        }
    }
}
