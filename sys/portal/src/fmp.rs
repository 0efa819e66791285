// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Free-message portal: request/reply over pooled buffers.
//!
//! The client allocates a dynamic region at open, installs it in its
//! own protection table, and carves it into a private pool of message
//! buffers. A call is: take a buffer, compose a [`ServiceHeader`] (and
//! payload) in it, hand it to the server's exchange, and block for the
//! reply, which the server writes into the *same* buffer. No copying,
//! no kernel-held message state.
//!
//! The server's only access-control mechanism is its permitted-clients
//! list, fixed at boot. A well-formed message from a partition not on
//! the list is rejected before any handler runs.

use crate::errmgr::{ErrorManager, SessionError};
use crate::pool::BufferPool;
use crate::sync::{Envelope, Exchange, Semaphore};
use abi::{OwnerId, PortalError, RegionAttributes, ServiceHeader, Timeout};
use kern::heap::{HeapBlock, KernelHeap};
use kern::region::{self, RegionDesc, RegionError};
use kern::task::Task;
use zerocopy::FromBytes;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FmpError {
    NotOpen,
    AlreadyOpen,
    /// Slot does not exist in the owner's table, or is the reserved
    /// stack slot.
    BadSlot,
    /// Message size cannot hold a service header, or is not
    /// header-aligned.
    BadSize,
    Region(RegionError),
    Timeout,
    ExchangeFull,
}

impl From<RegionError> for FmpError {
    fn from(e: RegionError) -> Self {
        Self::Region(e)
    }
}

struct OpenState {
    pool: BufferPool,
    block: HeapBlock,
    slot: usize,
}

/// Client end of a free-message portal. One per client partition, per
/// portal.
pub struct FmpClient {
    name: &'static str,
    id: OwnerId,
    server: &'static dyn Exchange,
    /// Signaled by the server when a reply is in the buffer.
    reply: &'static dyn Semaphore,
    /// Counts free pool buffers; lets `receive` block for one.
    pool_sem: &'static dyn Semaphore,
    timeout: Timeout,
    state: Option<OpenState>,
    /// Most recently acquired, not yet sent or released, buffer.
    held: Option<*mut u8>,
    pub errors: SessionError,
}

impl FmpClient {
    pub fn new(
        name: &'static str,
        id: OwnerId,
        server: &'static dyn Exchange,
        reply: &'static dyn Semaphore,
        pool_sem: &'static dyn Semaphore,
        timeout: Timeout,
    ) -> Self {
        Self {
            name,
            id,
            server,
            reply,
            pool_sem,
            timeout,
            state: None,
            held: None,
            errors: SessionError::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.is_some()
    }

    /// Opens the portal: allocates a dynamic region big enough for
    /// `msg_count` buffers of `msg_size` bytes, installs it in slot
    /// `slot` of the caller's protection table, and arms the pool.
    pub fn open(
        &mut self,
        task: &mut Task,
        slot: usize,
        msg_size: usize,
        msg_count: usize,
        heap: &mut dyn KernelHeap,
    ) -> Result<(), FmpError> {
        if self.state.is_some() {
            return Err(FmpError::AlreadyOpen);
        }
        if msg_size < ServiceHeader::SIZE
            || msg_size % core::mem::align_of::<ServiceHeader>() != 0
            || msg_count == 0
        {
            return Err(FmpError::BadSize);
        }
        {
            let table = task.table_mut().ok_or(FmpError::BadSlot)?;
            if slot >= table.len() - 1 {
                return Err(FmpError::BadSlot);
            }
        }

        // The pool must be exactly `msg_count` blocks; a total that
        // wraps would build a region smaller than the pool claims.
        let total = msg_size
            .checked_mul(msg_count)
            .and_then(|t| u32::try_from(t).ok())
            .ok_or(FmpError::BadSize)?;

        let (block, desc) = region::build_from_heap(
            heap,
            total,
            RegionAttributes::READ | RegionAttributes::WRITE,
            region::active_scheme(),
            self.name,
        )?;

        // Both checks above passed, so this cannot fail.
        if let Some(table) = task.table_mut() {
            table.set_slot(slot, desc);
        }

        // Safety: the block was allocated just now for this pool and
        // ownership of it sits in `state` until close.
        let pool = unsafe { BufferPool::new(block.ptr(), msg_size, msg_count) };

        self.pool_sem.reset();
        for _ in 0..msg_count {
            self.pool_sem.signal();
        }
        self.state = Some(OpenState { pool, block, slot });
        Ok(())
    }

    /// Takes a free buffer from the private pool, blocking up to
    /// `timeout` for one to come back if all are out.
    pub fn receive(&mut self, timeout: Timeout) -> Option<&'static mut [u8]> {
        let state = self.state.as_mut()?;
        if !self.pool_sem.wait(timeout) {
            return None;
        }
        let buf = state.pool.acquire()?;
        self.held = Some(buf.as_mut_ptr());
        Some(buf)
    }

    /// Hands `buf` to the server. With `want_reply`, blocks until the
    /// server has written its reply into the buffer and returns it.
    /// Without, ownership of the buffer passes to the server.
    pub fn send(
        &mut self,
        buf: &'static mut [u8],
        want_reply: bool,
    ) -> Result<Option<&'static mut [u8]>, FmpError> {
        if self.state.is_none() {
            return Err(FmpError::NotOpen);
        }
        let (ptr, len) = (buf.as_mut_ptr(), buf.len());
        if self.held == Some(ptr) {
            self.held = None;
        }
        self.server
            .send(Envelope { from: self.id, buf })
            .map_err(|_| FmpError::ExchangeFull)?;
        if !want_reply {
            return Ok(None);
        }
        if !self.reply.wait(self.timeout) {
            return Err(FmpError::Timeout);
        }
        // Safety: the reply signal is the server's hand-back; it keeps
        // no reference to the buffer after signaling, so we are the
        // only accessor again.
        let buf = unsafe { core::slice::from_raw_parts_mut(ptr, len) };
        Ok(Some(buf))
    }

    /// Returns a finished buffer to the pool.
    pub fn release(&mut self, buf: &'static mut [u8]) {
        if self.held == Some(buf.as_mut_ptr()) {
            self.held = None;
        }
        if let Some(state) = self.state.as_mut() {
            state.pool.release(buf);
            self.pool_sem.signal();
        }
    }

    /// Closes the portal: the pool region is freed (which releases any
    /// held buffer with it), the table slot is disabled, and the open
    /// flag clears.
    pub fn close(&mut self, task: &mut Task, heap: &mut dyn KernelHeap) {
        let Some(state) = self.state.take() else {
            return;
        };
        self.held = None;
        if let Some(table) = task.table_mut() {
            table.set_slot(state.slot, RegionDesc::DISABLED);
        }
        heap.free(state.block);
        self.pool_sem.reset();
    }
}

/// One boot-time-authorized client of a server.
pub struct PermittedClient {
    pub id: OwnerId,
    /// The client's reply semaphore; the server signals it to complete
    /// a call.
    pub reply: &'static dyn Semaphore,
}

/// Application handler behind a server. Returns `None` for a function
/// id it does not implement.
pub trait Service {
    fn handle(&mut self, fid: u32, params: &[u32; 4], payload: &mut [u8]) -> Option<u32>;
}

/// Server end of a free-message portal.
pub struct FmpServer {
    name: &'static str,
    exchange: &'static dyn Exchange,
    permitted: &'static [PermittedClient],
    pub errors: SessionError,
}

impl FmpServer {
    pub fn new(
        name: &'static str,
        exchange: &'static dyn Exchange,
        permitted: &'static [PermittedClient],
    ) -> Self {
        Self { name, exchange, permitted, errors: SessionError::new() }
    }

    /// Serves one message, if one arrives within `timeout`. Returns
    /// whether a message was taken off the exchange.
    ///
    /// The sender check runs before anything else: a message from a
    /// partition not on the permitted list is dropped unanswered, with
    /// an access violation logged. No handler ever sees it.
    pub fn serve_one(
        &mut self,
        svc: &mut dyn Service,
        errors: &mut ErrorManager,
        timeout: Timeout,
    ) -> bool {
        let Some(mut env) = self.exchange.receive(timeout) else {
            return false;
        };
        let Some(pc) = self.permitted.iter().find(|p| p.id == env.from) else {
            errors.report(self.name, &mut self.errors, PortalError::AccessViolation);
            return true;
        };
        let Ok((hdr, payload)) = ServiceHeader::mut_from_prefix(&mut env.buf[..]) else {
            errors.report(self.name, &mut self.errors, PortalError::InvalidType);
            pc.reply.signal();
            return true;
        };
        match svc.handle(hdr.fid, &hdr.params, payload) {
            Some(ret) => hdr.ret = ret,
            None => {
                hdr.ret = 0;
                errors.report(self.name, &mut self.errors, PortalError::InvalidFunction);
            }
        }
        // Reply is in place; wake the caller.
        pc.reply.signal();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::test_support::{TestExchange, TestSem};
    use kern::table;
    use kern::template::{Template, TemplateEntry};
    use std::collections::HashMap;
    use std::ptr::NonNull;
    use zerocopy::IntoBytes;

    /// Real-memory heap so pool buffers can be written through.
    struct TestHeap {
        live: usize,
        layouts: HashMap<usize, std::alloc::Layout>,
    }

    impl TestHeap {
        fn new() -> Self {
            Self { live: 0, layouts: HashMap::new() }
        }
    }

    impl KernelHeap for TestHeap {
        fn allocate(
            &mut self,
            size: usize,
            align: usize,
        ) -> Result<HeapBlock, kern::heap::HeapError> {
            let layout = std::alloc::Layout::from_size_align(size.max(1), align)
                .map_err(|_| kern::heap::HeapError::BadLayout)?;
            // Safety: nonzero size.
            let p = unsafe { std::alloc::alloc(layout) };
            let ptr = NonNull::new(p).ok_or(kern::heap::HeapError::Exhausted)?;
            self.layouts.insert(p as usize, layout);
            self.live += 1;
            // Safety: fresh allocation, uniquely owned.
            Ok(unsafe { HeapBlock::from_raw(ptr, size) })
        }

        fn free(&mut self, block: HeapBlock) {
            let layout = self.layouts.remove(&(block.as_ptr() as usize)).unwrap();
            // Safety: block came from allocate above.
            unsafe { std::alloc::dealloc(block.as_ptr(), layout) };
            self.live -= 1;
        }
    }

    fn stack_region() -> RegionDesc {
        region::build_from_existing(
            0x2000_F000,
            1024,
            RegionAttributes::READ | RegionAttributes::WRITE,
            region::Scheme::PmsaV7,
            "stack",
        )
        .unwrap()
    }

    /// A task with a three-slot table whose slot 1 is free for the pool
    /// region.
    fn client_task(heap: &mut TestHeap) -> Vec<Task> {
        let mut tasks = vec![
            Task::new(0, true, true, stack_region()),
            Task::new(1, false, false, stack_region()),
        ];
        let entries = [TemplateEntry::Fixed(stack_region())];
        let t = Template { name: "client", entries: &entries };
        table::create(&mut tasks, 0, 1, &t, 0b1, 3, &[], heap).unwrap();
        tasks
    }

    struct Echo {
        calls: usize,
    }

    impl Service for Echo {
        fn handle(&mut self, fid: u32, params: &[u32; 4], payload: &mut [u8]) -> Option<u32> {
            if fid != 7 {
                return None;
            }
            self.calls += 1;
            payload[0] = payload[0].wrapping_add(1);
            Some(params.iter().sum())
        }
    }

    fn leak<T>(v: T) -> &'static T {
        Box::leak(Box::new(v))
    }

    #[test]
    fn round_trip_reply_lands_in_same_buffer() {
        let exchange: &'static TestExchange = leak(TestExchange::new());
        let reply: &'static TestSem = leak(TestSem::new());
        let pool_sem: &'static TestSem = leak(TestSem::new());
        let mut heap = TestHeap::new();
        let mut tasks = client_task(&mut heap);
        let client_id = tasks[1].current_id();

        let mut client = FmpClient::new(
            "fmp0",
            client_id,
            exchange,
            reply,
            pool_sem,
            Timeout::Ticks(1000),
        );
        client.open(&mut tasks[1], 1, 64, 2, &mut heap).unwrap();
        // The pool region is installed in the table.
        assert!(tasks[1].table().unwrap().slots()[1].is_enabled());

        let permitted: &'static [PermittedClient] =
            Box::leak(vec![PermittedClient { id: client_id, reply }].into_boxed_slice());
        let mut server = FmpServer::new("fmp0", exchange, permitted);

        let buf = client.receive(Timeout::NoWait).unwrap();
        let sent_ptr = buf.as_ptr();
        let hdr = ServiceHeader {
            fid: 7,
            params: [1, 2, 3, 4],
            ret: 0,
            caller: 0,
        };
        buf[..ServiceHeader::SIZE].copy_from_slice(hdr.as_bytes());
        buf[ServiceHeader::SIZE] = 41;

        let server_thread = std::thread::spawn(move || {
            let mut svc = Echo { calls: 0 };
            let mut errors = ErrorManager::new();
            assert!(server.serve_one(&mut svc, &mut errors, Timeout::Forever));
            (svc.calls, errors.records().count())
        });

        let buf = client.send(buf, true).unwrap().unwrap();
        assert_eq!(buf.as_ptr(), sent_ptr);
        let (hdr, payload) = ServiceHeader::mut_from_prefix(&mut buf[..]).unwrap();
        assert_eq!(hdr.fid, 7);
        assert_eq!(hdr.ret, 10);
        assert_eq!(payload[0], 42);

        let (calls, errs) = server_thread.join().unwrap();
        assert_eq!(calls, 1);
        assert_eq!(errs, 0);

        client.release(buf);
        client.close(&mut tasks[1], &mut heap);
        assert!(!client.is_open());
        assert!(!tasks[1].table().unwrap().slots()[1].is_enabled());
        // Table remains; pool region is gone.
        assert_eq!(heap.live, 1);
    }

    #[test]
    fn forged_sender_is_rejected_before_dispatch() {
        let exchange: &'static TestExchange = leak(TestExchange::new());
        let reply: &'static TestSem = leak(TestSem::new());
        let permitted: &'static [PermittedClient] = Box::leak(
            vec![PermittedClient { id: OwnerId::for_index_and_gen(1, abi::Generation::ZERO), reply }]
                .into_boxed_slice(),
        );
        let mut server = FmpServer::new("fmp0", exchange, permitted);

        // Well-formed message, wrong sender.
        let buf = crate::sync::test_support::leak_buf(64);
        let hdr = ServiceHeader { fid: 7, params: [0; 4], ret: 0, caller: 0 };
        buf[..ServiceHeader::SIZE].copy_from_slice(hdr.as_bytes());
        exchange
            .send(Envelope {
                from: OwnerId::for_index_and_gen(9, abi::Generation::ZERO),
                buf,
            })
            .ok()
            .unwrap();

        let mut svc = Echo { calls: 0 };
        let mut errors = ErrorManager::new();
        assert!(server.serve_one(&mut svc, &mut errors, Timeout::NoWait));
        assert_eq!(svc.calls, 0);
        assert_eq!(
            server.errors.take(),
            Some(PortalError::AccessViolation),
        );
    }

    #[test]
    fn pool_exhaustion_times_out_cleanly() {
        let exchange: &'static TestExchange = leak(TestExchange::new());
        let reply: &'static TestSem = leak(TestSem::new());
        let pool_sem: &'static TestSem = leak(TestSem::new());
        let mut heap = TestHeap::new();
        let mut tasks = client_task(&mut heap);
        let id = tasks[1].current_id();

        let mut client =
            FmpClient::new("fmp0", id, exchange, reply, pool_sem, Timeout::NoWait);
        assert_eq!(client.receive(Timeout::NoWait), None);

        client.open(&mut tasks[1], 1, 64, 1, &mut heap).unwrap();
        assert_eq!(
            client.open(&mut tasks[1], 1, 64, 1, &mut heap),
            Err(FmpError::AlreadyOpen),
        );
        let a = client.receive(Timeout::NoWait).unwrap();
        // Only buffer is out.
        assert!(client.receive(Timeout::Ticks(5)).is_none());
        client.release(a);
        assert!(client.receive(Timeout::NoWait).is_some());
    }

    #[test]
    fn open_validates_slot_and_size() {
        let mut heap = TestHeap::new();
        let mut tasks = client_task(&mut heap);
        let id = tasks[1].current_id();
        let exchange: &'static TestExchange = leak(TestExchange::new());
        let reply: &'static TestSem = leak(TestSem::new());
        let pool_sem: &'static TestSem = leak(TestSem::new());
        let mut client =
            FmpClient::new("fmp0", id, exchange, reply, pool_sem, Timeout::NoWait);

        // Stack slot is off limits.
        assert_eq!(
            client.open(&mut tasks[1], 2, 64, 1, &mut heap),
            Err(FmpError::BadSlot),
        );
        // Too small for a header.
        assert_eq!(
            client.open(&mut tasks[1], 1, 16, 1, &mut heap),
            Err(FmpError::BadSize),
        );
        // msg_size * msg_count wraps to 64 in 32 bits; taken at face
        // value this would build a 64-byte region under a pool of
        // sixteen 256 MiB blocks.
        assert_eq!(
            client.open(&mut tasks[1], 1, 268_435_460, 16, &mut heap),
            Err(FmpError::BadSize),
        );
        assert!(!client.is_open());
        // Only the table allocation is live; no pool region leaked.
        assert_eq!(heap.live, 1);
    }
}
