// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tunnel portal: streaming bulk data through one shared buffer.
//!
//! A tunnel moves data that does not fit in a message buffer by pumping
//! it one chunk at a time through a single shared buffer. The OPEN
//! message carries a semaphore pair; afterwards the exchange is not
//! involved at all, and the two sides strictly alternate: the client
//! fills (or requests) a chunk and signals the server, the server
//! consumes (or produces) and signals back. The first chunk of a
//! transfer carries start-of-data, the chunk that satisfies the request
//! carries end-of-data, each exactly once.
//!
//! A server owns at most one session, opened only by a partition on
//! its boot-time permitted-clients list; anyone else's message is
//! dropped with an access violation logged. A second permitted
//! client's OPEN simply waits on the exchange until the first session
//! closes. If a serving
//! partition stalls past its stall timeout, the server force-closes the
//! session and leaves a server-timeout error in the shared header for
//! the client's next call to trip over; only the stalled session is
//! affected.
//!
//! # Aliasing
//!
//! Both ends hold the same buffer. Each side materializes a reference
//! to it only inside its own window of the alternation (between its
//! semaphore wait and its signal), which is what makes the raw-pointer
//! sharing below sound.

use crate::errmgr::{ErrorManager, SessionError};
use crate::sync::{Envelope, Exchange, SemTable, Semaphore};
use abi::{
    OwnerId, PortalError, Timeout, TunnelCmd, TunnelFlags, TunnelHeader,
    TunnelOpenInfo, TUNNEL_MSG_TYPE,
};
use zerocopy::{FromBytes, IntoBytes};

/// The session buffer, shared by both ends.
#[derive(Copy, Clone)]
struct SharedRange {
    ptr: *mut u8,
    len: usize,
}

// Safety: access is alternated by the session's semaphore pair; each
// side touches the range only inside its own window.
unsafe impl Send for SharedRange {}

impl SharedRange {
    fn from_buf(buf: &'static mut [u8]) -> Self {
        Self { ptr: buf.as_mut_ptr(), len: buf.len() }
    }

    /// # Safety
    ///
    /// Caller must be inside its alternation window: the other end is
    /// parked on its semaphore and holds no reference.
    unsafe fn bytes(&self) -> &'static mut [u8] {
        // Safety: see above; the range itself is pool memory with
        // 'static lifetime.
        unsafe { core::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TunnelError {
    NotOpen,
    AlreadyOpen,
    /// Sizes that cannot hold the header stack, or exceed the buffer.
    BadSize,
    /// The bounded wait for the peer expired. Recoverable; distinct
    /// from every protocol error.
    Timeout,
    ExchangeFull,
    /// Protocol error reported by the server, also attached to this
    /// session in the error manager.
    Protocol(PortalError),
}

#[derive(Copy, Clone)]
struct ClientSession {
    shared: SharedRange,
    msg_size: usize,
    header_size: usize,
}

impl ClientSession {
    fn capacity(&self) -> usize {
        self.msg_size - self.header_size
    }
}

pub struct TunnelClient {
    name: &'static str,
    id: OwnerId,
    server: &'static dyn Exchange,
    /// Signaled by the server; the client waits here.
    client_sem: &'static dyn Semaphore,
    /// Signaled by the client; the server waits there.
    server_sem: &'static dyn Semaphore,
    /// Scheduler handles for the pair, carried in OPEN.
    client_handle: u32,
    server_handle: u32,
    timeout: Timeout,
    session: Option<ClientSession>,
    pub errors: SessionError,
}

impl TunnelClient {
    pub fn new(
        name: &'static str,
        id: OwnerId,
        server: &'static dyn Exchange,
        client_sem: &'static dyn Semaphore,
        client_handle: u32,
        server_sem: &'static dyn Semaphore,
        server_handle: u32,
        timeout: Timeout,
    ) -> Self {
        Self {
            name,
            id,
            server,
            client_sem,
            server_sem,
            client_handle,
            server_handle,
            timeout,
            session: None,
            errors: SessionError::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Opens a session over `buf`: composes the OPEN message (semaphore
    /// handles plus sizes) in it, queues it to the server, and waits
    /// for the server's acknowledgment signal.
    pub fn open(
        &mut self,
        buf: &'static mut [u8],
        msg_size: usize,
        header_size: usize,
    ) -> Result<(), TunnelError> {
        if self.session.is_some() {
            return Err(TunnelError::AlreadyOpen);
        }
        if header_size < TunnelHeader::SIZE + TunnelOpenInfo::SIZE
            || msg_size <= header_size
            || buf.len() < msg_size
        {
            return Err(TunnelError::BadSize);
        }

        let hdr = TunnelHeader {
            kind: TUNNEL_MSG_TYPE,
            cmd: TunnelCmd::Open as u8,
            flags: 0,
            error: 0,
            data_size: 0,
            requested: 0,
            completed: 0,
        };
        let info = TunnelOpenInfo {
            client_sem: self.client_handle,
            server_sem: self.server_handle,
            header_size: header_size as u32,
            msg_size: msg_size as u32,
        };
        if hdr.write_to_prefix(buf).is_err()
            || info.write_to_prefix(&mut buf[TunnelHeader::SIZE..]).is_err()
        {
            return Err(TunnelError::BadSize);
        }

        let shared = SharedRange::from_buf(buf);
        self.client_sem.reset();
        // Safety: the server has not seen the buffer yet; we are the
        // only accessor until the envelope is queued.
        let buf = unsafe { shared.bytes() };
        self.server
            .send(Envelope { from: self.id, buf })
            .map_err(|_| TunnelError::ExchangeFull)?;

        if !self.client_sem.wait(self.timeout) {
            // Half-built: the server may still open its side; its stall
            // sweep will tear that down.
            return Err(TunnelError::Timeout);
        }
        self.session = Some(ClientSession { shared, msg_size, header_size });
        Ok(())
    }

    /// Checks for an error the server left in the shared header while
    /// we were away, which is how a force-close reaches us.
    fn pending(
        &mut self,
        s: &ClientSession,
        errors: &mut ErrorManager,
    ) -> Result<(), TunnelError> {
        // Safety: the server is either parked or has dropped the
        // session entirely; either way it holds no reference now.
        let buf = unsafe { s.shared.bytes() };
        let Ok((hdr, _)) = TunnelHeader::mut_from_prefix(buf) else {
            return Ok(());
        };
        let Some(err) = PortalError::from_wire(hdr.error) else {
            return Ok(());
        };
        hdr.error = 0;
        if err == PortalError::ServerTimeout {
            // The session is gone server-side; drop ours too.
            self.session = None;
            self.client_sem.reset();
        }
        errors.report(self.name, &mut self.errors, err);
        Err(TunnelError::Protocol(err))
    }

    /// Streams `data` to the server, one buffer-sized chunk per round.
    pub fn send(
        &mut self,
        data: &[u8],
        errors: &mut ErrorManager,
    ) -> Result<(), TunnelError> {
        let s = self.session.ok_or(TunnelError::NotOpen)?;
        self.pending(&s, errors)?;

        let cap = s.capacity();
        let mut sent = 0;
        while sent < data.len() {
            let n = cap.min(data.len() - sent);
            let mut flags = TunnelFlags::empty();
            if sent == 0 {
                flags |= TunnelFlags::START_OF_DATA;
            }
            if sent + n == data.len() {
                flags |= TunnelFlags::END_OF_DATA;
            }

            {
                // Safety: our window; the server is parked on its
                // semaphore.
                let buf = unsafe { s.shared.bytes() };
                let hdr = TunnelHeader {
                    kind: TUNNEL_MSG_TYPE,
                    cmd: TunnelCmd::Send as u8,
                    flags: flags.bits(),
                    error: 0,
                    data_size: n as u32,
                    requested: data.len() as u32,
                    completed: sent as u32,
                };
                if hdr.write_to_prefix(buf).is_err() {
                    return Err(TunnelError::BadSize);
                }
                buf[s.header_size..s.header_size + n]
                    .copy_from_slice(&data[sent..sent + n]);
            }

            self.server_sem.signal();
            if !self.client_sem.wait(self.timeout) {
                return Err(TunnelError::Timeout);
            }
            self.pending(&s, errors)?;
            sent += n;
        }
        Ok(())
    }

    /// Pulls bytes from the server until `out` is full or the server
    /// marks end-of-data. Returns the byte count received.
    pub fn receive(
        &mut self,
        out: &mut [u8],
        errors: &mut ErrorManager,
    ) -> Result<usize, TunnelError> {
        let s = self.session.ok_or(TunnelError::NotOpen)?;
        self.pending(&s, errors)?;

        let cap = s.capacity();
        let mut got = 0;
        loop {
            {
                // Safety: our window.
                let buf = unsafe { s.shared.bytes() };
                let hdr = TunnelHeader {
                    kind: TUNNEL_MSG_TYPE,
                    cmd: TunnelCmd::Receive as u8,
                    flags: 0,
                    error: 0,
                    data_size: cap.min(out.len() - got) as u32,
                    requested: out.len() as u32,
                    completed: got as u32,
                };
                if hdr.write_to_prefix(buf).is_err() {
                    return Err(TunnelError::BadSize);
                }
            }

            self.server_sem.signal();
            if !self.client_sem.wait(self.timeout) {
                return Err(TunnelError::Timeout);
            }
            self.pending(&s, errors)?;

            // Safety: our window again; the server signaled.
            let buf = unsafe { s.shared.bytes() };
            let Ok((hdr, _)) = TunnelHeader::ref_from_prefix(&buf[..]) else {
                return Err(TunnelError::BadSize);
            };
            let n = (hdr.data_size as usize).min(out.len() - got);
            out[got..got + n].copy_from_slice(&buf[s.header_size..s.header_size + n]);
            got += n;

            let eod = TunnelFlags::from_bits_truncate(hdr.flags)
                .contains(TunnelFlags::END_OF_DATA);
            if eod || got >= out.len() || n == 0 {
                return Ok(got);
            }
        }
    }

    /// Closes the session. Idempotent; a close on a closed session does
    /// nothing.
    pub fn close(&mut self) {
        let Some(s) = self.session.take() else {
            return;
        };
        {
            // Safety: our window.
            let buf = unsafe { s.shared.bytes() };
            let hdr = TunnelHeader {
                kind: TUNNEL_MSG_TYPE,
                cmd: TunnelCmd::Close as u8,
                flags: 0,
                error: 0,
                data_size: 0,
                requested: 0,
                completed: 0,
            };
            let _ = hdr.write_to_prefix(buf);
        }
        self.server_sem.signal();
        // Ack may never come if the server already force-closed.
        let _ = self.client_sem.wait(self.timeout);
        self.client_sem.reset();
    }
}

/// What one `serve_one` call did.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ServeEvent {
    Opened,
    /// One SEND/RECEIVE/CONTROL phase completed.
    Progress,
    Closed,
    /// The serving partition stalled; the session was force-closed.
    StallClosed,
    /// A message was dropped without opening a session.
    Rejected,
}

/// Application logic behind a tunnel server: a sink for SEND traffic
/// and a source for RECEIVE traffic.
pub trait TunnelService {
    /// Accepts a chunk, returning how many bytes were consumed. Short
    /// consumption is a protocol error charged to the session.
    fn consume(&mut self, chunk: &[u8], sod: bool, eod: bool) -> usize;

    /// Fills `out`, returning how many bytes were produced.
    fn produce(&mut self, out: &mut [u8]) -> usize;
}

struct Session {
    shared: SharedRange,
    header_size: usize,
    client_sem: u32,
    server_sem: u32,
    completed: u32,
}

pub struct TunnelServer {
    name: &'static str,
    exchange: &'static dyn Exchange,
    sems: &'static dyn SemTable,
    /// Partitions allowed to open a session, fixed at boot.
    permitted: &'static [OwnerId],
    /// Bound on how long the serving side may sit in one phase before
    /// the session is declared dead.
    stall: Timeout,
    session: Option<Session>,
    pub errors: SessionError,
}

impl TunnelServer {
    pub fn new(
        name: &'static str,
        exchange: &'static dyn Exchange,
        sems: &'static dyn SemTable,
        permitted: &'static [OwnerId],
        stall: Timeout,
    ) -> Self {
        Self {
            name,
            exchange,
            sems,
            permitted,
            stall,
            session: None,
            errors: SessionError::new(),
        }
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Waits for a new session. The sender check comes before any
    /// parsing; after it, anything other than a well-formed OPEN is
    /// dropped with an error logged. OPEN binds the semaphore pair and
    /// acknowledges the client.
    fn accept(&mut self, errors: &mut ErrorManager) -> ServeEvent {
        let Some(env) = self.exchange.receive(Timeout::Forever) else {
            return ServeEvent::Rejected;
        };
        if !self.permitted.contains(&env.from) {
            errors.report(self.name, &mut self.errors, PortalError::AccessViolation);
            return ServeEvent::Rejected;
        }
        let buf = env.buf;

        let parsed = (|| {
            let (hdr, rest) = TunnelHeader::ref_from_prefix(&buf[..]).ok()?;
            if hdr.kind != TUNNEL_MSG_TYPE {
                return None;
            }
            let cmd = TunnelCmd::try_from(hdr.cmd).ok();
            let (info, _) = TunnelOpenInfo::ref_from_prefix(rest).ok()?;
            Some((cmd, *info))
        })();

        let Some((cmd, info)) = parsed else {
            errors.report(self.name, &mut self.errors, PortalError::InvalidType);
            return ServeEvent::Rejected;
        };
        if cmd != Some(TunnelCmd::Open) {
            // OPEN is required first; nothing else can start a session.
            errors.report(self.name, &mut self.errors, PortalError::InvalidCommand);
            return ServeEvent::Rejected;
        }

        let header_size = info.header_size as usize;
        let msg_size = info.msg_size as usize;
        if header_size < TunnelHeader::SIZE + TunnelOpenInfo::SIZE
            || msg_size <= header_size
            || msg_size > buf.len()
        {
            errors.report(self.name, &mut self.errors, PortalError::InvalidType);
            return ServeEvent::Rejected;
        }
        let Some(client_sem) = self.sems.get(info.client_sem) else {
            errors.report(self.name, &mut self.errors, PortalError::InvalidType);
            return ServeEvent::Rejected;
        };
        if self.sems.get(info.server_sem).is_none() {
            errors.report(self.name, &mut self.errors, PortalError::InvalidType);
            return ServeEvent::Rejected;
        }

        self.session = Some(Session {
            shared: SharedRange::from_buf(buf),
            header_size,
            client_sem: info.client_sem,
            server_sem: info.server_sem,
            completed: 0,
        });
        client_sem.signal();
        ServeEvent::Opened
    }

    /// Tears the session down after a stall, leaving the error where
    /// the client's next call will find it.
    fn force_close(&mut self, errors: &mut ErrorManager) -> ServeEvent {
        if let Some(s) = self.session.take() {
            // Safety: the client is parked on its semaphore or gone; it
            // gets no signal from us, so it cannot enter its window
            // before reading this.
            let buf = unsafe { s.shared.bytes() };
            if let Ok((hdr, _)) = TunnelHeader::mut_from_prefix(buf) {
                hdr.error = PortalError::ServerTimeout as u8;
            }
            if let Some(sem) = self.sems.get(s.server_sem) {
                sem.reset();
            }
            if let Some(sem) = self.sems.get(s.client_sem) {
                sem.reset();
            }
        }
        self.exchange.flush();
        errors.report(self.name, &mut self.errors, PortalError::ServerTimeout);
        ServeEvent::StallClosed
    }

    /// Executes exactly one protocol phase: accepts an OPEN when no
    /// session exists, otherwise waits (bounded by the stall timeout)
    /// for the client's next command and performs it.
    pub fn serve_one(
        &mut self,
        svc: &mut dyn TunnelService,
        errors: &mut ErrorManager,
    ) -> ServeEvent {
        if self.session.is_none() {
            return self.accept(errors);
        }

        let (server_sem, client_sem) = {
            let s = self.session.as_ref().and_then(|s| {
                Some((self.sems.get(s.server_sem)?, self.sems.get(s.client_sem)?))
            });
            match s {
                Some(pair) => pair,
                // Handles were valid at open; if they vanished the
                // session cannot continue.
                None => return self.force_close(errors),
            }
        };

        if !server_sem.wait(self.stall) {
            return self.force_close(errors);
        }

        let Some(s) = self.session.as_mut() else {
            return ServeEvent::Rejected;
        };
        // Safety: the client signaled and is now parked; this is our
        // window.
        let buf = unsafe { s.shared.bytes() };
        let Ok((hdr, rest)) = TunnelHeader::mut_from_prefix(buf) else {
            errors.report(self.name, &mut self.errors, PortalError::InvalidType);
            client_sem.signal();
            return ServeEvent::Progress;
        };
        let payload = &mut rest[s.header_size - TunnelHeader::SIZE..];

        match TunnelCmd::try_from(hdr.cmd) {
            Ok(TunnelCmd::Send) => {
                let n = (hdr.data_size as usize).min(payload.len());
                let flags = TunnelFlags::from_bits_truncate(hdr.flags);
                let taken = svc.consume(
                    &payload[..n],
                    flags.contains(TunnelFlags::START_OF_DATA),
                    flags.contains(TunnelFlags::END_OF_DATA),
                );
                if taken < n {
                    hdr.error = PortalError::TransIncomplete as u8;
                    errors.report(
                        self.name,
                        &mut self.errors,
                        PortalError::TransIncomplete,
                    );
                } else {
                    s.completed += n as u32;
                    // Per-transfer progress; the client wrote its count
                    // so far into `completed` before signaling.
                    hdr.completed += n as u32;
                }
                client_sem.signal();
                ServeEvent::Progress
            }
            Ok(TunnelCmd::Receive) => {
                let want = (hdr.data_size as usize).min(payload.len());
                let n = svc.produce(&mut payload[..want]);
                s.completed += n as u32;
                hdr.data_size = n as u32;
                // As with SEND, `completed` tracks this transfer, not
                // the session.
                hdr.completed += n as u32;
                if hdr.completed >= hdr.requested {
                    hdr.flags =
                        (TunnelFlags::from_bits_truncate(hdr.flags)
                            | TunnelFlags::END_OF_DATA)
                            .bits();
                }
                client_sem.signal();
                ServeEvent::Progress
            }
            Ok(TunnelCmd::Close) => {
                // A queued message from before the close must never be
                // misread as part of a future session.
                self.exchange.flush();
                server_sem.reset();
                client_sem.reset();
                client_sem.signal();
                self.session = None;
                ServeEvent::Closed
            }
            Ok(TunnelCmd::Control) => {
                // Status query: report progress, change nothing.
                hdr.completed = s.completed;
                client_sem.signal();
                ServeEvent::Progress
            }
            Ok(TunnelCmd::Open) | Err(()) => {
                hdr.error = PortalError::InvalidCommand as u8;
                errors.report(self.name, &mut self.errors, PortalError::InvalidCommand);
                client_sem.signal();
                ServeEvent::Progress
            }
        }
    }
}
