//! Per-connection request dispatch.
//!
//! A [`Session`] turns decoded requests into store calls and remembers which
//! descriptors its peer already holds. Every reply is followed by the
//! descriptors the peer has not seen yet on this connection, and says how
//! many there are:
//!
//! ```text
//! client                                  server
//!   │ ── [len][create_buffer_request] ──▶   │
//!   │ ◀── [len][create_buffer_reply] ────   │   "fds": 1
//!   │ ◀── [1] + SCM_RIGHTS(segment fd) ──   │   first time only
//!   │ ── [len][create_buffer_request] ──▶   │
//!   │ ◀── [len][create_buffer_reply] ────   │   "fds": 0
//! ```
//!
//! Descriptors are remembered by number and inode, so a recycled fd number
//! that now names a different arena is sent again.

use crate::error::{Error, Result};
use crate::memory::ipc::{read_message, send_fds, write_message};
use crate::object_id::ObjectId;
use crate::observability::{TracingConfig, span_request, span_session, trace_request_failed};
use crate::payload::{NO_FD, Payload};
use crate::protocol::{Reply, Request, decode_request, encode_reply};
use crate::store::BulkStore;
use rustix::fd::OwnedFd;
use std::collections::HashSet;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::Span;

/// Global counter for generating unique session IDs.
static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// A reply plus the descriptors that must follow it.
///
/// `reply.fd_count()` always equals `fds.len()`.
#[derive(Debug)]
pub struct Response {
    /// The reply message.
    pub reply: Reply,
    /// Descriptors to send after the reply, in order.
    pub fds: Vec<OwnedFd>,
}

impl Response {
    fn new(reply: Reply, fds: Vec<OwnedFd>) -> Self {
        Self {
            reply: reply.with_fds(fds.len()),
            fds,
        }
    }

    fn reply(reply: Reply) -> Self {
        Self::new(reply, Vec::new())
    }
}

/// One client connection's view of the store.
pub struct Session {
    id: u64,
    store: Arc<BulkStore>,
    sent_fds: HashSet<(RawFd, u64)>,
    tracing: TracingConfig,
}

impl Session {
    /// Start a session on `store`.
    pub fn new(store: Arc<BulkStore>) -> Self {
        Self::with_tracing(store, TracingConfig::default())
    }

    /// Start a session with explicit span settings.
    pub fn with_tracing(store: Arc<BulkStore>, tracing: TracingConfig) -> Self {
        Self {
            id: SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            store,
            sent_fds: HashSet::new(),
            tracing,
        }
    }

    /// Unique id of this session.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Run one request.
    ///
    /// Failures become error replies and are logged; they never end the
    /// session.
    pub fn handle(&mut self, request: Request) -> Response {
        let kind = request.kind();
        let span = if self.tracing.request_spans {
            span_request(kind)
        } else {
            Span::none()
        };
        let _guard = span.enter();

        match self.dispatch(request) {
            Ok(response) => response,
            Err(e) => {
                trace_request_failed(kind, &e);
                Response::reply(Reply::from_error(&e))
            }
        }
    }

    /// Decode and run one request.
    pub fn handle_message(&mut self, text: &str) -> Response {
        match decode_request(text) {
            Ok(request) => self.handle(request),
            Err(e) => {
                let e = Error::Invalid(format!("failed to decode request: {e}"));
                trace_request_failed("unknown", &e);
                Response::reply(Reply::from_error(&e))
            }
        }
    }

    /// Serve framed requests on `socket` until the peer closes it.
    pub fn serve(&mut self, socket: &UnixStream) -> Result<()> {
        let span = if self.tracing.session_spans {
            span_session(self.id)
        } else {
            Span::none()
        };
        let _guard = span.enter();
        tracing::debug!(session = self.id, "session started");

        while let Some(body) = read_message(socket)? {
            let response = match std::str::from_utf8(&body) {
                Ok(text) => self.handle_message(text),
                Err(e) => {
                    let e = Error::Invalid(format!("request is not UTF-8: {e}"));
                    trace_request_failed("unknown", &e);
                    Response::reply(Reply::from_error(&e))
                }
            };

            write_message(socket, encode_reply(&response.reply)?.as_bytes())?;
            send_fds(socket, &response.fds)?;
        }

        tracing::debug!(session = self.id, "session closed");
        Ok(())
    }

    fn dispatch(&mut self, request: Request) -> Result<Response> {
        let store = Arc::clone(&self.store);
        let response = match request {
            Request::CreateBuffer {
                size,
                external_id,
                external_size,
            } => {
                let payload = match external_id {
                    Some(external_id) => {
                        store.create_external(size, external_id, external_size.unwrap_or(size))?
                    }
                    None => store.create(size)?,
                };
                let fds = self.unsent_fds(std::slice::from_ref(&payload))?;
                let reply = Reply::CreateBuffer {
                    id: payload.object_id,
                    created: Payload::clone(&payload),
                    fds: 0,
                };
                Response::new(reply, fds)
            }
            Request::GetBuffers { ids } => {
                let payloads = store.get_many(&ids);
                self.payloads_response(&payloads)?
            }
            Request::GetBuffersByExternal { external_ids } => {
                let payloads = store.get_by_external(&external_ids);
                self.payloads_response(&payloads)?
            }
            Request::DropBuffer { id } => {
                store.delete(id)?;
                Response::reply(Reply::DropBuffer)
            }
            Request::Exists { id } => Response::reply(Reply::Exists {
                exists: store.exists(id),
            }),
            Request::MakeArena { size } => {
                let arena = store.make_arena(size)?;
                let fd = store.duplicate_fd(arena.fd)?;
                self.mark_sent(arena.fd, &fd)?;
                Response::new(Reply::from_arena(&arena), vec![fd])
            }
            Request::FinalizeArena { fd, offsets, sizes } => {
                store.finalize_arena(fd, &offsets, &sizes)?;
                Response::reply(Reply::FinalizeArena)
            }
            Request::Clear => {
                store.clear()?;
                Response::reply(Reply::Clear)
            }
        };
        Ok(response)
    }

    fn payloads_response(&mut self, payloads: &[Arc<Payload>]) -> Result<Response> {
        let fds = self.unsent_fds(payloads)?;
        let reply = Reply::GetBuffers {
            payloads: payloads.iter().map(|p| Payload::clone(p)).collect(),
            fds: 0,
        };
        Ok(Response::new(reply, fds))
    }

    /// Duplicates of the payloads' descriptors this peer has not received.
    fn unsent_fds(&mut self, payloads: &[Arc<Payload>]) -> Result<Vec<OwnedFd>> {
        let mut fds = Vec::new();
        let mut seen = HashSet::new();
        for payload in payloads {
            if payload.fd == NO_FD || payload.object_id == ObjectId::EMPTY_BLOB {
                continue;
            }
            if !seen.insert(payload.fd) {
                continue;
            }
            let fd = self.store.duplicate_fd(payload.fd)?;
            if self.mark_sent(payload.fd, &fd)? {
                fds.push(fd);
            }
        }
        Ok(fds)
    }

    /// Remember that `fd` (a duplicate of `raw`) goes to the peer. Returns
    /// false if the peer already has it.
    fn mark_sent(&mut self, raw: RawFd, fd: &OwnedFd) -> Result<bool> {
        let inode = rustix::fs::fstat(fd)?.st_ino;
        Ok(self.sent_fds.insert((raw, inode as u64)))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("sent_fds", &self.sent_fds.len())
            .finish()
    }
}
