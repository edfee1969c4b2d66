//! AF_UNIX control socket server (spec.md §4.7): crash-safe socket
//! creation, non-blocking multiplexing via `nix::poll` (kept on the
//! teacher's synchronous-thread idiom rather than reaching for an async
//! runtime), and the command table wired to [`crate::manager::Manager`].

use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::{UnixListener, UnixStream};

use isol_core::error::ControlError;
use isol_core::traits::Platform;
use isol_core::{kdebug, kinfo, kwarn, IsolError, IsolResult};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::client::{self, AttachMode, ClientSession, Request};
use crate::manager::Manager;

/// One open control connection: its socket plus framing/session state.
struct ClientConn {
    stream: UnixStream,
    session: ClientSession,
    inbuf: String,
    outbuf: Vec<u8>,
    close_after_flush: bool,
}

/// The control server. Owns the listening socket and the crash-safe
/// lock file's descriptor (held open, never touched again, for the
/// lifetime of the process - releasing it on exit is what lets the next
/// manager detect a stale socket).
pub struct Control {
    listener: UnixListener,
    public_path: String,
    _lock_file: std::fs::File,
    clients: Vec<ClientConn>,
}

impl Control {
    /// Crash-safe bind (spec.md §4.7): acquire `<path>.LCK`, bind under
    /// a pid-suffixed temp name, rename-no-replace onto the public
    /// path; on a losing race, `connect` to the existing path to tell a
    /// live peer from a stale one.
    pub fn bind(path: &str) -> IsolResult<Self> {
        let lock_path = format!("{}.LCK", path);
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| IsolError::Io(format!("cannot open lock file {}: {}", lock_path, e)))?;

        let rc = unsafe { libc::flock(lock_file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(IsolError::SocketInUse);
        }

        let tmp_path = format!("{}.{}", path, std::process::id());
        let _ = std::fs::remove_file(&tmp_path);
        let listener = UnixListener::bind(&tmp_path)
            .map_err(|e| IsolError::Io(format!("cannot bind {}: {}", tmp_path, e)))?;
        listener.set_nonblocking(true)?;

        if rename_no_replace(&tmp_path, path).is_err() {
            if UnixStream::connect(path).is_ok() {
                let _ = std::fs::remove_file(&tmp_path);
                return Err(IsolError::SocketInUse);
            }
            let _ = std::fs::remove_file(path);
            rename_no_replace(&tmp_path, path)
                .map_err(|e| IsolError::Io(format!("rename onto {} failed twice: {}", path, e)))?;
        }

        kinfo!("control socket bound at {}", path);
        Ok(Self { listener, public_path: path.to_string(), _lock_file: lock_file, clients: Vec::new() })
    }

    /// One non-blocking poll pass: accept new connections, drain
    /// readable sockets, process complete lines, flush pending output,
    /// drop closed clients.
    pub fn poll<P: Platform>(&mut self, manager: &mut Manager<P>, timeout: std::time::Duration) -> IsolResult<()> {
        // `PollFd` borrows the fds it watches, so the poll call itself
        // has to finish (and `fds` be dropped) before anything below
        // can take `&mut self` again - stash revents into a plain Vec
        // first and work off that instead.
        let (listener_revents, client_revents) = {
            let mut fds: Vec<PollFd> = Vec::with_capacity(1 + self.clients.len());
            fds.push(PollFd::new(self.listener.as_fd(), PollFlags::POLLIN));
            for c in &self.clients {
                let mut flags = PollFlags::POLLIN;
                if !c.outbuf.is_empty() {
                    flags |= PollFlags::POLLOUT;
                }
                fds.push(PollFd::new(c.stream.as_fd(), flags));
            }

            let timeout_ms: u16 = timeout.as_millis().min(u16::MAX as u128) as u16;
            let n = poll(&mut fds, PollTimeout::from(timeout_ms)).map_err(|e| IsolError::Io(format!("poll failed: {}", e)))?;
            if n <= 0 {
                return Ok(());
            }

            let listener_revents = fds[0].revents();
            let client_revents: Vec<Option<PollFlags>> = fds[1..].iter().map(|pfd| pfd.revents()).collect();
            (listener_revents, client_revents)
        };

        if let Some(revents) = listener_revents {
            if revents.contains(PollFlags::POLLIN) {
                self.accept_all();
            }
        }

        let mut dead = Vec::new();
        for (idx, revents) in client_revents.into_iter().enumerate() {
            let Some(revents) = revents else { continue };
            if idx >= self.clients.len() {
                continue;
            }
            if revents.contains(PollFlags::POLLIN) {
                if !self.service_readable(idx, manager) {
                    dead.push(idx);
                    continue;
                }
            }
            if revents.contains(PollFlags::POLLOUT) {
                self.flush_client(idx);
            }
            if self.clients[idx].close_after_flush && self.clients[idx].outbuf.is_empty() {
                dead.push(idx);
            }
        }

        dead.sort_unstable();
        dead.dedup();
        for idx in dead.into_iter().rev() {
            self.clients.remove(idx);
        }

        Ok(())
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    let _ = stream.set_nonblocking(true);
                    let mut conn = ClientConn {
                        stream,
                        session: ClientSession::new(),
                        inbuf: String::new(),
                        outbuf: Vec::new(),
                        close_after_flush: false,
                    };
                    conn.outbuf.extend_from_slice(client::format_response(220, &["isol_server ready"]).as_bytes());
                    self.clients.push(conn);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    kwarn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Read what's available, split into framed lines, process each.
    /// Returns `false` if the peer closed the connection.
    fn service_readable<P: Platform>(&mut self, idx: usize, manager: &mut Manager<P>) -> bool {
        let mut buf = [0u8; 4096];
        loop {
            match self.clients[idx].stream.read(&mut buf) {
                Ok(0) => {
                    self.on_disconnect(idx, manager);
                    return false;
                }
                Ok(n) => {
                    let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                    self.clients[idx].inbuf.push_str(&text);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    kdebug!("read failed on client {}: {}", idx, e);
                    self.on_disconnect(idx, manager);
                    return false;
                }
            }
        }

        let (lines, pending) = client::split_framed_lines(&self.clients[idx].inbuf);
        self.clients[idx].inbuf = pending;
        for line in lines {
            self.process_line(idx, &line, manager);
            if self.clients[idx].close_after_flush {
                break;
            }
        }
        true
    }

    fn process_line<P: Platform>(&mut self, idx: usize, line: &str, manager: &mut Manager<P>) {
        let response = match client::parse_request(line) {
            Ok(req) => self.handle_request(idx, req, manager),
            Err(e) => client::format_response(500, &[&e.to_string()]),
        };
        self.clients[idx].outbuf.extend_from_slice(response.as_bytes());
    }

    fn handle_request<P: Platform>(&mut self, idx: usize, req: Request, manager: &mut Manager<P>) -> String {
        match req {
            Request::Quit => {
                self.clients[idx].close_after_flush = true;
                client::format_response(221, &["End of session"])
            }
            Request::Terminate => {
                manager.request_terminate_all();
                self.clients[idx].close_after_flush = true;
                client::format_response(221, &["terminating"])
            }
            Request::NewTask { cpu, pid, tid } => {
                if self.clients[idx].session.attached_worker.is_some() {
                    return client::format_response(500, &[&ControlError::AlreadyConnected.to_string()]);
                }
                let wanted = cpu.map(|c| c as u32);
                match manager.claim_cpu(wanted) {
                    Some(worker_idx) => {
                        self.clients[idx].session.attached_worker = Some(worker_idx);
                        manager.workers[worker_idx].pid = Some(pid);
                        manager.workers[worker_idx].tid = Some(tid as u64);
                        manager.workers[worker_idx].foreign = true;
                        // Same-process callers are a worker thread self-connecting
                        // (spec.md §4.2 mode 2); a different pid is a separate
                        // process attaching (isol.c's `thread->pid == getpid()`
                        // branch).
                        let mode = if pid == std::process::id() { AttachMode::Thread } else { AttachMode::Process };
                        let cpu_assigned = manager.workers[worker_idx].cpu;
                        let mut lines = vec![format!("MODE={}", mode.as_wire_str())];
                        if mode == AttachMode::Thread {
                            lines.push(format!("INDEX={}", worker_idx));
                        }
                        lines.push(format!("CPU={}", cpu_assigned));
                        lines.push("OK".to_string());
                        let text_lines: Vec<&str> = lines.iter().map(String::as_str).collect();
                        client::format_response(200, &text_lines)
                    }
                    None => client::format_response(500, &[&ControlError::CantAllocateCpu.to_string()]),
                }
            }
            Request::TaskIsolFail => self.with_attached_worker(idx, manager, |manager, worker_idx| {
                let state = manager.workers[worker_idx].state;
                if let Some(t) = crate::state_machine::on_message(state, isol_core::message::MessageKind::StartLaunchFailure) {
                    manager.apply_external_transition(worker_idx, t);
                }
                client::format_response(220, &["Ok"])
            }),
            Request::TaskIsolFinish => self.with_attached_worker(idx, manager, |manager, worker_idx| {
                let state = manager.workers[worker_idx].state;
                if let Some(t) = crate::state_machine::on_message(state, isol_core::message::MessageKind::Exiting) {
                    manager.apply_external_transition(worker_idx, t);
                }
                client::format_response(220, &["Ok"])
            }),
        }
    }

    fn with_attached_worker<P: Platform>(
        &mut self,
        idx: usize,
        manager: &mut Manager<P>,
        f: impl FnOnce(&mut Manager<P>, usize) -> String,
    ) -> String {
        match self.clients[idx].session.attached_worker {
            Some(worker_idx) => {
                let resp = f(manager, worker_idx);
                if matches!(
                    self.clients[idx].session.attached_worker,
                    Some(w) if manager.workers[w].state == isol_core::state::WorkerLifecycleState::Off
                ) {
                    self.clients[idx].session.attached_worker = None;
                    self.clients[idx].close_after_flush = true;
                }
                resp
            }
            None => client::format_response(500, &[&ControlError::NoTaskConnected.to_string()]),
        }
    }

    fn on_disconnect<P: Platform>(&mut self, idx: usize, manager: &mut Manager<P>) {
        // Client disconnect is indistinguishable from `taskisolfinish`
        // for lifecycle purposes (spec.md §4.7).
        if let Some(worker_idx) = self.clients[idx].session.attached_worker.take() {
            let state = manager.workers[worker_idx].state;
            if let Some(t) = crate::state_machine::on_message(state, isol_core::message::MessageKind::Exiting) {
                manager.apply_external_transition(worker_idx, t);
            }
        }
    }

    fn flush_client(&mut self, idx: usize) {
        let conn = &mut self.clients[idx];
        if conn.outbuf.is_empty() {
            return;
        }
        match conn.stream.write(&conn.outbuf) {
            Ok(n) => {
                conn.outbuf.drain(..n);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => kdebug!("write failed on client {}: {}", idx, e),
        }
    }

    pub fn has_pending_output(&self) -> bool {
        self.clients.iter().any(|c| !c.outbuf.is_empty())
    }

    pub fn public_path(&self) -> &str {
        &self.public_path
    }
}

impl Drop for Control {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.public_path);
    }
}

fn rename_no_replace(from: &str, to: &str) -> std::io::Result<()> {
    let from_c = std::ffi::CString::new(from).map_err(|_| std::io::Error::from(ErrorKind::InvalidInput))?;
    let to_c = std::ffi::CString::new(to).map_err(|_| std::io::Error::from(ErrorKind::InvalidInput))?;
    let rc = unsafe {
        libc::renameat2(libc::AT_FDCWD, from_c.as_ptr(), libc::AT_FDCWD, to_c.as_ptr(), libc::RENAME_NOREPLACE)
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
