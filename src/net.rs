// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`GenSocket`]: a non-blocking POSIX socket whose readiness waits are expressed as [`Coro`]s.
//!
//! Every potentially-blocking call is preceded by a readiness wait that parks the caller until
//! `poll(2)` reports the descriptor ready, so a caller driving a `GenSocket` through a [`Loop`]
//! never actually blocks the process.

use crate::coro::Coro;
use crate::error::Error;
use std::ffi::c_void;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::task::Poll;
use std::time::{Duration, Instant};

/// How long a single `poll(2)` call waits before reporting "not ready yet" so the loop stays
/// responsive to other tasks; mirrors the short finite timeout the readiness contract calls for.
const POLL_QUANTUM: Duration = Duration::from_millis(10);

fn last_errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EINVAL)
}

fn would_block(errno: i32) -> bool {
    errno == libc::EAGAIN || errno == libc::EWOULDBLOCK
}

fn socket_addr_to_sockaddr(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sockaddr = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sockaddr);
            }
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sockaddr = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sockaddr);
            }
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

unsafe fn sockaddr_to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Some(SocketAddr::new(
                std::net::IpAddr::V4(std::net::Ipv4Addr::from(u32::from_ne_bytes(
                    sin.sin_addr.s_addr.to_ne_bytes(),
                ))),
                u16::from_be(sin.sin_port),
            ))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::new(
                std::net::IpAddr::V6(std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr)),
                u16::from_be(sin6.sin6_port),
            ))
        }
        _ => None,
    }
}

/// A non-blocking socket set up for use from inside a [`Coro`].
#[derive(Debug)]
pub struct GenSocket {
    fd: OwnedFd,
    timeout: Option<Duration>,
}

impl GenSocket {
    /// Create a new socket of the given address family/type/protocol, as the POSIX
    /// `socket(2)` call takes them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Socket`] if the underlying `socket(2)` call fails.
    pub fn new(domain: i32, ty: i32, protocol: i32) -> Result<Self, Error> {
        let raw = unsafe { libc::socket(domain, ty, protocol) };
        if raw < 0 {
            return Err(Error::Socket(std::io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self { fd, timeout: None })
    }

    fn from_owned_fd(fd: OwnedFd) -> Result<Self, Error> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self { fd, timeout: None })
    }

    #[must_use]
    pub fn fileno(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn settimeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// # Errors
    ///
    /// Returns [`Error::Socket`] if `setsockopt(2)` fails.
    pub fn setsockopt(&self, level: i32, optname: i32, value: i32) -> Result<(), Error> {
        let rc = unsafe {
            libc::setsockopt(
                self.fileno(),
                level,
                optname,
                (&raw const value).cast::<c_void>(),
                std::mem::size_of::<i32>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(Error::Socket(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`Error::Socket`] if `bind(2)` fails.
    pub fn bind(&self, addr: SocketAddr) -> Result<(), Error> {
        let (storage, len) = socket_addr_to_sockaddr(addr);
        let rc = unsafe {
            libc::bind(
                self.fileno(),
                (&raw const storage).cast::<libc::sockaddr>(),
                len,
            )
        };
        if rc < 0 {
            return Err(Error::Socket(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`Error::Socket`] if `listen(2)` fails.
    pub fn listen(&self, backlog: i32) -> Result<(), Error> {
        if unsafe { libc::listen(self.fileno(), backlog) } < 0 {
            return Err(Error::Socket(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Close the underlying file descriptor explicitly, rather than waiting on drop.
    pub fn close(self) {
        drop(self.fd);
    }

    /// Begin a non-blocking connect; the returned [`Coro`] resolves once the connection is
    /// established or fails.
    #[must_use]
    pub fn connect(&self, addr: SocketAddr) -> Connect<'_> {
        Connect {
            socket: self,
            addr,
            started: false,
            wait: None,
        }
    }

    /// Yields until the descriptor is writable.
    #[must_use]
    pub fn wait_writable(&self) -> WaitReady<'_> {
        WaitReady {
            socket: self,
            events: libc::POLLOUT,
        }
    }

    /// Yields until the descriptor is readable.
    #[must_use]
    pub fn wait_readable(&self) -> WaitReady<'_> {
        WaitReady {
            socket: self,
            events: libc::POLLIN,
        }
    }

    /// Send already-writable-checked data. Retries short writes internally.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Socket`] for any error other than a transient "would block".
    pub fn send(&self, data: &[u8]) -> Result<usize, Error> {
        let rc = unsafe {
            libc::send(
                self.fileno(),
                data.as_ptr().cast::<c_void>(),
                data.len(),
                0,
            )
        };
        if rc < 0 {
            let errno = last_errno();
            if would_block(errno) {
                return Ok(0);
            }
            return Err(Error::Socket(std::io::Error::from_raw_os_error(errno)));
        }
        Ok(rc as usize)
    }

    #[must_use]
    pub fn recv(&self, bufsize: usize) -> Recv<'_> {
        Recv {
            socket: self,
            bufsize,
            wait: None,
            started_at: None,
        }
    }

    #[must_use]
    pub fn accept(&self) -> Accept<'_> {
        Accept {
            socket: self,
            wait: None,
        }
    }
}

fn set_nonblocking(fd: RawFd) -> Result<(), Error> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(Error::Socket(std::io::Error::last_os_error()));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(Error::Socket(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn poll_once(fd: RawFd, events: i16) -> Result<bool, Error> {
    let mut fds = [libc::pollfd {
        fd,
        events,
        revents: 0,
    }];
    let rc = unsafe {
        libc::poll(
            fds.as_mut_ptr(),
            1,
            POLL_QUANTUM.as_millis() as libc::c_int,
        )
    };
    if rc < 0 {
        let errno = last_errno();
        if errno == libc::EINTR {
            return Ok(false);
        }
        return Err(Error::Socket(std::io::Error::from_raw_os_error(errno)));
    }
    Ok(rc > 0 && fds[0].revents & events != 0)
}

/// [`Coro`] returned by [`GenSocket::wait_readable`]/[`GenSocket::wait_writable`].
#[derive(Debug)]
pub struct WaitReady<'a> {
    socket: &'a GenSocket,
    events: i16,
}

impl Coro for WaitReady<'_> {
    type Output = ();

    fn advance(&mut self, cancel: bool) -> Poll<Result<(), Error>> {
        if cancel {
            return Poll::Ready(Err(Error::Cancelled));
        }
        match poll_once(self.socket.fileno(), self.events) {
            Ok(true) => Poll::Ready(Ok(())),
            Ok(false) => Poll::Pending,
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

/// [`Coro`] returned by [`GenSocket::connect`].
#[derive(Debug)]
pub struct Connect<'a> {
    socket: &'a GenSocket,
    addr: SocketAddr,
    started: bool,
    wait: Option<WaitReady<'a>>,
}

impl Coro for Connect<'_> {
    type Output = ();

    fn advance(&mut self, cancel: bool) -> Poll<Result<(), Error>> {
        if cancel {
            return Poll::Ready(Err(Error::Cancelled));
        }
        if !self.started {
            self.started = true;
            let (storage, len) = socket_addr_to_sockaddr(self.addr);
            let rc = unsafe {
                libc::connect(
                    self.socket.fileno(),
                    (&raw const storage).cast::<libc::sockaddr>(),
                    len,
                )
            };
            if rc < 0 {
                let errno = last_errno();
                if errno != libc::EINPROGRESS && errno != libc::EALREADY {
                    return Poll::Ready(Err(Error::Socket(std::io::Error::from_raw_os_error(
                        errno,
                    ))));
                }
            } else {
                return Poll::Ready(Ok(()));
            }
        }
        if self.wait.is_none() {
            self.wait = Some(self.socket.wait_writable());
        }
        self.wait.as_mut().expect("just inserted above").advance(false)
    }
}

/// [`Coro`] returned by [`GenSocket::recv`].
#[derive(Debug)]
pub struct Recv<'a> {
    socket: &'a GenSocket,
    bufsize: usize,
    wait: Option<WaitReady<'a>>,
    started_at: Option<Instant>,
}

impl Coro for Recv<'_> {
    type Output = Vec<u8>;

    fn advance(&mut self, cancel: bool) -> Poll<Result<Vec<u8>, Error>> {
        if cancel {
            return Poll::Ready(Err(Error::Cancelled));
        }
        let started_at = *self.started_at.get_or_insert_with(Instant::now);
        if let Some(timeout) = self.socket.timeout {
            if started_at.elapsed() >= timeout {
                tracing::debug!(fd = self.socket.fileno(), "recv timed out waiting for readiness");
                return Poll::Ready(Err(Error::Timeout { pending: vec![] }));
            }
        }

        if self.wait.is_none() {
            self.wait = Some(self.socket.wait_readable());
        }
        match self.wait.as_mut().expect("just inserted above").advance(false) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
            Poll::Ready(Ok(())) => {}
        }

        let mut buf = vec![0u8; self.bufsize];
        let rc = unsafe {
            libc::recv(
                self.socket.fileno(),
                buf.as_mut_ptr().cast::<c_void>(),
                buf.len(),
                0,
            )
        };
        if rc < 0 {
            let errno = last_errno();
            if would_block(errno) {
                self.wait = None;
                return Poll::Pending;
            }
            return Poll::Ready(Err(Error::Socket(std::io::Error::from_raw_os_error(errno))));
        }
        buf.truncate(rc as usize);
        Poll::Ready(Ok(buf))
    }
}

/// [`Coro`] returned by [`GenSocket::accept`].
#[derive(Debug)]
pub struct Accept<'a> {
    socket: &'a GenSocket,
    wait: Option<WaitReady<'a>>,
}

impl Coro for Accept<'_> {
    type Output = (GenSocket, SocketAddr);

    fn advance(&mut self, cancel: bool) -> Poll<Result<(GenSocket, SocketAddr), Error>> {
        if cancel {
            return Poll::Ready(Err(Error::Cancelled));
        }
        if self.wait.is_none() {
            self.wait = Some(self.socket.wait_readable());
        }
        match self.wait.as_mut().expect("just inserted above").advance(false) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
            Poll::Ready(Ok(())) => {}
        }

        let mut storage = MaybeUninit::<libc::sockaddr_storage>::zeroed();
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let raw = unsafe {
            libc::accept(
                self.socket.fileno(),
                storage.as_mut_ptr().cast::<libc::sockaddr>(),
                &raw mut len,
            )
        };
        if raw < 0 {
            let errno = last_errno();
            if would_block(errno) {
                self.wait = None;
                return Poll::Pending;
            }
            return Poll::Ready(Err(Error::Socket(std::io::Error::from_raw_os_error(errno))));
        }
        let peer = unsafe { sockaddr_to_socket_addr(&storage.assume_init()) }
            .expect("accept() always yields an INET/INET6 peer address");
        let conn = unsafe { OwnedFd::from_raw_fd(raw) };
        match GenSocket::from_owned_fd(conn) {
            Ok(sock) => Poll::Ready(Ok((sock, peer))),
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

impl AsRawFd for GenSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl IntoRawFd for GenSocket {
    fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_listener_accepts_and_connect_exchanges_a_payload() {
        let listener = GenSocket::new(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        listener
            .setsockopt(libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
            .unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        listener.bind(addr).unwrap();
        listener.listen(16).unwrap();

        let mut local = [0u8; 16];
        let mut len = local.len() as libc::socklen_t;
        unsafe {
            libc::getsockname(
                listener.fileno(),
                local.as_mut_ptr().cast::<libc::sockaddr>(),
                &raw mut len,
            );
        }
        let bound = unsafe {
            sockaddr_to_socket_addr(&*(local.as_ptr().cast::<libc::sockaddr_storage>()))
        }
        .unwrap();

        let client = GenSocket::new(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        let mut connect = client.connect(bound);
        let mut accept = listener.accept();

        let mut paused = 0;
        let (server_peer, peer_addr) = loop {
            if let Poll::Ready(result) = accept.advance(false) {
                break result.unwrap();
            }
            let _ = connect.advance(false);
            paused += 1;
            assert!(paused < 10_000, "accept/connect never became ready");
        };
        assert_eq!(peer_addr.ip(), bound.ip());

        loop {
            if connect.advance(false).is_ready() {
                break;
            }
        }

        client.send(b"ping").unwrap();
        let mut recv = server_peer.recv(16);
        let received = loop {
            if let Poll::Ready(result) = recv.advance(false) {
                break result.unwrap();
            }
        };
        assert_eq!(&received, b"ping");
    }
}
