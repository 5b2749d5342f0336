//! The multicast UDP transport.
//!
//! One socket, bound to 0.0.0.0:5353 with address reuse so other
//! mDNS stacks on the host can coexist, joined to 224.0.0.251 on
//! each selected interface.  Receives recover the ingress interface
//! index from control messages (`IP_PKTINFO` on Linux, `IP_RECVIF`
//! on the BSDs); where that is unavailable the index is reported as
//! zero and callers fall back to the host default address.  Sends
//! pin the egress interface with `IP_MULTICAST_IF`, serialised by a
//! lock because the option is socket-global.

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::io::Interest;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use mdns_types::protocol::types::{HEADER_MASK_TC, MAX_PACKET_SIZE, MDNS_GROUP, MDNS_PORT};

pub struct MulticastSocket {
    socket: UdpSocket,
    send_lock: Mutex<()>,
}

impl MulticastSocket {
    /// Bind the shared mDNS socket.  Must be called from within a
    /// tokio runtime.
    pub fn bind(multicast_loopback: bool) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MDNS_PORT).into())?;

        // TTL 255 per RFC 6762 section 11
        socket.set_multicast_ttl_v4(255)?;
        socket.set_multicast_loop_v4(multicast_loopback)?;

        enable_recv_ifindex(&socket)?;

        let socket = UdpSocket::from_std(socket.into())?;
        Ok(Self {
            socket,
            send_lock: Mutex::new(()),
        })
    }

    /// Join the mDNS group on the interface holding `local_addr`.
    pub fn join(&self, local_addr: Ipv4Addr) -> io::Result<()> {
        self.socket.join_multicast_v4(MDNS_GROUP, local_addr)
    }

    /// Leave the mDNS group on the interface holding `local_addr`.
    pub fn leave(&self, local_addr: Ipv4Addr) -> io::Result<()> {
        self.socket.leave_multicast_v4(MDNS_GROUP, local_addr)
    }

    /// Receive one datagram, returning its length, source address,
    /// and the index of the interface it arrived on (zero when the
    /// platform did not say).
    ///
    /// There is a single reader: calls to this must be serialised by
    /// the owning task.
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr, u32)> {
        #[cfg(unix)]
        {
            self.socket
                .async_io(Interest::READABLE, || {
                    recv_with_ifindex(&self.socket, buf)
                })
                .await
        }

        #[cfg(not(unix))]
        {
            let (len, source) = self.socket.recv_from(buf).await?;
            Ok((len, source, 0))
        }
    }

    /// Send a datagram out of the interface holding `out_addr` (or
    /// the system's choice when `None`).  Oversized payloads are
    /// clamped to the mDNS maximum with the TC flag set, undersized
    /// ones rejected.
    pub async fn send_to(
        &self,
        bytes: &mut [u8],
        dest: SocketAddr,
        out_addr: Option<Ipv4Addr>,
    ) -> io::Result<usize> {
        if bytes.len() < 12 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "datagram shorter than a DNS header",
            ));
        }

        // `IP_MULTICAST_IF` is socket-global, so the setsockopt and
        // the send must not interleave with another sender's
        let _guard = self.send_lock.lock().await;

        if let Some(addr) = out_addr {
            SockRef::from(&self.socket).set_multicast_if_v4(&addr)?;
        }

        if bytes.len() > MAX_PACKET_SIZE {
            bytes[2] |= HEADER_MASK_TC;
            self.send(&bytes[..MAX_PACKET_SIZE], dest).await
        } else {
            bytes[2] &= !HEADER_MASK_TC;
            self.send(bytes, dest).await
        }
    }

    async fn send(&self, bytes: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(bytes, dest).await
    }

    /// The multicast destination every QM message goes to.
    pub fn multicast_destination() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(MDNS_GROUP, MDNS_PORT))
    }
}

impl std::fmt::Debug for MulticastSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MulticastSocket").finish_non_exhaustive()
    }
}

/// Ask the kernel to attach the destination-interface control
/// message to each received datagram.
#[allow(unused_variables)]
fn enable_recv_ifindex(socket: &Socket) -> io::Result<()> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        setsockopt_one(socket, libc::IPPROTO_IP, libc::IP_PKTINFO)
    }

    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    {
        setsockopt_one(socket, libc::IPPROTO_IP, libc::IP_RECVIF)
    }

    // elsewhere receives report interface index zero
    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    )))]
    {
        Ok(())
    }
}

#[cfg(unix)]
fn setsockopt_one(socket: &Socket, level: libc::c_int, option: libc::c_int) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            option,
            std::ptr::addr_of!(one).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// `recvmsg` with a control-message buffer, pulling the ingress
/// interface index out of the ancillary data.
#[cfg(unix)]
fn recv_with_ifindex(
    socket: &UdpSocket,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr, u32)> {
    use std::os::fd::AsRawFd;

    let mut source: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let mut control = [0u8; 128];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = std::ptr::addr_of_mut!(source).cast();
    msg.msg_namelen = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    #[allow(clippy::cast_possible_truncation)]
    {
        msg.msg_controllen = control.len() as _;
    }

    let len = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, 0) };
    if len < 0 {
        return Err(io::Error::last_os_error());
    }

    let ifindex = ifindex_from_control(&msg);

    let source = SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(source.sin_addr.s_addr)),
        u16::from_be(source.sin_port),
    ));

    #[allow(clippy::cast_sign_loss)]
    Ok((len as usize, source, ifindex))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn ifindex_from_control(msg: &libc::msghdr) -> u32 {
    let mut ifindex = 0;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::IPPROTO_IP && (*cmsg).cmsg_type == libc::IP_PKTINFO {
                let pktinfo = libc::CMSG_DATA(cmsg)
                    .cast::<libc::in_pktinfo>()
                    .read_unaligned();
                #[allow(clippy::cast_sign_loss)]
                {
                    ifindex = pktinfo.ipi_ifindex as u32;
                }
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
    ifindex
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
fn ifindex_from_control(msg: &libc::msghdr) -> u32 {
    let mut ifindex = 0;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::IPPROTO_IP && (*cmsg).cmsg_type == libc::IP_RECVIF {
                let sdl = libc::CMSG_DATA(cmsg)
                    .cast::<libc::sockaddr_dl>()
                    .read_unaligned();
                ifindex = u32::from(sdl.sdl_index);
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
    ifindex
}

#[cfg(all(
    unix,
    not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    ))
))]
fn ifindex_from_control(_msg: &libc::msghdr) -> u32 {
    0
}
