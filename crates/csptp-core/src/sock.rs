//! Datagram socket surface.
//!
//! Unsigned UDP transport for the exchange, with receive timestamps taken as
//! close to kernel delivery as the host allows:
//!
//! * `SO_TIMESTAMPING` with the hardware flags is requested best-effort at
//!   socket creation (no-op without NIC support).
//! * `SO_TIMESTAMPNS` makes the kernel attach the delivery time as a
//!   `SCM_TIMESTAMPNS` control message, which `recv` extracts; the system
//!   clock read after the datagram is the fallback.

#[cfg(target_os = "linux")]
use std::mem::size_of;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use socket2::{Domain, Protocol as SockProto, SockAddr, Socket, Type};

use crate::addr::{Address, Protocol};
use crate::buf::Buffer;
use crate::error::{Error, Result};
use crate::time::Timestamp;

// cmsg buffer: cmsghdr (16B) + up to three timespecs (48B) + padding.
#[cfg(target_os = "linux")]
const CMSG_CAP: usize = 80;

#[derive(Debug)]
pub struct Sock {
    socket: Socket,
    proto: Protocol,
}

fn domain_of(proto: Protocol) -> Domain {
    match proto {
        Protocol::Udp4 => Domain::IPV4,
        Protocol::Udp6 => Domain::IPV6,
    }
}

#[cfg(target_os = "linux")]
fn enable_timestamping(fd: libc::c_int) {
    unsafe {
        // Hardware TX/RX timestamping where the NIC supports it.
        let flags: libc::c_int = libc::SOF_TIMESTAMPING_TX_HARDWARE as libc::c_int
            | libc::SOF_TIMESTAMPING_RX_HARDWARE as libc::c_int
            | libc::SOF_TIMESTAMPING_RAW_HARDWARE as libc::c_int;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TIMESTAMPING,
            &flags as *const _ as _,
            size_of::<libc::c_int>() as _,
        ) != 0
        {
            tracing::debug!("SO_TIMESTAMPING unavailable, software timestamps only");
        }

        // Kernel software receive timestamps via SCM_TIMESTAMPNS cmsg.
        let one: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TIMESTAMPNS,
            &one as *const _ as _,
            size_of::<libc::c_int>() as _,
        ) != 0
        {
            tracing::warn!("SO_TIMESTAMPNS unavailable, falling back to clock reads");
        }
    }
}

impl Sock {
    /// Datagram socket for a client of the given family.
    pub fn client(proto: Protocol) -> Result<Self> {
        let socket = Socket::new(domain_of(proto), Type::DGRAM, Some(SockProto::UDP))?;
        #[cfg(target_os = "linux")]
        enable_timestamping(socket.as_raw_fd());
        Ok(Self { socket, proto })
    }

    /// Datagram socket bound to the service address.
    pub fn service(address: &Address) -> Result<Self> {
        let proto = address.proto();
        let socket = Socket::new(domain_of(proto), Type::DGRAM, Some(SockProto::UDP))?;
        #[cfg(target_os = "linux")]
        enable_timestamping(socket.as_raw_fd());
        socket.bind(&SockAddr::from(address.to_socket_addr()))?;
        Ok(Self { socket, proto })
    }

    pub fn proto(&self) -> Protocol {
        self.proto
    }

    /// The locally bound endpoint (useful when binding to port 0).
    pub fn local_addr(&self) -> Result<Address> {
        let sa = self
            .socket
            .local_addr()?
            .as_socket()
            .ok_or(Error::Contract("socket has no inet address"))?;
        Ok(Address::from_socket_addr(sa))
    }

    /// Send the buffer's data length exactly; partial sends are failures.
    pub fn send(&self, buf: &Buffer, address: &Address) -> Result<()> {
        let data = buf.data();
        let sent = self
            .socket
            .send_to(data, &SockAddr::from(address.to_socket_addr()))
            .map_err(|err| {
                tracing::error!(%err, "sendto");
                Error::Io(err)
            })?;
        if sent != data.len() {
            tracing::warn!(sent, len = data.len(), "partial datagram send");
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "partial datagram send",
            )));
        }
        Ok(())
    }

    /// Readiness wait. Negative timeout blocks forever; zero is rejected.
    pub fn poll(&self, timeout_ms: i32) -> Result<bool> {
        if timeout_ms == 0 {
            return Err(Error::Contract("zero poll timeout"));
        }
        let timeout = if timeout_ms < 0 {
            tracing::debug!("infinite poll");
            -1
        } else {
            timeout_ms
        };
        #[cfg(unix)]
        {
            let mut fds = libc::pollfd {
                fd: self.socket.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut fds, 1, timeout) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                tracing::error!(%err, "poll");
                return Err(Error::Io(err));
            }
            Ok(rc > 0 && fds.revents & libc::POLLIN != 0)
        }
        #[cfg(not(unix))]
        {
            let _ = timeout;
            Err(Error::Contract("poll unsupported on this platform"))
        }
    }

    /// Receive one datagram into `buf`, returning the peer address and the
    /// receive timestamp (kernel delivery time when available).
    #[cfg(target_os = "linux")]
    pub fn recv(&self, buf: &mut Buffer) -> Result<(Address, Timestamp)> {
        let fd = self.socket.as_raw_fd();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut cmsg = [0u8; CMSG_CAP];
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_slice().as_mut_ptr() as *mut _,
            iov_len: buf.size(),
        };
        let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
        hdr.msg_name = &mut storage as *mut _ as *mut _;
        hdr.msg_namelen = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        hdr.msg_iov = &mut iov;
        hdr.msg_iovlen = 1;
        hdr.msg_control = cmsg.as_mut_ptr() as *mut _;
        hdr.msg_controllen = CMSG_CAP as _;

        let n = unsafe { libc::recvmsg(fd, &mut hdr, libc::MSG_DONTWAIT) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            tracing::debug!(%err, "recvmsg");
            return Err(Error::Io(err));
        }
        // Fallback when no kernel timestamp rode along: read the clock after
        // delivery, the closest we can get in userspace.
        let ts = kernel_rx_timestamp(&hdr).unwrap_or_else(Timestamp::now);
        let address = peer_address(&storage, self.proto)?;
        buf.set_len(n as usize)?;
        Ok((address, ts))
    }

    /// Non-Linux fallback: plain recv_from plus a clock read.
    #[cfg(not(target_os = "linux"))]
    pub fn recv(&self, buf: &mut Buffer) -> Result<(Address, Timestamp)> {
        let size = buf.size();
        let slice = unsafe {
            std::slice::from_raw_parts_mut(
                buf.as_mut_slice().as_mut_ptr() as *mut std::mem::MaybeUninit<u8>,
                size,
            )
        };
        let (n, sa) = self.socket.recv_from(slice)?;
        let ts = Timestamp::now();
        let sa = sa.as_socket().ok_or(Error::Malformed("peer is not an inet address"))?;
        let address = Address::from_socket_addr(sa);
        if address.proto() != self.proto {
            return Err(Error::Malformed("peer family does not match socket"));
        }
        buf.set_len(n)?;
        Ok((address, ts))
    }
}

#[cfg(target_os = "linux")]
fn peer_address(storage: &libc::sockaddr_storage, proto: Protocol) -> Result<Address> {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
    match (storage.ss_family as libc::c_int, proto) {
        (libc::AF_INET, Protocol::Udp4) => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Ok(Address::from_socket_addr(SocketAddr::new(
                IpAddr::V4(ip),
                u16::from_be(sin.sin_port),
            )))
        }
        (libc::AF_INET6, Protocol::Udp6) => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(Address::from_socket_addr(SocketAddr::new(
                IpAddr::V6(ip),
                u16::from_be(sin6.sin6_port),
            )))
        }
        (family, _) => {
            tracing::warn!(family, "peer family does not match socket");
            Err(Error::Malformed("peer family does not match socket"))
        }
    }
}

/// Extract the kernel receive timestamp from the control messages.
///
/// `SO_TIMESTAMPNS` delivers one `timespec` (`SCM_TIMESTAMPNS`);
/// `SO_TIMESTAMPING` delivers three (`SCM_TIMESTAMPING`: software, legacy,
/// raw hardware) of which the hardware slot is preferred when set.
#[cfg(target_os = "linux")]
fn kernel_rx_timestamp(hdr: &libc::msghdr) -> Option<Timestamp> {
    // SAFETY: msg_control points at our stack buffer; the CMSG_* macros walk
    // it bounded by msg_controllen.
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(hdr) };
    while !cmsg.is_null() {
        let c = unsafe { &*cmsg };
        if c.cmsg_level == libc::SOL_SOCKET {
            // SCM_TIMESTAMPNS / SCM_TIMESTAMPING share the SO_* values.
            if c.cmsg_type == libc::SO_TIMESTAMPNS {
                let ts: libc::timespec =
                    unsafe { std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const _) };
                return Timestamp::from_timespec(&ts).ok();
            }
            if c.cmsg_type == libc::SO_TIMESTAMPING {
                let stamps: [libc::timespec; 3] =
                    unsafe { std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const _) };
                let pick = if stamps[2].tv_sec != 0 || stamps[2].tv_nsec != 0 {
                    &stamps[2]
                } else {
                    &stamps[0]
                };
                if pick.tv_sec != 0 || pick.tv_nsec != 0 {
                    return Timestamp::from_timespec(pick).ok();
                }
            }
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(hdr, cmsg) };
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn loopback_service() -> (Sock, Address) {
        let bind = Address::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let sock = Sock::service(&bind).unwrap();
        let bound = sock.local_addr().unwrap();
        (sock, bound)
    }

    #[test]
    fn poll_rejects_zero_and_times_out() {
        let (sock, _) = loopback_service();
        assert!(sock.poll(0).is_err());
        assert_eq!(sock.poll(10).unwrap(), false);
    }

    #[test]
    fn send_recv_round_trip_with_timestamp() {
        let (service, bound) = loopback_service();
        let client = Sock::client(Protocol::Udp4).unwrap();

        let mut tx = Buffer::alloc(64).unwrap();
        tx.as_mut_slice()[..5].copy_from_slice(b"hello");
        tx.set_len(5).unwrap();
        client.send(&tx, &bound).unwrap();

        assert!(service.poll(1000).unwrap());
        let mut rx = Buffer::alloc(64).unwrap();
        let (peer, ts) = service.recv(&mut rx).unwrap();
        assert_eq!(rx.data(), b"hello");
        assert_eq!(peer.proto(), Protocol::Udp4);
        assert_eq!(peer.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        // Delivery time is a real wall-clock reading.
        assert!(ts.secs() > 0);

        // The service can answer to the peer address it saw.
        service.send(&rx, &peer).unwrap();
        assert!(client.poll(1000).unwrap());
        let mut back = Buffer::alloc(64).unwrap();
        let (from, _) = client.recv(&mut back).unwrap();
        assert_eq!(back.data(), b"hello");
        assert_eq!(from, bound);
    }

    #[test]
    fn recv_without_data_is_transient_error() {
        let (service, _) = loopback_service();
        let mut rx = Buffer::alloc(64).unwrap();
        // MSG_DONTWAIT on an empty queue surfaces EAGAIN.
        assert!(service.recv(&mut rx).is_err());
    }
}
