use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::config::BindConfig;
use crate::error::{Error, Result};

#[cfg(any(target_os = "linux", target_os = "android"))]
use std::ffi::CString;
#[cfg(any(target_os = "linux", target_os = "android"))]
use std::os::fd::AsRawFd;

/// Bind a non-blocking UDP socket on `port`, honouring the optional
/// interface constraint, and hand it to tokio.
///
/// When the bind address is the wildcard, per-packet destination reporting
/// is enabled so receivers can tell which local address a datagram landed
/// on (see [`recv_with_destination`]).
pub(crate) fn bind_udp_socket(bind: &BindConfig, port: u16) -> Result<UdpSocket> {
    let addr = SocketAddr::new(bind.address, port);
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    if let Some(iface) = &bind.interface {
        bind_to_device(&socket, iface)?;
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    if bind.address.is_unspecified() {
        enable_pktinfo(&socket, &addr)?;
    }

    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    Ok(UdpSocket::from_std(socket.into())?)
}

/// Configure `SO_BINDTODEVICE` for a socket when an interface is provided.
///
/// On Linux/Android this uses `setsockopt` to constrain the socket to the
/// supplied interface. Other platforms return an error indicating that the
/// behaviour is unsupported so callers can surface a clear configuration issue.
pub(crate) fn bind_to_device(socket: &Socket, interface: &str) -> Result<()> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let c_iface = CString::new(interface.as_bytes()).map_err(|_| {
            Error::Configuration(format!(
                "interface name contains interior NUL bytes: {interface}"
            ))
        })?;
        // Safety: we pass a valid pointer and length from the CString that
        // remains alive for the duration of the call.
        let result = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_BINDTODEVICE,
                c_iface.as_ptr() as *const libc::c_void,
                c_iface.as_bytes_with_nul().len() as libc::socklen_t,
            )
        };
        if result != 0 {
            let io_err = std::io::Error::last_os_error();
            return Err(Error::Media(format!(
                "failed to bind socket to interface {interface}: {io_err}"
            )));
        }
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        Err(Error::Media(format!(
            "interface binding not supported on this platform ({interface})"
        )))
    }
}

/// Request `IP_PKTINFO` / `IPV6_RECVPKTINFO` ancillary data on a socket bound
/// to the wildcard address.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn enable_pktinfo(socket: &Socket, addr: &SocketAddr) -> Result<()> {
    let enable: libc::c_int = 1;
    let (level, option) = if addr.is_ipv4() {
        (libc::IPPROTO_IP, libc::IP_PKTINFO)
    } else {
        (libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO)
    };
    // Safety: the option value is a live c_int for the duration of the call.
    let result = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            option,
            &enable as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if result != 0 {
        return Err(Error::Transport(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// One received datagram: payload length, source address and, when the
/// platform reported it, the local destination address it arrived on.
pub(crate) struct RecvMeta {
    pub len: usize,
    pub source: SocketAddr,
    pub destination: Option<std::net::IpAddr>,
}

/// Receive a datagram together with its destination address from ancillary
/// data. Wildcard-bound sockets need this to report which local address the
/// packet actually landed on.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn recv_with_destination(
    socket: &UdpSocket,
    buf: &mut [u8],
) -> std::io::Result<RecvMeta> {
    use std::mem;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    let fd = socket.as_raw_fd();
    let mut src_storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    // Room for one in_pktinfo or in6_pktinfo control message.
    let mut cmsg_space = [0u8; 64];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut src_storage as *mut libc::sockaddr_storage as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_space.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_space.len();

    // Safety: every pointer in msg stays valid for the duration of the call.
    let received = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if received < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let source = sockaddr_to_socket_addr(&src_storage).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "unparseable source address")
    })?;

    let mut destination = None;
    // Safety: CMSG_* walk the control buffer recvmsg just populated.
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    while !cmsg.is_null() {
        let header = unsafe { &*cmsg };
        if header.cmsg_level == libc::IPPROTO_IP && header.cmsg_type == libc::IP_PKTINFO {
            let info = unsafe { &*(libc::CMSG_DATA(cmsg) as *const libc::in_pktinfo) };
            destination = Some(IpAddr::V4(Ipv4Addr::from(info.ipi_addr.s_addr.to_ne_bytes())));
        } else if header.cmsg_level == libc::IPPROTO_IPV6 && header.cmsg_type == libc::IPV6_PKTINFO
        {
            let info = unsafe { &*(libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo) };
            destination = Some(IpAddr::V6(Ipv6Addr::from(info.ipi6_addr.s6_addr)));
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
    }

    Ok(RecvMeta {
        len: received as usize,
        source,
        destination,
    })
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn sockaddr_to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            // Safety: family says the storage holds a sockaddr_in.
            let addr = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(addr.sin_port),
            )))
        }
        libc::AF_INET6 => {
            // Safety: family says the storage holds a sockaddr_in6.
            let addr = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(addr.sin6_port),
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn recv_with_destination(
    socket: &UdpSocket,
    buf: &mut [u8],
) -> std::io::Result<RecvMeta> {
    let (len, source) = socket.try_recv_from(buf)?;
    Ok(RecvMeta {
        len,
        source,
        destination: None,
    })
}
