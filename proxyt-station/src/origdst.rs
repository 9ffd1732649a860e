//! Recovery of the pre-redirect destination of an intercepted connection.

use std::fmt;
use std::io;
use std::net::SocketAddrV4;

use tokio::net::TcpStream;

/// Given an accepted socket, report where the client originally meant to go.
pub trait OriginalDst: Send + Sync + fmt::Debug {
    fn original_dst(&self, ts: &TcpStream) -> io::Result<SocketAddrV4>;
}

/// Looks the destination up in the netfilter NAT table through
/// `SO_ORIGINAL_DST`. Only meaningful for connections that reached us via an
/// iptables `REDIRECT` or `DNAT` rule.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetfilterDst;

#[cfg(target_os = "linux")]
const SO_ORIGINAL_DST: libc::c_int = 80;

#[cfg(target_os = "linux")]
impl OriginalDst for NetfilterDst {
    fn original_dst(&self, ts: &TcpStream) -> io::Result<SocketAddrV4> {
        use std::os::unix::io::AsRawFd;

        let fd = ts.as_raw_fd();
        // SAFETY: `addr` is a properly sized, zeroed sockaddr_in and `len`
        // carries its size; the kernel writes at most `len` bytes.
        let (addr, len) = unsafe {
            let mut addr: libc::sockaddr_in = std::mem::zeroed();
            let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            if libc::getsockopt(
                fd,
                libc::SOL_IP,
                SO_ORIGINAL_DST,
                &mut addr as *mut _ as *mut libc::c_void,
                &mut len,
            ) != 0
            {
                return Err(io::Error::last_os_error());
            }
            (addr, len)
        };

        sockaddr_to_v4(&addr, len)
    }
}

/// Decodes what the kernel wrote; both fields arrive in network byte order.
#[cfg(target_os = "linux")]
fn sockaddr_to_v4(addr: &libc::sockaddr_in, len: libc::socklen_t) -> io::Result<SocketAddrV4> {
    if (len as usize) < std::mem::size_of::<libc::sockaddr_in>()
        || addr.sin_family != libc::AF_INET as libc::sa_family_t
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "original destination is not IPv4",
        ));
    }

    let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    Ok(SocketAddrV4::new(ip, port))
}

#[cfg(not(target_os = "linux"))]
impl OriginalDst for NetfilterDst {
    fn original_dst(&self, _ts: &TcpStream) -> io::Result<SocketAddrV4> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "SO_ORIGINAL_DST is only available on linux",
        ))
    }
}
