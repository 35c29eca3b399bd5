use std::net::SocketAddr;

union CSockAddrs {
    v4: libc::sockaddr_in,
    v6: libc::sockaddr_in6,
}

pub(super) struct CSockAddr {
    addr: CSockAddrs,
    len: usize,
}

impl From<SocketAddr> for CSockAddr {
    fn from(value: SocketAddr) -> Self {
        match value {
            SocketAddr::V4(addr) => {
                let mut sin_addr: CSockAddrs = unsafe { std::mem::zeroed() };
                sin_addr.v4.sin_family = libc::AF_INET as u16;
                sin_addr.v4.sin_addr.s_addr = u32::from(*addr.ip()).to_be();
                sin_addr.v4.sin_port = addr.port().to_be();

                CSockAddr {
                    addr: sin_addr,
                    len: std::mem::size_of::<libc::sockaddr_in>(),
                }
            }
            SocketAddr::V6(addr) => {
                let mut sin_addr: CSockAddrs = unsafe { std::mem::zeroed() };
                sin_addr.v6.sin6_family = libc::AF_INET6 as u16;
                sin_addr.v6.sin6_addr.s6_addr = addr.ip().octets();
                sin_addr.v6.sin6_port = addr.port().to_be();
                sin_addr.v6.sin6_flowinfo = addr.flowinfo();
                sin_addr.v6.sin6_scope_id = addr.scope_id();

                CSockAddr {
                    addr: sin_addr,
                    len: std::mem::size_of::<libc::sockaddr_in6>(),
                }
            }
        }
    }
}

impl CSockAddr {
    pub fn as_ptr(&self) -> *const libc::sockaddr {
        &self.addr as *const _ as *const _
    }

    pub fn len(&self) -> libc::socklen_t {
        self.len as _
    }
}
