//! `AF_PACKET` socket for the raw-link backend.
//!
//! Frames are sent as complete Ethernet frames (`SOCK_RAW`): the 14-byte link
//! header is part of every datagram in both directions. The socket is bound
//! to one interface and one ethertype, so the kernel only queues our traffic.

use std::io;

use uvr_core::{LinkConfig, TransportError};

use crate::socket::DatagramSocket;

#[cfg(target_os = "linux")]
pub use imp::RawLinkSocket;

#[cfg(not(target_os = "linux"))]
pub use unsupported::RawLinkSocket;

#[cfg(target_os = "linux")]
mod imp {
    use std::io;
    use std::mem;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    use tracing::info;
    use uvr_core::{LinkConfig, TransportError};

    #[derive(Debug)]
    pub struct RawLinkSocket {
        fd: OwnedFd,
    }

    impl RawLinkSocket {
        pub fn open(link: &LinkConfig, nonblocking: bool) -> Result<Self, TransportError> {
            let protocol = link.ethertype.to_be();

            // SAFETY: plain syscall; the result is checked before use.
            let raw = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, protocol as libc::c_int) };
            if raw < 0 {
                return Err(TransportError::Socket(io::Error::last_os_error()));
            }
            // SAFETY: `raw` is a freshly created descriptor we exclusively own.
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };

            // SAFETY: sockaddr_ll is plain old data; all-zero is a valid value.
            let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
            addr.sll_family = libc::AF_PACKET as libc::c_ushort;
            addr.sll_protocol = protocol;
            addr.sll_ifindex = link.interface_index;
            addr.sll_halen = 6;
            addr.sll_addr[..6].copy_from_slice(&link.destination_mac.0);

            // SAFETY: `addr` outlives the call and the length matches its type.
            let rc = unsafe {
                libc::bind(
                    fd.as_raw_fd(),
                    &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
                )
            };
            if rc < 0 {
                return Err(TransportError::Bind {
                    addr: format!("ifindex {}", link.interface_index),
                    source: io::Error::last_os_error(),
                });
            }

            if nonblocking {
                // SAFETY: fcntl on a descriptor we own.
                let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL, 0) };
                let rc = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) };
                if flags < 0 || rc < 0 {
                    return Err(TransportError::Socket(io::Error::last_os_error()));
                }
            }

            info!(
                "Raw-link socket on ifindex {} (ethertype {:#06x}, nonblocking={})",
                link.interface_index, link.ethertype, nonblocking
            );
            Ok(Self { fd })
        }

        pub(super) fn send(&self, buf: &[u8]) -> io::Result<usize> {
            // SAFETY: `buf` is valid for `buf.len()` bytes for the duration of the call.
            let n = unsafe { libc::send(self.fd.as_raw_fd(), buf.as_ptr().cast(), buf.len(), 0) };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        }

        pub(super) fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            // SAFETY: `buf` is valid and writable for `buf.len()` bytes.
            let n = unsafe { libc::recv(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0) };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod unsupported {
    use std::io;

    use uvr_core::{BackendKind, LinkConfig, TransportError};

    /// `AF_PACKET` only exists on Linux.
    #[derive(Debug)]
    pub struct RawLinkSocket {
        _private: (),
    }

    impl RawLinkSocket {
        pub fn open(_link: &LinkConfig, _nonblocking: bool) -> Result<Self, TransportError> {
            Err(TransportError::Unsupported {
                backend: BackendKind::RawLink,
            })
        }

        pub(super) fn send(&self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::Unsupported.into())
        }

        pub(super) fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::Unsupported.into())
        }
    }
}

impl RawLinkSocket {
    pub fn sender(link: &LinkConfig) -> Result<Self, TransportError> {
        Self::open(link, false)
    }

    pub fn receiver(link: &LinkConfig) -> Result<Self, TransportError> {
        Self::open(link, true)
    }
}

impl DatagramSocket for RawLinkSocket {
    fn send_datagram(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(buf)
    }

    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf)
    }
}
