//! Interface link control through `SIOCGIFFLAGS` / `SIOCSIFFLAGS`.
//!
//! Only Linux is implemented; other platforms report `Unsupported`.

use std::io;

/// Query and force an interface's administrative state.
pub trait LinkController {
    /// True when `IFF_UP` is set on the interface.
    fn is_link_up(&self, interface: &str) -> io::Result<bool>;

    /// Set `IFF_UP`, keeping every other flag as it is.
    fn set_link_up(&self, interface: &str) -> io::Result<()>;
}

// Platform-specific implementation
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod imp {
            use std::io;
            use std::os::unix::io::{AsRawFd, OwnedFd};

            use nix::sys::socket::{AddressFamily, SockFlag, SockType, socket};

            nix::ioctl_read_bad!(siocgifflags, libc::SIOCGIFFLAGS, libc::ifreq);
            nix::ioctl_write_ptr_bad!(siocsifflags, libc::SIOCSIFFLAGS, libc::ifreq);

            fn control_socket() -> io::Result<OwnedFd> {
                socket(
                    AddressFamily::Inet,
                    SockType::Datagram,
                    SockFlag::SOCK_CLOEXEC,
                    None,
                )
                .map_err(io::Error::from)
            }

            fn request(interface: &str) -> io::Result<libc::ifreq> {
                let name = interface.as_bytes();
                if name.is_empty() || name.len() >= libc::IFNAMSIZ || name.contains(&0) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("invalid interface name {interface:?}"),
                    ));
                }
                // Safety: ifreq is plain old data; all-zero is a valid value.
                let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
                for (dst, src) in req.ifr_name.iter_mut().zip(name) {
                    *dst = *src as libc::c_char;
                }
                Ok(req)
            }

            pub(super) fn flags(interface: &str) -> io::Result<libc::c_short> {
                let sock = control_socket()?;
                let mut req = request(interface)?;
                // Safety: req is a valid ifreq with a NUL-terminated name.
                unsafe { siocgifflags(sock.as_raw_fd(), &mut req) }.map_err(io::Error::from)?;
                // Safety: SIOCGIFFLAGS fills the flags member of the union.
                Ok(unsafe { req.ifr_ifru.ifru_flags })
            }

            pub(super) fn set_flags(interface: &str, flags: libc::c_short) -> io::Result<()> {
                let sock = control_socket()?;
                let mut req = request(interface)?;
                req.ifr_ifru.ifru_flags = flags;
                // Safety: req is a valid ifreq with a NUL-terminated name.
                unsafe { siocsifflags(sock.as_raw_fd(), &req) }.map_err(io::Error::from)?;
                Ok(())
            }

            pub(super) const IFF_UP: libc::c_short = libc::IFF_UP as libc::c_short;
        }
    } else {
        mod imp {
            use std::io;

            pub(super) fn flags(_interface: &str) -> io::Result<i16> {
                Err(io::ErrorKind::Unsupported.into())
            }

            pub(super) fn set_flags(_interface: &str, _flags: i16) -> io::Result<()> {
                Err(io::ErrorKind::Unsupported.into())
            }

            pub(super) const IFF_UP: i16 = 0x1;
        }
    }
}

/// Link controller backed by the kernel's interface ioctls.
#[derive(Debug, Default, Clone, Copy)]
pub struct IoctlLink;

impl LinkController for IoctlLink {
    fn is_link_up(&self, interface: &str) -> io::Result<bool> {
        Ok(imp::flags(interface)? & imp::IFF_UP != 0)
    }

    fn set_link_up(&self, interface: &str) -> io::Result<()> {
        let current = imp::flags(interface)?;
        if current & imp::IFF_UP != 0 {
            return Ok(());
        }
        imp::set_flags(interface, current | imp::IFF_UP)?;
        log::info!("{interface}: link forced up");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_interface_is_an_error() {
        assert!(IoctlLink.is_link_up("nosuchif0").is_err());
    }

    #[test]
    fn test_invalid_names_are_rejected() {
        assert!(IoctlLink.is_link_up("").is_err());
        assert!(IoctlLink.is_link_up("an-interface-name-far-too-long").is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_repeated_queries_do_not_change_state() {
        let Ok(first) = IoctlLink.is_link_up("lo") else {
            return;
        };
        for _ in 0..5 {
            assert_eq!(IoctlLink.is_link_up("lo").unwrap(), first);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_set_link_up_on_up_interface_is_a_no_op() {
        // Loopback that is already up needs no privileges to "force up".
        if !matches!(IoctlLink.is_link_up("lo"), Ok(true)) {
            return;
        }
        IoctlLink.set_link_up("lo").unwrap();
        assert!(IoctlLink.is_link_up("lo").unwrap());
    }
}
