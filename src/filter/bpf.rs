//! BSD packet filter: /dev/bpf devices with a kernel classifier.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use libc::{c_uint, c_ulong};
use tracing::{debug, info};

use super::raw::{self, RECV_BUF_LEN};
use super::{validate_open, PktFilter};
use crate::domain::{Iface, Pkt4, SocketInfo};
use crate::error::PktFilterError;
use crate::frame::{dhcp_program, BpfInsn, LinkType};

/// Cloning device, absent on macOS
const BPF_CLONE_PATH: &str = "/dev/bpf";
/// Numbered devices tried when the cloning device is absent
const MAX_BPF_DEVICES: u32 = 256;

const IFNAMSIZ: usize = 16;

const DLT_NULL: c_uint = 0;
const DLT_EN10MB: c_uint = 1;

const IOC_OUT: c_ulong = 0x4000_0000;
const IOC_IN: c_ulong = 0x8000_0000;
const IOCPARM_MASK: c_ulong = 0x1fff;

/// Encode a BSD ioctl request in group 'B'.
const fn ioc(inout: c_ulong, num: u8, len: usize) -> c_ulong {
    inout | ((len as c_ulong & IOCPARM_MASK) << 16) | ((b'B' as c_ulong) << 8) | num as c_ulong
}

const BIOCGBLEN: c_ulong = ioc(IOC_OUT, 102, mem::size_of::<c_uint>());
const BIOCSETF: c_ulong = ioc(IOC_IN, 103, mem::size_of::<BpfProgram>());
const BIOCGDLT: c_ulong = ioc(IOC_OUT, 106, mem::size_of::<c_uint>());
const BIOCSETIF: c_ulong = ioc(IOC_IN, 108, mem::size_of::<IfReq>());
const BIOCIMMEDIATE: c_ulong = ioc(IOC_IN, 112, mem::size_of::<c_uint>());
const BIOCSHDRCMPLT: c_ulong = ioc(IOC_IN, 117, mem::size_of::<c_uint>());

/// Timestamp size at the front of each `bpf_hdr`
#[cfg(any(target_os = "macos", target_os = "openbsd"))]
const TSTAMP_LEN: usize = 8;
#[cfg(not(any(target_os = "macos", target_os = "openbsd")))]
const TSTAMP_LEN: usize = mem::size_of::<libc::timeval>();

/// Record alignment (`BPF_WORDALIGN`)
#[cfg(target_os = "macos")]
const WORD_ALIGN: usize = 4;
#[cfg(not(target_os = "macos"))]
const WORD_ALIGN: usize = mem::size_of::<libc::c_long>();

/// `struct bpf_program`
#[repr(C)]
struct BpfProgram {
    bf_len: c_uint,
    bf_insns: *mut BpfInsn,
}

/// `struct ifreq`, only the name is read by BIOCSETIF
#[repr(C)]
struct IfReq {
    name: [u8; IFNAMSIZ],
    _data: [u8; 16],
}

impl IfReq {
    fn new(name: &str) -> io::Result<Self> {
        let bytes = name.as_bytes();
        if bytes.len() >= IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("interface name '{}' too long", name),
            ));
        }
        let mut ifr = Self {
            name: [0; IFNAMSIZ],
            _data: [0; 16],
        };
        ifr.name[..bytes.len()].copy_from_slice(bytes);
        Ok(ifr)
    }
}

/// Packet filter over BSD packet filter devices.
///
/// Same capabilities as the Linux packet socket backend. A single read can
/// return several captured frames; the extras wait in the socket's backlog.
#[derive(Debug, Default, Clone, Copy)]
pub struct PktFilterBpf;

impl PktFilterBpf {
    pub fn new() -> Self {
        Self
    }
}

impl PktFilter for PktFilterBpf {
    fn name(&self) -> &'static str {
        "bpf"
    }

    fn is_direct_response_supported(&self) -> bool {
        true
    }

    fn open_socket(
        &self,
        iface: &Iface,
        addr: Ipv4Addr,
        port: u16,
        receive_bcast: bool,
        send_bcast: bool,
    ) -> Result<SocketInfo, PktFilterError> {
        validate_open(iface, receive_bcast, send_bcast)?;

        let fallback = raw::open_fallback_socket(iface, addr, port)?;

        let open = |e| PktFilterError::open(&iface.name, e);
        let fd = open_device().map_err(open)?;

        let mut buf_len: c_uint = 0;
        ioctl(&fd, BIOCGBLEN, &mut buf_len).map_err(open)?;

        let mut ifr = IfReq::new(&iface.name).map_err(open)?;
        ioctl(&fd, BIOCSETIF, &mut ifr).map_err(open)?;

        let mut on: c_uint = 1;
        ioctl(&fd, BIOCIMMEDIATE, &mut on).map_err(open)?;
        // Keep the source hardware address written into the frame
        ioctl(&fd, BIOCSHDRCMPLT, &mut on).map_err(open)?;

        let mut dlt: c_uint = 0;
        ioctl(&fd, BIOCGDLT, &mut dlt).map_err(open)?;
        let link = match dlt {
            DLT_EN10MB => LinkType::Ethernet,
            DLT_NULL => LinkType::Null,
            other => {
                return Err(PktFilterError::UnsupportedLinkType {
                    iface: iface.name.clone(),
                    link_type: other,
                })
            }
        };
        if link == LinkType::Ethernet && iface.mac.is_none() {
            return Err(PktFilterError::MissingHardwareAddress(iface.name.clone()));
        }

        let program = dhcp_program(link, port);
        let mut fprog = BpfProgram {
            bf_len: program.len() as c_uint,
            bf_insns: program.as_ptr() as *mut BpfInsn,
        };
        ioctl(&fd, BIOCSETF, &mut fprog).map_err(|source| PktFilterError::ClassifierInstall {
            iface: iface.name.clone(),
            source,
        })?;

        info!(
            "Opened packet filter device on {} ({:?}, {}:{}, buffer {})",
            iface.name, link, addr, port, buf_len
        );
        Ok(SocketInfo::raw(fd, fallback, addr, port, link, program).with_read_len(buf_len as usize))
    }

    fn receive(&self, iface: &Iface, socket: &SocketInfo) -> Result<Option<Pkt4>, PktFilterError> {
        raw::drain_fallback(iface, socket);

        if let Some(frame) = socket.pop_pending() {
            return Ok(raw::decode_inbound(iface, socket, &frame));
        }

        let read_len = match socket.read_len() {
            0 => RECV_BUF_LEN,
            n => n,
        };
        let mut buf = vec![0u8; read_len];
        let n = device(socket)
            .and_then(|mut dev| dev.read(&mut buf))
            .map_err(PktFilterError::Receive)?;

        let mut frames = raw::split_bpf_records(&buf[..n], TSTAMP_LEN, WORD_ALIGN).into_iter();
        let Some(first) = frames.next() else {
            debug!("Empty packet filter read on {}", iface.name);
            return Ok(None);
        };
        for rest in frames {
            socket.push_pending(rest);
        }

        Ok(raw::decode_inbound(iface, socket, &first))
    }

    fn send(&self, iface: &Iface, socket: &SocketInfo, pkt: &Pkt4) -> Result<(), PktFilterError> {
        let frame = raw::build_frame(iface, socket, pkt)?;

        // One write is one frame; a partial write is not resumed
        let n = device(socket)
            .and_then(|mut dev| dev.write(&frame))
            .map_err(PktFilterError::Send)?;
        if n != frame.len() {
            return Err(PktFilterError::Send(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write: {} of {} bytes", n, frame.len()),
            )));
        }

        debug!(
            "Sent {} byte frame to {}:{} via {}",
            frame.len(),
            pkt.remote_addr,
            pkt.remote_port,
            iface.name
        );
        Ok(())
    }
}

/// The socket's device as a file, over a duplicate of its descriptor.
fn device(socket: &SocketInfo) -> io::Result<File> {
    Ok(File::from(socket.as_fd().try_clone_to_owned()?))
}

/// Open a free packet filter device.
fn open_device() -> io::Result<OwnedFd> {
    let open = |path: &str| OpenOptions::new().read(true).write(true).open(path);

    match open(BPF_CLONE_PATH) {
        Ok(file) => return Ok(file.into()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let mut last = io::Error::from(io::ErrorKind::NotFound);
    for n in 0..MAX_BPF_DEVICES {
        match open(&format!("{}{}", BPF_CLONE_PATH, n)) {
            Ok(file) => return Ok(file.into()),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => last = e,
            Err(e) => return Err(e),
        }
    }
    Err(last)
}

fn ioctl<T>(fd: &OwnedFd, request: c_ulong, arg: &mut T) -> io::Result<()> {
    // SAFETY: every request used here takes a pointer to a value of the
    // size encoded in the request, and `arg` is such a value.
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), request, arg as *mut T) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
