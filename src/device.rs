//! Block device seam.
//!
//! `BlockDevice` is what the scrubber reads from and repairs onto.
//! `MemDevice` backs tests and examples; `FileDevice` (feature `io`)
//! does real positional I/O against a device node or image file.

use std::io;

use parking_lot::{Mutex, RwLock};

use crate::fs::DeviceId;

/// Positional byte I/O against one device.
pub trait BlockDevice: Send + Sync {
    fn id(&self) -> DeviceId;

    /// Device size in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First 512-byte sector of this device within its parent, for
    /// partition-absolute offset computation.
    fn start_sector(&self) -> u64 {
        0
    }

    fn is_online(&self) -> bool {
        true
    }

    /// Fill `buf` from byte `offset`. Short reads are errors.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write `buf` at byte `offset`.
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()>;
}

/// In-memory device with optional injected read faults.
pub struct MemDevice {
    id: DeviceId,
    start_sector: u64,
    data: RwLock<Vec<u8>>,
    bad_ranges: Mutex<Vec<(u64, u64)>>,
}

impl MemDevice {
    pub fn new(id: DeviceId, size: usize) -> Self {
        MemDevice {
            id,
            start_sector: 0,
            data: RwLock::new(vec![0u8; size]),
            bad_ranges: Mutex::new(Vec::new()),
        }
    }

    pub fn with_start_sector(mut self, start_sector: u64) -> Self {
        self.start_sector = start_sector;
        self
    }

    /// Make reads intersecting `[offset, offset + len)` fail with EIO.
    pub fn inject_read_error(&self, offset: u64, len: u64) {
        self.bad_ranges.lock().push((offset, offset + len));
    }

    pub fn clear_read_errors(&self) {
        self.bad_ranges.lock().clear();
    }

    /// Overwrite a range without going through `write_at` bounds logic;
    /// handy for corrupting fixtures in place.
    pub fn patch(&self, offset: u64, bytes: &[u8]) {
        let mut data = self.data.write();
        let off = offset as usize;
        data[off..off + bytes.len()].copy_from_slice(bytes);
    }

    pub fn snapshot(&self, offset: u64, len: usize) -> Vec<u8> {
        let data = self.data.read();
        data[offset as usize..offset as usize + len].to_vec()
    }
}

impl BlockDevice for MemDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn len(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn start_sector(&self) -> u64 {
        self.start_sector
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let end = offset + buf.len() as u64;
        {
            let bad = self.bad_ranges.lock();
            if bad.iter().any(|&(s, e)| offset < e && s < end) {
                return Err(io::Error::new(io::ErrorKind::Other, "injected read error"));
            }
        }
        let data = self.data.read();
        if end > data.len() as u64 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read beyond device end",
            ));
        }
        buf.copy_from_slice(&data[offset as usize..end as usize]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let end = offset + buf.len() as u64;
        let mut data = self.data.write();
        if end > data.len() as u64 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "write beyond device end",
            ));
        }
        data[offset as usize..end as usize].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(feature = "io")]
pub use self::file::FileDevice;

#[cfg(feature = "io")]
mod file {
    use std::ffi::CString;
    use std::io;
    use std::os::fd::RawFd;

    use aligned_vec::{AVec, ConstAlign};
    use parking_lot::Mutex;

    use crate::fs::DeviceId;

    use super::BlockDevice;

    /// Alignment required for O_DIRECT I/O (512 bytes covers all common
    /// block devices).
    const IO_ALIGN: usize = 512;

    type AlignedBuf = AVec<u8, ConstAlign<IO_ALIGN>>;

    fn alloc_aligned(size: usize) -> AlignedBuf {
        AVec::from_iter(IO_ALIGN, std::iter::repeat_n(0u8, size))
    }

    /// File- or device-backed block device using positional libc I/O.
    ///
    /// With `direct`, data moves through an internal aligned scratch
    /// buffer so callers may pass unaligned slices.
    pub struct FileDevice {
        id: DeviceId,
        fd: RawFd,
        size: u64,
        direct: bool,
        scratch: Mutex<AlignedBuf>,
    }

    impl FileDevice {
        pub fn open(path: &str, id: DeviceId, direct: bool) -> io::Result<Self> {
            let c_path = CString::new(path)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;

            #[cfg(target_os = "linux")]
            let flags = if direct {
                libc::O_RDWR | libc::O_DIRECT
            } else {
                libc::O_RDWR
            };
            #[cfg(not(target_os = "linux"))]
            let flags = libc::O_RDWR;

            let fd = unsafe { libc::open(c_path.as_ptr(), flags) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }

            // macOS has no O_DIRECT; F_NOCACHE disables the buffer cache.
            #[cfg(target_os = "macos")]
            if direct {
                let ret = unsafe { libc::fcntl(fd, libc::F_NOCACHE, 1) };
                if ret == -1 {
                    let err = io::Error::last_os_error();
                    unsafe { libc::close(fd) };
                    return Err(err);
                }
            }

            let size = unsafe { libc::lseek(fd, 0, libc::SEEK_END) };
            if size < 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }

            Ok(FileDevice {
                id,
                fd,
                size: size as u64,
                direct,
                scratch: Mutex::new(alloc_aligned(0)),
            })
        }

        fn pread_full(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
            let mut total = 0usize;
            while total < buf.len() {
                let ret = unsafe {
                    libc::pread(
                        self.fd,
                        buf[total..].as_mut_ptr() as *mut libc::c_void,
                        buf.len() - total,
                        (offset + total as u64) as libc::off_t,
                    )
                };
                if ret < 0 {
                    return Err(io::Error::last_os_error());
                }
                if ret == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "unexpected EOF during pread",
                    ));
                }
                total += ret as usize;
            }
            Ok(())
        }

        fn pwrite_full(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
            let mut total = 0usize;
            while total < buf.len() {
                let ret = unsafe {
                    libc::pwrite(
                        self.fd,
                        buf[total..].as_ptr() as *const libc::c_void,
                        buf.len() - total,
                        (offset + total as u64) as libc::off_t,
                    )
                };
                if ret < 0 {
                    return Err(io::Error::last_os_error());
                }
                total += ret as usize;
            }
            Ok(())
        }
    }

    impl BlockDevice for FileDevice {
        fn id(&self) -> DeviceId {
            self.id
        }

        fn len(&self) -> u64 {
            self.size
        }

        fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
            if !self.direct {
                return self.pread_full(offset, buf);
            }
            // Direct I/O requires sector-aligned offsets and lengths;
            // bounce through the aligned scratch buffer.
            if offset % IO_ALIGN as u64 != 0 || buf.len() % IO_ALIGN != 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "unaligned direct read",
                ));
            }
            let mut scratch = self.scratch.lock();
            if scratch.len() < buf.len() {
                *scratch = alloc_aligned(buf.len());
            }
            self.pread_full(offset, &mut scratch[..buf.len()])?;
            buf.copy_from_slice(&scratch[..buf.len()]);
            Ok(())
        }

        fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
            if !self.direct {
                return self.pwrite_full(offset, buf);
            }
            if offset % IO_ALIGN as u64 != 0 || buf.len() % IO_ALIGN != 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "unaligned direct write",
                ));
            }
            let mut scratch = self.scratch.lock();
            if scratch.len() < buf.len() {
                *scratch = alloc_aligned(buf.len());
            }
            scratch[..buf.len()].copy_from_slice(buf);
            self.pwrite_full(offset, &scratch[..buf.len()])
        }
    }

    impl Drop for FileDevice {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}
