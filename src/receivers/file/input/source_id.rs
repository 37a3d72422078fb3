// SPDX-License-Identifier: Apache-2.0

//! Stable file identity based on the inode (Unix) or file index (Windows).
//!
//! The identity survives renames, so a rotated file keeps its job and offsets.
//! It is also the key written to the offsets file.

use std::fs::{File, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Identity of a tailed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(u64);

impl SourceId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    /// Identity from `stat` output, without opening the file.
    #[cfg(unix)]
    pub fn from_metadata(metadata: &Metadata) -> io::Result<Self> {
        use std::os::unix::fs::MetadataExt;
        Ok(Self(metadata.ino()))
    }

    /// Identity of the file at `path` whose `stat` output is `metadata`.
    /// Windows needs an open handle for the file index.
    pub fn identify(path: &Path, metadata: &Metadata) -> io::Result<Self> {
        #[cfg(unix)]
        {
            let _ = path;
            Self::from_metadata(metadata)
        }
        #[cfg(windows)]
        {
            let _ = metadata;
            Self::from_path(path)
        }
    }

    #[cfg(unix)]
    pub fn from_file(file: &File) -> io::Result<Self> {
        // same inode whether reached by path or by handle
        Self::from_metadata(&file.metadata()?)
    }

    #[cfg(windows)]
    pub fn from_file(file: &File) -> io::Result<Self> {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::Foundation::HANDLE;
        use windows_sys::Win32::Storage::FileSystem::{
            BY_HANDLE_FILE_INFORMATION, GetFileInformationByHandle,
        };

        let handle = file.as_raw_handle() as HANDLE;
        let mut info: BY_HANDLE_FILE_INFORMATION = unsafe { std::mem::zeroed() };

        if unsafe { GetFileInformationByHandle(handle, &mut info) } == 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self(
            ((info.nFileIndexHigh as u64) << 32) | (info.nFileIndexLow as u64),
        ))
    }

    /// Identity of whatever currently lives at `path`.
    #[cfg(unix)]
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::from_metadata(&std::fs::metadata(path)?)
    }

    #[cfg(windows)]
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::from_file(&File::open(path)?)
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SourceId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(SourceId)
    }
}

/// Current path of an open handle. Fails once the file is unlinked.
#[cfg(target_os = "linux")]
pub fn get_path_from_file(file: &File) -> io::Result<PathBuf> {
    use std::os::unix::io::AsRawFd;

    let path = std::fs::read_link(format!("/proc/self/fd/{}", file.as_raw_fd()))?;
    // the kernel marks unlinked targets instead of failing
    if path.to_string_lossy().ends_with(" (deleted)") {
        return Err(io::Error::new(io::ErrorKind::NotFound, "file was deleted"));
    }
    Ok(path)
}

#[cfg(target_os = "macos")]
pub fn get_path_from_file(file: &File) -> io::Result<PathBuf> {
    use std::os::unix::io::AsRawFd;

    let mut buf = vec![0u8; libc::PATH_MAX as usize];
    let result = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETPATH, buf.as_mut_ptr()) };
    if result == -1 {
        return Err(io::Error::last_os_error());
    }

    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let path = std::str::from_utf8(&buf[..len])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(PathBuf::from(path))
}

#[cfg(windows)]
pub fn get_path_from_file(file: &File) -> io::Result<PathBuf> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::Storage::FileSystem::{
        FILE_NAME_NORMALIZED, GetFinalPathNameByHandleW,
    };

    let handle = file.as_raw_handle() as HANDLE;
    let size =
        unsafe { GetFinalPathNameByHandleW(handle, std::ptr::null_mut(), 0, FILE_NAME_NORMALIZED) };
    if size == 0 {
        return Err(io::Error::last_os_error());
    }

    let mut buf: Vec<u16> = vec![0; size as usize];
    let written = unsafe {
        GetFinalPathNameByHandleW(handle, buf.as_mut_ptr(), buf.len() as u32, FILE_NAME_NORMALIZED)
    };
    if written == 0 {
        return Err(io::Error::last_os_error());
    }

    let path = String::from_utf16_lossy(&buf[..written as usize]);
    Ok(PathBuf::from(path.strip_prefix(r"\\?\").unwrap_or(&path)))
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
pub fn get_path_from_file(_file: &File) -> io::Result<PathBuf> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "resolving the path of an open file is not supported on this platform",
    ))
}
