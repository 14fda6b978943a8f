//! File system calls. Every filesystem access holds the kernel's
//! filesystem lock.

use alloc::vec;

use super::user;
use super::{SysResult, FALSE, SYS_ERR, TRUE};
use crate::config::PAGE_SIZE;
use crate::fs::fd::{STDIN_FILENO, STDOUT_FILENO};
use crate::fs::OpenFile;
use crate::process::{Kernel, Process};

/// Longest path accepted from user space.
const MAX_PATH: usize = PAGE_SIZE as usize;

pub(super) fn create(kernel: &Kernel, proc: &Process, path: u64, size: u64) -> SysResult {
    let path = user::copy_in_str(kernel, proc, path, MAX_PATH)?;
    let _fs = kernel.fs_lock.lock();
    Ok(match kernel.fs.create(&path, size as usize) {
        Ok(()) => TRUE,
        Err(_) => FALSE,
    })
}

pub(super) fn remove(kernel: &Kernel, proc: &Process, path: u64) -> SysResult {
    let path = user::copy_in_str(kernel, proc, path, MAX_PATH)?;
    let _fs = kernel.fs_lock.lock();
    Ok(match kernel.fs.remove(&path) {
        Ok(()) => TRUE,
        Err(_) => FALSE,
    })
}

pub(super) fn open(kernel: &Kernel, proc: &Process, path: u64) -> SysResult {
    let path = user::copy_in_str(kernel, proc, path, MAX_PATH)?;
    let _fs = kernel.fs_lock.lock();
    let Ok(file) = OpenFile::open(&kernel.fs, &path) else {
        return Ok(SYS_ERR);
    };
    let mut res = proc.resources.lock();
    Ok(res.fds.insert(file).map_or(SYS_ERR, |fd| fd as u64))
}

pub(super) fn filesize(kernel: &Kernel, proc: &Process, fd: usize) -> SysResult {
    let _fs = kernel.fs_lock.lock();
    let mut res = proc.resources.lock();
    Ok(res
        .fds
        .file_mut(fd)
        .and_then(|f| f.length())
        .map_or(SYS_ERR, |len| len as u64))
}

pub(super) fn read(kernel: &Kernel, proc: &Process, fd: usize, buf: u64, size: usize) -> SysResult {
    user::check(kernel, proc, buf, size, true)?;
    let mut data = vec![0u8; size];
    let n = if fd == STDIN_FILENO {
        kernel.platform.console_read(&mut data)
    } else {
        let _fs = kernel.fs_lock.lock();
        let mut res = proc.resources.lock();
        match res.fds.file_mut(fd).and_then(|f| f.read(&mut data)) {
            Ok(n) => n,
            Err(_) => return Ok(SYS_ERR),
        }
    };
    user::copy_out(kernel, proc, buf, &data[..n])?;
    Ok(n as u64)
}

pub(super) fn write(kernel: &Kernel, proc: &Process, fd: usize, buf: u64, size: usize) -> SysResult {
    let data = user::copy_in(kernel, proc, buf, size)?;
    if fd == STDOUT_FILENO {
        kernel.platform.console_write(&data);
        return Ok(size as u64);
    }
    let _fs = kernel.fs_lock.lock();
    let mut res = proc.resources.lock();
    Ok(res
        .fds
        .file_mut(fd)
        .and_then(|f| f.write(&data))
        .map_or(SYS_ERR, |n| n as u64))
}

pub(super) fn seek(kernel: &Kernel, proc: &Process, fd: usize, pos: u64) -> SysResult {
    let _fs = kernel.fs_lock.lock();
    let mut res = proc.resources.lock();
    Ok(match res.fds.file_mut(fd) {
        Ok(file) => {
            file.seek(pos as usize);
            0
        }
        Err(_) => SYS_ERR,
    })
}

pub(super) fn tell(kernel: &Kernel, proc: &Process, fd: usize) -> SysResult {
    let _fs = kernel.fs_lock.lock();
    let mut res = proc.resources.lock();
    Ok(res.fds.file_mut(fd).map_or(SYS_ERR, |f| f.tell() as u64))
}

pub(super) fn close(kernel: &Kernel, proc: &Process, fd: usize) -> SysResult {
    let _fs = kernel.fs_lock.lock();
    let mut res = proc.resources.lock();
    Ok(res.fds.close(fd).map_or(SYS_ERR, |()| 0))
}
