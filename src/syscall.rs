//! 文件相关的系统调用
//!
//! 文件描述符是 [`FileSystem`] 内一张 `NOFILE` 大小的表的下标，
//! 表项为共享的 `Arc<File>`，`dup` 出的描述符共享同一个偏移量。

use std::sync::Arc;

use crate::error::{FsError, Result};
use crate::fs::{File, FileStat, FileSystem, InodeType, OpenFlags};

impl FileSystem {
    /// 把文件放入第一个空闲的描述符，失败时在表锁之外关闭该文件
    fn fdalloc(&self, file: Arc<File>) -> Result<usize> {
        let mut ofile = self.ofile.lock();
        match ofile.iter().position(Option::is_none) {
            Some(fd) => {
                ofile[fd] = Some(file);
                Ok(fd)
            }
            None => {
                drop(ofile);
                drop(file);
                Err(FsError::NoFreeFd)
            }
        }
    }

    fn fd_file(&self, fd: usize) -> Result<Arc<File>> {
        self.ofile
            .lock()
            .get(fd)
            .and_then(Option::clone)
            .ok_or(FsError::BadFd)
    }

    /// 打开文件并分配文件描述符
    ///
    /// # 可能的错误
    /// [`File::open`] 的全部错误，以及没有空闲描述符时的 [`FsError::NoFreeFd`]。
    pub fn sys_open(&self, path: &str, flags: OpenFlags) -> Result<usize> {
        let ret = File::open(self.core(), path, flags).and_then(|file| self.fdalloc(file));

        #[cfg(feature = "trace_syscall")]
        log::trace!("open({}, {:?}) = {:?}", path, flags, ret);

        ret
    }

    /// 从文件当前偏移量处读取，返回实际读取的字节数，文件末尾返回 0
    pub fn sys_read(&self, fd: usize, dst: &mut [u8]) -> Result<usize> {
        let file = self.fd_file(fd)?;
        let ret = file.fread(dst).map(|n| n as usize);

        #[cfg(feature = "trace_syscall")]
        log::trace!("read(fd={}, count={}) = {:?}", fd, dst.len(), ret);

        ret
    }

    /// 在文件当前偏移量处写入全部数据
    pub fn sys_write(&self, fd: usize, src: &[u8]) -> Result<usize> {
        let file = self.fd_file(fd)?;
        let ret = file.fwrite(src).map(|n| n as usize);

        #[cfg(feature = "trace_syscall")]
        log::trace!("write(fd={}, count={}) = {:?}", fd, src.len(), ret);

        ret
    }

    /// 关闭描述符，最后一个引用关闭时释放文件
    pub fn sys_close(&self, fd: usize) -> Result<()> {
        let file = self
            .ofile
            .lock()
            .get_mut(fd)
            .and_then(Option::take)
            .ok_or(FsError::BadFd)?;
        drop(file);

        #[cfg(feature = "trace_syscall")]
        log::trace!("close(fd={})", fd);

        Ok(())
    }

    pub fn sys_fstat(&self, fd: usize) -> Result<FileStat> {
        let stat = self.fd_file(fd)?.fstat();

        #[cfg(feature = "trace_syscall")]
        log::trace!("fstat(fd={}) = {:?}", fd, stat);

        Ok(stat)
    }

    /// 复制描述符，新旧描述符共享同一个打开文件
    pub fn sys_dup(&self, fd: usize) -> Result<usize> {
        let file = self.fd_file(fd)?;
        let ret = self.fdalloc(file);

        #[cfg(feature = "trace_syscall")]
        log::trace!("dup({}) = {:?}", fd, ret);

        ret
    }

    pub fn sys_mkdir(&self, path: &str) -> Result<()> {
        let _tx = self.transaction();
        let ret = self.create(path, InodeType::Directory, 0, 0).map(drop);

        #[cfg(feature = "trace_syscall")]
        log::trace!("mkdir(path={}) = {:?}", path, ret);

        ret
    }

    /// 创建设备文件，设备文件的读写与普通文件一样经由索引节点
    pub fn sys_mknod(&self, path: &str, major: u16, minor: u16) -> Result<()> {
        let _tx = self.transaction();
        let ret = self.create(path, InodeType::Device, major, minor).map(drop);

        #[cfg(feature = "trace_syscall")]
        log::trace!("mknod(path={}, major={}, minor={}) = {:?}", path, major, minor, ret);

        ret
    }

    pub fn sys_link(&self, old: &str, new: &str) -> Result<()> {
        let _tx = self.transaction();
        let ret = self.link(old, new);

        #[cfg(feature = "trace_syscall")]
        log::trace!("link(old={}, new={}) = {:?}", old, new, ret);

        ret
    }

    pub fn sys_unlink(&self, path: &str) -> Result<()> {
        let _tx = self.transaction();
        let ret = self.unlink(path);

        #[cfg(feature = "trace_syscall")]
        log::trace!("unlink(path={}) = {:?}", path, ret);

        ret
    }

    /// 已分配的文件描述符数量
    pub fn open_fds(&self) -> usize {
        self.ofile.lock().iter().filter(|f| f.is_some()).count()
    }
}
