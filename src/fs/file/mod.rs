//! 打开文件与打开文件表

use core::cell::UnsafeCell;
use core::cmp::min;
use core::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::consts::file::NFILE;
use crate::consts::fs::{BSIZE, MAXOPBLOCKS, MAX_FILE_SIZE};
use crate::error::{FsError, Result};

use super::inode::FileStat;
use super::path::{create, namei};
use super::{FsCore, Inode, InodeType};

bitflags! {
    /// `open` 的打开标志
    pub struct OpenFlags: u32 {
        const RDONLY = 0x000;
        const WRONLY = 0x001;
        const RDWR = 0x002;
        /// 不存在时创建普通文件
        const CREATE = 0x200;
        /// 打开普通文件时截断为空
        const TRUNC = 0x400;
    }
}

impl OpenFlags {
    fn readable(self) -> bool {
        !self.contains(Self::WRONLY)
    }

    fn writable(self) -> bool {
        self.intersects(Self::WRONLY | Self::RDWR)
    }
}

/// 打开文件表，只记录系统中打开文件的总数
pub struct FileTable {
    open: Mutex<usize>,
}

impl FileTable {
    pub const fn new() -> Self {
        Self {
            open: parking_lot::const_mutex(0),
        }
    }

    fn alloc(&self) -> Result<()> {
        let mut open = self.open.lock();
        if *open >= NFILE {
            return Err(FsError::FileTableFull)
        }
        *open += 1;
        Ok(())
    }

    fn release(&self) {
        let mut open = self.open.lock();
        if *open == 0 {
            panic!("file: release with no open file");
        }
        *open -= 1;
    }

    pub fn open_count(&self) -> usize {
        *self.open.lock()
    }
}

/// 打开的文件，构建在索引节点之上。
///
/// 以 `Arc<File>` 共享；复制的文件描述符指向同一个 `File`，因而共享偏移量。
/// 最后一个引用释放时在事务中释放索引节点，并归还打开文件表中的位置。
/// 设备文件与普通文件一样经由索引节点读写。
pub struct File {
    /// 当前偏移量，只在持有索引节点锁时读写
    offset: UnsafeCell<u32>,
    inode: Option<Inode>,
    readable: bool,
    writable: bool,
}

unsafe impl Send for File {}
unsafe impl Sync for File {}

impl File {
    /// 按路径打开文件。
    ///
    /// # 功能说明
    /// 在一个事务中完成：指定 `CREATE` 时创建普通文件（已存在的普通文件或设备被直接打开），
    /// 否则查找已有文件；目录只能以只读方式打开；
    /// 对普通文件指定 `TRUNC` 时将其截断。
    ///
    /// # 可能的错误
    /// - 路径解析与创建的错误
    /// - [`FsError::IsDirectory`]：以写方式或 `TRUNC` 打开目录
    /// - [`FsError::FileTableFull`]：打开文件过多
    pub fn open(fs: &Arc<FsCore>, path: &str, flags: OpenFlags) -> Result<Arc<Self>> {
        let _tx = fs.begin();

        let inode = if flags.contains(OpenFlags::CREATE) {
            create(fs, path, InodeType::File, 0, 0, true)?
        } else {
            namei(fs, path)?
        };

        let mut idata = inode.lock();
        match idata.get_itype() {
            InodeType::Directory => {
                if flags.writable() || flags.contains(OpenFlags::TRUNC) {
                    return Err(FsError::IsDirectory)
                }
            }
            InodeType::File => {
                if flags.contains(OpenFlags::TRUNC) {
                    idata.truncate();
                }
            }
            InodeType::Device => {}
            InodeType::Empty => panic!("file: open an empty inode"),
        }
        drop(idata);

        fs.ftable.alloc()?;
        Ok(Arc::new(File {
            offset: UnsafeCell::new(0),
            inode: Some(inode),
            readable: flags.readable(),
            writable: flags.writable(),
        }))
    }

    fn inode(&self) -> &Inode {
        match self.inode {
            Some(ref inode) => inode,
            None => panic!("file: inode already released"),
        }
    }

    /// 从当前偏移量处读取，读到文件末尾时返回的字节数少于 `dst.len()`
    pub fn fread(&self, dst: &mut [u8]) -> Result<u32> {
        if !self.readable {
            return Err(FsError::NotReadable)
        }

        let mut idata = self.inode().lock();
        // SAFETY: 持有索引节点锁
        let offset = unsafe { &mut *self.offset.get() };
        let count = idata.read(dst, *offset);
        *offset += count;
        Ok(count)
    }

    /// 在当前偏移量处写入全部数据。
    ///
    /// # 功能说明
    /// 大的写入被拆分为多段，每段在独立的事务中完成，
    /// 保证单个事务涉及的块数（数据块、间接块、索引节点块与位图块）不超过 `MAXOPBLOCKS`。
    /// 因此崩溃时可能只有前面若干段落盘。
    ///
    /// # 可能的错误
    /// - [`FsError::NotWritable`]：以只读方式打开
    /// - [`FsError::OutOfRange`]：写入后会超过最大文件大小，此时不写入任何数据
    pub fn fwrite(&self, src: &[u8]) -> Result<u32> {
        if !self.writable {
            return Err(FsError::NotWritable)
        }

        let inode = self.inode();
        {
            let _idata = inode.lock();
            // SAFETY: 持有索引节点锁
            let offset = unsafe { *self.offset.get() };
            if offset as usize + src.len() > MAX_FILE_SIZE {
                return Err(FsError::OutOfRange)
            }
        }

        let batch = (MAXOPBLOCKS - 4) / 2 * BSIZE;
        let mut done = 0;
        while done < src.len() {
            let n = min(batch, src.len() - done);
            let _tx = inode.fs.begin();
            let mut idata = inode.lock();
            // SAFETY: 持有索引节点锁
            let offset = unsafe { &mut *self.offset.get() };
            let written = idata.write(&src[done..done + n], *offset)?;
            *offset += written;
            drop(idata);
            done += n;
        }
        Ok(done as u32)
    }

    pub fn fstat(&self) -> FileStat {
        self.inode().lock().stat()
    }

    pub fn readable(&self) -> bool {
        self.readable
    }

    pub fn writable(&self) -> bool {
        self.writable
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("inode", &self.inode)
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .finish()
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if let Some(inode) = self.inode.take() {
            let fs = Arc::clone(&inode.fs);
            let tx = fs.begin();
            drop(inode);
            drop(tx);
            fs.ftable.release();
        }
    }
}
