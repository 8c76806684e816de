//! 文件系统模块
//!
//! 自底向上分层：块设备 -> 缓冲区缓存 -> 日志 -> 位图与索引节点 -> 目录与路径 -> 打开文件。
//! 所有缓存都归属于挂载时创建的 [`FsCore`]，不存在全局状态。

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use ::log::{debug, info};
use array_macro::array;
use parking_lot::Mutex;

use crate::consts::file::NOFILE;
use crate::consts::fs::{MAXOPBLOCKS, ROOTDEV, ROOTINUM};
use crate::driver::BlockDevice;
use crate::error::{FsError, Result};

mod bio;
mod block;
mod dir;
mod file;
mod fsck;
mod inode;
mod log;
mod mkfs;
mod path;
mod superblock;

pub use bio::Buf;
pub use dir::{DirEntry, DirName, dir_name};
pub use file::{File, OpenFlags};
pub use fsck::{FsStats, FsckProblem, FsckReport};
pub use inode::{FileStat, Inode, InodeGuard, InodeType};
pub use mkfs::{mkfs, MkfsParams};
pub use superblock::SuperBlock;

use bio::Bcache;
use file::FileTable;
use inode::{DiskInode, InodeCache, locate_inode_offset};
use self::log::Log;
use superblock::SUPERBLOCK_BLOCKNO;

/// 一个已挂载的卷：超级块副本与各层缓存
pub struct FsCore {
    pub(crate) dev: u32,
    pub(crate) sb: SuperBlock,
    pub(crate) bcache: Bcache,
    pub(crate) log: Log,
    pub(crate) icache: InodeCache,
    pub(crate) ftable: FileTable,
}

impl FsCore {
    /// 通过日志写回一个被修改的缓冲块
    #[inline]
    pub fn log_write(&self, buf: Buf<'_>) {
        self.log.write(&self.bcache, buf);
    }

    /// 开始一个文件系统操作，返回的守卫析构时结束该操作
    pub fn begin(&self) -> Transaction<'_> {
        self.log.begin_op();
        OP_DEPTH.with(|d| d.set(d.get() + 1));
        Transaction { fs: self, _not_send: PhantomData }
    }

    /// 获取索引节点句柄，不访问磁盘
    pub fn iget(self: &Arc<Self>, dev: u32, inum: u32) -> Result<Inode> {
        self.icache.get(self, dev, inum)
    }

    /// 在磁盘上分配一个索引节点并返回其句柄，调用者需处于事务之中。
    ///
    /// 缓存已满时撤销磁盘上的分配再返回错误。
    pub fn ialloc(self: &Arc<Self>, dev: u32, itype: InodeType) -> Result<Inode> {
        let inum = block::inode_alloc(self, dev, itype)?;
        self.iget(dev, inum).map_err(|e| {
            block::inode_release(self, dev, inum);
            e
        })
    }

    pub fn superblock(&self) -> &SuperBlock {
        &self.sb
    }
}

thread_local! {
    /// 当前线程正在进行的文件系统操作层数
    static OP_DEPTH: Cell<usize> = Cell::new(0);
}

/// 当前线程是否处于某个文件系统操作之中
pub(crate) fn in_op() -> bool {
    OP_DEPTH.with(|d| d.get() > 0)
}

/// 文件系统操作的守卫
///
/// 同一时刻可以有多个操作共享一个事务，最后一个结束的操作负责提交。
/// 若在恐慌展开过程中析构，则不结束操作，未提交的修改随之丢失。
pub struct Transaction<'a> {
    fs: &'a FsCore,
    /// 操作层数按线程记录，守卫不能跨线程移动
    _not_send: PhantomData<*const ()>,
}

impl<'a> Drop for Transaction<'a> {
    fn drop(&mut self) {
        OP_DEPTH.with(|d| d.set(d.get() - 1));
        if !std::thread::panicking() {
            self.fs.log.end_op(&self.fs.bcache);
        }
    }
}

/// 已挂载的文件系统及其文件描述符表
pub struct FileSystem {
    core: Arc<FsCore>,
    pub(crate) ofile: Mutex<[Option<Arc<File>>; NOFILE]>,
}

impl FileSystem {
    /// 挂载卷。
    ///
    /// # 功能说明
    /// 1. 读取并校验超级块；
    /// 2. 检查卷的几何参数与设备大小、日志容量是否相符；
    /// 3. 执行日志恢复；
    /// 4. 若根目录尚不存在，在事务之外直接创建它。
    ///
    /// # 可能的错误
    /// - [`FsError::BadMagic`]：不是本文件系统的卷
    /// - [`FsError::InvalidGeometry`]：超级块描述的布局与设备不符
    pub fn mount(disk: Arc<dyn BlockDevice>) -> Result<Self> {
        let dev = ROOTDEV;
        if disk.num_blocks() <= SUPERBLOCK_BLOCKNO {
            return Err(FsError::InvalidGeometry("device too small for a superblock"))
        }
        let nblocks = disk.num_blocks();
        let bcache = Bcache::new(disk);

        let buf = bcache.bread(dev, SUPERBLOCK_BLOCKNO);
        let sb = SuperBlock::decode(buf.data())?;
        drop(buf);
        sb.check_geometry(nblocks)?;

        let log = Log::new(dev, &sb);
        if log.capacity() < MAXOPBLOCKS {
            return Err(FsError::InvalidGeometry("log region smaller than one operation"))
        }
        log.recover(&bcache);

        let core = Arc::new(FsCore {
            dev,
            sb,
            bcache,
            log,
            icache: InodeCache::new(),
            ftable: FileTable::new(),
        });
        Self::ensure_root(&core)?;

        info!("file system: setup done");
        #[cfg(feature = "verbose_init_info")]
        info!("file system: {:?}, log capacity {}", core.sb, core.log.capacity());

        Ok(Self {
            core,
            ofile: Mutex::new(array![_ => None; NOFILE]),
        })
    }

    /// 格式化设备后挂载
    pub fn format(disk: Arc<dyn BlockDevice>, params: MkfsParams) -> Result<Self> {
        mkfs(disk.as_ref(), params)?;
        Self::mount(disk)
    }

    /// 新格式化的卷上还没有根目录，在此直接写入（没有进行中的事务，日志层直接写回原位置）
    fn ensure_root(core: &Arc<FsCore>) -> Result<()> {
        let dev = core.dev;
        let buf = core.bcache.bread(dev, core.sb.locate_inode(ROOTINUM));
        let dinode = DiskInode::decode(&buf.data()[locate_inode_offset(ROOTINUM)..]);
        drop(buf);
        if dinode.itype != InodeType::Empty {
            return Ok(())
        }

        debug!("file system: creating root directory");
        let root = core.ialloc(dev, InodeType::Directory)?;
        if root.inum() != ROOTINUM {
            return Err(FsError::InvalidGeometry("inode table does not start at the root"))
        }
        let mut idata = root.lock();
        idata.dir_link(&dir_name(b"."), ROOTINUM)?;
        idata.dir_link(&dir_name(b".."), ROOTINUM)?;
        Ok(())
    }

    pub fn core(&self) -> &Arc<FsCore> {
        &self.core
    }

    pub fn superblock(&self) -> &SuperBlock {
        &self.core.sb
    }

    /// 开始一个文件系统操作，见 [`FsCore::begin`]
    pub fn transaction(&self) -> Transaction<'_> {
        self.core.begin()
    }

    /// 不使用守卫时手动开始操作，必须与 [`FileSystem::end_op`] 配对
    pub fn begin_op(&self) {
        self.core.log.begin_op();
        OP_DEPTH.with(|d| d.set(d.get() + 1));
    }

    pub fn end_op(&self) {
        OP_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
        self.core.log.end_op(&self.core.bcache);
    }

    /// 解析路径。返回的句柄可以在操作之外释放：
    /// 若它是已删除文件的最后一个引用，析构时在单独的操作中回收。
    pub fn namei(&self, path: &str) -> Result<Inode> {
        path::namei(&self.core, path)
    }

    pub fn namei_parent(&self, path: &str) -> Result<(Inode, DirName)> {
        path::namei_parent(&self.core, path)
    }

    /// 创建索引节点，名字已存在时失败。调用者需处于事务之中。
    pub fn create(&self, path: &str, itype: InodeType, major: u16, minor: u16) -> Result<Inode> {
        path::create(&self.core, path, itype, major, minor, false)
    }

    /// 调用者需处于事务之中
    pub fn link(&self, old: &str, new: &str) -> Result<()> {
        path::link(&self.core, old, new)
    }

    /// 调用者需处于事务之中
    pub fn unlink(&self, path: &str) -> Result<()> {
        path::unlink(&self.core, path)
    }
}
