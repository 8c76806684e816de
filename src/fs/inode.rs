//! 索引节点层
//!
//! 磁盘上的索引节点按 `IPB` 个一组紧密排列在索引节点区。
//! 内存中的缓存由两部分组成：
//! - `meta`：设备号、索引节点号与引用计数，由互斥锁保护；
//! - `data`：从磁盘复制来的内容，由每个槽位的睡眠锁保护，按需加载。
//!
//! 调用者持有 [`Inode`] 句柄（克隆即增加引用，析构即减少引用），
//! 访问内容前先调用 [`Inode::lock`] 取得 [`InodeGuard`]。

use array_macro::array;

use core::cmp::min;
use core::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::consts::fs::{BSIZE, MAX_FILE_SIZE, NDIRECT, NINDIRECT, NINODE};
use crate::error::{FsError, Result};
use crate::sleeplock::{SleepLock, SleepLockGuard};

use super::block::{bm_alloc, bm_free};
use super::superblock::{read_u32, write_u32};
use super::{in_op, FsCore};

/// 磁盘索引节点的大小（字节）
pub const DINODE_SIZE: usize = 64;
/// 每个块容纳的磁盘索引节点数
pub const IPB: usize = BSIZE / DINODE_SIZE;

/// 索引节点在其所在块内的字节偏移
#[inline]
pub fn locate_inode_offset(inum: u32) -> usize {
    (inum as usize % IPB) * DINODE_SIZE
}

pub struct InodeCache {
    meta: Mutex<[InodeMeta; NINODE]>,
    data: [SleepLock<InodeData>; NINODE],
}

impl InodeCache {
    pub fn new() -> Self {
        Self {
            meta: Mutex::new(array![_ => InodeMeta::new(); NINODE]),
            data: array![_ => SleepLock::new(InodeData::new(), "InodeData"); NINODE],
        }
    }

    /// 获取 `(dev, inum)` 对应的缓存句柄。
    ///
    /// # 功能说明
    /// 只与引用计数大于 0 的条目比较身份，命中则增加引用计数；
    /// 否则绑定第一个引用计数为 0 的槽位，内容留待 [`Inode::lock`] 时加载。
    /// 本函数不访问磁盘。
    ///
    /// # 可能的错误
    /// 所有槽位都被引用时返回 [`FsError::InodeCacheFull`]。
    pub(super) fn get(&self, fs: &Arc<FsCore>, dev: u32, inum: u32) -> Result<Inode> {
        let mut guard = self.meta.lock();

        // 在缓存中查找
        let mut empty_i: Option<usize> = None;
        for i in 0..NINODE {
            if guard[i].inum == inum && guard[i].refs > 0 && guard[i].dev == dev {
                guard[i].refs += 1;
                return Ok(Inode {
                    fs: Arc::clone(fs),
                    dev,
                    inum,
                    index: i,
                })
            }
            if empty_i.is_none() && guard[i].refs == 0 {
                empty_i = Some(i);
            }
        }

        // 未找到
        let empty_i = empty_i.ok_or(FsError::InodeCacheFull)?;
        guard[empty_i].dev = dev;
        guard[empty_i].inum = inum;
        guard[empty_i].refs = 1;
        Ok(Inode {
            fs: Arc::clone(fs),
            dev,
            inum,
            index: empty_i,
        })
    }

    fn dup(&self, inode: &Inode) -> Inode {
        let mut guard = self.meta.lock();
        guard[inode.index].refs += 1;
        Inode {
            fs: Arc::clone(&inode.fs),
            dev: inode.dev,
            inum: inode.inum,
            index: inode.index,
        }
    }

    /// 释放一个引用。
    ///
    /// 最后一个引用释放时，若内容有效且链接数为 0，
    /// 则截断数据、将磁盘上的类型标记为空并写回，然后才把引用计数减到 0。
    /// 删除需要写磁盘，调用时必须处于操作之中（见 [`Inode`] 的析构）。
    fn put(&self, fs: &Arc<FsCore>, i: usize) {
        let mut guard = self.meta.lock();
        if guard[i].refs != 1 {
            guard[i].refs -= 1;
            return
        }

        // 引用计数为 1，因此这个锁不会阻塞
        let mut idata = self.data[i].lock();
        if idata.valid.is_none() || idata.dinode.nlink > 0 {
            idata.valid = None;
            drop(idata);
            guard[i].refs -= 1;
            return
        }
        drop(guard);

        let mut ig = InodeGuard { fs, data: idata };
        ig.truncate();
        ig.data.dinode.itype = InodeType::Empty;
        ig.update();
        ig.data.valid = None;
        drop(ig);

        // 缓存内容失效之后才能让出槽位
        let mut guard = self.meta.lock();
        guard[i].refs -= 1;
        debug_assert_eq!(guard[i].refs, 0);
    }

    /// 被引用的槽位数量
    pub fn in_use(&self) -> usize {
        self.meta.lock().iter().filter(|m| m.refs > 0).count()
    }

    /// `(dev, inum)` 当前的引用计数，未缓存时为 0
    pub fn refs_of(&self, dev: u32, inum: u32) -> usize {
        self.meta
            .lock()
            .iter()
            .find(|m| m.refs > 0 && m.dev == dev && m.inum == inum)
            .map_or(0, |m| m.refs)
    }
}

/// 内存索引节点的句柄
///
/// 克隆时增加引用计数，析构时减少引用计数；
/// 只有通过 [`Inode::lock`] 才能访问其内容。
pub struct Inode {
    pub(super) fs: Arc<FsCore>,
    dev: u32,
    inum: u32,
    index: usize,
}

impl Clone for Inode {
    fn clone(&self) -> Self {
        self.fs.icache.dup(self)
    }
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inode")
            .field("dev", &self.dev)
            .field("inum", &self.inum)
            .field("index", &self.index)
            .finish()
    }
}

impl Inode {
    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn inum(&self) -> u32 {
        self.inum
    }

    /// 加锁，必要时从磁盘加载内容。
    ///
    /// # Panics
    /// 磁盘上的类型为空，说明缓存与磁盘不一致。
    pub fn lock(&self) -> InodeGuard<'_> {
        let mut data = self.fs.icache.data[self.index].lock();
        if data.valid.is_none() {
            let buf = self.fs.bcache.bread(self.dev, self.fs.sb.locate_inode(self.inum));
            data.dinode = DiskInode::decode(&buf.data()[locate_inode_offset(self.inum)..]);
            drop(buf);
            data.valid = Some((self.dev, self.inum));
            if data.dinode.itype == InodeType::Empty {
                panic!("inode: lock an empty inode");
            }
        }
        InodeGuard { fs: &self.fs, data }
    }
}

impl Drop for Inode {
    /// 释放引用。最后一个引用可能删除索引节点，删除必须经过日志，
    /// 因此在操作之外析构时自行开启一个操作。
    fn drop(&mut self) {
        if in_op() || std::thread::panicking() {
            self.fs.icache.put(&self.fs, self.index);
        } else {
            let _tx = self.fs.begin();
            self.fs.icache.put(&self.fs, self.index);
        }
    }
}

struct InodeMeta {
    dev: u32,
    inum: u32,
    refs: usize,
}

impl InodeMeta {
    const fn new() -> Self {
        Self {
            dev: 0,
            inum: 0,
            refs: 0,
        }
    }
}

/// 内存索引节点的内容，`valid` 记录已加载的 `(dev, inum)`
#[derive(Debug)]
pub struct InodeData {
    valid: Option<(u32, u32)>,
    dinode: DiskInode,
}

impl InodeData {
    const fn new() -> Self {
        Self {
            valid: None,
            dinode: DiskInode::new(),
        }
    }
}

/// 已加锁的索引节点，析构时解锁
pub struct InodeGuard<'a> {
    pub(super) fs: &'a Arc<FsCore>,
    data: SleepLockGuard<'a, InodeData>,
}

impl<'a> InodeGuard<'a> {
    #[inline]
    pub fn get_dev_inum(&self) -> (u32, u32) {
        match self.data.valid {
            Some(id) => id,
            None => panic!("inode: guard over unloaded inode"),
        }
    }

    #[inline]
    pub fn get_itype(&self) -> InodeType {
        self.data.dinode.itype
    }

    #[inline]
    pub fn get_devnum(&self) -> (u16, u16) {
        (self.data.dinode.major, self.data.dinode.minor)
    }

    pub fn set_devnum(&mut self, major: u16, minor: u16) {
        self.data.dinode.major = major;
        self.data.dinode.minor = minor;
    }

    #[inline]
    pub fn get_nlink(&self) -> u16 {
        self.data.dinode.nlink
    }

    #[inline]
    pub fn get_size(&self) -> u32 {
        self.data.dinode.size
    }

    #[inline]
    pub fn link(&mut self) {
        self.data.dinode.nlink += 1;
    }

    pub fn unlink(&mut self) {
        if self.data.dinode.nlink == 0 {
            panic!("inode: unlink with zero nlink");
        }
        self.data.dinode.nlink -= 1;
    }

    /// 释放全部数据块：直接块、间接块引用的块以及间接块本身。
    pub fn truncate(&mut self) {
        let (dev, _) = self.get_dev_inum();

        // 直接块
        for i in 0..NDIRECT {
            let bn = self.data.dinode.addrs[i];
            if bn > 0 {
                bm_free(self.fs, dev, bn);
                self.data.dinode.addrs[i] = 0;
            }
        }

        // 间接块
        let indirect = self.data.dinode.addrs[NDIRECT];
        if indirect > 0 {
            let buf = self.fs.bcache.bread(dev, indirect);
            let blocks: Vec<u32> = (0..NINDIRECT)
                .map(|i| read_u32(buf.data(), i * 4))
                .filter(|&bn| bn > 0)
                .collect();
            drop(buf);
            for bn in blocks {
                bm_free(self.fs, dev, bn);
            }
            bm_free(self.fs, dev, indirect);
            self.data.dinode.addrs[NDIRECT] = 0;
        }

        self.data.dinode.size = 0;
        self.update();
    }

    /// 将内存中的内容通过日志写回磁盘，修改任何字段之后都要调用。
    pub fn update(&mut self) {
        let (dev, inum) = self.get_dev_inum();
        let mut buf = self.fs.bcache.bread(dev, self.fs.sb.locate_inode(inum));
        let offset = locate_inode_offset(inum);
        self.data.dinode.encode(&mut buf.data_mut()[offset..]);
        self.fs.log_write(buf);
    }

    /// 从 `off` 处读取数据到 `dst`。
    ///
    /// # 返回值
    /// 实际读取的字节数；`off` 超出文件大小或 `off + len` 溢出时为 0，
    /// 读到文件末尾时截断。
    pub fn read(&mut self, dst: &mut [u8], off: u32) -> u32 {
        let size = self.data.dinode.size;
        if off > size {
            return 0
        }
        let count = u32::try_from(dst.len()).unwrap_or(u32::MAX);
        let end = match off.checked_add(count) {
            Some(end) => min(end, size),
            None => return 0,
        };
        let total = (end - off) as usize;

        let (dev, _) = self.get_dev_inum();
        let mut pos = off as usize;
        let mut done = 0;
        while done < total {
            let bn = self.bmap(pos / BSIZE, false);
            if bn == 0 {
                panic!("inode: block {} inside file size is not mapped", pos / BSIZE);
            }
            let buf = self.fs.bcache.bread(dev, bn);
            let block_offset = pos % BSIZE;
            let n = min(total - done, BSIZE - block_offset);
            dst[done..done + n].copy_from_slice(&buf.data()[block_offset..block_offset + n]);
            drop(buf);
            done += n;
            pos += n;
        }
        total as u32
    }

    /// 将 `src` 写到 `off` 处，必要时分配数据块并增长文件大小。
    ///
    /// # 可能的错误
    /// `off` 超出文件大小、`off + len` 溢出或超过最大文件大小时
    /// 返回 [`FsError::OutOfRange`]，此时索引节点不被修改。
    pub fn write(&mut self, src: &[u8], off: u32) -> Result<u32> {
        if off > self.data.dinode.size {
            return Err(FsError::OutOfRange)
        }
        let count = u32::try_from(src.len()).map_err(|_| FsError::OutOfRange)?;
        let end = off.checked_add(count).ok_or(FsError::OutOfRange)?;
        if end as usize > MAX_FILE_SIZE {
            return Err(FsError::OutOfRange)
        }

        let (dev, _) = self.get_dev_inum();
        let mut pos = off as usize;
        let mut done = 0;
        while done < src.len() {
            let bn = self.bmap(pos / BSIZE, true);
            let mut buf = self.fs.bcache.bread(dev, bn);
            let block_offset = pos % BSIZE;
            let n = min(src.len() - done, BSIZE - block_offset);
            buf.data_mut()[block_offset..block_offset + n].copy_from_slice(&src[done..done + n]);
            self.fs.log_write(buf);
            done += n;
            pos += n;
        }

        if end > self.data.dinode.size {
            self.data.dinode.size = end;
        }
        // 即使大小不变，bmap 也可能修改了块地址
        self.update();
        Ok(count)
    }

    pub fn stat(&self) -> FileStat {
        let (dev, inum) = self.get_dev_inum();
        FileStat {
            dev,
            inum,
            itype: self.data.dinode.itype,
            nlink: self.data.dinode.nlink,
            size: self.data.dinode.size as u64,
        }
    }

    /// 将文件内的块序号映射为磁盘块号。
    ///
    /// # 功能说明
    /// 前 `NDIRECT` 个块使用直接地址，其后的 `NINDIRECT` 个块经由间接块。
    /// `alloc` 为 true 时按需分配（间接块在第一次使用时分配），
    /// 否则未映射的块返回 0。
    ///
    /// # Panics
    /// `bn` 超出单个文件可容纳的块数。
    pub(super) fn bmap(&mut self, bn: usize, alloc: bool) -> u32 {
        let (dev, _) = self.get_dev_inum();

        if bn < NDIRECT {
            // 处理直接块
            let addr = self.data.dinode.addrs[bn];
            if addr == 0 && alloc {
                let free_bn = bm_alloc(self.fs, dev);
                self.data.dinode.addrs[bn] = free_bn;
                return free_bn
            }
            return addr
        }

        if bn < NDIRECT + NINDIRECT {
            // 处理间接块
            let slot = (bn - NDIRECT) * 4;
            let indirect_bn = match self.data.dinode.addrs[NDIRECT] {
                0 if !alloc => return 0,
                0 => {
                    let free_bn = bm_alloc(self.fs, dev);
                    self.data.dinode.addrs[NDIRECT] = free_bn;
                    free_bn
                }
                addr => addr,
            };
            let mut indirect_buf = self.fs.bcache.bread(dev, indirect_bn);
            let addr = read_u32(indirect_buf.data(), slot);
            if addr == 0 && alloc {
                let free_bn = bm_alloc(self.fs, dev);
                write_u32(indirect_buf.data_mut(), slot, free_bn);
                self.fs.log_write(indirect_buf);
                return free_bn
            }
            return addr
        }

        panic!("inode: queried block {} out of range", bn);
    }
}

/// 文件状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub dev: u32,
    pub inum: u32,
    pub itype: InodeType,
    pub nlink: u16,
    pub size: u64,
}

/// 磁盘上的索引节点
///
/// 布局（小端序，共 64 字节）：类型、主设备号、次设备号、链接数各 2 字节，
/// 大小 4 字节，随后 `NDIRECT + 1` 个块地址。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskInode {
    pub itype: InodeType,
    pub major: u16,
    pub minor: u16,
    pub nlink: u16,
    pub size: u32,
    pub addrs: [u32; NDIRECT + 1],
}

impl DiskInode {
    pub const fn new() -> Self {
        Self {
            itype: InodeType::Empty,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            addrs: [0; NDIRECT + 1],
        }
    }

    /// # Panics
    /// 类型字段不是已知的取值，说明索引节点区已损坏。
    pub fn decode(raw: &[u8]) -> Self {
        let half = |off: usize| u16::from_le_bytes([raw[off], raw[off + 1]]);
        let itype = match InodeType::from_raw(half(0)) {
            Some(t) => t,
            None => panic!("inode: unknown on-disk type {}", half(0)),
        };
        let mut addrs = [0; NDIRECT + 1];
        for (i, a) in addrs.iter_mut().enumerate() {
            *a = read_u32(raw, 12 + 4 * i);
        }
        Self {
            itype,
            major: half(2),
            minor: half(4),
            nlink: half(6),
            size: read_u32(raw, 8),
            addrs,
        }
    }

    pub fn encode(&self, raw: &mut [u8]) {
        raw[0..2].copy_from_slice(&(self.itype as u16).to_le_bytes());
        raw[2..4].copy_from_slice(&self.major.to_le_bytes());
        raw[4..6].copy_from_slice(&self.minor.to_le_bytes());
        raw[6..8].copy_from_slice(&self.nlink.to_le_bytes());
        write_u32(raw, 8, self.size);
        for (i, a) in self.addrs.iter().enumerate() {
            write_u32(raw, 12 + 4 * i, *a);
        }
    }

    // 如果 [DiskInode] 是空闲的（即其类型为 [InodeType::Empty]），则清零后设置类型并分配它。
    pub fn try_alloc(&mut self, itype: InodeType) -> core::result::Result<(), ()> {
        if self.itype == InodeType::Empty {
            *self = Self::new();
            self.itype = itype;
            self.nlink = 1;
            Ok(())
        } else {
            Err(())
        }
    }
}

#[repr(u16)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InodeType {
    Empty = 0,
    Directory = 1,
    File = 2,
    Device = 3,
}

impl InodeType {
    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Self::Empty),
            1 => Some(Self::Directory),
            2 => Some(Self::File),
            3 => Some(Self::Device),
            _ => None,
        }
    }
}
