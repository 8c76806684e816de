//! 目录操作
//!
//! 目录的内容就是一串定长目录项，按普通文件数据存放。
//! 目录项：2 字节索引节点号 + `DIRSIZ` 字节名字，名字不足时以 0 填充，
//! 填满时不以 0 结尾。索引节点号为 0 表示空闲项。

use crate::consts::fs::DIRSIZ;
use crate::error::{FsError, Result};

use super::inode::{Inode, InodeGuard, InodeType};

/// 目录项在磁盘上的大小
pub const DIRENT_SIZE: usize = 2 + DIRSIZ;

/// 定长的目录项名字
pub type DirName = [u8; DIRSIZ];

/// 把名字截断或填充为定长形式
pub fn dir_name(name: &[u8]) -> DirName {
    let mut n = [0u8; DIRSIZ];
    let len = name.len().min(DIRSIZ);
    n[..len].copy_from_slice(&name[..len]);
    n
}

/// 定长名字中有效的部分
pub fn name_bytes(name: &DirName) -> &[u8] {
    let len = name.iter().position(|&c| c == 0).unwrap_or(DIRSIZ);
    &name[..len]
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub inum: u16,
    pub name: DirName,
}

impl DirEntry {
    const fn empty() -> Self {
        Self {
            inum: 0,
            name: [0; DIRSIZ],
        }
    }

    fn decode(raw: &[u8; DIRENT_SIZE]) -> Self {
        let mut name = [0u8; DIRSIZ];
        name.copy_from_slice(&raw[2..]);
        Self {
            inum: u16::from_le_bytes([raw[0], raw[1]]),
            name,
        }
    }

    fn encode(&self) -> [u8; DIRENT_SIZE] {
        let mut raw = [0u8; DIRENT_SIZE];
        raw[..2].copy_from_slice(&self.inum.to_le_bytes());
        raw[2..].copy_from_slice(&self.name);
        raw
    }

    /// 名字的可读形式
    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(name_bytes(&self.name)).into_owned()
    }
}

fn is_dot_or_dotdot(name: &DirName) -> bool {
    let n = name_bytes(name);
    n == b"." || n == b".."
}

impl<'a> InodeGuard<'a> {
    fn read_entry(&mut self, off: u32) -> DirEntry {
        let mut raw = [0u8; DIRENT_SIZE];
        if self.read(&mut raw, off) as usize != DIRENT_SIZE {
            panic!("dir: short read of entry at {}", off);
        }
        DirEntry::decode(&raw)
    }

    fn write_entry(&mut self, off: u32, de: &DirEntry) -> Result<()> {
        self.write(&de.encode(), off).map(|_| ())
    }

    fn assert_dir(&self) {
        if self.get_itype() != InodeType::Directory {
            panic!("inode type not dir");
        }
    }

    /// 查找名字对应的目录项，返回索引节点号与目录项偏移，不获取缓存句柄。
    fn find_entry(&mut self, name: &DirName) -> Option<(u32, u32)> {
        self.assert_dir();
        let size = self.get_size();
        for off in (0..size).step_by(DIRENT_SIZE) {
            let de = self.read_entry(off);
            if de.inum != 0 && de.name == *name {
                return Some((de.inum as u32, off))
            }
        }
        None
    }

    /// 在目录中查找名字。
    ///
    /// # 返回值
    /// 目标索引节点的句柄（未加锁）以及目录项在目录中的字节偏移。
    ///
    /// # 可能的错误
    /// - [`FsError::NotFound`]：没有该名字
    /// - [`FsError::InodeCacheFull`]：无法为目标分配缓存槽位
    ///
    /// # Panics
    /// 当前索引节点不是目录。
    pub fn dir_lookup(&mut self, name: &DirName) -> Result<(Inode, u32)> {
        let (dev, _) = self.get_dev_inum();
        let (inum, off) = self.find_entry(name).ok_or(FsError::NotFound)?;
        let inode = self.fs.iget(dev, inum)?;
        Ok((inode, off))
    }

    /// 在目录中加入 `name -> inum`，复用第一个空闲项，没有则追加在末尾。
    ///
    /// # 可能的错误
    /// - [`FsError::AlreadyExists`]：名字已存在
    /// - [`FsError::OutOfRange`]：目录已达到最大文件大小
    pub fn dir_link(&mut self, name: &DirName, inum: u32) -> Result<()> {
        if inum > u16::MAX as u32 {
            panic!("inum {} too large", inum);
        }

        // 该条目不应已存在
        if self.find_entry(name).is_some() {
            return Err(FsError::AlreadyExists)
        }

        let size = self.get_size();
        let offset = (0..size)
            .step_by(DIRENT_SIZE)
            .find(|&off| self.read_entry(off).inum == 0)
            .unwrap_or(size);
        let de = DirEntry {
            inum: inum as u16,
            name: *name,
        };
        self.write_entry(offset, &de)
    }

    /// 从目录中删除一项并减少链接数。
    ///
    /// # 功能说明
    /// 拒绝删除 `.` 与 `..`；目标为非空目录时拒绝删除。
    /// 清空目录项后目标链接数减一；目标是目录时本目录的链接数也减一（对应其 `..`）。
    /// 目标的数据在其最后一个引用释放时才被回收。
    pub fn dir_unlink(&mut self, name: &DirName) -> Result<()> {
        // 名称不能是 . 和 ..
        if is_dot_or_dotdot(name) {
            return Err(FsError::InvalidPath)
        }

        let (inode, offset) = self.dir_lookup(name)?;

        let mut idata = inode.lock();
        if idata.get_nlink() < 1 {
            panic!("entry inode's link is zero");
        }
        if idata.get_itype() == InodeType::Directory && !idata.dir_is_empty() {
            return Err(FsError::DirectoryNotEmpty)
        }

        if self.write_entry(offset, &DirEntry::empty()).is_err() {
            panic!("cannot write entry previously read");
        }

        if idata.get_itype() == InodeType::Directory {
            self.unlink();
            self.update();
        }
        idata.unlink();
        idata.update();
        Ok(())
    }

    /// 除 `.` 与 `..` 外是否没有其他目录项
    pub fn dir_is_empty(&mut self) -> bool {
        let size = self.get_size();
        for off in ((2 * DIRENT_SIZE as u32)..size).step_by(DIRENT_SIZE) {
            if self.read_entry(off).inum != 0 {
                return false
            }
        }
        true
    }

    /// 列出全部非空目录项
    pub fn read_dir(&mut self) -> Vec<DirEntry> {
        self.assert_dir();
        let size = self.get_size();
        (0..size)
            .step_by(DIRENT_SIZE)
            .map(|off| self.read_entry(off))
            .filter(|de| de.inum != 0)
            .collect()
    }
}
