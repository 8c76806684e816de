//! 路径解析与基于路径的目录操作
//!
//! 路径总是从根目录开始解析，没有当前工作目录的概念，
//! 因此 `a/b` 与 `/a/b` 等价。超过 `DIRSIZ` 的路径分量被截断。

use std::sync::Arc;

use log::warn;

use crate::consts::file::MAXPATH;
use crate::consts::fs::{DIRSIZ, ROOTINUM};
use crate::error::{FsError, Result};

use super::dir::{dir_name, DirName};
use super::inode::{Inode, InodeType};
use super::FsCore;

/// 从 `cur` 开始取出下一个路径分量。
///
/// # 返回值
/// `Some((名字, 下一个分量的起点))`；没有更多分量时返回 `None`。
/// 返回的起点已跳过分量之后的 `/`，等于 `path.len()` 说明这是最后一个分量。
fn skip_path(path: &[u8], mut cur: usize) -> Option<(DirName, usize)> {
    // 跳过前面的 b'/'
    while cur < path.len() && path[cur] == b'/' {
        cur += 1;
    }
    if cur == path.len() {
        return None
    }

    let start = cur;
    while cur < path.len() && path[cur] != b'/' {
        cur += 1;
    }
    let name = dir_name(&path[start..cur]);

    // 跳过后续的 b'/'
    while cur < path.len() && path[cur] == b'/' {
        cur += 1;
    }
    Some((name, cur))
}

/// 逐级解析路径。
///
/// `is_parent` 为 true 时在最后一个分量之前停下，返回其父目录与最后一个分量。
/// 失败时途中取得的所有引用都随句柄析构而释放。
fn namex(fs: &Arc<FsCore>, path: &str, is_parent: bool) -> Result<(Inode, DirName)> {
    let path = path.as_bytes();
    if path.is_empty() || path.len() >= MAXPATH {
        return Err(FsError::InvalidPath)
    }

    let mut inode = fs.iget(fs.dev, ROOTINUM)?;
    let mut name: DirName = [0; DIRSIZ];
    let mut cur = 0;
    while let Some((elem, next)) = skip_path(path, cur) {
        name = elem;
        cur = next;

        let mut data_guard = inode.lock();
        if data_guard.get_itype() != InodeType::Directory {
            return Err(FsError::NotDirectory)
        }
        if is_parent && cur == path.len() {
            drop(data_guard);
            return Ok((inode, name))
        }
        let (next_inode, _) = data_guard.dir_lookup(&name)?;
        drop(data_guard);
        inode = next_inode;
    }

    if is_parent {
        // 只有在查询根目录的父目录时才会到达这里
        warn!("namex: querying root inode's parent");
        return Err(FsError::InvalidPath)
    }
    Ok((inode, name))
}

/// 解析路径，返回目标索引节点的句柄（未加锁）
pub fn namei(fs: &Arc<FsCore>, path: &str) -> Result<Inode> {
    namex(fs, path, false).map(|(inode, _)| inode)
}

/// 解析路径的父目录，返回父目录句柄与最后一个分量的名字
pub fn namei_parent(fs: &Arc<FsCore>, path: &str) -> Result<(Inode, DirName)> {
    namex(fs, path, true)
}

/// 在 `path` 处创建索引节点，调用者需处于事务之中。
///
/// # 功能说明
/// 1. 解析父目录并加锁，检查名字是否已存在；
/// 2. 分配磁盘索引节点，写入设备号；
/// 3. 若为目录，写入 `.` 与 `..`；
/// 4. 最后才在父目录中加入目录项，新目录还要增加父目录的链接数。
///
/// 第 2 步之后的任何失败都把新索引节点的链接数置 0，
/// 由随后释放句柄时的回收路径将其清除。
///
/// # 参数
/// - `reuse`: 名字已存在时，若请求普通文件且已有项是普通文件或设备，直接返回已有项
///
/// # 可能的错误
/// - [`FsError::AlreadyExists`]：名字已存在（且不可复用）
/// - [`FsError::IsDirectory`]：可复用模式下已有项是目录
/// - 路径解析、索引节点分配与目录写入的错误
pub fn create(
    fs: &Arc<FsCore>,
    path: &str,
    itype: InodeType,
    major: u16,
    minor: u16,
    reuse: bool,
) -> Result<Inode> {
    let (dir_inode, name) = namei_parent(fs, path)?;
    let mut dir_idata = dir_inode.lock();

    // 先查找
    match dir_idata.dir_lookup(&name) {
        Ok((inode, _)) => {
            drop(dir_idata);
            if !reuse {
                return Err(FsError::AlreadyExists)
            }
            let existing = inode.lock().get_itype();
            return match (itype, existing) {
                (InodeType::File, InodeType::File | InodeType::Device) => Ok(inode),
                (_, InodeType::Directory) => Err(FsError::IsDirectory),
                _ => Err(FsError::AlreadyExists),
            }
        }
        Err(FsError::NotFound) => {}
        Err(e) => return Err(e),
    }

    // 未找到，创建
    let (dev, _) = dir_idata.get_dev_inum();
    let inode = fs.ialloc(dev, itype)?;
    let mut idata = inode.lock();
    idata.set_devnum(major, minor);
    idata.update();

    let linked = (|| -> Result<()> {
        if itype == InodeType::Directory {
            // . -> itself, .. -> parent
            idata.dir_link(&dir_name(b"."), inode.inum())?;
            idata.dir_link(&dir_name(b".."), dir_inode.inum())?;
        }
        dir_idata.dir_link(&name, inode.inum())
    })();

    if let Err(e) = linked {
        idata.unlink();
        idata.update();
        drop(idata);
        drop(inode);
        return Err(e)
    }

    if itype == InodeType::Directory {
        // 子目录的 .. 指向父目录
        dir_idata.link();
        dir_idata.update();
    }
    drop(idata);
    drop(dir_idata);
    Ok(inode)
}

/// 为已有的非目录文件增加一个名字。调用者需处于事务之中。
pub fn link(fs: &Arc<FsCore>, old: &str, new: &str) -> Result<()> {
    let inode = namei(fs, old)?;
    {
        let mut idata = inode.lock();
        if idata.get_itype() == InodeType::Directory {
            return Err(FsError::IsDirectory)
        }
        idata.link();
        idata.update();
    }

    let linked = (|| -> Result<()> {
        let (dir, name) = namei_parent(fs, new)?;
        let mut dir_idata = dir.lock();
        if dir_idata.get_dev_inum().0 != inode.dev() {
            return Err(FsError::CrossDevice)
        }
        dir_idata.dir_link(&name, inode.inum())
    })();

    if linked.is_err() {
        let mut idata = inode.lock();
        idata.unlink();
        idata.update();
    }
    linked
}

/// 删除一个名字。调用者需处于事务之中。
pub fn unlink(fs: &Arc<FsCore>, path: &str) -> Result<()> {
    let (dir, name) = namei_parent(fs, path)?;
    let mut dir_idata = dir.lock();
    dir_idata.dir_unlink(&name)
}
