//! 磁盘块操作，包括位映射与索引节点

use bit_field::BitField;

use crate::consts::fs::BPB;
use crate::error::{FsError, Result};

use super::inode::{DiskInode, InodeType, locate_inode_offset};
use super::FsCore;

/// 分配一个空闲的磁盘块，并将其内容清零。
///
/// # 功能说明
/// 按块号从小到大扫描位图（首次适配），找到第一个未置位的位，
/// 置位后通过日志写回位图块，再通过日志将新块清零。
///
/// # 返回值
/// 新分配的块号。
///
/// # Panics
/// 磁盘上已没有空闲块。
pub fn bm_alloc(fs: &FsCore, dev: u32) -> u32 {
    // 首先，迭代每个位图块
    let total_block = fs.sb.size();
    for base in (0..total_block).step_by(BPB as usize) {
        let mut buf = fs.bcache.bread(dev, fs.sb.bitmap_blockno(base));
        // 其次，迭代位图块中的每个位
        let found = (0..BPB)
            .take_while(|offset| base + offset < total_block)
            .find(|offset| !buf.data()[(offset / 8) as usize].get_bit((offset % 8) as usize));
        let offset = match found {
            Some(offset) => offset,
            None => continue,
        };
        buf.data_mut()[(offset / 8) as usize].set_bit((offset % 8) as usize, true);
        fs.log_write(buf);

        // 清零空闲块
        let free_bn = base + offset;
        let mut free_buf = fs.bcache.bread(dev, free_bn);
        free_buf.data_mut().fill(0);
        fs.log_write(free_buf);
        return free_bn
    }

    panic!("bitmap: cannot alloc any free block");
}

/// 释放一个磁盘块
///
/// # Panics
/// 该块本来就是空闲的（重复释放或元数据已损坏）。
pub fn bm_free(fs: &FsCore, dev: u32, blockno: u32) {
    let bm_blockno = fs.sb.bitmap_blockno(blockno);
    let bm_offset = blockno % BPB;
    let index = (bm_offset / 8) as usize;
    let bit = (bm_offset % 8) as usize;
    let mut buf = fs.bcache.bread(dev, bm_blockno);

    let byte = &mut buf.data_mut()[index];
    if !byte.get_bit(bit) {
        panic!("bitmap: double freeing a block");
    }
    byte.set_bit(bit, false);
    fs.log_write(buf);
}

/// 在位图中查询某个块是否已分配
pub fn bm_is_set(fs: &FsCore, dev: u32, blockno: u32) -> bool {
    let bm_offset = blockno % BPB;
    let buf = fs.bcache.bread(dev, fs.sb.bitmap_blockno(blockno));
    buf.data()[(bm_offset / 8) as usize].get_bit((bm_offset % 8) as usize)
}

/// 统计位图中空闲的块数
pub fn bm_count_free(fs: &FsCore, dev: u32) -> u32 {
    let total_block = fs.sb.size();
    let mut free = 0;
    for base in (0..total_block).step_by(BPB as usize) {
        let buf = fs.bcache.bread(dev, fs.sb.bitmap_blockno(base));
        free += (0..BPB)
            .take_while(|offset| base + offset < total_block)
            .filter(|offset| !buf.data()[(offset / 8) as usize].get_bit((offset % 8) as usize))
            .count() as u32;
    }
    free
}

/// 在磁盘上分配一个索引节点
///
/// # 功能说明
/// 从 1 号开始线性扫描磁盘上的索引节点数组，找到第一个类型为空的条目，
/// 清零后设置类型、链接数为 1，通过日志写回。
///
/// # 可能的错误
/// 没有空闲的磁盘索引节点时返回 [`FsError::OutOfInodes`]。
pub fn inode_alloc(fs: &FsCore, dev: u32, itype: InodeType) -> Result<u32> {
    let size = fs.sb.inode_size();
    for inum in 1..size {
        let blockno = fs.sb.locate_inode(inum);
        let offset = locate_inode_offset(inum);
        let mut buf = fs.bcache.bread(dev, blockno);
        let mut dinode = DiskInode::decode(&buf.data()[offset..]);
        if dinode.try_alloc(itype).is_ok() {
            dinode.encode(&mut buf.data_mut()[offset..]);
            fs.log_write(buf);
            return Ok(inum)
        }
    }

    Err(FsError::OutOfInodes)
}

/// 把磁盘索引节点直接标记为空闲，用于撤销尚未被任何目录引用的分配
pub fn inode_release(fs: &FsCore, dev: u32, inum: u32) {
    let mut buf = fs.bcache.bread(dev, fs.sb.locate_inode(inum));
    let offset = locate_inode_offset(inum);
    DiskInode::new().encode(&mut buf.data_mut()[offset..]);
    fs.log_write(buf);
}

/// 统计空闲的磁盘索引节点数量（不含从不使用的 0 号）
pub fn inode_count_free(fs: &FsCore, dev: u32) -> u32 {
    let mut free = 0;
    for inum in 1..fs.sb.inode_size() {
        let buf = fs.bcache.bread(dev, fs.sb.locate_inode(inum));
        let dinode = DiskInode::decode(&buf.data()[locate_inode_offset(inum)..]);
        if dinode.itype == InodeType::Empty {
            free += 1;
        }
    }
    free
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::fs::tests::scratch_fs;

    #[test]
    fn alloc_is_first_fit_and_zeroed() {
        let fs = scratch_fs();
        let core = fs.core();
        let data_start = core.sb.data_start();
        let _tx = core.begin();
        let first_free = (data_start..core.sb.size())
            .find(|&b| !bm_is_set(core, core.dev, b))
            .unwrap();
        let b = bm_alloc(core, core.dev);
        assert_eq!(b, first_free);
        assert!(bm_is_set(core, core.dev, b));
        assert!(core.bcache.bread(core.dev, b).data().iter().all(|&x| x == 0));
    }

    #[test]
    fn free_then_realloc_returns_free_block() {
        let fs = scratch_fs();
        let core = fs.core();
        let mut live = HashSet::new();
        let before = bm_count_free(core, core.dev);
        for round in 0..40 {
            let _tx = core.begin();
            let b = bm_alloc(core, core.dev);
            assert!(live.insert(b), "block {} handed out twice", b);
            if round % 3 == 2 {
                let victim = *live.iter().min().unwrap();
                bm_free(core, core.dev, victim);
                live.remove(&victim);
                let again = bm_alloc(core, core.dev);
                assert_eq!(again, victim);
                live.insert(again);
            }
        }
        assert_eq!(bm_count_free(core, core.dev), before - live.len() as u32);
    }

    #[test]
    #[should_panic(expected = "double freeing")]
    fn double_free_is_fatal() {
        let fs = scratch_fs();
        let core = fs.core();
        let _tx = core.begin();
        let b = bm_alloc(core, core.dev);
        bm_free(core, core.dev, b);
        bm_free(core, core.dev, b);
    }

    #[test]
    fn inode_alloc_runs_out() {
        let fs = scratch_fs();
        let core = fs.core();
        let free = inode_count_free(core, core.dev);
        for _ in 0..free {
            let _tx = core.begin();
            inode_alloc(core, core.dev, InodeType::File).unwrap();
        }
        let _tx = core.begin();
        assert_eq!(inode_alloc(core, core.dev, InodeType::File), Err(FsError::OutOfInodes));
    }
}
