//! 卷格式化
//!
//! 磁盘布局：
//! [ 引导块 | 超级块 | 日志 | 索引节点块 | 位图块 | 数据块 ]
//!
//! 格式化只写入元数据骨架，根目录在第一次挂载时创建。

use log::info;

use crate::consts::fs::{BPB, BSIZE, FSMAGIC, FSSIZE, LOGSIZE, MAXOPBLOCKS, NINODES};
use crate::driver::BlockDevice;
use crate::error::{FsError, Result};

use super::inode::IPB;
use super::superblock::{SuperBlock, SUPERBLOCK_BLOCKNO};

/// 卷的几何参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MkfsParams {
    /// 卷的总块数
    pub size: u32,
    /// 索引节点总数（含从不使用的 0 号）
    pub ninodes: u32,
    /// 日志区块数（含日志头）
    pub nlog: u32,
}

impl Default for MkfsParams {
    fn default() -> Self {
        Self {
            size: FSSIZE,
            ninodes: NINODES,
            nlog: LOGSIZE as u32 + 1,
        }
    }
}

impl MkfsParams {
    /// 计算各区域的位置
    ///
    /// # 可能的错误
    /// 参数无法构成合法的卷时返回 [`FsError::InvalidGeometry`]。
    pub fn layout(&self) -> Result<SuperBlock> {
        if self.nlog < MAXOPBLOCKS as u32 + 1 || self.nlog >= self.size {
            return Err(FsError::InvalidGeometry("log must hold at least one operation"))
        }
        if self.ninodes < 2 || self.ninodes > u16::MAX as u32 + 1 {
            return Err(FsError::InvalidGeometry("inode count out of range"))
        }

        let logstart = SUPERBLOCK_BLOCKNO + 1;
        let ninodeblocks = self.ninodes / IPB as u32 + 1;
        let nbitmap = self.size / BPB + 1;
        let inodestart = logstart + self.nlog;
        let bmapstart = inodestart + ninodeblocks;
        let nmeta = bmapstart + nbitmap;
        if nmeta >= self.size {
            return Err(FsError::InvalidGeometry("no room left for data blocks"))
        }

        Ok(SuperBlock {
            magic: FSMAGIC,
            size: self.size,
            nblocks: self.size - nmeta,
            ninodes: self.ninodes,
            nlog: self.nlog,
            logstart,
            inodestart,
            bmapstart,
        })
    }
}

/// 在设备上建立一个空卷。
///
/// # 功能说明
/// 清零卷内全部块，写入超级块，并在位图中把全部元数据块标记为已分配。
/// 直接写设备，不经过缓冲区缓存，因此不能在同一设备已挂载时调用。
///
/// # 可能的错误
/// - [`FsError::InvalidGeometry`]：参数不合法或设备容量不足
///
/// # Panics
/// 设备读写失败。
pub fn mkfs(disk: &dyn BlockDevice, params: MkfsParams) -> Result<SuperBlock> {
    if params.size > disk.num_blocks() {
        return Err(FsError::InvalidGeometry("volume larger than device"))
    }
    let sb = params.layout()?;

    let zero = [0u8; BSIZE];
    for blockno in 0..sb.size {
        write(disk, blockno, &zero);
    }

    let mut block = [0u8; BSIZE];
    sb.encode(&mut block);
    write(disk, SUPERBLOCK_BLOCKNO, &block);

    // 元数据块在位图中预先标记为已分配
    let used = sb.data_start();
    for base in (0..used).step_by(BPB as usize) {
        let mut block = [0u8; BSIZE];
        for b in base..used.min(base + BPB) {
            let off = b - base;
            block[(off / 8) as usize] |= 1 << (off % 8);
        }
        write(disk, sb.bitmap_blockno(base), &block);
    }

    info!(
        "mkfs: {} blocks ({} data), {} inodes, log {} at {}, inodes at {}, bitmap at {}",
        sb.size, sb.nblocks, sb.ninodes, sb.nlog, sb.logstart, sb.inodestart, sb.bmapstart
    );
    Ok(sb)
}

fn write(disk: &dyn BlockDevice, blockno: u32, data: &[u8; BSIZE]) {
    if let Err(e) = disk.write_block(blockno, data) {
        panic!("mkfs: write block {} failed: {}", blockno, e);
    }
}
