//! 超级块操作

use crate::consts::fs::{BPB, BSIZE, FSMAGIC, ROOTINUM};
use crate::error::{FsError, Result};

use super::inode::IPB;

/// 超级块所在的块号
pub const SUPERBLOCK_BLOCKNO: u32 = 1;

/// 内存中的超级块副本
///
/// 挂载时从块 1 解码一次，之后只读。
/// 磁盘上为 8 个小端序 `u32`，字段顺序与结构体声明顺序一致。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    pub magic: u32,      // 文件系统魔数，必须为`FSMAGIC`
    pub size: u32,       // 文件系统映像总块数
    pub nblocks: u32,    // 数据块数量（不含元数据）
    pub ninodes: u32,    // 索引节点总数
    pub nlog: u32,       // 日志块数量（含日志头）
    pub logstart: u32,   // 第一个日志块的块号
    pub inodestart: u32, // 第一个索引节点块的块号
    pub bmapstart: u32,  // 第一个位图块的块号
}

impl SuperBlock {
    /// 从块内容解码超级块
    ///
    /// # 可能的错误
    /// 魔数不匹配时返回 [`FsError::BadMagic`]，卷被拒绝挂载。
    pub fn decode(block: &[u8; BSIZE]) -> Result<Self> {
        let mut fields = [0u32; 8];
        for (i, f) in fields.iter_mut().enumerate() {
            *f = read_u32(block, i * 4);
        }
        let [magic, size, nblocks, ninodes, nlog, logstart, inodestart, bmapstart] = fields;
        if magic != FSMAGIC {
            return Err(FsError::BadMagic(magic))
        }
        Ok(Self { magic, size, nblocks, ninodes, nlog, logstart, inodestart, bmapstart })
    }

    pub fn encode(&self, block: &mut [u8; BSIZE]) {
        let fields = [
            self.magic, self.size, self.nblocks, self.ninodes,
            self.nlog, self.logstart, self.inodestart, self.bmapstart,
        ];
        for (i, f) in fields.iter().enumerate() {
            write_u32(block, i * 4, *f);
        }
    }

    /// 读取日志区域信息
    ///
    /// # 返回值
    /// 元组`(起始块号, 日志块数量)`
    pub fn read_log(&self) -> (u32, u32) {
        (self.logstart, self.nlog)
    }

    /// 定位索引节点所在的磁盘块
    ///
    /// # Panics
    /// 当`inum`超出索引节点总数时触发panic
    pub fn locate_inode(&self, inum: u32) -> u32 {
        if inum >= self.ninodes {
            panic!("query inum {} larger than maximum inode nums {}", inum, self.ninodes);
        }
        inum / (IPB as u32) + self.inodestart
    }

    pub fn inode_size(&self) -> u32 {
        self.ninodes
    }

    /// 管理块 `blockno` 的位图块号
    pub fn bitmap_blockno(&self, blockno: u32) -> u32 {
        blockno / BPB + self.bmapstart
    }

    /// 位图占用的块数
    pub fn bitmap_blocks(&self) -> u32 {
        self.size / BPB + 1
    }

    /// 第一个数据块的块号，此前全部是元数据
    pub fn data_start(&self) -> u32 {
        self.bmapstart + self.bitmap_blocks()
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// 检查各区域按顺序排列且都落在卷与设备之内。
    ///
    /// 要求 `超级块 < 日志 <= 索引节点区 <= 位图 < 卷末尾 <= 设备末尾`，
    /// 全部用不会溢出的加法计算。
    ///
    /// # 可能的错误
    /// 任何一项不满足时返回 [`FsError::InvalidGeometry`]。
    pub fn check_geometry(&self, device_blocks: u32) -> Result<()> {
        let bad = FsError::InvalidGeometry;
        if self.size > device_blocks {
            return Err(bad("volume larger than device"))
        }
        if self.ninodes <= ROOTINUM {
            return Err(bad("no room for the root inode"))
        }
        if self.logstart <= SUPERBLOCK_BLOCKNO || self.nlog < 2 {
            return Err(bad("log region overlaps the superblock or is empty"))
        }
        let log_end = self.logstart.checked_add(self.nlog).ok_or(bad("log region overflows"))?;
        if log_end > self.inodestart {
            return Err(bad("log region overlaps the inode blocks"))
        }
        let inode_end = self
            .inodestart
            .checked_add(self.ninodes / IPB as u32 + 1)
            .ok_or(bad("inode region overflows"))?;
        if inode_end > self.bmapstart {
            return Err(bad("inode region overlaps the bitmap"))
        }
        let bitmap_end = self
            .bmapstart
            .checked_add(self.bitmap_blocks())
            .ok_or(bad("bitmap region overflows"))?;
        if bitmap_end > self.size {
            return Err(bad("metadata regions exceed the volume"))
        }
        Ok(())
    }
}

#[inline]
pub(super) fn read_u32(block: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&block[off..off + 4]);
    u32::from_le_bytes(b)
}

#[inline]
pub(super) fn write_u32(block: &mut [u8], off: usize, v: u32) {
    block[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_order_on_disk() {
        let sb = SuperBlock {
            magic: FSMAGIC,
            size: 1024,
            nblocks: 979,
            ninodes: 200,
            nlog: 30,
            logstart: 2,
            inodestart: 32,
            bmapstart: 36,
        };
        let mut block = [0u8; BSIZE];
        sb.encode(&mut block);
        assert_eq!(&block[0..4], &FSMAGIC.to_le_bytes());
        assert_eq!(read_u32(&block, 16), 30);
        assert_eq!(read_u32(&block, 28), 36);
        assert_eq!(SuperBlock::decode(&block), Ok(sb));
        assert_eq!(sb.data_start(), 37);
        assert_eq!(sb.locate_inode(64), 33);
    }

    fn default_sb() -> SuperBlock {
        SuperBlock {
            magic: FSMAGIC,
            size: 1024,
            nblocks: 979,
            ninodes: 200,
            nlog: 31,
            logstart: 2,
            inodestart: 33,
            bmapstart: 37,
        }
    }

    #[test]
    fn geometry_accepts_formatted_layout() {
        assert_eq!(default_sb().check_geometry(1024), Ok(()));
        assert!(default_sb().check_geometry(1023).is_err());
    }

    #[test]
    fn geometry_rejects_each_forged_field() {
        let forged: [fn(&mut SuperBlock); 10] = [
            |sb| sb.size = 5000,
            |sb| sb.ninodes = 1,
            |sb| sb.logstart = 1,
            |sb| sb.logstart = 5000,
            |sb| sb.logstart = u32::MAX,
            |sb| sb.nlog = u32::MAX,
            |sb| sb.inodestart = u32::MAX,
            |sb| sb.ninodes = 100_000,
            |sb| sb.bmapstart = u32::MAX,
            |sb| sb.bmapstart = 1024,
        ];
        for (i, forge) in forged.iter().enumerate() {
            let mut sb = default_sb();
            forge(&mut sb);
            assert!(
                matches!(sb.check_geometry(1024), Err(FsError::InvalidGeometry(_))),
                "case {}: {:?}",
                i,
                sb
            );
        }
    }

    #[test]
    fn bad_magic_rejected() {
        let block = [0u8; BSIZE];
        assert_eq!(SuperBlock::decode(&block), Err(FsError::BadMagic(0)));
    }
}
