//! 一致性检查与统计信息

use std::collections::HashMap;
use std::fmt;

use log::{info, warn};

use crate::consts::fs::{NDIRECT, NINDIRECT};

use super::block::{bm_count_free, bm_is_set, inode_count_free};
use super::inode::{DiskInode, InodeType, locate_inode_offset};
use super::superblock::read_u32;
use super::{FileSystem, FsCore};

/// 检查发现的一个问题
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsckProblem {
    /// 磁盘索引节点的类型字段不是已知取值
    BadType { inum: u32, raw: u16 },
    /// 引用的块号超出卷的范围
    OutOfRange { inum: u32, block: u32 },
    /// 引用了元数据区中的块
    MetadataBlock { inum: u32, block: u32 },
    /// 同一个块被引用了两次
    DuplicateBlock { inum: u32, block: u32, first_owner: u32 },
    /// 引用的块在位图中是空闲的
    NotInBitmap { inum: u32, block: u32 },
    /// 位图中已分配却没有任何索引节点引用的数据块
    Leaked { block: u32 },
}

impl fmt::Display for FsckProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::BadType { inum, raw } => write!(f, "inode {} has unknown type {}", inum, raw),
            Self::OutOfRange { inum, block } => {
                write!(f, "inode {} references block {} out of range", inum, block)
            }
            Self::MetadataBlock { inum, block } => {
                write!(f, "inode {} references block {} in the metadata region", inum, block)
            }
            Self::DuplicateBlock { inum, block, first_owner } => write!(
                f,
                "inode {} references block {} already owned by inode {}",
                inum, block, first_owner
            ),
            Self::NotInBitmap { inum, block } => {
                write!(f, "inode {} references block {} but the bitmap says free", inum, block)
            }
            Self::Leaked { block } => write!(f, "block {} is allocated but unreferenced", block),
        }
    }
}

/// 检查结果
#[derive(Debug, Clone, Default)]
pub struct FsckReport {
    /// 检查过的已分配索引节点数
    pub inodes: u32,
    /// 被引用的块数（含间接块）
    pub blocks: u32,
    pub problems: Vec<FsckProblem>,
}

impl FsckReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

/// 卷与缓存的统计信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    /// 数据区中的空闲块数
    pub free_blocks: u32,
    pub free_inodes: u32,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub disk_reads: u64,
    pub disk_writes: u64,
    /// 当前被引用的索引节点缓存槽位数
    pub inodes_cached: usize,
}

struct Checker<'a> {
    fs: &'a FsCore,
    data_start: u32,
    owners: HashMap<u32, u32>,
    report: FsckReport,
}

impl<'a> Checker<'a> {
    /// 记录一次引用，返回该块是否可以安全地继续读取
    fn check(&mut self, inum: u32, block: u32) -> bool {
        if block == 0 {
            return false
        }
        let problem = if block >= self.fs.sb.size() {
            Some(FsckProblem::OutOfRange { inum, block })
        } else if block < self.data_start {
            Some(FsckProblem::MetadataBlock { inum, block })
        } else if let Some(&first_owner) = self.owners.get(&block) {
            Some(FsckProblem::DuplicateBlock { inum, block, first_owner })
        } else {
            None
        };
        if let Some(p) = problem {
            self.report.problems.push(p);
            return false
        }

        self.owners.insert(block, inum);
        self.report.blocks += 1;
        if !bm_is_set(self.fs, self.fs.dev, block) {
            self.report.problems.push(FsckProblem::NotInBitmap { inum, block });
        }
        true
    }

    fn check_inode(&mut self, inum: u32, dinode: &DiskInode) {
        for &addr in &dinode.addrs[..NDIRECT] {
            self.check(inum, addr);
        }
        let indirect = dinode.addrs[NDIRECT];
        if self.check(inum, indirect) {
            let buf = self.fs.bcache.bread(self.fs.dev, indirect);
            let addrs: Vec<u32> = (0..NINDIRECT).map(|i| read_u32(buf.data(), i * 4)).collect();
            drop(buf);
            for addr in addrs {
                self.check(inum, addr);
            }
        }
    }
}

impl FileSystem {
    /// 离线一致性检查。
    ///
    /// # 功能说明
    /// 扫描全部磁盘索引节点（经由缓冲区缓存，因而能看到已提交的最新内容），检查其引用的块：
    /// 不越界、不落在元数据区、不被重复引用、在位图中已分配；
    /// 最后检查位图中已分配的数据块是否都有引用。
    /// 调用时不应有进行中的文件系统操作。
    pub fn fsck(&self) -> FsckReport {
        let fs = self.core().as_ref();
        let sb = fs.sb;
        let mut checker = Checker {
            fs,
            data_start: sb.data_start(),
            owners: HashMap::new(),
            report: FsckReport::default(),
        };

        for inum in 1..sb.ninodes {
            let buf = fs.bcache.bread(fs.dev, sb.locate_inode(inum));
            let raw = &buf.data()[locate_inode_offset(inum)..];
            let raw_type = u16::from_le_bytes([raw[0], raw[1]]);
            let dinode = match InodeType::from_raw(raw_type) {
                Some(InodeType::Empty) => continue,
                Some(_) => DiskInode::decode(raw),
                None => {
                    checker.report.problems.push(FsckProblem::BadType { inum, raw: raw_type });
                    continue
                }
            };
            drop(buf);
            checker.report.inodes += 1;
            checker.check_inode(inum, &dinode);
        }

        for block in checker.data_start..sb.size() {
            if !checker.owners.contains_key(&block) && bm_is_set(fs, fs.dev, block) {
                checker.report.problems.push(FsckProblem::Leaked { block });
            }
        }

        let report = checker.report;
        for p in &report.problems {
            warn!("fsck: {}", p);
        }
        info!(
            "fsck: {} inodes, {} blocks, {} problems",
            report.inodes,
            report.blocks,
            report.problems.len()
        );
        report
    }

    pub fn stats(&self) -> FsStats {
        let fs = self.core();
        FsStats {
            free_blocks: bm_count_free(fs, fs.dev),
            free_inodes: inode_count_free(fs, fs.dev),
            cache_hits: fs.bcache.hits(),
            cache_misses: fs.bcache.misses(),
            disk_reads: fs.bcache.disk_reads(),
            disk_writes: fs.bcache.disk_writes(),
            inodes_cached: fs.icache.in_use(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::consts::fs::BSIZE;
    use crate::fs::tests::scratch_fs;

    fn write_file(fs: &FileSystem, path: &str, len: usize) -> u32 {
        let _tx = fs.transaction();
        let inode = fs.create(path, InodeType::File, 0, 0).unwrap();
        inode.lock().write(&vec![1u8; len], 0).unwrap();
        inode.inum()
    }

    #[test]
    fn fresh_volume_is_clean() {
        let fs = scratch_fs();
        write_file(&fs, "/a", 3 * BSIZE);
        let report = fs.fsck();
        assert!(report.is_clean(), "{:?}", report.problems);
        assert_eq!(report.inodes, 2);
        // 根目录一个数据块，文件三个
        assert_eq!(report.blocks, 4);
    }

    #[test]
    fn forged_references_are_reported() {
        let fs = scratch_fs();
        let a = write_file(&fs, "/a", BSIZE);
        let b = write_file(&fs, "/b", BSIZE);
        let core = fs.core();
        let sb = core.sb;

        // b 的第二个块指向 a 的块，第三个落在元数据区，第四个在位图中空闲
        let shared = {
            let blockno = sb.locate_inode(b);
            let off = locate_inode_offset(b);
            let mut buf = core.bcache.bread(core.dev, blockno);
            let mut d = DiskInode::decode(&buf.data()[off..]);
            let shared = DiskInode::decode(&buf.data()[locate_inode_offset(a)..]).addrs[0];
            d.addrs[1] = shared;
            d.addrs[2] = sb.inodestart;
            d.addrs[3] = sb.size() - 1;
            d.encode(&mut buf.data_mut()[off..]);
            buf.bwrite();
            shared
        };

        let report = fs.fsck();
        assert!(report.problems.contains(&FsckProblem::DuplicateBlock {
            inum: b,
            block: shared,
            first_owner: a,
        }));
        assert!(report.problems.contains(&FsckProblem::MetadataBlock { inum: b, block: sb.inodestart }));
        assert!(report.problems.contains(&FsckProblem::NotInBitmap { inum: b, block: sb.size() - 1 }));
        assert!(!report.is_clean());
    }

    #[test]
    fn stats_track_allocation() {
        let fs = scratch_fs();
        let before = fs.stats();
        write_file(&fs, "/a", 2 * BSIZE);
        let after = fs.stats();
        assert_eq!(after.free_blocks, before.free_blocks - 2);
        assert_eq!(after.free_inodes, before.free_inodes - 1);
        assert!(after.disk_writes > before.disk_writes);
        assert!(after.cache_hits > before.cache_hits);
    }
}
