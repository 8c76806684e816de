//! 内存盘
//!
//! 全部块保存在内存中，并统计读写次数。
//! `crash_after` 用于模拟掉电：计数耗尽之后的写入被静默丢弃，
//! 之后在同一块盘上重新挂载即可检验日志恢复。

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::consts::fs::BSIZE;

use super::{out_of_range, BlockDevice};

pub struct RamDisk {
    blocks: Mutex<Vec<[u8; BSIZE]>>,
    /// 剩余允许落盘的写入次数，`None` 表示不限制
    write_budget: Mutex<Option<u64>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl RamDisk {
    pub fn new(nblocks: u32) -> Self {
        Self {
            blocks: Mutex::new(vec![[0; BSIZE]; nblocks as usize]),
            write_budget: Mutex::new(None),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// 再允许 `n` 次写入落盘，之后的写入全部丢失
    pub fn crash_after(&self, n: u64) {
        *self.write_budget.lock() = Some(n);
    }

    /// 恢复供电，之后的写入重新生效
    pub fn restore_power(&self) {
        *self.write_budget.lock() = None;
    }

    pub fn crashed(&self) -> bool {
        matches!(*self.write_budget.lock(), Some(0))
    }

    /// 已完成的读次数
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// 真正落盘的写次数
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// 直接读取某个块的原始内容，绕过文件系统
    pub fn snapshot(&self, blockno: u32) -> [u8; BSIZE] {
        self.blocks.lock()[blockno as usize]
    }

    /// 直接改写某个块的原始内容，用于构造损坏的卷
    pub fn poke(&self, blockno: u32, data: &[u8; BSIZE]) {
        self.blocks.lock()[blockno as usize] = *data;
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, blockno: u32, buf: &mut [u8; BSIZE]) -> io::Result<()> {
        let blocks = self.blocks.lock();
        let block = blocks
            .get(blockno as usize)
            .ok_or_else(|| out_of_range(blockno, blocks.len() as u32))?;
        buf.copy_from_slice(block);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_block(&self, blockno: u32, buf: &[u8; BSIZE]) -> io::Result<()> {
        let mut budget = self.write_budget.lock();
        match budget.as_mut() {
            Some(0) => return Ok(()),
            Some(n) => *n -= 1,
            None => {}
        }
        drop(budget);

        let mut blocks = self.blocks.lock();
        let nblocks = blocks.len() as u32;
        let block = blocks
            .get_mut(blockno as usize)
            .ok_or_else(|| out_of_range(blockno, nblocks))?;
        block.copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn num_blocks(&self) -> u32 {
        self.blocks.lock().len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_persists() {
        let disk = RamDisk::new(4);
        let mut buf = [0u8; BSIZE];
        buf[0] = 7;
        disk.write_block(2, &buf).unwrap();
        let mut out = [0u8; BSIZE];
        disk.read_block(2, &mut out).unwrap();
        assert_eq!(out[0], 7);
        assert_eq!(disk.reads(), 1);
        assert_eq!(disk.writes(), 1);
        assert!(disk.read_block(4, &mut out).is_err());
    }

    #[test]
    fn writes_after_crash_are_lost() {
        let disk = RamDisk::new(2);
        disk.crash_after(1);
        disk.write_block(0, &[1; BSIZE]).unwrap();
        disk.write_block(1, &[2; BSIZE]).unwrap();
        assert!(disk.crashed());
        assert_eq!(disk.snapshot(0)[0], 1);
        assert_eq!(disk.snapshot(1)[0], 0);
        assert_eq!(disk.writes(), 1);

        disk.restore_power();
        disk.write_block(1, &[2; BSIZE]).unwrap();
        assert_eq!(disk.snapshot(1)[0], 2);
    }
}
