//! 日志层
//!
//! 简化的 write-ahead redo 日志，所有并发的文件系统操作共享同一个事务，
//! 最后一个操作结束时整体提交。
//!
//! 日志区在磁盘上的格式：第一个块是日志头（块数 + 块号数组），
//! 其后第 `i` 个块保存日志头中第 `i` 个块号对应的新内容。

use log::{debug, info};
use parking_lot::{Condvar, Mutex};

use crate::consts::fs::{BSIZE, LOGSIZE, MAXOPBLOCKS};

use super::bio::{Bcache, Buf};
use super::superblock::{read_u32, write_u32, SuperBlock};

/// 用于记录和管理文件系统日志的核心结构体。
///
/// 日志区位置在挂载时由超级块确定；可变状态放在 `state` 中，
/// 由互斥锁保护，`cond` 用于在提交进行中或空间不足时让 `begin_op` 等待。
pub struct Log {
    /// 所在磁盘设备的编号
    dev: u32,
    /// 日志区在磁盘中的起始块号（日志头所在块）
    start: u32,
    /// 单个事务最多能记录的块数，受日志头容量与日志区大小共同限制
    capacity: usize,
    state: Mutex<LogState>,
    cond: Condvar,
}

struct LogState {
    /// 当前正在进行的文件系统操作数
    outstanding: usize,
    /// 为 true 时禁止新的文件系统操作进入
    committing: bool,
    lh: LogHeader,
}

impl Log {
    /// 根据超级块建立日志，不访问磁盘；挂载时随后需调用 [`Log::recover`]。
    pub fn new(dev: u32, sb: &SuperBlock) -> Self {
        let (start, nlog) = sb.read_log();
        let capacity = LOGSIZE.min(nlog.saturating_sub(1) as usize);
        Self {
            dev,
            start,
            capacity,
            state: Mutex::new(LogState {
                outstanding: 0,
                committing: false,
                lh: LogHeader::empty(),
            }),
            cond: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 挂载时检查日志头，若存在已提交但尚未安装完的事务则重放。
    ///
    /// # 功能说明
    /// 日志头块数大于 0 说明上次提交在两次写日志头之间被打断，
    /// 此时把每个日志块复制回原位置，再把日志头清零。
    /// 重放是幂等的，重复执行得到相同结果。
    ///
    /// # Panics
    /// 日志头记录的块数超出容量，说明日志区已损坏。
    pub fn recover(&self, bcache: &Bcache) {
        info!("file system: checking logs");
        let lh = self.read_head(bcache);
        if lh.len > self.capacity {
            panic!("log: corrupt header with {} entries", lh.len);
        }
        if lh.len > 0 {
            info!("file system: recovering {} blocks from logs", lh.len);
            self.install_trans(bcache, &lh, true);
            self.write_head(bcache, &LogHeader::empty());
        } else {
            info!("file system: no need to recover");
        }
        self.state.lock().lh = LogHeader::empty();
    }

    fn read_head(&self, bcache: &Bcache) -> LogHeader {
        let buf = bcache.bread(self.dev, self.start);
        LogHeader::decode(buf.data())
    }

    fn write_head(&self, bcache: &Bcache, lh: &LogHeader) {
        let mut buf = bcache.bread(self.dev, self.start);
        lh.encode(buf.data_mut());
        buf.bwrite();
    }

    /// 将日志块复制到各自的原位置
    fn install_trans(&self, bcache: &Bcache, lh: &LogHeader, recovering: bool) {
        for (i, &blockno) in lh.blocknos[..lh.len].iter().enumerate() {
            let log_buf = bcache.bread(self.dev, self.start + 1 + i as u32);
            let mut disk_buf = bcache.bread(self.dev, blockno);
            // 提交时被钉住的原位置缓冲块必然还未写回
            if !recovering && !disk_buf.is_dirty() {
                panic!("log: installing block {} which is not dirty", blockno);
            }
            disk_buf.data_mut().copy_from_slice(log_buf.data());
            disk_buf.bwrite();
            if !recovering {
                disk_buf.unpin();
            }
            drop(log_buf);
            drop(disk_buf);
        }
    }

    /// 提交：写日志头使事务可重放，安装，再清零日志头使其退役。
    /// 调用时不持有 `state` 锁，由 `committing` 标志排除其他操作。
    fn commit(&self, bcache: &Bcache, lh: &LogHeader) {
        if lh.len > 0 {
            debug!("log: committing {} blocks", lh.len);
            self.write_head(bcache, lh);
            self.install_trans(bcache, lh, false);
            self.write_head(bcache, &LogHeader::empty());
        }
    }

    /// 开始一个文件系统操作。
    ///
    /// 正在提交，或者再加入一个操作可能使日志溢出时，阻塞等待。
    pub fn begin_op(&self) {
        let mut guard = self.state.lock();
        while guard.committing
            || guard.lh.len + (guard.outstanding + 1) * MAXOPBLOCKS > self.capacity
        {
            self.cond.wait(&mut guard);
        }
        guard.outstanding += 1;
    }

    /// 记录一个被修改的缓冲块。
    ///
    /// # 功能说明
    /// - 没有进行中的操作时直接写回原位置（挂载与格式化时的引导写入）；
    /// - 否则在日志头中登记该块号（同一块只占一个槽位），
    ///   钉住缓冲块直到安装完成，并立即把内容写入对应的日志块。
    ///
    /// # Panics
    /// 事务涉及的不同块数超过日志容量。
    pub fn write(&self, bcache: &Bcache, mut buf: Buf<'_>) {
        let mut guard = self.state.lock();
        if guard.outstanding < 1 {
            drop(guard);
            buf.bwrite();
            return
        }

        let blockno = buf.read_blockno();
        let len = guard.lh.len;
        let slot = match guard.lh.blocknos[..len].iter().position(|&b| b == blockno) {
            Some(i) => i,
            None => {
                if len >= self.capacity {
                    panic!("log: not enough space for this transaction");
                }
                buf.pin();
                guard.lh.blocknos[len] = blockno;
                guard.lh.len += 1;
                len
            }
        };
        drop(guard);

        // 同一块在事务内不会被并发登记，调用者持有该块的睡眠锁
        buf.mark_dirty();
        let mut log_buf = bcache.bread(self.dev, self.start + 1 + slot as u32);
        log_buf.data_mut().copy_from_slice(buf.data());
        log_buf.bwrite();
    }

    /// 结束一个文件系统操作，最后一个操作结束时提交。
    ///
    /// # Panics
    /// - 没有与之匹配的 `begin_op`
    /// - 日志正在提交时结束操作
    pub fn end_op(&self, bcache: &Bcache) {
        let mut guard = self.state.lock();
        if guard.outstanding == 0 {
            panic!("log: end_op without begin_op");
        }
        if guard.committing {
            panic!("log: end fs op while the log is committing");
        }
        guard.outstanding -= 1;
        if guard.outstanding > 0 {
            // begin_op 可能在等待日志空间，而本操作预留的空间已经归还
            self.cond.notify_all();
            return
        }
        guard.committing = true;
        let lh = guard.lh.clone();
        drop(guard);

        self.commit(bcache, &lh);

        let mut guard = self.state.lock();
        guard.lh.len = 0;
        guard.committing = false;
        self.cond.notify_all();
    }

    /// 当前事务已登记的块数
    pub fn pending(&self) -> usize {
        self.state.lock().lh.len
    }
}

/// 日志头
///
/// 磁盘格式：`i32` 块数，其后 `LOGSIZE` 个 `i32` 块号，均为小端序。
#[derive(Clone)]
struct LogHeader {
    len: usize,
    blocknos: [u32; LOGSIZE],
}

impl LogHeader {
    const fn empty() -> Self {
        Self {
            len: 0,
            blocknos: [0; LOGSIZE],
        }
    }

    fn decode(block: &[u8; BSIZE]) -> Self {
        let mut lh = Self::empty();
        lh.len = read_u32(block, 0) as i32 as usize;
        for (i, b) in lh.blocknos.iter_mut().enumerate() {
            *b = read_u32(block, 4 + 4 * i);
        }
        lh
    }

    fn encode(&self, block: &mut [u8; BSIZE]) {
        write_u32(block, 0, self.len as u32);
        for (i, b) in self.blocknos.iter().enumerate() {
            let b = if i < self.len { *b } else { 0 };
            write_u32(block, 4 + 4 * i, b);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use crate::consts::fs::FSMAGIC;
    use crate::driver::RamDisk;

    const DEV: u32 = 1;

    fn test_sb() -> SuperBlock {
        SuperBlock {
            magic: FSMAGIC,
            size: 64,
            nblocks: 20,
            ninodes: 16,
            nlog: 31,
            logstart: 2,
            inodestart: 33,
            bmapstart: 34,
        }
    }

    fn mount_log(disk: &Arc<RamDisk>) -> (Bcache, Log) {
        let bcache = Bcache::new(disk.clone());
        let log = Log::new(DEV, &test_sb());
        log.recover(&bcache);
        (bcache, log)
    }

    fn setup() -> (Arc<RamDisk>, Bcache, Log) {
        let disk = Arc::new(RamDisk::new(64));
        let (bcache, log) = mount_log(&disk);
        (disk, bcache, log)
    }

    fn stage(bcache: &Bcache, log: &Log, blockno: u32, byte: u8) {
        let mut buf = bcache.bread(DEV, blockno);
        buf.data_mut()[0] = byte;
        log.write(bcache, buf);
    }

    #[test]
    fn capacity_bounded_by_region() {
        let (_disk, _bcache, log) = setup();
        assert_eq!(log.capacity(), 30);
        let mut sb = test_sb();
        sb.nlog = 8;
        assert_eq!(Log::new(DEV, &sb).capacity(), 7);
    }

    #[test]
    fn commit_installs_blocks() {
        let (disk, bcache, log) = setup();
        log.begin_op();
        stage(&bcache, &log, 40, 1);
        stage(&bcache, &log, 41, 2);
        // 尚未提交：原位置未修改，日志块已写入
        assert_eq!(disk.snapshot(40)[0], 0);
        assert_eq!(disk.snapshot(3)[0], 1);
        assert_eq!(disk.snapshot(4)[0], 2);
        log.end_op(&bcache);

        assert_eq!(disk.snapshot(40)[0], 1);
        assert_eq!(disk.snapshot(41)[0], 2);
        assert_eq!(read_u32(&disk.snapshot(2), 0), 0);
        assert_eq!(bcache.referenced(), 0);
    }

    #[test]
    fn staged_block_stays_dirty_until_installed() {
        let (_disk, bcache, log) = setup();
        log.begin_op();
        stage(&bcache, &log, 40, 1);
        assert!(bcache.bread(DEV, 40).is_dirty());
        log.end_op(&bcache);
        assert!(!bcache.bread(DEV, 40).is_dirty());
    }

    #[test]
    fn rewrite_reuses_slot() {
        let (disk, bcache, log) = setup();
        log.begin_op();
        stage(&bcache, &log, 40, 1);
        stage(&bcache, &log, 41, 2);
        stage(&bcache, &log, 40, 3);
        assert_eq!(log.pending(), 2);
        assert_eq!(disk.snapshot(3)[0], 3);
        log.end_op(&bcache);
        assert_eq!(disk.snapshot(40)[0], 3);
    }

    #[test]
    fn nested_ops_commit_once() {
        let (disk, bcache, log) = setup();
        log.begin_op();
        log.begin_op();
        stage(&bcache, &log, 40, 9);
        log.end_op(&bcache);
        assert_eq!(disk.snapshot(40)[0], 0);
        assert_eq!(log.pending(), 1);
        log.end_op(&bcache);
        assert_eq!(disk.snapshot(40)[0], 9);
        assert_eq!(log.pending(), 0);
    }

    #[test]
    fn write_outside_op_goes_home() {
        let (disk, bcache, log) = setup();
        stage(&bcache, &log, 45, 5);
        assert_eq!(disk.snapshot(45)[0], 5);
        assert_eq!(log.pending(), 0);
    }

    #[test]
    fn replay_after_crash_between_header_writes() {
        let (disk, bcache, log) = setup();
        log.begin_op();
        stage(&bcache, &log, 40, 7);
        stage(&bcache, &log, 41, 8);
        // 只有日志头与第一个块的安装落盘
        disk.crash_after(2);
        log.end_op(&bcache);
        assert_eq!(disk.snapshot(40)[0], 7);
        assert_eq!(disk.snapshot(41)[0], 0);
        assert_eq!(read_u32(&disk.snapshot(2), 0), 2);

        disk.restore_power();
        drop((bcache, log));
        for _ in 0..2 {
            let _ = mount_log(&disk);
            assert_eq!(disk.snapshot(40)[0], 7);
            assert_eq!(disk.snapshot(41)[0], 8);
            assert_eq!(read_u32(&disk.snapshot(2), 0), 0);
        }
    }

    #[test]
    fn crash_before_header_loses_transaction() {
        let (disk, bcache, log) = setup();
        log.begin_op();
        stage(&bcache, &log, 40, 7);
        disk.crash_after(0);
        log.end_op(&bcache);

        disk.restore_power();
        drop((bcache, log));
        let _ = mount_log(&disk);
        assert_eq!(disk.snapshot(40)[0], 0);
    }

    #[test]
    #[should_panic(expected = "end_op without begin_op")]
    fn end_without_begin() {
        let (_disk, bcache, log) = setup();
        log.end_op(&bcache);
    }

    #[test]
    #[should_panic(expected = "not enough space")]
    fn overflow_is_fatal() {
        let (_disk, bcache, log) = setup();
        log.begin_op();
        for b in 33..64 {
            stage(&bcache, &log, b, 1);
        }
    }
}
