//! 缓存层

use array_macro::array;

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::consts::fs::{BSIZE, NBUF};
use crate::driver::BlockDevice;
use crate::sleeplock::{SleepLock, SleepLockGuard};

/// 缓冲区缓存（Buffer Cache），位于文件系统与块设备之间。
///
/// 固定数量 `NBUF` 的缓冲块，按 LRU 顺序复用。
/// 元信息（设备号、块号、引用计数、链表位置）由 `ctrl` 互斥锁保护，
/// 块内容由每个缓冲块自己的睡眠锁保护。
/// 查找与回收只在 `ctrl` 下进行，磁盘 I/O 只在持有睡眠锁时进行，
/// 因此不会持有表锁做 I/O。
pub struct Bcache {
    disk: Arc<dyn BlockDevice>,
    ctrl: Mutex<BufLru>,
    bufs: Box<[BufInner]>,
    hits: AtomicU64,
    misses: AtomicU64,
    disk_reads: AtomicU64,
    disk_writes: AtomicU64,
}

impl Bcache {
    pub fn new(disk: Arc<dyn BlockDevice>) -> Self {
        Self {
            disk,
            ctrl: Mutex::new(BufLru::new()),
            bufs: (0..NBUF).map(|_| BufInner::new()).collect(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            disk_reads: AtomicU64::new(0),
            disk_writes: AtomicU64::new(0),
        }
    }

    /// 获取指定设备与块号对应的缓冲块。
    ///
    /// # 功能说明
    /// 先在缓存中按 `(dev, blockno)` 查找，命中则增加引用计数；
    /// 未命中则从 LRU 尾部回收一个引用计数为 0 的缓冲块，
    /// 重新绑定到该块并清除 `valid`。本函数不访问磁盘。
    ///
    /// # 返回值
    /// 持有该缓冲块睡眠锁的 [`Buf`]。
    ///
    /// # Panics
    /// 所有缓冲块都被引用时无法回收，触发 panic（`"no usable buffer"`）。
    fn bget(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let mut ctrl = self.ctrl.lock();

        let index = match ctrl.find_cached(dev, blockno) {
            Some(index) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                index
            }
            None => {
                // 回收最近最少使用（LRU）的未使用缓冲区
                match ctrl.recycle(dev, blockno) {
                    Some(index) => {
                        self.misses.fetch_add(1, Ordering::Relaxed);
                        self.bufs[index].valid.store(false, Ordering::Relaxed);
                        self.bufs[index].dirty.store(false, Ordering::Relaxed);
                        index
                    }
                    None => panic!("no usable buffer"),
                }
            }
        };
        // 先放开表锁，再睡眠等待缓冲块本身的锁
        drop(ctrl);

        Buf {
            bcache: self,
            index,
            blockno,
            data: Some(self.bufs[index].data.lock()),
        }
    }

    /// 从缓存读取块，缓冲块无效时先从磁盘读入。
    ///
    /// # Panics
    /// - 没有可用缓冲块
    /// - 底层设备读失败，此时无法在事务中途回退
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let mut b = self.bget(dev, blockno);
        if !self.bufs[b.index].valid.load(Ordering::Relaxed) {
            trace!("bio: miss on block {}", blockno);
            let data = b.data_mut();
            if let Err(e) = self.disk.read_block(blockno, data) {
                panic!("bio: read block {} failed: {}", blockno, e);
            }
            self.disk_reads.fetch_add(1, Ordering::Relaxed);
            self.bufs[b.index].valid.store(true, Ordering::Relaxed);
        }
        b
    }

    fn brelse(&self, index: usize) {
        self.ctrl.lock().move_if_no_ref(index);
    }

    fn pin(&self, index: usize) {
        self.ctrl.lock().inner[index].refcnt += 1;
    }

    fn unpin(&self, index: usize) {
        let mut ctrl = self.ctrl.lock();
        let rc = ctrl.inner[index].refcnt;
        if rc <= 1 {
            panic!("buf unpin not match");
        }
        ctrl.inner[index].refcnt = rc - 1;
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn disk_reads(&self) -> u64 {
        self.disk_reads.load(Ordering::Relaxed)
    }

    pub fn disk_writes(&self) -> u64 {
        self.disk_writes.load(Ordering::Relaxed)
    }

    /// 当前被引用（含被日志钉住）的缓冲块数量
    pub fn referenced(&self) -> usize {
        self.ctrl.lock().inner.iter().filter(|b| b.refcnt > 0).count()
    }
}

/// 已加锁的缓冲块，代表一个特定的 `(dev, blockno)`。
///
/// 持有缓冲块的睡眠锁；离开作用域时先释放睡眠锁，
/// 再在表锁下减少引用计数并更新 LRU 位置。
pub struct Buf<'a> {
    bcache: &'a Bcache,
    index: usize,
    blockno: u32,
    /// 在 `Buf` 生命周期内始终为 `Some`，`Drop` 时先取出以释放睡眠锁
    data: Option<SleepLockGuard<'a, BufData>>,
}

impl<'a> Buf<'a> {
    pub fn read_blockno(&self) -> u32 {
        self.blockno
    }

    /// 直接写回磁盘，不经过日志
    pub fn bwrite(&mut self) {
        let bcache = self.bcache;
        let blockno = self.blockno;
        if let Err(e) = bcache.disk.write_block(blockno, self.data()) {
            panic!("bio: write block {} failed: {}", blockno, e);
        }
        bcache.disk_writes.fetch_add(1, Ordering::Relaxed);
        bcache.bufs[self.index].dirty.store(false, Ordering::Relaxed);
    }

    pub fn data(&self) -> &[u8; BSIZE] {
        match self.data.as_ref() {
            Some(guard) => &guard.0,
            None => unreachable!(),
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8; BSIZE] {
        match self.data.as_mut() {
            Some(guard) => &mut guard.0,
            None => unreachable!(),
        }
    }

    /// 标记为脏：内容已修改但尚未写回原位置
    pub(super) fn mark_dirty(&self) {
        self.bcache.bufs[self.index].dirty.store(true, Ordering::Relaxed);
    }

    pub(super) fn is_dirty(&self) -> bool {
        self.bcache.bufs[self.index].dirty.load(Ordering::Relaxed)
    }

    /// 引用计数加一，在 `unpin` 之前该缓冲块不会被回收。
    pub(super) fn pin(&self) {
        self.bcache.pin(self.index);
    }

    /// 与 `pin` 配对，调用者此时必须仍持有本缓冲块。
    pub(super) fn unpin(&self) {
        self.bcache.unpin(self.index);
    }
}

impl<'a> Drop for Buf<'a> {
    fn drop(&mut self) {
        drop(self.data.take());
        self.bcache.brelse(self.index);
    }
}

/// 缓冲区缓存的 LRU 控制结构。
///
/// 以数组下标代替指针构成双向链表：`head` 为最近使用，`tail` 为最久未使用。
struct BufLru {
    inner: [BufCtrl; NBUF],
    head: usize,
    tail: usize,
}

impl BufLru {
    fn new() -> Self {
        let mut inner = array![_ => BufCtrl::new(); NBUF];
        for i in 0..NBUF {
            inner[i].prev = if i == 0 { None } else { Some(i - 1) };
            inner[i].next = if i + 1 == NBUF { None } else { Some(i + 1) };
        }
        Self {
            inner,
            head: 0,
            tail: NBUF - 1,
        }
    }

    /// 从头部开始查找已缓存的块，命中时增加引用计数。
    fn find_cached(&mut self, dev: u32, blockno: u32) -> Option<usize> {
        let mut b = Some(self.head);
        while let Some(i) = b {
            let bref = &mut self.inner[i];
            if bref.bound && bref.dev == dev && bref.blockno == blockno {
                bref.refcnt += 1;
                return Some(i)
            }
            b = bref.next;
        }
        None
    }

    /// 从尾部向前找第一个引用计数为 0 的缓冲块并重新绑定。
    fn recycle(&mut self, dev: u32, blockno: u32) -> Option<usize> {
        let mut b = Some(self.tail);
        while let Some(i) = b {
            let bref = &mut self.inner[i];
            if bref.refcnt == 0 {
                bref.dev = dev;
                bref.blockno = blockno;
                bref.bound = true;
                bref.refcnt = 1;
                return Some(i)
            }
            b = bref.prev;
        }
        None
    }

    /// 引用计数减一，归零时把缓冲块移到链表头部（最近使用）。
    fn move_if_no_ref(&mut self, index: usize) {
        let b = &mut self.inner[index];
        if b.refcnt == 0 {
            panic!("brelse: buffer {} not referenced", index);
        }
        b.refcnt -= 1;
        if b.refcnt > 0 || self.head == index {
            return
        }

        // 分离
        let (prev, next) = (b.prev, b.next);
        if let Some(p) = prev {
            self.inner[p].next = next;
        }
        match next {
            Some(n) => self.inner[n].prev = prev,
            None => {
                if let Some(p) = prev {
                    self.tail = p;
                }
            }
        }

        // 附加到头部
        let old_head = self.head;
        self.inner[old_head].prev = Some(index);
        self.inner[index].prev = None;
        self.inner[index].next = Some(old_head);
        self.head = index;
    }

    /// 从最近使用到最久未使用的块号序列，只用于测试
    #[cfg(test)]
    fn order(&self) -> Vec<(bool, u32)> {
        let mut v = Vec::new();
        let mut b = Some(self.head);
        while let Some(i) = b {
            v.push((self.inner[i].bound, self.inner[i].blockno));
            b = self.inner[i].next;
        }
        v
    }
}

struct BufCtrl {
    dev: u32,
    blockno: u32,
    /// 是否曾经绑定过某个块，未绑定的缓冲块不参与查找
    bound: bool,
    prev: Option<usize>,
    next: Option<usize>,
    refcnt: usize,
}

impl BufCtrl {
    const fn new() -> Self {
        Self {
            dev: 0,
            blockno: 0,
            bound: false,
            prev: None,
            next: None,
            refcnt: 0,
        }
    }
}

/// 缓冲块的数据部分
///
/// `valid` 与 `dirty` 只在持有表锁（回收时）或该块睡眠锁时修改。
struct BufInner {
    valid: AtomicBool,
    dirty: AtomicBool,
    data: SleepLock<BufData>,
}

impl BufInner {
    fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            data: SleepLock::new(BufData::new(), "BufData"),
        }
    }
}

#[repr(C, align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    const fn new() -> Self {
        Self([0; BSIZE])
    }
}
