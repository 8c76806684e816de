//! 睡眠锁模块
//! 提供基于条件变量休眠/唤醒机制的同步原语，适用于可能长时间持有的锁。
//!
//! 当锁被占用时，尝试获取锁的线程会阻塞在条件变量上，避免忙等待。
//! 缓冲块数据与索引节点内容都由睡眠锁保护，持有期间允许进行磁盘 I/O。

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut, Drop};

use parking_lot::{Condvar, Mutex};

/// 睡眠锁
///
/// # 字段说明
/// - `locked`: 由内部互斥锁保护的占用标志
/// - `cond`: 锁被释放时用于唤醒等待者
/// - `name`: 调试用名称，出现在错误解锁的 panic 信息中
/// - `data`: 被保护的数据
pub struct SleepLock<T: ?Sized> {
    locked: Mutex<bool>,
    cond: Condvar,
    name: &'static str,
    data: UnsafeCell<T>,
}

// 为SleepLock实现Sync，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            locked: parking_lot::const_mutex(false),
            cond: Condvar::new(),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut locked = self.locked.lock();

        // 当锁已被占用时循环等待
        while *locked {
            self.cond.wait(&mut locked);
        }
        *locked = true;
        drop(locked);

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    fn unlock(&self) {
        let mut locked = self.locked.lock();
        if !*locked {
            panic!("sleeplock {}: unlock while not locked", self.name);
        }
        *locked = false;
        self.cond.notify_one();
    }
}

pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
