//! 自旋锁模块
//! 自旋锁将数据包裹在自身内部以保护这些数据。

use core::cell::UnsafeCell;
use core::mem;
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{fence, AtomicBool, AtomicIsize, Ordering};

use crate::process::{self, pop_off, push_off};

/// 表示一个自旋锁结构，用于保护缓存池等共享数据。
///
/// `SpinLock` 提供了互斥访问内部数据的能力，通过忙等待（busy-waiting）实现锁机制。
/// 持锁期间中断被关闭（`push_off`），因此中断侧的完成回调不会在检查与睡眠之间插入。
/// 该锁还跟踪持有锁的CPU ID，用于调试和死锁检测。
///
/// # 字段说明
/// - `lock`: 原子布尔值，表示锁的状态（`false`=未锁定，`true`=已锁定）；
/// - `name`: 锁的名称，用于调试和标识；
/// - `cpuid`: 当前持有锁的CPU ID（-1表示无CPU持有）；
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性。
#[derive(Debug)]
pub struct SpinLock<T: ?Sized> {
    lock: AtomicBool,
    name: &'static str,
    cpuid: AtomicIsize,
    data: UnsafeCell<T>,
}

// 为SpinLock实现Sync trait，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// 创建一个新的自旋锁实例。
    ///
    /// # 参数
    /// - `data`: 需要被保护的数据；
    /// - `name`: 锁的标识名称，用于调试。
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: AtomicBool::new(false),
            name,
            cpuid: AtomicIsize::new(-1),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// 获取自旋锁并返回一个守卫对象。
    ///
    /// # 功能说明
    /// 通过忙等待获取锁的所有权，返回一个守卫对象。
    /// 守卫对象实现了`Deref`和`DerefMut`，允许直接访问被保护数据。
    /// 当守卫对象离开作用域时，自动释放锁。
    ///
    /// # 示例
    /// ```ignore
    /// let lock = SpinLock::new(0, "test");
    /// {
    ///     let mut guard = lock.lock(); // 获取锁
    ///     *guard = 42; // 修改受保护数据
    /// } // 守卫离开作用域，自动释放锁
    /// ```
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 检查当前CPU是否持有此锁。
    ///
    /// # 前提条件
    /// - 中断必须已禁用（由`push_off`保证）。
    fn holding(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
            && self.cpuid.load(Ordering::Relaxed) == process::cpu_id() as isize
    }

    /// 获取锁的核心实现（内部方法）。
    ///
    /// # 流程解释
    /// 1. 调用`push_off()`禁用中断；
    /// 2. 检查是否已持有锁（防止死锁）；
    /// 3. 使用原子比较交换（CAS）忙等待获取锁；
    /// 4. 获取成功后设置内存屏障；
    /// 5. 记录当前CPU ID。
    fn acquire(&self) {
        push_off();
        if self.holding() {
            panic!("spinlock {} acquire", self.name);
        }
        while self.lock.compare_exchange(false, true,
            Ordering::Acquire, Ordering::Acquire).is_err() {
            core::hint::spin_loop();
        }
        fence(Ordering::SeqCst);
        self.cpuid.store(process::cpu_id() as isize, Ordering::Relaxed);
    }

    /// 释放锁的核心实现（内部方法）。
    ///
    /// # 流程解释
    /// 1. 验证当前CPU确实持有锁；
    /// 2. 清除CPU ID记录；
    /// 3. 设置内存屏障确保操作顺序；
    /// 4. 原子存储`false`释放锁；
    /// 5. 调用`pop_off()`恢复中断状态。
    fn release(&self) {
        if !self.holding() {
            panic!("spinlock {} release", self.name);
        }
        self.cpuid.store(-1, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.lock.store(false, Ordering::Release);
        pop_off();
    }
}

/// 自旋锁守卫对象，提供对受保护数据的访问。
///
/// 当守卫对象存在时，表示锁已被持有。
/// 守卫离开作用域时自动释放锁，确保锁的释放。
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> SpinLockGuard<'a, T> {
    /// 在 `channel` 上睡眠，醒来后重新持有同一把锁。
    ///
    /// # 功能说明
    /// 调度器先登记睡眠者再释放本锁，因此在释放之前已经检查过的条件
    /// 不会因为一次恰好发生在两者之间的唤醒而被错过。
    /// 醒来并不意味着条件已经满足，调用者必须在循环中重新检查。
    ///
    /// # 返回值
    /// 重新获取到的守卫对象。
    pub fn sleep(self, channel: usize) -> SpinLockGuard<'a, T> {
        let lock = self.lock;
        mem::forget(self);
        process::sleep(channel, &mut || lock.release());
        lock.lock()
    }
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    /// 当守卫离开作用域时自动释放锁，并恢复中断状态（通过`pop_off`）
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    use std::sync::Arc;
    use std::thread;

    /// 基础功能测试：连续两次获取并释放同一把锁
    #[test]
    fn smoke() {
        testutil::boot();
        let m = SpinLock::new((), "smoke");
        drop(m.lock());
        drop(m.lock());
    }

    #[test]
    #[should_panic(expected = "spinlock reentrant acquire")]
    fn reentrant_acquire_panics() {
        testutil::boot();
        let m = SpinLock::new((), "reentrant");
        let _g1 = m.lock();
        let _g2 = m.lock();
    }

    #[test]
    fn sleep_rechecks_after_wakeup() {
        testutil::boot();
        let flag = Arc::new(SpinLock::new(false, "flag"));
        let chan = Arc::as_ptr(&flag) as usize;

        let waiter = {
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                let mut guard = flag.lock();
                while !*guard {
                    guard = guard.sleep(chan);
                }
            })
        };

        // 一次没有改变条件的唤醒不能让等待者返回
        process::wakeup(chan);
        thread::sleep(std::time::Duration::from_millis(20));
        assert!(!waiter.is_finished());

        *flag.lock() = true;
        process::wakeup(chan);
        waiter.join().unwrap();
    }

    #[test]
    fn counter_under_contention() {
        testutil::boot();
        let counter = Arc::new(SpinLock::new(0usize, "counter"));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *counter.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock(), 4000);
    }
}
