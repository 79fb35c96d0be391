//! 进程调度接口
//!
//! 缓冲区缓存与 inode 缓存只需要调度器提供的少数原语：
//! 关/开中断的配对括号、当前 CPU 的编号、在某个通道上睡眠以及唤醒某个通道上的全部睡眠者。
//! 内核在启动时通过 [`install`] 注册调度器，之后所有的锁都经由这里访问它。

use spin::Once;

static SCHEDULER: Once<&'static dyn Scheduler> = Once::new();

/// 调度器需要向存储层提供的原语。
///
/// # 睡眠与唤醒的约定
/// `sleep` 必须先把调用者登记到 `channel` 上，再调用 `release` 释放调用者持有的自旋锁，
/// 最后挂起调用者。任何在登记之后发出的 `wakeup(channel)` 都必须唤醒它。
/// 这样"检查条件 - 睡眠"这一序列就不会丢失唤醒，与关中断后再 `sleep_on` 的效果一致。
///
/// 唤醒不保证先来先服务：被唤醒的一方必须重新检查自己等待的条件。
pub trait Scheduler: Sync {
    /// 当前执行上下文所在的 CPU 编号，用于自旋锁的持有者检查
    fn cpu_id(&self) -> usize;

    /// 关中断，可嵌套
    fn push_off(&self);

    /// 与 `push_off` 配对，计数归零时恢复原来的中断状态
    fn pop_off(&self);

    /// 在 `channel` 上睡眠，见 trait 文档中的约定
    fn sleep(&self, channel: usize, release: &mut dyn FnMut());

    /// 唤醒所有在 `channel` 上睡眠的上下文
    fn wakeup(&self, channel: usize);

    /// 当前时间（秒），用于 inode 的时间戳
    fn current_time(&self) -> u32 {
        0
    }
}

/// 注册全局调度器，只有第一次调用生效。
pub fn install(scheduler: &'static dyn Scheduler) {
    SCHEDULER.call_once(|| scheduler);
}

fn scheduler() -> &'static dyn Scheduler {
    match SCHEDULER.get() {
        Some(s) => *s,
        None => panic!("scheduler: not installed"),
    }
}

#[inline]
pub fn cpu_id() -> usize {
    scheduler().cpu_id()
}

#[inline]
pub fn push_off() {
    scheduler().push_off();
}

#[inline]
pub fn pop_off() {
    scheduler().pop_off();
}

/// 唤醒在 `channel` 上睡眠的全部上下文
#[inline]
pub fn wakeup(channel: usize) {
    scheduler().wakeup(channel);
}

#[inline]
pub fn current_time() -> u32 {
    scheduler().current_time()
}

/// 在 `channel` 上睡眠，`release` 在登记完成后被调用。
/// 一般不直接使用，而是通过 [`SpinLockGuard::sleep`](crate::spinlock::SpinLockGuard::sleep)。
pub(crate) fn sleep(channel: usize, release: &mut dyn FnMut()) {
    scheduler().sleep(channel, release);
}
