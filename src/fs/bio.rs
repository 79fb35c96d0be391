//! 缓存层
//!
//! 固定数量的块缓冲区构成缓冲池。每个缓冲区同时挂在一条散列链（按 `(dev, block)`）
//! 和一条环形空闲链表上；"空闲"只表示引用计数为零时可以被换出，
//! 缓冲区即使正被引用也始终留在空闲链表中。链表使用数组下标而不是指针链接。
//!
//! 所有元数据由一把自旋锁 `ctrl` 保护。跨越睡眠的互斥依靠每个缓冲区的两个标志：
//! `LOCKED` 只在块传输期间置位，`BUSY` 表示有一个 [`BufGuard`] 正在读写数据区。
//! 两者互斥，数据区任何时刻至多有一个访问者。查找、换出、释放与回写只等待 `LOCKED`，
//! 因此持有 `BufGuard` 时仍可以读取其他块。等待者睡眠在该缓冲区对应的通道上，
//! 醒来后重新检查条件。

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::mem;
use core::ops::{Deref, DerefMut};

use log::{debug, error, trace, warn};

use super::{FsError, Result};
use crate::consts::driver::NR_BLK_DEV;
use crate::consts::fs::{BSIZE, NR_HASH};
use crate::consts::PGSIZE;
use crate::driver::{major, BlockDevice, IoCmd, IoRequest};
use crate::process;
use crate::spinlock::{SpinLock, SpinLockGuard};

bitflags! {
    /// 缓冲区状态位
    struct BufFlags: u8 {
        /// 内容比磁盘上的新
        const DIRTY = 1 << 0;
        /// 内容已从磁盘读入（或整体写入过），可以读取
        const UPTODATE = 1 << 1;
        /// 正在传输
        const LOCKED = 1 << 2;
        /// 数据区被一个 `BufGuard` 独占
        const BUSY = 1 << 3;
    }
}

/// `ll_rw_block` 的请求种类
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Rw {
    Read,
    Write,
    /// 预读：缓冲区已加锁时直接放弃
    ReadAhead,
}

impl Rw {
    fn cmd(self) -> IoCmd {
        match self {
            Rw::Read | Rw::ReadAhead => IoCmd::Read,
            Rw::Write => IoCmd::Write,
        }
    }
}

#[inline]
fn hashfn(dev: u16, block: u32) -> usize {
    (dev as usize ^ block as usize) % NR_HASH
}

/// 全局缓冲区缓存，块设备与文件系统之间唯一的数据通道。
///
/// `Bcache` 提供了一个固定大小的缓冲池，用于缓存磁盘块，
/// 并负责把未命中的读请求和脏块的回写交给已登记的块设备驱动。
/// 通常在内核初始化时创建一次并一直存活，使用者持有 `&'static Bcache`。
pub struct Bcache {
    /// 保护所有缓冲区元数据、散列表与空闲链表的自旋锁
    ctrl: SpinLock<BufCtrl>,

    /// 缓冲区数据，与 `ctrl` 中的元数据按下标一一对应。
    ///
    /// 数据区只能由 `BUSY` 的持有者（一个 [`BufGuard`]）
    /// 或 `LOCKED` 的持有者（一个正在进行的 [`IoRequest`]）访问。
    bufs: Box<[BufInner]>,

    /// 按主设备号登记的块设备驱动
    devices: SpinLock<[Option<&'static dyn BlockDevice>; NR_BLK_DEV]>,
}

// 数据区的访问由 LOCKED 与 BUSY 标志串行化
unsafe impl Sync for Bcache {}

impl Bcache {
    /// 创建包含 `nbuf` 个缓冲区的缓存。
    ///
    /// # 功能说明
    /// 所有缓冲区初始时不属于任何设备（`dev == 0`），干净、未加锁、引用计数为零，
    /// 按下标顺序连成环形空闲链表，散列表为空。
    ///
    /// # 可能的错误
    /// - `nbuf` 为零时 panic。
    pub fn new(nbuf: usize) -> Self {
        if nbuf == 0 {
            panic!("bcache: empty buffer pool");
        }
        let meta: Vec<BufMeta> = (0..nbuf)
            .map(|i| BufMeta {
                prev_free: Some((i + nbuf - 1) % nbuf),
                next_free: Some((i + 1) % nbuf),
                ..BufMeta::new()
            })
            .collect();
        let bufs: Vec<BufInner> = (0..nbuf).map(|_| BufInner::new()).collect();

        Self {
            ctrl: SpinLock::new(
                BufCtrl {
                    meta: meta.into_boxed_slice(),
                    hash: vec![None; NR_HASH].into_boxed_slice(),
                    free_list: 0,
                },
                "bcache",
            ),
            bufs: bufs.into_boxed_slice(),
            devices: SpinLock::new([None; NR_BLK_DEV], "blk_dev"),
        }
    }

    /// 缓冲区总数
    pub fn nr_buffers(&self) -> usize {
        self.bufs.len()
    }

    /// 把 `device` 登记为主设备号 `major` 的驱动，替换原有登记。
    ///
    /// # 可能的错误
    /// - `major` 超出设备表范围时 panic。
    pub fn register_device(&self, major: usize, device: &'static dyn BlockDevice) {
        if major == 0 || major >= NR_BLK_DEV {
            panic!("register_device: bad major {}", major);
        }
        self.devices.lock()[major] = Some(device);
    }

    fn device(&self, dev: u16) -> Option<&'static dyn BlockDevice> {
        let major = major(dev);
        if major >= NR_BLK_DEV {
            return None;
        }
        self.devices.lock()[major]
    }

    /// 询问驱动 `dev` 的可移动介质是否被更换过
    pub fn media_changed(&self, dev: u16) -> bool {
        match self.device(dev) {
            Some(device) => device.media_changed(dev),
            None => false,
        }
    }

    /// 缓冲区 `i` 的锁等待通道
    #[inline]
    fn buf_channel(&self, i: usize) -> usize {
        &self.bufs[i] as *const BufInner as usize
    }

    /// 等待空闲缓冲区的全局通道
    #[inline]
    fn wait_channel(&self) -> usize {
        &self.ctrl as *const SpinLock<BufCtrl> as usize
    }

    /// 持有 `ctrl` 等待缓冲区 `i` 的传输结束，返回时仍持有 `ctrl`
    fn wait_on_buffer<'a>(
        &self,
        ctrl: SpinLockGuard<'a, BufCtrl>,
        i: usize,
    ) -> SpinLockGuard<'a, BufCtrl> {
        self.wait_clear(ctrl, i, BufFlags::LOCKED)
    }

    fn wait_clear<'a>(
        &self,
        mut ctrl: SpinLockGuard<'a, BufCtrl>,
        i: usize,
        mask: BufFlags,
    ) -> SpinLockGuard<'a, BufCtrl> {
        while ctrl.meta[i].flags.intersects(mask) {
            ctrl = ctrl.sleep(self.buf_channel(i));
        }
        ctrl
    }

    /// 等待数据区没有访问者，然后置上 `flag`（`LOCKED` 或 `BUSY`）
    fn acquire<'a>(
        &self,
        ctrl: SpinLockGuard<'a, BufCtrl>,
        i: usize,
        flag: BufFlags,
    ) -> SpinLockGuard<'a, BufCtrl> {
        let mut ctrl = self.wait_clear(ctrl, i, BufFlags::LOCKED | BufFlags::BUSY);
        ctrl.meta[i].flags.insert(flag);
        ctrl
    }

    fn release(&self, mut ctrl: SpinLockGuard<'_, BufCtrl>, i: usize, flag: BufFlags) {
        if !ctrl.meta[i].flags.contains(flag) {
            warn!("unlock_buffer: buffer not locked");
        }
        ctrl.meta[i].flags.remove(flag);
        drop(ctrl);
        process::wakeup(self.buf_channel(i));
    }

    fn unlock_buffer(&self, ctrl: SpinLockGuard<'_, BufCtrl>, i: usize) {
        self.release(ctrl, i, BufFlags::LOCKED);
    }

    /// 不持有 `ctrl` 时等待缓冲区 `i` 的传输结束
    fn wait_on(&self, i: usize) {
        let ctrl = self.ctrl.lock();
        drop(self.wait_on_buffer(ctrl, i));
    }

    /// 在散列表中查找并引用 `(dev, block)`，不分配新缓冲区。
    ///
    /// # 流程解释
    /// 找到后先增加引用计数再等待其传输结束（引用计数使它不会被换出），
    /// 醒来后重新核对身份，身份变化则撤销引用重新查找。
    fn lookup<'a>(
        &self,
        mut ctrl: SpinLockGuard<'a, BufCtrl>,
        dev: u16,
        block: u32,
    ) -> (SpinLockGuard<'a, BufCtrl>, Option<usize>) {
        loop {
            let i = match ctrl.find_buffer(dev, block) {
                Some(i) => i,
                None => return (ctrl, None),
            };
            ctrl.meta[i].count += 1;
            ctrl = self.wait_on_buffer(ctrl, i);
            if ctrl.meta[i].dev == dev && ctrl.meta[i].blockno == block {
                return (ctrl, Some(i));
            }
            ctrl.meta[i].count -= 1;
        }
    }

    /// 如果 `(dev, block)` 已在缓存中，返回引用它的句柄，否则返回 `None`
    pub fn get_hash_table(&'static self, dev: u16, block: u32) -> Option<Buf> {
        let ctrl = self.ctrl.lock();
        let (ctrl, found) = self.lookup(ctrl, dev, block);
        drop(ctrl);
        found.map(|index| Buf::new(self, index, dev, block))
    }

    /// 取得 `(dev, block)` 对应的缓冲区，不读盘。
    ///
    /// # 功能说明
    /// 返回的缓冲区身份与请求一致、引用计数已加一、处于未加锁状态。
    /// 内容是否有效由 [`Buf::is_uptodate`] 判断。
    ///
    /// # 流程解释
    /// 1. 命中散列表则直接返回（见 `lookup`）；
    /// 2. 未命中时从空闲链表头开始扫描，挑选 badness（脏占 2，加锁占 1）最小的未引用缓冲区，
    ///    遇到 badness 为零的立即选中；没有任何未引用缓冲区时在全局通道上睡眠后重来；
    /// 3. 等待候选者解锁，若期间被人引用则重来；若是脏块，回写它所在设备后再次等待和检查；
    /// 4. 睡眠期间可能已有别人把所需的块放入缓存，再查一次散列表，找到则放弃候选者重来；
    /// 5. 最后占用候选者：引用计数置 1，清除脏与有效标志，从旧散列链和空闲链表中摘下，
    ///    设置新的身份后挂回新散列链头和空闲链表尾。
    ///
    /// # 可能的错误
    /// - 空闲链表断链时 panic（"Free block list corrupted"）。
    pub fn getblk(&'static self, dev: u16, block: u32) -> Buf {
        let mut ctrl = self.ctrl.lock();
        'repeat: loop {
            let (guard, found) = self.lookup(ctrl, dev, block);
            ctrl = guard;
            if let Some(index) = found {
                drop(ctrl);
                return Buf::new(self, index, dev, block);
            }

            let victim = match ctrl.pick_victim() {
                Some(i) => i,
                None => {
                    trace!("getblk: no free buffer, sleeping");
                    ctrl = ctrl.sleep(self.wait_channel());
                    continue 'repeat;
                }
            };

            ctrl = self.wait_on_buffer(ctrl, victim);
            if ctrl.meta[victim].count != 0 {
                continue 'repeat;
            }
            while ctrl.meta[victim].flags.contains(BufFlags::DIRTY) {
                let victim_dev = ctrl.meta[victim].dev;
                debug!(
                    "getblk: evicting dirty block {} of dev {:04x}",
                    ctrl.meta[victim].blockno, victim_dev
                );
                drop(ctrl);
                self.flush_dev(victim_dev);
                ctrl = self.wait_on_buffer(self.ctrl.lock(), victim);
                if ctrl.meta[victim].count != 0 {
                    continue 'repeat;
                }
            }

            if ctrl.find_buffer(dev, block).is_some() {
                continue 'repeat;
            }

            ctrl.claim(victim, dev, block);
            drop(ctrl);
            return Buf::new(self, victim, dev, block);
        }
    }

    /// 读取 `(dev, block)`，返回内容有效的缓冲区。
    ///
    /// # 返回值
    /// - `Ok(buf)`：缓冲区已包含磁盘内容；
    /// - `Err(FsError::Io)`：读盘失败，缓冲区已被释放。
    pub fn bread(&'static self, dev: u16, block: u32) -> Result<Buf> {
        let buf = self.getblk(dev, block);
        if buf.is_uptodate() {
            return Ok(buf);
        }
        self.ll_rw_block(Rw::Read, buf.index);
        self.wait_on(buf.index);
        if buf.is_uptodate() {
            Ok(buf)
        } else {
            Err(FsError::Io { dev, block })
        }
    }

    /// 读取 `first` 并对 `ahead` 中的块发起预读。
    ///
    /// 预读的缓冲区不等待传输完成就被释放，已加锁的块不预读。
    /// 只有 `first` 的读取结果决定返回值。
    pub fn breada(&'static self, dev: u16, first: u32, ahead: &[u32]) -> Result<Buf> {
        let buf = self.getblk(dev, first);
        if !buf.is_uptodate() {
            self.ll_rw_block(Rw::Read, buf.index);
        }
        for &block in ahead {
            let tmp = self.getblk(dev, block);
            if !tmp.is_uptodate() {
                self.ll_rw_block(Rw::ReadAhead, tmp.index);
            }
            tmp.release_nowait();
        }
        self.wait_on(buf.index);
        if buf.is_uptodate() {
            Ok(buf)
        } else {
            Err(FsError::Io { dev, block: first })
        }
    }

    /// 把最多四个块读入一页内存。
    ///
    /// # 功能说明
    /// 先为所有非零块号发起读请求，再依次等待完成，把每个有效的块复制到页的对应四分之一处。
    /// 块号为零的位置以及读取失败的位置保持原样。
    pub fn read_page(&'static self, dev: u16, blocks: [u32; 4], page: &mut [u8; PGSIZE]) {
        let mut bufs: [Option<Buf>; 4] = Default::default();
        for (slot, &block) in bufs.iter_mut().zip(blocks.iter()) {
            if block == 0 {
                continue;
            }
            let buf = self.getblk(dev, block);
            if !buf.is_uptodate() {
                self.ll_rw_block(Rw::Read, buf.index);
            }
            *slot = Some(buf);
        }
        for (chunk, slot) in page.chunks_exact_mut(BSIZE).zip(bufs.iter_mut()) {
            if let Some(buf) = slot.take() {
                self.wait_on(buf.index);
                if buf.is_uptodate() {
                    chunk.copy_from_slice(&buf.lock()[..]);
                }
            }
        }
    }

    /// 释放一次引用并唤醒等待空闲缓冲区的上下文。
    ///
    /// # 可能的错误
    /// - 引用计数已经为零时 panic（"Trying to free free buffer"）。
    fn brelse(&self, i: usize) {
        let ctrl = self.ctrl.lock();
        let mut ctrl = self.wait_on_buffer(ctrl, i);
        if ctrl.meta[i].count == 0 {
            panic!("Trying to free free buffer");
        }
        ctrl.meta[i].count -= 1;
        drop(ctrl);
        process::wakeup(self.wait_channel());
    }

    /// 与 `brelse` 相同但不等待缓冲区解锁，用于预读
    fn release_nowait(&self, i: usize) {
        let mut ctrl = self.ctrl.lock();
        if ctrl.meta[i].count == 0 {
            panic!("Trying to free free buffer");
        }
        ctrl.meta[i].count -= 1;
        drop(ctrl);
        process::wakeup(self.wait_channel());
    }

    /// 向驱动发起一次块传输。
    ///
    /// # 功能说明
    /// 等待数据区的其他访问者离开后对缓冲区加锁（预读遇到正在传输或被独占的缓冲区
    /// 直接返回），因此写盘的内容不会是某个 `BufGuard` 改到一半的数据。
    /// 写一个干净的缓冲区或读一个有效的缓冲区不产生任何传输，立即解锁返回。
    /// 否则在提交时清除脏标志，把请求交给驱动；驱动完成后由
    /// [`end_request`](Self::end_request) 解锁。
    ///
    /// 主设备号没有登记驱动时记录警告：读请求保持无效，写请求的脏数据被丢弃。
    pub(crate) fn ll_rw_block(&'static self, rw: Rw, i: usize) {
        let mut ctrl = self.ctrl.lock();
        let in_use = BufFlags::LOCKED | BufFlags::BUSY;
        if rw == Rw::ReadAhead && ctrl.meta[i].flags.intersects(in_use) {
            return;
        }
        ctrl = self.acquire(ctrl, i, BufFlags::LOCKED);

        let cmd = rw.cmd();
        let flags = ctrl.meta[i].flags;
        if (cmd == IoCmd::Write && !flags.contains(BufFlags::DIRTY))
            || (cmd == IoCmd::Read && flags.contains(BufFlags::UPTODATE))
        {
            self.unlock_buffer(ctrl, i);
            return;
        }
        let (dev, blockno) = (ctrl.meta[i].dev, ctrl.meta[i].blockno);
        ctrl.meta[i].flags.remove(BufFlags::DIRTY);
        drop(ctrl);

        match self.device(dev) {
            Some(device) => {
                trace!("ll_rw_block: {:?} dev {:04x} block {}", cmd, dev, blockno);
                device.submit(IoRequest::new(self, i, dev, blockno, cmd));
            }
            None => {
                warn!(
                    "Trying to {} nonexistent block-device {:04x}",
                    if cmd == IoCmd::Write { "write" } else { "read" },
                    dev
                );
                self.unlock_buffer(self.ctrl.lock(), i);
            }
        }
    }

    /// 请求完成回调，只获取自旋锁
    pub(crate) fn end_request(&self, i: usize, uptodate: bool) {
        let mut ctrl = self.ctrl.lock();
        ctrl.meta[i].flags.set(BufFlags::UPTODATE, uptodate);
        if !uptodate {
            error!(
                "I/O error: dev {:04x}, block {}",
                ctrl.meta[i].dev, ctrl.meta[i].blockno
            );
        }
        self.unlock_buffer(ctrl, i);
    }

    /// 正在传输的缓冲区数据区
    ///
    /// # 安全性
    /// 调用者必须是缓冲区 `i` 当前 `LOCKED` 状态的所有者（`LOCKED` 与 `BUSY` 互斥）。
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn request_data(&self, i: usize) -> &mut [u8; BSIZE] {
        &mut (*self.bufs[i].data.get()).0
    }

    /// 回写设备 `dev` 的所有脏缓冲区（不包括 inode）。
    ///
    /// 检查每个缓冲区之前先等待它的传输结束，不在传输进行时读取它的标志。
    /// 正被 `BufGuard` 独占的缓冲区保持为脏，留给下一次回写；
    /// 持有者自己调用本函数（例如经由 `getblk` 换出脏块）时不会等待自己。
    /// 函数提交写请求后即返回，不等待传输完成。
    pub fn flush_dev(&'static self, dev: u16) {
        for i in 0..self.bufs.len() {
            let ctrl = self.ctrl.lock();
            if ctrl.meta[i].dev != dev {
                continue;
            }
            let ctrl = self.wait_on_buffer(ctrl, i);
            if ctrl.meta[i].dev == dev {
                self.flush_one(ctrl, i);
            }
        }
    }

    /// 回写所有设备的脏缓冲区
    pub fn flush_all(&'static self) {
        for i in 0..self.bufs.len() {
            let ctrl = self.ctrl.lock();
            let ctrl = self.wait_on_buffer(ctrl, i);
            self.flush_one(ctrl, i);
        }
    }

    fn flush_one(&'static self, ctrl: SpinLockGuard<'_, BufCtrl>, i: usize) {
        let flags = ctrl.meta[i].flags;
        drop(ctrl);
        if !flags.contains(BufFlags::DIRTY) {
            return;
        }
        if flags.contains(BufFlags::BUSY) {
            trace!("flush: buffer {} held, left dirty", i);
            return;
        }
        self.ll_rw_block(Rw::Write, i);
    }

    /// 介质更换后作废设备 `dev` 的全部缓冲区：清除有效与脏标志，不回写。
    pub fn invalidate(&self, dev: u16) {
        for i in 0..self.bufs.len() {
            let ctrl = self.ctrl.lock();
            if ctrl.meta[i].dev != dev {
                continue;
            }
            let mut ctrl = self.wait_on_buffer(ctrl, i);
            if ctrl.meta[i].dev == dev {
                ctrl.meta[i].flags.remove(BufFlags::UPTODATE | BufFlags::DIRTY);
            }
        }
    }

    fn flags(&self, i: usize) -> BufFlags {
        self.ctrl.lock().meta[i].flags
    }
}

/// 一个缓冲区的数据内容
#[repr(C, align(8))]
pub struct BufData(pub [u8; BSIZE]);

impl BufData {
    const fn new() -> Self {
        Self([0; BSIZE])
    }

    /// 把块视为 `u16` 区块号数组时的第 `i` 项（间接块的格式）
    pub fn zone(&self, i: usize) -> u16 {
        u16::from_le_bytes([self.0[2 * i], self.0[2 * i + 1]])
    }

    pub fn set_zone(&mut self, i: usize, zone: u16) {
        self.0[2 * i..2 * i + 2].copy_from_slice(&zone.to_le_bytes());
    }

    pub fn clear(&mut self) {
        self.0.fill(0);
    }
}

impl Deref for BufData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

struct BufInner {
    data: UnsafeCell<BufData>,
}

impl BufInner {
    fn new() -> Self {
        Self { data: UnsafeCell::new(BufData::new()) }
    }
}

/// 对一个缓冲区的引用，由 `getblk`/`bread` 等返回。
///
/// 句柄存在期间缓冲区不会被换出，句柄被丢弃时自动释放引用。
/// 读写数据需要先通过 [`lock`](Buf::lock) 取得 [`BufGuard`]。
/// 持有 `BufGuard` 时可以继续读取其他块，但不要对同一个缓冲区调用
/// [`write`](Buf::write) 或再次 `lock`，它们会等待这把锁。
pub struct Buf {
    cache: &'static Bcache,
    index: usize,
    dev: u16,
    blockno: u32,
}

impl Buf {
    fn new(cache: &'static Bcache, index: usize, dev: u16, blockno: u32) -> Self {
        Self { cache, index, dev, blockno }
    }

    pub fn dev(&self) -> u16 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    /// 缓冲区在池中的下标
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_uptodate(&self) -> bool {
        self.cache.flags(self.index).contains(BufFlags::UPTODATE)
    }

    pub fn is_dirty(&self) -> bool {
        self.cache.flags(self.index).contains(BufFlags::DIRTY)
    }

    /// 标记为脏，等待之后的回写
    pub fn mark_dirty(&self) {
        self.cache.ctrl.lock().meta[self.index].flags.insert(BufFlags::DIRTY);
    }

    /// 独占数据区，等待进行中的传输和其他持有者
    pub fn lock(&self) -> BufGuard<'_> {
        let ctrl = self.cache.ctrl.lock();
        drop(self.cache.acquire(ctrl, self.index, BufFlags::BUSY));
        BufGuard {
            buf: self,
            data: unsafe { &mut *self.cache.bufs[self.index].data.get() },
        }
    }

    /// 同步回写：脏则写盘并等待完成
    pub fn write(&self) -> Result<()> {
        self.cache.ll_rw_block(Rw::Write, self.index);
        self.cache.wait_on(self.index);
        if self.is_uptodate() {
            Ok(())
        } else {
            Err(FsError::Io { dev: self.dev, block: self.blockno })
        }
    }

    /// 当前引用计数
    pub fn refcount(&self) -> usize {
        self.cache.ctrl.lock().meta[self.index].count
    }

    /// 丢弃缓存内容（清除脏与有效标志）后释放，用于块被释放回位图时
    pub(crate) fn discard(self) {
        let ctrl = self.cache.ctrl.lock();
        let mut ctrl = self.cache.wait_on_buffer(ctrl, self.index);
        ctrl.meta[self.index].flags.remove(BufFlags::DIRTY | BufFlags::UPTODATE);
    }

    fn release_nowait(self) {
        let (cache, index) = (self.cache, self.index);
        mem::forget(self);
        cache.release_nowait(index);
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        self.cache.brelse(self.index);
    }
}

/// 缓冲区数据区的独占访问凭证，丢弃时清除 `BUSY` 并唤醒等待者。
pub struct BufGuard<'a> {
    buf: &'a Buf,
    data: &'a mut BufData,
}

impl<'a> BufGuard<'a> {
    pub fn mark_dirty(&mut self) {
        self.buf.mark_dirty();
    }

    /// 整块内容由调用者填好后标记为有效
    pub fn set_uptodate(&mut self) {
        self.buf.cache.ctrl.lock().meta[self.buf.index].flags.insert(BufFlags::UPTODATE);
    }
}

impl<'a> Deref for BufGuard<'a> {
    type Target = BufData;

    fn deref(&self) -> &BufData {
        self.data
    }
}

impl<'a> DerefMut for BufGuard<'a> {
    fn deref_mut(&mut self) -> &mut BufData {
        self.data
    }
}

impl<'a> Drop for BufGuard<'a> {
    fn drop(&mut self) {
        let cache = self.buf.cache;
        cache.release(cache.ctrl.lock(), self.buf.index, BufFlags::BUSY);
    }
}

/// 缓冲区元数据
#[derive(Clone, Copy)]
struct BufMeta {
    dev: u16,
    blockno: u32,
    count: usize,
    flags: BufFlags,
    prev: Option<usize>,
    next: Option<usize>,
    prev_free: Option<usize>,
    next_free: Option<usize>,
}

impl BufMeta {
    const fn new() -> Self {
        Self {
            dev: 0,
            blockno: 0,
            count: 0,
            flags: BufFlags::empty(),
            prev: None,
            next: None,
            prev_free: None,
            next_free: None,
        }
    }

    /// 换出代价：脏计 2，加锁计 1
    fn badness(&self) -> u8 {
        ((self.flags.contains(BufFlags::DIRTY) as u8) << 1)
            + self.flags.contains(BufFlags::LOCKED) as u8
    }
}

/// 受 `ctrl` 保护的缓存控制结构
struct BufCtrl {
    meta: Box<[BufMeta]>,
    hash: Box<[Option<usize>]>,
    /// 空闲链表头，最久未被占用的缓冲区
    free_list: usize,
}

impl BufCtrl {
    fn find_buffer(&self, dev: u16, block: u32) -> Option<usize> {
        let mut cur = self.hash[hashfn(dev, block)];
        while let Some(i) = cur {
            let m = &self.meta[i];
            if m.dev == dev && m.blockno == block {
                return Some(i);
            }
            cur = m.next;
        }
        None
    }

    /// 沿空闲链表选出 badness 最小的未引用缓冲区
    fn pick_victim(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        let mut cur = self.free_list;
        loop {
            let m = &self.meta[cur];
            if m.count == 0 {
                let better = match best {
                    Some(b) => m.badness() < self.meta[b].badness(),
                    None => true,
                };
                if better {
                    best = Some(cur);
                    if m.badness() == 0 {
                        break;
                    }
                }
            }
            cur = match m.next_free {
                Some(next) => next,
                None => panic!("Free block list corrupted"),
            };
            if cur == self.free_list {
                break;
            }
        }
        best
    }

    fn remove_from_queues(&mut self, i: usize) {
        let BufMeta { dev, blockno, prev, next, prev_free, next_free, .. } = self.meta[i];

        // 散列链
        if let Some(n) = next {
            self.meta[n].prev = prev;
        }
        if let Some(p) = prev {
            self.meta[p].next = next;
        }
        let h = hashfn(dev, blockno);
        if self.hash[h] == Some(i) {
            self.hash[h] = next;
        }
        self.meta[i].prev = None;
        self.meta[i].next = None;

        // 空闲链表
        let (p, n) = match (prev_free, next_free) {
            (Some(p), Some(n)) => (p, n),
            _ => panic!("Free block list corrupted"),
        };
        self.meta[p].next_free = Some(n);
        self.meta[n].prev_free = Some(p);
        if self.free_list == i {
            self.free_list = n;
        }
    }

    fn insert_into_queues(&mut self, i: usize) {
        // 挂到空闲链表尾
        let head = self.free_list;
        if head == i {
            // 池中只有这一个缓冲区
            self.meta[i].prev_free = Some(i);
            self.meta[i].next_free = Some(i);
        } else {
            let tail = match self.meta[head].prev_free {
                Some(t) => t,
                None => panic!("Free block list corrupted"),
            };
            self.meta[i].next_free = Some(head);
            self.meta[i].prev_free = Some(tail);
            self.meta[tail].next_free = Some(i);
            self.meta[head].prev_free = Some(i);
        }

        // 挂到新散列链头
        let m = self.meta[i];
        if m.dev == 0 {
            return;
        }
        let h = hashfn(m.dev, m.blockno);
        self.meta[i].next = self.hash[h];
        self.meta[i].prev = None;
        if let Some(old) = self.hash[h] {
            self.meta[old].prev = Some(i);
        }
        self.hash[h] = Some(i);
    }

    /// 把换出的缓冲区改为 `(dev, block)`，引用计数 1，内容无效
    fn claim(&mut self, i: usize, dev: u16, block: u32) {
        self.meta[i].count = 1;
        self.meta[i].flags.remove(BufFlags::DIRTY | BufFlags::UPTODATE);
        self.remove_from_queues(i);
        self.meta[i].dev = dev;
        self.meta[i].blockno = block;
        self.insert_into_queues(i);
    }
}
