//! 索引节点层
//!
//! 内存中的 inode 表是一个固定大小的池，按 `(dev, num)` 线性查找。
//! 槽位的身份、引用计数与状态位由自旋锁 `meta` 保护；inode 内容只在两种情况下访问：
//! 持有槽位的 `LOCKED` 标志，或者持有 `meta` 且槽位未加锁。

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::fmt;
use core::mem;
use core::ops::{Deref, DerefMut};
use core::ptr;

use log::{error, trace, warn};

use super::{Bcache, FsError, Result, SuperTable};
use crate::consts::fs::{
    DINODE_SIZE, INODES_PER_BLOCK, MAX_FILE_BLOCKS, NDIRECT, NINDIRECT, NZONES, ROOT_INO,
    S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFMT, S_IFREG,
};
use crate::consts::PGSIZE;
use crate::process;
use crate::spinlock::{SpinLock, SpinLockGuard};

bitflags! {
    /// inode 槽位状态位
    struct IFlags: u8 {
        /// 正在读盘、回写或被 `InodeGuard` 独占
        const LOCKED = 1 << 0;
        /// 内存中的内容比磁盘上的新
        const DIRTY = 1 << 1;
        /// 管道 inode，不对应任何磁盘 inode
        const PIPE = 1 << 2;
        /// 某个文件系统挂载在该目录上
        const MOUNT = 1 << 3;
    }
}

/// 磁盘上的 Minix v1 inode，32 字节
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiskInode {
    pub mode: u16,
    pub uid: u16,
    pub size: u32,
    pub mtime: u32,
    pub gid: u8,
    pub nlinks: u8,
    /// 0..7 为直接块，7 为一次间接块，8 为二次间接块；设备文件的 `zone[0]` 是设备号
    pub zone: [u16; NZONES],
}

impl DiskInode {
    pub fn itype(&self) -> InodeType {
        InodeType::from_mode(self.mode)
    }
}

/// 由 mode 字段得到的文件类型
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InodeType {
    Regular,
    Directory,
    CharDevice,
    BlockDevice,
    Fifo,
    Unknown,
}

impl InodeType {
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFREG => InodeType::Regular,
            S_IFDIR => InodeType::Directory,
            S_IFCHR => InodeType::CharDevice,
            S_IFBLK => InodeType::BlockDevice,
            S_IFIFO => InodeType::Fifo,
            _ => InodeType::Unknown,
        }
    }
}

/// inode 槽位中的内容
pub struct InodeData {
    pub disk: DiskInode,
    pub atime: u32,
    pub ctime: u32,
    /// 管道的缓冲页
    pipe_page: Option<Box<[u8; PGSIZE]>>,
}

impl InodeData {
    const fn new() -> Self {
        Self {
            disk: DiskInode {
                mode: 0,
                uid: 0,
                size: 0,
                mtime: 0,
                gid: 0,
                nlinks: 0,
                zone: [0; NZONES],
            },
            atime: 0,
            ctime: 0,
            pipe_page: None,
        }
    }
}

#[derive(Clone, Copy)]
struct InodeMeta {
    dev: u16,
    num: u16,
    count: usize,
    flags: IFlags,
}

impl InodeMeta {
    const fn new() -> Self {
        Self { dev: 0, num: 0, count: 0, flags: IFlags::empty() }
    }
}

struct ITable {
    slots: Box<[InodeMeta]>,
    /// 时钟扫描的指针
    last: usize,
}

/// 内存 inode 表。
///
/// # 结构体用途
/// 所有对磁盘 inode 的访问都经过这里：`iget` 取得引用，句柄 [`Inode`] 被丢弃时 `iput`。
/// 未被引用的槽位保留原来的内容，下次 `iget` 同一个 inode 时直接命中；
/// 只有在需要空槽位时才按时钟顺序回收。
pub struct InodeCache {
    bcache: &'static Bcache,
    supers: &'static SuperTable,
    meta: SpinLock<ITable>,
    data: Box<[UnsafeCell<InodeData>]>,
}

// data 的访问规则见模块文档
unsafe impl Sync for InodeCache {}

impl InodeCache {
    /// 创建有 `ninode` 个槽位的 inode 表
    pub fn new(bcache: &'static Bcache, supers: &'static SuperTable, ninode: usize) -> Self {
        if ninode == 0 {
            panic!("inode cache: empty table");
        }
        let slots: Vec<InodeMeta> = (0..ninode).map(|_| InodeMeta::new()).collect();
        let data: Vec<UnsafeCell<InodeData>> =
            (0..ninode).map(|_| UnsafeCell::new(InodeData::new())).collect();
        Self {
            bcache,
            supers,
            meta: SpinLock::new(
                ITable { slots: slots.into_boxed_slice(), last: ninode - 1 },
                "itable",
            ),
            data: data.into_boxed_slice(),
        }
    }

    pub fn supers(&self) -> &'static SuperTable {
        self.supers
    }

    #[inline]
    fn channel(&self, i: usize) -> usize {
        &self.data[i] as *const UnsafeCell<InodeData> as usize
    }

    fn wait_on_inode<'a>(
        &self,
        mut table: SpinLockGuard<'a, ITable>,
        i: usize,
    ) -> SpinLockGuard<'a, ITable> {
        while table.slots[i].flags.contains(IFlags::LOCKED) {
            table = table.sleep(self.channel(i));
        }
        table
    }

    /// 持有 `meta` 且槽位未加锁时读取其内容
    ///
    /// # 安全性
    /// `_table` 证明调用者持有 `meta`，调用者还须确认槽位 `i` 未加锁。
    unsafe fn peek(&self, _table: &ITable, i: usize) -> &InodeData {
        &*self.data[i].get()
    }

    /// 等待槽位解锁后加锁，返回独占访问凭证
    fn lock_index(&'static self, i: usize) -> InodeGuard<'static> {
        let table = self.meta.lock();
        let mut table = self.wait_on_inode(table, i);
        table.slots[i].flags.insert(IFlags::LOCKED);
        let InodeMeta { dev, num, .. } = table.slots[i];
        drop(table);
        InodeGuard {
            cache: self,
            index: i,
            dev,
            num,
            data: unsafe { &mut *self.data[i].get() },
        }
    }

    fn unlock_inode(&self, i: usize) {
        let mut table = self.meta.lock();
        if !table.slots[i].flags.contains(IFlags::LOCKED) {
            warn!("unlock_inode: inode not locked");
        }
        table.slots[i].flags.remove(IFlags::LOCKED);
        drop(table);
        process::wakeup(self.channel(i));
    }

    /// 取得一个空槽位，引用计数为 1，设备号为 0。
    ///
    /// # 流程解释
    /// 从上次停下的位置开始按时钟顺序扫描，选择未被引用的槽位，遇到既不脏也未加锁的立即选中。
    /// 选中的槽位若是脏的，先回写再重新检查；睡眠期间若被别人引用，则重新扫描。
    ///
    /// # 可能的错误
    /// - 所有槽位都被引用时 panic（"No free inodes in mem"）。
    fn get_empty_inode(&'static self) -> usize {
        let mut table = self.meta.lock();
        loop {
            let n = table.slots.len();
            let mut found = None;
            for _ in 0..n {
                table.last = (table.last + 1) % n;
                let s = table.slots[table.last];
                if s.count == 0 {
                    found = Some(table.last);
                    if !s.flags.intersects(IFlags::DIRTY | IFlags::LOCKED) {
                        break;
                    }
                }
            }
            let i = match found {
                Some(i) => i,
                None => {
                    for (k, s) in table.slots.iter().enumerate() {
                        error!("inode {}: dev {:04x}, num {}, count {}", k, s.dev, s.num, s.count);
                    }
                    panic!("No free inodes in mem");
                }
            };

            table = self.wait_on_inode(table, i);
            while table.slots[i].flags.contains(IFlags::DIRTY) {
                drop(table);
                self.write_back_or_discard(i);
                table = self.wait_on_inode(self.meta.lock(), i);
            }
            if table.slots[i].count != 0 {
                continue;
            }

            table.slots[i] = InodeMeta { count: 1, ..InodeMeta::new() };
            unsafe { *self.data[i].get() = InodeData::new() };
            return i;
        }
    }

    /// 取得 `(dev, num)` 的 inode。
    ///
    /// # 功能说明
    /// 先准备一个空槽位，再在表中查找。命中时等待其解锁并重新核对身份，然后增加引用计数；
    /// 若命中的是挂载点，释放它并转而查找挂载在其上的文件系统的根 inode。
    /// 未命中时把空槽位设为该身份、加锁并从磁盘读入。多余的空槽位被释放。
    ///
    /// # 返回值
    /// - `Ok(inode)`：引用计数已加一的句柄；
    /// - `Err(NotMounted)`：设备不在超级块表中；
    /// - `Err(Io)`：inode 所在的块读盘失败，槽位被释放。
    ///
    /// # 可能的错误
    /// - `dev` 为 0 或 `num` 为 0 时 panic。
    pub fn iget(&'static self, dev: u16, num: u16) -> Result<Inode> {
        if dev == 0 {
            panic!("iget with dev==0");
        }
        if num == 0 {
            panic!("iget with num==0");
        }
        let empty = self.get_empty_inode();
        let (mut dev, mut num) = (dev, num);

        let mut table = self.meta.lock();
        let mut i = 0;
        while i < table.slots.len() {
            if table.slots[i].dev != dev || table.slots[i].num != num {
                i += 1;
                continue;
            }
            table = self.wait_on_inode(table, i);
            if table.slots[i].dev != dev || table.slots[i].num != num {
                i = 0;
                continue;
            }
            table.slots[i].count += 1;
            if table.slots[i].flags.contains(IFlags::MOUNT) {
                match self.supers.mounted_on(dev, num) {
                    Some(sub) => {
                        drop(table);
                        trace!("iget: {:04x}:{} is a mount point of {:04x}", dev, num, sub);
                        self.iput(i);
                        dev = sub;
                        num = ROOT_INO;
                        table = self.meta.lock();
                        i = 0;
                        continue;
                    }
                    None => warn!("Mounted inode hasn't got sb"),
                }
            }
            drop(table);
            self.iput(empty);
            return Ok(Inode::new(self, i, dev, num));
        }

        table.slots[empty].dev = dev;
        table.slots[empty].num = num;
        table.slots[empty].flags = IFlags::LOCKED;
        drop(table);

        match self.read_inode(empty, dev, num) {
            Ok(()) => {
                self.unlock_inode(empty);
                Ok(Inode::new(self, empty, dev, num))
            }
            Err(e) => {
                self.meta.lock().slots[empty] = InodeMeta::new();
                process::wakeup(self.channel(empty));
                Err(e)
            }
        }
    }

    /// 从磁盘读入槽位 `i` 的内容，调用者持有槽位锁
    fn read_inode(&self, i: usize, dev: u16, num: u16) -> Result<()> {
        let geo = self.supers.geometry(dev)?;
        let buf = self.bcache.bread(dev, geo.inode_block(num))?;
        let off = (num as usize - 1) % INODES_PER_BLOCK * DINODE_SIZE;
        let disk = {
            let data = buf.lock();
            unsafe { ptr::read_unaligned(data[off..].as_ptr() as *const DiskInode) }
        };
        let d = unsafe { &mut *self.data[i].get() };
        *d = InodeData { disk, atime: disk.mtime, ctime: disk.mtime, pipe_page: None };
        Ok(())
    }

    /// 把脏的槽位 `i` 写入所在的缓冲区
    fn write_inode(&'static self, i: usize) -> Result<()> {
        let mut guard = self.lock_index(i);
        guard.write_back()
    }

    /// 回写失败时丢弃脏标志，避免调用者的重试循环无法结束
    fn write_back_or_discard(&'static self, i: usize) {
        if let Err(e) = self.write_inode(i) {
            error!("write_inode: {}, changes dropped", e);
            self.meta.lock().slots[i].flags.remove(IFlags::DIRTY);
        }
    }

    fn dup(&self, i: usize) {
        self.meta.lock().slots[i].count += 1;
    }

    /// 释放一次引用。
    ///
    /// # 流程解释
    /// 1. 等待槽位解锁，引用计数为零时 panic（"iput: trying to free free inode"）；
    /// 2. 管道 inode：唤醒等待者，最后一个引用释放缓冲页；
    /// 3. 不属于任何设备的槽位只减引用计数；
    /// 4. 块设备文件先同步它代表的设备；
    /// 5. 还有其他引用时只减引用计数；
    /// 6. 最后一个引用且链接数为零：截断文件、释放 inode 位并清空槽位；
    /// 7. 最后一个引用且是脏的：回写后回到第 5 步重新检查（回写期间可能有人再次引用或弄脏它）。
    fn iput(&'static self, i: usize) {
        let table = self.meta.lock();
        let mut table = self.wait_on_inode(table, i);
        if table.slots[i].count == 0 {
            panic!("iput: trying to free free inode");
        }

        if table.slots[i].flags.contains(IFlags::PIPE) {
            table.slots[i].count -= 1;
            let page = if table.slots[i].count == 0 {
                table.slots[i].flags.remove(IFlags::PIPE | IFlags::DIRTY);
                unsafe { (*self.data[i].get()).pipe_page.take() }
            } else {
                None
            };
            drop(table);
            process::wakeup(self.channel(i));
            drop(page);
            return;
        }
        if table.slots[i].dev == 0 {
            table.slots[i].count -= 1;
            return;
        }

        let disk = unsafe { self.peek(&table, i) }.disk;
        if disk.itype() == InodeType::BlockDevice {
            drop(table);
            self.sync_dev(disk.zone[0]);
            table = self.wait_on_inode(self.meta.lock(), i);
        }
        loop {
            if table.slots[i].count > 1 {
                table.slots[i].count -= 1;
                return;
            }
            if unsafe { self.peek(&table, i) }.disk.nlinks == 0 {
                drop(table);
                self.delete_inode(i);
                return;
            }
            if table.slots[i].flags.contains(IFlags::DIRTY) {
                drop(table);
                self.write_back_or_discard(i);
                table = self.wait_on_inode(self.meta.lock(), i);
                continue;
            }
            table.slots[i].count -= 1;
            return;
        }
    }

    /// 链接数为零的 inode 失去最后一个引用：释放数据块与 inode 位，清空槽位。
    /// 整个过程持有槽位锁，等待者醒来后会发现身份已经改变。
    fn delete_inode(&'static self, i: usize) {
        let mut guard = self.lock_index(i);
        {
            let mut table = self.meta.lock();
            if table.slots[i].count > 1 {
                table.slots[i].count -= 1;
                return;
            }
        }
        if let Err(e) = guard.truncate() {
            error!("truncate {:04x}:{}: {}", guard.dev, guard.num, e);
        }
        let (dev, num) = (guard.dev, guard.num);
        mem::forget(guard);
        if let Err(e) = self.supers.free_inode_bit(dev, num) {
            error!("free_inode {:04x}:{}: {}", dev, num, e);
        }
        trace!("iput: deleted inode {:04x}:{}", dev, num);

        let mut table = self.meta.lock();
        table.slots[i] = InodeMeta::new();
        unsafe { *self.data[i].get() = InodeData::new() };
        drop(table);
        process::wakeup(self.channel(i));
    }

    /// 在设备 `dev` 上分配一个新的 inode。
    ///
    /// 新 inode 的链接数为 1、mode 为 0、已标记为脏，时间戳为当前时间。
    ///
    /// # 返回值
    /// inode 位图已满时返回 `Err(NoFreeInode)`。
    pub fn new_inode(&'static self, dev: u16, uid: u16, gid: u8) -> Result<Inode> {
        let i = self.get_empty_inode();
        let num = match self.supers.alloc_inode_bit(dev) {
            Ok(num) => num,
            Err(e) => {
                self.iput(i);
                return Err(e);
            }
        };
        let now = process::current_time();
        // 槽位设备号仍为 0，只有本函数能访问它
        unsafe {
            let d = &mut *self.data[i].get();
            d.disk = DiskInode { uid, gid, nlinks: 1, mtime: now, ..DiskInode::default() };
            d.atime = now;
            d.ctime = now;
        }

        let mut table = self.meta.lock();
        for (k, s) in table.slots.iter_mut().enumerate() {
            // 此前对空闲 inode 号的 iget 可能留下过时的槽位
            if k != i && s.dev == dev && s.num == num && s.count == 0
                && !s.flags.contains(IFlags::LOCKED)
            {
                *s = InodeMeta::new();
            }
        }
        table.slots[i].dev = dev;
        table.slots[i].num = num;
        table.slots[i].flags = IFlags::DIRTY;
        drop(table);
        Ok(Inode::new(self, i, dev, num))
    }

    /// 取得一个管道 inode，返回读端与写端两个句柄，共享一页缓冲区。
    /// `zone[0]`、`zone[1]` 用作管道的头、尾指针。
    pub fn get_pipe_inode(&'static self) -> (Inode, Inode) {
        let i = self.get_empty_inode();
        unsafe {
            (*self.data[i].get()).pipe_page = Some(Box::new([0; PGSIZE]));
        }
        let mut table = self.meta.lock();
        table.slots[i].count = 2;
        table.slots[i].flags = IFlags::PIPE;
        drop(table);
        (Inode::new(self, i, 0, 0), Inode::new(self, i, 0, 0))
    }

    /// 回写所有脏的非管道 inode 到缓冲区
    pub fn sync_inodes(&'static self) {
        for i in 0..self.data.len() {
            let table = self.meta.lock();
            let table = self.wait_on_inode(table, i);
            let flags = table.slots[i].flags;
            drop(table);
            if flags.contains(IFlags::DIRTY) && !flags.contains(IFlags::PIPE) {
                self.write_back_or_discard(i);
            }
        }
    }

    /// 同步设备：回写缓冲区、回写 inode、再回写 inode 弄脏的缓冲区
    pub fn sync_dev(&'static self, dev: u16) {
        self.bcache.flush_dev(dev);
        self.sync_inodes();
        self.bcache.flush_dev(dev);
    }

    /// 介质更换后作废设备 `dev` 的全部 inode 槽位，不回写
    pub fn invalidate_inodes(&self, dev: u16) {
        for i in 0..self.data.len() {
            let table = self.meta.lock();
            let mut table = self.wait_on_inode(table, i);
            if table.slots[i].dev == dev {
                if table.slots[i].count != 0 {
                    warn!("inode in use on removed disk");
                }
                table.slots[i].dev = 0;
                table.slots[i].flags.remove(IFlags::DIRTY);
            }
        }
    }

    /// 设备 `dev` 上是否还有被引用的 inode
    pub fn in_use(&self, dev: u16) -> bool {
        self.meta.lock().slots.iter().any(|s| s.dev == dev && s.count > 0)
    }

    fn refcount(&self, i: usize) -> usize {
        self.meta.lock().slots[i].count
    }

    fn set_mount(&self, i: usize, mounted: bool) {
        let mut table = self.meta.lock();
        table.slots[i].flags.set(IFlags::MOUNT, mounted);
        table.slots[i].flags.insert(IFlags::DIRTY);
    }
}

/// 对一个内存 inode 的引用。
///
/// 克隆增加引用计数，丢弃时执行 `iput`。读写内容需要先通过 [`lock`](Inode::lock)
/// 取得 [`InodeGuard`]。
pub struct Inode {
    cache: &'static InodeCache,
    index: usize,
    dev: u16,
    num: u16,
}

impl Inode {
    fn new(cache: &'static InodeCache, index: usize, dev: u16, num: u16) -> Self {
        Self { cache, index, dev, num }
    }

    pub fn dev(&self) -> u16 {
        self.dev
    }

    pub fn num(&self) -> u16 {
        self.num
    }

    /// 加锁并取得内容，等待其他持有者或进行中的回写
    pub fn lock(&self) -> InodeGuard<'_> {
        self.cache.lock_index(self.index)
    }

    /// 当前引用计数
    pub fn refcount(&self) -> usize {
        self.cache.refcount(self.index)
    }

    /// 是否有文件系统挂载在该目录上
    pub fn is_mount_point(&self) -> bool {
        self.cache.meta.lock().slots[self.index].flags.contains(IFlags::MOUNT)
    }

    pub(super) fn set_mount(&self, mounted: bool) {
        self.cache.set_mount(self.index, mounted);
    }
}

impl Clone for Inode {
    fn clone(&self) -> Self {
        self.cache.dup(self.index);
        Self { cache: self.cache, index: self.index, dev: self.dev, num: self.num }
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        self.cache.iput(self.index);
    }
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inode")
            .field("dev", &self.dev)
            .field("num", &self.num)
            .field("index", &self.index)
            .finish()
    }
}

/// inode 的独占访问凭证，丢弃时解锁槽位。
pub struct InodeGuard<'a> {
    cache: &'static InodeCache,
    index: usize,
    dev: u16,
    num: u16,
    data: &'a mut InodeData,
}

fn nonzero(zone: u16) -> Option<u32> {
    match zone {
        0 => None,
        z => Some(z as u32),
    }
}

impl<'a> InodeGuard<'a> {
    pub fn dev(&self) -> u16 {
        self.dev
    }

    pub fn num(&self) -> u16 {
        self.num
    }

    pub fn itype(&self) -> InodeType {
        self.data.disk.itype()
    }

    pub fn size(&self) -> u32 {
        self.data.disk.size
    }

    pub fn set_size(&mut self, size: u32) {
        self.data.disk.size = size;
        self.mark_dirty();
    }

    pub fn nlinks(&self) -> u8 {
        self.data.disk.nlinks
    }

    pub fn set_nlinks(&mut self, nlinks: u8) {
        self.data.disk.nlinks = nlinks;
        self.data.ctime = process::current_time();
        self.mark_dirty();
    }

    pub fn set_mode(&mut self, mode: u16) {
        self.data.disk.mode = mode;
        self.mark_dirty();
    }

    /// 管道的缓冲页，非管道 inode 返回 `None`
    pub fn pipe_page(&mut self) -> Option<&mut [u8; PGSIZE]> {
        self.data.pipe_page.as_deref_mut()
    }

    pub fn mark_dirty(&mut self) {
        self.cache.meta.lock().slots[self.index].flags.insert(IFlags::DIRTY);
    }

    pub fn is_dirty(&self) -> bool {
        self.cache.meta.lock().slots[self.index].flags.contains(IFlags::DIRTY)
    }

    /// 立即把内容写入所在的缓冲区（不论是否为脏）
    pub fn update(&mut self) -> Result<()> {
        self.mark_dirty();
        self.write_back()
    }

    /// 脏时把磁盘 inode 复制进所在的缓冲区并标记缓冲区为脏，然后清除 inode 的脏标志
    fn write_back(&mut self) -> Result<()> {
        let flags = self.cache.meta.lock().slots[self.index].flags;
        if !flags.contains(IFlags::DIRTY) {
            return Ok(());
        }
        if self.dev == 0 {
            self.cache.meta.lock().slots[self.index].flags.remove(IFlags::DIRTY);
            return Ok(());
        }
        let geo = self.cache.supers.geometry(self.dev)?;
        let buf = self.cache.bcache.bread(self.dev, geo.inode_block(self.num))?;
        let off = (self.num as usize - 1) % INODES_PER_BLOCK * DINODE_SIZE;
        {
            let mut data = buf.lock();
            unsafe {
                ptr::write_unaligned(data[off..].as_mut_ptr() as *mut DiskInode, self.data.disk);
            }
            data.mark_dirty();
        }
        self.cache.meta.lock().slots[self.index].flags.remove(IFlags::DIRTY);
        Ok(())
    }

    /// 只查询逻辑块 `block` 对应的物理块，未映射时返回 `Ok(None)`
    pub fn bmap(&mut self, block: usize) -> Result<Option<u32>> {
        self.translate(block, false)
    }

    /// 取得逻辑块 `block` 对应的物理块，缺失的数据块与间接块按需分配
    pub fn create_block(&mut self, block: usize) -> Result<u32> {
        match self.translate(block, true)? {
            Some(zone) => Ok(zone),
            None => Err(FsError::NoSpace),
        }
    }

    /// 把文件内的逻辑块号转换为设备上的物理块号。
    ///
    /// # 功能说明
    /// 逻辑块 0..7 直接由 `zone[0..7]` 映射；7..519 经由 `zone[7]` 的一次间接块；
    /// 519 之后经由 `zone[8]` 的二次间接块，外层下标为 `(block - 519) / 512`，
    /// 内层下标为 `(block - 519) % 512`。
    /// `create` 为真时分配缺失的数据块和间接块，但从不覆盖已有的非零项。
    ///
    /// # 返回值
    /// - `Ok(Some(zone))`：物理块号；
    /// - `Ok(None)`：未映射且 `create` 为假；
    /// - `Err(NoSpace)`：需要分配但设备已满；
    /// - `Err(Io)`：间接块读盘失败。
    ///
    /// # 可能的错误
    /// - `block` 超出可映射范围时 panic。
    pub fn translate(&mut self, block: usize, create: bool) -> Result<Option<u32>> {
        if block >= MAX_FILE_BLOCKS {
            panic!("_bmap: block>big");
        }
        if block < NDIRECT {
            return self.zone_slot(block, create);
        }
        let block = block - NDIRECT;
        if block < NINDIRECT {
            return match self.zone_slot(NDIRECT, create)? {
                Some(ind) => self.indirect_entry(ind, block, create),
                None => Ok(None),
            };
        }
        let block = block - NINDIRECT;
        let dind = match self.zone_slot(NDIRECT + 1, create)? {
            Some(dind) => dind,
            None => return Ok(None),
        };
        match self.indirect_entry(dind, block / NINDIRECT, create)? {
            Some(ind) => self.indirect_entry(ind, block % NINDIRECT, create),
            None => Ok(None),
        }
    }

    /// inode 自身的第 `slot` 个区段指针，必要时分配
    fn zone_slot(&mut self, slot: usize, create: bool) -> Result<Option<u32>> {
        if create && self.data.disk.zone[slot] == 0 {
            let zone = self.cache.supers.new_block(self.dev)?;
            self.data.disk.zone[slot] = zone as u16;
            self.data.ctime = process::current_time();
            self.mark_dirty();
        }
        Ok(nonzero(self.data.disk.zone[slot]))
    }

    /// 间接块 `table` 的第 `idx` 项，必要时分配。
    ///
    /// 分配新块时不持有间接块的锁；重新加锁后若发现该项已被填上，保留已有的值并释放新块。
    fn indirect_entry(&mut self, table: u32, idx: usize, create: bool) -> Result<Option<u32>> {
        let bcache = self.cache.bcache;
        let supers = self.cache.supers;
        let buf = bcache.bread(self.dev, table)?;
        let cur = buf.lock().zone(idx);
        if cur != 0 || !create {
            return Ok(nonzero(cur));
        }

        let fresh = supers.new_block(self.dev)?;
        let mut data = buf.lock();
        let existing = data.zone(idx);
        if existing != 0 {
            drop(data);
            supers.free_block(self.dev, fresh)?;
            return Ok(Some(existing as u32));
        }
        data.set_zone(idx, fresh as u16);
        data.mark_dirty();
        Ok(Some(fresh))
    }

    /// 释放文件的全部数据块。
    ///
    /// # 功能说明
    /// 只对普通文件与目录生效。依次释放直接块、一次间接块及其各项、
    /// 二次间接块及其每个二级间接块与各项，清空全部区段指针，长度置零，
    /// 更新修改时间并标记为脏。间接块读盘失败时其中的项无法释放，只记录警告。
    pub fn truncate(&mut self) -> Result<()> {
        match self.itype() {
            InodeType::Regular | InodeType::Directory => {}
            _ => return Ok(()),
        }
        let supers = self.cache.supers;
        for i in 0..NDIRECT {
            let zone = self.data.disk.zone[i];
            if zone != 0 {
                supers.free_block(self.dev, zone as u32)?;
                self.data.disk.zone[i] = 0;
            }
        }
        self.free_ind(self.data.disk.zone[NDIRECT])?;
        self.data.disk.zone[NDIRECT] = 0;
        self.free_dind(self.data.disk.zone[NDIRECT + 1])?;
        self.data.disk.zone[NDIRECT + 1] = 0;

        self.data.disk.size = 0;
        let now = process::current_time();
        self.data.disk.mtime = now;
        self.data.ctime = now;
        self.mark_dirty();
        Ok(())
    }

    /// 读出间接块的全部项
    fn read_entries(&self, block: u32) -> Option<[u16; NINDIRECT]> {
        match self.cache.bcache.bread(self.dev, block) {
            Ok(buf) => {
                let data = buf.lock();
                let mut entries = [0u16; NINDIRECT];
                for (k, e) in entries.iter_mut().enumerate() {
                    *e = data.zone(k);
                }
                Some(entries)
            }
            Err(e) => {
                warn!("truncate: indirect block {} unreadable: {}", block, e);
                None
            }
        }
    }

    fn free_ind(&self, block: u16) -> Result<()> {
        if block == 0 {
            return Ok(());
        }
        let supers = self.cache.supers;
        if let Some(entries) = self.read_entries(block as u32) {
            for &zone in entries.iter().filter(|&&z| z != 0) {
                supers.free_block(self.dev, zone as u32)?;
            }
        }
        supers.free_block(self.dev, block as u32)
    }

    fn free_dind(&self, block: u16) -> Result<()> {
        if block == 0 {
            return Ok(());
        }
        if let Some(entries) = self.read_entries(block as u32) {
            for &ind in entries.iter().filter(|&&z| z != 0) {
                self.free_ind(ind)?;
            }
        }
        self.cache.supers.free_block(self.dev, block as u32)
    }
}

impl<'a> Deref for InodeGuard<'a> {
    type Target = InodeData;

    fn deref(&self) -> &InodeData {
        self.data
    }
}

impl<'a> DerefMut for InodeGuard<'a> {
    fn deref_mut(&mut self) -> &mut InodeData {
        self.data
    }
}

impl<'a> Drop for InodeGuard<'a> {
    fn drop(&mut self) {
        self.cache.unlock_inode(self.index);
    }
}
