//! 超级块操作
//!
//! 每个已挂载的设备在超级块表中占用一个槽位，槽位保存设备的几何信息，
//! 并常驻（钉住）该设备的 inode 位图与逻辑块位图所在的缓冲区。

use array_macro::array;
use arrayvec::ArrayVec;

use core::cell::UnsafeCell;
use core::mem;
use core::ptr;

use log::{debug, warn};

use super::{Bcache, Buf, FsError, Inode, Result};
use crate::consts::fs::{INODES_PER_BLOCK, I_MAP_SLOTS, NR_SUPER, SUPER_MAGIC, Z_MAP_SLOTS};
use crate::process;
use crate::spinlock::{SpinLock, SpinLockGuard};

/// 磁盘上的 Minix v1 超级块，位于设备的 1 号块
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct RawSuperBlock {
    ninodes: u16,
    nzones: u16,
    imap_blocks: u16,
    zmap_blocks: u16,
    firstdatazone: u16,
    log_zone_size: u16,
    max_size: u32,
    magic: u16,
}

/// 已挂载设备的几何信息
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Geometry {
    /// inode 总数
    pub ninodes: u16,
    /// 逻辑块（区段）总数，包括引导块与元数据块
    pub nzones: u16,
    /// inode 位图占用的块数
    pub imap_blocks: u16,
    /// 逻辑块位图占用的块数
    pub zmap_blocks: u16,
    /// 第一个数据块的块号
    pub firstdatazone: u16,
    pub log_zone_size: u16,
    /// 文件最大长度（字节）
    pub max_size: u32,
}

impl Geometry {
    /// 第一个 inode 位图块的块号
    pub fn imap_start(&self) -> u32 {
        2
    }

    /// 第一个逻辑块位图块的块号
    pub fn zmap_start(&self) -> u32 {
        2 + self.imap_blocks as u32
    }

    /// 编号为 `num` 的 inode 所在的块号
    pub fn inode_block(&self, num: u16) -> u32 {
        2 + self.imap_blocks as u32
            + self.zmap_blocks as u32
            + (num as u32 - 1) / INODES_PER_BLOCK as u32
    }

    fn from_raw(raw: &RawSuperBlock) -> Self {
        Self {
            ninodes: raw.ninodes,
            nzones: raw.nzones,
            imap_blocks: raw.imap_blocks,
            zmap_blocks: raw.zmap_blocks,
            firstdatazone: raw.firstdatazone,
            log_zone_size: raw.log_zone_size,
            max_size: raw.max_size,
        }
    }
}

/// 槽位元数据，受 `meta` 自旋锁保护
#[derive(Clone, Copy)]
pub(super) struct SuperMeta {
    /// 设备号，0 表示槽位空闲
    pub(super) dev: u16,
    /// 槽位正被读入或拆除
    locked: bool,
    pub(super) geo: Geometry,
    /// 挂载点 inode 的 `(dev, num)`
    imount: Option<(u16, u16)>,
}

impl SuperMeta {
    const fn new() -> Self {
        Self {
            dev: 0,
            locked: false,
            geo: Geometry {
                ninodes: 0,
                nzones: 0,
                imap_blocks: 0,
                zmap_blocks: 0,
                firstdatazone: 0,
                log_zone_size: 0,
                max_size: 0,
            },
            imount: None,
        }
    }
}

/// 槽位持有的缓冲区与 inode 句柄，只在持有槽位锁时访问
struct SuperMaps {
    imap: ArrayVec<Buf, I_MAP_SLOTS>,
    zmap: ArrayVec<Buf, Z_MAP_SLOTS>,
    /// 该文件系统的根 inode（只有根文件系统设置）
    isup: Option<Inode>,
    /// 该文件系统挂载在其上的目录 inode
    imount: Option<Inode>,
}

impl SuperMaps {
    const fn new() -> Self {
        Self {
            imap: ArrayVec::new_const(),
            zmap: ArrayVec::new_const(),
            isup: None,
            imount: None,
        }
    }
}

/// 超级块表
///
/// # 结构体用途
/// 记录所有已挂载设备。`meta` 自旋锁保护槽位的身份、锁标志与几何信息；
/// 跨越读盘的操作（读入、拆除、设置挂载点）通过槽位锁标志串行化，
/// 等待者在槽位通道上睡眠，醒来后重新检查槽位身份。
pub struct SuperTable {
    pub(super) bcache: &'static Bcache,
    root_dev: u16,
    meta: SpinLock<[SuperMeta; NR_SUPER]>,
    maps: [UnsafeCell<SuperMaps>; NR_SUPER],
}

// maps 只在持有对应槽位锁标志时访问
unsafe impl Sync for SuperTable {}

impl SuperTable {
    pub fn new(bcache: &'static Bcache, root_dev: u16) -> Self {
        Self {
            bcache,
            root_dev,
            meta: SpinLock::new(array![_ => SuperMeta::new(); NR_SUPER], "super"),
            maps: array![_ => UnsafeCell::new(SuperMaps::new()); NR_SUPER],
        }
    }

    pub fn root_dev(&self) -> u16 {
        self.root_dev
    }

    #[inline]
    fn channel(&self, i: usize) -> usize {
        &self.maps[i] as *const UnsafeCell<SuperMaps> as usize
    }

    fn lock_slot<'a>(
        &self,
        mut meta: SpinLockGuard<'a, [SuperMeta; NR_SUPER]>,
        i: usize,
    ) -> SpinLockGuard<'a, [SuperMeta; NR_SUPER]> {
        while meta[i].locked {
            meta = meta.sleep(self.channel(i));
        }
        meta[i].locked = true;
        meta
    }

    fn unlock_slot(&self, i: usize) {
        self.meta.lock()[i].locked = false;
        process::wakeup(self.channel(i));
    }

    /// 槽位 `i` 的缓冲区与 inode 句柄
    ///
    /// # 安全性
    /// 调用者必须持有槽位 `i` 的锁标志。
    #[allow(clippy::mut_from_ref)]
    unsafe fn maps(&self, i: usize) -> &mut SuperMaps {
        &mut *self.maps[i].get()
    }

    /// 查找 `dev` 所在的槽位，槽位加锁时等待，醒来后重新核对。
    fn find<'a>(
        &'a self,
        mut meta: SpinLockGuard<'a, [SuperMeta; NR_SUPER]>,
        dev: u16,
    ) -> (SpinLockGuard<'a, [SuperMeta; NR_SUPER]>, Option<usize>) {
        if dev == 0 {
            return (meta, None);
        }
        'rescan: loop {
            for i in 0..NR_SUPER {
                if meta[i].dev != dev {
                    continue;
                }
                while meta[i].locked {
                    meta = meta.sleep(self.channel(i));
                }
                if meta[i].dev == dev {
                    return (meta, Some(i));
                }
                continue 'rescan;
            }
            return (meta, None);
        }
    }

    /// 取得已挂载设备 `dev` 的几何信息，未挂载返回 `None`
    pub fn get_super(&self, dev: u16) -> Option<Geometry> {
        let (meta, slot) = self.find(self.meta.lock(), dev);
        slot.map(|i| meta[i].geo)
    }

    /// 与 `get_super` 相同，未挂载时返回 `FsError::NotMounted`
    pub fn geometry(&self, dev: u16) -> Result<Geometry> {
        self.get_super(dev).ok_or(FsError::NotMounted)
    }

    /// 读入设备 `dev` 的超级块。
    ///
    /// # 功能说明
    /// 设备已在表中时直接返回其几何信息。否则占用一个空闲槽位并加锁，读 1 号块，
    /// 核对魔数，读入并钉住位图块，把两个位图的第 0 位置 1（0 号 inode 与 0 号区段从不分配）。
    ///
    /// # 返回值
    /// - `Ok(geo)`：设备已挂载到表中；
    /// - `Err(TooManyMounts)`：没有空闲槽位；
    /// - `Err(Io)`：超级块或位图读盘失败；
    /// - `Err(BadSuperBlock)`：魔数不符或位图块数超出上限。
    ///
    /// 失败时槽位被释放，表保持原样。
    pub fn read_super(&self, dev: u16) -> Result<Geometry> {
        if dev == 0 {
            return Err(FsError::NoSuchDevice);
        }
        let slot = {
            let (mut meta, found) = self.find(self.meta.lock(), dev);
            if let Some(i) = found {
                return Ok(meta[i].geo);
            }
            match (0..NR_SUPER).find(|&i| meta[i].dev == 0 && !meta[i].locked) {
                Some(i) => {
                    meta[i] = SuperMeta { dev, locked: true, ..SuperMeta::new() };
                    i
                }
                None => return Err(FsError::TooManyMounts),
            }
        };

        match self.load(slot, dev) {
            Ok(geo) => {
                self.meta.lock()[slot].geo = geo;
                debug!("read_super: dev {:04x} {:?}", dev, geo);
                self.unlock_slot(slot);
                Ok(geo)
            }
            Err(e) => {
                let maps = unsafe { self.maps(slot) };
                let bufs = (mem::take(&mut maps.imap), mem::take(&mut maps.zmap));
                self.meta.lock()[slot].dev = 0;
                self.unlock_slot(slot);
                drop(bufs);
                Err(e)
            }
        }
    }

    /// 读入超级块与位图，调用者持有槽位锁
    fn load(&self, slot: usize, dev: u16) -> Result<Geometry> {
        let raw = {
            let buf = self.bcache.bread(dev, 1)?;
            let data = buf.lock();
            unsafe { ptr::read_unaligned(data.as_ptr() as *const RawSuperBlock) }
        };
        if raw.magic != SUPER_MAGIC {
            warn!("read_super: bad magic {:#x} on dev {:04x}", raw.magic, dev);
            return Err(FsError::BadSuperBlock);
        }
        let geo = Geometry::from_raw(&raw);
        if geo.imap_blocks as usize > I_MAP_SLOTS || geo.zmap_blocks as usize > Z_MAP_SLOTS {
            return Err(FsError::BadSuperBlock);
        }

        let maps = unsafe { self.maps(slot) };
        for k in 0..geo.imap_blocks as u32 {
            maps.imap.push(self.bcache.bread(dev, geo.imap_start() + k)?);
        }
        for k in 0..geo.zmap_blocks as u32 {
            maps.zmap.push(self.bcache.bread(dev, geo.zmap_start() + k)?);
        }
        if maps.imap.is_empty() || maps.zmap.is_empty() {
            return Err(FsError::BadSuperBlock);
        }
        maps.imap[0].lock()[0] |= 1;
        maps.zmap[0].lock()[0] |= 1;
        Ok(geo)
    }

    /// 从表中拆除设备 `dev`，释放钉住的位图缓冲区。
    ///
    /// 根设备与仍被挂载在某个目录上的设备不会被拆除，只记录警告。
    pub fn put_super(&self, dev: u16) {
        if dev == self.root_dev {
            warn!("root diskette changed: prepare for armageddon");
            return;
        }
        let (meta, slot) = self.find(self.meta.lock(), dev);
        let i = match slot {
            Some(i) => i,
            None => return,
        };
        if meta[i].imount.is_some() {
            warn!("Mounted disk changed - tssk, tssk");
            return;
        }
        let mut meta = self.lock_slot(meta, i);
        meta[i].dev = 0;
        drop(meta);

        let maps = unsafe { self.maps(i) };
        let bufs = (mem::take(&mut maps.imap), mem::take(&mut maps.zmap));
        self.unlock_slot(i);
        drop(bufs);
    }

    /// 如果 `(dev, num)` 是某个文件系统的挂载点，返回该文件系统的设备号。
    ///
    /// 调用者可以持有 inode 表的自旋锁。
    pub(super) fn mounted_on(&self, dev: u16, num: u16) -> Option<u16> {
        let meta = self.meta.lock();
        meta.iter()
            .find(|s| s.dev != 0 && s.imount == Some((dev, num)))
            .map(|s| s.dev)
    }

    /// 设备 `dev` 是否已挂载在某个目录上
    pub fn is_mounted(&self, dev: u16) -> bool {
        let (meta, slot) = self.find(self.meta.lock(), dev);
        slot.map_or(false, |i| meta[i].imount.is_some())
    }

    /// 记录 `dev` 的挂载点（以及根文件系统的根 inode）
    ///
    /// # 返回值
    /// 设备未挂载时返回 `NotMounted`，已有挂载点时返回 `Busy`，两种情况下传入的句柄都会被释放。
    pub(super) fn set_mount(&self, dev: u16, imount: Inode, isup: Option<Inode>) -> Result<()> {
        let (meta, slot) = self.find(self.meta.lock(), dev);
        let i = slot.ok_or(FsError::NotMounted)?;
        if meta[i].imount.is_some() {
            return Err(FsError::Busy);
        }
        let mut meta = self.lock_slot(meta, i);
        meta[i].imount = Some((imount.dev(), imount.num()));
        drop(meta);

        let maps = unsafe { self.maps(i) };
        maps.imount = Some(imount);
        maps.isup = isup;
        self.unlock_slot(i);
        Ok(())
    }

    /// 取走 `dev` 的挂载点与根 inode 句柄，由调用者释放
    pub(super) fn take_mount(&self, dev: u16) -> Result<(Inode, Option<Inode>)> {
        let (meta, slot) = self.find(self.meta.lock(), dev);
        let i = slot.ok_or(FsError::NotMounted)?;
        if meta[i].imount.is_none() {
            return Err(FsError::NotMounted);
        }
        let mut meta = self.lock_slot(meta, i);
        meta[i].imount = None;
        drop(meta);

        let maps = unsafe { self.maps(i) };
        let taken = (maps.imount.take(), maps.isup.take());
        self.unlock_slot(i);
        match taken {
            (Some(imount), isup) => Ok((imount, isup)),
            (None, isup) => {
                drop(isup);
                Err(FsError::NotMounted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::fs::BSIZE;
    use crate::consts::driver::{HD_MAJOR, RAMDISK_MAJOR};
    use crate::driver::RamDisk;
    use crate::testutil::{self, leak};

    const DEV: u16 = 0x0102;

    fn setup(image: Box<[u8]>) -> (&'static SuperTable, &'static RamDisk) {
        testutil::boot();
        let cache = leak(Bcache::new(32));
        let disk = leak(RamDisk::from_image(image));
        cache.register_device(RAMDISK_MAJOR, disk);
        (leak(SuperTable::new(cache, 0x0101)), disk)
    }

    #[test]
    fn read_super_parses_geometry_and_pins_bitmaps() {
        let (supers, disk) = setup(testutil::mkfs(64, 200));
        let geo = supers.read_super(DEV).unwrap();
        assert_eq!(geo.ninodes, 64);
        assert_eq!(geo.nzones, 200);
        assert_eq!((geo.imap_blocks, geo.zmap_blocks), (1, 1));
        assert_eq!(geo.firstdatazone, 6);
        assert_eq!(geo.inode_block(1), 4);
        assert_eq!(geo.inode_block(33), 5);

        // 第二次读入命中表项，不再读盘
        let reads = disk.reads();
        assert_eq!(supers.read_super(DEV).unwrap(), geo);
        assert_eq!(disk.reads(), reads);

        let imap = supers.bcache.get_hash_table(DEV, geo.imap_start()).unwrap();
        assert_eq!(imap.refcount(), 2);
        drop(imap);

        supers.put_super(DEV);
        assert!(supers.get_super(DEV).is_none());
        let imap = supers.bcache.get_hash_table(DEV, geo.imap_start()).unwrap();
        assert_eq!(imap.refcount(), 1);
    }

    #[test]
    fn bad_magic_leaves_slot_free() {
        let (supers, disk) = setup(testutil::mkfs(32, 64));
        let mut block = [0u8; BSIZE];
        disk.read_raw(1, &mut block);
        block[16] = 0;
        disk.write_raw(1, &block);

        assert_eq!(supers.read_super(DEV), Err(FsError::BadSuperBlock));
        assert!(supers.get_super(DEV).is_none());
        assert!(supers.meta.lock().iter().all(|s| s.dev == 0 && !s.locked));
    }

    #[test]
    fn table_full_reports_too_many_mounts() {
        testutil::boot();
        let cache = leak(Bcache::new(64));
        let supers = leak(SuperTable::new(cache, 0x0101));
        for minor in 0..NR_SUPER as u16 + 1 {
            let disk = leak(RamDisk::from_image(testutil::mkfs(32, 64)));
            // 每个次设备号都落到同一个主设备上，这里每次替换驱动并只读一次
            cache.register_device(HD_MAJOR, disk);
            let res = supers.read_super(0x0300 | minor);
            if (minor as usize) < NR_SUPER {
                assert!(res.is_ok());
            } else {
                assert_eq!(res, Err(FsError::TooManyMounts));
            }
        }
    }

    #[test]
    fn put_super_refuses_root() {
        let (supers, _) = setup(testutil::mkfs(32, 64));
        let geo = supers.read_super(0x0101).unwrap();
        supers.put_super(0x0101);
        assert_eq!(supers.get_super(0x0101), Some(geo));
    }
}
