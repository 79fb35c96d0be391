//! 文件系统模块
//!
//! 自下而上分为四层：块缓冲区（bio）、超级块表（superblock）、
//! 位图分配（block）与内存 inode 表（inode）。[`FileSystem`] 把它们组装在一起，
//! 并提供挂载、卸载与同步等跨层操作。

use alloc::boxed::Box;
use core::fmt;

use log::{info, warn};

mod bio;
mod block;
mod inode;
mod superblock;

pub use bio::{Bcache, Buf, BufData, BufGuard};
pub use inode::{DiskInode, Inode, InodeCache, InodeData, InodeGuard, InodeType};
pub use superblock::{Geometry, SuperTable};

use crate::consts::fs::{DINODE_SIZE, NR_BUFFERS, NR_INODE, ROOT_DEV, ROOT_INO};
use crate::driver::BlockDevice;

/// 文件系统各层可能返回的错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// 块设备传输失败
    Io { dev: u16, block: u32 },
    /// 设备上没有空闲的数据块
    NoSpace,
    /// 设备上没有空闲的 inode
    NoFreeInode,
    /// 设备号无效
    NoSuchDevice,
    /// 超级块魔数不符或布局超出上限
    BadSuperBlock,
    /// 超级块表已满
    TooManyMounts,
    /// 资源正在使用
    Busy,
    /// 挂载点不是目录
    NotDirectory,
    /// 设备不在超级块表中或没有挂载
    NotMounted,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::Io { dev, block } => write!(f, "I/O error, dev {:04x}, block {}", dev, block),
            FsError::NoSpace => write!(f, "no space left on device"),
            FsError::NoFreeInode => write!(f, "no free inodes"),
            FsError::NoSuchDevice => write!(f, "no such device"),
            FsError::BadSuperBlock => write!(f, "bad super block"),
            FsError::TooManyMounts => write!(f, "super block table full"),
            FsError::Busy => write!(f, "device or resource busy"),
            FsError::NotDirectory => write!(f, "not a directory"),
            FsError::NotMounted => write!(f, "not mounted"),
        }
    }
}

pub type Result<T> = core::result::Result<T, FsError>;

/// 各缓存池的容量与根设备号
#[derive(Debug, Clone, Copy)]
pub struct FsConfig {
    pub nr_buffers: usize,
    pub nr_inodes: usize,
    pub root_dev: u16,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self { nr_buffers: NR_BUFFERS, nr_inodes: NR_INODE, root_dev: ROOT_DEV }
    }
}

/// 组装好的文件系统实例。
///
/// 三个缓存在创建时分配并一直存活，句柄 [`Buf`] 与 [`Inode`] 直接持有它们的
/// `'static` 引用。`FileSystem` 本身只是这三个引用的集合，可以随意复制。
#[derive(Clone, Copy)]
pub struct FileSystem {
    bcache: &'static Bcache,
    supers: &'static SuperTable,
    inodes: &'static InodeCache,
}

impl FileSystem {
    /// 按 `config` 分配缓冲区池、超级块表与 inode 表
    pub fn new(config: FsConfig) -> Self {
        let bcache: &'static Bcache = Box::leak(Box::new(Bcache::new(config.nr_buffers)));
        let supers: &'static SuperTable =
            Box::leak(Box::new(SuperTable::new(bcache, config.root_dev)));
        let inodes: &'static InodeCache =
            Box::leak(Box::new(InodeCache::new(bcache, supers, config.nr_inodes)));
        Self { bcache, supers, inodes }
    }

    pub fn bcache(&self) -> &'static Bcache {
        self.bcache
    }

    pub fn supers(&self) -> &'static SuperTable {
        self.supers
    }

    pub fn inodes(&self) -> &'static InodeCache {
        self.inodes
    }

    /// 为主设备号 `major` 注册驱动
    pub fn register_device(&self, major: usize, device: &'static dyn BlockDevice) {
        self.bcache.register_device(major, device);
    }

    pub fn bread(&self, dev: u16, block: u32) -> Result<Buf> {
        self.bcache.bread(dev, block)
    }

    /// 取得 `(dev, block)` 的缓冲区但不读盘
    pub fn getblk(&self, dev: u16, block: u32) -> Buf {
        self.bcache.getblk(dev, block)
    }

    pub fn iget(&self, dev: u16, num: u16) -> Result<Inode> {
        self.inodes.iget(dev, num)
    }

    pub fn new_inode(&self, dev: u16, uid: u16, gid: u8) -> Result<Inode> {
        self.inodes.new_inode(dev, uid, gid)
    }

    /// 挂载根文件系统，返回根目录。
    ///
    /// # 流程解释
    /// 读入根设备的超级块，取得根 inode，并把它同时记为根文件系统的挂载点与根 inode，
    /// 这两个引用一直保留到系统结束。最后报告空闲块与空闲 inode 的个数。
    ///
    /// # 可能的错误
    /// - 磁盘 inode 结构体大小不是 32 字节时 panic（"bad i-node size"）。
    pub fn mount_root(&self) -> Result<Inode> {
        if core::mem::size_of::<DiskInode>() != DINODE_SIZE {
            panic!("bad i-node size");
        }
        let root_dev = self.supers.root_dev();
        let geo = self.supers.read_super(root_dev)?;
        let root = self.inodes.iget(root_dev, ROOT_INO)?;
        self.supers.set_mount(root_dev, root.clone(), Some(root.clone()))?;

        let (zones, inodes) = self.supers.count_free(root_dev)?;
        info!("{}/{} free blocks", zones, geo.nzones);
        info!("{}/{} free inodes", inodes, geo.ninodes);
        #[cfg(feature = "verbose_init_info")]
        info!("root fs: {:?}", geo);
        Ok(root)
    }

    /// 把设备 `dev` 上的文件系统挂载到目录 `dir` 上。
    ///
    /// # 返回值
    /// - `Err(Busy)`：`dir` 还有其他引用、是根目录、超级块读不出来，或 `dev` 已经挂载；
    /// - `Err(NotDirectory)`：`dir` 不是目录。
    ///
    /// 成功后 `dir` 带上挂载标志，之后对它的 `iget` 会得到 `dev` 的根目录。
    pub fn mount(&self, dev: u16, dir: Inode) -> Result<()> {
        if dir.refcount() != 1 || dir.num() == ROOT_INO {
            return Err(FsError::Busy);
        }
        if dir.lock().itype() != InodeType::Directory {
            return Err(FsError::NotDirectory);
        }
        self.check_disk_change(dev);
        if let Err(e) = self.supers.read_super(dev) {
            warn!("mount: dev {:04x}: {}", dev, e);
            return Err(FsError::Busy);
        }
        if self.supers.is_mounted(dev) || dir.is_mount_point() {
            return Err(FsError::Busy);
        }
        dir.set_mount(true);
        let mount_point = dir.clone();
        if let Err(e) = self.supers.set_mount(dev, mount_point, None) {
            dir.set_mount(false);
            return Err(e);
        }
        info!("mount: dev {:04x} on {:04x}:{}", dev, dir.dev(), dir.num());
        Ok(())
    }

    /// 卸载设备 `dev` 上的文件系统。
    ///
    /// # 返回值
    /// - `Err(Busy)`：`dev` 是根设备，或其上还有被引用的 inode；
    /// - `Err(NotMounted)`：`dev` 没有挂载。
    pub fn umount(&self, dev: u16) -> Result<()> {
        if dev == self.supers.root_dev() {
            return Err(FsError::Busy);
        }
        if !self.supers.is_mounted(dev) {
            return Err(FsError::NotMounted);
        }
        if self.inodes.in_use(dev) {
            return Err(FsError::Busy);
        }
        let (mount_point, root) = self.supers.take_mount(dev)?;
        mount_point.set_mount(false);
        drop(root);
        drop(mount_point);
        self.supers.put_super(dev);
        self.inodes.sync_dev(dev);
        info!("umount: dev {:04x}", dev);
        Ok(())
    }

    /// 同步设备 `dev`
    pub fn sync_dev(&self, dev: u16) {
        self.inodes.sync_dev(dev);
    }

    /// 同步全部设备
    pub fn sync_all(&self) {
        self.bcache.flush_all();
        self.inodes.sync_inodes();
        self.bcache.flush_all();
    }

    /// 检查可移动介质是否被更换。
    ///
    /// 更换后拆除该设备的超级块，作废它的内存 inode 与缓冲区，返回 `true`。
    pub fn check_disk_change(&self, dev: u16) -> bool {
        if !self.bcache.media_changed(dev) {
            return false;
        }
        warn!("check_disk_change: media of dev {:04x} changed", dev);
        self.supers.put_super(dev);
        self.inodes.invalidate_inodes(dev);
        self.bcache.invalidate(dev);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::fs::{BSIZE, S_IFDIR};
    use crate::consts::driver::FLOPPY_MAJOR;
    use crate::driver::RamDisk;
    use crate::testutil::{self, leak};

    const ROOT: u16 = 0x0101;
    const FLOPPY: u16 = 0x0200;

    /// 根文件系统之外再注册一张软盘
    fn with_floppy() -> (FileSystem, &'static RamDisk, Inode) {
        let (fs, _, root) = testutil::root_fs(FsConfig::default(), 32, 64);
        let floppy = leak(RamDisk::from_image(testutil::mkfs(32, 64)));
        fs.register_device(FLOPPY_MAJOR, floppy);
        (fs, floppy, root)
    }

    fn new_dir(fs: FileSystem) -> Inode {
        let dir = fs.new_inode(ROOT, 0, 0).unwrap();
        dir.lock().set_mode(S_IFDIR | 0o755);
        dir
    }

    #[test]
    fn mount_root_pins_root_inode() {
        let (fs, _, root) = testutil::root_fs(FsConfig::default(), 32, 64);
        assert_eq!((root.dev(), root.num()), (ROOT, ROOT_INO));
        // 调用者的句柄，外加挂载点与根 inode 两个引用
        assert_eq!(root.refcount(), 3);
        assert!(fs.supers().is_mounted(ROOT));
        assert_eq!(fs.umount(ROOT), Err(FsError::Busy));
    }

    #[test]
    fn mount_redirects_mount_point_to_device_root() {
        let (fs, _, _root) = with_floppy();
        let dir = new_dir(fs);
        let (dev, num) = (dir.dev(), dir.num());
        fs.mount(FLOPPY, dir).unwrap();

        let crossed = fs.iget(dev, num).unwrap();
        assert_eq!((crossed.dev(), crossed.num()), (FLOPPY, ROOT_INO));
        assert_eq!(crossed.lock().itype(), InodeType::Directory);

        assert!(fs.inodes().in_use(FLOPPY));
        assert_eq!(fs.umount(FLOPPY), Err(FsError::Busy));
        drop(crossed);
        assert!(!fs.inodes().in_use(FLOPPY));

        // 卸载后挂载点只剩下我们这一个引用，说明穿越挂载点没有留下多余的计数
        fs.umount(FLOPPY).unwrap();
        let dir = fs.iget(dev, num).unwrap();
        assert_eq!(dir.refcount(), 1);
    }

    #[test]
    fn mount_rejects_busy_or_non_directory() {
        let (fs, _, root) = with_floppy();
        assert_eq!(fs.mount(FLOPPY, root.clone()), Err(FsError::Busy));

        let file = fs.new_inode(ROOT, 0, 0).unwrap();
        assert_eq!(fs.mount(FLOPPY, file), Err(FsError::NotDirectory));

        let dir = new_dir(fs);
        let extra = dir.clone();
        assert_eq!(fs.mount(FLOPPY, dir), Err(FsError::Busy));
        drop(extra);

        let dir = new_dir(fs);
        assert_eq!(fs.mount(0x0405, dir), Err(FsError::Busy));
    }

    #[test]
    fn mounting_twice_is_busy() {
        let (fs, _, _root) = with_floppy();
        fs.mount(FLOPPY, new_dir(fs)).unwrap();
        assert_eq!(fs.mount(FLOPPY, new_dir(fs)), Err(FsError::Busy));
    }

    #[test]
    fn umount_refuses_while_inodes_are_referenced() {
        let (fs, _, _root) = with_floppy();
        assert_eq!(fs.umount(FLOPPY), Err(FsError::NotMounted));

        let dir = new_dir(fs);
        let (dev, num) = (dir.dev(), dir.num());
        fs.mount(FLOPPY, dir).unwrap();
        let held = fs.iget(FLOPPY, ROOT_INO).unwrap();
        assert_eq!(fs.umount(FLOPPY), Err(FsError::Busy));
        drop(held);

        fs.umount(FLOPPY).unwrap();
        assert!(fs.supers().get_super(FLOPPY).is_none());
        let dir = fs.iget(dev, num).unwrap();
        assert_eq!((dir.dev(), dir.num()), (dev, num));
        assert!(!dir.is_mount_point());
    }

    #[test]
    fn umount_writes_back_floppy_changes() {
        let (fs, floppy, _root) = with_floppy();
        fs.mount(FLOPPY, new_dir(fs)).unwrap();
        let block = fs.supers().new_block(FLOPPY).unwrap();
        {
            let buf = fs.bread(FLOPPY, block).unwrap();
            let mut data = buf.lock();
            data[0] = 0x5a;
            data.mark_dirty();
        }
        fs.umount(FLOPPY).unwrap();

        let mut raw = [0u8; BSIZE];
        floppy.read_raw(block, &mut raw);
        assert_eq!(raw[0], 0x5a);
    }

    #[test]
    fn changed_media_drops_cached_state() {
        let (fs, floppy, _root) = with_floppy();
        fs.supers().read_super(FLOPPY).unwrap();
        let buf = fs.bread(FLOPPY, 5).unwrap();
        buf.lock()[0] = 1;
        buf.mark_dirty();
        drop(buf);

        assert!(!fs.check_disk_change(FLOPPY));
        floppy.set_media_changed(true);
        assert!(fs.check_disk_change(FLOPPY));
        assert!(fs.supers().get_super(FLOPPY).is_none());

        let buf = fs.bcache().get_hash_table(FLOPPY, 5).unwrap();
        assert!(!buf.is_uptodate());
        assert!(!buf.is_dirty());
        drop(buf);
        fs.sync_all();
        assert_eq!(floppy.writes(), 0);
    }

    #[test]
    fn sync_all_reaches_disk() {
        let (fs, disk, root) = testutil::root_fs(FsConfig::default(), 32, 64);
        root.lock().set_size(64);
        fs.sync_all();
        let mut raw = [0u8; BSIZE];
        disk.read_raw(4, &mut raw);
        let disk_inode =
            unsafe { core::ptr::read_unaligned(raw.as_ptr() as *const DiskInode) };
        assert_eq!(disk_inode.size, 64);
    }

    #[test]
    fn error_display() {
        use alloc::string::ToString;
        assert_eq!(
            FsError::Io { dev: 0x0301, block: 7 }.to_string(),
            "I/O error, dev 0301, block 7"
        );
        assert_eq!(FsError::NoSpace.to_string(), "no space left on device");
    }
}
