//! 宿主机上的测试支撑
//!
//! 用操作系统线程模拟 CPU，用条件变量实现睡眠与唤醒，并提供 Minix v1 磁盘映像的构造函数。

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Condvar, Mutex, MutexGuard, Once, PoisonError};
use std::thread;
use std::time::Instant;

use crate::consts::fs::{BITS_PER_BLOCK, BSIZE, DINODE_SIZE, INODES_PER_BLOCK, ROOT_INO, SUPER_MAGIC};
use crate::driver::{major, BlockDevice, IoRequest, RamDisk};
use crate::fs::{FileSystem, FsConfig, Inode};
use crate::process::{self, Scheduler};

static NEXT_CPU: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static CPU_ID: usize = NEXT_CPU.fetch_add(1, Ordering::Relaxed);
    static NOFF: Cell<usize> = Cell::new(0);
}

/// 每个通道一个计数器，`wakeup` 使其加一，睡眠者等到计数变化为止
struct HostScheduler {
    channels: Mutex<HashMap<usize, u64>>,
    cond: Condvar,
    epoch: Instant,
}

impl HostScheduler {
    fn channels(&self) -> MutexGuard<'_, HashMap<usize, u64>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Scheduler for HostScheduler {
    fn cpu_id(&self) -> usize {
        CPU_ID.with(|id| *id)
    }

    fn push_off(&self) {
        NOFF.with(|n| n.set(n.get() + 1));
    }

    fn pop_off(&self) {
        NOFF.with(|n| {
            if n.get() == 0 {
                panic!("pop_off");
            }
            n.set(n.get() - 1);
        });
    }

    fn sleep(&self, channel: usize, release: &mut dyn FnMut()) {
        let mut channels = self.channels();
        let generation = *channels.entry(channel).or_insert(0);
        release();
        while channels.get(&channel).copied().unwrap_or(0) == generation {
            channels = self.cond.wait(channels).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn wakeup(&self, channel: usize) {
        let mut channels = self.channels();
        *channels.entry(channel).or_insert(0) += 1;
        drop(channels);
        self.cond.notify_all();
    }

    fn current_time(&self) -> u32 {
        self.epoch.elapsed().as_secs() as u32 + 1
    }
}

/// 安装宿主机调度器，可重复调用
pub fn boot() {
    static BOOT: Once = Once::new();
    BOOT.call_once(|| {
        let scheduler = leak(HostScheduler {
            channels: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
            epoch: Instant::now(),
        });
        process::install(scheduler);
    });
}

pub fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

fn set_bit(map: &mut [u8], bit: usize) {
    map[bit / 8] |= 1 << (bit % 8);
}

/// 构造一个 Minix v1 磁盘映像。
///
/// 共 `nzones` 个块：引导块、超级块、inode 位图、逻辑块位图、inode 表，其后为数据区。
/// 1 号 inode 是根目录，只含 "." 与 ".." 两项，占用第一个数据块。
pub fn mkfs(ninodes: u16, nzones: u16) -> Box<[u8]> {
    let imap_blocks = (ninodes as usize + 1 + BITS_PER_BLOCK - 1) / BITS_PER_BLOCK;
    let zmap_blocks = (nzones as usize + 1 + BITS_PER_BLOCK - 1) / BITS_PER_BLOCK;
    let inode_blocks = (ninodes as usize + INODES_PER_BLOCK - 1) / INODES_PER_BLOCK;
    let firstdatazone = 2 + imap_blocks + zmap_blocks + inode_blocks;
    let mut image = vec![0u8; nzones as usize * BSIZE].into_boxed_slice();

    let sb = &mut image[BSIZE..2 * BSIZE];
    for (off, v) in [
        (0, ninodes),
        (2, nzones),
        (4, imap_blocks as u16),
        (6, zmap_blocks as u16),
        (8, firstdatazone as u16),
        (10, 0),
    ] {
        sb[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }
    sb[12..16].copy_from_slice(&(7 * 1024 + 512 * 1024 + 512 * 512 * 1024u32).to_le_bytes());
    sb[16..18].copy_from_slice(&SUPER_MAGIC.to_le_bytes());

    let imap = &mut image[2 * BSIZE..(2 + imap_blocks) * BSIZE];
    set_bit(imap, 0);
    set_bit(imap, ROOT_INO as usize);
    for bit in ninodes as usize + 1..imap_blocks * BITS_PER_BLOCK {
        set_bit(imap, bit);
    }

    let zstart = 2 + imap_blocks;
    let zmap = &mut image[zstart * BSIZE..(zstart + zmap_blocks) * BSIZE];
    set_bit(zmap, 0);
    set_bit(zmap, 1);
    for bit in nzones as usize + 1 - firstdatazone..zmap_blocks * BITS_PER_BLOCK {
        set_bit(zmap, bit);
    }

    let istart = (zstart + zmap_blocks) * BSIZE;
    let root = &mut image[istart..istart + DINODE_SIZE];
    root[0..2].copy_from_slice(&0o040755u16.to_le_bytes());
    root[4..8].copy_from_slice(&32u32.to_le_bytes());
    root[13] = 2;
    root[14..16].copy_from_slice(&(firstdatazone as u16).to_le_bytes());

    let dir = &mut image[firstdatazone * BSIZE..firstdatazone * BSIZE + 32];
    dir[0..2].copy_from_slice(&ROOT_INO.to_le_bytes());
    dir[2] = b'.';
    dir[16..18].copy_from_slice(&ROOT_INO.to_le_bytes());
    dir[18..20].copy_from_slice(b"..");
    image
}

/// 以新建的内存盘作为根设备，挂载根文件系统
pub fn root_fs(config: FsConfig, ninodes: u16, nzones: u16) -> (FileSystem, &'static RamDisk, Inode) {
    boot();
    let fs = FileSystem::new(config);
    let disk = leak(RamDisk::from_image(mkfs(ninodes, nzones)));
    fs.register_device(major(config.root_dev), disk);
    let root = fs.mount_root().unwrap();
    (fs, disk, root)
}

/// 在另一个线程中完成请求的磁盘，模拟中断侧的完成通知
pub struct IrqDisk {
    backing: &'static RamDisk,
    queue: Mutex<mpsc::Sender<IoRequest>>,
}

impl IrqDisk {
    pub fn spawn(backing: &'static RamDisk) -> &'static IrqDisk {
        let (tx, rx) = mpsc::channel::<IoRequest>();
        thread::spawn(move || {
            for req in rx {
                backing.submit(req);
            }
        });
        leak(IrqDisk { backing, queue: Mutex::new(tx) })
    }

    pub fn backing(&self) -> &'static RamDisk {
        self.backing
    }
}

impl BlockDevice for IrqDisk {
    fn submit(&self, req: IoRequest) {
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        // 发送失败时请求随错误一起被丢弃，按失败完成
        let _ = queue.send(req);
    }
}
