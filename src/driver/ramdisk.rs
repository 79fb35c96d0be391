//! 内存盘
//!
//! 整个磁盘内容保存在一块内存中，请求在 `submit` 内同步完成。
//! 附带读写计数、坏块注入与介质更换标记，便于观察缓存层的行为。

use alloc::boxed::Box;
use alloc::vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use log::trace;

use super::{BlockDevice, IoCmd, IoRequest};
use crate::consts::fs::BSIZE;
use crate::spinlock::SpinLock;

const NO_BAD_BLOCK: u32 = u32::MAX;

pub struct RamDisk {
    image: SpinLock<Box<[u8]>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    bad_block: AtomicU32,
    changed: AtomicBool,
}

impl RamDisk {
    /// 创建一个 `nblocks` 个块、内容全零的内存盘
    pub fn new(nblocks: usize) -> Self {
        Self::from_image(vec![0u8; nblocks * BSIZE].into_boxed_slice())
    }

    /// 以现成的磁盘映像创建内存盘，映像长度应为块大小的整数倍
    pub fn from_image(image: Box<[u8]>) -> Self {
        Self {
            image: SpinLock::new(image, "ramdisk"),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            bad_block: AtomicU32::new(NO_BAD_BLOCK),
            changed: AtomicBool::new(false),
        }
    }

    pub fn nblocks(&self) -> usize {
        self.image.lock().len() / BSIZE
    }

    /// 已提交的读请求数
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// 已提交的写请求数
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// 之后对 `block` 的传输全部失败，`None` 取消注入
    pub fn set_bad_block(&self, block: Option<u32>) {
        self.bad_block.store(block.unwrap_or(NO_BAD_BLOCK), Ordering::Relaxed);
    }

    /// 模拟更换软盘
    pub fn set_media_changed(&self, changed: bool) {
        self.changed.store(changed, Ordering::Relaxed);
    }

    /// 绕过缓存直接读取后备存储
    pub fn read_raw(&self, block: u32, out: &mut [u8; BSIZE]) {
        let image = self.image.lock();
        let off = block as usize * BSIZE;
        out.copy_from_slice(&image[off..off + BSIZE]);
    }

    /// 绕过缓存直接改写后备存储
    pub fn write_raw(&self, block: u32, src: &[u8; BSIZE]) {
        let mut image = self.image.lock();
        let off = block as usize * BSIZE;
        image[off..off + BSIZE].copy_from_slice(src);
    }
}

impl BlockDevice for RamDisk {
    fn submit(&self, mut req: IoRequest) {
        let block = req.blockno();
        match req.cmd() {
            IoCmd::Read => self.reads.fetch_add(1, Ordering::Relaxed),
            IoCmd::Write => self.writes.fetch_add(1, Ordering::Relaxed),
        };
        trace!("ramdisk: {:?} dev {:04x} block {}", req.cmd(), req.dev(), block);

        let ok = {
            let mut image = self.image.lock();
            let off = block as usize * BSIZE;
            if block == self.bad_block.load(Ordering::Relaxed) || off + BSIZE > image.len() {
                false
            } else {
                match req.cmd() {
                    IoCmd::Read => req.data().copy_from_slice(&image[off..off + BSIZE]),
                    IoCmd::Write => image[off..off + BSIZE].copy_from_slice(req.data()),
                }
                true
            }
        };
        req.complete(ok);
    }

    fn media_changed(&self, _dev: u16) -> bool {
        self.changed.swap(false, Ordering::Relaxed)
    }
}
