//! 块设备驱动接口
//!
//! 缓冲区缓存通过 [`BlockDevice::submit`] 把一次传输交给驱动，驱动在传输结束后
//! （可以是在中断上下文中）调用 [`IoRequest::complete`] 通知缓存层。
//! 设备按主设备号（`dev >> 8`）登记在缓存层的设备表中。

use crate::consts::fs::BSIZE;
use crate::fs::Bcache;

pub mod ramdisk;

pub use ramdisk::RamDisk;

/// 取设备号的主设备号，用于在设备表中定位驱动
#[inline]
pub const fn major(dev: u16) -> usize {
    (dev >> 8) as usize
}

/// 传输方向
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoCmd {
    Read,
    Write,
}

/// 块设备驱动需要实现的接口。
///
/// # 约定
/// - `submit` 可以同步完成传输，也可以只把请求排队，稍后在中断处理中完成；
/// - 无论成功与否，每个请求都必须恰好完成一次；
/// - 完成回调从不睡眠，驱动可以在任意上下文中调用它。
pub trait BlockDevice: Sync {
    /// 提交一次传输请求
    fn submit(&self, req: IoRequest);

    /// 可移动介质是否被更换过，查询后清除该标记
    fn media_changed(&self, dev: u16) -> bool {
        let _ = dev;
        false
    }
}

/// 一次正在进行的块传输。
///
/// 请求存在期间对应的缓冲块保持加锁状态，请求独占该缓冲块的数据区。
/// 驱动通过 [`data`](IoRequest::data) 读写数据，最后调用 [`complete`](IoRequest::complete)。
/// 未调用 `complete` 就被丢弃的请求按传输失败处理。
pub struct IoRequest {
    cache: Option<&'static Bcache>,
    index: usize,
    dev: u16,
    blockno: u32,
    cmd: IoCmd,
}

impl IoRequest {
    pub(crate) fn new(cache: &'static Bcache, index: usize, dev: u16, blockno: u32, cmd: IoCmd) -> Self {
        Self { cache: Some(cache), index, dev, blockno, cmd }
    }

    pub fn dev(&self) -> u16 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    pub fn cmd(&self) -> IoCmd {
        self.cmd
    }

    /// 块号换算成 512 字节扇区号
    pub fn sector(&self) -> u64 {
        self.blockno as u64 * (BSIZE / 512) as u64
    }

    /// 被传输缓冲块的数据区。
    /// 读请求时驱动向其中填入磁盘内容，写请求时驱动从其中取出要写的内容。
    pub fn data(&mut self) -> &mut [u8; BSIZE] {
        match self.cache {
            // 缓冲块在请求完成之前一直处于加锁状态，除请求之外没有人会访问它的数据区
            Some(cache) => unsafe { cache.request_data(self.index) },
            None => unreachable!(),
        }
    }

    /// 完成本次请求：`uptodate` 为传输结果。
    ///
    /// # 功能说明
    /// 设置缓冲块的 up-to-date 标志，解锁缓冲块并唤醒等待它的上下文。
    /// 该函数只获取自旋锁，可以在中断上下文中调用。
    pub fn complete(mut self, uptodate: bool) {
        if let Some(cache) = self.cache.take() {
            cache.end_request(self.index, uptodate);
        }
    }
}

impl Drop for IoRequest {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.take() {
            log::error!("driver dropped request: dev {:04x}, block {}", self.dev, self.blockno);
            cache.end_request(self.index, false);
        }
    }
}
