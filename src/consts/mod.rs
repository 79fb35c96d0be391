//! 常量定义

pub mod fs;
pub mod driver;

/// 页大小，管道 inode 的缓冲页按此分配
pub const PGSIZE: usize = 4096;
