//! 块设备相关常量

/// 主设备号的个数，主设备号 = 设备号 >> 8
pub const NR_BLK_DEV: usize = 7;

/// 内存盘（虚拟盘）的主设备号
pub const RAMDISK_MAJOR: usize = 1;

/// 软盘的主设备号，可移动介质
pub const FLOPPY_MAJOR: usize = 2;

/// 硬盘的主设备号
pub const HD_MAJOR: usize = 3;
