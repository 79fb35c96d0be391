//! Minix v1 存储栈：块缓冲区缓存、超级块表、位图分配与内存 inode 表
//!
//! 调度原语（睡眠、唤醒、关中断）与块设备驱动由使用者通过
//! [`process::install`] 和 [`fs::FileSystem::register_device`] 提供。

#![cfg_attr(not(test), no_std)]
#![warn(rust_2018_idioms)]

#[macro_use]
extern crate bitflags;

extern crate alloc;

pub mod consts;
pub mod driver;
pub mod fs;
pub mod process;
pub mod spinlock;

#[cfg(test)]
mod testutil;
