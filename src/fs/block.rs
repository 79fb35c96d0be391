//! 磁盘块操作，包括逻辑块位图与 inode 位图

use bit_field::BitField;
use log::{trace, warn};

use super::{FsError, Result, SuperTable};
use crate::consts::fs::BITS_PER_BLOCK;

impl SuperTable {
    /// 在位图中找到第一个为零且小于 `limit` 的位，置 1 并返回其位号。
    ///
    /// # 参数
    /// - `start`: 第一个位图块的块号；
    /// - `nblocks`: 位图占用的块数；
    /// - `limit`: 有效位的个数，超出部分视为已占用。
    ///
    /// # 返回值
    /// 位图已满时返回 `Ok(None)`，位图块读盘失败时返回 `Err(Io)`。
    fn alloc_bit(&self, dev: u16, start: u32, nblocks: u16, limit: u32) -> Result<Option<u32>> {
        for k in 0..nblocks as u32 {
            let base = k * BITS_PER_BLOCK as u32;
            if base >= limit {
                break;
            }
            let buf = self.bcache.bread(dev, start + k)?;
            let mut data = buf.lock();
            let found = data.iter().enumerate().find_map(|(idx, byte)| {
                if *byte == 0xff {
                    return None;
                }
                (0..8).find(|&bit| !byte.get_bit(bit)).map(|bit| idx * 8 + bit)
            });
            if let Some(off) = found {
                let bit = base + off as u32;
                if bit >= limit {
                    return Ok(None);
                }
                data[off / 8].set_bit(off % 8, true);
                data.mark_dirty();
                return Ok(Some(bit));
            }
        }
        Ok(None)
    }

    /// 清除位图中的第 `bit` 位，返回清除前该位是否为 1
    fn clear_bit(&self, dev: u16, start: u32, bit: u32) -> Result<bool> {
        let block = start + bit / BITS_PER_BLOCK as u32;
        let off = (bit % BITS_PER_BLOCK as u32) as usize;
        let buf = self.bcache.bread(dev, block)?;
        let mut data = buf.lock();
        let was_set = data[off / 8].get_bit(off % 8);
        data[off / 8].set_bit(off % 8, false);
        data.mark_dirty();
        Ok(was_set)
    }

    /// 统计位图中前 `limit` 位里为零的个数
    fn count_zero_bits(&self, dev: u16, start: u32, nblocks: u16, limit: u32) -> Result<u32> {
        let mut free = 0;
        for k in 0..nblocks as u32 {
            let base = k * BITS_PER_BLOCK as u32;
            if base >= limit {
                break;
            }
            let end = limit.min(base + BITS_PER_BLOCK as u32);
            let buf = self.bcache.bread(dev, start + k)?;
            let data = buf.lock();
            free += (0..end - base)
                .filter(|&off| !data[off as usize / 8].get_bit(off as usize % 8))
                .count() as u32;
        }
        Ok(free)
    }

    /// 在设备 `dev` 上分配一个数据块。
    ///
    /// # 功能说明
    /// 在逻辑块位图中找到第一个空闲位，位号 `bit` 对应块号 `bit + firstdatazone - 1`。
    /// 新块的缓冲区被清零并标记为有效与脏，之后的 `bread` 不会读盘。
    ///
    /// # 返回值
    /// - `Ok(block)`：分配到的块号；
    /// - `Err(NoSpace)`：设备上没有空闲块；
    /// - `Err(NotMounted)`：设备不在超级块表中。
    ///
    /// # 可能的错误
    /// - 新块的缓冲区已被别人引用时 panic，说明位图与缓存状态不一致。
    pub fn new_block(&self, dev: u16) -> Result<u32> {
        let geo = self.geometry(dev)?;
        let limit = (geo.nzones as u32 + 1).saturating_sub(geo.firstdatazone as u32);
        let bit = self
            .alloc_bit(dev, geo.zmap_start(), geo.zmap_blocks, limit)?
            .ok_or(FsError::NoSpace)?;
        let block = bit + geo.firstdatazone as u32 - 1;

        let buf = self.bcache.getblk(dev, block);
        if buf.refcount() != 1 {
            panic!("new_block: count is != 1");
        }
        let mut data = buf.lock();
        data.clear();
        data.set_uptodate();
        data.mark_dirty();
        trace!("new_block: dev {:04x} block {}", dev, block);
        Ok(block)
    }

    /// 释放设备 `dev` 上的数据块 `block`。
    ///
    /// # 功能说明
    /// 缓存中的副本若只被本函数引用，则丢弃其内容；若还被别人引用，记录警告后放弃释放。
    /// 然后清除逻辑块位图中的对应位。
    ///
    /// # 可能的错误
    /// - `block` 不在数据区内时 panic；
    /// - 对应位已经为零（重复释放）时 panic。
    pub fn free_block(&self, dev: u16, block: u32) -> Result<()> {
        let geo = self.geometry(dev)?;
        if block < geo.firstdatazone as u32 || block >= geo.nzones as u32 {
            panic!("trying to free block not in datazone");
        }
        if let Some(buf) = self.bcache.get_hash_table(dev, block) {
            let count = buf.refcount();
            if count != 1 {
                warn!("trying to free block ({:04x}:{}), count={}", dev, block, count);
                return Ok(());
            }
            buf.discard();
        }
        let bit = block - geo.firstdatazone as u32 + 1;
        if !self.clear_bit(dev, geo.zmap_start(), bit)? {
            panic!("free_block: bit already cleared");
        }
        Ok(())
    }

    /// 在 inode 位图中分配一个 inode 号
    pub fn alloc_inode_bit(&self, dev: u16) -> Result<u16> {
        let geo = self.geometry(dev)?;
        let bit = self
            .alloc_bit(dev, geo.imap_start(), geo.imap_blocks, geo.ninodes as u32 + 1)?
            .ok_or(FsError::NoFreeInode)?;
        Ok(bit as u16)
    }

    /// 清除 inode 位图中 `num` 对应的位
    ///
    /// # 可能的错误
    /// - `num` 为 0 或超过 inode 总数时 panic。
    pub fn free_inode_bit(&self, dev: u16, num: u16) -> Result<()> {
        let geo = self.geometry(dev)?;
        if num < 1 || num > geo.ninodes {
            panic!("trying to free inode 0 or nonexistant inode");
        }
        if !self.clear_bit(dev, geo.imap_start(), num as u32)? {
            warn!("free_inode: bit already cleared");
        }
        Ok(())
    }

    /// 统计设备 `dev` 上空闲的数据块数与 inode 数
    pub fn count_free(&self, dev: u16) -> Result<(u32, u32)> {
        let geo = self.geometry(dev)?;
        let zones = self.count_zero_bits(
            dev,
            geo.zmap_start(),
            geo.zmap_blocks,
            (geo.nzones as u32 + 1).saturating_sub(geo.firstdatazone as u32),
        )?;
        let inodes =
            self.count_zero_bits(dev, geo.imap_start(), geo.imap_blocks, geo.ninodes as u32 + 1)?;
        Ok((zones, inodes))
    }
}
