//! 文件系统相关常量，与 Minix v1 磁盘格式保持一致

/// 磁盘块大小（字节）
pub const BSIZE: usize = 1024;

/// 默认的缓冲块个数
pub const NR_BUFFERS: usize = 64;

/// 缓冲区哈希表的桶数
pub const NR_HASH: usize = 307;

/// 内存 inode 表的容量
pub const NR_INODE: usize = 32;

/// 可同时挂载的文件系统个数
pub const NR_SUPER: usize = 8;

/// inode 位图最多占用的块数
pub const I_MAP_SLOTS: usize = 8;

/// 逻辑块位图最多占用的块数
pub const Z_MAP_SLOTS: usize = 8;

/// 每个位图块能管理的位数
pub const BITS_PER_BLOCK: usize = BSIZE * 8;

/// Minix v1 文件系统魔数
pub const SUPER_MAGIC: u16 = 0x137F;

/// 根目录的 inode 号
pub const ROOT_INO: u16 = 1;

/// 默认根设备：第一个内存盘
pub const ROOT_DEV: u16 = 0x0101;

/// 磁盘 inode 结构体的大小（字节）
pub const DINODE_SIZE: usize = 32;

/// 每个磁盘块中的 inode 个数
pub const INODES_PER_BLOCK: usize = BSIZE / DINODE_SIZE;

/// 每个 inode 的区段指针个数：7 个直接块、1 个一次间接块、1 个二次间接块
pub const NZONES: usize = 9;

/// 直接块个数
pub const NDIRECT: usize = 7;

/// 一个间接块中的块号个数
pub const NINDIRECT: usize = BSIZE / core::mem::size_of::<u16>();

/// 一个文件最多可映射的逻辑块数
pub const MAX_FILE_BLOCKS: usize = NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT;

/// 文件类型掩码与各类型的取值，与 inode 的 mode 字段对应
pub const S_IFMT: u16 = 0o170000;
pub const S_IFREG: u16 = 0o100000;
pub const S_IFBLK: u16 = 0o060000;
pub const S_IFDIR: u16 = 0o040000;
pub const S_IFCHR: u16 = 0o020000;
pub const S_IFIFO: u16 = 0o010000;
