//! 编译期常量

pub mod fs {
    /// 块大小（字节）
    pub const BSIZE: usize = 4096;
    /// 超级块魔数
    pub const FSMAGIC: u32 = 0x10203040;

    /// 单个文件系统操作最多写入的块数
    pub const MAXOPBLOCKS: usize = 10;
    /// 日志头中可记录的块号数量
    pub const LOGSIZE: usize = 3 * MAXOPBLOCKS;
    /// 缓冲区缓存的容量
    pub const NBUF: usize = 2 * LOGSIZE;
    /// 内存中索引节点缓存的容量
    pub const NINODE: usize = 50;

    pub const NDIRECT: usize = 12;
    pub const NINDIRECT: usize = BSIZE / core::mem::size_of::<u32>();
    /// 单个文件最多占用的块数
    pub const MAXFILE: usize = NDIRECT + NINDIRECT;
    pub const MAX_FILE_SIZE: usize = MAXFILE * BSIZE;

    /// 目录项中名字的定长宽度，名字填满时不以 0 结尾
    pub const DIRSIZ: usize = 14;

    /// 每个位图块管理的块数
    pub const BPB: u32 = (BSIZE * 8) as u32;

    pub const ROOTDEV: u32 = 1;
    pub const ROOTINUM: u32 = 1;

    /// mkfs 默认的卷大小（块数）
    pub const FSSIZE: u32 = 1024;
    /// mkfs 默认的索引节点数量
    pub const NINODES: u32 = 200;
}

pub mod file {
    /// 系统打开文件表的容量
    pub const NFILE: usize = 100;
    /// 文件描述符表的容量
    pub const NOFILE: usize = 16;
    /// 可接受的最长路径
    pub const MAXPATH: usize = 128;
}
