//! 块设备驱动模块，包含内存盘与宿主文件镜像两种实现

use std::io;

use crate::consts::fs::BSIZE;

mod file_disk;
mod ramdisk;

pub use file_disk::FileDisk;
pub use ramdisk::RamDisk;

/// 块设备接口
///
/// 文件系统核心只把设备看作一组按块号寻址的定长块，
/// 读写都是同步完成的。缓冲区缓存是唯一的调用者。
pub trait BlockDevice: Send + Sync {
    /// 功能：将块 `blockno` 的内容读入 `buf`。
    fn read_block(&self, blockno: u32, buf: &mut [u8; BSIZE]) -> io::Result<()>;
    /// 功能：将 `buf` 写入块 `blockno`。
    fn write_block(&self, blockno: u32, buf: &[u8; BSIZE]) -> io::Result<()>;
    /// 设备的总块数
    fn num_blocks(&self) -> u32;
}

fn out_of_range(blockno: u32, nblocks: u32) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("block {} beyond device end {}", blockno, nblocks),
    )
}
