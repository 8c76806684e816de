//! 以宿主文件作为磁盘镜像的块设备

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use parking_lot::Mutex;

use crate::consts::fs::BSIZE;

use super::{out_of_range, BlockDevice};

pub struct FileDisk {
    file: Mutex<File>,
    nblocks: u32,
}

impl FileDisk {
    /// 打开已有的镜像文件，块数由文件长度决定
    pub fn open(file: File) -> io::Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            nblocks: (len / BSIZE as u64) as u32,
        })
    }

    /// 将文件扩展（或截断）为 `nblocks` 个块后使用
    pub fn with_size(file: File, nblocks: u32) -> io::Result<Self> {
        file.set_len(nblocks as u64 * BSIZE as u64)?;
        Ok(Self {
            file: Mutex::new(file),
            nblocks,
        })
    }
}

impl BlockDevice for FileDisk {
    fn read_block(&self, blockno: u32, buf: &mut [u8; BSIZE]) -> io::Result<()> {
        if blockno >= self.nblocks {
            return Err(out_of_range(blockno, self.nblocks))
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(blockno as u64 * BSIZE as u64))?;
        file.read_exact(buf)
    }

    fn write_block(&self, blockno: u32, buf: &[u8; BSIZE]) -> io::Result<()> {
        if blockno >= self.nblocks {
            return Err(out_of_range(blockno, self.nblocks))
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(blockno as u64 * BSIZE as u64))?;
        file.write_all(buf)
    }

    fn num_blocks(&self) -> u32 {
        self.nblocks
    }
}
