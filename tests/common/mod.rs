//! 集成测试的公共工具

#![allow(dead_code)]

use std::sync::Arc;

use xv6_fs::consts::fs::FSSIZE;
use xv6_fs::{FileSystem, MkfsParams, OpenFlags, RamDisk};

/// 安装 `env_logger`，重复调用无副作用
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 以默认大小格式化一块内存盘并挂载
pub fn fresh_volume() -> (Arc<RamDisk>, FileSystem) {
    init_logger();
    let disk = Arc::new(RamDisk::new(FSSIZE));
    let fs = FileSystem::format(disk.clone(), MkfsParams::default()).unwrap();
    (disk, fs)
}

/// 在同一块盘上重新挂载，挂载时执行日志恢复
pub fn remount(disk: &Arc<RamDisk>) -> FileSystem {
    FileSystem::mount(disk.clone()).unwrap()
}

/// 确定性的测试数据，相邻块的内容互不相同
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ seed).collect()
}

pub fn write_file(fs: &FileSystem, path: &str, data: &[u8]) {
    let fd = fs
        .sys_open(path, OpenFlags::CREATE | OpenFlags::WRONLY | OpenFlags::TRUNC)
        .unwrap();
    assert_eq!(fs.sys_write(fd, data).unwrap(), data.len());
    fs.sys_close(fd).unwrap();
}

pub fn read_file(fs: &FileSystem, path: &str) -> Vec<u8> {
    let fd = fs.sys_open(path, OpenFlags::RDONLY).unwrap();
    let mut out = Vec::new();
    let mut buf = [0u8; 1000];
    loop {
        let n = fs.sys_read(fd, &mut buf).unwrap();
        if n == 0 {
            break
        }
        out.extend_from_slice(&buf[..n]);
    }
    fs.sys_close(fd).unwrap();
    out
}
