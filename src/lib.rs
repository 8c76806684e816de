//! 带日志的 xv6 风格文件系统
//!
//! 自底向上：块设备驱动、缓冲区缓存、重做日志、位图分配、索引节点、
//! 目录与路径，以及一组最小的文件系统调用。

#![warn(rust_2018_idioms)]

#[macro_use]
extern crate bitflags;

pub mod consts;
pub mod driver;
pub mod error;
pub mod fs;
mod sleeplock;
mod syscall;

pub use driver::{BlockDevice, FileDisk, RamDisk};
pub use error::{FsError, Result};
pub use fs::{
    DirEntry, File, FileStat, FileSystem, FsCore, FsStats, FsckProblem, FsckReport, Inode,
    InodeGuard, InodeType, MkfsParams, OpenFlags, SuperBlock, Transaction, mkfs,
};
