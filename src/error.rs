//! 可恢复的文件系统错误
//!
//! 只有调用方可以自行处理的情况才会以 [`FsError`] 返回，
//! 日志溢出、重复释放等破坏不变量的情况仍然直接 panic。

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("bad superblock magic {0:#x}")]
    BadMagic(u32),
    #[error("invalid volume geometry: {0}")]
    InvalidGeometry(&'static str),
    #[error("no such file or directory")]
    NotFound,
    #[error("entry already exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotDirectory,
    #[error("is a directory")]
    IsDirectory,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("invalid path")]
    InvalidPath,
    #[error("offset or length out of range")]
    OutOfRange,
    #[error("no free on-disk inode")]
    OutOfInodes,
    #[error("inode cache is full")]
    InodeCacheFull,
    #[error("open file table is full")]
    FileTableFull,
    #[error("no free file descriptor")]
    NoFreeFd,
    #[error("bad file descriptor")]
    BadFd,
    #[error("file not opened for reading")]
    NotReadable,
    #[error("file not opened for writing")]
    NotWritable,
    #[error("link across devices")]
    CrossDevice,
}

pub type Result<T> = core::result::Result<T, FsError>;
