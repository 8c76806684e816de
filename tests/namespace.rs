mod common;

use common::{fresh_volume, pattern, read_file, remount, write_file};
use xv6_fs::consts::fs::BSIZE;
use xv6_fs::{FsError, InodeType, OpenFlags};

fn nlink(fs: &xv6_fs::FileSystem, path: &str) -> u16 {
    fs.namei(path).unwrap().lock().get_nlink()
}

#[test]
fn duplicate_create_is_rejected() {
    let (_disk, fs) = fresh_volume();
    fs.sys_mkdir("/a").unwrap();
    assert_eq!(fs.sys_mkdir("/a"), Err(FsError::AlreadyExists));
    assert_eq!(fs.sys_mkdir("/missing/b"), Err(FsError::NotFound));

    write_file(&fs, "/a/f", b"x");
    assert_eq!(fs.sys_mkdir("/a/f"), Err(FsError::AlreadyExists));
    assert_eq!(fs.sys_mkdir("/a/f/g"), Err(FsError::NotDirectory));
    // 以 CREATE 打开已存在的普通文件会复用它
    let fd = fs.sys_open("/a/f", OpenFlags::CREATE | OpenFlags::RDONLY).unwrap();
    assert_eq!(fs.sys_fstat(fd).unwrap().size, 1);
    assert!(fs.fsck().is_clean());
}

#[test]
fn link_and_unlink_track_nlink() {
    let (_disk, fs) = fresh_volume();
    write_file(&fs, "/f", b"shared");
    fs.sys_mkdir("/d").unwrap();
    fs.sys_link("/f", "/d/g").unwrap();
    assert_eq!(nlink(&fs, "/f"), 2);
    assert_eq!(read_file(&fs, "/d/g"), b"shared");

    assert_eq!(fs.sys_link("/f", "/d/g"), Err(FsError::AlreadyExists));
    assert_eq!(fs.sys_link("/d", "/d2"), Err(FsError::IsDirectory));
    assert_eq!(nlink(&fs, "/f"), 2);

    fs.sys_unlink("/f").unwrap();
    assert_eq!(fs.namei("/f").unwrap_err(), FsError::NotFound);
    assert_eq!(nlink(&fs, "/d/g"), 1);
    assert_eq!(read_file(&fs, "/d/g"), b"shared");
}

#[test]
fn unlink_frees_blocks() {
    let (_disk, fs) = fresh_volume();
    let before = fs.stats();
    write_file(&fs, "/big", &pattern(20 * BSIZE, 7));
    let during = fs.stats();
    // 20 个数据块加一个间接块
    assert_eq!(during.free_blocks, before.free_blocks - 21);
    assert_eq!(during.free_inodes, before.free_inodes - 1);

    fs.sys_unlink("/big").unwrap();
    let after = fs.stats();
    assert_eq!(after.free_blocks, before.free_blocks);
    assert_eq!(after.free_inodes, before.free_inodes);
    assert!(fs.fsck().is_clean());
}

#[test]
fn open_file_survives_unlink_until_close() {
    let (disk, fs) = fresh_volume();
    let before = fs.stats();
    write_file(&fs, "/tmp", &pattern(2 * BSIZE, 1));

    let fd = fs.sys_open("/tmp", OpenFlags::RDONLY).unwrap();
    fs.sys_unlink("/tmp").unwrap();
    let mut buf = vec![0u8; 2 * BSIZE];
    assert_eq!(fs.sys_read(fd, &mut buf).unwrap(), 2 * BSIZE);
    assert_eq!(buf, pattern(2 * BSIZE, 1));
    assert_ne!(fs.stats().free_inodes, before.free_inodes);

    fs.sys_close(fd).unwrap();
    assert_eq!(fs.stats().free_blocks, before.free_blocks);
    assert_eq!(fs.stats().free_inodes, before.free_inodes);
    drop(fs);
    assert!(remount(&disk).fsck().is_clean());
}

#[test]
fn directories_unlink_only_when_empty() {
    let (_disk, fs) = fresh_volume();
    fs.sys_mkdir("/d").unwrap();
    write_file(&fs, "/d/f", b"1");
    assert_eq!(nlink(&fs, "/"), 2);

    assert_eq!(fs.sys_unlink("/d"), Err(FsError::DirectoryNotEmpty));
    assert_eq!(fs.sys_unlink("/d/."), Err(FsError::InvalidPath));
    assert_eq!(fs.sys_unlink("/d/.."), Err(FsError::InvalidPath));

    fs.sys_unlink("/d/f").unwrap();
    fs.sys_unlink("/d").unwrap();
    assert_eq!(nlink(&fs, "/"), 1);
    assert_eq!(fs.namei("/d").unwrap_err(), FsError::NotFound);
    assert!(fs.fsck().is_clean());
}

#[test]
fn dot_entries_resolve() {
    let (_disk, fs) = fresh_volume();
    fs.sys_mkdir("/a").unwrap();
    fs.sys_mkdir("/a/b").unwrap();
    let b = fs.namei("/a/b").unwrap();
    assert_eq!(fs.namei("/a/b/.").unwrap().inum(), b.inum());
    assert_eq!(fs.namei("/a/b/../b").unwrap().inum(), b.inum());
    assert_eq!(fs.namei("//a///b/").unwrap().inum(), b.inum());
    assert_eq!(fs.namei("/a/b/..").unwrap().inum(), fs.namei("/a").unwrap().inum());
    assert_eq!(fs.namei("/..").unwrap().inum(), fs.namei("/").unwrap().inum());
    assert_eq!(
        fs.namei("/a/b").unwrap().lock().get_itype(),
        InodeType::Directory
    );
}

#[test]
fn long_names_are_truncated() {
    let (_disk, fs) = fresh_volume();
    write_file(&fs, "/abcdefghijklmnopqrstuvwxyz", b"z");
    // 名字只保留前 DIRSIZ 个字节
    assert_eq!(read_file(&fs, "/abcdefghijklmnXXXX"), b"z");
    let fd = fs
        .sys_open("/abcdefghijklmnopq", OpenFlags::CREATE | OpenFlags::RDWR | OpenFlags::TRUNC)
        .unwrap();
    assert_eq!(fs.sys_fstat(fd).unwrap().size, 0);
}
