mod common;

use std::sync::Arc;

use common::{fresh_volume, pattern, read_file, remount};
use xv6_fs::consts::fs::BSIZE;
use xv6_fs::{OpenFlags, RamDisk};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Old,
    New,
}

/// 在 `/f` 已提交（空文件）的卷上写入两个块，写入到第 `budget` 次之后掉电。
fn crash_during_write(budget: u64) -> Arc<RamDisk> {
    let (disk, fs) = fresh_volume();
    let fd = fs.sys_open("/f", OpenFlags::CREATE | OpenFlags::RDWR).unwrap();

    disk.crash_after(budget);
    fs.sys_write(fd, &pattern(2 * BSIZE, 0x5a)).unwrap();
    drop(fs);
    disk.restore_power();
    disk
}

/// 重新挂载后文件要么保持为空，要么包含完整的新内容
fn check(disk: &Arc<RamDisk>) -> Outcome {
    let fs = remount(disk);
    let report = fs.fsck();
    assert!(report.is_clean(), "{:?}", report.problems);
    let data = read_file(&fs, "/f");
    if data.is_empty() {
        Outcome::Old
    } else {
        assert_eq!(data, pattern(2 * BSIZE, 0x5a));
        Outcome::New
    }
}

#[test]
fn transaction_is_all_or_nothing() {
    let outcomes: Vec<Outcome> = (0..40).map(|n| check(&crash_during_write(n))).collect();
    assert_eq!(outcomes[0], Outcome::Old);
    assert_eq!(*outcomes.last().unwrap(), Outcome::New);
    // 提交点之后的所有掉电都能恢复出新内容
    let first_new = outcomes.iter().position(|&o| o == Outcome::New).unwrap();
    assert!(outcomes[first_new..].iter().all(|&o| o == Outcome::New));
}

#[test]
fn recovery_is_idempotent() {
    for n in 0..40 {
        let expected = check(&crash_during_write(n));

        // 恢复过程本身再次掉电，之后的挂载必须得到相同的结果
        let disk = crash_during_write(n);
        disk.crash_after(1);
        drop(remount(&disk));
        disk.restore_power();
        assert_eq!(check(&disk), expected, "budget {}", n);
    }
}

#[test]
fn committed_operations_survive_remount() {
    let (disk, fs) = fresh_volume();
    fs.sys_mkdir("/d").unwrap();
    let fd = fs.sys_open("/d/f", OpenFlags::CREATE | OpenFlags::WRONLY).unwrap();
    fs.sys_write(fd, b"persist").unwrap();

    // 之后的写入全部丢失，但已返回的操作都已提交
    disk.crash_after(0);
    fs.sys_write(fd, b" lost").unwrap();
    drop(fs);
    disk.restore_power();

    let fs = remount(&disk);
    assert_eq!(read_file(&fs, "/d/f"), b"persist");
    assert!(fs.fsck().is_clean());
}

#[test]
fn last_handle_released_outside_an_operation_is_logged() {
    for budget in 0..20 {
        let (disk, fs) = fresh_volume();
        common::write_file(&fs, "/f", &pattern(3 * BSIZE, 1));
        let free_before = fs.stats().free_blocks;

        let handle = fs.namei("/f").unwrap();
        fs.sys_unlink("/f").unwrap();
        disk.crash_after(budget);
        // 回收数据块与索引节点在一个独立的事务中完成
        drop(handle);
        drop(fs);
        disk.restore_power();

        let fs = remount(&disk);
        let report = fs.fsck();
        assert!(report.is_clean(), "budget {}: {:?}", budget, report.problems);
        let free_after = fs.stats().free_blocks;
        assert!(
            free_after == free_before || free_after == free_before + 3,
            "budget {}: {} -> {}",
            budget,
            free_before,
            free_after
        );
    }
}
