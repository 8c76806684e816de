mod cli;

use std::error::Error;
use std::fs::{self as host_fs, OpenOptions};
use std::io;
use std::io::Write;
use std::process;
use std::sync::Arc;

use clap::Parser;
use cli::{Cli, Command};
use xv6_fs::{FileDisk, FileSystem, InodeType, MkfsParams, OpenFlags};

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Mkfs { size, ninodes, nlog } => {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&cli.image)?;
            let disk = Arc::new(FileDisk::with_size(file, size)?);
            let fs = FileSystem::format(disk, MkfsParams { size, ninodes, nlog })?;
            println!("{:#?}", fs.superblock());
            Ok(())
        }
        command => {
            let file = OpenOptions::new().read(true).write(true).open(&cli.image)?;
            let fs = FileSystem::mount(Arc::new(FileDisk::open(file)?))?;
            run(&fs, command)
        }
    }
}

fn run(fs: &FileSystem, command: Command) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Mkfs { .. } => return Err("volume already mounted".into()),
        Command::Info => {
            println!("{:#?}", fs.superblock());
            println!("{:#?}", fs.stats());
        }
        Command::Fsck => {
            let report = fs.fsck();
            for problem in &report.problems {
                println!("{problem}");
            }
            println!(
                "{} inodes, {} blocks, {} problems",
                report.inodes,
                report.blocks,
                report.problems.len()
            );
            if !report.is_clean() {
                process::exit(1);
            }
        }
        Command::Ls { path } => {
            let dir = fs.namei(&path)?;
            let entries = {
                let mut idata = dir.lock();
                if idata.get_itype() != InodeType::Directory {
                    let st = idata.stat();
                    println!("{:>4} {:?} {:>8} {}", st.inum, st.itype, st.size, path);
                    return Ok(())
                }
                idata.read_dir()
            };
            for entry in entries {
                let inode = fs.core().iget(dir.dev(), entry.inum as u32)?;
                let st = inode.lock().stat();
                println!("{:>4} {:?} {:>8} {}", st.inum, st.itype, st.size, entry.name_lossy());
            }
        }
        Command::Cat { path } => {
            let fd = fs.sys_open(&path, OpenFlags::RDONLY)?;
            let mut buf = vec![0u8; 4096];
            let stdout = io::stdout();
            let mut out = stdout.lock();
            loop {
                let n = fs.sys_read(fd, &mut buf)?;
                if n == 0 {
                    break
                }
                out.write_all(&buf[..n])?;
            }
            fs.sys_close(fd)?;
        }
        Command::Put { source, path } => {
            let data = host_fs::read(&source)?;
            let fd = fs.sys_open(&path, OpenFlags::CREATE | OpenFlags::WRONLY | OpenFlags::TRUNC)?;
            let n = fs.sys_write(fd, &data)?;
            fs.sys_close(fd)?;
            println!("{}: {} bytes", path, n);
        }
        Command::Mkdir { path } => fs.sys_mkdir(&path)?,
        Command::Rm { path } => fs.sys_unlink(&path)?,
    }

    Ok(())
}
