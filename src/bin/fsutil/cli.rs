use clap::{Parser, Subcommand};
use std::path::PathBuf;

use xv6_fs::consts::fs::{FSSIZE, LOGSIZE, NINODES};

#[derive(Parser)]
#[command(about = "Inspect and edit xv6 file system images")]
pub struct Cli {
    /// Disk image file
    #[arg(long, short)]
    pub image: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create (or overwrite) the image and format an empty volume
    Mkfs {
        /// Volume size in blocks
        #[arg(long, default_value_t = FSSIZE)]
        size: u32,

        /// Number of on-disk inodes
        #[arg(long, default_value_t = NINODES)]
        ninodes: u32,

        /// Log region size in blocks, header included
        #[arg(long, default_value_t = LOGSIZE as u32 + 1)]
        nlog: u32,
    },
    /// Print the superblock and usage statistics
    Info,
    /// Check block references against the bitmap
    Fsck,
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print a file to stdout
    Cat { path: String },
    /// Copy a host file into the image
    Put { source: PathBuf, path: String },
    /// Create a directory
    Mkdir { path: String },
    /// Remove a file or an empty directory
    Rm { path: String },
}
