#![forbid(unsafe_code)]

use std::env;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result, bail};
use pfs::{DirEntry, FileType, FsFlavor, OpenFs, ReadOnlyFs, detect_filesystem_at_path};
use serde::Serialize;
use tracing::debug;

/// Bytes requested per `read` call when streaming a file.
const CAT_CHUNK: u32 = 1 << 16;

#[derive(Debug, Serialize)]
#[serde(tag = "filesystem", rename_all = "lowercase")]
enum InspectOutput {
    Btrfs {
        sectorsize: u32,
        nodesize: u32,
        generation: u64,
        total_bytes: u64,
        label: String,
    },
    Xfs {
        blocksize: u32,
        agcount: u32,
        dblocks: u64,
        version5: bool,
        label: String,
    },
    HfsPlus {
        hfsx: bool,
        block_size: u32,
        total_blocks: u32,
        file_count: u32,
        folder_count: u32,
    },
}

impl From<FsFlavor> for InspectOutput {
    fn from(flavor: FsFlavor) -> Self {
        match flavor {
            FsFlavor::Btrfs(sb) => Self::Btrfs {
                sectorsize: sb.sectorsize,
                nodesize: sb.nodesize,
                generation: sb.generation,
                total_bytes: sb.total_bytes,
                label: sb.label,
            },
            FsFlavor::Xfs(sb) => Self::Xfs {
                blocksize: sb.blocksize,
                agcount: sb.agcount,
                dblocks: sb.dblocks,
                version5: sb.has_crc(),
                label: sb.fname,
            },
            FsFlavor::HfsPlus(header) => Self::HfsPlus {
                hfsx: header.is_hfsx(),
                block_size: header.block_size,
                total_blocks: header.total_blocks,
                file_count: header.file_count,
                folder_count: header.folder_count,
            },
        }
    }
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "inspect" => {
            let Some(path) = args.next() else {
                bail!("inspect requires a path argument");
            };
            let json = args.any(|arg| arg == "--json");
            inspect(Path::new(&path), json)
        }
        "ls" | "cat" => {
            let Some(image) = args.next() else {
                bail!("{command} requires <image-path> <path>");
            };
            let inner = args.next().unwrap_or_else(|| "/".to_owned());
            let fs = OpenFs::open(&image)
                .with_context(|| format!("failed to open filesystem image: {image}"))?;
            if command == "ls" {
                list(&fs, &inner)
            } else {
                cat(&fs, &inner)
            }
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("pfs\n");
    println!("USAGE:");
    println!("  pfs inspect <image-path> [--json]");
    println!("  pfs ls <image-path> [path]");
    println!("  pfs cat <image-path> <path>");
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let flavor = detect_filesystem_at_path(path).with_context(|| {
        format!(
            "failed to detect btrfs/xfs/hfs+ metadata in {}",
            path.display()
        )
    })?;
    let output = InspectOutput::from(flavor);

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
        return Ok(());
    }

    println!("PolyFS Inspector");
    match output {
        InspectOutput::Btrfs {
            sectorsize,
            nodesize,
            generation,
            total_bytes,
            label,
        } => {
            println!("filesystem: btrfs");
            println!("sectorsize: {sectorsize}");
            println!("nodesize: {nodesize}");
            println!("generation: {generation}");
            println!("total_bytes: {total_bytes}");
            println!("label: {label}");
        }
        InspectOutput::Xfs {
            blocksize,
            agcount,
            dblocks,
            version5,
            label,
        } => {
            println!("filesystem: xfs");
            println!("blocksize: {blocksize}");
            println!("agcount: {agcount}");
            println!("dblocks: {dblocks}");
            println!("version5: {version5}");
            println!("label: {label}");
        }
        InspectOutput::HfsPlus {
            hfsx,
            block_size,
            total_blocks,
            file_count,
            folder_count,
        } => {
            println!("filesystem: {}", if hfsx { "hfsx" } else { "hfsplus" });
            println!("block_size: {block_size}");
            println!("total_blocks: {total_blocks}");
            println!("file_count: {file_count}");
            println!("folder_count: {folder_count}");
        }
    }
    Ok(())
}

fn type_char(kind: FileType) -> char {
    match kind {
        FileType::Directory => 'd',
        FileType::Symlink => 'l',
        FileType::BlockDevice => 'b',
        FileType::CharDevice => 'c',
        FileType::Fifo => 'p',
        FileType::Socket => 's',
        FileType::RegularFile => '-',
    }
}

fn list(fs: &OpenFs, path: &str) -> Result<()> {
    let dir = fs
        .resolve_path(path)
        .with_context(|| format!("failed to resolve {path}"))?;
    if dir.kind != FileType::Directory {
        println!("{} {:>10} {path}", type_char(dir.kind), dir.size);
        return Ok(());
    }

    let mut entries: Vec<DirEntry> = Vec::new();
    let mut offset = 0;
    loop {
        let page = fs.readdir(dir.ino, offset)?;
        let Some(last) = page.last() else {
            break;
        };
        offset = last.offset;
        entries.extend(page);
    }
    debug!(path, entries = entries.len(), "ls");

    for entry in entries {
        let attr = fs.getattr(entry.ino)?;
        let name = entry.name_str();
        if entry.kind == FileType::Symlink {
            let target = fs.readlink(entry.ino)?;
            println!(
                "{} {:>10} {name} -> {}",
                type_char(entry.kind),
                attr.size,
                String::from_utf8_lossy(&target)
            );
        } else {
            println!("{} {:>10} {name}", type_char(entry.kind), attr.size);
        }
    }
    Ok(())
}

fn cat(fs: &OpenFs, path: &str) -> Result<()> {
    let attr = fs
        .resolve_path(path)
        .with_context(|| format!("failed to resolve {path}"))?;
    let mut stdout = std::io::stdout().lock();
    let mut offset = 0_u64;
    while offset < attr.size {
        let chunk = fs.read(attr.ino, offset, CAT_CHUNK)?;
        if chunk.is_empty() {
            break;
        }
        stdout.write_all(&chunk).context("write to stdout")?;
        offset += chunk.len() as u64;
    }
    stdout.flush().context("flush stdout")?;
    Ok(())
}
