//! Main entry point for the nestzip CLI application.
//!
//! Resolves a path that may cross archive boundaries
//! (`outer.zip/inner.zip/file.txt`), mounts every archive on the way
//! through the file system manager, and lists or extracts the addressed
//! entry.

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use nestzip::fs::{
    FsCompositeDriver, FsController, FsManager, HostDriver, MountPoint, ZipDriver,
};
use nestzip::zip::{EntryType, ZipConfig};
use nestzip::Cli;

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = ZipConfig {
        preambled: cli.preambled,
        postambled: cli.postambled,
    };
    let mut composite = FsCompositeDriver::new();
    composite.register("zip", Arc::new(ZipDriver::new().with_config(config)));
    let manager = FsManager::new(composite, HostDriver::new(PathBuf::from("/")))?;

    let (mount, entry) = resolve(&manager, &cli.path)?;
    let controller = manager.controller(&mount)?;

    if cli.list {
        list(&manager, &controller, &entry)?;
    } else if cli.pipe {
        pipe(&manager, &controller, &entry)?;
    } else {
        let dest = PathBuf::from(cli.extract_dir.as_deref().unwrap_or("."));
        extract(&manager, &controller, &entry, &dest, cli.is_quiet())?;
    }

    manager.sync_all().context("synchronization failed")?;
    Ok(())
}

/// Split a path into the innermost archive mount point and the entry path
/// within it.
///
/// The longest prefix that names an existing regular file on the host
/// becomes the outermost archive; every later component with an archive
/// suffix opens a further nesting level.
fn resolve(manager: &FsManager, path: &str) -> Result<(MountPoint, String)> {
    let absolute = std::path::absolute(path)?;
    let segments: Vec<String> = absolute
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();

    let mut host_path = PathBuf::from("/");
    let mut consumed = 0;
    for (i, seg) in segments.iter().enumerate() {
        host_path.push(seg);
        if host_path.is_file() {
            consumed = i + 1;
            break;
        }
        if !host_path.exists() {
            bail!("no such file: {}", host_path.display());
        }
    }
    if consumed == 0 {
        bail!("{} is a directory, not an archive", absolute.display());
    }

    let outermost = &segments[consumed - 1];
    let Some(scheme) = manager.composite().scheme_for(outermost) else {
        bail!("{outermost:?} is not a recognized archive");
    };
    let member = segments[..consumed].join("/");
    let mut mount = MountPoint::nested(&MountPoint::host(), &member, scheme);

    let mut entry: Vec<String> = Vec::new();
    for seg in &segments[consumed..] {
        entry.push(seg.clone());
        if let Some(scheme) = manager.composite().scheme_for(seg) {
            mount = MountPoint::nested(&mount, &entry.join("/"), scheme);
            entry.clear();
        }
    }
    Ok((mount, entry.join("/")))
}

fn list(manager: &FsManager, controller: &Arc<dyn FsController>, entry: &str) -> Result<()> {
    let stat = manager
        .with_retry(|| controller.stat(entry))?
        .with_context(|| format!("no such entry: {entry:?}"))?;
    if stat.kind != EntryType::Directory {
        println!("{entry}");
        return Ok(());
    }
    walk(manager, controller, entry, &mut |path, kind| {
        match kind {
            EntryType::Directory => println!("{path}/"),
            _ => println!("{path}"),
        }
        Ok(())
    })
}

fn pipe(manager: &FsManager, controller: &Arc<dyn FsController>, entry: &str) -> Result<()> {
    let mut reader = manager.with_retry(|| controller.read(entry))?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    std::io::copy(&mut reader, &mut out)?;
    out.flush()?;
    reader.close().map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

fn extract(
    manager: &FsManager,
    controller: &Arc<dyn FsController>,
    entry: &str,
    dest: &std::path::Path,
    quiet: bool,
) -> Result<()> {
    let stat = manager
        .with_retry(|| controller.stat(entry))?
        .with_context(|| format!("no such entry: {entry:?}"))?;
    if stat.kind != EntryType::Directory {
        return extract_file(manager, controller, entry, dest, quiet);
    }
    walk(manager, controller, entry, &mut |path, kind| match kind {
        EntryType::Directory => {
            std::fs::create_dir_all(dest.join(path))?;
            Ok(())
        }
        EntryType::File => extract_file(manager, controller, path, dest, quiet),
        EntryType::Special => Ok(()),
    })
}

fn extract_file(
    manager: &FsManager,
    controller: &Arc<dyn FsController>,
    entry: &str,
    dest: &std::path::Path,
    quiet: bool,
) -> Result<()> {
    let target = if entry.is_empty() {
        bail!("cannot extract the archive root as a file");
    } else {
        dest.join(entry)
    };
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut reader = manager.with_retry(|| controller.read(entry))?;
    let mut contents = Vec::new();
    reader.read_to_end(&mut contents)?;
    reader.close().map_err(|e| anyhow::anyhow!("{e}"))?;
    std::fs::write(&target, contents)?;
    if !quiet {
        println!("  extracting: {}", target.display());
    }
    Ok(())
}

/// Depth-first walk over a directory subtree, files and directories alike.
fn walk(
    manager: &FsManager,
    controller: &Arc<dyn FsController>,
    dir: &str,
    visit: &mut dyn FnMut(&str, EntryType) -> Result<()>,
) -> Result<()> {
    let members = manager.with_retry(|| controller.list(dir))?;
    for name in members {
        let path = if dir.is_empty() {
            name.clone()
        } else {
            format!("{dir}/{name}")
        };
        let Some(stat) = manager.with_retry(|| controller.stat(&path))? else {
            continue;
        };
        visit(&path, stat.kind)?;
        if stat.kind == EntryType::Directory {
            walk(manager, controller, &path, visit)?;
        }
    }
    Ok(())
}
