//! Entry point for the smelt compiler.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap`.
//! 2. Settle the output file kind, the code model, and the names.
//! 3. Map the Brainfuck source file into memory.
//! 4. Compile it into an ELF blueprint.
//! 5. Write the finished image to disk.
//!
//! Error handling is done via `anyhow`.

use anyhow::{Context, Result};
use clap::Parser;
use memmap2::Mmap;
use std::fs::{self, File};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use smelt::blueprint::FileKind;
use smelt::compiler::Compiler;
use smelt::config::Config;
use smelt::regions::AddressMap;
use smelt::writer;

fn main() -> Result<()> {
    let config = Config::parse();

    let filter =
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // 1. Settle what to build and what to call it
    let (kind, model) = config.resolve()?;
    let names = config.names(kind, model)?;

    // 2. Map the source file into memory
    let file = File::open(&config.source)
        .with_context(|| format!("failed to open {}", config.source.display()))?;
    let metadata = file
        .metadata()
        .with_context(|| format!("failed to stat {}", config.source.display()))?;
    let mapped;
    let source: &[u8] = if metadata.len() == 0 {
        // mapping rejects empty files; an empty program is still valid
        &[]
    } else {
        mapped = unsafe { Mmap::map(&file) }
            .with_context(|| format!("failed to map {}", config.source.display()))?;
        &mapped
    };

    // 3. Compile the source into an ELF blueprint
    let compiler = Compiler {
        kind,
        model,
        function: names.function,
        source_name: names.source_name,
        strip: config.strip,
        compressed: config.compressed,
    };
    let blueprint = compiler
        .compile(source)
        .with_context(|| format!("failed to compile {}", config.source.display()))?;

    // 4. Log where everything landed
    if kind != FileKind::Relocatable {
        let mut map = AddressMap::new();
        for id in blueprint.part_ids() {
            let part = blueprint.part(id);
            if part.is_removed() || part.flags() == 0 {
                continue;
            }
            map.record(
                part.addr(),
                part.offset(),
                part.len(),
                part.name().unwrap_or(""),
            );
        }
        map.assign_names();
        for region in map.regions() {
            debug!(
                "region {}: {:#x}..{:#x} (base {:#x})",
                region.name(),
                region.lo(),
                region.hi(),
                region.base()
            );
        }
    }

    // 5. Write the finished image
    if let Err(err) = writer::write_file(&blueprint, &names.output) {
        // don't leave a truncated output file behind
        let _ = fs::remove_file(&names.output);
        return Err(err);
    }

    println!(
        "Compiled {} to {}",
        config.source.display(),
        names.output.display()
    );
    Ok(())
}
