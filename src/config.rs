//! Configuration module.
//!
//! This module defines the command-line interface (CLI) for the
//! compiler using `clap`, and settles the output file kind, the code
//! model, and the derived file and symbol names.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;

use crate::blueprint::FileKind;
use crate::codegen::CodeModel;
use crate::utils::sanitize_identifier;

/// A Brainfuck compiler for x86_64 ELF targets.
///
/// Compiles Brainfuck source code into a standalone executable, a
/// shared library, or an object file, without involving an external
/// assembler or linker.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Brainfuck source file
    pub source: PathBuf,

    /// Generate a standalone executable file (the default)
    #[arg(short = 'x', conflicts_with = "library")]
    pub executable: bool,

    /// Generate a shared library
    #[arg(short = 'l')]
    pub library: bool,

    /// Generate an object file
    #[arg(short = 'c')]
    pub object: bool,

    /// Modify the function to take a buffer argument
    #[arg(short = 'a', long = "arg")]
    pub buffer_arg: bool,

    /// Read the input file as compressed source
    #[arg(short = 'z', long)]
    pub compressed: bool,

    /// Write the output to FILE
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Use NAME as the exported function
    #[arg(short, long, value_name = "NAME")]
    pub function: Option<String>,

    /// Record the source filename as NAME
    #[arg(short, long = "input", value_name = "NAME")]
    pub input_name: Option<String>,

    /// Omit non-required data from the output file
    #[arg(short, long)]
    pub strip: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", help = "Set the logging level")]
    pub log_level: String,
}

/// The names one compilation works with, either taken from the
/// command line or derived from the source filename.
pub struct Names {
    /// Filename recorded in the output.
    pub source_name: String,
    /// Where the output file goes.
    pub output: PathBuf,
    /// Name the compiled code is exported under.
    pub function: String,
}

impl Config {
    /// Settles the output file kind and the code model. An explicit
    /// `-x` or `-l` picks the model; `-c` redirects it into an object
    /// file instead of a finished image.
    pub fn resolve(&self) -> Result<(FileKind, CodeModel)> {
        let explicit = if self.executable {
            Some(CodeModel::Standalone)
        } else if self.library {
            Some(CodeModel::SharedFunction)
        } else {
            None
        };
        let (kind, mut model) = if self.object {
            let model = explicit.unwrap_or(CodeModel::Function);
            (FileKind::Relocatable, model)
        } else {
            let model = explicit.unwrap_or(CodeModel::Standalone);
            let kind = if model == CodeModel::Standalone {
                FileKind::Executable
            } else {
                FileKind::SharedObject
            };
            (kind, model)
        };
        if self.buffer_arg {
            if model == CodeModel::Standalone {
                bail!("executable file format cannot take an argument");
            }
            model = CodeModel::BufferFunction;
        }
        Ok((kind, model))
    }

    /// Derives the source, output, and function names. Names given on
    /// the command line win; the rest come from the source filename
    /// with its `.b` or `.bf` extension stripped.
    pub fn names(&self, kind: FileKind, model: CodeModel) -> Result<Names> {
        let Some(base) = self.source.file_name().and_then(|name| name.to_str()) else {
            bail!("{}: not a usable source filename", self.source.display());
        };

        let stem = if base.len() > 2 && base.ends_with(".b") {
            &base[..base.len() - 2]
        } else if base.len() > 3 && base.ends_with(".bf") {
            &base[..base.len() - 3]
        } else {
            base
        };

        let source_name = self
            .input_name
            .clone()
            .unwrap_or_else(|| base.to_string());

        let output = match &self.output {
            Some(path) => path.clone(),
            None => match kind {
                FileKind::Relocatable => PathBuf::from(format!("{stem}.o")),
                FileKind::SharedObject => PathBuf::from(format!("lib{stem}.so")),
                // an executable takes the stripped name, unless there
                // was nothing to strip
                FileKind::Executable if stem.len() != base.len() => PathBuf::from(stem),
                FileKind::Executable => PathBuf::from("a.out"),
            },
        };

        let function = match &self.function {
            Some(name) => name.clone(),
            None if model == CodeModel::Standalone => "_start".to_string(),
            None => sanitize_identifier(stem),
        };

        Ok(Names {
            source_name,
            output,
            function,
        })
    }
}
