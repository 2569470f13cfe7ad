//! Brainfuck ELF Compiler Library.
//!
//! This library provides the core components for the `smelt` compiler.
//! It is organized into several modules:
//! - `config`: CLI configuration.
//! - `blueprint`: Staged construction of an ELF file image.
//! - `part`: The pieces a blueprint is assembled from.
//! - `parts`: Per-kind behavior of those pieces across the stages.
//! - `codegen`: x86_64 machine code generation.
//! - `compiler`: Translation of Brainfuck source into a blueprint.
//! - `regions`: Grouping of memory addresses for diagnostics.
//! - `writer`: Flattening a finished blueprint into an output file.

pub mod blueprint;
pub mod buffer;
pub mod codegen;
pub mod compiler;
pub mod config;
pub mod part;
pub mod parts;
pub mod regions;
pub mod utils;
pub mod writer;
