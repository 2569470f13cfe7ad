//! ELF image assembly and output.
//!
//! Serializes a finished blueprint into its byte image and writes it
//! to disk with the permission bits the file kind calls for.

use anyhow::{Context, Result};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::debug;

use crate::blueprint::{Blueprint, FileKind};

/// Assembles the file image: each part's contents at its offset,
/// zero padding in between.
pub fn build_image(blueprint: &Blueprint) -> Vec<u8> {
    let mut image = Vec::new();
    for part in blueprint.parts() {
        if part.is_removed() {
            continue;
        }
        image.resize(part.offset() as usize, 0);
        image.extend_from_slice(part.contents().bytes());
    }
    debug!("assembled {} bytes", image.len());
    image
}

/// Writes the blueprint's image to `path`. Executables get their
/// execute permission bits set; everything else gets them cleared.
pub fn write_file(blueprint: &Blueprint, path: &Path) -> Result<()> {
    let image = build_image(blueprint);
    std::fs::write(path, &image)
        .with_context(|| format!("failed to write {}", path.display()))?;

    let mut permissions = std::fs::metadata(path)?.permissions();
    let mode = if blueprint.file_kind() == FileKind::Executable {
        permissions.mode() | 0o111
    } else {
        permissions.mode() & !0o111
    };
    permissions.set_mode(mode);
    std::fs::set_permissions(path, permissions)
        .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    Ok(())
}
