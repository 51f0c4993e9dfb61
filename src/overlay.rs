use std::path::Path;

use crate::error::VmError;

async fn qemu_img(binary: &str, args: &[&std::ffi::OsStr], context: String) -> Result<(), VmError> {
    let output = tokio::process::Command::new(binary)
        .args(args)
        .output()
        .await
        .map_err(|e| VmError::DiskOperationFailed {
            context: context.clone(),
            output: format!("could not run {binary}: {e}"),
        })?;

    if !output.status.success() {
        let mut tool_output = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if tool_output.is_empty() {
            tool_output = String::from_utf8_lossy(&output.stdout).trim().to_string();
        }
        return Err(VmError::DiskOperationFailed {
            context,
            output: tool_output,
        });
    }
    Ok(())
}

/// Create a copy-on-write disk backed by `base_image`.
///
/// The backing image is never written to. A `.raw` base is declared raw;
/// anything else is assumed to match the overlay's format.
pub async fn create_overlay(
    qemu_img_bin: &str,
    base_image: &Path,
    overlay_path: &Path,
    format: &str,
) -> Result<(), VmError> {
    if let Some(parent) = overlay_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| VmError::io(format!("creating directory {}", parent.display()), e))?;
    }

    let backing_format = backing_format(base_image, format);
    qemu_img(
        qemu_img_bin,
        &[
            "create".as_ref(),
            "-f".as_ref(),
            format.as_ref(),
            "-b".as_ref(),
            base_image.as_os_str(),
            "-F".as_ref(),
            backing_format.as_ref(),
            overlay_path.as_os_str(),
        ],
        format!("cloning {} onto {}", base_image.display(), overlay_path.display()),
    )
    .await?;

    tracing::info!(path = %overlay_path.display(), base = %base_image.display(), "created overlay disk");
    Ok(())
}

/// Grow a disk to `size` (a qemu-img size string such as `20G`).
pub async fn resize(qemu_img_bin: &str, disk: &Path, size: &str) -> Result<(), VmError> {
    qemu_img(
        qemu_img_bin,
        &["resize".as_ref(), disk.as_os_str(), size.as_ref()],
        format!("resizing {} to {size}", disk.display()),
    )
    .await?;
    tracing::info!(path = %disk.display(), size, "resized disk");
    Ok(())
}

fn backing_format<'a>(base_image: &Path, format: &'a str) -> &'a str {
    match base_image.extension().and_then(|e| e.to_str()) {
        Some("raw") => "raw",
        Some("qcow2") => "qcow2",
        _ => format,
    }
}
