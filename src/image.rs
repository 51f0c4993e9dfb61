//! Base image store: `<data_dir>/images/` plus an `index.json` that maps
//! image names to local files. Names are unique; registering a name again
//! replaces the previous entry.

use std::path::{Path, PathBuf};

use facet::Facet;
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncWriteExt;

use crate::error::VmError;
use crate::paths::images_dir;
use crate::util::write_atomic;

/// Well-known images and their upstream cloud-image URLs.
pub const CATALOG: &[(&str, &str)] = &[
    (
        "ubuntu-22.04",
        "https://cloud-images.ubuntu.com/jammy/current/jammy-server-cloudimg-amd64.img",
    ),
    (
        "ubuntu-24.04",
        "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.img",
    ),
    (
        "debian-12",
        "https://cloud.debian.org/images/cloud/bookworm/latest/debian-12-generic-amd64.qcow2",
    ),
    (
        "fedora-41",
        "https://download.fedoraproject.org/pub/fedora/linux/releases/41/Cloud/x86_64/images/Fedora-Cloud-Base-Generic-41-1.4.x86_64.qcow2",
    ),
];

pub fn catalog_url(name: &str) -> Option<&'static str> {
    CATALOG.iter().find(|(n, _)| *n == name).map(|(_, url)| *url)
}

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct Image {
    pub name: String,
    /// Empty for images registered from a local file.
    #[facet(default)]
    pub source_url: String,
    pub local_path: String,
}

impl Image {
    pub fn path(&self) -> PathBuf {
        PathBuf::from(&self.local_path)
    }
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct ImageIndex {
    #[facet(default)]
    images: Vec<Image>,
}

#[derive(Debug, Clone)]
pub struct ImageStore {
    dir: PathBuf,
}

impl ImageStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: images_dir(data_dir),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join("index.json")
    }

    async fn load(&self) -> Result<ImageIndex, VmError> {
        let path = self.index_path();
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => facet_json::from_str(&contents).map_err(|e| VmError::StateFile {
                path: path.display().to_string(),
                message: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ImageIndex::default()),
            Err(e) => Err(VmError::io(format!("reading {}", path.display()), e)),
        }
    }

    async fn save(&self, index: &ImageIndex) -> Result<(), VmError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| VmError::io(format!("creating {}", self.dir.display()), e))?;
        let path = self.index_path();
        let json = facet_json::to_string(index).map_err(|e| VmError::StateFile {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        write_atomic(&path, json.as_bytes()).await
    }

    async fn record(&self, image: Image) -> Result<Image, VmError> {
        let mut index = self.load().await?;
        index.images.retain(|i| i.name != image.name);
        index.images.push(image.clone());
        index.images.sort_by(|a, b| a.name.cmp(&b.name));
        self.save(&index).await?;
        Ok(image)
    }

    pub async fn list(&self) -> Result<Vec<Image>, VmError> {
        Ok(self.load().await?.images)
    }

    /// The image registered under `name`, if its file is still present.
    pub async fn get(&self, name: &str) -> Result<Option<Image>, VmError> {
        let index = self.load().await?;
        Ok(index
            .images
            .into_iter()
            .find(|i| i.name == name && i.path().is_file()))
    }

    /// Resolve a base image reference to a local file without downloading.
    /// A reference is either a registered name or a path to an existing file.
    pub async fn require(&self, reference: &str) -> Result<PathBuf, VmError> {
        if let Some(image) = self.get(reference).await? {
            return Ok(image.path());
        }
        let as_path = Path::new(reference);
        if as_path.is_absolute() && as_path.is_file() {
            return Ok(as_path.to_path_buf());
        }
        Err(VmError::ImageNotFound {
            name: reference.to_string(),
        })
    }

    /// Register an existing local file under `name`.
    pub async fn add(&self, name: &str, file: &Path) -> Result<Image, VmError> {
        let path = tokio::fs::canonicalize(file)
            .await
            .map_err(|e| VmError::io(format!("resolving {}", file.display()), e))?;
        if !path.is_file() {
            return Err(VmError::Validation {
                message: format!("{} is not a file", path.display()),
            });
        }
        let image = self
            .record(Image {
                name: name.to_string(),
                source_url: String::new(),
                local_path: path.display().to_string(),
            })
            .await?;
        tracing::info!(name, path = %path.display(), "registered image");
        Ok(image)
    }

    /// Download `name` from `url` (or its catalog URL). An image that is
    /// already present is returned as is.
    pub async fn pull(&self, name: &str, url: Option<&str>) -> Result<Image, VmError> {
        if let Some(existing) = self.get(name).await? {
            tracing::info!(name, path = %existing.local_path, "image already present");
            return Ok(existing);
        }
        let url = match url.or_else(|| catalog_url(name)) {
            Some(url) => url,
            None => {
                return Err(VmError::Validation {
                    message: format!(
                        "no URL known for image '{name}'; pass --url (known: {})",
                        CATALOG.iter().map(|(n, _)| *n).collect::<Vec<_>>().join(", ")
                    ),
                });
            }
        };

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| VmError::io(format!("creating {}", self.dir.display()), e))?;
        let dest = self.dir.join(format!("{name}.{}", url_extension(url)));
        download(url, &dest).await?;

        self.record(Image {
            name: name.to_string(),
            source_url: url.to_string(),
            local_path: dest.display().to_string(),
        })
        .await
    }

    /// Unregister `name`. Files downloaded into the store are deleted;
    /// files registered with `add` are left alone.
    pub async fn remove(&self, name: &str) -> Result<Image, VmError> {
        let mut index = self.load().await?;
        let Some(pos) = index.images.iter().position(|i| i.name == name) else {
            return Err(VmError::ImageNotFound {
                name: name.to_string(),
            });
        };
        let image = index.images.remove(pos);
        self.save(&index).await?;

        let path = image.path();
        if path.starts_with(&self.dir) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(VmError::io(format!("deleting {}", path.display()), e)),
            }
        }
        tracing::info!(name, "removed image");
        Ok(image)
    }
}

fn url_extension(url: &str) -> &str {
    let file = url.rsplit('/').next().unwrap_or("");
    match file.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()) => ext,
        _ => "img",
    }
}

async fn download(url: &str, dest: &Path) -> Result<(), VmError> {
    tracing::info!(url, "downloading base image");

    let response = reqwest::get(url)
        .await
        .map_err(|e| VmError::ImageDownload {
            message: format!("request to {url} failed"),
            source: Box::new(e),
        })?;

    if !response.status().is_success() {
        return Err(VmError::ImageDownload {
            message: format!("HTTP {} from {url}", response.status()),
            source: format!("HTTP {}", response.status()).into(),
        });
    }

    let pb = ProgressBar::new(response.content_length().unwrap_or(0));
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    let tmp_path = dest.with_extension("part");
    // A stale .part file is from an earlier failed download.
    let _ = tokio::fs::remove_file(&tmp_path).await;

    if let Err(e) = download_to_file(&tmp_path, response, &pb).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        pb.abandon();
        return Err(e);
    }

    tokio::fs::rename(&tmp_path, dest).await.map_err(|e| {
        VmError::io(
            format!("renaming {} to {}", tmp_path.display(), dest.display()),
            e,
        )
    })?;

    pb.finish_and_clear();
    tracing::info!(path = %dest.display(), "base image downloaded");
    Ok(())
}

async fn download_to_file(
    path: &Path,
    response: reqwest::Response,
    pb: &ProgressBar,
) -> Result<(), VmError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| VmError::io(format!("creating temp file {}", path.display()), e))?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| VmError::ImageDownload {
            message: "error reading response body".into(),
            source: Box::new(e),
        })?;
        file.write_all(&chunk)
            .await
            .map_err(|e| VmError::io("writing image data", e))?;
        pb.inc(chunk.len() as u64);
    }

    file.flush()
        .await
        .map_err(|e| VmError::io("flushing image file", e))?;
    Ok(())
}

pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
