use crate::error::{HabitatError, Result};
use crate::node::state::{DriverType, Package};
use crate::package::PackageManager;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub const DOWNLOAD_URL_KEY: &str = "download_url";
pub const BUNDLE_DIRECTORY_KEY: &str = "bundle_directory_name";

/// Installs web apps by extracting a `.tar.gz` bundle under
/// `<bundle_root>/<bundle_directory_name>/<version>`.
pub struct WebPackageManager {
    bundle_root: PathBuf,
    client: reqwest::Client,
}

impl WebPackageManager {
    pub fn new(bundle_root: impl Into<PathBuf>) -> Self {
        Self {
            bundle_root: bundle_root.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn bundle_path(&self, package: &Package, version: &str) -> Result<PathBuf> {
        let directory = package
            .config_str(BUNDLE_DIRECTORY_KEY)
            .filter(|name| !name.is_empty())
            .unwrap_or(package.registry_app_id.as_str());
        for segment in [directory, version] {
            if !is_plain_segment(segment) {
                return Err(HabitatError::InvalidInput(format!(
                    "invalid web bundle path segment {:?}",
                    segment
                )));
            }
        }
        Ok(self.bundle_root.join(directory).join(version))
    }

    async fn download_and_extract(&self, url: &str, destination: &Path) -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let archive_path = temp_dir.path().join("bundle.tar.gz");

        tracing::info!("Downloading web bundle {}", url);
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(HabitatError::Http(format!(
                "download of {} returned {}",
                url,
                response.status()
            )));
        }

        let mut file = tokio::fs::File::create(&archive_path).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.sync_all().await?;
        drop(file);

        let destination = destination.to_path_buf();
        tokio::task::spawn_blocking(move || extract_bundle(&archive_path, &destination))
            .await
            .map_err(|error| HabitatError::Internal(format!("Extraction task failed: {}", error)))?
    }
}

fn is_plain_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains('/')
        && !segment.contains('\\')
}

fn is_safe_entry_path(path: &Path) -> bool {
    path.components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

/// Extracts a gzipped tar into `destination`. Only directories and regular
/// files are materialised; links, devices and entries escaping the
/// destination are skipped.
pub fn extract_bundle(archive_path: &Path, destination: &Path) -> Result<()> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
    std::fs::create_dir_all(destination)?;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if !is_safe_entry_path(&path) {
            tracing::warn!("Skipping bundle entry outside destination: {}", path.display());
            continue;
        }
        let target = destination.join(&path);

        match entry.header().entry_type() {
            tar::EntryType::Directory => std::fs::create_dir_all(&target)?,
            tar::EntryType::Regular => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                entry.unpack(&target)?;
            }
            other => {
                tracing::debug!("Ignoring bundle entry {} of type {:?}", path.display(), other);
            }
        }
    }
    Ok(())
}

#[async_trait]
impl PackageManager for WebPackageManager {
    fn driver_type(&self) -> DriverType {
        DriverType::Web
    }

    async fn is_installed(&self, package: &Package, version: &str) -> Result<bool> {
        Ok(tokio::fs::metadata(self.bundle_path(package, version)?)
            .await
            .map(|metadata| metadata.is_dir())
            .unwrap_or(false))
    }

    async fn install(&self, package: &Package, version: &str) -> Result<()> {
        let url = package.config_str(DOWNLOAD_URL_KEY).ok_or_else(|| {
            HabitatError::InvalidInput(format!(
                "web package {} has no {}",
                package.registry_app_id, DOWNLOAD_URL_KEY
            ))
        })?;
        let destination = self.bundle_path(package, version)?;

        let result = self.download_and_extract(url, &destination).await;
        match &result {
            Ok(()) => tracing::info!("Installed web bundle at {}", destination.display()),
            Err(error) => {
                tracing::warn!(
                    "Web bundle install into {} failed: {}",
                    destination.display(),
                    error
                );
                if let Err(cleanup) = tokio::fs::remove_dir_all(&destination).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!("Failed to remove {}: {}", destination.display(), cleanup);
                    }
                }
            }
        }
        result
    }

    async fn uninstall(&self, package: &Package, version: &str) -> Result<()> {
        let destination = self.bundle_path(package, version)?;
        match tokio::fs::remove_dir_all(&destination).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::get;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use serde_json::{Map, Value, json};

    fn append_file(builder: &mut tar::Builder<GzEncoder<Vec<u8>>>, raw_path: &[u8], body: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.as_old_mut().name[..raw_path.len()].copy_from_slice(raw_path);
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append(&header, body).unwrap();
    }

    fn bundle() -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));

        let mut dir = tar::Header::new_gnu();
        dir.set_path("assets/").unwrap();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_mode(0o755);
        dir.set_size(0);
        dir.set_cksum();
        builder.append(&dir, std::io::empty()).unwrap();

        append_file(&mut builder, b"index.html", b"<h1>hi</h1>");
        append_file(&mut builder, b"assets/app.js", b"console.log(1)");
        append_file(&mut builder, b"../escape.txt", b"nope");

        let mut link = tar::Header::new_gnu();
        link.set_path("link").unwrap();
        link.set_entry_type(tar::EntryType::Symlink);
        link.set_link_name("index.html").unwrap();
        link.set_size(0);
        link.set_cksum();
        builder.append(&link, std::io::empty()).unwrap();

        builder.into_inner().unwrap().finish().unwrap()
    }

    fn package(download_url: &str) -> Package {
        let mut driver_config = Map::new();
        driver_config.insert(DOWNLOAD_URL_KEY.to_string(), Value::String(download_url.to_string()));
        driver_config.insert(BUNDLE_DIRECTORY_KEY.to_string(), json!("site"));
        Package {
            driver: DriverType::Web,
            driver_config,
            registry_url_base: String::new(),
            registry_app_id: "site".to_string(),
            registry_tag: String::new(),
        }
    }

    async fn serve_bundle() -> String {
        let body = bundle();
        let app = Router::new().route("/bundle.tar.gz", get(move || async move { body }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_extract_keeps_only_dirs_and_regular_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let archive = temp_dir.path().join("bundle.tar.gz");
        std::fs::write(&archive, bundle()).unwrap();
        let destination = temp_dir.path().join("out");

        extract_bundle(&archive, &destination).unwrap();
        assert_eq!(std::fs::read_to_string(destination.join("index.html")).unwrap(), "<h1>hi</h1>");
        assert!(destination.join("assets/app.js").is_file());
        assert!(!destination.join("link").exists());
        assert!(!temp_dir.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn test_install_is_installed_uninstall() {
        let temp_dir = tempfile::tempdir().unwrap();
        let base = serve_bundle().await;
        let manager = WebPackageManager::new(temp_dir.path());
        let package = package(&format!("{}/bundle.tar.gz", base));

        assert!(!manager.is_installed(&package, "1.0.0").await.unwrap());
        manager.install(&package, "1.0.0").await.unwrap();
        assert!(manager.is_installed(&package, "1.0.0").await.unwrap());
        assert!(temp_dir.path().join("site/1.0.0/index.html").is_file());

        manager.uninstall(&package, "1.0.0").await.unwrap();
        assert!(!manager.is_installed(&package, "1.0.0").await.unwrap());
        manager.uninstall(&package, "1.0.0").await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_download_leaves_nothing_behind() {
        let temp_dir = tempfile::tempdir().unwrap();
        let base = serve_bundle().await;
        let manager = WebPackageManager::new(temp_dir.path());
        let package = package(&format!("{}/missing.tar.gz", base));

        let error = manager.install(&package, "1.0.0").await.unwrap_err();
        assert!(matches!(error, HabitatError::Http(_)));
        assert!(!temp_dir.path().join("site/1.0.0").exists());
    }

    #[test]
    fn test_bundle_path_rejects_traversal() {
        let manager = WebPackageManager::new("/tmp/web");
        let package = package("http://localhost/bundle.tar.gz");
        assert!(manager.bundle_path(&package, "..").is_err());
        assert_eq!(
            manager.bundle_path(&package, "2").unwrap(),
            PathBuf::from("/tmp/web/site/2")
        );
    }
}
