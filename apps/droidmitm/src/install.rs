use anyhow::{Context, Result};
use droidmitm_certs::CertificateInfo;
use droidmitm_core::{su, BridgeError, DeviceClient};
use tracing::{debug, info};

use crate::config::StorePaths;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub file_name: String,
    pub staged_path: String,
    pub installed_path: String,
}

fn listing_contains(output: &str, path: &str, file_name: &str) -> bool {
    output
        .lines()
        .map(str::trim)
        .any(|line| line == path || line == file_name)
}

/// Pushes the certificate into the user store. Rebooting is left to the
/// caller so it can ask first.
pub async fn install_certificate(
    client: &dyn DeviceClient,
    serial: &str,
    cert: &CertificateInfo,
    stores: &StorePaths,
) -> Result<InstallReport> {
    let file_name = cert.file_name();
    let staged_path = format!("{}/{file_name}", stores.staging);
    let installed_path = format!("{}/{file_name}", stores.user);

    let workdir = tempfile::tempdir().context("failed to create temporary directory")?;
    let local_path = workdir.path().join(&file_name);
    std::fs::write(&local_path, cert.install_artifact())
        .with_context(|| format!("failed to write {}", local_path.display()))?;
    debug!(path = %local_path.display(), "wrote certificate artifact");

    client
        .push(serial, &local_path, &staged_path)
        .await
        .with_context(|| format!("failed to push {file_name} to {serial}"))?;
    drop(workdir);

    let copy = format!(
        "mkdir -p {store} && cp {staged_path} {installed_path} && chmod 644 {installed_path}",
        store = stores.user
    );
    let copy_output = client.shell(serial, &su(&copy)).await?;

    let listing = client
        .shell(serial, &su(&format!("ls {installed_path}")))
        .await?;
    if !listing_contains(&listing, &installed_path, &file_name) {
        let detail = format!("{}{}", copy_output.trim(), listing.trim());
        return Err(BridgeError::remote(
            format!("install {file_name}"),
            if detail.is_empty() {
                format!("{installed_path} missing after copy")
            } else {
                detail
            },
        )
        .into());
    }
    info!(serial, path = %installed_path, "installed certificate");

    Ok(InstallReport {
        file_name,
        staged_path,
        installed_path,
    })
}

/// Outcome of comparing one store's copy against the local certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCheck {
    Match(String),
    FileMissing,
    DigestMismatch(String),
    Inaccessible,
}

impl StoreCheck {
    pub fn message(&self, store_label: &str, file_name: &str) -> String {
        match self {
            Self::Match(digest) => format!("MD5 match found in {store_label} store: {digest}"),
            Self::FileMissing => {
                format!("Certificate file {file_name} not found in {store_label} store.")
            }
            Self::DigestMismatch(_) => format!("Certificate not found in {store_label} store."),
            Self::Inaccessible => {
                format!("Could not access {store_label} store or file does not exist.")
            }
        }
    }
}

/// Looks for `file_name` in `store` and compares its md5 with `accepted`.
/// Shell failures are folded into `Inaccessible`.
pub async fn check_store(
    client: &dyn DeviceClient,
    serial: &str,
    store: &str,
    file_name: &str,
    accepted: &[String],
) -> StoreCheck {
    let path = format!("{store}/{file_name}");
    let listing = match client.shell(serial, &su(&format!("ls {path}"))).await {
        Ok(listing) => listing,
        Err(err) => {
            debug!("listing {path} failed: {err:#}");
            return StoreCheck::Inaccessible;
        }
    };
    if !listing_contains(&listing, &path, file_name) {
        return StoreCheck::FileMissing;
    }

    let output = match client.shell(serial, &su(&format!("md5sum {path}"))).await {
        Ok(output) => output,
        Err(err) => {
            debug!("md5sum {path} failed: {err:#}");
            return StoreCheck::Inaccessible;
        }
    };
    let Some(digest) = output.split_whitespace().next() else {
        return StoreCheck::Inaccessible;
    };
    let digest = digest.to_ascii_lowercase();
    if digest.len() != 32 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return StoreCheck::Inaccessible;
    }
    if accepted.iter().any(|candidate| candidate == &digest) {
        StoreCheck::Match(digest)
    } else {
        StoreCheck::DigestMismatch(digest)
    }
}
