use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use droidmitm_core::BridgeError;
use md5::{Digest, Md5};
use tracing::{debug, info};
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{FromDer, X509Certificate};

pub const DEFAULT_CERT_FILE: &str = "toancert.der";
pub const DEFAULT_CERT_URL_PATH: &str = "/cert";
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 10;

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";
const PEM_LINE_WIDTH: usize = 64;

/// A decoded certificate with everything the installer and checker need.
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub hash_name: String,
    pub der: Vec<u8>,
    pub pem: String,
}

impl CertificateInfo {
    pub fn from_der(der: Vec<u8>) -> Result<Self> {
        let (subject, issuer, hash_name) = {
            let cert = parse_der(&der)?;
            (
                cert.subject().to_string(),
                cert.issuer().to_string(),
                hash_subject(cert.subject().as_raw()),
            )
        };
        let pem = der_to_pem(&der);
        Ok(Self {
            subject,
            issuer,
            hash_name,
            der,
            pem,
        })
    }

    /// Accepts either encoding. PEM input is recognised by its armor line.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if looks_like_pem(bytes) {
            Self::from_der(pem_to_der(bytes)?)
        } else {
            Self::from_der(bytes.to_vec())
        }
    }

    /// `<hash>.0`, the name Android expects inside a CA store.
    pub fn file_name(&self) -> String {
        format!("{}.0", self.hash_name)
    }

    /// Bytes written to the store: PEM, a newline, then the original DER.
    pub fn install_artifact(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pem.len() + 1 + self.der.len());
        out.extend_from_slice(self.pem.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(&self.der);
        out
    }

    /// Digests a stored copy may legitimately have: the full artifact, or
    /// PEM only for files placed by other tooling.
    pub fn accepted_digests(&self) -> [String; 2] {
        [md5_hex(&self.install_artifact()), md5_hex(self.pem.as_bytes())]
    }
}

fn parse_der(der: &[u8]) -> Result<X509Certificate<'_>> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|err| BridgeError::CertificateParse(err.to_string()))?;
    Ok(cert)
}

fn looks_like_pem(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(64)];
    String::from_utf8_lossy(head)
        .trim_start()
        .starts_with("-----BEGIN")
}

fn hash_subject(subject_der: &[u8]) -> String {
    let digest = Md5::digest(subject_der);
    let value = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
    format!("{value:08x}")
}

/// OpenSSL 1.x `subject_hash_old` of a PEM certificate.
pub fn compute_subject_hash(pem_bytes: &[u8]) -> Result<String> {
    let der = pem_to_der(pem_bytes)?;
    let cert = parse_der(&der)?;
    Ok(hash_subject(cert.subject().as_raw()))
}

pub fn der_to_pem(der: &[u8]) -> String {
    let body = STANDARD.encode(der);
    let mut pem = String::with_capacity(body.len() + body.len() / PEM_LINE_WIDTH + 64);
    pem.push_str(PEM_BEGIN);
    pem.push('\n');
    for line in body.as_bytes().chunks(PEM_LINE_WIDTH) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str(PEM_END);
    pem.push('\n');
    pem
}

pub fn pem_to_der(pem_bytes: &[u8]) -> Result<Vec<u8>> {
    let (_, pem) = parse_x509_pem(pem_bytes)
        .map_err(|err| BridgeError::CertificateParse(format!("invalid PEM: {err}")))?;
    if pem.label != "CERTIFICATE" {
        return Err(BridgeError::CertificateParse(format!(
            "expected a CERTIFICATE block, found {}",
            pem.label
        ))
        .into());
    }
    Ok(pem.contents)
}

pub fn md5_hex(bytes: &[u8]) -> String {
    Md5::digest(bytes)
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

pub fn load_certificate_file(path: &Path) -> Result<CertificateInfo> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read certificate {}", path.display()))?;
    let info = CertificateInfo::from_bytes(&bytes)
        .with_context(|| format!("failed to decode certificate {}", path.display()))?;
    debug!(path = %path.display(), hash = %info.hash_name, "loaded certificate");
    Ok(info)
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub url_path: String,
    pub timeout_secs: u64,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            url_path: DEFAULT_CERT_URL_PATH.to_string(),
            timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
        }
    }
}

pub fn certificate_url(host: &str, port: u16, url_path: &str) -> String {
    let path = if url_path.starts_with('/') {
        url_path.to_string()
    } else {
        format!("/{url_path}")
    };
    format!("http://{host}:{port}{path}")
}

/// Fetches the proxy's CA over plain HTTP. The body is taken as DER, with
/// PEM tolerated. There is no retry.
pub async fn download_certificate(
    host: &str,
    port: u16,
    options: &DownloadOptions,
) -> Result<CertificateInfo> {
    let url = certificate_url(host, port, &options.url_path);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(options.timeout_secs.max(1)))
        .build()
        .context("failed to build http client")?;

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|err| BridgeError::Network(format!("GET {url}: {err}")))?;
    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(BridgeError::Network(format!("GET {url} returned status {status}")).into());
    }
    let body = response
        .bytes()
        .await
        .map_err(|err| BridgeError::Network(format!("GET {url}: {err}")))?;
    info!(url = %url, bytes = body.len(), "downloaded certificate");
    CertificateInfo::from_bytes(&body)
}
