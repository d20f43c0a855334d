use crate::config::Config;
use crate::credentials::RegistryCredentials;
use crate::digest::Digest;
use crate::image_reference::ImageReference;
use anyhow::{Context, Result, bail};
use oci_distribution::client::{Certificate, CertificateEncoding, ClientConfig, ClientProtocol};
use oci_distribution::manifest::ImageIndexEntry;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use reqwest::StatusCode;
use std::fs;
use tracing::{debug, info, warn};

/// Source of the current content digest behind an image tag.
pub trait DigestSource {
    async fn fetch_digest(
        &self,
        image: &ImageReference,
        credentials: &RegistryCredentials,
    ) -> Result<Digest>;
}

/// Registry client: a plain `/v2/` liveness check followed by an authenticated
/// manifest pull through `oci-distribution`.
#[derive(Clone)]
pub struct OciRegistry {
    client: Client,
    http: reqwest::Client,
    scheme: &'static str,
}

pub fn create_registry(config: &Config) -> Result<OciRegistry> {
    info!("Initializing OCI Registry client");
    let ca_certificates = read_ca_certificates(config)?;

    if config.insecure_registry {
        warn!("TLS certificate verification is disabled for all registries");
    }

    // System certificates are loaded automatically with rustls-tls-native-roots
    let mut http_builder =
        reqwest::Client::builder().danger_accept_invalid_certs(config.insecure_registry);
    for pem in &ca_certificates {
        let cert = reqwest::Certificate::from_pem(pem).context("Failed to parse CA certificate")?;
        http_builder = http_builder.add_root_certificate(cert);
    }
    let http = http_builder.build().context("Failed to build HTTP client")?;

    let client = Client::try_from(client_config(config, &ca_certificates))
        .context("Failed to build OCI registry client")?;

    Ok(OciRegistry {
        client,
        http,
        scheme: "https",
    })
}

fn read_ca_certificates(config: &Config) -> Result<Vec<Vec<u8>>> {
    config
        .ca_certificate_paths
        .iter()
        .map(|file_path| {
            fs::read(file_path)
                .with_context(|| format!("Failed to read CA certificate {}", file_path.display()))
        })
        .collect()
}

fn client_config(config: &Config, ca_certificates: &[Vec<u8>]) -> ClientConfig {
    ClientConfig {
        protocol: ClientProtocol::Https,
        accept_invalid_certificates: config.insecure_registry,
        extra_root_certificates: ca_certificates
            .iter()
            .map(|pem| Certificate {
                encoding: CertificateEncoding::Pem,
                data: pem.clone(),
            })
            .collect(),
        platform_resolver: Some(Box::new(linux_platform_resolver)),
        ..Default::default()
    }
}

/// Workloads run on Linux nodes, so a multi-arch index resolves to the linux
/// image of the host architecture.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };

    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .is_some_and(|p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}

fn registry_auth(credentials: &RegistryCredentials) -> RegistryAuth {
    if credentials.is_anonymous() {
        RegistryAuth::Anonymous
    } else {
        RegistryAuth::Basic(
            credentials.username.clone(),
            credentials.password.expose_secret().to_string(),
        )
    }
}

impl OciRegistry {
    #[cfg(test)]
    fn plain_http(config: &Config) -> Self {
        let mut client_config = client_config(config, &[]);
        client_config.protocol = ClientProtocol::Http;
        Self {
            client: Client::new(client_config),
            http: reqwest::Client::new(),
            scheme: "http",
        }
    }

    /// A v2 registry answers `/v2/` with 200, or with 401 when it wants
    /// credentials. Anything else means the registry is not usable.
    async fn ping(&self, image: &ImageReference) -> Result<()> {
        let url = format!("{}://{}/v2/", self.scheme, image.registry);
        debug!("Pinging registry {}", url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Registry {} is unreachable", image.registry))?;

        let status = response.status();
        if status.is_success() || status == StatusCode::UNAUTHORIZED {
            return Ok(());
        }
        bail!(
            "Registry {} failed the liveness check with status {}",
            image.registry,
            status
        )
    }
}

impl DigestSource for OciRegistry {
    async fn fetch_digest(
        &self,
        image: &ImageReference,
        credentials: &RegistryCredentials,
    ) -> Result<Digest> {
        self.ping(image).await?;

        let reference = Reference::with_tag(
            image.registry.clone(),
            image.repository.clone(),
            image.tag.clone(),
        );
        info!("Fetching image manifest of {}", image);
        let (manifest, manifest_digest) = self
            .client
            .pull_image_manifest(&reference, &registry_auth(credentials))
            .await
            .with_context(|| {
                format!(
                    "Registry {} failed to serve the manifest of {}",
                    image.registry, image
                )
            })?;
        debug!("Manifest digest of {} is {}", image, manifest_digest);

        manifest
            .config
            .digest
            .parse::<Digest>()
            .with_context(|| format!("Manifest of {} has an invalid config digest", image))
    }
}
