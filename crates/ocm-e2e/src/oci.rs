//! OCM component versions and their push into an OCI registry
//!
//! A component version is stored the way OCM maps it onto OCI:
//!
//! - repository `<prefix>/component-descriptors/<component name>`, tag `<version>`
//! - a config blob pointing at the descriptor layer
//! - the descriptor itself as a YAML layer
//! - one extra layer per local blob resource, referenced by `localBlob` access

use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::signing::{sha256_hex, RsaSigner, HASH_ALGORITHM, SIGNATURE_MEDIA_TYPE, SIGNING_ALGORITHM};
use crate::{Error, Result};

/// Media type of the component config blob
pub const COMPONENT_CONFIG_MEDIA_TYPE: &str = "application/vnd.ocm.software.component.config.v1+json";

/// Media type of the component descriptor layer
pub const COMPONENT_DESCRIPTOR_MEDIA_TYPE: &str =
    "application/vnd.ocm.software.component-descriptor.v2+yaml";

/// OCI image manifest media type
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Media type of local blob resources built from strings
pub const TEXT_MEDIA_TYPE: &str = "text/plain";

/// Repository segment all component descriptors live under
pub const COMPONENT_DESCRIPTOR_PREFIX: &str = "component-descriptors";

/// Normalisation recorded for descriptor digests
pub const DESCRIPTOR_NORMALISATION: &str = "jsonNormalisation/v2";

/// Normalisation recorded for blob digests
pub const BLOB_NORMALISATION: &str = "genericBlobDigest/v1";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// Descriptor model
// =============================================================================

/// `meta` block of a descriptor
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    /// Always `v2`
    pub schema_version: String,
}

/// Component provider
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Provider {
    /// Provider name
    pub name: String,
}

/// Registry the descriptor was pushed to
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryContext {
    /// Always `OCIRegistry`
    #[serde(rename = "type")]
    pub type_: String,
    /// `host[:port][/prefix]`
    pub base_url: String,
    /// Always `urlPath`
    pub component_name_mapping: String,
}

/// Digest of a resource or of a normalised descriptor
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DigestSpec {
    /// `SHA-256`
    pub hash_algorithm: String,
    /// How the input was normalised before hashing
    pub normalisation_algorithm: String,
    /// Lowercase hex digest
    pub value: String,
}

/// How a resource's content is accessed
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum Access {
    /// Blob stored as a layer of the component's own artifact
    #[serde(rename = "localBlob", rename_all = "camelCase")]
    LocalBlob {
        /// `sha256:<hex>` of the layer
        local_reference: String,
        /// Media type of the blob
        media_type: String,
    },
    /// External OCI artifact
    #[serde(rename = "ociArtifact", rename_all = "camelCase")]
    OciArtifact {
        /// Full image reference
        image_reference: String,
    },
}

/// A resource entry of the descriptor
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceEntry {
    /// Resource name
    pub name: String,
    /// Resource version
    pub version: String,
    /// Resource type, e.g. `blob` or `ociImage`
    #[serde(rename = "type")]
    pub type_: String,
    /// `local` or `external`
    pub relation: String,
    /// Content access
    pub access: Access,
    /// Content digest, set for local blobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<DigestSpec>,
}

/// Reference to another component version
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentReference {
    /// Reference name
    pub name: String,
    /// Referenced component
    pub component_name: String,
    /// Referenced version
    pub version: String,
}

/// `component` block of a descriptor
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    /// Component name, e.g. `github.com/acme/podinfo`
    pub name: String,
    /// Semver version
    pub version: String,
    /// Provider
    pub provider: Provider,
    /// Where the descriptor lives
    #[serde(default)]
    pub repository_contexts: Vec<RepositoryContext>,
    /// Resources
    #[serde(default)]
    pub resources: Vec<ResourceEntry>,
    /// Sources (unused by the scenarios)
    #[serde(default)]
    pub sources: Vec<serde_json::Value>,
    /// References to other components
    #[serde(default)]
    pub component_references: Vec<ComponentReference>,
}

/// Signature value
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignatureSpec {
    /// `RSASSA-PKCS1-V1_5`
    pub algorithm: String,
    /// Lowercase hex signature
    pub value: String,
    /// Encoding of `value`
    pub media_type: String,
}

/// Named signature over the normalised descriptor
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Signature {
    /// Signature name, matched by the verifying controller
    pub name: String,
    /// Digest that was signed
    pub digest: DigestSpec,
    /// The signature
    pub signature: SignatureSpec,
}

/// OCM v2 component descriptor
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ComponentDescriptor {
    /// Schema marker
    pub meta: Meta,
    /// The component
    pub component: ComponentSpec,
    /// Signatures
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<Signature>,
}

impl ComponentDescriptor {
    /// Canonical JSON the signature digest is computed over.
    ///
    /// Access specs, repository contexts and existing signatures are left
    /// out so the digest survives transport between registries.
    pub fn normalise(&self) -> Result<Vec<u8>> {
        let resources: Vec<_> = self
            .component
            .resources
            .iter()
            .map(|r| {
                let mut entry = json!({
                    "name": r.name,
                    "version": r.version,
                    "type": r.type_,
                    "relation": r.relation,
                });
                if let Some(digest) = &r.digest {
                    entry["digest"] = serde_json::to_value(digest).unwrap_or_default();
                }
                entry
            })
            .collect();
        let references: Vec<_> = self
            .component
            .component_references
            .iter()
            .map(|r| {
                json!({
                    "name": r.name,
                    "componentName": r.component_name,
                    "version": r.version,
                })
            })
            .collect();
        let normalised = json!({
            "component": {
                "name": self.component.name,
                "version": self.component.version,
                "provider": {"name": self.component.provider.name},
                "resources": resources,
                "componentReferences": references,
            }
        });
        Ok(serde_json::to_vec(&normalised)?)
    }

    /// Sign the normalised descriptor and record the signature
    pub fn sign(&mut self, signer: &RsaSigner) -> Result<()> {
        let normalised = self.normalise()?;
        let sig = signer.sign(&normalised)?;
        self.signatures.retain(|s| s.name != signer.name());
        self.signatures.push(Signature {
            name: signer.name().to_string(),
            digest: DigestSpec {
                hash_algorithm: HASH_ALGORITHM.to_string(),
                normalisation_algorithm: DESCRIPTOR_NORMALISATION.to_string(),
                value: sha256_hex(&normalised),
            },
            signature: SignatureSpec {
                algorithm: SIGNING_ALGORITHM.to_string(),
                value: crate::signing::hex(&sig),
                media_type: SIGNATURE_MEDIA_TYPE.to_string(),
            },
        });
        Ok(())
    }
}

// =============================================================================
// Component versions to push
// =============================================================================

/// A resource to add to a component version
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Resource {
    /// Resource name
    pub name: String,
    /// Resource version, defaults to the component version
    pub version: String,
    /// Blob content (local blobs only)
    pub data: String,
    /// Resource type, defaults to `blob`
    pub type_: String,
}

impl Resource {
    /// Text blob resource
    pub fn blob(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            type_: "blob".to_string(),
            ..Default::default()
        }
    }

    /// Override the resource version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Override the resource type
    pub fn with_type(mut self, type_: impl Into<String>) -> Self {
        self.type_ = type_.into();
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
enum PendingResource {
    Blob(Resource),
    ImageRef { reference: String, resource: Resource },
}

/// A component version assembled in memory before the push
#[derive(Debug)]
pub struct ComponentVersion {
    name: String,
    version: String,
    provider: String,
    resources: Vec<PendingResource>,
    references: Vec<ComponentReference>,
    signer: Option<RsaSigner>,
}

impl ComponentVersion {
    /// Empty component version
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            provider: "ocm.software".to_string(),
            resources: Vec::new(),
            references: Vec::new(),
            signer: None,
        }
    }

    /// Component name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Component version
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Set the provider
    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    /// Add a local blob resource
    pub fn blob_resource(mut self, resource: Resource) -> Self {
        self.resources.push(PendingResource::Blob(resource));
        self
    }

    /// Add an external image reference resource
    pub fn image_resource(mut self, reference: impl Into<String>, resource: Resource) -> Self {
        self.resources.push(PendingResource::ImageRef {
            reference: reference.into(),
            resource,
        });
        self
    }

    /// Add a reference to another component version
    pub fn reference(
        mut self,
        name: impl Into<String>,
        component_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        self.references.push(ComponentReference {
            name: name.into(),
            component_name: component_name.into(),
            version: version.into(),
        });
        self
    }

    /// Sign the descriptor before pushing
    pub fn signed_by(mut self, signer: RsaSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    /// OCI repository the version is stored in
    pub fn oci_repository(&self, prefix: &str) -> String {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("{}/{}", COMPONENT_DESCRIPTOR_PREFIX, self.name)
        } else {
            format!("{}/{}/{}", prefix, COMPONENT_DESCRIPTOR_PREFIX, self.name)
        }
    }

    /// Build the descriptor and the local blobs it references
    pub fn build(&self, base_url: &str) -> Result<(ComponentDescriptor, Vec<Blob>)> {
        let mut blobs = Vec::new();
        let mut resources = Vec::with_capacity(self.resources.len());
        for pending in &self.resources {
            let entry = match pending {
                PendingResource::Blob(r) => {
                    let blob = Blob::new(TEXT_MEDIA_TYPE, r.data.as_bytes().to_vec());
                    let entry = ResourceEntry {
                        name: r.name.clone(),
                        version: self.resource_version(r),
                        type_: default_type(r, "blob"),
                        relation: "local".to_string(),
                        access: Access::LocalBlob {
                            local_reference: blob.digest.clone(),
                            media_type: blob.media_type.clone(),
                        },
                        digest: Some(DigestSpec {
                            hash_algorithm: HASH_ALGORITHM.to_string(),
                            normalisation_algorithm: BLOB_NORMALISATION.to_string(),
                            value: blob.hex_digest().to_string(),
                        }),
                    };
                    blobs.push(blob);
                    entry
                }
                PendingResource::ImageRef { reference, resource } => ResourceEntry {
                    name: resource.name.clone(),
                    version: self.resource_version(resource),
                    type_: default_type(resource, "ociImage"),
                    relation: "external".to_string(),
                    access: Access::OciArtifact {
                        image_reference: reference.clone(),
                    },
                    digest: None,
                },
            };
            resources.push(entry);
        }

        let mut descriptor = ComponentDescriptor {
            meta: Meta {
                schema_version: "v2".to_string(),
            },
            component: ComponentSpec {
                name: self.name.clone(),
                version: self.version.clone(),
                provider: Provider {
                    name: self.provider.clone(),
                },
                repository_contexts: vec![RepositoryContext {
                    type_: "OCIRegistry".to_string(),
                    base_url: base_url.to_string(),
                    component_name_mapping: "urlPath".to_string(),
                }],
                resources,
                sources: Vec::new(),
                component_references: self.references.clone(),
            },
            signatures: Vec::new(),
        };

        if let Some(signer) = &self.signer {
            descriptor.sign(signer)?;
        }
        Ok((descriptor, blobs))
    }

    fn resource_version(&self, r: &Resource) -> String {
        if r.version.is_empty() {
            self.version.clone()
        } else {
            r.version.clone()
        }
    }
}

fn default_type(r: &Resource, fallback: &str) -> String {
    if r.type_.is_empty() {
        fallback.to_string()
    } else {
        r.type_.clone()
    }
}

/// Content-addressed blob
#[derive(Clone, Debug, PartialEq)]
pub struct Blob {
    /// Media type
    pub media_type: String,
    /// `sha256:<hex>`
    pub digest: String,
    /// Content
    pub data: Vec<u8>,
}

impl Blob {
    /// Wrap content and compute its digest
    pub fn new(media_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            media_type: media_type.into(),
            digest: format!("sha256:{}", sha256_hex(&data)),
            data,
        }
    }

    /// Digest without the algorithm prefix
    pub fn hex_digest(&self) -> &str {
        self.digest.trim_start_matches("sha256:")
    }

    fn descriptor(&self) -> serde_json::Value {
        json!({
            "mediaType": self.media_type,
            "digest": self.digest,
            "size": self.data.len(),
        })
    }
}

// =============================================================================
// Registry client
// =============================================================================

/// Minimal OCI distribution client for pushing component versions
#[derive(Clone, Debug)]
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
}

impl RegistryClient {
    /// Client for `<scheme>://host:port`
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| Error::http_transport("registry_client", e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Registry host without scheme, as recorded in repository contexts
    pub fn host(&self) -> &str {
        self.base_url
            .split_once("://")
            .map(|(_, host)| host)
            .unwrap_or(&self.base_url)
    }

    /// Push a component version below `prefix`; returns the descriptor pushed
    pub async fn push(&self, prefix: &str, component: &ComponentVersion) -> Result<ComponentDescriptor> {
        let repository = component.oci_repository(prefix);
        let context_url = match prefix.trim_matches('/') {
            "" => self.host().to_string(),
            p => format!("{}/{}", self.host(), p),
        };
        let (descriptor, blobs) = component.build(&context_url)?;

        info!(
            component = component.name(),
            version = component.version(),
            %repository,
            signed = !descriptor.signatures.is_empty(),
            "Pushing component version"
        );

        let yaml = serde_yaml::to_string(&descriptor)
            .map_err(|e| Error::serialization(format!("component descriptor: {}", e)))?;
        let descriptor_layer = Blob::new(COMPONENT_DESCRIPTOR_MEDIA_TYPE, yaml.into_bytes());
        let config = Blob::new(
            COMPONENT_CONFIG_MEDIA_TYPE,
            serde_json::to_vec(&json!({
                "componentDescriptorLayer": descriptor_layer.descriptor(),
            }))?,
        );

        let mut layers = vec![descriptor_layer];
        layers.extend(blobs);
        for blob in layers.iter().chain(std::iter::once(&config)) {
            self.upload_blob(&repository, blob).await?;
        }

        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST_MEDIA_TYPE,
            "config": config.descriptor(),
            "layers": layers.iter().map(Blob::descriptor).collect::<Vec<_>>(),
        });
        self.put_manifest(&repository, component.version(), &manifest)
            .await?;

        info!(component = component.name(), version = component.version(), "Pushed component version");
        Ok(descriptor)
    }

    async fn blob_exists(&self, repository: &str, digest: &str) -> Result<bool> {
        let url = format!("{}/v2/{}/blobs/{}", self.base_url, repository, digest);
        let response = self
            .http
            .head(&url)
            .send()
            .await
            .map_err(|e| Error::http_transport("blob_exists", e.to_string()))?;
        Ok(response.status() == StatusCode::OK)
    }

    /// Monolithic blob upload: `POST uploads/` then `PUT <location>?digest=`
    pub async fn upload_blob(&self, repository: &str, blob: &Blob) -> Result<()> {
        if self.blob_exists(repository, &blob.digest).await? {
            debug!(%repository, digest = %blob.digest, "blob already present");
            return Ok(());
        }

        let url = format!("{}/v2/{}/blobs/uploads/", self.base_url, repository);
        let response = self
            .http
            .post(&url)
            .send()
            .await
            .map_err(|e| Error::http_transport("start_upload", e.to_string()))?;
        let response = expect_status(response, StatusCode::ACCEPTED, "start_upload").await?;
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::http_transport("start_upload", "response has no Location header"))?;
        let upload_url = self.resolve_location(location);
        let separator = if upload_url.contains('?') { '&' } else { '?' };
        let put_url = format!("{}{}digest={}", upload_url, separator, blob.digest);

        let response = self
            .http
            .put(&put_url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(blob.data.clone())
            .send()
            .await
            .map_err(|e| Error::http_transport("upload_blob", e.to_string()))?;
        expect_status(response, StatusCode::CREATED, "upload_blob").await?;
        debug!(%repository, digest = %blob.digest, size = blob.data.len(), "uploaded blob");
        Ok(())
    }

    async fn put_manifest(&self, repository: &str, tag: &str, manifest: &serde_json::Value) -> Result<()> {
        let url = format!("{}/v2/{}/manifests/{}", self.base_url, repository, tag);
        let response = self
            .http
            .put(&url)
            .header(CONTENT_TYPE, OCI_MANIFEST_MEDIA_TYPE)
            .body(serde_json::to_vec(manifest)?)
            .send()
            .await
            .map_err(|e| Error::http_transport("put_manifest", e.to_string()))?;
        expect_status(response, StatusCode::CREATED, "put_manifest").await?;
        Ok(())
    }

    fn resolve_location(&self, location: &str) -> String {
        if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else {
            format!("{}/{}", self.base_url, location.trim_start_matches('/'))
        }
    }
}

async fn expect_status(
    response: reqwest::Response,
    expected: StatusCode,
    context: &str,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status == expected {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::http(context, status.as_u16(), body))
}
