//! Gitea git server: in-cluster install and HTTP API client
//!
//! The server runs as a single Deployment in the test namespace and is
//! reachable from the host through the kind port mapping. Controllers reach
//! it in-cluster at `http://gitea.<namespace>:3000`.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use minijinja::{context, Environment, UndefinedBehavior};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use ocm_e2e_common::accessor::{gvk_of_object, ResourceAccessor};
use ocm_e2e_common::kube_utils::decode_objects;
use ocm_e2e_common::wait::wait_for_deployment_available;
use ocm_e2e_common::TIMEOUT_LONG;

use crate::{Error, Result};

/// Name of the Gitea Deployment and Service
pub const GITEA_NAME: &str = "gitea";

/// Port Gitea listens on, in-cluster and on the host
pub const GITEA_PORT: u16 = 3000;

/// NodePort the Gitea Service is published on
pub const GITEA_NODE_PORT: u16 = 30000;

/// Branch every test repository is initialised with
pub const DEFAULT_BRANCH: &str = "main";

/// Flux notification receiver service, target of repository webhooks
pub const WEBHOOK_RECEIVER_HOST: &str = "http://webhook-receiver.flux-system";

const GITEA_MANIFEST: &str = include_str!("manifests/gitea.yaml");

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Install / remove
// =============================================================================

/// Render the Gitea manifest for a namespace and admin user
pub fn render_manifest(namespace: &str, owner: &str, password: &str) -> Result<String> {
    render(GITEA_MANIFEST, namespace, owner, password)
}

fn render(template: &str, namespace: &str, owner: &str, password: &str) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_template("gitea", template)
        .map_err(|e| Error::serialization(format!("invalid Gitea manifest template: {}", e)))?;
    env.get_template("gitea")
        .and_then(|t| {
            t.render(context! {
                namespace => namespace,
                owner => owner,
                password => password,
                node_port => GITEA_NODE_PORT,
            })
        })
        .map_err(|e| Error::serialization(format!("failed to render Gitea manifest: {}", e)))
}

/// Create the Gitea objects and wait for the Deployment to become Available
pub async fn install_gitea<A>(accessor: &A, namespace: &str, owner: &str, password: &str) -> Result<()>
where
    A: ResourceAccessor + ?Sized,
{
    info!(namespace, "Installing Gitea");
    let objects = decode_objects(&render_manifest(namespace, owner, password)?, Some(namespace))?;
    for obj in &objects {
        match accessor.create(obj).await {
            Ok(()) => {}
            Err(Error::AlreadyExists { kind, name, .. }) => {
                debug!(%kind, %name, "Gitea object already exists");
            }
            Err(e) => return Err(e),
        }
    }

    wait_for_deployment_available(accessor, namespace, GITEA_NAME, TIMEOUT_LONG, None).await?;
    info!(namespace, "Gitea is available");
    Ok(())
}

/// Delete the Gitea objects; missing objects are ignored
pub async fn remove_gitea<A>(accessor: &A, namespace: &str) -> Result<()>
where
    A: ResourceAccessor + ?Sized,
{
    info!(namespace, "Removing Gitea");
    let objects = decode_objects(&render_manifest(namespace, "", "")?, Some(namespace))?;
    for obj in objects.iter().rev() {
        let gvk = gvk_of_object(obj)?;
        let name = obj.metadata.name.clone().unwrap_or_default();
        match accessor.delete(&gvk, namespace, &name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(kind = %gvk.kind, %name, error = %e, "failed to delete Gitea object");
                return Err(e);
            }
        }
    }
    Ok(())
}

/// In-cluster clone URL of a repository
pub fn in_cluster_clone_url(namespace: &str, owner: &str, repo: &str) -> String {
    format!("http://gitea.{}:{}/{}/{}", namespace, GITEA_PORT, owner, repo)
}

/// Webhook target for a Flux Receiver path
pub fn receiver_url(webhook_path: &str) -> String {
    format!("{}{}", WEBHOOK_RECEIVER_HOST, webhook_path)
}

// =============================================================================
// API payloads
// =============================================================================

/// A Gitea repository
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Repository {
    /// Repository name
    pub name: String,
    /// `owner/name`
    #[serde(default)]
    pub full_name: String,
    /// HTTP clone URL
    #[serde(default)]
    pub clone_url: String,
    /// Default branch
    #[serde(default)]
    pub default_branch: String,
}

#[derive(Serialize)]
struct CreateRepoOption<'a> {
    name: &'a str,
    auto_init: bool,
    default_branch: &'a str,
}

#[derive(Serialize)]
struct CreateFileOption<'a> {
    content: String,
    message: String,
    branch: &'a str,
}

/// Branch reference of a pull request
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct PullRequestBranch {
    /// Branch name
    #[serde(default, rename = "ref")]
    pub reference: String,
}

/// A Gitea pull request
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct PullRequest {
    /// Per-repository number
    pub number: i64,
    /// Title
    #[serde(default)]
    pub title: String,
    /// `open` or `closed`
    #[serde(default)]
    pub state: String,
    /// Whether it has been merged
    #[serde(default)]
    pub merged: bool,
    /// Source branch
    #[serde(default)]
    pub head: PullRequestBranch,
    /// Target branch
    #[serde(default)]
    pub base: PullRequestBranch,
}

/// Body of `POST .../pulls/{index}/merge`
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct MergePullRequestOption {
    /// Merge style
    #[serde(rename = "Do")]
    pub merge_style: String,
    /// Commit message
    #[serde(rename = "MergeMessageField")]
    pub message: String,
    /// Commit title
    #[serde(rename = "MergeTitleField")]
    pub title: String,
    /// Defer until checks succeed
    pub merge_when_checks_succeed: bool,
    /// Merge even if checks fail
    pub force_merge: bool,
}

impl Default for MergePullRequestOption {
    fn default() -> Self {
        Self {
            merge_style: "squash".to_string(),
            message: "PR Merge".to_string(),
            title: "Auto Merge PR with after successful Validation Check".to_string(),
            merge_when_checks_succeed: false,
            force_merge: true,
        }
    }
}

/// `config` block of a webhook
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct HookConfig {
    /// Payload encoding
    pub content_type: String,
    /// Target URL
    pub url: String,
    /// HTTP method
    pub http_method: String,
    /// Shared secret
    pub secret: String,
}

/// Body of `POST .../hooks`
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct CreateHookOption {
    /// Enabled on creation
    pub active: bool,
    /// Authorization header sent with each delivery
    pub authorization_header: String,
    /// Only deliver for pushes to this branch
    pub branch_filter: String,
    /// Delivery settings
    pub config: HookConfig,
    /// Subscribed events
    pub events: Vec<String>,
    /// Hook flavour
    #[serde(rename = "type")]
    pub type_: String,
}

impl CreateHookOption {
    /// Gitea push hook delivering to a Flux Receiver
    pub fn flux_receiver(webhook_path: &str, secret: &str) -> Self {
        Self {
            active: true,
            authorization_header: String::new(),
            branch_filter: DEFAULT_BRANCH.to_string(),
            config: HookConfig {
                content_type: "json".to_string(),
                url: receiver_url(webhook_path),
                http_method: "post".to_string(),
                secret: secret.to_string(),
            },
            events: vec!["push".to_string(), "ping".to_string()],
            type_: "gitea".to_string(),
        }
    }
}

/// One entry of a git tree listing
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct TreeEntry {
    /// Path relative to the repository root
    pub path: String,
    /// `blob` or `tree`
    #[serde(rename = "type")]
    pub type_: String,
    /// Object SHA
    #[serde(default)]
    pub sha: String,
    /// Blob size in bytes
    #[serde(default)]
    pub size: i64,
}

#[derive(Deserialize)]
struct TreeResponse {
    #[serde(default)]
    tree: Vec<TreeEntry>,
}

#[derive(Serialize)]
struct CreateTokenOption<'a> {
    name: &'a str,
    scopes: Vec<&'a str>,
}

#[derive(Deserialize)]
struct AccessToken {
    sha1: String,
}

// =============================================================================
// Client
// =============================================================================

/// Token-authenticated client for the Gitea v1 API
#[derive(Clone, Debug)]
pub struct GiteaClient {
    http: reqwest::Client,
    base_url: String,
    owner: String,
    token: String,
}

impl GiteaClient {
    /// Create a client acting as `owner`
    pub fn new(base_url: impl Into<String>, owner: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::http_transport("gitea_client", e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            owner: owner.into(),
            token: token.into(),
        })
    }

    /// Mint an API token for a user with basic auth
    pub async fn create_access_token(
        base_url: &str,
        username: &str,
        password: &str,
        token_name: &str,
    ) -> Result<String> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::http_transport("create_access_token", e.to_string()))?;
        let url = format!(
            "{}/api/v1/users/{}/tokens",
            base_url.trim_end_matches('/'),
            username
        );
        let response = http
            .post(&url)
            .basic_auth(username, Some(password))
            .json(&CreateTokenOption {
                name: token_name,
                scopes: vec!["all"],
            })
            .send()
            .await
            .map_err(|e| Error::http_transport("create_access_token", e.to_string()))?;
        let response = expect_status(response, StatusCode::CREATED, "create_access_token").await?;
        let token: AccessToken = response
            .json()
            .await
            .map_err(|e| Error::serialization(format!("access token response: {}", e)))?;
        Ok(token.sha1)
    }

    /// Owner of every repository this client touches
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// API token in use
    pub fn token(&self) -> &str {
        &self.token
    }

    fn repo_url(&self, repo: &str) -> String {
        format!("{}/api/v1/repos/{}/{}", self.base_url, self.owner, repo)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header(reqwest::header::AUTHORIZATION, format!("token {}", self.token))
    }

    async fn send(&self, builder: reqwest::RequestBuilder, context: &str) -> Result<reqwest::Response> {
        builder
            .send()
            .await
            .map_err(|e| Error::http_transport(context, e.to_string()))
    }

    /// Create a repository initialised on `main`
    pub async fn create_repo(&self, name: &str) -> Result<Repository> {
        let url = format!("{}/api/v1/user/repos", self.base_url);
        let builder = self.request(reqwest::Method::POST, &url).json(&CreateRepoOption {
            name,
            auto_init: true,
            default_branch: DEFAULT_BRANCH,
        });
        let response = self.send(builder, "create_repo").await?;
        let response = expect_status(response, StatusCode::CREATED, "create_repo").await?;
        let repo: Repository = parse_json(response, "create_repo").await?;
        info!(repo = %repo.full_name, clone_url = %repo.clone_url, "Created repository");
        Ok(repo)
    }

    /// Delete a repository
    pub async fn delete_repo(&self, name: &str) -> Result<()> {
        let builder = self.request(reqwest::Method::DELETE, &self.repo_url(name));
        let response = self.send(builder, "delete_repo").await?;
        expect_status(response, StatusCode::NO_CONTENT, "delete_repo").await?;
        info!(owner = %self.owner, repo = name, "Deleted repository");
        Ok(())
    }

    /// Fetch a repository
    pub async fn get_repo(&self, name: &str) -> Result<Repository> {
        let builder = self.request(reqwest::Method::GET, &self.repo_url(name));
        let response = self.send(builder, "get_repo").await?;
        let response = expect_status(response, StatusCode::OK, "get_repo").await?;
        parse_json(response, "get_repo").await
    }

    /// Commit a file to `main`
    pub async fn create_file(&self, repo: &str, path: &str, content: &[u8]) -> Result<()> {
        let url = format!("{}/contents/{}", self.repo_url(repo), path.trim_start_matches('/'));
        let builder = self.request(reqwest::Method::POST, &url).json(&CreateFileOption {
            content: STANDARD.encode(content),
            message: format!("add {}", path),
            branch: DEFAULT_BRANCH,
        });
        let response = self.send(builder, "create_file").await?;
        expect_status(response, StatusCode::CREATED, "create_file").await?;
        info!(repo, path, "Added file to repository");
        Ok(())
    }

    /// Raw content of a file on `main`
    pub async fn get_file(&self, repo: &str, path: &str) -> Result<Vec<u8>> {
        let url = format!("{}/raw/{}", self.repo_url(repo), path.trim_start_matches('/'));
        let builder = self
            .request(reqwest::Method::GET, &url)
            .query(&[("ref", DEFAULT_BRANCH)]);
        let response = self.send(builder, "get_file").await?;
        let response = expect_status(response, StatusCode::OK, "get_file").await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::http_transport("get_file", e.to_string()))?;
        Ok(bytes.to_vec())
    }

    /// Fetch a pull request by number
    pub async fn get_pull_request(&self, repo: &str, number: i64) -> Result<PullRequest> {
        let url = format!("{}/pulls/{}", self.repo_url(repo), number);
        let builder = self.request(reqwest::Method::GET, &url);
        let response = self.send(builder, "get_pull_request").await?;
        let response = expect_status(response, StatusCode::OK, "get_pull_request").await?;
        parse_json(response, "get_pull_request").await
    }

    /// Squash-merge a pull request
    pub async fn merge_pull_request(&self, repo: &str, number: i64) -> Result<()> {
        let url = format!("{}/pulls/{}/merge", self.repo_url(repo), number);
        let builder = self
            .request(reqwest::Method::POST, &url)
            .json(&MergePullRequestOption::default());
        let response = self.send(builder, "merge_pull_request").await?;
        expect_status(response, StatusCode::OK, "merge_pull_request").await?;
        info!(repo, number, "Merged pull request");
        Ok(())
    }

    /// Register a webhook on a repository
    pub async fn create_hook(&self, repo: &str, hook: &CreateHookOption) -> Result<()> {
        let url = format!("{}/hooks", self.repo_url(repo));
        let builder = self.request(reqwest::Method::POST, &url).json(hook);
        let response = self.send(builder, "create_hook").await?;
        expect_status(response, StatusCode::CREATED, "create_hook").await?;
        info!(repo, url = %hook.config.url, "Created webhook");
        Ok(())
    }

    /// Recursive tree listing of `main`
    pub async fn list_tree(&self, repo: &str) -> Result<Vec<TreeEntry>> {
        let url = format!("{}/git/trees/{}", self.repo_url(repo), DEFAULT_BRANCH);
        let builder = self.request(reqwest::Method::GET, &url).query(&[
            ("recursive", "true"),
            ("per_page", "100"),
            ("page", "1"),
        ]);
        let response = self.send(builder, "list_tree").await?;
        let response = expect_status(response, StatusCode::OK, "list_tree").await?;
        let tree: TreeResponse = parse_json(response, "list_tree").await?;
        Ok(tree.tree)
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

async fn parse_json<T: serde::de::DeserializeOwned>(response: reqwest::Response, context: &str) -> Result<T> {
    response
        .json()
        .await
        .map_err(|e| Error::serialization(format!("{} response: {}", context, e)))
}
