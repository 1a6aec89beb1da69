//! OCI registry tag listing
//!
//! Speaks the distribution API directly: `GET /v2/<repo>/tags/list`, answering
//! an anonymous bearer challenge when the registry asks for one and following
//! `Link: <...>; rel="next"` pagination.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, LINK, WWW_AUTHENTICATE};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::debug;

use super::TagSource;
use crate::layout::SystemLayout;
use crate::service::env::parse_env;
use crate::{Error, Result};

const DOCKER_HUB: &str = "docker.io";
const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";
const PAGE_SIZE: u32 = 1000;
/// Upper bound on followed `Link` pages
const MAX_PAGES: usize = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// os-release key naming the repository the OS image came from
pub const IMAGE_REPO_KEY: &str = "IMAGE_REPO";

/// A parsed image repository reference
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host, e.g. `quay.io`
    pub registry: String,
    /// Repository path, e.g. `kairos/opensuse`
    pub repository: String,
}

impl ImageReference {
    /// Parse `[registry/]repository[:tag][@digest]`
    ///
    /// Without a registry host the reference points at Docker Hub, where
    /// single-segment names live under `library/`.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        let without_digest = reference.split('@').next().unwrap_or(reference);
        let without_tag = match without_digest.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') => name,
            _ => without_digest,
        };
        if without_tag.is_empty() {
            return Err(Error::registry(format!("invalid image reference: {:?}", reference)));
        }

        let (registry, repository) = match without_tag.split_once('/') {
            Some((host, rest))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                (host.to_string(), rest.to_string())
            }
            _ => (DOCKER_HUB.to_string(), without_tag.to_string()),
        };

        let registry = if registry == DOCKER_HUB {
            DOCKER_HUB_REGISTRY.to_string()
        } else {
            registry
        };
        let repository = if registry == DOCKER_HUB_REGISTRY && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        Ok(Self {
            registry,
            repository,
        })
    }

    fn tags_url(&self) -> Result<Url> {
        let url = format!(
            "https://{}/v2/{}/tags/list?n={}",
            self.registry, self.repository, PAGE_SIZE
        );
        Url::parse(&url).map_err(|e| Error::registry(format!("invalid registry URL {}: {}", url, e)))
    }
}

/// Parameters of a `WWW-Authenticate: Bearer ...` challenge
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

impl BearerChallenge {
    fn parse(header: &str) -> Option<Self> {
        let (scheme, params) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut challenge = Self::default();
        for param in split_params(params) {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "realm" => challenge.realm = value,
                "service" => challenge.service = Some(value),
                "scope" => challenge.scope = Some(value),
                _ => {}
            }
        }
        (!challenge.realm.is_empty()).then_some(challenge)
    }
}

/// Split challenge parameters on commas outside quotes
fn split_params(params: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in params.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(params[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(params[start..].trim());
    parts.into_iter().filter(|p| !p.is_empty()).collect()
}

/// Target of a `Link: <...>; rel="next"` header
fn next_link(header: &str) -> Option<&str> {
    header.split(',').find_map(|link| {
        let (target, params) = link.split_once(';')?;
        params
            .split(';')
            .any(|p| p.trim().replace(' ', "") == "rel=\"next\"")
            .then(|| target.trim().trim_start_matches('<').trim_end_matches('>'))
    })
}

/// Pages visited while following `Link` headers
#[derive(Debug, Default)]
struct Pager {
    visited: HashSet<Url>,
}

impl Pager {
    /// Record `url` as fetched; fails on a repeated page or past [`MAX_PAGES`]
    fn visit(&mut self, url: &Url) -> Result<()> {
        if !self.visited.insert(url.clone()) {
            return Err(Error::registry(format!("pagination loops back to {}", url)));
        }
        if self.visited.len() > MAX_PAGES {
            return Err(Error::registry(format!(
                "tag list exceeds {} pages",
                MAX_PAGES
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Tag source reading a registry over HTTPS
#[derive(Clone, Debug)]
pub struct RegistryTagSource {
    image: ImageReference,
    client: reqwest::Client,
}

impl RegistryTagSource {
    /// Source for the given repository reference
    pub fn new(reference: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::registry(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            image: ImageReference::parse(reference)?,
            client,
        })
    }

    /// Source for the repository named by `IMAGE_REPO` in os-release
    pub fn from_os_release(layout: &SystemLayout) -> Result<Self> {
        let path = layout.os_release();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::registry(format!("cannot read {}: {}", path.display(), e)))?;
        let reference = parse_env(&content)
            .remove(IMAGE_REPO_KEY)
            .filter(|repo| !repo.is_empty())
            .ok_or_else(|| {
                Error::registry(format!("{} not set in {}", IMAGE_REPO_KEY, path.display()))
            })?;
        Self::new(&reference)
    }

    /// Repository the tags are read from
    pub fn image(&self) -> &ImageReference {
        &self.image
    }

    async fn anonymous_token(&self, challenge: &BearerChallenge) -> Result<String> {
        let mut url = Url::parse(&challenge.realm)
            .map_err(|e| Error::registry(format!("invalid token realm {}: {}", challenge.realm, e)))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = &challenge.service {
                query.append_pair("service", service);
            }
            let scope = challenge
                .scope
                .clone()
                .unwrap_or_else(|| format!("repository:{}:pull", self.image.repository));
            query.append_pair("scope", &scope);
        }

        let response: TokenResponse = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::registry(format!("token request failed: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::registry(format!("invalid token response: {}", e)))?;

        response
            .token
            .or(response.access_token)
            .ok_or_else(|| Error::registry("token response carries no token"))
    }

    async fn fetch_page(&self, url: &Url, token: &mut Option<String>) -> Result<reqwest::Response> {
        let send = |token: Option<&String>| {
            let mut request = self.client.get(url.clone());
            if let Some(token) = token {
                request = request.header(AUTHORIZATION, format!("Bearer {}", token));
            }
            request.send()
        };

        let response = send(token.as_ref())
            .await
            .map_err(|e| Error::registry(format!("GET {} failed: {}", url, e)))?;
        if response.status() != StatusCode::UNAUTHORIZED || token.is_some() {
            return response
                .error_for_status()
                .map_err(|e| Error::registry(format!("GET {} failed: {}", url, e)));
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|h| h.to_str().ok())
            .and_then(BearerChallenge::parse)
            .ok_or_else(|| Error::registry(format!("GET {}: unauthorized", url)))?;
        debug!(realm = %challenge.realm, "Registry requested a bearer token");
        let fresh = self.anonymous_token(&challenge).await?;
        *token = Some(fresh);

        send(token.as_ref())
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::registry(format!("GET {} failed: {}", url, e)))
    }
}

#[async_trait]
impl TagSource for RegistryTagSource {
    async fn list_tags(&self) -> Result<Vec<String>> {
        let mut url = self.image.tags_url()?;
        let mut token = None;
        let mut tags = Vec::new();
        let mut pager = Pager::default();

        loop {
            pager.visit(&url)?;
            let response = self.fetch_page(&url, &mut token).await?;
            let next = response
                .headers()
                .get(LINK)
                .and_then(|h| h.to_str().ok())
                .and_then(next_link)
                .map(|target| url.join(target))
                .transpose()
                .map_err(|e| Error::registry(format!("invalid pagination link: {}", e)))?;

            let page: TagList = response
                .json()
                .await
                .map_err(|e| Error::registry(format!("invalid tag list: {}", e)))?;
            tags.extend(page.tags.unwrap_or_default());

            match next {
                Some(next) => url = next,
                None => break,
            }
        }

        debug!(
            registry = %self.image.registry,
            repository = %self.image.repository,
            count = tags.len(),
            "Fetched registry tags"
        );
        Ok(tags)
    }
}
