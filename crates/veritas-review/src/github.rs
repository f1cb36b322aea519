use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT};
use reqwest::{StatusCode, Url};
use veritas_core::{CommentRef, GithubConfig, PullRequestId, RefPair, RepoRef, VeritasError};
use veritas_difflens::Diff;

use crate::llm::retry_after_header;
use crate::ports::{CommentApi, DiffSource, PullRequestSnapshot, RepositoryContent};

const USER_AGENT: &str = concat!("veritas/", env!("CARGO_PKG_VERSION"));
const COMMENTS_PER_PAGE: usize = 100;
const MAX_COMMENT_PAGES: u32 = 10;

/// GitHub REST client: pull-request diffs, file contents and comments.
///
/// JSON endpoints go through `octocrab`; the diff and raw-content media
/// types are fetched with `reqwest` so status codes can be classified.
pub struct GitHubClient {
    octocrab: octocrab::Octocrab,
    http: reqwest::Client,
    api_base: String,
    token: String,
}

impl GitHubClient {
    /// Create a client from `[github]` configuration.
    ///
    /// # Errors
    ///
    /// Returns [`VeritasError::Config`] if no token is configured, or
    /// [`VeritasError::Github`] if a client cannot be built.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use veritas_core::GithubConfig;
    /// use veritas_review::github::GitHubClient;
    ///
    /// let config = GithubConfig { token: Some("ghp_xxxx".into()), ..Default::default() };
    /// let client = GitHubClient::new(&config).unwrap();
    /// ```
    pub fn new(config: &GithubConfig) -> Result<Self, VeritasError> {
        let token = config.token.clone().ok_or_else(|| {
            VeritasError::Config(
                "no GitHub token: set [github] token, GITHUB_TOKEN or GH_TOKEN".into(),
            )
        })?;
        let api_base = config.api_base.trim_end_matches('/').to_string();

        let octocrab = octocrab::Octocrab::builder()
            .personal_token(token.clone())
            .base_uri(api_base.as_str())
            .map_err(|e| VeritasError::Config(format!("invalid GitHub api_base: {e}")))?
            .build()
            .map_err(|e| VeritasError::Github(format!("failed to create GitHub client: {e}")))?;

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| VeritasError::Github(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            octocrab,
            http,
            api_base,
            token,
        })
    }

    async fn get_text(&self, url: Url, accept: &str, what: &str) -> Result<reqwest::Response, VeritasError> {
        let response = self
            .http
            .get(url)
            .header(ACCEPT, accept)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| VeritasError::Transport(format!("{what}: {e}")))?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(response);
        }
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &headers, &body, what))
    }

    async fn pull_request_diff(&self, pr: &PullRequestId) -> Result<String, VeritasError> {
        let url = api_url(
            &self.api_base,
            &[
                "repos",
                &pr.repo.owner,
                &pr.repo.name,
                "pulls",
                &pr.number.to_string(),
            ],
        )?;
        let what = format!("fetching diff of {pr}");
        let response = self
            .get_text(url, "application/vnd.github.v3.diff", &what)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(VeritasError::NotFound(format!("pull request {pr}")));
        }
        response
            .text()
            .await
            .map_err(|e| VeritasError::Transport(format!("{what}: {e}")))
    }
}

#[async_trait]
impl DiffSource for GitHubClient {
    async fn pull_request(&self, pr: &PullRequestId) -> Result<PullRequestSnapshot, VeritasError> {
        let route = format!("/repos/{}/{}/pulls/{}", pr.repo.owner, pr.repo.name, pr.number);
        let details: serde_json::Value = self
            .octocrab
            .get(route, None::<&()>)
            .await
            .map_err(|e| VeritasError::Github(format!("failed to fetch {pr}: {e}")))?;

        let field = |pointer: &str| {
            details
                .pointer(pointer)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        let head_ref = field("/head/sha")
            .ok_or_else(|| VeritasError::Github(format!("{pr} has no head sha")))?;
        let base_ref = field("/base/sha").unwrap_or_default();
        let base_branch = field("/base/ref").unwrap_or_default();

        let raw = self.pull_request_diff(pr).await?;
        let diff = Diff::parse(
            &raw,
            RefPair {
                base: base_ref.clone(),
                head: head_ref.clone(),
            },
        )?;

        Ok(PullRequestSnapshot {
            diff,
            head_ref,
            base_ref,
            base_branch,
            title: field("/title").unwrap_or_default(),
            body: field("/body").filter(|b| !b.trim().is_empty()),
        })
    }
}

#[async_trait]
impl RepositoryContent for GitHubClient {
    async fn file_content(
        &self,
        repo: &RepoRef,
        path: &str,
        git_ref: &str,
    ) -> Result<Option<Vec<u8>>, VeritasError> {
        let url = contents_url(&self.api_base, repo, path, git_ref)?;
        let what = format!("fetching {path}@{git_ref}");
        let response = self
            .get_text(url, "application/vnd.github.raw", &what)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| VeritasError::Transport(format!("{what}: {e}")))?;
        Ok(Some(bytes.to_vec()))
    }
}

#[async_trait]
impl CommentApi for GitHubClient {
    async fn create_comment(
        &self,
        pr: &PullRequestId,
        body: &str,
    ) -> Result<CommentRef, VeritasError> {
        let route = format!(
            "/repos/{}/{}/issues/{}/comments",
            pr.repo.owner, pr.repo.name, pr.number
        );
        let created: serde_json::Value = self
            .octocrab
            .post(route, Some(&serde_json::json!({ "body": body })))
            .await
            .map_err(|e| VeritasError::Github(format!("failed to comment on {pr}: {e}")))?;
        created
            .get("id")
            .and_then(|id| id.as_u64())
            .map(CommentRef)
            .ok_or_else(|| VeritasError::Github("comment response has no id".into()))
    }

    async fn update_comment(
        &self,
        pr: &PullRequestId,
        comment: CommentRef,
        body: &str,
    ) -> Result<(), VeritasError> {
        let route = format!(
            "/repos/{}/{}/issues/comments/{}",
            pr.repo.owner, pr.repo.name, comment.0
        );
        let _updated: serde_json::Value = self
            .octocrab
            .patch(route, Some(&serde_json::json!({ "body": body })))
            .await
            .map_err(|e| VeritasError::Github(format!("failed to update {comment} on {pr}: {e}")))?;
        Ok(())
    }

    async fn find_comment(
        &self,
        pr: &PullRequestId,
        marker: &str,
    ) -> Result<Option<CommentRef>, VeritasError> {
        let route = format!(
            "/repos/{}/{}/issues/{}/comments",
            pr.repo.owner, pr.repo.name, pr.number
        );
        for page in 1..=MAX_COMMENT_PAGES {
            let params = serde_json::json!({ "per_page": COMMENTS_PER_PAGE, "page": page });
            let comments: Vec<serde_json::Value> = self
                .octocrab
                .get(&route, Some(&params))
                .await
                .map_err(|e| VeritasError::Github(format!("failed to list comments on {pr}: {e}")))?;
            if let Some(found) = find_marked(&comments, marker) {
                return Ok(Some(found));
            }
            if comments.len() < COMMENTS_PER_PAGE {
                break;
            }
        }
        Ok(None)
    }
}

fn find_marked(comments: &[serde_json::Value], marker: &str) -> Option<CommentRef> {
    comments.iter().find_map(|c| {
        let body = c.get("body")?.as_str()?;
        if body.contains(marker) {
            c.get("id")?.as_u64().map(CommentRef)
        } else {
            None
        }
    })
}

fn api_url(api_base: &str, segments: &[&str]) -> Result<Url, VeritasError> {
    let mut url = Url::parse(api_base)
        .map_err(|e| VeritasError::Config(format!("invalid GitHub api_base '{api_base}': {e}")))?;
    url.path_segments_mut()
        .map_err(|_| VeritasError::Config(format!("GitHub api_base cannot be a base: {api_base}")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// `{api}/repos/{owner}/{repo}/contents/{path}?ref={git_ref}`, each path segment escaped.
fn contents_url(
    api_base: &str,
    repo: &RepoRef,
    path: &str,
    git_ref: &str,
) -> Result<Url, VeritasError> {
    let mut segments = vec!["repos", repo.owner.as_str(), repo.name.as_str(), "contents"];
    segments.extend(path.split('/').filter(|s| !s.is_empty()));
    let mut url = api_url(api_base, &segments)?;
    url.query_pairs_mut().append_pair("ref", git_ref);
    Ok(url)
}

fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str, what: &str) -> VeritasError {
    let exhausted = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        == Some("0");
    match status.as_u16() {
        404 => VeritasError::NotFound(what.to_string()),
        429 => VeritasError::RateLimited {
            retry_after: retry_after_header(headers),
        },
        403 if exhausted => VeritasError::RateLimited {
            retry_after: retry_after_header(headers),
        },
        500..=599 => VeritasError::Transport(format!("{what}: GitHub returned {status}")),
        _ => VeritasError::Github(format!("{what}: GitHub API error {status}: {body}")),
    }
}
