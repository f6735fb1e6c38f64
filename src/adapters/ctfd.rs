//! CTFd client: log in, list challenges and pull each one into
//! `<host>/<category>/<name>/` with its attachments and a solver skeleton.

use crate::adapters::http::BaseApi;
use crate::template::{self, TemplateContext, TemplateKind};
use crate::utils::error::{CtfError, Result};
use futures::stream::{self, StreamExt};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:109.0) Gecko/20100101 Firefox/110.0";

const LOGIN_PATH: &str = "/login";
const CHALLENGES_PATH: &str = "/api/v1/challenges";
const ATTACHMENT_DIR: &str = "attachment";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Entry of `/api/v1/challenges`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeSummary {
    pub id: u64,
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub tags: Vec<serde_json::Value>,
    #[serde(default)]
    pub solved_by_me: bool,
}

/// `/api/v1/challenges/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category: String,
    #[serde(default)]
    pub tags: Vec<serde_json::Value>,
    #[serde(default)]
    pub value: u64,
    #[serde(default)]
    pub connection_info: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub solves: u64,
    #[serde(default)]
    pub solved_by_me: bool,
    /// Paths like `/files/<hash>/dist.zip?token=...`
    #[serde(default)]
    pub files: Vec<String>,
}

impl Challenge {
    fn readme_vars(&self) -> [(&'static str, String); 6] {
        [
            ("name", self.name.clone()),
            ("category", self.category.clone()),
            ("value", self.value.to_string()),
            ("solves", self.solves.to_string()),
            (
                "connection_info",
                self.connection_info.clone().unwrap_or_else(|| "-".to_string()),
            ),
            ("description", self.description.clone()),
        ]
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

impl<T> Envelope<T> {
    fn into_data(self) -> Result<T> {
        if !self.success {
            return Err(CtfError::protocol(format!(
                "request end with {} status",
                self.message.as_deref().unwrap_or("unsuccessful")
            )));
        }
        self.data
            .ok_or_else(|| CtfError::protocol("CTFd response has no data"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChallengeFilter {
    /// Case-insensitive exact category.
    pub category: Option<String>,
    pub only_solved: bool,
}

impl ChallengeFilter {
    pub fn matches(&self, challenge: &ChallengeSummary) -> bool {
        let category_ok = self
            .category
            .as_ref()
            .map_or(true, |category| challenge.category.eq_ignore_ascii_case(category));
        category_ok && (!self.only_solved || challenge.solved_by_me)
    }
}

/// Outcome of [`CtfdClient::download_all`].
#[derive(Debug, Default)]
pub struct DownloadReport {
    pub saved: Vec<PathBuf>,
    pub errors: Vec<CtfError>,
}

impl DownloadReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Last path segment of a file URL, without the query string.
pub fn file_name(file_url: &str) -> &str {
    let path = file_url.split('?').next().unwrap_or(file_url);
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

/// Makes a platform-provided name safe as one directory component.
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

pub fn extract_nonce(html: &str) -> Option<String> {
    let tag = Regex::new(r#"<input[^>]*id=["']nonce["'][^>]*>"#).ok()?;
    let value = Regex::new(r#"value=["']([^"']*)["']"#).ok()?;
    let tag = tag.find(html)?;
    value
        .captures(tag.as_str())
        .map(|caps| caps[1].to_string())
}

pub struct CtfdClient {
    api: BaseApi,
    host: String,
    concurrency: usize,
    crate_path: Option<PathBuf>,
}

impl CtfdClient {
    /// Browser user agent, cookie session, TLS checks off.
    pub fn new(url: &str) -> Result<Self> {
        let api = BaseApi::builder(url)
            .insecure(true)
            .header("User-Agent", BROWSER_USER_AGENT)
            .build()?;
        Ok(Self::with_api(api))
    }

    pub fn with_api(api: BaseApi) -> Self {
        let host = api.base_url().host_str().unwrap_or("ctfd").to_string();
        Self {
            api,
            host,
            concurrency: 4,
            crate_path: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Where scaffolded solvers find this crate.
    pub fn with_crate_path(mut self, crate_path: impl Into<PathBuf>) -> Self {
        self.crate_path = Some(crate_path.into());
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn api(&self) -> &BaseApi {
        &self.api
    }

    async fn get_data<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let envelope: Envelope<T> = self.api.get(path).await?.json().await?;
        envelope.into_data()
    }

    pub async fn login(&self, credentials: &Credentials) -> Result<()> {
        let page = self.api.get(LOGIN_PATH).await?.text().await?;
        let nonce = extract_nonce(&page)
            .ok_or_else(|| CtfError::protocol("nonce doesn't exist on the login page"))?;

        let form = [
            ("name", credentials.username.as_str()),
            ("password", credentials.password.as_str()),
            ("_submit", "Submit"),
            ("nonce", nonce.as_str()),
        ];
        let body = self.api.post_form(LOGIN_PATH, &form).await?.text().await?;
        if body.contains("incorrect") {
            return Err(CtfError::AuthenticationError {
                message: format!("invalid credential for {}", credentials.username),
            });
        }
        tracing::info!("Logged in to {} as {}", self.host, credentials.username);
        Ok(())
    }

    pub async fn challenges(&self) -> Result<Vec<ChallengeSummary>> {
        self.get_data(CHALLENGES_PATH).await
    }

    pub async fn challenge(&self, id: u64) -> Result<Challenge> {
        self.get_data(&format!("{}/{}", CHALLENGES_PATH, id)).await
    }

    pub async fn download_file(&self, file_url: &str) -> Result<Vec<u8>> {
        let response = self.api.get(file_url).await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    /// `root/<host>/<category>/<name>`
    pub fn challenge_dir(&self, root: &Path, category: &str, name: &str) -> PathBuf {
        root.join(sanitize_component(&self.host))
            .join(sanitize_component(category))
            .join(sanitize_component(name))
    }

    /// Writes README, solver skeleton and attachments for one challenge.
    pub async fn save_challenge(&self, summary: &ChallengeSummary, root: &Path) -> Result<PathBuf> {
        let challenge = self.challenge(summary.id).await?;
        let dir = self.challenge_dir(root, &challenge.category, &challenge.name);
        tokio::fs::create_dir_all(&dir).await?;

        let readme = template::render_file("challenge/README.md.tmpl", &challenge.readme_vars())?;
        tokio::fs::write(dir.join("README.md"), readme).await?;

        if let Some(kind) = TemplateKind::for_category(&challenge.category) {
            let mut context = TemplateContext {
                name: solver_package_name(&challenge.name),
                url: challenge
                    .connection_info
                    .clone()
                    .filter(|info| info.starts_with("http"))
                    .unwrap_or_else(|| self.api.base_url().to_string()),
                ..TemplateContext::default()
            };
            if let Some(crate_path) = &self.crate_path {
                context.crate_path = crate_path.clone();
            }
            let report = kind.write_to(&dir.join("solver"), &context);
            for e in report.errors {
                // 已存在的檔案不覆蓋，其它錯誤往上丟
                if !matches!(e, CtfError::TemplateExistsError { .. }) {
                    return Err(e);
                }
            }
        }

        if !challenge.files.is_empty() {
            let attachments = dir.join(ATTACHMENT_DIR);
            tokio::fs::create_dir_all(&attachments).await?;
            for file_url in &challenge.files {
                let data = self.download_file(file_url).await?;
                let target = attachments.join(sanitize_component(file_name(file_url)));
                tokio::fs::write(&target, data).await?;
                tracing::debug!("Saved {}", target.display());
            }
        }

        tracing::info!("success downloading: {} ({})", challenge.name, challenge.category);
        Ok(dir)
    }

    /// Lists, filters and saves challenges concurrently. One failing
    /// challenge does not stop the others.
    pub async fn download_all(&self, filter: &ChallengeFilter, root: &Path) -> Result<DownloadReport> {
        let selected: Vec<ChallengeSummary> = self
            .challenges()
            .await?
            .into_iter()
            .filter(|challenge| filter.matches(challenge))
            .collect();
        tracing::info!("Downloading {} challenges from {}", selected.len(), self.host);

        let results: Vec<Result<PathBuf>> = stream::iter(selected.iter())
            .map(|summary| self.save_challenge(summary, root))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = DownloadReport::default();
        for result in results {
            match result {
                Ok(dir) => report.saved.push(dir),
                Err(e) => {
                    tracing::error!("{}", e);
                    report.errors.push(e);
                }
            }
        }
        report.saved.sort();
        Ok(report)
    }
}

/// Cargo package names allow letters, digits, `-` and `_`.
fn solver_package_name(name: &str) -> String {
    let name: String = name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let name = name.trim_matches('-');
    if name.is_empty() {
        "solve".to_string()
    } else if name.starts_with(|c: char| c.is_ascii_digit()) {
        format!("solve-{}", name)
    } else {
        name.to_string()
    }
}
