use crate::core::raw_http::format_raw_request;
use crate::utils::error::{CtfError, Result};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE};
use reqwest::{Client, Method, Request, RequestBuilder, Response};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Normalises a challenge address into a base URL.
///
/// `host:443` without a scheme becomes `https://host/`, any other bare
/// address gets `http://`. The path always ends with `/` so relative paths
/// join underneath it.
pub fn normalize_base_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CtfError::InvalidConfigValueError {
            field: "url".to_string(),
            value: raw.to_string(),
            reason: "URL cannot be empty".to_string(),
        });
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else if trimmed.ends_with(":443") {
        format!("https://{}", trimmed)
    } else {
        format!("http://{}", trimmed)
    };

    let mut url = Url::parse(&with_scheme)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// HTTP client bound to one challenge base URL.
#[derive(Debug, Clone)]
pub struct BaseApi {
    client: Client,
    base_url: Url,
    headers: HeaderMap,
    cookies: Option<Arc<Jar>>,
}

pub struct BaseApiBuilder {
    url: String,
    insecure: bool,
    timeout: Option<Duration>,
    headers: Vec<(String, String)>,
    cookie_store: bool,
}

impl BaseApiBuilder {
    /// Skip TLS certificate checks (self-signed challenge hosts).
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn cookie_store(mut self, enabled: bool) -> Self {
        self.cookie_store = enabled;
        self
    }

    pub fn build(self) -> Result<BaseApi> {
        let base_url = normalize_base_url(&self.url)?;

        let mut default_headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                CtfError::InvalidConfigValueError {
                    field: "headers".to_string(),
                    value: name.clone(),
                    reason: e.to_string(),
                }
            })?;
            let value =
                HeaderValue::from_str(value).map_err(|e| CtfError::InvalidConfigValueError {
                    field: "headers".to_string(),
                    value: value.clone(),
                    reason: e.to_string(),
                })?;
            default_headers.insert(name, value);
        }

        let mut builder = Client::builder()
            .danger_accept_invalid_certs(self.insecure)
            .default_headers(default_headers.clone());
        let cookies = self.cookie_store.then(|| Arc::new(Jar::default()));
        if let Some(jar) = &cookies {
            builder = builder.cookie_provider(jar.clone());
        }
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        tracing::debug!("BaseApi ready for {}", base_url);
        Ok(BaseApi {
            client: builder.build()?,
            base_url,
            headers: default_headers,
            cookies,
        })
    }
}

impl BaseApi {
    pub fn new(url: &str) -> Result<Self> {
        Self::builder(url).build()
    }

    pub fn builder(url: impl Into<String>) -> BaseApiBuilder {
        BaseApiBuilder {
            url: url.into(),
            insecure: false,
            timeout: None,
            headers: Vec::new(),
            cookie_store: true,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Session cookies collected so far, `None` when the cookie store is off.
    pub fn cookie_jar(&self) -> Option<&Arc<Jar>> {
        self.cookies.as_ref()
    }

    /// Seeds a cookie (`name=value; Path=/`) for the base URL.
    pub fn add_cookie(&self, cookie: &str) {
        if let Some(jar) = &self.cookies {
            jar.add_cookie_str(cookie, &self.base_url);
        }
    }

    /// Resolves `path` against the base URL. A leading `/` is relative to the
    /// base, not to the host root.
    pub fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    pub fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self.url(path)?;
        tracing::debug!("{} {}", method, url);
        // 預設標頭在送出時才會合併，這裡先放進去讓 raw request 也看得到
        Ok(self.client.request(method, url).headers(self.headers.clone()))
    }

    pub async fn get(&self, path: &str) -> Result<Response> {
        Ok(self.request(Method::GET, path)?.send().await?)
    }

    pub async fn post_form<T: Serialize + ?Sized>(&self, path: &str, form: &T) -> Result<Response> {
        Ok(self.request(Method::POST, path)?.form(form).send().await?)
    }

    pub async fn post_json<T: Serialize + ?Sized>(&self, path: &str, json: &T) -> Result<Response> {
        Ok(self.request(Method::POST, path)?.json(json).send().await?)
    }

    /// Builds the request without sending it.
    pub fn build_request<F>(&self, method: Method, path: &str, configure: F) -> Result<Request>
    where
        F: FnOnce(RequestBuilder) -> RequestBuilder,
    {
        let mut request = configure(self.request(method, path)?).build()?;
        // cookie store 也是送出時才加，raw request 要自己補上
        if !request.headers().contains_key(COOKIE) {
            if let Some(cookie) = self.cookies.as_ref().and_then(|jar| jar.cookies(request.url())) {
                request.headers_mut().insert(COOKIE, cookie);
            }
        }
        Ok(request)
    }

    /// Raw HTTP/1.1 bytes for the request, ready for a [`crate::adapters::tube::Tube`].
    pub fn make_raw_request<F>(&self, method: Method, path: &str, configure: F) -> Result<Vec<u8>>
    where
        F: FnOnce(RequestBuilder) -> RequestBuilder,
    {
        let request = self.build_request(method, path, configure)?;
        Ok(format_raw_request(&request))
    }
}
