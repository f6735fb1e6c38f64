use crate::adapters::http::BaseApi;
use crate::adapters::rpc::{parse_private_key, Address};
use crate::adapters::sqli::{Indicator, SqlLikeOracle, KNOWN_PLACEHOLDER, PAYLOAD_PLACEHOLDER};
use crate::core::blind::{BlindExtractor, RetryPolicy};
use crate::utils::error::{CtfError, Result};
use crate::utils::validation::{self, Validate};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Per-challenge solver profile, usually `solver.toml` next to the solve script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    /// 只做 rpc/serve 的 profile 可以省略
    pub target: Option<TargetConfig>,
    pub blind: Option<BlindSection>,
    pub rpc: Option<RpcSection>,
    pub server: Option<ServerSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub url: String,
    pub insecure: Option<bool>,
    pub timeout_seconds: Option<u64>,
    pub headers: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlindSection {
    pub path: String,
    pub method: Option<String>,
    pub payload: String,
    pub fields: BTreeMap<String, String>,
    /// 回應中「沒有」這段文字時算命中（例如登入失敗訊息）
    pub miss_marker: Option<String>,
    /// 回應中「有」這段文字時算命中
    pub hit_marker: Option<String>,
    pub known: Option<String>,
    pub charset: Option<String>,
    pub concurrency: Option<usize>,
    pub max_length: Option<usize>,
    pub retry_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcSection {
    pub url: String,
    /// 有設定就在本地簽章，通常寫成 "${PRIVKEY}"
    pub private_key: Option<String>,
    pub setup_address: Option<Address>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    pub port: Option<u16>,
    pub index: Option<PathBuf>,
}

impl SolverConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(CtfError::IoError)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| CtfError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 替換環境變數 (例如 ${SESSION_COOKIE})，沒設定的保持原樣
    fn substitute_env_vars(content: &str) -> Result<String> {
        use regex::Regex;
        let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| CtfError::ConfigValidationError {
            field: "environment".to_string(),
            message: e.to_string(),
        })?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        });

        Ok(result.to_string())
    }

    /// 驗證配置的合理性
    pub fn validate_config(&self) -> Result<()> {
        if let Some(target) = &self.target {
            crate::adapters::http::normalize_base_url(&target.url)?;
        }

        if let Some(blind) = &self.blind {
            self.target_section()?;
            validation::validate_non_empty_string("blind.path", &blind.path)?;
            validation::validate_contains("blind.payload", &blind.payload, KNOWN_PLACEHOLDER)?;
            if !blind
                .fields
                .values()
                .any(|value| value.contains(PAYLOAD_PLACEHOLDER))
            {
                return Err(CtfError::InvalidConfigValueError {
                    field: "blind.fields".to_string(),
                    value: format!("{:?}", blind.fields),
                    reason: format!("one field must contain {}", PAYLOAD_PLACEHOLDER),
                });
            }
            if let Some(concurrency) = blind.concurrency {
                validation::validate_positive_number("blind.concurrency", concurrency, 1)?;
            }
            if let Some(charset) = &blind.charset {
                validation::validate_non_empty_string("blind.charset", charset)?;
            }
            blind.indicator()?;
            blind.method()?;
        }

        if let Some(rpc) = &self.rpc {
            validation::validate_url("rpc.url", &rpc.url)?;
            if let Some(key) = &rpc.private_key {
                parse_private_key(key)?;
            }
        }

        if let Some(port) = self.server.as_ref().and_then(|s| s.port) {
            validation::validate_range("server.port", port, 1, u16::MAX)?;
        }

        Ok(())
    }

    pub fn target_section(&self) -> Result<&TargetConfig> {
        validation::validate_required_field("target", &self.target)
    }

    pub fn rpc_section(&self) -> Result<&RpcSection> {
        validation::validate_required_field("rpc", &self.rpc)
    }

    pub fn build_api(&self) -> Result<BaseApi> {
        let target = self.target_section()?;
        let mut builder =
            BaseApi::builder(target.url.clone()).insecure(target.insecure.unwrap_or(false));
        if let Some(timeout) = target.timeout_seconds {
            builder = builder.timeout(Duration::from_secs(timeout));
        }
        for (name, value) in target.headers.iter().flatten() {
            builder = builder.header(name.clone(), value.clone());
        }
        builder.build()
    }

    pub fn blind_section(&self) -> Result<&BlindSection> {
        validation::validate_required_field("blind", &self.blind)
    }

    pub fn build_extractor(&self) -> Result<BlindExtractor<SqlLikeOracle>> {
        let blind = self.blind_section()?;
        let mut oracle =
            SqlLikeOracle::new(self.build_api()?, blind.path.clone(), blind.payload.clone(), blind.indicator()?)
                .with_method(blind.method()?);
        for (name, value) in &blind.fields {
            oracle = oracle.with_field(name.clone(), value.clone());
        }

        let mut extractor = BlindExtractor::new(oracle).with_retry(blind.retry_policy());
        if let Some(charset) = &blind.charset {
            extractor = extractor.with_charset(charset.chars());
        }
        if let Some(concurrency) = blind.concurrency {
            extractor = extractor.with_concurrency(concurrency);
        }
        if let Some(max_length) = blind.max_length {
            extractor = extractor.with_max_length(max_length);
        }
        Ok(extractor)
    }
}

impl BlindSection {
    pub fn indicator(&self) -> Result<Indicator> {
        match (&self.miss_marker, &self.hit_marker) {
            (Some(miss), None) => Ok(Indicator::Absent(miss.clone())),
            (None, Some(hit)) => Ok(Indicator::Present(hit.clone())),
            (Some(_), Some(_)) => Err(CtfError::ConfigValidationError {
                field: "blind".to_string(),
                message: "set only one of miss_marker or hit_marker".to_string(),
            }),
            (None, None) => Err(CtfError::MissingConfigError {
                field: "blind.miss_marker or blind.hit_marker".to_string(),
            }),
        }
    }

    pub fn method(&self) -> Result<Method> {
        let method = self.method.as_deref().unwrap_or("POST");
        Method::from_bytes(method.to_ascii_uppercase().as_bytes()).map_err(|_| {
            CtfError::InvalidConfigValueError {
                field: "blind.method".to_string(),
                value: method.to_string(),
                reason: "not an HTTP method".to_string(),
            }
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_attempts: self.retry_attempts,
            delay: self
                .retry_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.delay),
        }
    }
}

impl Validate for SolverConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}
