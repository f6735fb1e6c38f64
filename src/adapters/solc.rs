use crate::utils::error::{CtfError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::process::Command;

/// `path/File.sol:Name`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractRef {
    pub file: PathBuf,
    pub name: String,
}

impl ContractRef {
    pub fn parse(spec: &str) -> Result<Self> {
        let (file, name) = spec
            .rsplit_once(':')
            .filter(|(file, name)| !file.is_empty() && !name.is_empty())
            .ok_or_else(|| CtfError::InvalidConfigValueError {
                field: "contract".to_string(),
                value: spec.to_string(),
                reason: "expected <file>:<ContractName>".to_string(),
            })?;
        Ok(Self {
            file: PathBuf::from(file),
            name: name.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct CompiledContract {
    pub abi: serde_json::Value,
    pub bin: String,
}

#[derive(Debug, Deserialize)]
struct CombinedOutput {
    contracts: HashMap<String, CombinedContract>,
}

#[derive(Debug, Deserialize)]
struct CombinedContract {
    #[serde(default)]
    abi: serde_json::Value,
    #[serde(default)]
    bin: String,
}

/// Picks `name` out of `solc --combined-json abi,bin` output.
pub fn parse_combined_json(output: &str, name: &str) -> Result<CompiledContract> {
    let parsed: CombinedOutput = serde_json::from_str(output)?;
    let suffix = format!(":{}", name);

    let (_, contract) = parsed
        .contracts
        .into_iter()
        .find(|(key, _)| key.ends_with(&suffix))
        .ok_or_else(|| CtfError::processing(format!("contract {} not found", name)))?;

    // 舊版 solc 會把 abi 當成字串輸出
    let abi = match contract.abi {
        serde_json::Value::String(text) => serde_json::from_str(&text)?,
        other => other,
    };
    Ok(CompiledContract {
        abi,
        bin: contract.bin,
    })
}

/// Runs `solc` on the contract's file.
pub async fn compile(contract: &ContractRef) -> Result<CompiledContract> {
    tracing::info!("Compiling {}:{}", contract.file.display(), contract.name);
    let output = Command::new("solc")
        .arg("--combined-json")
        .arg("abi,bin")
        .arg(&contract.file)
        .output()
        .await
        .map_err(|e| CtfError::ProcessError {
            message: format!("failed to run solc: {}", e),
        })?;

    if !output.status.success() {
        return Err(CtfError::ProcessError {
            message: format!(
                "solc exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    parse_combined_json(&String::from_utf8_lossy(&output.stdout), &contract.name)
}
