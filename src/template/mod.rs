//! Solver project scaffolding from templates embedded in the binary.

use crate::utils::error::{CtfError, Result};
use rust_embed::RustEmbed;
use std::path::{Path, PathBuf};

#[derive(RustEmbed)]
#[folder = "templates/"]
struct Templates;

const TEMPLATE_SUFFIX: &str = ".tmpl";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum TemplateKind {
    /// HTTP client solver
    Web,
    /// Blind SQL injection brute forcer
    WebSql,
    /// Solver with a background callback server
    WebServer,
    /// Process/socket exploit
    Pwn,
    /// Smart-contract solver
    Web3,
    /// Web3 writeup: deploys a Hack contract against the challenge Setup
    Web3Writeup,
    /// setuid flag reader for challenge containers
    Readflag,
    /// Proof of concept plus report notes
    Poc,
}

impl TemplateKind {
    pub fn all() -> [TemplateKind; 8] {
        [
            TemplateKind::Web,
            TemplateKind::WebSql,
            TemplateKind::WebServer,
            TemplateKind::Pwn,
            TemplateKind::Web3,
            TemplateKind::Web3Writeup,
            TemplateKind::Readflag,
            TemplateKind::Poc,
        ]
    }

    /// Solver skeleton for a platform category name, if one fits.
    pub fn for_category(category: &str) -> Option<TemplateKind> {
        let category = category.to_ascii_lowercase();
        if category.contains("web3") || category.contains("blockchain") {
            Some(TemplateKind::Web3)
        } else if category.contains("web") {
            Some(TemplateKind::Web)
        } else if category.contains("pwn") || category.contains("binary") {
            Some(TemplateKind::Pwn)
        } else {
            None
        }
    }

    pub fn dir(&self) -> &'static str {
        match self {
            TemplateKind::Web => "solver/web",
            TemplateKind::WebSql => "solver/web-sql",
            TemplateKind::WebServer => "solver/web-server",
            TemplateKind::Pwn => "solver/pwn",
            TemplateKind::Web3 => "solver/web3",
            TemplateKind::Web3Writeup => "challenges/web3/writeup",
            TemplateKind::Readflag => "others/readflag",
            TemplateKind::Poc => "others/poc",
        }
    }

    /// Embedded files of this kind, relative to its directory, sorted.
    pub fn files(&self) -> Vec<String> {
        let prefix = format!("{}/", self.dir());
        let mut files: Vec<String> = Templates::iter()
            .filter_map(|path| path.strip_prefix(&prefix).map(str::to_string))
            .collect();
        files.sort();
        files
    }

    pub fn write_to(&self, destination: &Path, context: &TemplateContext) -> WriteReport {
        let mut report = WriteReport::default();
        let files = self.files();
        if files.is_empty() {
            report.errors.push(CtfError::TemplateError {
                message: format!("no embedded files for {}", self.dir()),
            });
            return report;
        }

        for relative in files {
            match self.write_file(&relative, destination, context) {
                Ok(path) => {
                    tracing::info!("Template written to destination: {}", path.display());
                    report.written.push(path);
                }
                Err(e) => {
                    tracing::error!("{}", e);
                    report.errors.push(e);
                }
            }
        }
        report
    }

    fn write_file(
        &self,
        relative: &str,
        destination: &Path,
        context: &TemplateContext,
    ) -> Result<PathBuf> {
        let source = format!("{}/{}", self.dir(), relative);
        let file = embedded(&source)?;

        let target = destination.join(relative.strip_suffix(TEMPLATE_SUFFIX).unwrap_or(relative));
        if target.exists() {
            return Err(CtfError::TemplateExistsError {
                path: target.display().to_string(),
            });
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // 不是 UTF-8 的檔案原樣複製
        let contents = match std::str::from_utf8(&file) {
            Ok(text) => render_placeholders(text, &context.vars()).into_bytes(),
            Err(_) => file,
        };
        std::fs::write(&target, contents)?;
        Ok(target)
    }
}

fn embedded(source: &str) -> Result<Vec<u8>> {
    Templates::get(source)
        .map(|file| file.data.into_owned())
        .ok_or_else(|| CtfError::TemplateError {
            message: format!("missing embedded file {}", source),
        })
}

/// Renders one embedded text file, e.g. `challenge/README.md.tmpl`.
pub fn render_file<K: AsRef<str>, V: AsRef<str>>(source: &str, vars: &[(K, V)]) -> Result<String> {
    let data = embedded(source)?;
    let text = String::from_utf8(data).map_err(|_| CtfError::TemplateError {
        message: format!("{} is not UTF-8", source),
    })?;
    Ok(render_placeholders(&text, vars))
}

#[derive(Debug, Clone)]
pub struct TemplateContext {
    pub name: String,
    pub url: String,
    /// Path dependency written into generated manifests.
    pub crate_path: PathBuf,
}

impl Default for TemplateContext {
    fn default() -> Self {
        Self {
            name: "solve".to_string(),
            url: "http://localhost:80".to_string(),
            crate_path: PathBuf::from(env!("CARGO_MANIFEST_DIR")),
        }
    }
}

impl TemplateContext {
    fn vars(&self) -> [(&'static str, String); 3] {
        // TOML 字串裡反斜線是跳脫字元
        let crate_path = self.crate_path.display().to_string().replace('\\', "/");
        [
            ("name", self.name.clone()),
            ("url", self.url.clone()),
            ("crate_path", crate_path),
        ]
    }
}

#[derive(Debug, Default)]
pub struct WriteReport {
    pub written: Vec<PathBuf>,
    pub errors: Vec<CtfError>,
}

impl WriteReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Replaces every `{{key}}` with its value. Unknown keys stay as they are.
pub fn render_placeholders<K: AsRef<str>, V: AsRef<str>>(template: &str, vars: &[(K, V)]) -> String {
    vars.iter().fold(template.to_string(), |text, (key, value)| {
        text.replace(&format!("{{{{{}}}}}", key.as_ref()), value.as_ref())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_placeholders() {
        let rendered = render_placeholders(
            "target={{url}} name={{name}} keep={{other}} fmt={}",
            &[("url", "http://x"), ("name", "solve")],
        );
        assert_eq!(rendered, "target=http://x name=solve keep={{other}} fmt={}");
    }

    #[test]
    fn test_every_kind_has_files() {
        for kind in TemplateKind::all() {
            assert!(!kind.files().is_empty(), "{:?} has no files", kind);
        }
        assert!(TemplateKind::Pwn
            .files()
            .contains(&"src/main.rs.tmpl".to_string()));
        assert!(TemplateKind::Web3Writeup
            .files()
            .contains(&"Hack.sol.tmpl".to_string()));
    }

    #[test]
    fn test_for_category() {
        assert_eq!(TemplateKind::for_category("Web Exploitation"), Some(TemplateKind::Web));
        assert_eq!(TemplateKind::for_category("blockchain"), Some(TemplateKind::Web3));
        assert_eq!(TemplateKind::for_category("PWN"), Some(TemplateKind::Pwn));
        assert_eq!(TemplateKind::for_category("crypto"), None);
    }

    #[test]
    fn test_crate_path_uses_forward_slashes() {
        let context = TemplateContext {
            crate_path: PathBuf::from("C:\\tools\\ctfify"),
            ..TemplateContext::default()
        };
        let vars = context.vars();
        assert_eq!(vars[2], ("crate_path", "C:/tools/ctfify".to_string()));
    }

    #[test]
    fn test_render_challenge_readme() {
        let readme = render_file(
            "challenge/README.md.tmpl",
            &[("name", "baby"), ("category", "web"), ("value", "100")],
        )
        .unwrap();
        assert!(readme.contains("baby"));
        assert!(!readme.contains("{{name}}"));
        assert!(render_file("challenge/missing.tmpl", &[("a", "b")]).is_err());
    }
}
