use anyhow::Result;
use ctfify::template::{TemplateContext, TemplateKind};
use ctfify::utils::error::{CtfError, ErrorSeverity};
use tempfile::TempDir;

fn context() -> TemplateContext {
    TemplateContext {
        name: "baby-sqli".to_string(),
        url: "http://94.237.1.2:31337".to_string(),
        ..TemplateContext::default()
    }
}

#[test]
fn test_write_web_sql_template() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let report = TemplateKind::WebSql.write_to(temp_dir.path(), &context());

    assert!(report.is_ok(), "errors: {:?}", report.errors);
    let manifest = std::fs::read_to_string(temp_dir.path().join("Cargo.toml"))?;
    let main = std::fs::read_to_string(temp_dir.path().join("src/main.rs"))?;

    assert!(manifest.contains("name = \"baby-sqli\""));
    assert!(manifest.contains(&format!(
        "ctfify = {{ path = \"{}\" }}",
        env!("CARGO_MANIFEST_DIR")
    )));
    assert!(main.contains("http://94.237.1.2:31337"));
    assert!(!main.contains("{{url}}"));
    assert!(!temp_dir.path().join("src/main.rs.tmpl").exists());
    Ok(())
}

#[test]
fn test_existing_files_are_skipped() -> Result<()> {
    let temp_dir = TempDir::new()?;
    std::fs::create_dir_all(temp_dir.path().join("src"))?;
    std::fs::write(temp_dir.path().join("src/main.rs"), "// my exploit")?;

    let report = TemplateKind::Pwn.write_to(temp_dir.path(), &context());

    assert!(!report.is_ok());
    assert_eq!(report.errors.len(), 1);
    assert!(matches!(
        report.errors[0],
        CtfError::TemplateExistsError { .. }
    ));
    assert_eq!(report.errors[0].severity(), ErrorSeverity::Low);
    assert!(temp_dir.path().join("Cargo.toml").exists());
    assert_eq!(
        std::fs::read_to_string(temp_dir.path().join("src/main.rs"))?,
        "// my exploit"
    );
    Ok(())
}

#[test]
fn test_every_template_writes() -> Result<()> {
    for kind in TemplateKind::all() {
        let temp_dir = TempDir::new()?;
        let report = kind.write_to(temp_dir.path(), &TemplateContext::default());
        assert!(report.is_ok(), "{:?}: {:?}", kind, report.errors);
        assert_eq!(report.written.len(), kind.files().len());
    }
    Ok(())
}

#[test]
fn test_readflag_template() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let report = TemplateKind::Readflag.write_to(temp_dir.path(), &context());
    assert!(report.is_ok());
    assert!(temp_dir.path().join("readflag.c").exists());
    Ok(())
}

#[test]
fn test_manifest_points_at_given_crate_path() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let context = TemplateContext {
        crate_path: "/opt/ctfify".into(),
        ..context()
    };
    let report = TemplateKind::Web3.write_to(temp_dir.path(), &context);
    assert!(report.is_ok(), "errors: {:?}", report.errors);

    let manifest: toml::Value =
        toml::from_str(&std::fs::read_to_string(temp_dir.path().join("Cargo.toml"))?)?;
    assert_eq!(manifest["dependencies"]["ctfify"]["path"].as_str(), Some("/opt/ctfify"));
    Ok(())
}

#[test]
fn test_poc_template() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let report = TemplateKind::Poc.write_to(temp_dir.path(), &context());
    assert!(report.is_ok(), "errors: {:?}", report.errors);

    let main = std::fs::read_to_string(temp_dir.path().join("src/main.rs"))?;
    assert!(main.contains("/wp-login.php"));
    assert!(main.contains("http://94.237.1.2:31337"));
    assert!(temp_dir.path().join("REPORT.md").exists());
    Ok(())
}

#[test]
fn test_web3_writeup_template() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let report = TemplateKind::Web3Writeup.write_to(temp_dir.path(), &context());
    assert!(report.is_ok(), "errors: {:?}", report.errors);

    let main = std::fs::read_to_string(temp_dir.path().join("src/main.rs"))?;
    assert!(main.contains("../contracts/Setup.sol:Setup"));
    assert!(main.contains("PRIVKEY"));
    let hack = std::fs::read_to_string(temp_dir.path().join("Hack.sol"))?;
    assert!(hack.contains("function hack()"));
    Ok(())
}
