use anyhow::Context;
use clap::Parser;
use ctfify::adapters::ctfd::CtfdClient;
use ctfify::adapters::ctftime::{select_keys, CtftimeClient};
use ctfify::adapters::http::BaseApi;
use ctfify::adapters::rpc::{
    decode_address, decode_bool, decode_uint, encode_call, parse_ether, to_hex, Account, Address,
    Contract, RpcClient, TransactionRequest,
};
use ctfify::adapters::server::CallbackServer;
use ctfify::config::cli::{
    BlindArgs, ConnectArgs, CtftimeCommand, GetArgs, RawArgs, ReturnKind, RpcCommand, ServeArgs,
    TemplateArgs,
};
use ctfify::template::TemplateContext;
use ctfify::utils::error::{CtfError, ErrorSeverity};
use ctfify::utils::{logger, validation::Validate};
use ctfify::{CliConfig, SolverConfig};
use reqwest::Method;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CliConfig::parse();

    // 初始化日誌
    if config.json_logs {
        logger::init_json_logger(config.verbose);
    } else {
        logger::init_cli_logger(config.verbose);
    }

    tracing::info!("Starting ctfify CLI");
    if config.verbose {
        tracing::debug!("CLI config: {:?}", config);
    }

    // 驗證配置
    if let Err(e) = config.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
        eprintln!("❌ {}", e.user_friendly_message());
        std::process::exit(1);
    }

    let result = match config.command {
        ctfify::config::Command::Template(args) => template(args),
        ctfify::config::Command::Raw(args) => raw(args),
        ctfify::config::Command::Blind(args) => blind(args).await,
        ctfify::config::Command::Serve(args) => serve(args).await,
        ctfify::config::Command::Connect(args) => connect(args).await,
        ctfify::config::Command::Rpc(command) => rpc(command).await,
        ctfify::config::Command::Get(args) => get(args).await,
        ctfify::config::Command::Ctftime(command) => ctftime(command).await,
    };

    if let Err(e) = result {
        let Some(ctf_error) = e.downcast_ref::<CtfError>() else {
            tracing::error!("❌ {:#}", e);
            eprintln!("❌ {:#}", e);
            std::process::exit(1);
        };

        // 記錄詳細錯誤信息
        tracing::error!(
            "❌ Command failed: {:#} (Category: {:?}, Severity: {:?})",
            e,
            ctf_error.category(),
            ctf_error.severity()
        );
        tracing::error!("💡 Recovery suggestion: {}", ctf_error.recovery_suggestion());

        eprintln!("❌ {}", ctf_error.user_friendly_message());
        eprintln!("💡 建議: {}", ctf_error.recovery_suggestion());

        // 根據錯誤嚴重程度決定退出碼
        let exit_code = match ctf_error.severity() {
            ErrorSeverity::Low => 0,      // 警告，但成功
            ErrorSeverity::Medium => 2,   // 網路錯誤，可重試
            ErrorSeverity::High => 1,     // 處理錯誤
            ErrorSeverity::Critical => 3, // 系統錯誤
        };

        if exit_code > 0 {
            std::process::exit(exit_code);
        }
    }

    Ok(())
}

fn template(args: TemplateArgs) -> anyhow::Result<()> {
    let mut context = TemplateContext {
        name: args.name,
        url: args.url,
        ..TemplateContext::default()
    };
    if let Some(crate_path) = args.crate_path {
        context.crate_path = crate_path;
    }
    let report = args.kind.write_to(&args.dest, &context);

    for path in &report.written {
        println!("✅ {}", path.display());
    }
    for e in &report.errors {
        eprintln!("⚠️  {}", e.user_friendly_message());
    }

    match report.errors.into_iter().max_by_key(|e| e.severity()) {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn raw(args: RawArgs) -> anyhow::Result<()> {
    let api = BaseApi::new(&args.url)?;
    let method = Method::from_bytes(args.method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("invalid HTTP method {}", args.method))?;

    let bytes = api.make_raw_request(method, &args.path, |mut builder| {
        for (name, value) in &args.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !args.query.is_empty() {
            builder = builder.query(&args.query);
        }
        if !args.data.is_empty() {
            builder = builder.form(&args.data);
        }
        builder
    })?;

    print!("{}", String::from_utf8_lossy(&bytes));
    Ok(())
}

async fn blind(args: BlindArgs) -> anyhow::Result<()> {
    let config = SolverConfig::from_file(&args.config)
        .with_context(|| format!("loading solver profile {}", args.config.display()))?;
    config.validate()?;

    let extractor = config.build_extractor()?;
    let known = args
        .known
        .or_else(|| config.blind.as_ref().and_then(|b| b.known.clone()))
        .unwrap_or_default();

    tracing::info!(
        "🔍 Extracting from {} with {} candidate characters",
        config.target_section()?.url,
        extractor.charset().len()
    );
    let values = extractor.extract(&known).await?;
    if values.is_empty() {
        tracing::warn!("No value matched the known prefix {:?}", known);
    }
    for value in values {
        println!("{}", value);
    }
    Ok(())
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let settings = args.settings()?;
    let mut server = CallbackServer::new(settings.port).with_bind(settings.bind);
    if let Some(path) = &settings.index {
        let template = std::fs::read_to_string(path)
            .with_context(|| format!("reading index page {}", path.display()))?;
        let host = if settings.bind.is_unspecified() {
            "127.0.0.1".to_string()
        } else {
            settings.bind.to_string()
        };
        let url = format!("http://{}:{}/", host, settings.port);
        let port = settings.port.to_string();
        server = server.with_index_template(&template, &[("url", url.as_str()), ("port", port.as_str())]);
    }

    let mut handle = server.spawn().await?;
    println!("🌐 Listening on {} (Ctrl-C to stop)", handle.url());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            request = handle.recv() => match request {
                Some(request) => println!("{}", serde_json::to_string(&request)?),
                None => break,
            },
        }
    }

    handle.shutdown().await?;
    Ok(())
}

async fn connect(args: ConnectArgs) -> anyhow::Result<()> {
    let mut tube = args.target()?.connect().await?;
    tube.interactive().await?;
    if let Some(status) = tube.wait().await? {
        tracing::info!("Process exited with {}", status);
    }
    Ok(())
}

async fn rpc(command: RpcCommand) -> anyhow::Result<()> {
    let settings = command.rpc_args().settings()?;
    let client = Arc::new(RpcClient::new(settings.url.as_str()));

    match command {
        RpcCommand::Accounts { .. } => {
            for address in client.accounts().await? {
                println!("{}", address);
            }
        }
        RpcCommand::Balance { address, .. } => {
            println!("{}", client.get_balance(address).await?);
        }
        RpcCommand::Call {
            to,
            signature,
            args,
            returns,
            ..
        } => {
            let tx = TransactionRequest {
                to: Some(to),
                data: Some(to_hex(&encode_call(&signature, &args))),
                ..TransactionRequest::default()
            };
            let output = client.call(&tx).await?;
            match returns {
                ReturnKind::Raw => println!("{}", to_hex(&output)),
                ReturnKind::Bool => println!("{}", decode_bool(&output, 0)?),
                ReturnKind::Uint => println!("{}", decode_uint(&output, 0)?),
                ReturnKind::Address => println!("{}", decode_address(&output, 0)?),
            }
        }
        RpcCommand::Send {
            to,
            signature,
            args,
            value,
            ..
        } => {
            let account = Account::load(client, settings.private_key.as_deref()).await?;
            let receipt = Contract::at(account, to)
                .transact_and_wait(&signature, &args, parse_ether(&value)?)
                .await?;
            println!("✅ {}", receipt.transaction_hash);
        }
        RpcCommand::Solved { setup, .. } => {
            let setup = setup.or(settings.setup_address).ok_or_else(|| {
                CtfError::MissingConfigError {
                    field: "--setup or rpc.setup_address".to_string(),
                }
            })?;
            // eth_call 不需要簽名，from 用零地址即可
            let account = Account::new(client, Address::default());
            let solved = Contract::at(account, setup)
                .call_bool("isSolved()", &[])
                .await?;
            println!("{}", if solved { "✅ solved" } else { "❌ not solved" });
        }
    }
    Ok(())
}

async fn get(args: GetArgs) -> anyhow::Result<()> {
    let mut client = CtfdClient::new(&args.url)?.with_concurrency(args.concurrency);
    if let Some(crate_path) = &args.crate_path {
        client = client.with_crate_path(crate_path);
    }
    client.login(&args.credentials()).await?;

    let report = client.download_all(&args.filter(), &args.dest).await?;
    for dir in &report.saved {
        println!("✅ {}", dir.display());
    }
    for e in &report.errors {
        eprintln!("⚠️  {}", e.user_friendly_message());
    }

    match report.errors.into_iter().max_by_key(|e| e.severity()) {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

async fn ctftime(command: CtftimeCommand) -> anyhow::Result<()> {
    let CtftimeCommand::Events(args) = command;
    let events = CtftimeClient::new()?
        .events_by_date(args.limit, &args.start, &args.finish)
        .await?;
    let events = args.filter().apply(events)?;
    tracing::info!("{} events matched", events.len());

    let output = if args.print_keys.is_empty() {
        serde_json::to_string_pretty(&events)?
    } else {
        serde_json::to_string_pretty(&select_keys(&events, &args.print_keys)?)?
    };
    println!("{}", output);
    Ok(())
}
