use crate::adapters::ctfd::{ChallengeFilter, Credentials};
use crate::adapters::ctftime::EventFilter;
use crate::adapters::rpc::{Address, Token};
use crate::adapters::tube::Target;
use crate::config::SolverConfig;
use crate::template::TemplateKind;
use crate::utils::error::{CtfError, Result};
use crate::utils::validation::{self, Validate};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::net::IpAddr;
use std::path::PathBuf;

pub const DEFAULT_RPC_URL: &str = "http://127.0.0.1:8545";
pub const DEFAULT_SERVE_PORT: u16 = 6666;

#[derive(Debug, Clone, Parser)]
#[command(name = "ctfify")]
#[command(about = "Scaffolding and helpers for CTF challenge solvers")]
#[command(version)]
pub struct CliConfig {
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Emit logs as JSON lines")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Write a solver project skeleton
    Template(TemplateArgs),
    /// Print the raw HTTP request a solver would send
    Raw(RawArgs),
    /// Run blind LIKE extraction described by a solver profile
    Blind(BlindArgs),
    /// Start the callback server and log every request
    Serve(ServeArgs),
    /// Open an interactive tube to a remote service or local binary
    Connect(ConnectArgs),
    /// Talk to an Ethereum JSON-RPC node
    #[command(subcommand)]
    Rpc(RpcCommand),
    /// Download CTFd challenges into <host>/<category>/<name>
    Get(GetArgs),
    /// Look up events on CTFtime
    #[command(subcommand)]
    Ctftime(CtftimeCommand),
}

#[derive(Debug, Clone, Args)]
pub struct TemplateArgs {
    #[arg(value_enum)]
    pub kind: TemplateKind,

    #[arg(short, long, default_value = ".")]
    pub dest: PathBuf,

    #[arg(short, long, default_value = "solve")]
    pub name: String,

    #[arg(short, long, default_value = "http://localhost:80")]
    pub url: String,

    /// ctfify checkout the solver depends on (defaults to this build's source)
    #[arg(long)]
    pub crate_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct RawArgs {
    #[arg(long)]
    pub url: String,

    #[arg(short = 'X', long, default_value = "GET")]
    pub method: String,

    #[arg(long, default_value = "/")]
    pub path: String,

    /// Form field, `key=value`
    #[arg(short = 'd', long = "data", value_parser = parse_key_value)]
    pub data: Vec<(String, String)>,

    /// Query parameter, `key=value`
    #[arg(short = 'q', long = "query", value_parser = parse_key_value)]
    pub query: Vec<(String, String)>,

    /// Extra header, `Name: value`
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Args)]
pub struct BlindArgs {
    #[arg(short, long, default_value = "solver.toml")]
    pub config: PathBuf,

    /// Overrides `blind.known` from the profile
    #[arg(long)]
    pub known: Option<String>,
}

fn load_profile(path: Option<&PathBuf>) -> Result<Option<SolverConfig>> {
    path.map(|path| {
        let config = SolverConfig::from_file(path)?;
        config.validate_config()?;
        Ok(config)
    })
    .transpose()
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Overrides `server.port` (default 6666)
    #[arg(short, long)]
    pub port: Option<u16>,

    #[arg(long, default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// HTML file served on `/`, `{{url}}` is replaced with the server URL
    #[arg(long)]
    pub index: Option<PathBuf>,

    /// Solver profile with a `[server]` section
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeSettings {
    pub port: u16,
    pub bind: IpAddr,
    pub index: Option<PathBuf>,
}

impl ServeArgs {
    /// Flags win over the profile, the profile over defaults.
    pub fn settings(&self) -> Result<ServeSettings> {
        let section = load_profile(self.config.as_ref())?.and_then(|config| config.server);
        Ok(ServeSettings {
            port: self
                .port
                .or_else(|| section.as_ref().and_then(|s| s.port))
                .unwrap_or(DEFAULT_SERVE_PORT),
            bind: self.bind,
            index: self
                .index
                .clone()
                .or_else(|| section.and_then(|s| s.index)),
        })
    }
}

#[derive(Debug, Clone, Args)]
pub struct ConnectArgs {
    #[arg(long, num_args = 2, value_names = ["HOST", "PORT"], conflicts_with = "process")]
    pub remote: Option<Vec<String>>,

    #[arg(long)]
    pub process: Option<String>,

    /// Arguments passed to the local process
    #[arg(last = true)]
    pub args: Vec<String>,
}

impl ConnectArgs {
    pub fn target(&self) -> Result<Target> {
        match (&self.remote, &self.process) {
            (Some(remote), _) => {
                let [host, port] = remote.as_slice() else {
                    return Err(CtfError::InvalidConfigValueError {
                        field: "remote".to_string(),
                        value: remote.join(" "),
                        reason: "expected HOST PORT".to_string(),
                    });
                };
                let port = port.parse::<u16>().map_err(|_| CtfError::InvalidConfigValueError {
                    field: "remote".to_string(),
                    value: port.clone(),
                    reason: "port must be a number between 1 and 65535".to_string(),
                })?;
                validation::validate_range("remote", port, 1, u16::MAX)?;
                Ok(Target::Remote {
                    host: host.clone(),
                    port,
                })
            }
            (None, Some(program)) => Ok(Target::Process {
                program: program.clone(),
                args: self.args.clone(),
            }),
            (None, None) => Err(CtfError::MissingConfigError {
                field: "--remote or --process".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct RpcArgs {
    /// Overrides `rpc.url` (default http://127.0.0.1:8545)
    #[arg(long)]
    pub rpc: Option<String>,

    /// Solver profile with an `[rpc]` section
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcSettings {
    pub url: String,
    pub private_key: Option<String>,
    pub setup_address: Option<Address>,
}

impl RpcArgs {
    pub fn settings(&self) -> Result<RpcSettings> {
        let section = load_profile(self.config.as_ref())?.and_then(|config| config.rpc);
        let url = self
            .rpc
            .clone()
            .or_else(|| section.as_ref().map(|s| s.url.clone()))
            .unwrap_or_else(|| DEFAULT_RPC_URL.to_string());
        let (private_key, setup_address) = section
            .map(|s| (s.private_key, s.setup_address))
            .unwrap_or_default();
        Ok(RpcSettings {
            url,
            private_key,
            setup_address,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReturnKind {
    Raw,
    Bool,
    Uint,
    Address,
}

#[derive(Debug, Clone, Subcommand)]
pub enum RpcCommand {
    /// List node-managed accounts
    Accounts {
        #[command(flatten)]
        rpc: RpcArgs,
    },
    /// Balance of an address in wei
    Balance {
        #[command(flatten)]
        rpc: RpcArgs,
        address: Address,
    },
    /// eth_call a function by signature, e.g. `balanceOf(address)`
    Call {
        #[command(flatten)]
        rpc: RpcArgs,
        #[arg(long)]
        to: Address,
        signature: String,
        /// Arguments: 0x-address, true/false, or decimal integer
        #[arg(value_parser = parse_token)]
        args: Vec<Token>,
        #[arg(long, value_enum, default_value_t = ReturnKind::Raw)]
        returns: ReturnKind,
    },
    /// Send a transaction calling `signature` and wait for the receipt
    Send {
        #[command(flatten)]
        rpc: RpcArgs,
        #[arg(long)]
        to: Address,
        signature: String,
        #[arg(value_parser = parse_token)]
        args: Vec<Token>,
        /// Ether attached to the call, e.g. `1` or `0.5`
        #[arg(long, default_value = "0")]
        value: String,
    },
    /// Ask a challenge Setup contract whether it is solved
    Solved {
        #[command(flatten)]
        rpc: RpcArgs,
        /// Overrides `rpc.setup_address`
        #[arg(long)]
        setup: Option<Address>,
    },
}

impl RpcCommand {
    pub fn rpc_args(&self) -> &RpcArgs {
        match self {
            RpcCommand::Accounts { rpc }
            | RpcCommand::Balance { rpc, .. }
            | RpcCommand::Call { rpc, .. }
            | RpcCommand::Send { rpc, .. }
            | RpcCommand::Solved { rpc, .. } => rpc,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct GetArgs {
    /// CTFd base URL
    #[arg(short, long)]
    pub url: String,

    #[arg(short = 's', long)]
    pub username: String,

    #[arg(short, long)]
    pub password: String,

    /// Only this category (case-insensitive)
    #[arg(short = 'c', long)]
    pub filter_category: Option<String>,

    /// Only challenges this account already solved
    #[arg(short, long)]
    pub only_solved: bool,

    #[arg(short, long, default_value = ".")]
    pub dest: PathBuf,

    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// ctfify checkout the generated solvers depend on
    #[arg(long)]
    pub crate_path: Option<PathBuf>,
}

impl GetArgs {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    pub fn filter(&self) -> ChallengeFilter {
        ChallengeFilter {
            category: self.filter_category.clone(),
            only_solved: self.only_solved,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum CtftimeCommand {
    /// Events between two dates
    Events(EventsArgs),
}

#[derive(Debug, Clone, Args)]
pub struct EventsArgs {
    /// e.g. 'May 2, 2023'
    #[arg(long)]
    pub start: String,

    /// e.g. 'December 20, 2023'
    #[arg(long)]
    pub finish: String,

    #[arg(long, default_value_t = 100)]
    pub limit: u32,

    #[arg(long)]
    pub organizer: Option<String>,

    #[arg(long)]
    pub title: Option<String>,

    #[arg(long)]
    pub description: Option<String>,

    /// ISO weekdays, Monday = 1 (e.g. `6,7`)
    #[arg(long, value_delimiter = ',')]
    pub days: Vec<u32>,

    /// Print only these event keys
    #[arg(long, value_delimiter = ',')]
    pub print_keys: Vec<String>,
}

impl EventsArgs {
    pub fn filter(&self) -> EventFilter {
        EventFilter {
            organizer: self.organizer.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            weekdays: self.days.clone(),
        }
    }
}

impl Validate for CliConfig {
    fn validate(&self) -> Result<()> {
        match &self.command {
            Command::Template(args) => {
                validation::validate_non_empty_string("name", &args.name)?;
                crate::adapters::http::normalize_base_url(&args.url)?;
            }
            Command::Raw(args) => {
                crate::adapters::http::normalize_base_url(&args.url)?;
                validation::validate_non_empty_string("method", &args.method)?;
            }
            Command::Blind(_) => {}
            Command::Serve(args) => {
                if let Some(port) = args.port {
                    validation::validate_range("port", port, 1, u16::MAX)?;
                }
            }
            Command::Connect(args) => {
                args.target()?;
            }
            Command::Rpc(command) => {
                if let Some(url) = &command.rpc_args().rpc {
                    validation::validate_url("rpc", url)?;
                }
            }
            Command::Get(args) => {
                crate::adapters::http::normalize_base_url(&args.url)?;
                validation::validate_non_empty_string("username", &args.username)?;
                validation::validate_positive_number("concurrency", args.concurrency, 1)?;
            }
            Command::Ctftime(CtftimeCommand::Events(args)) => {
                for day in &args.days {
                    validation::validate_range("days", *day, 1, 7)?;
                }
            }
        }
        Ok(())
    }
}

fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected key=value, got `{}`", s))
}

fn parse_header(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once(':')
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| format!("expected `Name: value`, got `{}`", s))
}

fn parse_token(s: &str) -> std::result::Result<Token, String> {
    if s.starts_with("0x") && s.len() == 42 {
        return s.parse::<Address>().map(Token::Address).map_err(|e| e.to_string());
    }
    match s {
        "true" => Ok(Token::Bool(true)),
        "false" => Ok(Token::Bool(false)),
        _ => s
            .parse::<u128>()
            .map(Token::Uint)
            .map_err(|_| format!("cannot encode `{}` as address, bool or uint", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_template_command() {
        let config =
            CliConfig::try_parse_from(["ctfify", "template", "web-sql", "--url", "http://chall:8080"])
                .unwrap();
        match config.command {
            Command::Template(args) => {
                assert_eq!(args.kind, TemplateKind::WebSql);
                assert_eq!(args.dest, PathBuf::from("."));
                assert_eq!(args.url, "http://chall:8080");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_raw_command() {
        let config = CliConfig::try_parse_from([
            "ctfify",
            "raw",
            "--url",
            "localhost:8000",
            "-X",
            "POST",
            "-d",
            "username=admin",
            "-H",
            "X-Forwarded-For: 127.0.0.1",
            "--verbose",
        ])
        .unwrap();
        assert!(config.verbose);
        assert!(config.validate().is_ok());
        let Command::Raw(args) = config.command else {
            panic!("expected raw command");
        };
        assert_eq!(args.data, vec![("username".to_string(), "admin".to_string())]);
        assert_eq!(
            args.headers,
            vec![("X-Forwarded-For".to_string(), "127.0.0.1".to_string())]
        );
    }

    #[test]
    fn test_connect_target() {
        let config =
            CliConfig::try_parse_from(["ctfify", "connect", "--remote", "chall.local", "1337"])
                .unwrap();
        let Command::Connect(args) = &config.command else {
            panic!("expected connect command");
        };
        assert_eq!(
            args.target().unwrap(),
            Target::Remote {
                host: "chall.local".to_string(),
                port: 1337
            }
        );

        let config = CliConfig::try_parse_from([
            "ctfify", "connect", "--process", "./chall", "--", "-x",
        ])
        .unwrap();
        let Command::Connect(args) = &config.command else {
            panic!("expected connect command");
        };
        assert_eq!(
            args.target().unwrap(),
            Target::Process {
                program: "./chall".to_string(),
                args: vec!["-x".to_string()]
            }
        );

        let config = CliConfig::try_parse_from(["ctfify", "connect"]).unwrap();
        assert!(config.validate().is_err());

        let config =
            CliConfig::try_parse_from(["ctfify", "connect", "--remote", "host", "http"]).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_rpc_call() {
        let config = CliConfig::try_parse_from([
            "ctfify",
            "rpc",
            "call",
            "--to",
            "0x5FbDB2315678afecb367f032d93F642f64180aa3",
            "balanceOf(address)",
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266",
            "--returns",
            "uint",
        ])
        .unwrap();
        assert!(config.validate().is_ok());
        let Command::Rpc(RpcCommand::Call { args, returns, rpc, .. }) = config.command else {
            panic!("expected rpc call");
        };
        assert_eq!(rpc.settings().unwrap().url, DEFAULT_RPC_URL);
        assert_eq!(returns, ReturnKind::Uint);
        assert!(matches!(args[0], Token::Address(_)));
    }

    #[test]
    fn test_parse_token() {
        assert_eq!(parse_token("true").unwrap(), Token::Bool(true));
        assert_eq!(parse_token("42").unwrap(), Token::Uint(42));
        assert!(parse_token("nope").is_err());
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_header(": empty").is_err());
    }

    fn profile(contents: &str) -> tempfile::NamedTempFile {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    const PROFILE: &str = r#"
[rpc]
url = "http://10.0.0.5:8545"
private_key = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
setup_address = "0x5fbdb2315678afecb367f032d93f642f64180aa3"

[server]
port = 9000
index = "xss.html"
"#;

    #[test]
    fn test_serve_settings_from_profile() {
        let file = profile(PROFILE);
        let path = file.path().to_str().unwrap();

        let config = CliConfig::try_parse_from(["ctfify", "serve", "--config", path]).unwrap();
        let Command::Serve(args) = &config.command else {
            panic!("expected serve command");
        };
        let settings = args.settings().unwrap();
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.index, Some(PathBuf::from("xss.html")));

        let config =
            CliConfig::try_parse_from(["ctfify", "serve", "--config", path, "-p", "7000"]).unwrap();
        let Command::Serve(args) = &config.command else {
            panic!("expected serve command");
        };
        assert_eq!(args.settings().unwrap().port, 7000);

        let config = CliConfig::try_parse_from(["ctfify", "serve"]).unwrap();
        let Command::Serve(args) = &config.command else {
            panic!("expected serve command");
        };
        assert_eq!(args.settings().unwrap().port, DEFAULT_SERVE_PORT);
    }

    #[test]
    fn test_rpc_settings_from_profile() {
        let file = profile(PROFILE);
        let path = file.path().to_str().unwrap();

        let config =
            CliConfig::try_parse_from(["ctfify", "rpc", "solved", "--config", path]).unwrap();
        assert!(config.validate().is_ok());
        let Command::Rpc(command) = &config.command else {
            panic!("expected rpc command");
        };
        let settings = command.rpc_args().settings().unwrap();
        assert_eq!(settings.url, "http://10.0.0.5:8545");
        assert!(settings.private_key.is_some());
        assert_eq!(
            settings.setup_address.unwrap().to_string(),
            "0x5fbdb2315678afecb367f032d93f642f64180aa3"
        );

        let config = CliConfig::try_parse_from([
            "ctfify",
            "rpc",
            "accounts",
            "--config",
            path,
            "--rpc",
            "http://127.0.0.1:9545",
        ])
        .unwrap();
        let Command::Rpc(command) = &config.command else {
            panic!("expected rpc command");
        };
        assert_eq!(command.rpc_args().settings().unwrap().url, "http://127.0.0.1:9545");
    }

    #[test]
    fn test_missing_profile_is_an_error() {
        let config = CliConfig::try_parse_from([
            "ctfify",
            "rpc",
            "accounts",
            "--config",
            "/nonexistent/solver.toml",
        ])
        .unwrap();
        let Command::Rpc(command) = &config.command else {
            panic!("expected rpc command");
        };
        assert!(matches!(
            command.rpc_args().settings(),
            Err(CtfError::IoError(_))
        ));
    }

    #[test]
    fn test_parse_get_command() {
        let config = CliConfig::try_parse_from([
            "ctfify",
            "get",
            "-u",
            "https://ctf.example",
            "-s",
            "player",
            "-p",
            "hunter2",
            "-c",
            "web",
            "--only-solved",
        ])
        .unwrap();
        assert!(config.validate().is_ok());
        let Command::Get(args) = &config.command else {
            panic!("expected get command");
        };
        let filter = args.filter();
        assert_eq!(filter.category.as_deref(), Some("web"));
        assert!(filter.only_solved);
        assert_eq!(args.credentials().username, "player");
    }

    #[test]
    fn test_parse_ctftime_events() {
        let config = CliConfig::try_parse_from([
            "ctfify",
            "ctftime",
            "events",
            "--start",
            "May 2, 2023",
            "--finish",
            "June 1, 2023",
            "--days",
            "6,7",
            "--print-keys",
            "title,start",
        ])
        .unwrap();
        assert!(config.validate().is_ok());
        let Command::Ctftime(CtftimeCommand::Events(args)) = &config.command else {
            panic!("expected ctftime events");
        };
        assert_eq!(args.filter().weekdays, vec![6, 7]);
        assert_eq!(args.print_keys, vec!["title", "start"]);

        let config = CliConfig::try_parse_from([
            "ctfify", "ctftime", "events", "--start", "May 2, 2023", "--finish", "June 1, 2023",
            "--days", "8",
        ])
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_template_crate_path_flag() {
        let config = CliConfig::try_parse_from([
            "ctfify",
            "template",
            "poc",
            "--crate-path",
            "/opt/ctfify",
        ])
        .unwrap();
        let Command::Template(args) = config.command else {
            panic!("expected template command");
        };
        assert_eq!(args.kind, TemplateKind::Poc);
        assert_eq!(args.crate_path, Some(PathBuf::from("/opt/ctfify")));
    }
}
