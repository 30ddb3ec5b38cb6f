//! Purpose: `rtchat` CLI entry point: parse args, build the session, report errors.
//! Exports: Binary entry point (`main`).
//! Role: Thin shell over `rtchat::api`; command bodies live in `command_dispatch`.
//! Invariants: Exit codes come from `to_exit_code`, except `smoke`, which exits 0 or 1.
//! Invariants: Diagnostics and logs go to stderr; command output goes to stdout.
use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::error::ErrorKind as ClapErrorKind;
use clap::{Parser, Subcommand, ValueEnum, ValueHint};
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

mod command_dispatch;
mod serve;

use rtchat::api::{
    AUTH_TOKEN_ENV, Collection, DATABASE_URL_ENV, Error, ErrorKind, Predicate, Query,
    Record, Session, SessionConfig, event_location, is_timeout, print_event, to_exit_code,
};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse_from(std::env::args_os().collect::<Vec<OsString>>()) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(clap_error_summary(&err))
                        .with_hint("Try `rtchat --help`."),
                    ColorMode::Auto,
                ));
            }
        },
    };

    let color_mode = cli.color;
    let default_level = match cli.command {
        Command::Serve { .. } => "info",
        _ => "warn",
    };
    init_tracing(default_level);

    command_dispatch::dispatch_command(cli.command, cli.connection)
        .map_err(add_hint)
        .map_err(|err| (err, color_mode))
}

#[derive(Parser)]
#[command(
    name = "rtchat",
    version,
    about = "Chat client for a realtime document database",
    long_about = None,
    after_help = r#"EXAMPLES
  $ export RTCHAT_DATABASE_URL=https://<db>.firebaseio.com
  $ rtchat add '{"users": ["user123", "user456"], "messages": []}'
  $ rtchat query --user user123 --order-by timestamp --limit 10
  $ rtchat query --in log --where 'sender==user123'
  $ rtchat get 123
  $ rtchat watch chats_v2 --timeout 60s
  $ rtchat serve --bind 127.0.0.1:9400      # local emulator

NOTES
  - RTCHAT_DATABASE_URL and RTCHAT_AUTH_TOKEN configure the connection
  - RUST_LOG controls diagnostics (default: warn; serve: info)"#,
    arg_required_else_help = true
)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,
    #[arg(
        long,
        global = true,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Clone, Debug, Default)]
struct ConnectionArgs {
    #[arg(
        long,
        global = true,
        help = "Database URL, e.g. https://<db>.firebaseio.com (env: RTCHAT_DATABASE_URL)",
        value_hint = ValueHint::Url
    )]
    database_url: Option<String>,
    #[arg(
        long,
        global = true,
        help = "Auth token sent as the `auth` query parameter (env: RTCHAT_AUTH_TOKEN)"
    )]
    auth_token: Option<String>,
    #[arg(long, global = true, help = "Location of the chats collection (default: chats_v2)")]
    chats_path: Option<String>,
    #[arg(long, global = true, help = "Location of the chat log (default: chat_v2)")]
    chat_path: Option<String>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

/// Which configured collection a command targets.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Target {
    Chats,
    Log,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Run the end-to-end smoke sequence against the database",
        long_about = r#"Add a chat, read it back, list chats, query chats by member,
query the chat log, and fetch chat log entry `123`. Exits 0 on success, 1 on any failure."#
    )]
    Smoke,
    #[command(
        about = "Print change events for a location",
        after_help = r#"EXAMPLES
  $ rtchat watch                       # the chats collection
  $ rtchat watch chats_v2/-Nabc --json
  $ rtchat watch chat_v2 --timeout 30s"#
    )]
    Watch {
        #[arg(help = "Location to watch (default: the chats collection)")]
        path: Option<String>,
        #[arg(long, help = "Stop after this long: ms|s|m|h (e.g. 30s)")]
        timeout: Option<String>,
        #[arg(long, help = "Emit one JSON object per event instead of the console format")]
        json: bool,
    },
    #[command(
        arg_required_else_help = true,
        about = "Write a JSON payload to a collection",
        after_help = r#"EXAMPLES
  $ rtchat add '{"users": ["u1", "u2"]}'            # generated key
  $ rtchat add --in log --key 123 '{"text": "hi"}'  # explicit key"#
    )]
    Add {
        #[arg(help = "JSON payload")]
        data: String,
        #[arg(long, help = "Write under this key instead of a generated one")]
        key: Option<String>,
        #[arg(long = "in", value_enum, default_value = "chats", help = "Collection: chats|log")]
        target: Target,
    },
    #[command(
        about = "Filter, order, and limit a collection client-side",
        after_help = r#"EXAMPLES
  $ rtchat query --user user123
  $ rtchat query --in log --where 'timestamp>=1700000000' --order-by timestamp --limit 5

NOTES
  - --where takes FIELD OP VALUE with OP one of == != < <= > >=
  - VALUE is parsed as JSON when possible, otherwise used as a string
  - --limit 0 means no limit"#
    )]
    Query {
        #[arg(long, help = "Keep records whose `users` contains this id")]
        user: Option<String>,
        #[arg(long = "where", help = "Repeatable predicate, e.g. 't>=2'")]
        filters: Vec<String>,
        #[arg(long, help = "Sort ascending by this field")]
        order_by: Option<String>,
        #[arg(long, help = "Return at most N records")]
        limit: Option<usize>,
        #[arg(long = "in", value_enum, default_value = "chats", help = "Collection: chats|log")]
        target: Target,
    },
    #[command(about = "List collection entries")]
    List {
        #[arg(long, help = "Return at most N records")]
        limit: Option<usize>,
        #[arg(long = "in", value_enum, default_value = "chats", help = "Collection: chats|log")]
        target: Target,
    },
    #[command(arg_required_else_help = true, about = "Fetch one entry by key")]
    Get {
        #[arg(help = "Entry key")]
        key: String,
        #[arg(long = "in", value_enum, default_value = "log", help = "Collection: chats|log")]
        target: Target,
    },
    #[command(
        about = "Run a local in-memory emulator of the database protocol",
        after_help = r#"EXAMPLES
  $ rtchat serve
  $ rtchat serve --bind 127.0.0.1:0 --seed fixtures.json
  $ RTCHAT_DATABASE_URL=http://127.0.0.1:9400 rtchat smoke

NOTES
  - Data lives in memory and is lost on exit
  - Loopback binds only unless --allow-non-loopback is given"#
    )]
    Serve {
        #[arg(long, default_value = "127.0.0.1:9400", help = "Address to listen on")]
        bind: String,
        #[arg(long, help = "Allow binding to non-loopback addresses")]
        allow_non_loopback: bool,
        #[arg(long, help = "Reject requests whose `auth` parameter differs from this token")]
        require_auth: Option<String>,
        #[arg(long, default_value_t = DEFAULT_MAX_BODY_BYTES, help = "Request body limit in bytes")]
        max_body_bytes: u64,
        #[arg(long, default_value_t = DEFAULT_MAX_STREAMS, help = "Concurrent event stream limit")]
        max_streams: usize,
        #[arg(long, default_value = "30s", help = "Keep-alive interval for event streams")]
        keep_alive: String,
        #[arg(long, help = "JSON file used as the initial database contents", value_hint = ValueHint::FilePath)]
        seed: Option<PathBuf>,
    },
}

const DEFAULT_MAX_BODY_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_MAX_STREAMS: usize = 64;

fn init_tracing(default_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

/// Flags win over environment variables.
fn session_config(args: &ConnectionArgs) -> Result<SessionConfig, Error> {
    let mut config = match &args.database_url {
        Some(url) => {
            let mut config = SessionConfig::new(url.clone());
            config.auth_token = std::env::var(AUTH_TOKEN_ENV)
                .ok()
                .filter(|token| !token.is_empty());
            config
        }
        None => SessionConfig::from_env().map_err(|err| {
            err.with_hint(format!(
                "Pass --database-url or set {DATABASE_URL_ENV} (try `rtchat serve` for a local emulator)."
            ))
        })?,
    };
    if let Some(token) = &args.auth_token {
        config = config.with_auth_token(token.clone());
    }
    if let Some(path) = &args.chats_path {
        config = config.with_chats_path(path.clone());
    }
    if let Some(path) = &args.chat_path {
        config = config.with_chat_log_path(path.clone());
    }
    Ok(config)
}

fn collection(session: &Session, target: Target) -> Collection<'_> {
    match target {
        Target::Chats => session.chats(),
        Target::Log => session.chat_log(),
    }
}

fn build_query(
    user: Option<String>,
    filters: &[String],
    order_by: Option<String>,
    limit: Option<usize>,
) -> Result<Query, Error> {
    let mut query = Query::new();
    for expr in filters {
        query = query.with_filter(Predicate::parse(expr)?);
    }
    if let Some(user) = user {
        query = query.with_member(user);
    }
    if let Some(field) = order_by {
        query = query.with_order_by(field);
    }
    if let Some(limit) = limit {
        query = query.with_limit(limit);
    }
    Ok(query)
}

fn parse_bind(input: &str) -> Result<SocketAddr, Error> {
    input.parse().map_err(|_| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid bind address")
            .with_hint("Use a host:port value like 127.0.0.1:9400.")
    })
}

fn parse_inline_json(data: &str) -> Result<Value, Error> {
    serde_json::from_str(data).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid json")
            .with_hint("Provide a single JSON value (e.g. '{\"x\":1}').")
            .with_source(err)
    })
}

fn read_seed_file(path: &PathBuf) -> Result<Value, Error> {
    let text = std::fs::read_to_string(path).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message(format!("failed to read seed file {}", path.display()))
            .with_source(err)
    })?;
    serde_json::from_str(&text).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("seed file {} is not valid json", path.display()))
            .with_source(err)
    })
}

fn parse_duration(input: &str) -> Result<Duration, Error> {
    let invalid = || {
        Error::new(ErrorKind::Usage)
            .with_message("invalid duration")
            .with_hint("Use a number plus ms|s|m|h (e.g. 10s).")
    };
    let trimmed = input.trim();
    let split = trimmed.char_indices().find(|(_, ch)| !ch.is_ascii_digit());
    let (num_str, unit) = match split {
        Some((idx, _)) => trimmed.split_at(idx),
        None => ("", ""),
    };
    if num_str.is_empty() || unit.is_empty() {
        return Err(invalid());
    }
    let value: u64 = num_str.parse().map_err(|_| invalid())?;
    let millis = match unit {
        "ms" => value,
        "s" => value.saturating_mul(1_000),
        "m" => value.saturating_mul(60_000),
        "h" => value.saturating_mul(3_600_000),
        _ => return Err(invalid()),
    };
    Ok(Duration::from_millis(millis))
}

/// Remaining wait before `deadline`, or `None` once it has passed.
fn remaining(deadline: Instant) -> Option<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    (!left.is_zero()).then_some(left)
}

fn records_json(records: Vec<Record>) -> Value {
    Value::Array(records.into_iter().map(Record::into_value).collect())
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn add_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Io => err.with_hint("Network error. Check the database URL and connectivity."),
        ErrorKind::Protocol => {
            err.with_hint("Unexpected response. Check that the URL points at a realtime database.")
        }
        ErrorKind::Internal => err.with_hint(
            "Unexpected failure. Retry with RUST_LOG=debug and share the output if it persists.",
        ),
        _ => err,
    }
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
        ErrorKind::Protocol => "protocol error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path));
    }
    if let Some(key) = err.key() {
        inner.insert("key".to_string(), json!(key));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    ));

    if let Some(hint) = err.hint() {
        lines.push(format!(
            "{} {hint}",
            colorize_label("hint:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(path) = err.path() {
        lines.push(format!(
            "{} {path}",
            colorize_label("path:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(key) = err.key() {
        lines.push(format!(
            "{} {key}",
            colorize_label("key:", use_color, AnsiColor::Yellow)
        ));
    }

    let causes = error_causes(err);
    if let Some(cause) = causes.first() {
        lines.push(format!(
            "{} {cause}",
            colorize_label("caused by:", use_color, AnsiColor::Yellow)
        ));
    }

    lines.join("\n")
}

/// Smoke-test failure report: kind, message, hint, and the whole cause chain.
fn smoke_failure_text(err: &Error) -> String {
    let mut lines = vec![format!("ERROR: {:?}: {}", err.kind(), error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("  hint: {hint}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("  path: {path}"));
    }
    for (depth, cause) in error_causes(err).iter().enumerate() {
        lines.push(format!("  cause {depth}: {cause}"));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}
