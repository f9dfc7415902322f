//! # Grenache CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Run an echo peer
//! grenache serve -b 0.0.0.0:1337 --disable-buffered
//!
//! # Run it over mutual TLS
//! grenache serve -b 0.0.0.0:1337 --key server.key --cert server.crt --ca ca.crt --request-cert
//!
//! # Call it (outputs raw JSON)
//! grenache call 127.0.0.1:1337 rpc_test -p '"hello"'
//!
//! # Stream a file and print the raw response
//! grenache stream 127.0.0.1:1337 rpc_upload -f data.bin -H _a=upload
//! ```

use anyhow::Result;
use argh::FromArgs;
use grenache_cli::{load_credentials, request_options, TlsPaths};
use grenache_common::config::DEFAULT_TIMEOUT_MS;
use grenache_common::TransportConfig;
use std::path::{Path, PathBuf};

#[derive(FromArgs)]
/// grenache - HTTP transport for peer-to-peer RPC
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

/// Available CLI subcommands.
///
/// - **Serve**: run an echo peer
/// - **Call**: make a single buffered request (unix-friendly JSON output)
/// - **Stream**: upload bytes over a stream connection
#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
    Stream(StreamArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// run a peer that echoes every payload back
struct ServeArgs {
    /// address to listen on
    #[argh(option, short = 'b', default = "\"127.0.0.1:1337\".into()")]
    bind: String,

    /// PEM or DER private key; enables TLS together with --cert and --ca
    #[argh(option)]
    key: Option<PathBuf>,

    /// PEM or DER certificate
    #[argh(option)]
    cert: Option<PathBuf>,

    /// PEM or DER CA bundle used to verify client certificates
    #[argh(option)]
    ca: Option<PathBuf>,

    /// ask callers for a client certificate
    #[argh(switch)]
    request_cert: bool,

    /// accept client certificates the CA did not issue
    #[argh(switch)]
    allow_unauthorized: bool,

    /// how long an unanswered request holds its connection, in milliseconds
    #[argh(option, default = "DEFAULT_TIMEOUT_MS")]
    timeout_ms: u64,

    /// skip buffered dispatch; the echo handler buffers streams itself
    #[argh(switch)]
    disable_buffered: bool,

    /// largest request body buffered, in bytes
    #[argh(option)]
    max_body_bytes: Option<usize>,
}

/// Arguments for making a single buffered request.
///
/// # Output Format
///
/// Prints the result as raw JSON on stdout. Errors go to stderr with a
/// non-zero exit code.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// send one request and print the result
struct CallArgs {
    /// destination as host:port
    #[argh(positional)]
    destination: String,

    /// service key
    #[argh(positional)]
    key: String,

    /// JSON payload
    #[argh(option, short = 'p', default = "\"null\".into()")]
    payload: String,

    /// gzip the request and ask for a gzip reply
    #[argh(switch, short = 'z')]
    compress: bool,

    /// request timeout in milliseconds
    #[argh(option, default = "DEFAULT_TIMEOUT_MS")]
    timeout_ms: u64,

    /// extra header as name=value, repeatable
    #[argh(option, short = 'H', long = "header")]
    headers: Vec<String>,

    /// client private key; enables TLS together with --cert and --ca
    #[argh(option)]
    key_file: Option<PathBuf>,

    /// client certificate
    #[argh(option)]
    cert: Option<PathBuf>,

    /// CA bundle used to verify the server
    #[argh(option)]
    ca: Option<PathBuf>,

    /// skip server certificate verification
    #[argh(switch)]
    allow_unauthorized: bool,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "stream")]
/// stream a file or stdin and print the raw response
struct StreamArgs {
    /// destination as host:port
    #[argh(positional)]
    destination: String,

    /// service key
    #[argh(positional)]
    key: String,

    /// file to upload; stdin when omitted
    #[argh(option, short = 'f')]
    file: Option<PathBuf>,

    /// connect and idle timeout in milliseconds
    #[argh(option, default = "DEFAULT_TIMEOUT_MS")]
    timeout_ms: u64,

    /// extra header as name=value, repeatable
    #[argh(option, short = 'H', long = "header")]
    headers: Vec<String>,

    /// client private key; enables TLS together with --cert and --ca
    #[argh(option)]
    key_file: Option<PathBuf>,

    /// client certificate
    #[argh(option)]
    cert: Option<PathBuf>,

    /// CA bundle used to verify the server
    #[argh(option)]
    ca: Option<PathBuf>,

    /// skip server certificate verification
    #[argh(switch)]
    allow_unauthorized: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // call and stream keep stdout clean for piping
    if matches!(cli.command, Commands::Serve(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Call(args) => run_call(args).await,
        Commands::Stream(args) => run_stream(args).await,
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let paths = TlsPaths {
        key: args.key.as_deref(),
        cert: args.cert.as_deref(),
        ca: args.ca.as_deref(),
        allow_unauthorized: args.allow_unauthorized,
        request_cert: args.request_cert,
    };

    let mut config = TransportConfig::new()
        .with_timeout(args.timeout_ms)
        .with_disable_buffered(args.disable_buffered);
    if let Some(creds) = load_credentials(&paths)? {
        config = config.with_secure(creds);
    }
    if let Some(limit) = args.max_body_bytes {
        config = config.with_max_body_bytes(limit);
    }

    tracing::info!("Starting grenache echo peer on {}", args.bind);
    grenache_cli::serve(&args.bind, config).await
}

fn client_config(
    destination: &str,
    timeout_ms: u64,
    key: Option<&Path>,
    cert: Option<&Path>,
    ca: Option<&Path>,
    allow_unauthorized: bool,
) -> Result<TransportConfig> {
    let paths = TlsPaths {
        key,
        cert,
        ca,
        allow_unauthorized,
        request_cert: false,
    };

    let mut config = TransportConfig::for_destination(destination).with_timeout(timeout_ms);
    if let Some(creds) = load_credentials(&paths)? {
        config = config.with_secure(creds);
    }
    Ok(config)
}

async fn run_call(args: CallArgs) -> Result<()> {
    let payload: serde_json::Value = serde_json::from_str(&args.payload)
        .map_err(|e| anyhow::anyhow!("Invalid JSON in payload: {}", e))?;

    let config = client_config(
        &args.destination,
        args.timeout_ms,
        args.key_file.as_deref(),
        args.cert.as_deref(),
        args.ca.as_deref(),
        args.allow_unauthorized,
    )?;
    let options = request_options(args.timeout_ms, args.compress, &args.headers)?;

    let result = grenache_cli::call(config, &args.key, payload, &options).await?;
    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}

async fn run_stream(args: StreamArgs) -> Result<()> {
    let config = client_config(
        &args.destination,
        args.timeout_ms,
        args.key_file.as_deref(),
        args.cert.as_deref(),
        args.ca.as_deref(),
        args.allow_unauthorized,
    )?;
    let options = request_options(args.timeout_ms, false, &args.headers)?;
    let mut stdout = tokio::io::stdout();

    match &args.file {
        Some(path) => {
            let mut file = tokio::fs::File::open(path)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", path.display(), e))?;
            grenache_cli::stream(config, &args.key, &options, &mut file, &mut stdout).await?;
        }
        None => {
            let mut stdin = tokio::io::stdin();
            grenache_cli::stream(config, &args.key, &options, &mut stdin, &mut stdout).await?;
        }
    }
    Ok(())
}
