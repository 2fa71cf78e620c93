//! Shaping Proxy
//!
//! An intercepting HTTP/HTTPS forward proxy: MITM TLS termination with
//! dynamically minted per-host certificates, request header rewriting,
//! TCP-level traffic shaping, DNS-over-HTTPS resolution and a mock-response
//! rule engine for offline development.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use shaping_proxy::ca::CertificateAuthority;
use shaping_proxy::config::{Config, DohProvider, RewriteProfile, ShapingProfile};
use shaping_proxy::doh::DohResolver;
use shaping_proxy::listener;
use shaping_proxy::logsink::LogFanout;
use shaping_proxy::mock::MockEngine;
use shaping_proxy::state::ProxyState;
use shaping_proxy::store::RequestStore;

#[derive(Parser)]
#[command(name = "shaping-proxy")]
#[command(about = "MITM forward proxy with header rewriting and traffic shaping")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy server
    Start {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,

        /// Directory holding the root CA and minted leaf certificates
        #[arg(long, default_value = "~/.shaping-proxy/certs")]
        cert_dir: PathBuf,

        /// Bytes per write to the upstream connection (0 disables fragmentation)
        #[arg(long, default_value = "0")]
        fragment_size: u32,

        /// Minimum delay between fragments, in milliseconds
        #[arg(long, default_value = "0")]
        min_delay_ms: u32,

        /// Maximum delay between fragments, in milliseconds (0 disables jitter)
        #[arg(long, default_value = "0")]
        max_delay_ms: u32,

        /// Random bytes appended after the request body
        #[arg(long, default_value = "0")]
        padding_size: u32,

        /// IP TTL / IPv6 hop limit applied to upstream sockets (0 leaves the OS default)
        #[arg(long, default_value = "0")]
        ttl: u8,

        /// Extra headers injected into every forwarded request, as key=value
        #[arg(long = "header", value_parser = parse_key_val)]
        headers: Vec<(String, String)>,

        /// Rotate the User-Agent header on every forwarded request
        #[arg(long)]
        rotate_ua: bool,

        /// Replace the Host header with this value while leaving the TLS SNI/CONNECT target alone
        #[arg(long)]
        front_domain: Option<String>,

        /// Resolve upstream hosts via DNS-over-HTTPS instead of the system resolver
        #[arg(long)]
        use_doh: bool,

        /// DoH provider to use when --use-doh is set
        #[arg(long, value_enum, default_value = "cloudflare")]
        doh_provider: DohProvider,

        /// Suppress hostnames and resolved addresses from log output
        #[arg(long)]
        privacy_mode: bool,

        /// JSON file of ordered mock response rules
        #[arg(long)]
        mock_rules: Option<PathBuf>,

        /// Directory to archive a JSON record of every forwarded request
        #[arg(long)]
        save_requests_dir: Option<PathBuf>,

        /// Enable debug-level logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate (or regenerate) the root CA used to mint leaf certificates
    GenerateCa {
        /// Output directory
        #[arg(long, default_value = "~/.shaping-proxy/certs")]
        cert_dir: PathBuf,
    },

    /// Show the CA and cache status
    Status {
        #[arg(long, default_value = "~/.shaping-proxy/certs")]
        cert_dir: PathBuf,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{s}`"))?;
    Ok((k.to_string(), v.to_string()))
}

fn expand(path: &std::path::Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}

async fn run_start(
    host: String,
    port: u16,
    cert_dir: PathBuf,
    fragment_size: u32,
    min_delay_ms: u32,
    max_delay_ms: u32,
    padding_size: u32,
    ttl: u8,
    headers: Vec<(String, String)>,
    rotate_ua: bool,
    front_domain: Option<String>,
    use_doh: bool,
    doh_provider: DohProvider,
    privacy_mode: bool,
    mock_rules: Option<PathBuf>,
    save_requests_dir: Option<PathBuf>,
) -> Result<()> {
    let cert_dir = expand(&cert_dir);
    let config = Config {
        host,
        port,
        cert_dir: cert_dir.clone(),
        shaping: ShapingProfile {
            fragment_size,
            min_delay_ms,
            max_delay_ms,
            padding_size,
            ttl,
        },
        rewrite: RewriteProfile {
            custom_headers: headers.into_iter().collect::<HashMap<_, _>>(),
            rotate_ua,
            front_domain,
        },
        use_doh,
        doh_provider,
        privacy_mode,
        mock_rules_path: mock_rules,
        save_requests_dir,
    };
    config.validate().context("invalid configuration")?;

    let ca = CertificateAuthority::ensure_ca(&config.cert_dir)
        .await
        .context("failed to load or generate CA")?;
    info!("CA ready in {:?}", config.cert_dir);

    let mock = match &config.mock_rules_path {
        Some(path) => MockEngine::load(path).await.context("failed to load mock rules")?,
        None => MockEngine::empty(),
    };

    let doh = if config.use_doh {
        Some(DohResolver::new(config.doh_provider))
    } else {
        None
    };

    let store = config
        .save_requests_dir
        .as_ref()
        .map(|dir| RequestStore::new(dir.clone()));

    let logs = LogFanout::new(1024);
    let state = std::sync::Arc::new(ProxyState::new(config, ca, mock, doh, logs, store));

    let handle = listener::start(state).await?;
    info!("listening on {}", handle.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.stop();
    Ok(())
}

async fn generate_ca(cert_dir: &std::path::Path) -> Result<()> {
    let cert_dir = expand(cert_dir);
    CertificateAuthority::ensure_ca(&cert_dir).await?;
    println!("CA ready in {:?}", cert_dir);
    println!("Import {:?} into your browser or OS trust store, or set", cert_dir.join("ca.crt"));
    println!("SSL_CERT_FILE={:?} for tools that honor it.", cert_dir.join("ca.crt"));
    Ok(())
}

fn status(cert_dir: &std::path::Path) -> Result<()> {
    let cert_dir = expand(cert_dir);
    println!("Shaping Proxy Status");
    println!("====================");
    println!("cert_dir: {:?}", cert_dir);
    let ca_cert = cert_dir.join("ca.crt");
    let ca_key = cert_dir.join("ca.key");
    println!("CA certificate present: {}", ca_cert.exists());
    println!("CA key present: {}", ca_key.exists());
    if ca_cert.exists() {
        let leaves = std::fs::read_dir(&cert_dir)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("crt"))
                    .filter(|e| e.path().file_stem().and_then(|x| x.to_str()) != Some("ca"))
                    .count()
            })
            .unwrap_or(0);
        println!("cached leaf certificates: {leaves}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            host,
            port,
            cert_dir,
            fragment_size,
            min_delay_ms,
            max_delay_ms,
            padding_size,
            ttl,
            headers,
            rotate_ua,
            front_domain,
            use_doh,
            doh_provider,
            privacy_mode,
            mock_rules,
            save_requests_dir,
            verbose,
        } => {
            let level = if verbose { Level::DEBUG } else { Level::INFO };
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_target(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;

            run_start(
                host,
                port,
                cert_dir,
                fragment_size,
                min_delay_ms,
                max_delay_ms,
                padding_size,
                ttl,
                headers,
                rotate_ua,
                front_domain,
                use_doh,
                doh_provider,
                privacy_mode,
                mock_rules,
                save_requests_dir,
            )
            .await?;
        }
        Commands::GenerateCa { cert_dir } => {
            generate_ca(&cert_dir).await?;
        }
        Commands::Status { cert_dir } => {
            status(&cert_dir)?;
        }
    }

    Ok(())
}
