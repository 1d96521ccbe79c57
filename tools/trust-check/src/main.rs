#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::io::{BufRead as _, Write as _};
use std::sync::Arc;

use anyhow::Context as _;
use camino::Utf8PathBuf;
use cert_trust::chain::subject_of;
use cert_trust::thumbprint::sha256_fingerprint;
use cert_trust::{
    CertificateChain, ConfigStore, IdentityCheck, JsonConfigStore, PeerSide, Thumbprint, TrustConf, TrustEngine,
    TrustPrompt, TrustVerdict,
};
use seahorse::{App, Context, Flag, FlagType};

const LOG_ENV: &str = "TRUST_CHECK_LOG";

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let app = App::new(env!("CARGO_PKG_NAME"))
        .description(env!("CARGO_PKG_DESCRIPTION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .version(env!("CARGO_PKG_VERSION"))
        .usage(generate_usage())
        .flag(Flag::new("hostname", FlagType::String).description("Comma separated hostnames the leaf must match"))
        .flag(Flag::new("email", FlagType::String).description("Comma separated email addresses the leaf must match"))
        .flag(Flag::new("client", FlagType::Bool).description("Verify the chain as a client certificate"))
        .flag(Flag::new("store", FlagType::String).description("JSON file holding flags and permanent approvals"))
        .flag(Flag::new("conf", FlagType::String).description("JSON engine configuration"))
        .action(check_action);

    app.run(args);
}

fn generate_usage() -> String {
    format!(
        "{command} <CHAIN.pem> [--hostname a,b] [--email a,b] [--client] [--store FILE] [--conf FILE]\n\
        \n\
        \tExample: check a server chain for two host names\n\
        \n\
        \t  {command} chain.pem --hostname example.com,www.example.com\n\
        \n\
        Set {LOG_ENV} (e.g. {LOG_ENV}=debug) for detailed logs.",
        command = env!("CARGO_PKG_NAME"),
    )
}

fn check_action(c: &Context) {
    init_logging();

    match run(c) {
        Ok(()) => println!("trusted"),
        Err(error) => {
            println!("not trusted: {error:#}");
            std::process::exit(1);
        }
    }
}

fn run(c: &Context) -> anyhow::Result<()> {
    let chain_path = c.args.first().context("missing <CHAIN.pem> argument")?;
    let pem = std::fs::read(chain_path).with_context(|| format!("failed to read {chain_path}"))?;
    let chain = CertificateChain::from_pem(&pem).with_context(|| format!("invalid PEM chain in {chain_path}"))?;

    let conf = match c.string_flag("conf") {
        Ok(path) => TrustConf::from_file(&Utf8PathBuf::from(path))?,
        Err(_) => TrustConf::default(),
    };

    let store_path = match c.string_flag("store") {
        Ok(path) => Utf8PathBuf::from(path),
        Err(_) => conf.state_dir().join("trust-store.json"),
    };
    let store: Arc<dyn ConfigStore> = Arc::new(JsonConfigStore::open(store_path)?);

    let identity = if let Ok(hostnames) = c.string_flag("hostname") {
        IdentityCheck::hostnames(split_list(&hostnames))
    } else if let Ok(emails) = c.string_flag("email") {
        IdentityCheck::emails(split_list(&emails))
    } else {
        IdentityCheck::none()
    };

    let side = if c.bool_flag("client") {
        PeerSide::Client
    } else {
        PeerSide::Server
    };

    let engine = TrustEngine::builder(conf, store, Arc::new(ConsolePrompt)).build();

    let leaf = chain.leaf();
    println!("subject: {}", subject_of(leaf));
    println!("thumbprint: {}", Thumbprint::of(leaf));
    println!("sha-256: {}", sha256_fingerprint(leaf));

    tracing::debug!(certificates = chain.len(), ?side, "Checking chain");

    engine.check_trusted(&chain, side, &identity)?;

    Ok(())
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Asks on the terminal.
struct ConsolePrompt;

impl TrustPrompt for ConsolePrompt {
    fn prompt_user(&self, chain: &CertificateChain, reason: &str) -> TrustVerdict {
        eprintln!("{reason}");
        eprintln!("The peer sent {} certificate(s).", chain.len());

        let stdin = std::io::stdin();
        let mut line = String::new();

        loop {
            eprint!("Trust this certificate? [n]o / [a]lways / this [s]ession only: ");
            let _ = std::io::stderr().flush();

            line.clear();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => return TrustVerdict::DoNotTrust,
                Ok(_) => {}
            }

            match line.trim().to_ascii_lowercase().as_str() {
                "n" | "no" | "" => return TrustVerdict::DoNotTrust,
                "a" | "always" => return TrustVerdict::TrustAlways,
                "s" | "session" => return TrustVerdict::TrustThisSessionOnly,
                _ => eprintln!("Please answer n, a or s."),
            }
        }
    }
}
