// SPDX-License-Identifier: MIT
//! fsec-issuer-keygen — generate an Ed25519 issuer keypair for FST2 tokens.
//!
//! Writes the private key file (0600) and merges the public key into the
//! issuer keys file (0644), both atomically. Emits one JSON `ready` object
//! on stdout; everything else goes to stderr.
//!
//! Exit codes: 0 success, 2 usage error, 1 runtime error.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;

use flowersec::keyset::{IssuerKeyset, SigningIdentity};

#[derive(Parser)]
#[command(
    name = "fsec-issuer-keygen",
    about = "Generate an Ed25519 issuer keypair for FST2 control-plane tokens",
    version
)]
struct Args {
    /// Key id for the new keypair
    #[arg(long, env = "FSEC_ISSUER_KID")]
    kid: Option<String>,

    /// Directory for both key files (default: current directory)
    #[arg(long, env = "FSEC_ISSUER_OUT_DIR")]
    out_dir: Option<PathBuf>,

    /// Pretty-print the JSON key files
    #[arg(long)]
    pretty: bool,

    /// Replace an existing private key file / keys-file entry for this kid
    #[arg(long)]
    overwrite: bool,

    /// Private key file path (default: {out_dir}/issuer_private_key.json)
    #[arg(long, env = "FSEC_ISSUER_PRIVATE_KEY_FILE")]
    private_key_file: Option<PathBuf>,

    /// Issuer keys file path (default: {out_dir}/issuer_keys.json)
    #[arg(long, env = "FSEC_ISSUER_KEYS_FILE")]
    keys_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let Some(kid) = args.kid.clone().filter(|k| !k.is_empty()) else {
        eprintln!("error: --kid (or FSEC_ISSUER_KID) is required");
        return ExitCode::from(2);
    };

    match run(args, kid) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn run(args: Args, kid: String) -> Result<()> {
    let out_dir = args.out_dir.unwrap_or_else(|| PathBuf::from("."));
    let private_path = args
        .private_key_file
        .unwrap_or_else(|| out_dir.join("issuer_private_key.json"));
    // The tunnel deployment shares one keys file; honor its env as the
    // fallback default when the issuer-specific one is unset.
    let keys_path = args
        .keys_file
        .or_else(|| std::env::var_os("FSEC_TUNNEL_ISSUER_KEYS_FILE").map(PathBuf::from))
        .unwrap_or_else(|| out_dir.join("issuer_keys.json"));

    if private_path.exists() && !args.overwrite {
        bail!(
            "{} already exists (pass --overwrite to replace it)",
            private_path.display()
        );
    }

    let identity = SigningIdentity::generate(kid.clone());

    // Merge into an existing keys file unless told to start over.
    let mut keyset = if keys_path.exists() && !args.overwrite {
        IssuerKeyset::load(&keys_path)
            .with_context(|| format!("cannot merge into {}", keys_path.display()))?
    } else {
        IssuerKeyset::new()
    };
    keyset.insert(identity.kid.clone(), identity.verifying_key());

    identity.save(&private_path, args.pretty)?;
    keyset.save(&keys_path, args.pretty)?;

    let ready = serde_json::json!({
        "event": "ready",
        "kid": kid,
        "version": env!("CARGO_PKG_VERSION"),
        "private_key_file": private_path.display().to_string(),
        "issuer_keys_file": keys_path.display().to_string(),
    });
    println!("{ready}");
    Ok(())
}
