//! `oci-cli`: thin subcommand wiring over `oci-transport`. Per spec.md §1,
//! the CLI argument parser and subcommand dispatch are external collaborator
//! concerns — this binary is exactly that collaborator, with no manifest or
//! protocol logic of its own beyond what it hands off to the library.

mod open;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use oci_transport::cache::Cache;
use oci_transport::copy::progress::{NullProgressSink, RateLimitedProgress};
use oci_transport::copy::{self, CopyOptions};
use oci_transport::reference::Reference;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "oci-cli", version, about = "Inspect and copy container images across registries, archives, and OCI layouts")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a manifest's JSON body and summary.
    Inspect { reference: String },
    /// Copy an image from one reference to another, converting manifest
    /// format as needed.
    Copy { source: String, destination: String },
    /// List layer digests and sizes for a manifest.
    Layers { reference: String },
    /// Sign a manifest digest through the configured `Signer`.
    StandaloneSign {
        manifest_path: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// Verify a manifest digest's signature through the configured `Signer`.
    StandaloneVerify {
        manifest_path: PathBuf,
        signature_path: PathBuf,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            err.print().ok();
            std::process::exit(125);
        }
    };

    if let Err(err) = run(cli.command).await {
        log::error!("{err:#}");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Inspect { reference } => cmd_inspect(&reference).await,
        Command::Copy { source, destination } => cmd_copy(&source, &destination).await,
        Command::Layers { reference } => cmd_layers(&reference).await,
        Command::StandaloneSign { manifest_path, output } => cmd_standalone_sign(&manifest_path, &output),
        Command::StandaloneVerify { manifest_path, signature_path } => cmd_standalone_verify(&manifest_path, &signature_path),
    }
}

async fn cmd_inspect(reference: &str) -> Result<()> {
    let parsed = Reference::parse(reference).with_context(|| format!("parsing reference {reference:?}"))?;
    let source = open::open_source(&parsed).await?;
    let (bytes, media_type) = source.get_manifest(None).await.with_context(|| "fetching manifest".to_string())?;
    let value: serde_json::Value = serde_json::from_slice(&bytes).with_context(|| "manifest is not valid JSON".to_string())?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    log::info!("media-type: {media_type}");
    Ok(())
}

async fn cmd_layers(reference: &str) -> Result<()> {
    let parsed = Reference::parse(reference).with_context(|| format!("parsing reference {reference:?}"))?;
    let source = open::open_source(&parsed).await?;
    let (bytes, media_type) = source.get_manifest(None).await.with_context(|| "fetching manifest".to_string())?;
    let manifest = oci_transport::manifest::parse(&media_type, &bytes)?;
    for (i, layer) in manifest.layers().iter().enumerate() {
        println!("{i}\t{}\t{}\t{}", layer.digest, layer.size, layer.media_type);
    }
    Ok(())
}

async fn cmd_copy(source: &str, destination: &str) -> Result<()> {
    let src_ref = Reference::parse(source).with_context(|| format!("parsing source reference {source:?}"))?;
    let dst_ref = Reference::parse(destination).with_context(|| format!("parsing destination reference {destination:?}"))?;

    let src = open::open_source(&src_ref).await?;
    let dst = open::open_destination(&dst_ref).await?;

    let cache = Cache::new();
    let options = CopyOptions::default();
    let progress = RateLimitedProgress::new(NullProgressSink, Duration::from_millis(200));

    copy::copy_image(src.as_ref(), dst.as_ref(), &cache, &options, &progress)
        .await
        .with_context(|| format!("copying {source} to {destination}"))?;
    log::info!("copied {source} -> {destination}");
    Ok(())
}

/// Demonstrates the `Signer` call-through contract (spec.md §1's Non-goals
/// explicitly exclude implementing real cryptography here): signs the
/// sha256 digest of the manifest file's bytes with whatever `Signer` the
/// caller's `SystemContext` carries. With the default `NoopSigner`, this
/// always reports no signature was produced.
fn cmd_standalone_sign(manifest_path: &PathBuf, output: &PathBuf) -> Result<()> {
    let context = oci_transport::config::SystemContext::default();
    let bytes = std::fs::read(manifest_path).with_context(|| format!("reading {manifest_path:?}"))?;
    let digest = oci_transport::digest::Digest::of_bytes(oci_transport::digest::Algorithm::Sha256, &bytes);
    match context.signer.sign(&digest) {
        Some(signature) => {
            std::fs::write(output, &signature).with_context(|| format!("writing {output:?}"))?;
            log::info!("wrote signature for {digest} to {output:?}");
            Ok(())
        }
        None => anyhow::bail!("no signer is configured for this process (NoopSigner never produces a signature)"),
    }
}

fn cmd_standalone_verify(manifest_path: &PathBuf, signature_path: &PathBuf) -> Result<()> {
    let context = oci_transport::config::SystemContext::default();
    let bytes = std::fs::read(manifest_path).with_context(|| format!("reading {manifest_path:?}"))?;
    let signature = std::fs::read(signature_path).with_context(|| format!("reading {signature_path:?}"))?;
    let digest = oci_transport::digest::Digest::of_bytes(oci_transport::digest::Algorithm::Sha256, &bytes);
    if context.signer.verify(&digest, &signature) {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("signature verification failed for {digest}");
    }
}
