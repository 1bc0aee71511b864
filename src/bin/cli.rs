// LibriVault - Secure Reading for Mobile
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::RngCore;

use reader_core::crypto::{
    decrypt_content, encrypt_content, unwrap_content_key, wrap_content_key, ContentKey,
};
use reader_core::device::{DeviceIdentity, KeyVault, PlatformAttributes};
use reader_core::storage::{FileStore, ProtectedStore};

#[derive(Parser)]
#[command(name = "librivault-cli")]
#[command(about = "LibriVault DRM core - Desktop testing tool", long_about = None)]
struct Cli {
    /// Protected store directory (defaults to the app data dir)
    #[arg(long, global = true)]
    store_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show this installation's device id
    DeviceId,
    /// Run the local crypto round trip: keypair, wrap/unwrap, seal/open
    SelfTest,
    /// Deauthorize this installation (destroys device id and keypair)
    Reset,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let store: Arc<dyn ProtectedStore> = match &cli.store_dir {
        Some(dir) => Arc::new(FileStore::open(dir.clone()).await?),
        None => Arc::new(FileStore::open_default().await?),
    };

    match cli.command {
        Commands::DeviceId => {
            let identity = DeviceIdentity::new(store, Box::new(PlatformAttributes));
            let id = identity
                .device_id()
                .await
                .context("cannot derive device id")?;
            println!("{}", id);
        }
        Commands::SelfTest => {
            self_test(store).await?;
        }
        Commands::Reset => {
            let vault = KeyVault::new(store);
            vault
                .reset()
                .await
                .context("cannot reset device identity")?;
            println!("Device deauthorized: keypair and device id destroyed");
        }
    }

    Ok(())
}

/// Exercises the device-side crypto path end to end without a server:
/// wraps a random content key against this device's public key, unwraps it
/// with the private key, then seals and reopens a sample document.
async fn self_test(store: Arc<dyn ProtectedStore>) -> anyhow::Result<()> {
    println!("Loading device keypair (generating on first run)...");
    let vault = KeyVault::new(store);
    let keypair = vault.initialize().await?;
    println!("✓ Device keypair ready");

    let mut key_bytes = vec![0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key_bytes);

    let wrapped = wrap_content_key(&key_bytes, keypair.public_key())?;
    let unwrapped = unwrap_content_key(&wrapped, keypair.private_key())?;
    anyhow::ensure!(
        unwrapped.as_bytes() == key_bytes.as_slice(),
        "unwrapped key does not match the wrapped one"
    );
    println!("✓ Content key wrap/unwrap round trip ({} byte wrap)", wrapped.len());

    let mut sample = b"%PDF-1.7\n% LibriVault self-test document\n".to_vec();
    sample.resize(1024, 0x20);

    let content_key = ContentKey::new(key_bytes);
    let blob = encrypt_content(&sample, &content_key)?;
    let opened = decrypt_content(&blob, &content_key, Some("self-test.pdf"))?;
    anyhow::ensure!(opened.plaintext == sample, "reopened plaintext differs");
    println!(
        "✓ Seal/open round trip ({} plaintext bytes, {} blob bytes)",
        sample.len(),
        blob.len()
    );

    println!("✓ Detected content type: {}", opened.content_type);

    println!("Self-test passed");
    Ok(())
}
