use clap::{Parser, Subcommand};

use burrow::keys::KeyAlgorithm;

/// Supervise many SSH port-forwarding tunnels from one process.
#[derive(Parser, Debug)]
#[command(name = "burrow", version, about)]
pub struct Cli {
    /// Config file path (default: ~/.config/burrow/config.toml).
    #[arg(short, long, global = true, env = "BURROW_CONFIG")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect every configured tunnel and supervise them until Ctrl+C.
    Up {
        /// Only bring up the named tunnels.
        #[arg(value_name = "NAME")]
        names: Vec<String>,

        /// Print events as JSON lines on stdout.
        #[arg(long)]
        json: bool,
    },

    /// List configured tunnels (non-interactive).
    List,

    /// Validate every configured tunnel without connecting.
    Check,

    /// Write a starter config file.
    Init {
        /// Overwrite an existing config file.
        #[arg(long)]
        force: bool,
    },

    /// Generate a new key pair.
    Keygen {
        /// Key algorithm: ed25519, ecdsa or rsa.
        #[arg(short, long, default_value = "ed25519")]
        algorithm: KeyAlgorithm,

        /// Key size in bits (ignored for ed25519).
        #[arg(short, long)]
        bits: Option<usize>,

        /// Write the private key here and the public key to <OUTPUT>.pub.
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Inspect a private key file and print its type and fingerprint.
    ImportKey {
        /// Private key file.
        file: String,

        /// Environment variable holding the key passphrase.
        #[arg(long, value_name = "VAR")]
        passphrase_env: Option<String>,
    },
}
