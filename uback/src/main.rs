// uback is the CLI front end for the uback backup engine.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

mod error;
mod proxy;
use error::*;

use uback_common::options::Options;
use uback_common::preset::PresetStore;
use uback_common::{container, key, orchestrator};

use std::fs::{self, File};
use std::io;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory the named preset store is read from and written to.
    #[arg(short = 'p', long = "presets", global = true, default_value = PresetStore::DEFAULT_DIR)]
    presets_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Key pair management.
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },
    /// Container codec utilities.
    Container {
        #[command(subcommand)]
        command: ContainerCommands,
    },
    /// Creates a new backup at a destination, printing the resulting Backup ID.
    Backup {
        /// Skip automatic retention after a successful upload.
        #[arg(short = 'n', long = "no-retention")]
        no_retention: bool,
        /// Force a full backup even if an incremental would be possible.
        #[arg(short = 'f', long = "force-full")]
        force_full: bool,
        src_opts: String,
        dst_opts: String,
    },
    /// Restores a backup's dependency chain into a directory.
    Restore {
        /// Destination directory for the restored tree. Defaults to the
        /// current directory.
        #[arg(short = 'd', long = "dir")]
        dir: Option<PathBuf>,
        /// Extra options layered onto the synthesized source adapter used
        /// to apply the restored containers (e.g. `receive-command=...`).
        #[arg(short = 'o', long = "override")]
        override_opts: Option<String>,
        dst_opts: String,
        backup_id: Option<String>,
    },
    /// Lists snapshot or backup IDs, one per line, ascending.
    List {
        #[command(subcommand)]
        target: ListTarget,
    },
    /// Applies a retention policy and deletes everything not kept.
    Prune {
        #[command(subcommand)]
        target: ListTarget,
    },
    /// Named option-string management.
    Preset {
        #[command(subcommand)]
        command: PresetCommands,
    },
    /// Runs a built-in adapter as a proxy child speaking the adapter
    /// protocol on stdio. Not meant to be invoked directly; spawned by
    /// the `command`/`proxy` adapter kinds.
    Proxy {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Generates a new key pair, writing the private half to `priv-path`
    /// and the public half to `pub-path`.
    Gen { priv_path: PathBuf, pub_path: PathBuf },
    /// Reads a private key line from stdin and writes the derived public
    /// key line to stdout.
    Pub,
}

#[derive(Subcommand)]
enum ContainerCommands {
    /// Encodes stdin as a container of the given type, written to stdout.
    Create {
        #[arg(short = 'k')]
        pubkey: PathBuf,
        ty: String,
    },
    /// Prints a container's type tag without decrypting its body.
    Type { file: PathBuf },
    /// Decodes a container (stdin, or `file` if given), writing the
    /// plaintext to stdout.
    Extract {
        #[arg(short = 'k')]
        privkey: PathBuf,
        file: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ListTarget {
    Snapshots { opts: String },
    Backups { opts: String },
}

#[derive(Subcommand)]
enum PresetCommands {
    /// Appends `opts` to the named preset, creating it if absent.
    Set { name: String, opts: String },
    /// Removes a preset.
    Remove { name: String },
    /// Lists preset names, or every preset's raw pairs with `-v`.
    List {
        #[arg(short = 'v', long)]
        verbose: bool,
    },
    /// Splices and renders `opts`, printing the result in sorted
    /// `Key: value` form.
    Eval { opts: String },
}

fn logic() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Key { command } => match command {
            KeyCommands::Gen { priv_path, pub_path } => {
                let (private, public) = key::generate();
                fs::write(&priv_path, format!("{private}\n"))?;
                fs::write(&pub_path, format!("{public}\n"))?;
            }
            KeyCommands::Pub => {
                let mut private = String::new();
                io::stdin().read_line(&mut private)?;
                println!("{}", key::derive_public(private.trim())?);
            }
        },

        Commands::Container { command } => match command {
            ContainerCommands::Create { pubkey, ty } => {
                let recipient = fs::read_to_string(&pubkey)?.trim().to_string();

                let stdout = io::stdout();
                let mut writer = container::encode(stdout.lock(), &ty, &[recipient])?;
                io::copy(&mut io::stdin(), &mut writer)?;
                writer.finish()?;
            }
            ContainerCommands::Type { file } => {
                println!("{}", container::decode_type(File::open(&file)?)?);
            }
            ContainerCommands::Extract { privkey, file } => {
                let private = fs::read_to_string(&privkey)?.trim().to_string();

                let stdout = io::stdout();
                let mut out = stdout.lock();

                match file {
                    Some(path) => {
                        let (_, mut reader) = container::decode(File::open(path)?, &private)?;
                        io::copy(&mut reader, &mut out)?;
                    }
                    None => {
                        let (_, mut reader) = container::decode(io::stdin(), &private)?;
                        io::copy(&mut reader, &mut out)?;
                    }
                }
            }
        },

        Commands::Backup {
            no_retention,
            force_full,
            src_opts,
            dst_opts,
        } => {
            let presets = PresetStore::load(&cli.presets_dir)?;
            let src = Options::parse(&src_opts)?;
            let dst = Options::parse(&dst_opts)?;

            let id = orchestrator::backup(&presets, &src, &dst, force_full, no_retention)?;
            println!("{id}");
        }

        Commands::Restore {
            dir,
            override_opts,
            dst_opts,
            backup_id,
        } => {
            let presets = PresetStore::load(&cli.presets_dir)?;
            let dst = Options::parse(&dst_opts)?;
            let override_opts = override_opts.map(|s| Options::parse(&s)).transpose()?;
            let dir = dir.unwrap_or_else(|| PathBuf::from("."));

            orchestrator::restore(&presets, &dst, override_opts.as_ref(), backup_id.as_deref(), &dir)?;
        }

        Commands::List { target } => {
            let presets = PresetStore::load(&cli.presets_dir)?;
            let (opts_str, kind) = match target {
                ListTarget::Snapshots { opts } => (opts, orchestrator::Target::Snapshots),
                ListTarget::Backups { opts } => (opts, orchestrator::Target::Backups),
            };

            for id in orchestrator::list(&presets, &Options::parse(&opts_str)?, kind)? {
                println!("{id}");
            }
        }

        Commands::Prune { target } => {
            let presets = PresetStore::load(&cli.presets_dir)?;
            let (opts_str, kind) = match target {
                ListTarget::Snapshots { opts } => (opts, orchestrator::Target::Snapshots),
                ListTarget::Backups { opts } => (opts, orchestrator::Target::Backups),
            };

            for id in orchestrator::prune(&presets, &Options::parse(&opts_str)?, kind)? {
                println!("{id}");
            }
        }

        Commands::Preset { command } => match command {
            PresetCommands::Set { name, opts } => {
                let mut presets = PresetStore::load(&cli.presets_dir)?;
                presets.set(&name, Options::parse(&opts)?);
                presets.save()?;
            }
            PresetCommands::Remove { name } => {
                let mut presets = PresetStore::load(&cli.presets_dir)?;
                presets.remove(&name);
                presets.save()?;
            }
            PresetCommands::List { verbose } => {
                let presets = PresetStore::load(&cli.presets_dir)?;
                for name in presets.names_sorted() {
                    if verbose {
                        println!("{}", presets.format_verbose(name).expect("name came from names_sorted"));
                    } else {
                        println!("{name}");
                    }
                }
            }
            PresetCommands::Eval { opts } => {
                let presets = PresetStore::load(&cli.presets_dir)?;
                for (key, value) in presets.eval(&Options::parse(&opts)?)? {
                    println!("{key}: {value}");
                }
            }
        },

        Commands::Proxy { args } => proxy::serve(&args)?,
    }

    Ok(())
}

fn main() {
    env_logger::init();

    match logic() {
        Ok(()) => {}
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(e.exit_code());
        }
    }
}
