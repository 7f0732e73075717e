use std::path::Path;

use clap::Parser;
use tracing::warn;

use capdispatch::cli::{self, Cli, Command, ConfigCommand, SigningMethod};
use capdispatch::config::{self, DispatcherConfig};
use capdispatch::logging::audit::{self, AuditLog};
use capdispatch::logging::{self, targets};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config_path = cli::config_path(cli.config.as_deref());

    let Some(command) = cli.command else {
        cli::handle_version();
        println!("\nRun `capdispatch --help` for usage.");
        return Ok(());
    };

    let ok = match command {
        Command::Invoke {
            verb,
            inputs,
            inputs_json,
            context,
        } => {
            let cfg = load_and_init(&config_path).await?;
            let inputs = cli::collect_inputs(&inputs, inputs_json.as_deref())?;
            cli::handle_invoke(&cfg, &verb, inputs, context.as_deref()).await?
        }

        Command::List => {
            let cfg = load_and_init(&config_path).await?;
            cli::handle_list(&cfg).await?;
            true
        }

        Command::Verify { manifest } => {
            let cfg = load_and_init(&config_path).await?;
            cli::handle_verify(&cfg, &manifest)?
        }

        Command::Sign {
            manifest,
            key_hex,
            generator,
            publisher,
            in_place,
        } => {
            let cfg = config::load_config(&config_path)?;
            let method = match (generator, key_hex) {
                (true, _) => SigningMethod::Generator,
                (false, Some(hex_key)) => SigningMethod::Key(cli::parse_signing_key(&hex_key)?),
                (false, None) => return Err("either --key-hex or --generator is required".into()),
            };
            cli::handle_sign(&cfg, &manifest, method, publisher.as_deref(), in_place)?;
            true
        }

        Command::Keygen => {
            cli::handle_keygen()?;
            true
        }

        Command::Config(sub) => match sub {
            ConfigCommand::Show => {
                cli::handle_config_show(&config::load_config(&config_path)?)?;
                true
            }
            ConfigCommand::Path => {
                cli::handle_config_path(&config_path);
                true
            }
            ConfigCommand::Validate => {
                cli::handle_config_validate(&config::load_config(&config_path)?)
            }
        },

        Command::Version => {
            cli::handle_version();
            true
        }
    };

    audit::flush().await;
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

/// Load configuration, then bring up logging and the audit log from it.
async fn load_and_init(path: &Path) -> Result<DispatcherConfig, Box<dyn std::error::Error>> {
    let cfg = config::load_config(path)?;
    logging::init_logging(cfg.logging.log_config())?;

    for issue in config::validate_config(&cfg) {
        warn!(target: targets::CONFIG, "{issue}");
    }

    AuditLog::init(cfg.resolved_paths().audit_dir).await;
    Ok(cfg)
}
