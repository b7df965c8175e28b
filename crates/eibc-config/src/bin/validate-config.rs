//! Configuration validation utility
//!
//! Usage: validate-config config/eibc.toml

use std::env;
use std::process;

use eibc_config::ConfigLoader;

fn main() {
	let args: Vec<String> = env::args().collect();

	if args.len() != 2 {
		eprintln!("Usage: {} <config-file>", args[0]);
		process::exit(1);
	}

	let config_path = &args[1];

	println!("Validating configuration file: {}", config_path);

	match ConfigLoader::from_file(config_path) {
		Ok(config) => {
			println!("Configuration is valid");
			println!("Hub: {} ({})", config.hub.chain_id, config.hub.denom);
			for (rollapp_id, rollapp) in &config.rollapps {
				println!(
					"Rollapp {}: hub channel {}, dispute period {} blocks",
					rollapp_id, rollapp.hub_channel, rollapp.dispute_period_in_blocks
				);
			}
			for (chain_id, counterparty) in &config.counterparties {
				println!("Counterparty {}: hub channel {}", chain_id, counterparty.hub_channel);
			}
			println!("API: {}:{}", config.api.host, config.api.port);
		}
		Err(e) => {
			eprintln!("Configuration validation failed:");
			eprintln!("{:#}", e);
			process::exit(1);
		}
	}
}
