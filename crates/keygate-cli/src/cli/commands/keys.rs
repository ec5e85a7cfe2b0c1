//! `keygate keys` - show what the key material decodes to.

use anyhow::Result;
use serde::Serialize;

use super::{load_config, load_keys, KeySource};
use crate::cli::args::{KeysArgs, OutputFormat};
use crate::exit_codes::SUCCESS;

#[derive(Serialize)]
struct KeyEntry {
    index: usize,
    key_id: String,
    algorithm: String,
}

#[derive(Serialize)]
struct KeysReport {
    keys: Vec<KeyEntry>,
    errors: Vec<String>,
}

pub async fn run(args: KeysArgs) -> Result<i32> {
    let config = match &args.config {
        Some(path) => Some(load_config(path)?),
        None => None,
    };

    let source = match (&args.key_file, &config) {
        (Some(path), _) => KeySource::File(path),
        (None, Some(config)) => KeySource::Secret {
            config,
            kubeconfig: args.kubeconfig.as_deref(),
        },
        (None, None) => anyhow::bail!("either --config or --key-file is required"),
    };
    let decoded = load_keys(source).await?;

    let report = KeysReport {
        keys: decoded
            .keys
            .iter()
            .enumerate()
            .map(|(index, key)| KeyEntry {
                index,
                key_id: key.key_id(),
                algorithm: key.algorithm().to_string(),
            })
            .collect(),
        errors: decoded.errors.iter().map(|e| e.to_string()).collect(),
    };

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            for key in &report.keys {
                println!("#{} {} {}", key.index, key.algorithm, key.key_id);
            }
            for error in &report.errors {
                println!("skipped: {}", error);
            }
        }
    }

    Ok(SUCCESS)
}
