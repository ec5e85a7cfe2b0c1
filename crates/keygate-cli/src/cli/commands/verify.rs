//! `keygate verify` - check the configured image against every key in the secret.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use keygate_core::{
    CancelHandle, CosignBackend, TrialEngine, VerificationOutcome, VerificationRequest,
};

use super::{load_config, load_keys, KeySource};
use crate::cli::args::{OutputFormat, VerifyArgs};
use crate::exit_codes::{CANCELLED, NO_MATCH, SUCCESS};

#[derive(Serialize)]
struct VerifyReport<'a> {
    image: String,
    signer: &'a str,
    keys: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    matched_key_id: Option<String>,
    #[serde(flatten)]
    outcome: &'a VerificationOutcome,
}

pub async fn run(args: VerifyArgs) -> Result<i32> {
    let config = load_config(&args.config)?;
    let image = config.image_ref().context("invalid image in config")?;

    let source = match &args.key_file {
        Some(path) => KeySource::File(path),
        None => KeySource::Secret {
            config: &config,
            kubeconfig: args.kubeconfig.as_deref(),
        },
    };
    let decoded = load_keys(source).await?;
    if !decoded.errors.is_empty() {
        tracing::warn!(
            failed_blocks = decoded.errors.len(),
            usable_keys = decoded.keys.len(),
            "some key blocks could not be decoded"
        );
    }

    let backend = CosignBackend::new(config.cosign_options());
    let engine = TrialEngine::new(backend);
    let request = VerificationRequest::new(image, config.signer.clone(), decoded.keys);

    let timeout = args
        .timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.timeout());
    let attempt_timeout = args
        .attempt_timeout
        .map(Duration::from_secs)
        .or_else(|| config.attempt_timeout());

    let handle = CancelHandle::new();
    let mut ctx = handle.context().with_timeout(timeout);
    if let Some(limit) = attempt_timeout {
        ctx = ctx.with_attempt_timeout(limit);
    }

    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling verification");
            handle.cancel();
        }
    });
    let result = engine.verify(&request, &ctx).await;
    interrupt.abort();

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(error = %e, "verification did not complete");
            println!("NOT verified: {} ({})", request.image, e);
            return Ok(CANCELLED);
        }
    };
    print_report(&request, &outcome, args.format)?;

    if outcome.matched {
        Ok(SUCCESS)
    } else if args.warn_only {
        tracing::warn!(image = %request.image, "no valid signature found (warn-only)");
        Ok(SUCCESS)
    } else {
        Ok(NO_MATCH)
    }
}

fn print_report(
    request: &VerificationRequest,
    outcome: &VerificationOutcome,
    format: OutputFormat,
) -> Result<()> {
    let matched_key_id = outcome
        .matched_key
        .and_then(|i| request.candidate_keys.get(i))
        .map(|k| k.key_id());

    match format {
        OutputFormat::Json => {
            let report = VerifyReport {
                image: request.image.to_string(),
                signer: &request.expected_signer,
                keys: request.candidate_keys.len(),
                matched_key_id,
                outcome,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => {
            if outcome.matched {
                println!("verified: {}", request.image);
                if let (Some(index), Some(key_id)) = (outcome.matched_key, matched_key_id) {
                    println!("  key:        #{} {}", index, key_id);
                }
                println!("  signer:     {}", request.expected_signer);
                if let Some(first) = outcome.signatures.first() {
                    println!("  digest:     {}", first.image_digest);
                }
                println!("  signatures: {}", outcome.signatures.len());
            } else {
                println!("NOT verified: {}", request.image);
                println!(
                    "  tried {} of {} keys for signer {}",
                    outcome.attempts,
                    request.candidate_keys.len(),
                    request.expected_signer
                );
                if let Some(err) = &outcome.last_error {
                    println!("  last error: {}", err);
                }
            }
        }
    }
    Ok(())
}
