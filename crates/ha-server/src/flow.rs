//! Drive a config flow from the command line

use anyhow::{anyhow, bail, Context as _, Result};
use ha_config_entries::{ConfigEntrySource, EntryData, FlowResult, FlowResultType};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use crate::bootstrap::Server;

/// `key=value`; the value is read as JSON when it parses, so `port=80`
/// gives a number and `host=10.0.0.5` a string
pub fn parse_field(arg: &str) -> Result<(String, Value), String> {
    let (key, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {arg:?}"))?;
    if key.is_empty() {
        return Err(format!("empty key in {arg:?}"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Start a user flow with `fields` as input for the first step
///
/// Forms without fields, such as a PIN to enter on a vendor site, are
/// shown and submitted once the user presses Enter.
pub async fn run(server: &Server, domain: &str, fields: EntryData) -> Result<()> {
    let input = (!fields.is_empty()).then_some(fields);
    let mut result = server
        .entries
        .flow_init(domain, ConfigEntrySource::User, input)
        .await
        .with_context(|| format!("starting the {domain} flow"))?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        debug!(flow_id = %result.flow_id, step = ?result.step_id, "Flow step");
        match result.result_type {
            FlowResultType::CreateEntry => {
                let entry_id = result.result.unwrap_or_default();
                println!(
                    "Created {domain} entry {} ({entry_id})",
                    result.title.unwrap_or_default()
                );
                return Ok(());
            }
            FlowResultType::Abort => {
                bail!("{domain} flow aborted: {}", result.reason.unwrap_or_default())
            }
            FlowResultType::Form => {
                check_form(domain, &result)?;
                for (key, value) in &result.description_placeholders {
                    println!("{key}: {value}");
                }
                println!("Press Enter to continue");
                stdin
                    .next_line()
                    .await
                    .context("reading stdin")?
                    .ok_or_else(|| anyhow!("stdin closed"))?;
                result = server
                    .entries
                    .flow_configure(&result.flow_id, EntryData::new())
                    .await
                    .with_context(|| format!("submitting step {:?}", result.step_id))?;
            }
        }
    }
}

/// A form the command line cannot answer ends the flow
fn check_form(domain: &str, form: &FlowResult) -> Result<()> {
    let step = form.step_id.as_deref().unwrap_or("?");
    if !form.errors.is_empty() {
        let errors: Vec<String> = form
            .errors
            .iter()
            .map(|(field, error)| format!("{field}: {error}"))
            .collect();
        bail!("{domain} step {step} failed: {}", errors.join(", "));
    }
    if !form.data_schema.is_empty() {
        let names: Vec<&str> = form.data_schema.iter().map(|f| f.name.as_str()).collect();
        bail!("{domain} step {step} needs {}", names.join(", "));
    }
    Ok(())
}
