//! JSON-schema emission for the flow file format and the outbound payload
//! contract, for editors and external tooling.

use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use schemars::schema_for;

use crate::flow::FlowDefinition;
use crate::flow::store::ScheduledBulkMessage;
use crate::message::OutboundPayload;

/// Entry point for the `schema` CLI subcommand.
pub fn write_schema(out_dir: PathBuf) -> Result<()> {
    fs::create_dir_all(&out_dir)?;

    let flow_schema = serde_json::to_string_pretty(&schema_for!(FlowDefinition))?;
    fs::write(out_dir.join("flow.schema.json"), flow_schema)?;

    let payload_schema = serde_json::to_string_pretty(&schema_for!(OutboundPayload))?;
    fs::write(out_dir.join("payload.schema.json"), payload_schema)?;

    let bulk_schema = serde_json::to_string_pretty(&schema_for!(ScheduledBulkMessage))?;
    fs::write(out_dir.join("bulk_message.schema.json"), bulk_schema)?;

    Ok(())
}
