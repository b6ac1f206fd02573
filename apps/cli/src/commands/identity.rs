//! Identity command implementation.

use super::resolve::plan_for;
use super::types::ResolveArgs;
use anyhow::Result;
use evoplan_core::EvoplanConfig;
use serde_json::json;

/// Execute the identity command: the run identity alone, for scripts.
pub fn execute(args: ResolveArgs, config: &EvoplanConfig) -> Result<()> {
    let json = args.wants_json(config);
    let plan = plan_for(args, config)?;
    let identity = plan.identity();

    if json {
        let output = json!({
            "identity": identity.as_str(),
            "digest": identity.digest(),
            "short_digest": identity.short_digest(),
            "version": identity.version(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{}", identity);
    }
    Ok(())
}
