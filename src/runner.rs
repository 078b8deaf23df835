//! Program runner: executes a parsed program line by line, stopping at the
//! first failing call and attributing the failure to its literal source
//! line for the oracle to read back.

use tracing::{debug, warn};

use crate::actions::Actions;
use crate::program::ActionProgram;

/// Run every line in order. Returns `None` when all lines succeed, or the
/// attributed error message of the first failing line. Lines after the
/// failure are not attempted; their effects never happened, and the
/// message tells the oracle exactly where execution stopped.
pub async fn run(actions: &mut Actions<'_>, program: &ActionProgram) -> Option<String> {
    for line in program.lines() {
        debug!("line {}: {}", line.number, line.source.trim());
        if let Err(e) = actions.apply(&line.call).await {
            let message = format!(
                "Error in execution of script. At line: \"{}\". Error: \"{}\"",
                line.source.trim(),
                e
            );
            warn!("{}", message);
            return Some(message);
        }
    }
    None
}
