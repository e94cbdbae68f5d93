//! Guards against misspelled or corrupted state names.
//!
//! Any transition between two known states is accepted. Which transitions are meaningful is
//! decided by the calling workflow, which may backtrack (for example from `match_preferences`
//! back to `refine_constraints`).

use crate::error::ValidationError;
use crate::model::ContractState;

/// Membership test against the contract state vocabulary.
pub fn is_valid_state(name: &str) -> bool {
    name.parse::<ContractState>().is_ok()
}

/// True when both ends are known states.
pub fn is_valid_transition(from: &str, to: &str) -> bool {
    is_valid_state(from) && is_valid_state(to)
}

/// Splits a `"from->to"` step log entry. Whitespace around the arrow is tolerated.
pub fn parse_step(entry: &str) -> Result<(ContractState, ContractState), ValidationError> {
    let malformed = || ValidationError::MalformedStep(entry.to_owned());
    let (from, to) = entry.split_once("->").ok_or_else(malformed)?;
    let from = from.trim().parse().map_err(|_| malformed())?;
    let to = to.trim().parse().map_err(|_| malformed())?;
    Ok((from, to))
}

/// Checks that `current` is the target of the last logged step. An empty log accepts any
/// state, since the context may have been created in a non-initial state.
pub fn check_state_log(step_log: &[String], current: ContractState) -> Result<(), ValidationError> {
    let Some(last) = step_log.last() else {
        return Ok(());
    };
    let (_, logged) = parse_step(last)?;
    if logged != current {
        return Err(ValidationError::StepLogMismatch {
            logged: logged.to_string(),
            current: current.to_string(),
        });
    }
    Ok(())
}
