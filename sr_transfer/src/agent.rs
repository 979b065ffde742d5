use crate::errors::TransferError;
use anyhow::Result;
use std::path::Path;

/// Moves the data of a run to its destination and checks the result.
///
/// `transfer` and `validate_transfer` have no default: every agent decides
/// how it copies and how a copy is verified. The path checks default to
/// "source must exist" and "destination must be set".
pub trait TransferAgent {
    fn src_path(&self) -> &Path;

    fn dest_path(&self) -> Option<&Path>;

    fn validate_src_path(&self) -> Result<()> {
        let src = self.src_path();
        if !src.exists() {
            return Err(TransferError::MissingSource {
                path: src.to_path_buf(),
            }
            .into());
        }
        Ok(())
    }

    fn validate_dest_path(&self) -> Result<()> {
        if self.dest_path().is_none() {
            return Err(TransferError::MissingDestination.into());
        }
        Ok(())
    }

    /// Perform the transfer. `Ok(false)` is a refusal or a failed validation
    /// that left the destination in a consistent state.
    fn transfer(&self) -> Result<bool>;

    /// Check that the destination holds an intact copy of the source.
    fn validate_transfer(&self) -> Result<bool>;
}
