use fail::fail_point;

#[cfg_attr(not(feature = "failpoints"), allow(unused_imports))]
use crate::bail;
use crate::error::BatchResult;
#[cfg_attr(not(feature = "failpoints"), allow(unused_imports))]
use crate::error::ErrorKind;

pub const MEMORY_COMMIT_FP: &str = "memory_store.commit";
pub const MEMORY_CREATE_TRANSACTION_FP: &str = "memory_store.create_transaction";

/// Evaluates the named failpoint, returning an error when it is configured to trigger.
///
/// The optional parameter selects the error kind: `commit` (default) or `creation`.
#[cfg_attr(not(feature = "failpoints"), allow(unused_variables))]
pub fn batcher_fail_point(name: &str) -> BatchResult<()> {
    fail_point!(name, |parameter| {
        let error_kind = match parameter.as_deref() {
            #[cfg(feature = "failpoints")]
            Some("creation") => ErrorKind::FailpointCreation,
            #[cfg(feature = "failpoints")]
            _ => ErrorKind::FailpointCommit,
            #[cfg(not(feature = "failpoints"))]
            _ => ErrorKind::Unknown,
        };

        bail!(
            error_kind,
            "An error occurred in a fail point",
            format!("The failpoint '{name}' returned an error")
        );
    });

    Ok(())
}
